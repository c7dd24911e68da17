// Copyright (C) 2024-2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Anti-amplification accounting (RFC 9000 Section 8.1).
//!
//! Until the client's address is validated, a server may send at most
//! three times the number of bytes it has received from that address. The
//! byte counting happens at the datagram ingress, before any packet-level
//! validation: bytes from datagrams that later turn out to be garbage
//! still arrived from the claimed address and still widen the budget.

use std::net::SocketAddr;
use std::time::Instant;

use crate::Result;

/// Receive-time metadata attached to a datagram as it moves through the
/// filter chain.
#[derive(Clone, Copy, Debug)]
pub struct DatagramMeta {
    /// The address the datagram claims to come from.
    pub from: SocketAddr,

    /// When the datagram was received.
    pub at: Instant,
}

/// A stage in the datagram ingress chain.
pub trait DatagramFilter {
    fn process_datagram(
        &mut self, b: &mut octets::Octets, meta: &DatagramMeta,
    ) -> Result<()>;
}

/// Counts every inbound byte and passes the datagram along untouched.
///
/// The counter hook typically feeds a [`SendBudget`]; keeping the hook
/// generic lets tests and qlog-style observers tap the same point.
///
/// [`SendBudget`]: struct.SendBudget.html
pub struct TrackingFilter<C, N> {
    counter: C,
    next: N,
}

impl<C, N> TrackingFilter<C, N>
where
    C: FnMut(usize),
    N: DatagramFilter,
{
    pub fn new(counter: C, next: N) -> Self {
        TrackingFilter { counter, next }
    }
}

impl<C, N> DatagramFilter for TrackingFilter<C, N>
where
    C: FnMut(usize),
    N: DatagramFilter,
{
    fn process_datagram(
        &mut self, b: &mut octets::Octets, meta: &DatagramMeta,
    ) -> Result<()> {
        (self.counter)(b.cap());

        self.next.process_datagram(b, meta)
    }
}

/// The sender-side ledger that the tracking filter feeds.
///
/// While the peer address is unvalidated, `3 x received` bytes may be
/// sent; when the budget is exhausted the sender stalls until more bytes
/// arrive or validation completes.
#[derive(Debug)]
pub struct SendBudget {
    /// The anti-amplification limit factor.
    max_amplification_factor: usize,

    /// Outgoing bytes still allowed before validation.
    max_send_bytes: usize,

    /// Whether the peer's address has been validated.
    verified_peer_address: bool,
}

impl SendBudget {
    pub fn new(max_amplification_factor: usize) -> SendBudget {
        SendBudget {
            max_amplification_factor,
            max_send_bytes: 0,
            verified_peer_address: false,
        }
    }

    /// Widens the budget for bytes received from the peer's claimed
    /// address.
    pub fn on_bytes_received(&mut self, len: usize) {
        if !self.verified_peer_address {
            self.max_send_bytes += len * self.max_amplification_factor;
        }
    }

    /// Consumes budget for bytes sent to the unvalidated address.
    pub fn on_bytes_sent(&mut self, len: usize) {
        if !self.verified_peer_address {
            self.max_send_bytes = self.max_send_bytes.saturating_sub(len);
        }
    }

    /// Marks the peer address as validated, lifting the cap.
    ///
    /// Validation happens when the client completes the handshake, or
    /// earlier when the server receives a Handshake-level packet (which
    /// proves the client holds keys only derivable at that address).
    pub fn validate_address(&mut self) {
        self.verified_peer_address = true;
    }

    /// Bytes that may still be sent right now.
    pub fn available(&self) -> usize {
        if self.verified_peer_address {
            return usize::MAX;
        }

        self.max_send_bytes
    }

    /// The current raw limit, for observability and tests.
    pub fn limit(&self) -> usize {
        self.max_send_bytes
    }

    /// Whether the peer address has been validated.
    pub fn is_validated(&self) -> bool {
        self.verified_peer_address
    }
}
