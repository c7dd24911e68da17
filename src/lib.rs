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

//! 🚪 Server-side QUIC connection admission.
//!
//! vestibule implements the piece of a QUIC (RFC 9000/9001) server that
//! sits between the UDP socket and the connections: it takes raw inbound
//! datagrams from unknown peers, unseals their Initial packets,
//! reassembles the ClientHello that may be fragmented across several
//! datagrams, enforces the anti-amplification and pre-handshake framing
//! rules, and decides whether a connection object should be created at
//! all. Everything that fails to qualify is dropped in silence, because
//! answering an unvalidated address is how a server becomes somebody
//! else's DDoS cannon.
//!
//! The crate is a pure state machine: no sockets, no threads, no TLS
//! engine. Those are injected at the seams ([`candidate::ConnectionFactory`],
//! [`tls::HandshakeEngine`], [`amplification::DatagramFilter`]).
//!
//! ## Accepting connections
//!
//! Feed every datagram that does not belong to an established connection
//! into a [`registry::Registry`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! use vestibule::amplification::DatagramMeta;
//! use vestibule::candidate::{ConnectionFactory, Promotion};
//! use vestibule::registry::Registry;
//!
//! struct MyFactory;
//!
//! impl ConnectionFactory for MyFactory {
//!     type Connection = Promotion; // your connection type here
//!
//!     fn create_connection(&self, promotion: Promotion) -> Promotion {
//!         promotion
//!     }
//! }
//!
//! let config = vestibule::Config::new(vestibule::PROTOCOL_VERSION)?;
//! let registry = Registry::new(config, Arc::new(MyFactory));
//!
//! let mut buf = [0; 1500];
//! # let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
//! let (read, from) = socket.recv_from(&mut buf).unwrap();
//!
//! let meta = DatagramMeta { from, at: Instant::now() };
//!
//! registry.process_datagram(&mut buf[..read], &meta)?;
//! # Ok::<(), vestibule::Error>(())
//! ```
//!
//! The transport-parameters codec ([`transport_params::TransportParams`])
//! and the ACK codec ([`frame::Frame`]) are exposed on their own, since
//! the connection created on promotion needs both.

#![allow(clippy::upper_case_acronyms)]
#![warn(unused_qualifications)]

#[macro_use]
extern crate log;

use std::time::Duration;

use crate::packet::ConnectionId;
use crate::transport_params::TransportParams;

/// The current QUIC wire version.
pub const PROTOCOL_VERSION: u32 = PROTOCOL_VERSION_V1;

/// QUIC version 1, as finalized in RFC 9000.
pub const PROTOCOL_VERSION_V1: u32 = 0x0000_0001;

/// QUIC version 2 (RFC 9369). Recognized by the transport parameters
/// codec; Initial key derivation only covers v1 and the drafts.
pub const PROTOCOL_VERSION_V2: u32 = 0x6b33_43cf;

/// Draft versions still spoken by older clients.
pub const PROTOCOL_VERSION_DRAFT27: u32 = 0xff00_001b;
pub const PROTOCOL_VERSION_DRAFT28: u32 = 0xff00_001c;
pub const PROTOCOL_VERSION_DRAFT29: u32 = 0xff00_001d;

/// The maximum length of a connection ID.
pub const MAX_CONN_ID_LEN: usize = packet::MAX_CID_LEN as usize;

/// The minimum length of Initial datagrams sent by a client.
pub const MIN_CLIENT_INITIAL_LEN: usize = 1200;

/// The anti-amplification limit factor (RFC 9000 Section 8.1).
pub const MAX_AMPLIFICATION_FACTOR: usize = 3;

/// How many CRYPTO stream bytes a candidate will buffer for one peer.
pub const MAX_CRYPTO_BUFFER: usize = 65536;

/// The default initial RTT estimate.
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(333);

// The highest possible stream count allowed in transport parameters.
pub(crate) const MAX_STREAM_ID: u64 = 1 << 60;

/// Returns whether the given version can be terminated by this crate.
pub fn version_is_supported(version: u32) -> bool {
    matches!(
        version,
        PROTOCOL_VERSION_V1 |
            PROTOCOL_VERSION_DRAFT27 |
            PROTOCOL_VERSION_DRAFT28 |
            PROTOCOL_VERSION_DRAFT29
    )
}

pub(crate) fn version_is_v1_or_v2(version: u32) -> bool {
    matches!(version, PROTOCOL_VERSION_V1 | PROTOCOL_VERSION_V2)
}

/// Server admission configuration.
///
/// Holds the local transport parameters advertised on promotion and the
/// policy knobs of the admission pipeline itself.
pub struct Config {
    version: u32,

    local_transport_params: TransportParams,

    max_amplification_factor: usize,

    pub(crate) candidate_timeout: Duration,

    discard_parameter_size: Option<usize>,

    unknown_params_capacity: Option<usize>,
}

impl Config {
    /// Creates a config for the given wire version.
    pub fn new(version: u32) -> Result<Config> {
        if !version_is_supported(version) {
            return Err(Error::UnknownVersion);
        }

        Ok(Config {
            version,
            local_transport_params: TransportParams::default(),
            max_amplification_factor: MAX_AMPLIFICATION_FACTOR,
            candidate_timeout: 3 * DEFAULT_INITIAL_RTT,
            discard_parameter_size: None,
            unknown_params_capacity: None,
        })
    }

    /// The configured wire version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Sets the `max_idle_timeout` transport parameter, in milliseconds.
    /// Zero (the default) disables idle timeout.
    pub fn set_max_idle_timeout(&mut self, v: u64) {
        self.local_transport_params.max_idle_timeout = v;
    }

    /// Sets the `max_udp_payload_size` transport parameter.
    pub fn set_max_udp_payload_size(&mut self, v: u64) {
        self.local_transport_params.max_udp_payload_size = v;
    }

    /// Sets the `initial_max_data` transport parameter.
    pub fn set_initial_max_data(&mut self, v: u64) {
        self.local_transport_params.initial_max_data = v;
    }

    /// Sets the `initial_max_stream_data_bidi_local` transport parameter.
    pub fn set_initial_max_stream_data_bidi_local(&mut self, v: u64) {
        self.local_transport_params.initial_max_stream_data_bidi_local = v;
    }

    /// Sets the `initial_max_stream_data_bidi_remote` transport parameter.
    pub fn set_initial_max_stream_data_bidi_remote(&mut self, v: u64) {
        self.local_transport_params.initial_max_stream_data_bidi_remote = v;
    }

    /// Sets the `initial_max_stream_data_uni` transport parameter.
    pub fn set_initial_max_stream_data_uni(&mut self, v: u64) {
        self.local_transport_params.initial_max_stream_data_uni = v;
    }

    /// Sets the `initial_max_streams_bidi` transport parameter.
    pub fn set_initial_max_streams_bidi(&mut self, v: u64) {
        self.local_transport_params.initial_max_streams_bidi = v;
    }

    /// Sets the `initial_max_streams_uni` transport parameter.
    pub fn set_initial_max_streams_uni(&mut self, v: u64) {
        self.local_transport_params.initial_max_streams_uni = v;
    }

    /// Sets the `ack_delay_exponent` transport parameter.
    pub fn set_ack_delay_exponent(&mut self, v: u64) {
        self.local_transport_params.ack_delay_exponent = v;
    }

    /// Sets the `max_ack_delay` transport parameter, in milliseconds.
    pub fn set_max_ack_delay(&mut self, v: u64) {
        self.local_transport_params.max_ack_delay = v;
    }

    /// Sets the `active_connection_id_limit` transport parameter.
    ///
    /// Values lower than the protocol minimum of 2 are ignored.
    pub fn set_active_connection_id_limit(&mut self, v: u64) {
        if v >= 2 {
            self.local_transport_params.active_conn_id_limit = v;
        }
    }

    /// Sets the `disable_active_migration` transport parameter.
    pub fn set_disable_active_migration(&mut self, v: bool) {
        self.local_transport_params.disable_active_migration = v;
    }

    /// Sets the `stateless_reset_token` transport parameter.
    pub fn set_stateless_reset_token(&mut self, v: u128) {
        self.local_transport_params.stateless_reset_token = Some(v);
    }

    /// Sets the `max_datagram_frame_size` transport parameter (RFC 9221),
    /// enabling DATAGRAM frame support.
    pub fn set_max_datagram_frame_size(&mut self, v: u64) {
        self.local_transport_params.max_datagram_frame_size = Some(v);
    }

    /// Sets the anti-amplification limit factor.
    pub fn set_max_amplification_factor(&mut self, v: usize) {
        self.max_amplification_factor = v;
    }

    /// The configured anti-amplification limit factor.
    pub fn max_amplification_factor(&self) -> usize {
        self.max_amplification_factor
    }

    /// Sets how long an unpromoted candidate may sit idle before it is
    /// evicted. Defaults to three times the initial RTT estimate.
    pub fn set_candidate_timeout(&mut self, v: Duration) {
        self.candidate_timeout = v;
    }

    /// Appends a "discard" transport parameter of the given size to the
    /// encoded extension, for quantum-readiness testing.
    pub fn set_discard_parameter_size(&mut self, v: usize) {
        self.discard_parameter_size = Some(v);
    }

    /// Keeps up to `space` bytes of unknown transport parameters received
    /// from peers, instead of skipping them.
    pub fn track_unknown_transport_params(&mut self, space: usize) {
        self.unknown_params_capacity = Some(space);
    }

    /// Space reserved for unknown peer transport parameters, if tracking
    /// is enabled.
    pub fn unknown_params_capacity(&self) -> Option<usize> {
        self.unknown_params_capacity
    }

    /// The transport parameters advertised to peers.
    pub fn local_transport_params(&self) -> &TransportParams {
        &self.local_transport_params
    }

    /// Encodes the server's `quic_transport_parameters` extension for a
    /// promoted connection.
    ///
    /// `odcid` and `scid` are the connection-specific values the server
    /// must echo; `retry_scid` is only present when the client was
    /// redirected with a Retry packet.
    pub fn local_transport_params_ext(
        &self, odcid: &ConnectionId, scid: &ConnectionId,
        retry_scid: Option<&ConnectionId>,
    ) -> Result<Vec<u8>> {
        let mut tp = self.local_transport_params.clone();

        tp.original_destination_connection_id =
            Some(ConnectionId::from_vec(odcid.to_vec()));
        tp.initial_source_connection_id =
            Some(ConnectionId::from_vec(scid.to_vec()));
        tp.retry_source_connection_id =
            retry_scid.map(|v| ConnectionId::from_vec(v.to_vec()));

        let mut out =
            vec![0; 256 + self.discard_parameter_size.unwrap_or(0)];

        let ext = TransportParams::encode_extension(
            &tp,
            self.version,
            true,
            self.discard_parameter_size,
            &mut out,
        )?;

        Ok(ext.to_vec())
    }
}


pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::error::WireErrorCode;

pub mod amplification;
pub mod candidate;
pub mod crypto;
mod crypto_buf;
mod error;
pub mod frame;
pub mod packet;
pub mod ranges;
pub mod registry;
#[cfg(test)]
mod test_utils;
pub mod tls;
pub mod transport_params;
