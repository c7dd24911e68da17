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

//! Pre-connection state for a peer that has started a handshake.
//!
//! A candidate exists between the first datagram from an unknown DCID and
//! the moment a complete, well-behaved ClientHello has been reassembled.
//! Nothing is ever sent back at this stage: a reply would both spend
//! anti-amplification budget and hand an attacker a reflection primitive,
//! so every failure here is a silent drop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crate::amplification::DatagramMeta;
use crate::crypto;
use crate::crypto_buf::CryptoBuf;
use crate::frame;
use crate::packet;
use crate::packet::ConnectionId;
use crate::packet::InitialPacket;
use crate::ranges;
use crate::tls;
use crate::tls::HandshakeEngine;

use crate::Result;

/// Lifecycle of a connection candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Waiting for more CRYPTO bytes.
    Buffering,

    /// A connection was created; the candidate is spent.
    Promoted,

    /// The candidate was discarded and will never produce a connection.
    Dropped,
}

/// Everything a freshly created connection takes over from the candidate.
#[derive(Debug)]
pub struct Promotion {
    /// The negotiated wire version.
    pub version: u32,

    /// The client's address, bound on the first datagram.
    pub remote_addr: SocketAddr,

    /// The client's source connection ID.
    pub scid: ConnectionId<'static>,

    /// The original destination connection ID the Initial keys were
    /// derived from.
    pub odcid: ConnectionId<'static>,

    /// The complete ClientHello, reassembled from CRYPTO frames.
    pub client_hello: Vec<u8>,

    /// The accepted Initial packets, in arrival order, for replay into the
    /// connection.
    pub initial_packets: Vec<InitialPacket>,

    /// Coalesced bytes that followed the Initial in the final datagram.
    pub trailing_data: Vec<u8>,

    /// Total datagram bytes received from the client's address, seeding
    /// the connection's anti-amplification budget.
    pub received_bytes: usize,
}

/// Creates the long-lived connection object once a candidate qualifies.
///
/// The candidate holds the factory, never the other way around, so the
/// factory is free to own sockets, TLS context and whatever else a real
/// connection needs.
pub trait ConnectionFactory {
    /// The handle the registry keeps in place of the candidate.
    type Connection;

    fn create_connection(&self, promotion: Promotion) -> Self::Connection;
}

/// Transient per-peer state between the first Initial and promotion.
pub struct ConnectionCandidate<F: ConnectionFactory> {
    version: u32,

    remote_addr: SocketAddr,

    scid: ConnectionId<'static>,

    odcid: ConnectionId<'static>,

    /// Initial-level receive keys, derived once from the ODCID.
    keys: crypto::Open,

    /// Reassembled CRYPTO stream.
    chello_buf: CryptoBuf,

    engine: Box<dyn HandshakeEngine + Send>,

    /// Accepted packets retained for replay, in arrival order.
    packets: Vec<InitialPacket>,

    /// Packet numbers already accepted, to ignore duplicates.
    pkt_nums: ranges::RangeSet,

    /// Cumulative length of datagrams accepted from the bound address.
    received_bytes: usize,

    /// Whether any accepted packet carried a CRYPTO frame.
    has_crypto: bool,

    /// Set when an Initial carried an ACK, CONNECTION_CLOSE or path frame.
    /// Such packets still count towards anti-amplification, but the
    /// candidate can never promote afterwards.
    tainted: bool,

    state: State,

    last_datagram: Instant,

    factory: Arc<F>,

    trace_id: String,
}

impl<F: ConnectionFactory> ConnectionCandidate<F> {
    /// Creates a candidate for the given version, peer address and the
    /// connection IDs observed on the first datagram.
    pub fn new(
        version: u32, remote_addr: SocketAddr, scid: ConnectionId<'static>,
        odcid: ConnectionId<'static>, factory: Arc<F>, now: Instant,
    ) -> Result<ConnectionCandidate<F>> {
        let (keys, _) = crypto::derive_initial_key_material(
            &odcid,
            version,
            true,
        )?;

        let trace_id = format!("{odcid:?}");

        Ok(ConnectionCandidate {
            version,
            remote_addr,
            scid,
            odcid,
            keys,
            chello_buf: CryptoBuf::new(crate::MAX_CRYPTO_BUFFER),
            engine: Box::new(tls::ClientHelloProbe::new(version)),
            packets: Vec::new(),
            pkt_nums: ranges::RangeSet::default(),
            received_bytes: 0,
            has_crypto: false,
            tainted: false,
            state: State::Buffering,
            last_datagram: now,
            factory,
            trace_id,
        })
    }

    /// Replaces the built-in ClientHello probe with a real handshake
    /// engine.
    pub fn set_handshake_engine(
        &mut self, engine: Box<dyn HandshakeEngine + Send>,
    ) {
        self.engine = engine;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn odcid(&self) -> &ConnectionId<'static> {
        &self.odcid
    }

    /// Datagram bytes accepted from the bound address so far.
    pub fn received_bytes(&self) -> usize {
        self.received_bytes
    }

    /// Whether the candidate has been abandoned by its client.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_datagram) >= timeout
    }

    /// Consumes one datagram addressed at this candidate's DCID.
    ///
    /// Returns the freshly created connection when this datagram completed
    /// the ClientHello and every promotion requirement holds. In all other
    /// cases (buffering, duplicate, spoofed, malformed) nothing is
    /// returned and nothing is sent; check [`state()`] to distinguish a
    /// still-live candidate from a discarded one.
    ///
    /// [`state()`]: struct.ConnectionCandidate.html#method.state
    pub fn process_datagram(
        &mut self, buf: &mut [u8], meta: &DatagramMeta,
    ) -> Option<F::Connection> {
        if self.state != State::Buffering {
            return None;
        }

        // Datagrams from any other address are ignored without touching
        // candidate state; a spoofing third party must not be able to
        // perturb an in-progress handshake.
        if meta.from != self.remote_addr {
            trace!(
                "{} dropping datagram from {} (bound to {})",
                self.trace_id,
                meta.from,
                self.remote_addr
            );

            return None;
        }

        // Clients must pad the first flight to at least 1200 bytes.
        // `received_bytes` is bumped for every datagram from the bound
        // address, so zero means this really is the first one, whether or
        // not anything in an earlier flight survived packet validation.
        if self.received_bytes == 0 &&
            buf.len() < crate::MIN_CLIENT_INITIAL_LEN
        {
            trace!(
                "{} dropping short first datagram ({} bytes)",
                self.trace_id,
                buf.len()
            );

            self.state = State::Dropped;
            return None;
        }

        self.last_datagram = meta.at;
        self.received_bytes += buf.len();

        let mut off = 0;

        // Walk the coalesced packets. The loop stops at the first packet
        // the candidate cannot read; whatever follows is either for the
        // future connection (trailing bytes) or garbage.
        while off < buf.len() {
            if !packet::has_long_header(buf[off]) {
                break;
            }

            let hdr = {
                let mut b = octets::Octets::with_slice(&buf[off..]);

                match packet::Header::from_bytes(&mut b) {
                    Ok(v) => v,

                    Err(_) => break,
                }
            };

            if hdr.ty != packet::Type::Initial || hdr.dcid != self.odcid {
                break;
            }

            // A follow-up Initial that contradicts what the first packet
            // bound is discarded, along with the rest of the datagram.
            if hdr.version != self.version || hdr.scid != self.scid {
                trace!(
                    "{} discarding Initial with changed version/scid",
                    self.trace_id
                );

                break;
            }

            let largest = self.pkt_nums.last().unwrap_or(0);

            let (pkt, consumed) = match packet::parse_initial(
                &mut buf[off..],
                Some(&self.odcid),
                largest,
                &self.keys,
            ) {
                Ok(v) => v,

                // Undecryptable or malformed: nothing past this point can
                // be attributed to the peer.
                Err(_) => break,
            };

            off += consumed;

            if self.accept_packet(pkt).is_err() {
                self.state = State::Dropped;
                return None;
            }
        }

        self.try_promote(&buf[off..])
    }

    fn accept_packet(&mut self, pkt: InitialPacket) -> Result<()> {
        // A retransmitted packet number adds nothing new.
        if self.pkt_nums.contains_item(pkt.pkt_num) {
            return Ok(());
        }

        let mut has_crypto = false;
        let mut disqualifying = false;

        for f in &pkt.frames {
            match f {
                frame::Frame::Crypto { .. } => has_crypto = true,

                frame::Frame::Padding { .. } | frame::Frame::Ping => (),

                // Legal (or tolerated) in an Initial, but a client that is
                // genuinely opening a connection has no reason to send
                // them in its first flight.
                frame::Frame::ACK { .. } |
                frame::Frame::ConnectionClose { .. } |
                frame::Frame::ApplicationClose { .. } |
                frame::Frame::PathChallenge { .. } |
                frame::Frame::PathResponse { .. } => disqualifying = true,
            }
        }

        if disqualifying {
            trace!(
                "{} Initial {} carries non-handshake frames, \
                 candidate will not promote",
                self.trace_id,
                pkt.pkt_num
            );

            self.tainted = true;

            // The packet still counted towards anti-amplification, but is
            // not retained.
            return Ok(());
        }

        for f in &pkt.frames {
            if let frame::Frame::Crypto { offset, data } = f {
                self.chello_buf.write(*offset, data)?;
            }
        }

        if has_crypto {
            self.has_crypto = true;
        }

        self.pkt_nums.push_item(pkt.pkt_num);
        self.packets.push(pkt);

        Ok(())
    }

    fn try_promote(&mut self, trailing: &[u8]) -> Option<F::Connection> {
        if self.tainted || !self.has_crypto {
            return None;
        }

        if self.received_bytes < crate::MIN_CLIENT_INITIAL_LEN {
            return None;
        }

        let progress =
            match self.engine.feed_client_hello(self.chello_buf.contiguous())
            {
                Ok(v) => v,

                // Whatever is in the CRYPTO stream, it is not a
                // ClientHello.
                Err(_) => {
                    self.state = State::Dropped;
                    return None;
                },
            };

        if !progress.complete {
            return None;
        }

        let chello_len =
            match tls::client_hello_len(self.chello_buf.contiguous()) {
                Ok(Some(v)) => v,

                _ => {
                    self.state = State::Dropped;
                    return None;
                },
            };

        let client_hello = self.chello_buf.contiguous()[..chello_len].to_vec();

        trace!(
            "{} promoting candidate after {} Initial packets, {} bytes",
            self.trace_id,
            self.packets.len(),
            self.received_bytes
        );

        let promotion = Promotion {
            version: self.version,
            remote_addr: self.remote_addr,
            scid: self.scid.clone(),
            odcid: self.odcid.clone(),
            client_hello,
            initial_packets: std::mem::take(&mut self.packets),
            trailing_data: trailing.to_vec(),
            received_bytes: self.received_bytes,
        };

        self.state = State::Promoted;

        Some(self.factory.create_connection(promotion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils;
    use crate::transport_params::TransportParams;

    /// Returns the promotion record itself as the "connection", which is
    /// all these tests need to observe.
    struct PassthroughFactory;

    impl ConnectionFactory for PassthroughFactory {
        type Connection = Promotion;

        fn create_connection(&self, promotion: Promotion) -> Promotion {
            promotion
        }
    }

    const CLIENT: &str = "10.0.0.1:55333";

    fn scid() -> ConnectionId<'static> {
        ConnectionId::from_vec(vec![0x05; 8])
    }

    fn odcid() -> ConnectionId<'static> {
        ConnectionId::from_vec(vec![0x0a; 8])
    }

    fn meta(from: &str) -> DatagramMeta {
        DatagramMeta {
            from: from.parse().unwrap(),
            at: Instant::now(),
        }
    }

    fn candidate() -> ConnectionCandidate<PassthroughFactory> {
        ConnectionCandidate::new(
            crate::PROTOCOL_VERSION,
            CLIENT.parse().unwrap(),
            scid(),
            odcid(),
            Arc::new(PassthroughFactory),
            Instant::now(),
        )
        .unwrap()
    }

    /// A small but complete ClientHello.
    fn chello() -> Vec<u8> {
        test_utils::client_hello_bytes(
            crate::PROTOCOL_VERSION,
            &TransportParams {
                initial_source_connection_id: Some(scid()),
                ..TransportParams::default()
            },
            0,
        )
    }

    /// A ClientHello large enough that it cannot fit in one packet's
    /// CRYPTO frame in these tests, split at `split`.
    fn split_chello(split: usize) -> (Vec<u8>, Vec<u8>) {
        let hello = test_utils::client_hello_bytes(
            crate::PROTOCOL_VERSION,
            &TransportParams {
                initial_source_connection_id: Some(scid()),
                ..TransportParams::default()
            },
            1125,
        );

        assert!(hello.len() > split);

        (hello[..split].to_vec(), hello[split..].to_vec())
    }

    fn initial_datagram(frames: &[frame::Frame]) -> Vec<u8> {
        test_utils::encode_initial(
            crate::PROTOCOL_VERSION,
            &scid(),
            &odcid(),
            0,
            frames,
        )
        .unwrap()
    }

    /// Builds a datagram holding one Initial, padded so the datagram is
    /// exactly 1200 bytes.
    fn padded_initial_datagram(
        pkt_num: u64, extra: &[frame::Frame],
    ) -> Vec<u8> {
        test_utils::padded_initial_datagram(
            crate::PROTOCOL_VERSION,
            &scid(),
            &odcid(),
            pkt_num,
            extra,
        )
        .unwrap()
    }

    #[test]
    fn single_datagram_promotes() {
        let mut cand = candidate();

        let crypto = frame::Frame::Crypto {
            offset: 0,
            data: chello(),
        };

        let mut datagram = padded_initial_datagram(0, &[crypto]);
        assert_eq!(datagram.len(), 1200);

        let promotion =
            cand.process_datagram(&mut datagram, &meta(CLIENT)).unwrap();

        assert_eq!(cand.state(), State::Promoted);
        assert_eq!(promotion.version, crate::PROTOCOL_VERSION);
        assert_eq!(promotion.scid, scid());
        assert_eq!(promotion.odcid, odcid());
        assert_eq!(promotion.client_hello, chello());
        assert_eq!(promotion.initial_packets.len(), 1);
        assert_eq!(promotion.trailing_data.len(), 0);
        assert_eq!(promotion.received_bytes, 1200);

        // The sender's anti-amplification limit derived from this
        // promotion.
        let mut budget = crate::amplification::SendBudget::new(
            crate::MAX_AMPLIFICATION_FACTOR,
        );
        budget.on_bytes_received(promotion.received_bytes);
        assert_eq!(budget.limit(), 3 * 1200);
    }

    #[test]
    fn split_chello_promotes_on_second_datagram() {
        let mut cand = candidate();

        let (part1, part2) = split_chello(1100);

        let mut datagram1 = padded_initial_datagram(0, &[
            frame::Frame::Crypto {
                offset: 0,
                data: part1.clone(),
            },
        ]);
        assert_eq!(datagram1.len(), 1200);

        assert!(cand
            .process_datagram(&mut datagram1, &meta(CLIENT))
            .is_none());
        assert_eq!(cand.state(), State::Buffering);

        let mut datagram2 = padded_initial_datagram(1, &[
            frame::Frame::Crypto {
                offset: 1100,
                data: part2.clone(),
            },
        ]);

        let promotion = cand
            .process_datagram(&mut datagram2, &meta(CLIENT))
            .unwrap();

        assert_eq!(cand.state(), State::Promoted);
        assert_eq!(promotion.initial_packets.len(), 2);
        assert_eq!(promotion.client_hello.len(), part1.len() + part2.len());
        assert_eq!(promotion.received_bytes, 2400);

        let mut budget = crate::amplification::SendBudget::new(
            crate::MAX_AMPLIFICATION_FACTOR,
        );
        budget.on_bytes_received(promotion.received_bytes);
        assert!(budget.limit() >= 3 * 2400);
    }

    #[test]
    fn short_first_datagram_is_dropped() {
        let mut cand = candidate();

        // A valid but unpadded Initial.
        let mut datagram = initial_datagram(&[frame::Frame::Crypto {
            offset: 0,
            data: chello(),
        }]);
        assert!(datagram.len() < 1200);

        assert!(cand
            .process_datagram(&mut datagram, &meta(CLIENT))
            .is_none());
        assert_eq!(cand.state(), State::Dropped);

        // A terminal candidate ignores everything that follows.
        let mut datagram = padded_initial_datagram(1, &[
            frame::Frame::Crypto {
                offset: 0,
                data: chello(),
            },
        ]);
        assert!(cand
            .process_datagram(&mut datagram, &meta(CLIENT))
            .is_none());
        assert_eq!(cand.state(), State::Dropped);
    }

    #[test]
    fn short_followup_datagram_is_not_fatal() {
        let mut cand = candidate();

        // A padded first datagram whose Initial does not unseal; nothing
        // gets buffered, but the candidate has seen its first flight.
        let mut datagram1 = padded_initial_datagram(0, &[
            frame::Frame::Crypto {
                offset: 0,
                data: chello(),
            },
        ]);
        let last = datagram1.len() - 1;
        datagram1[last] ^= 0xff;

        assert!(cand
            .process_datagram(&mut datagram1, &meta(CLIENT))
            .is_none());
        assert_eq!(cand.state(), State::Buffering);
        assert_eq!(cand.received_bytes(), 1200);

        // A later datagram is not subject to the first-flight padding
        // rule, so a short retransmit can still complete the handshake.
        let mut datagram2 = test_utils::encode_initial(
            crate::PROTOCOL_VERSION,
            &scid(),
            &odcid(),
            1,
            &[frame::Frame::Crypto {
                offset: 0,
                data: chello(),
            }],
        )
        .unwrap();
        assert!(datagram2.len() < 1200);

        let promotion = cand
            .process_datagram(&mut datagram2, &meta(CLIENT))
            .unwrap();

        assert_eq!(cand.state(), State::Promoted);
        assert_eq!(promotion.received_bytes, 1200 + datagram2.len());
    }

    #[test]
    fn mismatched_scid_is_ignored() {
        let mut cand = candidate();

        let (part1, part2) = split_chello(1100);

        let mut datagram1 = padded_initial_datagram(0, &[
            frame::Frame::Crypto {
                offset: 0,
                data: part1,
            },
        ]);
        assert!(cand
            .process_datagram(&mut datagram1, &meta(CLIENT))
            .is_none());

        // Same ODCID, different SCID.
        let mut datagram2 = test_utils::padded_initial_datagram(
            crate::PROTOCOL_VERSION,
            &ConnectionId::from_vec(vec![1, 2, 3, 4, 5, 6, 7, 8]),
            &odcid(),
            1,
            &[frame::Frame::Crypto {
                offset: 1100,
                data: part2,
            }],
        )
        .unwrap();

        assert!(cand
            .process_datagram(&mut datagram2, &meta(CLIENT))
            .is_none());
        assert_eq!(cand.state(), State::Buffering);
    }

    #[test]
    fn mismatched_version_is_ignored() {
        let mut cand = candidate();

        let (part1, part2) = split_chello(1100);

        let mut datagram1 = padded_initial_datagram(0, &[
            frame::Frame::Crypto {
                offset: 0,
                data: part1,
            },
        ]);
        assert!(cand
            .process_datagram(&mut datagram1, &meta(CLIENT))
            .is_none());

        let mut datagram2 = test_utils::padded_initial_datagram(
            crate::PROTOCOL_VERSION_DRAFT29,
            &scid(),
            &odcid(),
            1,
            &[frame::Frame::Crypto {
                offset: 1100,
                data: part2,
            }],
        )
        .unwrap();

        assert!(cand
            .process_datagram(&mut datagram2, &meta(CLIENT))
            .is_none());
        assert_eq!(cand.state(), State::Buffering);
    }

    #[test]
    fn different_source_address_is_ignored() {
        let mut cand = candidate();

        let (part1, part2) = split_chello(1100);

        let mut datagram1 = padded_initial_datagram(0, &[
            frame::Frame::Crypto {
                offset: 0,
                data: part1,
            },
        ]);
        assert!(cand
            .process_datagram(&mut datagram1, &meta(CLIENT))
            .is_none());

        let mut datagram2 = padded_initial_datagram(1, &[
            frame::Frame::Crypto {
                offset: 1100,
                data: part2,
            },
        ]);
        assert!(cand
            .process_datagram(&mut datagram2, &meta("10.0.0.2:41975"))
            .is_none());

        assert_eq!(cand.state(), State::Buffering);

        // The spoofed datagram must not have widened the budget either.
        assert_eq!(cand.received_bytes(), 1200);
    }

    #[test]
    fn coalesced_trailing_bytes_reach_the_connection() {
        let mut cand = candidate();

        let mut datagram = padded_initial_datagram(0, &[
            frame::Frame::Crypto {
                offset: 0,
                data: chello(),
            },
        ]);
        assert_eq!(datagram.len(), 1200);

        // Simulate a second, coalesced 300-byte packet in the same
        // datagram. 0x80 makes it a long header the candidate cannot
        // read.
        let mut trailing = vec![0; 300];
        trailing[0] = 0x80 | 0x40 | 0x20;
        for (i, b) in trailing.iter_mut().enumerate().skip(1) {
            *b = i as u8;
        }
        datagram.extend_from_slice(&trailing);

        let promotion =
            cand.process_datagram(&mut datagram, &meta(CLIENT)).unwrap();

        assert_eq!(promotion.trailing_data, trailing);
        assert_eq!(promotion.received_bytes, 1500);
    }

    #[test]
    fn no_crypto_frame_no_promotion() {
        let mut cand = candidate();

        let mut datagram = padded_initial_datagram(0, &[frame::Frame::Ping]);
        assert_eq!(datagram.len(), 1200);

        assert!(cand
            .process_datagram(&mut datagram, &meta(CLIENT))
            .is_none());
        assert_eq!(cand.state(), State::Buffering);
    }

    #[test]
    fn ack_frame_prevents_promotion() {
        let mut cand = candidate();

        let mut acked = ranges::RangeSet::default();
        acked.push_item(0);

        let mut datagram = padded_initial_datagram(0, &[
            frame::Frame::Crypto {
                offset: 0,
                data: chello(),
            },
            frame::Frame::ACK {
                ack_delay: 0,
                ranges: acked,
                ecn_counts: None,
            },
        ]);

        assert!(cand
            .process_datagram(&mut datagram, &meta(CLIENT))
            .is_none());
        assert_eq!(cand.state(), State::Buffering);

        // Even a clean retransmit afterwards cannot resurrect the
        // candidate.
        let mut datagram = padded_initial_datagram(1, &[
            frame::Frame::Crypto {
                offset: 0,
                data: chello(),
            },
        ]);
        assert!(cand
            .process_datagram(&mut datagram, &meta(CLIENT))
            .is_none());
        assert_eq!(cand.state(), State::Buffering);
    }

    #[test]
    fn connection_close_prevents_promotion() {
        let mut cand = candidate();

        let mut datagram = padded_initial_datagram(0, &[
            frame::Frame::Crypto {
                offset: 0,
                data: chello(),
            },
            frame::Frame::ConnectionClose {
                error_code: 0,
                frame_type: 0,
                reason: Vec::new(),
            },
        ]);

        assert!(cand
            .process_datagram(&mut datagram, &meta(CLIENT))
            .is_none());
        assert_eq!(cand.state(), State::Buffering);
    }

    #[test]
    fn path_challenge_prevents_promotion() {
        let mut cand = candidate();

        let mut datagram = padded_initial_datagram(0, &[
            frame::Frame::Crypto {
                offset: 0,
                data: chello(),
            },
            frame::Frame::PathChallenge { data: [0; 8] },
        ]);

        assert!(cand
            .process_datagram(&mut datagram, &meta(CLIENT))
            .is_none());
        assert_eq!(cand.state(), State::Buffering);
    }

    #[test]
    fn incomplete_chello_keeps_buffering() {
        let mut cand = candidate();

        // Handshake header declaring 2000 body bytes, with only a prefix
        // delivered.
        let mut partial = vec![0; 1165];
        partial[0] = 0x01;
        partial[1] = 0x00;
        partial[2] = 0x07;
        partial[3] = 0xd0;

        let mut datagram = padded_initial_datagram(0, &[
            frame::Frame::Crypto {
                offset: 0,
                data: partial,
            },
        ]);

        assert!(cand
            .process_datagram(&mut datagram, &meta(CLIENT))
            .is_none());
        assert_eq!(cand.state(), State::Buffering);
    }

    #[test]
    fn conflicting_crypto_overlap_drops_candidate() {
        let mut cand = candidate();

        let (part1, _) = split_chello(1100);

        let mut datagram1 = padded_initial_datagram(0, &[
            frame::Frame::Crypto {
                offset: 0,
                data: part1.clone(),
            },
        ]);
        assert!(cand
            .process_datagram(&mut datagram1, &meta(CLIENT))
            .is_none());

        // Retransmit the same span with different content.
        let mut conflicting = part1;
        conflicting[500] ^= 0xff;

        let mut datagram2 = padded_initial_datagram(1, &[
            frame::Frame::Crypto {
                offset: 0,
                data: conflicting,
            },
        ]);
        assert!(cand
            .process_datagram(&mut datagram2, &meta(CLIENT))
            .is_none());

        assert_eq!(cand.state(), State::Dropped);
    }

    #[test]
    fn duplicate_packet_number_not_rebuffered() {
        let mut cand = candidate();

        let (part1, _) = split_chello(1100);

        let crypto = frame::Frame::Crypto {
            offset: 0,
            data: part1,
        };

        let mut datagram = padded_initial_datagram(0, &[crypto.clone()]);
        let mut dup = datagram.clone();

        assert!(cand
            .process_datagram(&mut datagram, &meta(CLIENT))
            .is_none());
        assert!(cand.process_datagram(&mut dup, &meta(CLIENT)).is_none());

        assert_eq!(cand.state(), State::Buffering);
        assert_eq!(cand.packets.len(), 1);

        // Both datagrams still count towards the budget.
        assert_eq!(cand.received_bytes(), 2400);
    }

    #[test]
    fn not_a_client_hello_drops_candidate() {
        let mut cand = candidate();

        // A complete TLS message that is not a ClientHello.
        let bogus = vec![0x02, 0x00, 0x00, 0x01, 0xff];

        let mut datagram = padded_initial_datagram(0, &[
            frame::Frame::Crypto {
                offset: 0,
                data: bogus,
            },
        ]);

        assert!(cand
            .process_datagram(&mut datagram, &meta(CLIENT))
            .is_none());
        assert_eq!(cand.state(), State::Dropped);
    }

    #[test]
    fn idle_detection() {
        let cand = candidate();

        let timeout = Duration::from_millis(999);
        let now = Instant::now();

        assert!(!cand.is_idle(now, timeout));
        assert!(cand.is_idle(now + timeout, timeout));
    }
}
