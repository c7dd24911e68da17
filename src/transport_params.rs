// Copyright (C) 2018-2025, Cloudflare, Inc.
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

//! Transport parameters handling as per RFC 9000 Section 7.4
//! Part of the Cryptographic and Transport Handshake

use std::collections::HashSet;
use std::mem::size_of;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddrV4;
use std::net::SocketAddrV6;

use crate::packet::ConnectionId;

use crate::Error;
use crate::Result;

use crate::MAX_STREAM_ID;

/// TLS extension codepoint for QUIC v1 and v2.
pub const EXTENSION_TYPE_V1: u16 = 0x0039;

/// TLS extension codepoint used by the pre-RFC drafts.
pub const EXTENSION_TYPE_DRAFT: u16 = 0xffa5;

/// Parameter id of the quantum-readiness "discard" probe.
///
/// See <https://github.com/quicwg/base-drafts/wiki/Quantum-Readiness-test>.
const DISCARD_PARAM_ID: u64 = 0x173e;

/// Returns the `quic_transport_parameters` extension codepoint to use for
/// the given wire version.
pub fn extension_type(version: u32) -> u16 {
    if crate::version_is_v1_or_v2(version) {
        EXTENSION_TYPE_V1
    } else {
        EXTENSION_TYPE_DRAFT
    }
}

/// QUIC Unknown Transport Parameter.
///
/// A QUIC transport parameter that is not specifically recognized
/// by this implementation.
#[derive(Clone, Debug, PartialEq)]
pub struct UnknownTransportParameter<T> {
    /// The ID of the unknown transport parameter.
    pub id: u64,

    /// Original data representing the value of the unknown transport parameter.
    pub value: T,
}

impl<T> UnknownTransportParameter<T> {
    /// Checks whether an unknown Transport Parameter's ID is in the reserved
    /// space.
    ///
    /// See Section 18.1 in [RFC9000](https://datatracker.ietf.org/doc/html/rfc9000#name-reserved-transport-paramete).
    pub fn is_reserved(&self) -> bool {
        let n = (self.id - 27) / 31;
        self.id == 31 * n + 27
    }
}

impl From<UnknownTransportParameter<&[u8]>>
    for UnknownTransportParameter<Vec<u8>>
{
    fn from(value: UnknownTransportParameter<&[u8]>) -> Self {
        Self {
            id: value.id,
            value: value.value.to_vec(),
        }
    }
}

/// Track unknown transport parameters, up to a limit.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct UnknownTransportParameters {
    /// The space remaining for storing unknown transport parameters.
    pub capacity: usize,
    /// The unknown transport parameters.
    pub parameters: Vec<UnknownTransportParameter<Vec<u8>>>,
}

impl UnknownTransportParameters {
    /// Pushes an unknown transport parameter into storage if there is space
    /// remaining.
    pub fn push(&mut self, new: UnknownTransportParameter<&[u8]>) -> Result<()> {
        let new_unknown_tp_size = new.value.len() + size_of::<u64>();
        if new_unknown_tp_size < self.capacity {
            self.capacity -= new_unknown_tp_size;
            self.parameters.push(new.into());
            Ok(())
        } else {
            Err(octets::BufferTooShortError.into())
        }
    }
}

impl<'a> IntoIterator for &'a UnknownTransportParameters {
    type IntoIter = std::slice::Iter<'a, UnknownTransportParameter<Vec<u8>>>;
    type Item = &'a UnknownTransportParameter<Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.parameters.iter()
    }
}

/// A server's preferred address, as carried in the `preferred_address`
/// parameter.
///
/// An all-zero address on the wire means that address family is not
/// offered; at least one family must be present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreferredAddress {
    /// The IPv4 address and port, if offered.
    pub ipv4: Option<SocketAddrV4>,

    /// The IPv6 address and port, if offered.
    pub ipv6: Option<SocketAddrV6>,

    /// The connection ID to use when migrating to the preferred address.
    pub connection_id: ConnectionId<'static>,

    /// The stateless reset token associated with that connection ID.
    pub stateless_reset_token: u128,
}

/// The `version_information` parameter (RFC 9368).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInformation {
    /// The version in use for the connection.
    pub chosen: u32,

    /// The other versions the sender would accept.
    pub others: Vec<u32>,
}

/// QUIC Transport Parameters
#[derive(Clone, Debug, PartialEq)]
pub struct TransportParams {
    /// Value of Destination CID field from first Initial packet sent by client
    pub original_destination_connection_id: Option<ConnectionId<'static>>,
    /// The maximum idle timeout, in milliseconds. Zero means idle timeout
    /// is disabled.
    pub max_idle_timeout: u64,
    /// Token used for verifying stateless resets
    pub stateless_reset_token: Option<u128>,
    /// The maximum UDP payload size.
    pub max_udp_payload_size: u64,
    /// The initial flow control maximum data for the connection.
    pub initial_max_data: u64,
    /// The initial flow control maximum data for local bidirectional streams.
    pub initial_max_stream_data_bidi_local: u64,
    /// The initial flow control maximum data for remote bidirectional streams.
    pub initial_max_stream_data_bidi_remote: u64,
    /// The initial flow control maximum data for unidirectional streams.
    pub initial_max_stream_data_uni: u64,
    /// The initial maximum bidirectional streams.
    pub initial_max_streams_bidi: u64,
    /// The initial maximum unidirectional streams.
    pub initial_max_streams_uni: u64,
    /// The ACK delay exponent.
    pub ack_delay_exponent: u64,
    /// The max ACK delay, in milliseconds.
    pub max_ack_delay: u64,
    /// Whether active migration is disabled.
    pub disable_active_migration: bool,
    /// The server's preferred address. Parsed when a peer sends it, never
    /// emitted.
    pub preferred_address: Option<PreferredAddress>,
    /// The active connection ID limit.
    pub active_conn_id_limit: u64,
    /// The value that the endpoint included in the Source CID field of the
    /// first Initial packet it sent.
    pub initial_source_connection_id: Option<ConnectionId<'static>>,
    /// The value that the server included in the Source CID field of a Retry
    /// Packet.
    pub retry_source_connection_id: Option<ConnectionId<'static>>,
    /// Compatible-version negotiation information, if any.
    pub version_information: Option<VersionInformation>,
    /// DATAGRAM frame extension parameter, if any. Absence means DATAGRAM
    /// frames are not supported.
    pub max_datagram_frame_size: Option<u64>,
    /// Unknown peer transport parameters and values, if any.
    pub unknown_params: Option<UnknownTransportParameters>,
}

impl Default for TransportParams {
    fn default() -> TransportParams {
        TransportParams {
            original_destination_connection_id: None,
            max_idle_timeout: 0,
            stateless_reset_token: None,
            max_udp_payload_size: 65527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay: 25,
            disable_active_migration: false,
            preferred_address: None,
            active_conn_id_limit: 2,
            initial_source_connection_id: None,
            retry_source_connection_id: None,
            version_information: None,
            max_datagram_frame_size: None,
            unknown_params: Default::default(),
        }
    }
}

impl TransportParams {
    /// Decodes the raw parameter triples of a transport parameters
    /// extension.
    ///
    /// `is_server` refers to the role of the *decoding* endpoint: a server
    /// rejects parameters only a server may send.
    pub fn decode(
        buf: &[u8], is_server: bool, unknown_size: Option<usize>,
    ) -> Result<TransportParams> {
        let mut params = octets::Octets::with_slice(buf);
        let mut seen_params = HashSet::new();

        let mut tp = TransportParams::default();

        if let Some(unknown_transport_param_tracking_size) = unknown_size {
            tp.unknown_params = Some(UnknownTransportParameters {
                capacity: unknown_transport_param_tracking_size,
                parameters: vec![],
            });
        }

        while params.cap() > 0 {
            let id = params.get_varint()?;

            if seen_params.contains(&id) {
                return Err(Error::InvalidTransportParam);
            }
            seen_params.insert(id);

            let mut val = params.get_bytes_with_varint_length()?;

            match id {
                0x0000 => {
                    if is_server {
                        return Err(Error::InvalidTransportParam);
                    }

                    let cid = val.get_bytes(val.cap())?;
                    tp.original_destination_connection_id =
                        Some(cid.to_vec().into());
                },

                0x0001 => {
                    tp.max_idle_timeout = val.get_varint()?;
                },

                0x0002 => {
                    if is_server {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.stateless_reset_token = Some(u128::from_be_bytes(
                        val.get_bytes(16)?
                            .to_vec()
                            .try_into()
                            .map_err(|_| Error::BufferTooShort)?,
                    ));
                },

                0x0003 => {
                    tp.max_udp_payload_size = val.get_varint()?;

                    if tp.max_udp_payload_size < 1200 {
                        return Err(Error::InvalidTransportParam);
                    }
                },

                0x0004 => {
                    tp.initial_max_data = val.get_varint()?;
                },

                0x0005 => {
                    tp.initial_max_stream_data_bidi_local = val.get_varint()?;
                },

                0x0006 => {
                    tp.initial_max_stream_data_bidi_remote = val.get_varint()?;
                },

                0x0007 => {
                    tp.initial_max_stream_data_uni = val.get_varint()?;
                },

                0x0008 => {
                    let max = val.get_varint()?;

                    if max > MAX_STREAM_ID {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.initial_max_streams_bidi = max;
                },

                0x0009 => {
                    let max = val.get_varint()?;

                    if max > MAX_STREAM_ID {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.initial_max_streams_uni = max;
                },

                0x000a => {
                    let ack_delay_exponent = val.get_varint()?;

                    if ack_delay_exponent > 20 {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.ack_delay_exponent = ack_delay_exponent;
                },

                0x000b => {
                    let max_ack_delay = val.get_varint()?;

                    if max_ack_delay >= 2_u64.pow(14) {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.max_ack_delay = max_ack_delay;
                },

                0x000c => {
                    tp.disable_active_migration = true;
                },

                0x000d => {
                    if is_server {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.preferred_address =
                        Some(parse_preferred_address(&mut val)?);
                },

                0x000e => {
                    let limit = val.get_varint()?;

                    if limit < 2 {
                        return Err(Error::InvalidTransportParam);
                    }

                    tp.active_conn_id_limit = limit;
                },

                0x000f => {
                    let cid = val.get_bytes(val.cap())?;
                    tp.initial_source_connection_id = Some(cid.to_vec().into());
                },

                0x0010 => {
                    if is_server {
                        return Err(Error::InvalidTransportParam);
                    }

                    let cid = val.get_bytes(val.cap())?;
                    tp.retry_source_connection_id = Some(cid.to_vec().into());
                },

                0x0011 => {
                    if val.len() == 0 || val.len() % 4 != 0 {
                        return Err(Error::TlsFail);
                    }

                    let chosen = val.get_u32()?;

                    let mut others = Vec::with_capacity(val.cap() / 4);
                    while val.cap() > 0 {
                        others.push(val.get_u32()?);
                    }

                    tp.version_information =
                        Some(VersionInformation { chosen, others });
                },

                0x0020 => {
                    tp.max_datagram_frame_size = Some(val.get_varint()?);
                },

                // Track unknown transport parameters specially.
                unknown_tp_id => {
                    trace!(
                        "unknown transport parameter 0x{:x}, size {}{}",
                        unknown_tp_id,
                        val.cap(),
                        known_extension_name(unknown_tp_id)
                            .map(|n| format!(" ({n})"))
                            .unwrap_or_default(),
                    );

                    let value = val.get_bytes(val.cap())?;

                    if let Some(unknown_params) = &mut tp.unknown_params {
                        // It is _not_ an error not to have space enough to track
                        // an unknown parameter.
                        let _ = unknown_params.push(UnknownTransportParameter {
                            id: unknown_tp_id,
                            value: value.buf(),
                        });
                    }
                },
            }

            // Each parameter must consume exactly its declared length.
            if val.cap() != 0 {
                return Err(Error::TlsFail);
            }
        }

        Ok(tp)
    }

    fn encode_param(
        b: &mut octets::OctetsMut, ty: u64, len: usize,
    ) -> Result<()> {
        b.put_varint(ty)?;
        b.put_varint(len as u64)?;

        Ok(())
    }

    /// Encodes the raw parameter triples into `out`, returning the used
    /// prefix.
    ///
    /// `is_server` refers to the role of the *encoding* endpoint: a client
    /// never emits the server-only parameters, whatever the record holds.
    pub fn encode<'a>(
        tp: &TransportParams, is_server: bool, out: &'a mut [u8],
    ) -> Result<&'a mut [u8]> {
        TransportParams::encode_with_discard(tp, is_server, None, out)
    }

    fn encode_with_discard<'a>(
        tp: &TransportParams, is_server: bool, discard_len: Option<usize>,
        out: &'a mut [u8],
    ) -> Result<&'a mut [u8]> {
        let mut b = octets::OctetsMut::with_slice(out);

        if is_server {
            if let Some(ref odcid) = tp.original_destination_connection_id {
                TransportParams::encode_param(&mut b, 0x0000, odcid.len())?;
                b.put_bytes(odcid)?;
            }
        };

        if tp.max_idle_timeout != 0 {
            TransportParams::encode_param(
                &mut b,
                0x0001,
                octets::varint_len(tp.max_idle_timeout),
            )?;
            b.put_varint(tp.max_idle_timeout)?;
        }

        if is_server {
            if let Some(ref token) = tp.stateless_reset_token {
                TransportParams::encode_param(&mut b, 0x0002, 16)?;
                b.put_bytes(&token.to_be_bytes())?;
            }
        }

        if tp.max_udp_payload_size != 0 {
            TransportParams::encode_param(
                &mut b,
                0x0003,
                octets::varint_len(tp.max_udp_payload_size),
            )?;
            b.put_varint(tp.max_udp_payload_size)?;
        }

        if tp.initial_max_data != 0 {
            TransportParams::encode_param(
                &mut b,
                0x0004,
                octets::varint_len(tp.initial_max_data),
            )?;
            b.put_varint(tp.initial_max_data)?;
        }

        if tp.initial_max_stream_data_bidi_local != 0 {
            TransportParams::encode_param(
                &mut b,
                0x0005,
                octets::varint_len(tp.initial_max_stream_data_bidi_local),
            )?;
            b.put_varint(tp.initial_max_stream_data_bidi_local)?;
        }

        if tp.initial_max_stream_data_bidi_remote != 0 {
            TransportParams::encode_param(
                &mut b,
                0x0006,
                octets::varint_len(tp.initial_max_stream_data_bidi_remote),
            )?;
            b.put_varint(tp.initial_max_stream_data_bidi_remote)?;
        }

        if tp.initial_max_stream_data_uni != 0 {
            TransportParams::encode_param(
                &mut b,
                0x0007,
                octets::varint_len(tp.initial_max_stream_data_uni),
            )?;
            b.put_varint(tp.initial_max_stream_data_uni)?;
        }

        if tp.initial_max_streams_bidi != 0 {
            TransportParams::encode_param(
                &mut b,
                0x0008,
                octets::varint_len(tp.initial_max_streams_bidi),
            )?;
            b.put_varint(tp.initial_max_streams_bidi)?;
        }

        if tp.initial_max_streams_uni != 0 {
            TransportParams::encode_param(
                &mut b,
                0x0009,
                octets::varint_len(tp.initial_max_streams_uni),
            )?;
            b.put_varint(tp.initial_max_streams_uni)?;
        }

        if tp.ack_delay_exponent != 0 {
            TransportParams::encode_param(
                &mut b,
                0x000a,
                octets::varint_len(tp.ack_delay_exponent),
            )?;
            b.put_varint(tp.ack_delay_exponent)?;
        }

        if tp.max_ack_delay != 0 {
            TransportParams::encode_param(
                &mut b,
                0x000b,
                octets::varint_len(tp.max_ack_delay),
            )?;
            b.put_varint(tp.max_ack_delay)?;
        }

        if tp.disable_active_migration {
            TransportParams::encode_param(&mut b, 0x000c, 0)?;
        }

        // preferred_address (0x000d) is parsed but never sent.

        if tp.active_conn_id_limit != 2 {
            TransportParams::encode_param(
                &mut b,
                0x000e,
                octets::varint_len(tp.active_conn_id_limit),
            )?;
            b.put_varint(tp.active_conn_id_limit)?;
        }

        if let Some(scid) = &tp.initial_source_connection_id {
            TransportParams::encode_param(&mut b, 0x000f, scid.len())?;
            b.put_bytes(scid)?;
        }

        if is_server {
            if let Some(scid) = &tp.retry_source_connection_id {
                TransportParams::encode_param(&mut b, 0x0010, scid.len())?;
                b.put_bytes(scid)?;
            }
        }

        if let Some(vi) = &tp.version_information {
            TransportParams::encode_param(
                &mut b,
                0x0011,
                4 + vi.others.len() * 4,
            )?;
            b.put_u32(vi.chosen)?;

            for v in &vi.others {
                b.put_u32(*v)?;
            }
        }

        if let Some(max_datagram_frame_size) = tp.max_datagram_frame_size {
            TransportParams::encode_param(
                &mut b,
                0x0020,
                octets::varint_len(max_datagram_frame_size),
            )?;
            b.put_varint(max_datagram_frame_size)?;
        }

        if let Some(len) = discard_len {
            TransportParams::encode_param(&mut b, DISCARD_PARAM_ID, len)?;
            b.put_bytes(&vec![0; len])?;
        }

        let out_len = b.off();

        Ok(&mut out[..out_len])
    }

    /// Encodes the parameters wrapped as a full TLS extension: 2-byte
    /// codepoint, 2-byte length, then the parameter triples.
    ///
    /// `discard_len`, when set, appends the quantum-readiness discard
    /// parameter holding that many zero bytes.
    pub fn encode_extension<'a>(
        tp: &TransportParams, version: u32, is_server: bool,
        discard_len: Option<usize>, out: &'a mut [u8],
    ) -> Result<&'a mut [u8]> {
        if out.len() < 4 {
            return Err(Error::BufferTooShort);
        }

        let (hdr, rest) = out.split_at_mut(4);

        let params_len = TransportParams::encode_with_discard(
            tp,
            is_server,
            discard_len,
            rest,
        )?
        .len();

        if params_len > usize::from(u16::MAX) {
            return Err(Error::BufferTooShort);
        }

        let mut b = octets::OctetsMut::with_slice(hdr);
        b.put_u16(extension_type(version))?;
        b.put_u16(params_len as u16)?;

        Ok(&mut out[..4 + params_len])
    }

    /// Parses a full `quic_transport_parameters` TLS extension, checking
    /// the codepoint against the negotiated version.
    pub fn parse_extension(
        buf: &[u8], version: u32, is_server: bool, unknown_size: Option<usize>,
    ) -> Result<TransportParams> {
        let mut b = octets::Octets::with_slice(buf);

        let ty = b.get_u16()?;
        if ty != extension_type(version) {
            return Err(Error::TlsFail);
        }

        let payload = b.get_bytes_with_u16_length()?;

        if b.cap() != 0 {
            return Err(Error::TlsFail);
        }

        TransportParams::decode(payload.buf(), is_server, unknown_size)
    }
}

fn parse_preferred_address(
    val: &mut octets::Octets,
) -> Result<PreferredAddress> {
    // 4-byte IPv4 + port, 16-byte IPv6 + port, CID length + CID, then a
    // 16-byte reset token; the declared parameter length must match
    // exactly, which the caller verifies by checking nothing is left over.
    let ipv4_addr: [u8; 4] = val
        .get_bytes(4)?
        .buf()
        .try_into()
        .map_err(|_| Error::BufferTooShort)?;
    let ipv4_port = val.get_u16()?;

    let ipv6_addr: [u8; 16] = val
        .get_bytes(16)?
        .buf()
        .try_into()
        .map_err(|_| Error::BufferTooShort)?;
    let ipv6_port = val.get_u16()?;

    let ipv4 = if ipv4_addr != [0; 4] {
        Some(SocketAddrV4::new(Ipv4Addr::from(ipv4_addr), ipv4_port))
    } else {
        None
    };

    let ipv6 = if ipv6_addr != [0; 16] {
        Some(SocketAddrV6::new(Ipv6Addr::from(ipv6_addr), ipv6_port, 0, 0))
    } else {
        None
    };

    if ipv4.is_none() && ipv6.is_none() {
        return Err(Error::TlsFail);
    }

    let cid = val.get_bytes_with_u8_length()?;
    let connection_id = cid.to_vec().into();

    let stateless_reset_token = u128::from_be_bytes(
        val.get_bytes(16)?
            .to_vec()
            .try_into()
            .map_err(|_| Error::BufferTooShort)?,
    );

    Ok(PreferredAddress {
        ipv4,
        ipv6,
        connection_id,
        stateless_reset_token,
    })
}

/// Best-effort name for a transport parameter id this implementation does
/// not support, for log readability only.
fn known_extension_name(id: u64) -> Option<&'static str> {
    match id {
        0x0040 => Some("multipath"),
        0x1057 => Some("loss-bits"),
        0x173e => Some("discard"),
        0x2ab2 => Some("grease-quic-bit"),
        0x7157 | 0x7158 => Some("timestamp"),
        0x73db => Some("version-negotiation"),
        0xde1a => Some("delayed-ack"),
        0xff73db => Some("version-information-draft"),
        0xff02de1a => Some("delayed-ack"),
        _ => None,
    }
}
