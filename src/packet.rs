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

//! Long-header packet parsing and Initial packet unsealing.

use std::fmt;

use smallvec::SmallVec;

use crate::crypto;
use crate::frame;

use crate::Error;
use crate::Result;

const FORM_BIT: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;

const TYPE_MASK: u8 = 0x30;
const RESERVED_MASK: u8 = 0x0c;
const PKT_NUM_MASK: u8 = 0x03;

/// The maximum length of a connection ID.
pub const MAX_CID_LEN: u8 = 20;

const MAX_PKT_NUM_LEN: usize = 4;
const SAMPLE_LEN: usize = 16;

// Packet number (up to 4 bytes) plus AEAD tag; anything shorter cannot be a
// valid protected payload.
const PAYLOAD_MIN_LEN: usize = 4 + 16;

/// QUIC packet type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    /// Initial packet.
    Initial,

    /// Retry packet.
    Retry,

    /// Handshake packet.
    Handshake,

    /// 0-RTT packet.
    ZeroRTT,

    /// Version negotiation packet.
    VersionNegotiation,

    /// 1-RTT short header packet.
    Short,
}

/// Returns true if the first byte of a packet uses the long header form.
pub fn has_long_header(b: u8) -> bool {
    b & FORM_BIT != 0
}

/// A QUIC connection ID.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId<'a>(ConnectionIdInner<'a>);

#[derive(Clone, Eq)]
enum ConnectionIdInner<'a> {
    Vec(Vec<u8>),
    Ref(&'a [u8]),
}

impl<'a> ConnectionId<'a> {
    /// Creates a new connection ID from the given vector.
    pub const fn from_vec(cid: Vec<u8>) -> Self {
        Self(ConnectionIdInner::Vec(cid))
    }

    /// Creates a new connection ID from the given slice.
    pub const fn from_ref(cid: &'a [u8]) -> Self {
        Self(ConnectionIdInner::Ref(cid))
    }

    /// Returns a new owning connection ID from the given existing one.
    pub fn into_owned(self) -> ConnectionId<'static> {
        ConnectionId::from_vec(self.into())
    }
}

impl Default for ConnectionId<'_> {
    fn default() -> Self {
        Self::from_vec(Vec::new())
    }
}

impl From<Vec<u8>> for ConnectionId<'_> {
    fn from(v: Vec<u8>) -> Self {
        Self::from_vec(v)
    }
}

impl From<ConnectionId<'_>> for Vec<u8> {
    fn from(id: ConnectionId<'_>) -> Self {
        match id.0 {
            ConnectionIdInner::Vec(cid) => cid,
            ConnectionIdInner::Ref(cid) => cid.to_vec(),
        }
    }
}

impl PartialEq for ConnectionIdInner<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref() == other.as_ref()
    }
}

impl std::hash::Hash for ConnectionIdInner<'_> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_ref().hash(state);
    }
}

impl AsRef<[u8]> for ConnectionIdInner<'_> {
    fn as_ref(&self) -> &[u8] {
        match self {
            ConnectionIdInner::Vec(v) => v,
            ConnectionIdInner::Ref(v) => v,
        }
    }
}

impl std::ops::Deref for ConnectionId<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for ConnectionId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for c in self.iter() {
            write!(f, "{c:02x}")?;
        }

        Ok(())
    }
}

/// A parsed long packet header.
///
/// Parsing stops before the length field, so the same structure works for
/// all long header types; protected fields (packet number) are only
/// recovered by [`parse_initial()`].
///
/// [`parse_initial()`]: fn.parse_initial.html
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header<'a> {
    /// The type of the packet.
    pub ty: Type,

    /// The version of the packet.
    pub version: u32,

    /// The destination connection ID of the packet.
    pub dcid: ConnectionId<'a>,

    /// The source connection ID of the packet.
    pub scid: ConnectionId<'a>,

    /// The address verification token of the packet. Only present in
    /// `Initial` packets.
    pub token: Option<Vec<u8>>,
}

impl Header<'_> {
    /// Parses a long packet header, leaving the cursor at the length field.
    ///
    /// The connection IDs are copied out of the buffer, so the header does
    /// not borrow the (soon to be decrypted in place) packet bytes.
    pub fn from_bytes(b: &mut octets::Octets) -> Result<Header<'static>> {
        let first = b.get_u8()?;

        if !has_long_header(first) {
            return Err(Error::InvalidPacket);
        }

        let version = b.get_u32()?;

        let ty = if version == 0 {
            Type::VersionNegotiation
        } else {
            match (first & TYPE_MASK) >> 4 {
                0x00 => Type::Initial,
                0x01 => Type::ZeroRTT,
                0x02 => Type::Handshake,
                0x03 => Type::Retry,
                _ => return Err(Error::InvalidPacket),
            }
        };

        let dcid_len = b.get_u8()?;
        if dcid_len > MAX_CID_LEN {
            return Err(Error::InvalidPacket);
        }
        let dcid = b.get_bytes(dcid_len as usize)?.to_vec();

        let scid_len = b.get_u8()?;
        if scid_len > MAX_CID_LEN {
            return Err(Error::InvalidPacket);
        }
        let scid = b.get_bytes(scid_len as usize)?.to_vec();

        let mut token: Option<Vec<u8>> = None;

        if ty == Type::Initial {
            token = Some(b.get_bytes_with_varint_length()?.to_vec());
        }

        Ok(Header {
            ty,
            version,
            dcid: dcid.into(),
            scid: scid.into(),
            token,
        })
    }

    /// Writes the unprotected long header, up to but not including the
    /// length field. `pkt_num_len` ends up in the low bits of the first
    /// byte and must match what is encoded after the length.
    pub fn to_bytes(
        &self, pkt_num_len: usize, out: &mut octets::OctetsMut,
    ) -> Result<()> {
        let ty: u8 = match self.ty {
            Type::Initial => 0x00,
            Type::ZeroRTT => 0x01,
            Type::Handshake => 0x02,
            Type::Retry => 0x03,
            _ => return Err(Error::InvalidPacket),
        };

        if !(1..=MAX_PKT_NUM_LEN).contains(&pkt_num_len) {
            return Err(Error::InvalidPacket);
        }

        let first =
            FORM_BIT | FIXED_BIT | (ty << 4) | ((pkt_num_len - 1) as u8);

        out.put_u8(first)?;
        out.put_u32(self.version)?;

        out.put_u8(self.dcid.len() as u8)?;
        out.put_bytes(&self.dcid)?;

        out.put_u8(self.scid.len() as u8)?;
        out.put_bytes(&self.scid)?;

        // Only Initial packets have a token.
        if self.ty == Type::Initial {
            match self.token {
                Some(ref v) => {
                    out.put_varint(v.len() as u64)?;
                    out.put_bytes(v)?;
                },

                None => {
                    out.put_varint(0)?;
                },
            }
        }

        Ok(())
    }
}

/// An unsealed Initial packet, retained for replay into the connection
/// that a candidate eventually promotes to.
#[derive(Debug)]
pub struct InitialPacket {
    /// The wire version the packet was sent with.
    pub version: u32,

    /// The destination connection ID.
    pub dcid: ConnectionId<'static>,

    /// The source connection ID.
    pub scid: ConnectionId<'static>,

    /// The address verification token.
    pub token: Vec<u8>,

    /// The decoded full packet number.
    pub pkt_num: u64,

    /// The decrypted frames, in wire order.
    pub frames: SmallVec<[frame::Frame; 8]>,

    /// The packet's total length on the wire, including coalescing-relevant
    /// header and tag bytes.
    pub len: usize,
}

/// Returns the smallest number of bytes able to represent the given packet
/// number.
pub fn pkt_num_len(pn: u64) -> usize {
    let num_unacked = pn + 1;

    // computed as: ceil(log2(num_unacked) / 8)
    let min_bits = u64::BITS - num_unacked.leading_zeros();
    ((min_bits + 7) / 8) as usize
}

/// Expands a truncated packet number, as per RFC 9000 Section A.3.
pub fn decode_pkt_num(largest_pn: u64, truncated_pn: u64, pn_len: usize) -> u64 {
    let pn_nbits = pn_len * 8;
    let expected_pn = largest_pn + 1;
    let pn_win = 1 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;
    let candidate_pn = (expected_pn & !pn_mask) | truncated_pn;

    if candidate_pn + pn_hwin <= expected_pn && candidate_pn < (1 << 62) - pn_win
    {
        return candidate_pn + pn_win;
    }

    if candidate_pn > expected_pn + pn_hwin && candidate_pn >= pn_win {
        return candidate_pn - pn_win;
    }

    candidate_pn
}

/// Writes a truncated packet number of the given length.
pub fn encode_pkt_num(
    pn: u64, pn_len: usize, b: &mut octets::OctetsMut,
) -> Result<()> {
    match pn_len {
        1 => b.put_u8(pn as u8)?,

        2 => b.put_u16(pn as u16)?,

        3 => b.put_u24(pn as u32)?,

        4 => b.put_u32(pn as u32)?,

        _ => return Err(Error::InvalidPacket),
    };

    Ok(())
}

/// Unseals the Initial packet at the start of `buf` in place.
///
/// `expected_dcid` must be the connection ID the candidate's Initial keys
/// were derived from; a packet addressed elsewhere is rejected before any
/// crypto work. On success returns the parsed packet and the number of
/// bytes it occupied, so the caller can locate coalesced packets in the
/// rest of the datagram.
pub fn parse_initial(
    buf: &mut [u8], expected_dcid: Option<&ConnectionId>, largest_pkt_num: u64,
    aead: &crypto::Open,
) -> Result<(InitialPacket, usize)> {
    let (hdr, payload_len, pn_off) = {
        let mut b = octets::Octets::with_slice(buf);

        let hdr = Header::from_bytes(&mut b)?;

        if hdr.ty != Type::Initial {
            return Err(Error::InvalidPacket);
        }

        let payload_len = b.get_varint()? as usize;

        (hdr, payload_len, b.off())
    };

    if let Some(dcid) = expected_dcid {
        if hdr.dcid != *dcid {
            return Err(Error::InvalidPacket);
        }
    }

    if payload_len < PAYLOAD_MIN_LEN || payload_len > buf.len() - pn_off {
        return Err(Error::InvalidPacket);
    }

    let pkt_len = pn_off + payload_len;

    // Remove header protection (RFC 9001 Section 5.4.2). The sample is
    // taken assuming the longest possible packet number encoding.
    let sample_start = pn_off + MAX_PKT_NUM_LEN;
    let mask =
        aead.new_mask(&buf[sample_start..sample_start + SAMPLE_LEN])?;

    buf[0] ^= mask[0] & 0x0f;

    let pn_len = usize::from(buf[0] & PKT_NUM_MASK) + 1;

    // Reserved bits must be zero once unprotected.
    if buf[0] & RESERVED_MASK != 0 {
        return Err(Error::InvalidPacket);
    }

    let mut truncated_pn: u64 = 0;
    for i in 0..pn_len {
        buf[pn_off + i] ^= mask[1 + i];
        truncated_pn = (truncated_pn << 8) | u64::from(buf[pn_off + i]);
    }

    let pkt_num = decode_pkt_num(largest_pkt_num, truncated_pn, pn_len);

    // Unseal the payload; the AAD is the header with the unprotected
    // packet number.
    let payload_off = pn_off + pn_len;
    let (header_bytes, rest) = buf.split_at_mut(payload_off);
    let ciphertext = &mut rest[..payload_len - pn_len];

    let plain_len =
        aead.open_with_u64_counter(pkt_num, header_bytes, ciphertext)?;

    let mut frames = SmallVec::new();
    let mut f = octets::Octets::with_slice(&ciphertext[..plain_len]);

    while f.cap() > 0 {
        frames.push(frame::Frame::from_bytes(&mut f, Type::Initial)?);
    }

    let pkt = InitialPacket {
        version: hdr.version,
        dcid: hdr.dcid.into_owned(),
        scid: hdr.scid.into_owned(),
        token: hdr.token.unwrap_or_default(),
        pkt_num,
        frames,
        len: pkt_len,
    };

    Ok((pkt, pkt_len))
}

/// Applies header protection to a freshly sealed packet.
///
/// `buf` holds the whole packet, with the packet number starting at
/// `pn_off` and the sealed payload right after it.
pub fn encrypt_hdr(
    buf: &mut [u8], pn_off: usize, pn_len: usize, aead: &crypto::Seal,
) -> Result<()> {
    let sample_start = pn_off + MAX_PKT_NUM_LEN;

    if sample_start + SAMPLE_LEN > buf.len() {
        return Err(Error::BufferTooShort);
    }

    let mask =
        aead.new_mask(&buf[sample_start..sample_start + SAMPLE_LEN])?;

    if has_long_header(buf[0]) {
        buf[0] ^= mask[0] & 0x0f;
    } else {
        buf[0] ^= mask[0] & 0x1f;
    }

    for i in 0..pn_len {
        buf[pn_off + i] ^= mask[1 + i];
    }

    Ok(())
}

impl PartialEq for InitialPacket {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version &&
            self.dcid == other.dcid &&
            self.scid == other.scid &&
            self.token == other.token &&
            self.pkt_num == other.pkt_num &&
            self.frames == other.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_header_round_trip() {
        let hdr = Header {
            ty: Type::Initial,
            version: crate::PROTOCOL_VERSION,
            dcid: ConnectionId::from_ref(&[0xba; 9]),
            scid: ConnectionId::from_ref(&[0xbb; 9]),
            token: Some(vec![0x05, 0x06, 0x07]),
        };

        let mut d = [0; 64];

        let off = {
            let mut b = octets::OctetsMut::with_slice(&mut d);
            hdr.to_bytes(4, &mut b).unwrap();
            b.off()
        };

        let mut b = octets::Octets::with_slice(&d[..off]);
        assert_eq!(Header::from_bytes(&mut b).unwrap(), hdr);
        assert_eq!(b.cap(), 0);
    }

    #[test]
    fn version_negotiation_type() {
        // A long header with version 0 classifies as version negotiation
        // regardless of its type bits.
        let raw = [0xea, 0x00, 0x00, 0x00, 0x00, 0x01, 0xba, 0x01, 0xbb];
        let mut b = octets::Octets::with_slice(&raw);

        let hdr = Header::from_bytes(&mut b).unwrap();
        assert_eq!(hdr.ty, Type::VersionNegotiation);
    }

    #[test]
    fn oversized_cid() {
        let mut raw = vec![0xc0, 0x00, 0x00, 0x00, 0x01, 21];
        raw.extend_from_slice(&[0xba; 21]);
        raw.extend_from_slice(&[0, 0]);

        let mut b = octets::Octets::with_slice(&raw);
        assert_eq!(Header::from_bytes(&mut b), Err(Error::InvalidPacket));
    }

    #[test]
    fn pkt_num_window() {
        // Expansion example from RFC 9000 Appendix A.3.
        assert_eq!(decode_pkt_num(0xa82f30ea, 0x9b32, 2), 0xa82f9b32);

        assert_eq!(decode_pkt_num(0, 0, 1), 0);
        assert_eq!(decode_pkt_num(0xff, 0x01, 1), 0x101);
    }

    #[test]
    fn pkt_num_lengths() {
        assert_eq!(pkt_num_len(0), 1);
        assert_eq!(pkt_num_len(0xfe), 1);
        assert_eq!(pkt_num_len(0xff), 2);
        assert_eq!(pkt_num_len(0xffff), 3);
    }

    #[test]
    fn initial_round_trip() {
        let dcid = ConnectionId::from_ref(&[0x42; 8]);
        let scid = ConnectionId::from_ref(&[0x24; 8]);

        let frames = vec![
            crate::frame::Frame::Crypto {
                offset: 0,
                data: b"hi there".to_vec(),
            },
            crate::frame::Frame::Padding { len: 100 },
        ];

        let mut datagram = crate::test_utils::encode_initial(
            crate::PROTOCOL_VERSION,
            &scid,
            &dcid,
            0,
            &frames,
        )
        .unwrap();

        let (open, _) = crypto::derive_initial_key_material(
            &dcid,
            crate::PROTOCOL_VERSION,
            true,
        )
        .unwrap();

        let (pkt, consumed) =
            parse_initial(&mut datagram, Some(&dcid), 0, &open).unwrap();

        assert_eq!(consumed, datagram.len());
        assert_eq!(pkt.pkt_num, 0);
        assert_eq!(pkt.scid, scid);
        assert_eq!(pkt.dcid, dcid);
        assert_eq!(&pkt.frames[..], &frames[..]);
    }

    #[test]
    fn initial_wrong_dcid() {
        let dcid = ConnectionId::from_ref(&[0x42; 8]);
        let scid = ConnectionId::from_ref(&[0x24; 8]);

        let frames = vec![
            crate::frame::Frame::Ping,
            crate::frame::Frame::Padding { len: 40 },
        ];

        let mut datagram = crate::test_utils::encode_initial(
            crate::PROTOCOL_VERSION,
            &scid,
            &dcid,
            0,
            &frames,
        )
        .unwrap();

        let (open, _) = crypto::derive_initial_key_material(
            &dcid,
            crate::PROTOCOL_VERSION,
            true,
        )
        .unwrap();

        let other = ConnectionId::from_ref(&[0x43; 8]);
        assert_eq!(
            parse_initial(&mut datagram, Some(&other), 0, &open),
            Err(Error::InvalidPacket)
        );
    }

    #[test]
    fn initial_corrupted_payload() {
        let dcid = ConnectionId::from_ref(&[0x42; 8]);
        let scid = ConnectionId::from_ref(&[0x24; 8]);

        let frames = vec![crate::frame::Frame::Crypto {
            offset: 0,
            data: vec![0; 32],
        }];

        let mut datagram = crate::test_utils::encode_initial(
            crate::PROTOCOL_VERSION,
            &scid,
            &dcid,
            0,
            &frames,
        )
        .unwrap();

        let last = datagram.len() - 1;
        datagram[last] ^= 0xff;

        let (open, _) = crypto::derive_initial_key_material(
            &dcid,
            crate::PROTOCOL_VERSION,
            true,
        )
        .unwrap();

        assert_eq!(
            parse_initial(&mut datagram, Some(&dcid), 0, &open),
            Err(Error::CryptoFail)
        );
    }
}
