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

//! Client-side builders shared by the unit tests.
//!
//! The crate only implements the server half of the handshake, so tests
//! have to play the client: build a ClientHello, wrap it in CRYPTO
//! frames, seal an Initial with the client's keys and protect its header.

use crate::crypto;
use crate::frame;
use crate::packet;
use crate::packet::ConnectionId;
use crate::transport_params::TransportParams;

use crate::Result;

/// TLS 1.3 cipher suite id for TLS_AES_128_GCM_SHA256.
const TLS_AES_128_GCM_SHA256: u16 = 0x1301;

/// An extension type from the "for private use" range, used as filler to
/// inflate a ClientHello beyond one packet.
const PADDING_EXTENSION_TYPE: u16 = 0xfa7e;

/// Builds a minimal but well-formed ClientHello carrying the given
/// transport parameters, padded with `pad_ext_len` bytes of an opaque
/// extension when a large message is needed.
pub fn client_hello_bytes(
    version: u32, tp: &TransportParams, pad_ext_len: usize,
) -> Vec<u8> {
    let mut tp_ext = vec![0; 2048];
    let tp_ext =
        TransportParams::encode_extension(tp, version, false, None, &mut tp_ext)
            .unwrap();

    build_client_hello(Some(tp_ext), pad_ext_len)
}

/// A complete ClientHello that does not carry the
/// `quic_transport_parameters` extension at all.
pub fn client_hello_without_transport_params() -> Vec<u8> {
    build_client_hello(None, 0)
}

fn build_client_hello(tp_ext: Option<&[u8]>, pad_ext_len: usize) -> Vec<u8> {
    let mut extensions = Vec::new();

    if let Some(ext) = tp_ext {
        extensions.extend_from_slice(ext);
    }

    if pad_ext_len > 0 {
        extensions.extend_from_slice(&PADDING_EXTENSION_TYPE.to_be_bytes());
        extensions.extend_from_slice(&(pad_ext_len as u16).to_be_bytes());
        extensions.resize(extensions.len() + pad_ext_len, 0);
    }

    let mut body = Vec::new();

    // legacy_version.
    body.extend_from_slice(&0x0303u16.to_be_bytes());

    // random.
    body.extend_from_slice(&[0x42; 32]);

    // legacy_session_id (empty).
    body.push(0);

    // cipher_suites.
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&TLS_AES_128_GCM_SHA256.to_be_bytes());

    // legacy_compression_methods (null only).
    body.push(1);
    body.push(0);

    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut msg = Vec::with_capacity(4 + body.len());
    msg.push(crate::tls::HANDSHAKE_TYPE_CLIENT_HELLO);
    msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    msg.extend_from_slice(&body);

    msg
}

/// Seals a client Initial packet carrying the given frames and returns
/// its wire bytes.
pub fn encode_initial(
    version: u32, scid: &ConnectionId, dcid: &ConnectionId, pkt_num: u64,
    frames: &[frame::Frame],
) -> Result<Vec<u8>> {
    let payload_len: usize = frames.iter().map(|f| f.wire_len()).sum();
    let pn_len = packet::pkt_num_len(pkt_num);

    let (_, seal) =
        crypto::derive_initial_key_material(dcid, version, false)?;

    let tag_len = seal.alg().tag_len();

    let hdr_len = 1 + // first byte
        4 + // version
        1 + dcid.len() + // dcid
        1 + scid.len() + // scid
        1; // empty token

    let total = hdr_len + 2 + pn_len + payload_len + tag_len;
    let mut out = vec![0; total];

    let hdr = packet::Header {
        ty: packet::Type::Initial,
        version,
        dcid: ConnectionId::from_vec(dcid.to_vec()),
        scid: ConnectionId::from_vec(scid.to_vec()),
        token: None,
    };

    let pn_off = {
        let mut b = octets::OctetsMut::with_slice(&mut out);

        hdr.to_bytes(pn_len, &mut b)?;

        // Length field, always on 2 bytes like most real clients emit it.
        b.put_varint_with_len((pn_len + payload_len + tag_len) as u64, 2)?;

        let pn_off = b.off();

        packet::encode_pkt_num(pkt_num, pn_len, &mut b)?;

        for f in frames {
            f.to_bytes(&mut b)?;
        }

        pn_off
    };

    let payload_off = pn_off + pn_len;

    let (header_bytes, payload_bytes) = out.split_at_mut(payload_off);

    seal.seal_with_u64_counter(
        pkt_num,
        header_bytes,
        payload_bytes,
        payload_len,
    )?;

    packet::encrypt_hdr(&mut out, pn_off, pn_len, &seal)?;

    Ok(out)
}

/// Like [`encode_initial()`], but pads the packet so the resulting
/// datagram is exactly [`MIN_CLIENT_INITIAL_LEN`] bytes, the way a
/// conforming client pads its first flight.
///
/// [`encode_initial()`]: fn.encode_initial.html
/// [`MIN_CLIENT_INITIAL_LEN`]: ../constant.MIN_CLIENT_INITIAL_LEN.html
pub fn padded_initial_datagram(
    version: u32, scid: &ConnectionId, dcid: &ConnectionId, pkt_num: u64,
    frames: &[frame::Frame],
) -> Result<Vec<u8>> {
    let payload_len: usize = frames.iter().map(|f| f.wire_len()).sum();
    let pn_len = packet::pkt_num_len(pkt_num);

    let base = 1 + 4 + 1 + dcid.len() + 1 + scid.len() + 1 + 2 + pn_len +
        payload_len +
        16;

    if base >= crate::MIN_CLIENT_INITIAL_LEN {
        return encode_initial(version, scid, dcid, pkt_num, frames);
    }

    let mut padded = frames.to_vec();
    padded.push(frame::Frame::Padding {
        len: crate::MIN_CLIENT_INITIAL_LEN - base,
    });

    encode_initial(version, scid, dcid, pkt_num, &padded)
}
