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

//! The thin slice of TLS 1.3 the admission pipeline needs.
//!
//! The real handshake runs in an external TLS engine once a connection
//! exists. Before that, the server only has to answer one question: do the
//! CRYPTO bytes buffered so far contain a complete ClientHello? That takes
//! nothing more than the 4-byte handshake message header. Locating the
//! `quic_transport_parameters` extension inside a complete ClientHello is
//! provided as well, so a connection can hand the peer's parameters to the
//! transport without waiting for the engine to re-parse the message.

use crate::transport_params;

use crate::Error;
use crate::Result;

/// TLS handshake message type for ClientHello.
pub const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;

/// Outcome of feeding CRYPTO bytes to a handshake engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandshakeProgress {
    /// Whether a complete ClientHello is available.
    pub complete: bool,

    /// The raw `quic_transport_parameters` extension payload, when the
    /// message is complete and carries one.
    pub transport_params_ext: Option<Vec<u8>>,
}

/// Seam to the external TLS 1.3 engine.
///
/// The admission pipeline only relies on completeness detection; a real
/// engine will also start deriving handshake secrets from the same bytes.
pub trait HandshakeEngine {
    fn feed_client_hello(&mut self, buf: &[u8]) -> Result<HandshakeProgress>;
}

/// Built-in [`HandshakeEngine`] that answers the completeness question
/// without negotiating anything.
///
/// [`HandshakeEngine`]: trait.HandshakeEngine.html
pub struct ClientHelloProbe {
    version: u32,
}

impl ClientHelloProbe {
    pub fn new(version: u32) -> ClientHelloProbe {
        ClientHelloProbe { version }
    }
}

impl HandshakeEngine for ClientHelloProbe {
    fn feed_client_hello(&mut self, buf: &[u8]) -> Result<HandshakeProgress> {
        let total = match client_hello_len(buf)? {
            Some(v) => v,

            None => return Ok(HandshakeProgress::default()),
        };

        if buf.len() < total {
            return Ok(HandshakeProgress::default());
        }

        let transport_params_ext =
            find_transport_params(&buf[..total], self.version)?
                .map(|v| v.to_vec());

        Ok(HandshakeProgress {
            complete: true,
            transport_params_ext,
        })
    }
}

/// Returns the full length of the ClientHello starting at the beginning of
/// `buf`, or `None` when not even the message header has arrived yet.
///
/// Fails when the bytes at offset 0 are not a ClientHello at all, which
/// means the peer is not performing a QUIC handshake.
pub fn client_hello_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.is_empty() {
        return Ok(None);
    }

    if buf[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(Error::TlsFail);
    }

    if buf.len() < 4 {
        return Ok(None);
    }

    let mut b = octets::Octets::with_slice(buf);
    b.skip(1)?;
    let body_len = b.get_u24()? as usize;

    Ok(Some(4 + body_len))
}

/// Locates the `quic_transport_parameters` extension inside a complete
/// ClientHello and returns its payload.
///
/// The extension codepoint depends on the negotiated QUIC version. A
/// ClientHello without the extension yields `None`; the caller decides
/// whether that is fatal.
pub fn find_transport_params(
    msg: &[u8], version: u32,
) -> Result<Option<&[u8]>> {
    let codepoint = transport_params::extension_type(version);

    let mut b = octets::Octets::with_slice(msg);

    if b.get_u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(Error::TlsFail);
    }

    let body_len = b.get_u24()? as usize;
    if body_len != b.cap() {
        return Err(Error::TlsFail);
    }

    // legacy_version + random.
    b.skip(2 + 32)?;

    // legacy_session_id.
    let session_id_len = b.get_u8()? as usize;
    b.skip(session_id_len)?;

    // cipher_suites.
    let cipher_suites_len = b.get_u16()? as usize;
    b.skip(cipher_suites_len)?;

    // legacy_compression_methods.
    let compression_len = b.get_u8()? as usize;
    b.skip(compression_len)?;

    let mut exts = b.get_bytes_with_u16_length()?;

    while exts.cap() > 0 {
        let ext_type = exts.get_u16()?;
        let ext = exts.get_bytes_with_u16_length()?;

        if ext_type == codepoint {
            return Ok(Some(ext.buf()));
        }
    }

    Ok(None)
}
