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

//! Reassembly buffer for the Initial-level CRYPTO stream.
//!
//! CRYPTO frames may arrive out of order and may overlap. An attacker able
//! to spoof the client address could try to inject conflicting bytes into
//! the ClientHello, so overlapping data is only accepted when it matches
//! what was already buffered.

use crate::ranges;

use crate::Error;
use crate::Result;

/// Offset-indexed accumulator for CRYPTO stream bytes.
#[derive(Default)]
pub struct CryptoBuf {
    /// Flat storage; bytes inside `received` spans are valid, the rest are
    /// zero filler.
    data: Vec<u8>,

    /// Spans of the stream that have been received so far.
    received: ranges::RangeSet,

    /// Maximum stream offset this buffer will accept.
    cap: usize,
}

impl CryptoBuf {
    pub fn new(cap: usize) -> CryptoBuf {
        CryptoBuf {
            data: Vec::new(),
            received: ranges::RangeSet::default(),
            cap,
        }
    }

    /// Inserts a chunk of stream data at the given offset.
    ///
    /// Returns [`CryptoBufferExceeded`] when the chunk extends past the
    /// buffer's capacity, and [`InvalidFrame`] when the chunk disagrees
    /// with previously received bytes in an overlapping span.
    ///
    /// [`CryptoBufferExceeded`]: ../enum.Error.html#variant.CryptoBufferExceeded
    /// [`InvalidFrame`]: ../enum.Error.html#variant.InvalidFrame
    pub fn write(&mut self, off: u64, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        let end = off
            .checked_add(chunk.len() as u64)
            .ok_or(Error::InvalidFrame)?;

        if end > self.cap as u64 {
            return Err(Error::CryptoBufferExceeded);
        }

        // Overlapping retransmits are fine, contradictory ones are not.
        for r in self.received.iter() {
            let start = std::cmp::max(r.start, off);
            let stop = std::cmp::min(r.end, end);

            if start >= stop {
                continue;
            }

            let old = &self.data[start as usize..stop as usize];
            let new = &chunk[(start - off) as usize..(stop - off) as usize];

            if old != new {
                return Err(Error::InvalidFrame);
            }
        }

        if self.data.len() < end as usize {
            self.data.resize(end as usize, 0);
        }

        self.data[off as usize..end as usize].copy_from_slice(chunk);
        self.received.insert(off..end);

        Ok(())
    }

    /// Returns the bytes received contiguously from offset 0.
    pub fn contiguous(&self) -> &[u8] {
        match self.received.iter().next() {
            Some(r) if r.start == 0 => &self.data[..r.end as usize],

            _ => &[],
        }
    }

    /// Returns the largest offset received so far, counting gaps.
    pub fn max_off(&self) -> u64 {
        self.received.last().map_or(0, |v| v + 1)
    }
}
