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

//! Routing table from destination connection ID to candidate or
//! connection.
//!
//! The first datagram for an unknown DCID creates a candidate; later
//! datagrams for the same DCID reach the same entry, so per-candidate
//! processing is naturally serialized by the entry lock. On promotion the
//! entry is swapped in place, which atomically redirects subsequent
//! datagrams to the connection.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use crate::amplification::DatagramMeta;
use crate::candidate::ConnectionCandidate;
use crate::candidate::ConnectionFactory;
use crate::candidate::State;
use crate::packet;

use crate::Config;
use crate::Result;

/// What an entry currently routes to.
pub enum Route<F: ConnectionFactory> {
    /// Still gathering the ClientHello.
    Candidate(ConnectionCandidate<F>),

    /// A promoted connection.
    Connection(F::Connection),
}

/// How a datagram was dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The datagram was silently discarded.
    Dropped,

    /// A candidate consumed the datagram and is waiting for more.
    Buffering,

    /// This datagram completed a handshake; a connection now exists.
    Promoted,

    /// The DCID already routes to a connection; the caller should deliver
    /// the datagram there.
    Connection,
}

/// Shared table of in-progress and promoted handshakes, keyed by the
/// client-chosen destination connection ID.
pub struct Registry<F: ConnectionFactory> {
    entries: Mutex<HashMap<Vec<u8>, Arc<Mutex<Route<F>>>>>,

    factory: Arc<F>,

    config: Config,
}

impl<F: ConnectionFactory> Registry<F> {
    pub fn new(config: Config, factory: Arc<F>) -> Registry<F> {
        Registry {
            entries: Mutex::new(HashMap::new()),
            factory,
            config,
        }
    }

    /// Routes one inbound datagram.
    ///
    /// Creates a candidate when the datagram opens with an Initial for an
    /// unknown DCID (first arrival wins); otherwise the datagram goes to
    /// the existing entry. Anything unparsable or for an unsupported
    /// version is dropped without reply.
    pub fn process_datagram(
        &self, buf: &mut [u8], meta: &DatagramMeta,
    ) -> Result<Disposition> {
        let hdr = {
            let mut b = octets::Octets::with_slice(buf);

            match packet::Header::from_bytes(&mut b) {
                Ok(v) => v,

                // Not a long header packet; without connection state this
                // routes nowhere.
                Err(_) => return Ok(Disposition::Dropped),
            }
        };

        let dcid = hdr.dcid.to_vec();

        let route = {
            let mut entries = self.entries.lock().unwrap();

            match entries.entry(dcid.clone()) {
                Entry::Occupied(e) => Arc::clone(e.get()),

                Entry::Vacant(e) => {
                    if hdr.ty != packet::Type::Initial {
                        return Ok(Disposition::Dropped);
                    }

                    if !crate::version_is_supported(hdr.version) {
                        trace!(
                            "dropping Initial with unsupported version {:x}",
                            hdr.version
                        );

                        return Ok(Disposition::Dropped);
                    }

                    let candidate = ConnectionCandidate::new(
                        hdr.version,
                        meta.from,
                        hdr.scid.into_owned(),
                        hdr.dcid.into_owned(),
                        Arc::clone(&self.factory),
                        meta.at,
                    )?;

                    let route = Arc::new(Mutex::new(Route::Candidate(
                        candidate,
                    )));

                    e.insert(Arc::clone(&route));

                    route
                },
            }
        };

        let disposition = {
            let mut guard = route.lock().unwrap();

            let outcome = match &mut *guard {
                Route::Candidate(candidate) => Some((
                    candidate.process_datagram(buf, meta),
                    candidate.state(),
                )),

                Route::Connection(_) => None,
            };

            match outcome {
                Some((Some(conn), _)) => {
                    *guard = Route::Connection(conn);

                    Disposition::Promoted
                },

                Some((None, State::Dropped)) => Disposition::Dropped,

                Some((None, _)) => Disposition::Buffering,

                None => Disposition::Connection,
            }
        };

        if disposition == Disposition::Dropped {
            self.entries.lock().unwrap().remove(&dcid);
        }

        Ok(disposition)
    }

    /// Runs `f` against the entry for `dcid`, if any.
    pub fn with_route<R>(
        &self, dcid: &[u8], f: impl FnOnce(&mut Route<F>) -> R,
    ) -> Option<R> {
        let route = {
            let entries = self.entries.lock().unwrap();
            Arc::clone(entries.get(dcid)?)
        };

        let mut route = route.lock().unwrap();
        Some(f(&mut route))
    }

    /// Silently removes candidates whose client went quiet.
    ///
    /// Returns how many were evicted. Promoted connections are never
    /// touched; their lifetime is the connection's business.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let timeout = self.config.candidate_timeout;

        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();

        entries.retain(|_, route| match &*route.lock().unwrap() {
            Route::Candidate(c) => !c.is_idle(now, timeout),
            Route::Connection(_) => true,
        });

        before - entries.len()
    }

    /// Number of live entries, candidates and connections combined.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Returns true when no handshake state is held at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
