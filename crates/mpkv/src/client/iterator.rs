// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lazy client-side iterator over a broker iterator session.
//!
//! Each step is one `next` round-trip; the terminal `close` is sent on
//! exhaustion and, via `Drop`, on early termination and error paths, so
//! the broker-side engine iterator is never left behind by a live peer.
//! The guard keeps other threads off the slot for the session's
//! lifetime.

use super::{Mdb, MdbError};
use crate::broker::STOP_SENTINEL;
use crate::literal::Value;
use crate::transport::frame;
use parking_lot::ReentrantMutexGuard;

/// A lazy `(suffix, value)` stream from the broker.
pub struct MdbIterator<'a> {
    mdb: &'a Mdb,
    _guard: ReentrantMutexGuard<'a, ()>,
    finished: bool,
}

impl<'a> MdbIterator<'a> {
    pub(super) fn new(mdb: &'a Mdb, guard: ReentrantMutexGuard<'a, ()>) -> Self {
        Self {
            mdb,
            _guard: guard,
            finished: false,
        }
    }

    /// Send the idempotent terminal `close`, releasing the slot state.
    fn close_session(&mut self) {
        self.finished = true;
        if let Err(e) = self.mdb.call(frame::request("close", []), true) {
            log::debug!("[MDB] iterator close failed: {e}");
        }
    }
}

impl Iterator for MdbIterator<'_> {
    type Item = Result<(String, Value), MdbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let result = self.mdb.call(frame::request("next", []), false);
        match result {
            Ok(Value::Str(s)) if s == STOP_SENTINEL => {
                // The broker already closed its iterator; close_session
                // only returns the slot to IDLE.
                self.close_session();
                None
            }
            Ok(Value::List(pair)) if pair.len() == 2 => {
                let mut pair = pair.into_iter();
                match (pair.next(), pair.next()) {
                    (Some(Value::Str(suffix)), Some(value)) => Some(Ok((suffix, value))),
                    _ => {
                        self.close_session();
                        Some(Err(MdbError::Protocol(
                            "iterator entry is not (suffix, value)".into(),
                        )))
                    }
                }
            }
            Ok(_) => {
                self.close_session();
                Some(Err(MdbError::Protocol(
                    "unexpected iterator reply shape".into(),
                )))
            }
            Err(e) => {
                self.close_session();
                Some(Err(e))
            }
        }
    }
}

impl Drop for MdbIterator<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.close_session();
        }
    }
}
