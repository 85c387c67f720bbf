// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side write batch guard.
//!
//! Operations queue in the broker's batch session for this slot and
//! apply atomically on [`MdbBatch::commit`]. A guard dropped without
//! commit sends `batch_error`, rolling the whole session back - that
//! covers early returns and panics in the caller's scope, so a failed
//! scope never leaves half a batch behind.

use super::{Mdb, Result};
use crate::literal::Value;
use crate::transport::frame;
use parking_lot::ReentrantMutexGuard;

/// An open atomic batch on this client's slot.
pub struct MdbBatch<'a> {
    mdb: &'a Mdb,
    _guard: ReentrantMutexGuard<'a, ()>,
    done: bool,
}

impl<'a> MdbBatch<'a> {
    pub(super) fn new(mdb: &'a Mdb, guard: ReentrantMutexGuard<'a, ()>) -> Self {
        Self {
            mdb,
            _guard: guard,
            done: false,
        }
    }

    /// Queue a put into the batch.
    pub fn put(&self, key: &str, val: &Value) -> Result<()> {
        self.mdb.call(
            frame::request(
                "batch_put",
                [("key", Value::from(key)), ("val", val.clone())],
            ),
            false,
        )?;
        Ok(())
    }

    /// Queue a delete into the batch.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.mdb.call(
            frame::request("batch_delete", [("key", Value::from(key))]),
            false,
        )?;
        Ok(())
    }

    /// Queue an increment of an integer counter key.
    ///
    /// The broker reads the stored value and writes the incremented one
    /// inside the commit itself, so counters stay exact even when other
    /// peers' write sequences interleave with this batch.
    pub fn bump(&self, key: &str) -> Result<()> {
        self.mdb.call(
            frame::request("batch_bump", [("key", Value::from(key))]),
            false,
        )?;
        Ok(())
    }

    /// Commit every queued operation atomically and release the slot.
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.mdb.call(frame::request("batch_exit", []), true)?;
        Ok(())
    }
}

impl Drop for MdbBatch<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.mdb.call(frame::request("batch_error", []), true) {
                log::debug!("[MDB] batch rollback failed: {e}");
            }
        }
    }
}
