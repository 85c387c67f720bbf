// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-slot engine sessions held across requests.
//!
//! Iterator and batch sessions outlive a single dispatch, so the
//! maintainer must store them next to the engine they borrow from. The
//! engine lives in a `Box` owned by the maintainer and the sessions are
//! declared (and therefore dropped) before it, which is the whole safety
//! argument for erasing the borrow lifetime here.
//!
//! The batch session is an explicit state machine: Open -> (Put |
//! Delete | Bump)* -> (Commit | Rollback) -> Closed, with Rollback
//! delivered either by the peer (`batch_error`) or by the maintainer
//! when the slot goes CLEAN.
//!
//! Bumps are counter increments resolved at commit time: the current
//! value is read and the incremented one written inside the commit
//! dispatch itself, so concurrently writing peers cannot lose an
//! increment no matter how their request sequences interleave. A rolled
//! back batch drops its bumps with everything else.

use crate::engine::{self, Engine, EngineBatch, EngineIter};
use crate::literal::Value;
use std::collections::HashMap;

/// An open iterator session for one slot.
pub(crate) struct IterSession {
    inner: EngineIter<'static>,
}

impl IterSession {
    /// Erase the engine borrow so the session can be stored beside it.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the engine outlives this session and its
    /// heap location is stable (the maintainer keeps the engine in a
    /// `Box` declared after the session tables, so sessions always drop
    /// first and the box never reallocates).
    pub(crate) unsafe fn new(iter: EngineIter<'_>) -> Self {
        Self {
            inner: std::mem::transmute::<EngineIter<'_>, EngineIter<'static>>(iter),
        }
    }

    /// Advance the iterator; `None` means exhausted.
    pub(crate) fn next_entry(&mut self) -> engine::Result<Option<(String, Value)>> {
        self.inner.next_entry()
    }
}

/// An open batch session for one slot.
pub(crate) struct BatchSession {
    inner: EngineBatch<'static>,
    /// Counter keys to increment at commit, with their pending deltas.
    bumps: HashMap<String, i64>,
    ops: usize,
}

impl BatchSession {
    /// Erase the engine borrow; same contract as [`IterSession::new`].
    ///
    /// # Safety
    ///
    /// See [`IterSession::new`].
    pub(crate) unsafe fn new(batch: EngineBatch<'_>) -> Self {
        Self {
            inner: std::mem::transmute::<EngineBatch<'_>, EngineBatch<'static>>(batch),
            bumps: HashMap::new(),
            ops: 0,
        }
    }

    /// Queue a put into the open batch.
    pub(crate) fn put(&mut self, key: &str, val: &Value) {
        self.inner.put(key, val);
        self.ops += 1;
    }

    /// Queue a delete into the open batch.
    pub(crate) fn delete(&mut self, key: &str) {
        self.inner.delete(key);
        self.ops += 1;
    }

    /// Queue a counter increment, resolved against the stored value at
    /// commit time.
    pub(crate) fn bump(&mut self, key: &str) {
        *self.bumps.entry(key.to_string()).or_insert(0) += 1;
        self.ops += 1;
    }

    /// Commit: resolve queued bumps against the engine's current values,
    /// then apply every queued operation atomically. The read and the
    /// write happen inside one dispatch, which the maintainer serializes
    /// against every other slot's commits.
    pub(crate) fn commit(mut self, engine: &Engine) -> engine::Result<()> {
        for (key, delta) in &self.bumps {
            let current = engine.get(key)?.and_then(|v| v.as_int()).unwrap_or(0);
            self.inner.put(key, &Value::Int(current + delta));
        }
        log::debug!("[BROKER] batch commit ({} ops)", self.ops);
        self.inner.commit()
    }

    /// Rollback: discard every queued operation, bumps included.
    pub(crate) fn rollback(self) {
        log::debug!("[BROKER] batch rollback ({} ops)", self.ops);
        // Dropping the batch without commit discards it.
    }
}
