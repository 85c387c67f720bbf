// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The maintainer: the one process that owns the engine.
//!
//! The embedded engine permits a single OS process per data directory,
//! so the maintainer takes that seat and multiplexes every peer through
//! the shared region. It creates the region zeroed, then scans slots in
//! index order: a slot in REQUEST gets its frame dispatched against the
//! engine (or against that slot's open iterator/batch session) and
//! answered; a slot in CLEAN gets its sessions torn down (iterator
//! closed, batch rolled back) and is returned to FREE.
//!
//! Dispatch failures of any kind - malformed frames, unknown methods,
//! engine errors, session nesting - become `error` replies; the
//! maintainer itself never aborts on peer input.
//!
//! The loop exits once every lock is FREE again after at least one peer
//! was observed (the latch closes the window between region creation and
//! the spawning peer's first claim, who is already waiting under
//! SysLock). Teardown closes any straggler session, zeroes the locks and
//! unlinks the region.
//!
//! # Methods
//!
//! | method       | args                  | result                       |
//! |--------------|-----------------------|------------------------------|
//! | put          | key, val              | `True`                       |
//! | delete       | key                   | `True`                       |
//! | get          | key                   | value or `None`              |
//! | iterator     | prefix, reverse, seek | `True` (opens slot iterator) |
//! | next         |                       | `[suffix, value]` or the `"StopIteration"` sentinel |
//! | close        |                       | `True` (idempotent)          |
//! | batch_enter  |                       | `True` (opens slot batch)    |
//! | batch_put    | key, val              | `True`                       |
//! | batch_delete | key                   | `True`                       |
//! | batch_bump   | key                   | `True` (counter +1 at commit)|
//! | batch_exit   |                       | `True` (commit)              |
//! | batch_error  |                       | `True` (rollback)            |
//! | next_id      | prefix                | next ordered id for prefix   |
//! | stats        |                       | engine statistics or `None`  |
//!
//! `next_id` and `batch_bump` exist so that every read-increment-write
//! on shared counters happens inside broker dispatch; a peer-side read
//! followed by a later write would race against other peers' sequences
//! interleaving between the two calls.

mod session;

use crate::config::{self, region_size, MAX_PEERS, TICK};
use crate::engine::{Engine, EngineError};
use crate::lexokey::{is_lexo_str, LexoKey};
use crate::literal::Value;
use crate::shm::{SharedRegion, ShmError};
use crate::transport::{
    frame, SlotBank, LOCK_CLEAN, LOCK_FREE, STATE_REQUEST, STATE_RESPONSE,
};
use session::{BatchSession, IterSession};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::thread;

/// The iterator-exhaustion sentinel carried in a `next` reply.
pub const STOP_SENTINEL: &str = "StopIteration";

/// Broker startup failures. Everything after startup is reported to the
/// requesting peer instead.
#[derive(Debug)]
pub enum BrokerError {
    /// The engine would not open (commonly: directory owned elsewhere).
    Engine(EngineError),
    /// The shared region could not be created or unlinked.
    Shm(ShmError),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine(e) => write!(f, "broker engine failure: {e}"),
            Self::Shm(e) => write!(f, "broker shared region failure: {e}"),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Engine(e) => Some(e),
            Self::Shm(e) => Some(e),
        }
    }
}

impl From<EngineError> for BrokerError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl From<ShmError> for BrokerError {
    fn from(e: ShmError) -> Self {
        Self::Shm(e)
    }
}

/// Ignore INT and TERM so a peer's Ctrl-C cannot orphan the engine.
///
/// Shutdown happens through peers releasing their slots, never through
/// signals. Call this in a dedicated broker process only; the handlers
/// are process-wide.
pub fn mask_signals() {
    // SAFETY: SIG_IGN is a valid disposition for both signals, and
    // libc::signal with a valid signal number has no other preconditions.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
    }
}

/// Open the engine, create the shared region, and serve peers until the
/// last one releases its slot. Blocks for the broker's whole lifetime.
pub fn run(db_path: &str) -> Result<(), BrokerError> {
    let engine = Box::new(Engine::open(db_path)?);

    let region_name = config::region_name(db_path);
    let region = SharedRegion::create(&region_name, region_size())?;
    let bank = SlotBank::new(region);
    log::info!("[BROKER] serving {db_path} on {region_name}");

    let mut maintainer = Maintainer::new(engine, bank);
    maintainer.run();
    drop(maintainer);

    SharedRegion::unlink(&region_name)?;
    log::info!("[BROKER] {region_name} unlinked, exiting");
    Ok(())
}

/// Slot-scanning dispatch loop around the engine.
struct Maintainer {
    // Sessions borrow from `engine`: they are declared first so they are
    // dropped first, and the engine box is never moved out from under
    // them. See `broker::session`.
    iters: Vec<Option<IterSession>>,
    batches: Vec<Option<BatchSession>>,
    engine: Box<Engine>,
    bank: SlotBank,
    /// Next-id high-water mark per prefix; keeps allocation monotone
    /// while several peers interleave allocate/insert sequences.
    alloc: HashMap<String, u64>,
    /// Set once any slot has been observed non-FREE.
    seen_peer: bool,
}

impl Maintainer {
    fn new(engine: Box<Engine>, bank: SlotBank) -> Self {
        Self {
            iters: (0..MAX_PEERS).map(|_| None).collect(),
            batches: (0..MAX_PEERS).map(|_| None).collect(),
            engine,
            bank,
            alloc: HashMap::new(),
            seen_peer: false,
        }
    }

    fn run(&mut self) {
        loop {
            let mut any_locked = false;

            for slot in 0..MAX_PEERS {
                if self.bank.state(slot).load(Ordering::Acquire) == STATE_REQUEST {
                    self.service(slot);
                }

                match self.bank.lock(slot).load(Ordering::Acquire) {
                    LOCK_CLEAN => {
                        // A claim-and-release that happened entirely
                        // between scans still counts as a peer.
                        self.seen_peer = true;
                        self.release_slot(slot);
                    }
                    LOCK_FREE => {}
                    _ => any_locked = true,
                }
            }

            if any_locked {
                self.seen_peer = true;
            } else if self.seen_peer {
                break;
            }

            thread::sleep(TICK);
        }

        self.teardown();
    }

    /// Dispatch one request frame and publish the reply.
    fn service(&mut self, slot: usize) {
        let reply = match self.dispatch(slot) {
            Ok(result) => frame::reply(result),
            Err(text) => {
                log::debug!("[BROKER] slot {slot} error reply: {text}");
                frame::error_reply(&text)
            }
        };

        let encoded = match frame::encode(&reply) {
            Ok(bytes) => bytes,
            // A result too large for the frame still gets an answer.
            Err(e) => frame::encode(&frame::error_reply(&e.to_string()))
                .expect("error replies always fit"),
        };

        self.bank.write_frame(slot, &encoded);
        self.bank.state(slot).store(STATE_RESPONSE, Ordering::Release);
    }

    /// Reclaim a slot whose peer has disconnected: close its iterator,
    /// roll back its batch, then make the slot claimable again.
    fn release_slot(&mut self, slot: usize) {
        if self.iters[slot].take().is_some() {
            log::debug!("[BROKER] slot {slot} iterator closed on clean");
        }
        if let Some(batch) = self.batches[slot].take() {
            batch.rollback();
        }
        self.bank.lock(slot).store(LOCK_FREE, Ordering::Release);
        log::info!("[BROKER] slot {slot} reclaimed");
    }

    /// Final sweep after the last peer leaves. The per-slot invariants
    /// should already hold; this is the backstop for exceptional paths.
    fn teardown(&mut self) {
        for slot in 0..MAX_PEERS {
            self.iters[slot] = None;
            if let Some(batch) = self.batches[slot].take() {
                batch.rollback();
            }
            self.bank.lock(slot).store(LOCK_FREE, Ordering::Release);
        }
        log::info!("[BROKER] all slots released");
    }

    fn dispatch(&mut self, slot: usize) -> Result<Value, String> {
        let raw = self
            .bank
            .read_frame(slot)
            .ok_or("request frame has no terminator")?;
        let req = frame::decode(&raw).map_err(|e| e.to_string())?;

        let method = req
            .get(frame::KEY_METHOD)
            .and_then(Value::as_str)
            .ok_or("request carries no method")?
            .to_string();

        match method.as_str() {
            "put" => {
                let key = str_arg(&req, "key")?;
                let val = req.get("val").cloned().unwrap_or(Value::None);
                self.engine.put(&key, &val).map_err(stringify)?;
                Ok(Value::Bool(true))
            }

            "delete" => {
                let key = str_arg(&req, "key")?;
                self.engine.delete(&key).map_err(stringify)?;
                Ok(Value::Bool(true))
            }

            "get" => {
                let key = str_arg(&req, "key")?;
                let val = self.engine.get(&key).map_err(stringify)?;
                Ok(val.unwrap_or(Value::None))
            }

            "iterator" => {
                if self.iters[slot].is_some() {
                    return Err("Nesting iterators".into());
                }
                let prefix = opt_str_arg(&req, "prefix").unwrap_or_default();
                let reverse = req.get("reverse").and_then(Value::as_bool).unwrap_or(false);
                let seek = opt_str_arg(&req, "seek");
                let iter = self.engine.iter(&prefix, reverse, seek.as_deref());
                // SAFETY: the engine is boxed in self and declared after
                // the session tables, so this session drops before it.
                self.iters[slot] = Some(unsafe { IterSession::new(iter) });
                log::debug!("[BROKER] slot {slot} iterator over {prefix:?} (reverse={reverse})");
                Ok(Value::Bool(true))
            }

            "next" => {
                let entry = match self.iters[slot].as_mut() {
                    Some(iter) => iter.next_entry().map_err(stringify)?,
                    None => return Err("No open iterator".into()),
                };
                match entry {
                    Some((suffix, value)) => {
                        Ok(Value::List(vec![Value::Str(suffix), value]))
                    }
                    None => {
                        // Exhaustion closes the session broker-side.
                        self.iters[slot] = None;
                        Ok(Value::Str(STOP_SENTINEL.to_string()))
                    }
                }
            }

            "close" => {
                self.iters[slot] = None;
                Ok(Value::Bool(true))
            }

            "batch_enter" => {
                if self.batches[slot].is_some() {
                    return Err("Nesting batches".into());
                }
                let batch = self.engine.batch();
                // SAFETY: same engine-outlives-session argument as above.
                self.batches[slot] = Some(unsafe { BatchSession::new(batch) });
                Ok(Value::Bool(true))
            }

            "batch_put" => {
                let key = str_arg(&req, "key")?;
                let val = req.get("val").cloned().unwrap_or(Value::None);
                match self.batches[slot].as_mut() {
                    Some(batch) => batch.put(&key, &val),
                    None => return Err("No open batch".into()),
                }
                Ok(Value::Bool(true))
            }

            "batch_delete" => {
                let key = str_arg(&req, "key")?;
                match self.batches[slot].as_mut() {
                    Some(batch) => batch.delete(&key),
                    None => return Err("No open batch".into()),
                }
                Ok(Value::Bool(true))
            }

            "batch_bump" => {
                let key = str_arg(&req, "key")?;
                match self.batches[slot].as_mut() {
                    Some(batch) => batch.bump(&key),
                    None => return Err("No open batch".into()),
                }
                Ok(Value::Bool(true))
            }

            "batch_exit" => {
                match self.batches[slot].take() {
                    Some(batch) => batch.commit(&self.engine).map_err(stringify)?,
                    None => return Err("No open batch".into()),
                }
                Ok(Value::Bool(true))
            }

            "batch_error" => {
                match self.batches[slot].take() {
                    Some(batch) => batch.rollback(),
                    None => return Err("No open batch".into()),
                }
                Ok(Value::Bool(true))
            }

            "next_id" => {
                let prefix = str_arg(&req, "prefix")?;
                self.next_id(&prefix)
            }

            "stats" => {
                let stats = self.engine.stats().map_err(stringify)?;
                Ok(stats.map_or(Value::None, Value::Str))
            }

            other => Err(format!("Unsupported method: {other:?}")),
        }
    }

    /// Ordered id allocation for a row prefix: one past the largest
    /// stored id, never below the high-water mark of earlier allocations.
    fn next_id(&mut self, prefix: &str) -> Result<Value, String> {
        let mut scanned = 0u64;
        let mut iter = self.engine.iter(prefix, true, None);
        while let Some((suffix, _)) = iter.next_entry().map_err(stringify)? {
            if is_lexo_str(&suffix) {
                let last = LexoKey::parse(&suffix).map_err(stringify)?;
                scanned = last.value() + 1;
                break;
            }
        }
        drop(iter);

        let cached = self.alloc.get(prefix).copied().unwrap_or(0);
        let next = scanned.max(cached);
        if next > LexoKey::MAX.value() {
            return Err(format!("id space exhausted for prefix {prefix:?}"));
        }
        self.alloc.insert(prefix.to_string(), next + 1);
        Ok(Value::Str(LexoKey::new(next).to_string()))
    }
}

fn stringify<E: fmt::Display>(e: E) -> String {
    e.to_string()
}

fn str_arg(req: &Value, name: &str) -> Result<String, String> {
    req.get(name)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| format!("missing string argument {name:?}"))
}

fn opt_str_arg(req: &Value, name: &str) -> Option<String> {
    req.get(name)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}
