// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer-side client: the store facade over one slot.
//!
//! An [`Mdb`] owns exactly one slot of the broker's shared region for
//! its whole lifetime and serializes every call onto it. The first
//! client for an engine directory bootstraps the broker (by default as
//! a spawned `mpkv-broker` process; tests run it on a thread), later
//! clients attach to the existing region. One client per path per
//! process: [`Mdb::open`] hands out the registered instance.
//!
//! Threading: a reentrant mutex guards the slot. Cross-thread callers
//! exclude each other; the thread holding an iterator or batch session
//! may still issue single-shot calls between session steps (the broker
//! handles one frame at a time per slot, so interleaving single-shot
//! calls into an open session is well-defined - the ORM's select relies
//! on it to load rows while walking an index).

mod batch;
mod iterator;

pub use batch::MdbBatch;
pub use iterator::MdbIterator;

use crate::broker;
use crate::config::{self, region_size, BOOTSTRAP_TIMEOUT, MAX_PEERS, TICK};
use crate::lexokey::LexoKey;
use crate::literal::Value;
use crate::shm::{SharedRegion, ShmError, SysLock};
use crate::transport::frame::{self, FrameError};
use crate::transport::{SlotBank, LOCK_CLEAN, LOCK_FREE, LOCK_HELD, STATE_IDLE, STATE_REQUEST, STATE_RESPONSE};
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::fmt;
use std::io;
use std::process::{Command, Stdio};
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Instant;

/// Client-side failures.
#[derive(Debug)]
pub enum MdbError {
    /// The slot lock left HELD during a call; this client is done for.
    Disconnected,

    /// Encoded request exceeds the slot frame; nothing was sent.
    BufferTooSmall {
        /// Encoded size including the terminator.
        size: usize,
    },

    /// No free slot and the client was configured not to wait.
    Exhausted,

    /// The broker answered with an error.
    Remote(String),

    /// A reply violated the frame protocol.
    Protocol(String),

    /// Frame decode failure.
    Frame(FrameError),

    /// Shared-region failure during bootstrap.
    Shm(ShmError),

    /// The broker process could not be spawned.
    Spawn(io::Error),

    /// A spawned broker never published the shared region.
    BrokerUnreachable(String),
}

impl fmt::Display for MdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "slot released; client is disconnected"),
            Self::BufferTooSmall { size } => {
                write!(f, "request frame of {size} bytes exceeds slot capacity")
            }
            Self::Exhausted => write!(f, "no free slot available"),
            Self::Remote(text) => write!(f, "broker error: {text}"),
            Self::Protocol(text) => write!(f, "protocol violation: {text}"),
            Self::Frame(e) => write!(f, "frame error: {e}"),
            Self::Shm(e) => write!(f, "shared region error: {e}"),
            Self::Spawn(e) => write!(f, "cannot spawn broker: {e}"),
            Self::BrokerUnreachable(name) => {
                write!(f, "broker region {name} never appeared")
            }
        }
    }
}

impl std::error::Error for MdbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Frame(e) => Some(e),
            Self::Shm(e) => Some(e),
            Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShmError> for MdbError {
    fn from(e: ShmError) -> Self {
        Self::Shm(e)
    }
}

impl From<FrameError> for MdbError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::BufferTooSmall { size } => Self::BufferTooSmall { size },
            other => Self::Frame(other),
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, MdbError>;

/// How the first client for a path brings the broker up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerLaunch {
    /// Spawn the `mpkv-broker` binary (resolved through the
    /// `MPKV_BROKER_BIN` environment variable, then next to the current
    /// executable, then `$PATH`).
    Process,
    /// Run the maintainer loop on a thread of this process. Intended for
    /// tests and single-process tools; the engine still has exactly one
    /// owning process.
    Thread,
}

/// Configures and connects an [`Mdb`].
pub struct MdbBuilder {
    path: String,
    launch: BrokerLaunch,
    block_on_full: bool,
}

impl MdbBuilder {
    /// Broker launch mode for the case where no broker is running.
    #[must_use]
    pub fn launch(mut self, launch: BrokerLaunch) -> Self {
        self.launch = launch;
        self
    }

    /// Fail with [`MdbError::Exhausted`] instead of waiting when all
    /// slots are taken.
    #[must_use]
    pub fn nonblocking(mut self) -> Self {
        self.block_on_full = false;
        self
    }

    /// Attach to (or bootstrap) the broker and claim a slot.
    pub fn connect(self) -> Result<Arc<Mdb>> {
        // One connect at a time process-wide keeps the registry
        // single-client-per-path.
        static CONNECT: Mutex<()> = Mutex::new(());
        let _g = CONNECT.lock();

        if let Some(existing) = registry().get(&self.path).and_then(|w| w.upgrade()) {
            return Ok(existing);
        }

        let client = Arc::new(Mdb::connect_inner(&self.path, self.launch, self.block_on_full)?);
        registry().insert(self.path.clone(), Arc::downgrade(&client));
        Ok(client)
    }
}

fn registry() -> &'static DashMap<String, Weak<Mdb>> {
    static REGISTRY: OnceLock<DashMap<String, Weak<Mdb>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// A connected peer: one slot on one broker.
pub struct Mdb {
    bank: SlotBank,
    slot: usize,
    path: String,
    /// Serializes slot access; reentrant so a session holder can issue
    /// nested single-shot calls.
    plock: ReentrantMutex<()>,
}

impl Mdb {
    /// Connect to the store at `path` with default options.
    pub fn open(path: &str) -> Result<Arc<Self>> {
        Self::builder(path).connect()
    }

    /// Start configuring a connection.
    #[must_use]
    pub fn builder(path: &str) -> MdbBuilder {
        MdbBuilder {
            path: path.to_string(),
            launch: BrokerLaunch::Process,
            block_on_full: true,
        }
    }

    fn connect_inner(path: &str, launch: BrokerLaunch, block_on_full: bool) -> Result<Self> {
        let region_name = config::region_name(path);
        let lock_name = config::syslock_name(path);

        // All arbitration happens under the SysLock: attach-or-spawn and
        // the slot claim, so concurrent peers linearize here.
        let _sys = SysLock::acquire(&lock_name)?;

        let bank = match SharedRegion::attach(&region_name, region_size()) {
            Ok(region) => SlotBank::new(region),
            Err(ShmError::NotFound(_)) => {
                spawn_broker(path, launch)?;
                wait_for_region(&region_name)?
            }
            Err(e) => return Err(e.into()),
        };

        let slot = loop {
            let free = (0..MAX_PEERS).find(|&i| {
                bank.lock(i)
                    .compare_exchange(LOCK_FREE, LOCK_HELD, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            });
            match free {
                Some(i) => break i,
                // The broker may CLEAN a slot at any time; rescan.
                None if block_on_full => thread::sleep(TICK),
                None => return Err(MdbError::Exhausted),
            }
        };

        log::info!("[MDB] {path}: captured slot {slot}");

        Ok(Self {
            bank,
            slot,
            path: path.to_string(),
            plock: ReentrantMutex::new(()),
        })
    }

    /// Engine directory this client talks to.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Store a value.
    pub fn put(&self, key: &str, val: &Value) -> Result<()> {
        let _g = self.plock.lock();
        self.call(
            frame::request("put", [("key", Value::from(key)), ("val", val.clone())]),
            true,
        )?;
        Ok(())
    }

    /// Fetch a value; `None` for absent keys.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let _g = self.plock.lock();
        let result = self.call(frame::request("get", [("key", Value::from(key))]), true)?;
        Ok(match result {
            Value::None => None,
            v => Some(v),
        })
    }

    /// Delete a key; absence is not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        let _g = self.plock.lock();
        self.call(frame::request("delete", [("key", Value::from(key))]), true)?;
        Ok(())
    }

    /// Open a lazy prefix iterator over the broker's engine.
    ///
    /// The iterator keeps the slot for its whole lifetime and sends the
    /// terminal `close` even when dropped early.
    pub fn iterator<'a>(
        &'a self,
        prefix: &str,
        reverse: bool,
        seek: Option<&str>,
    ) -> Result<MdbIterator<'a>> {
        let guard = self.plock.lock();
        self.call(
            frame::request(
                "iterator",
                [
                    ("prefix", Value::from(prefix)),
                    ("reverse", Value::Bool(reverse)),
                    ("seek", seek.map_or(Value::None, Value::from)),
                ],
            ),
            false,
        )?;
        Ok(MdbIterator::new(self, guard))
    }

    /// Open an atomic write batch.
    ///
    /// Everything queued through the returned guard commits together on
    /// [`MdbBatch::commit`]; dropping the guard without committing rolls
    /// the whole batch back.
    pub fn write_batch(&self) -> Result<MdbBatch<'_>> {
        let guard = self.plock.lock();
        self.call(frame::request("batch_enter", []), false)?;
        Ok(MdbBatch::new(self, guard))
    }

    /// Allocate the next ordered id under a row prefix.
    pub fn next_id(&self, prefix: &str) -> Result<LexoKey> {
        let _g = self.plock.lock();
        let result = self.call(
            frame::request("next_id", [("prefix", Value::from(prefix))]),
            true,
        )?;
        let text = result
            .as_str()
            .ok_or_else(|| MdbError::Protocol("next_id reply is not a string".into()))?;
        LexoKey::parse(text).map_err(|e| MdbError::Protocol(e.to_string()))
    }

    /// Engine statistics text, if available.
    pub fn stats(&self) -> Result<Option<String>> {
        let _g = self.plock.lock();
        let result = self.call(frame::request("stats", []), true)?;
        Ok(match result {
            Value::Str(s) => Some(s),
            _ => None,
        })
    }

    /// Hold the slot lock for a composite operation (several calls that
    /// must not interleave with other threads).
    #[must_use]
    pub fn lock_session(&self) -> ReentrantMutexGuard<'_, ()> {
        self.plock.lock()
    }

    /// One request/response cycle on this client's slot. Callers hold
    /// `plock`. `idle` releases the slot state afterwards; sessions pass
    /// `false` to keep it.
    pub(crate) fn call(&self, request: Value, idle: bool) -> Result<Value> {
        let lock = self.bank.lock(self.slot);
        if lock.load(Ordering::Acquire) != LOCK_HELD {
            return Err(MdbError::Disconnected);
        }

        let encoded = frame::encode(&request)?;
        self.bank.write_frame(self.slot, &encoded);
        self.bank
            .state(self.slot)
            .store(STATE_REQUEST, Ordering::Release);

        loop {
            if lock.load(Ordering::Acquire) != LOCK_HELD {
                return Err(MdbError::Disconnected);
            }
            if self.bank.state(self.slot).load(Ordering::Acquire) == STATE_RESPONSE {
                break;
            }
            thread::sleep(TICK);
        }

        let raw = self
            .bank
            .read_frame(self.slot)
            .ok_or_else(|| MdbError::Protocol("reply frame has no terminator".into()))?;
        let reply = frame::decode(&raw)?;

        if idle {
            self.bank
                .state(self.slot)
                .store(STATE_IDLE, Ordering::Release);
        }

        if let Some(text) = reply.get(frame::KEY_ERROR).and_then(Value::as_str) {
            return Err(MdbError::Remote(text.to_string()));
        }
        reply
            .get(frame::KEY_RESULT)
            .cloned()
            .ok_or_else(|| MdbError::Protocol("reply carries no result".into()))
    }
}

impl Drop for Mdb {
    fn drop(&mut self) {
        // CLEAN tells the broker to tear down any session this slot still
        // owns before making it claimable again.
        self.bank
            .lock(self.slot)
            .store(LOCK_CLEAN, Ordering::Release);
        log::info!("[MDB] {}: released slot {}", self.path, self.slot);
    }
}

fn spawn_broker(path: &str, launch: BrokerLaunch) -> Result<()> {
    match launch {
        BrokerLaunch::Thread => {
            let path = path.to_string();
            thread::Builder::new()
                .name("mpkv-broker".into())
                .spawn(move || {
                    if let Err(e) = broker::run(&path) {
                        log::error!("[BROKER] {path}: {e}");
                    }
                })
                .map_err(MdbError::Spawn)?;
            Ok(())
        }
        BrokerLaunch::Process => {
            let mut cmd = broker_command();
            cmd.arg("--db")
                .arg(path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            // The child outlives this handle; the broker exits on its own
            // once the last peer releases its slot.
            cmd.spawn().map(|_| ()).map_err(MdbError::Spawn)
        }
    }
}

fn broker_command() -> Command {
    if let Ok(bin) = std::env::var("MPKV_BROKER_BIN") {
        return Command::new(bin);
    }
    if let Ok(exe) = std::env::current_exe() {
        let sibling = exe.with_file_name("mpkv-broker");
        if sibling.exists() {
            return Command::new(sibling);
        }
    }
    Command::new("mpkv-broker")
}

fn wait_for_region(region_name: &str) -> Result<SlotBank> {
    let deadline = Instant::now() + BOOTSTRAP_TIMEOUT;
    loop {
        thread::sleep(TICK);
        match SharedRegion::attach(region_name, region_size()) {
            Ok(region) => return Ok(SlotBank::new(region)),
            Err(ShmError::NotFound(_)) if Instant::now() < deadline => {}
            Err(ShmError::NotFound(_)) => {
                return Err(MdbError::BrokerUnreachable(region_name.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
    }
}
