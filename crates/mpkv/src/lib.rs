// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # mpkv - multi-process key/value store over a single-writer engine
//!
//! Embedded LSM engines allow exactly one OS process per data directory.
//! mpkv lifts that restriction for cooperating processes on one host: a
//! broker process uniquely owns the engine handle and serves every peer
//! over a fixed-size shared-memory region, and a model layer on top adds
//! ordered ids, secondary indexes and set-algebra selection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mpkv::{Mdb, Value};
//!
//! fn main() -> Result<(), mpkv::MdbError> {
//!     // First client per directory bootstraps the broker.
//!     let db = Mdb::open("/var/lib/myapp/db")?;
//!
//!     db.put("greeting", &Value::from("hello"))?;
//!     assert_eq!(db.get("greeting")?, Some(Value::from("hello")));
//!
//!     for entry in db.iterator("greet", false, None)? {
//!         let (suffix, value) = entry?;
//!         println!("{suffix} = {value}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-----------+   +-----------+          +-----------+
//! | Process A |   | Process B |   ...    | Process N |
//! |  Mdb/Orm  |   |  Mdb/Orm  |          |  Mdb/Orm  |
//! +-----+-----+   +-----+-----+          +-----+-----+
//!       | slot 0        | slot 1               | slot k
//! +-----v---------------v----------------------v-----+
//! |      shared region: lock[] state[] frame[]       |
//! +------------------------+-------------------------+
//!                          | scan / dispatch
//!                 +--------v--------+
//!                 |     broker      |
//!                 |  (maintainer)   |
//!                 +--------+--------+
//!                          |
//!                 +--------v--------+
//!                 |  LSM engine dir |
//!                 +-----------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Mdb`] | Peer-side store facade over one slot |
//! | [`Orm`] | Model layer: insert/update/remove/select |
//! | [`Model`] | Table declaration: fields + index predicates |
//! | [`Record`] | A row: string-keyed mapping with typed helpers |
//! | [`Value`] | The structured value universe and its literal form |
//! | [`LexoKey`] | Fixed-width ordered id |
//!
//! ## Modules Overview
//!
//! - [`client`] - peer API (start here)
//! - [`orm`] - typed models, indexes, selection
//! - [`broker`] - the maintainer loop (runs in `mpkv-broker`)
//! - [`engine`] - KV adapter over the embedded engine
//! - [`transport`] - slot protocol over the shared region
//! - [`shm`] - POSIX shared regions and the bootstrap lock
//! - [`config`] - every build-time constant

/// The maintainer loop: engine ownership, dispatch, slot reclamation.
pub mod broker;
/// Peer-side client: bootstrap, slot calls, iterators, batches.
pub mod client;
/// Build-time constants (slot geometry, naming, engine tuning).
pub mod config;
/// KV engine adapter over RocksDB.
pub mod engine;
/// Fixed-width ordered ids.
pub mod lexokey;
/// Structured values and their reversible textual literal form.
pub mod literal;
/// Typed model layer: records, predicates, selection, caching.
pub mod orm;
/// Named shared regions and the cross-process bootstrap lock.
pub mod shm;
/// Slot arbitration, state protocol, and frame codec.
pub mod transport;

pub use client::{BrokerLaunch, Mdb, MdbBatch, MdbError, MdbIterator};
pub use engine::{Engine, EngineError};
pub use lexokey::LexoKey;
pub use literal::Value;
pub use orm::{
    FieldDefault, FieldSpec, IndexKey, Model, Orm, OrmError, Record, SelectMode, SelectOptions,
};
pub use shm::ShmError;
