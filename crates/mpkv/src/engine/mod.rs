// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! KV engine adapter over RocksDB.
//!
//! The adapter narrows the engine to the contract the broker needs:
//! string keys, values serialized as textual literals, ordered prefix
//! iteration with seek, and all-or-nothing write batches. RocksDB holds
//! an OS lock on its directory, so a second open from another process
//! fails; that single-writer property is why the broker exists at all.
//!
//! A single mutex serializes in-process access to the handle: the DB
//! itself tolerates concurrent readers, but iterators and batches do
//! not, and the broker interleaves all three.
//!
//! # Seek Semantics
//!
//! `iter(prefix, reverse, seek)` yields `(suffix, value)` pairs whose
//! full key starts with `prefix`:
//!
//! - forward: first key >= `prefix + seek`, walking up
//! - reverse: first key <= `prefix + seek`, walking down
//!
//! A seek landing outside the prefix range yields nothing; keys are
//! sorted, so once the prefix no longer matches the range is exhausted.

use crate::config::{ENGINE_BLOCK_SIZE, ENGINE_PARANOID_CHECKS, ENGINE_WRITE_BUFFER_SIZE};
use crate::literal::{LiteralError, Value};
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, DBCompressionType, DBRawIteratorWithThreadMode, Options, WriteBatch, DB,
};
use std::fmt;

/// Errors from the engine adapter.
#[derive(Debug)]
pub enum EngineError {
    /// Opening the engine directory failed (commonly: another process
    /// already owns it).
    Open {
        /// Engine directory.
        path: String,
        /// Underlying engine error.
        source: rocksdb::Error,
    },

    /// A read or write against the open handle failed.
    Io(rocksdb::Error),

    /// An atomic write batch failed to apply; none of its operations
    /// took effect.
    Batch(rocksdb::Error),

    /// A stored value does not parse as a textual literal.
    Corruption {
        /// The key whose value is corrupt.
        key: String,
        /// Why the literal parser rejected it.
        source: LiteralError,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { path, source } => write!(f, "cannot open engine at {path}: {source}"),
            Self::Io(e) => write!(f, "engine operation failed: {e}"),
            Self::Batch(e) => write!(f, "write batch failed to apply: {e}"),
            Self::Corruption { key, source } => {
                write!(f, "invalid value for key {key:?}: {source}")
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } => Some(source),
            Self::Io(e) | Self::Batch(e) => Some(e),
            Self::Corruption { source, .. } => Some(source),
        }
    }
}

impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        Self::Io(e)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The open engine handle.
pub struct Engine {
    db: DB,
    path: String,
    /// Serializes handle access; iterators and batches are not
    /// thread-safe even though the DB is.
    lock: Mutex<()>,
}

impl Engine {
    /// Open (creating if missing) the engine under `path` with the
    /// build-time tuning constants.
    pub fn open(path: &str) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(DBCompressionType::Snappy);
        opts.set_paranoid_checks(ENGINE_PARANOID_CHECKS);
        opts.set_write_buffer_size(ENGINE_WRITE_BUFFER_SIZE);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_size(ENGINE_BLOCK_SIZE);
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open(&opts, path).map_err(|source| EngineError::Open {
            path: path.to_string(),
            source,
        })?;

        log::info!("[ENGINE] opened {path}");

        Ok(Self {
            db,
            path: path.to_string(),
            lock: Mutex::new(()),
        })
    }

    /// Engine directory path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read and decode a value; `None` for absent keys.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw = {
            let _g = self.lock.lock();
            self.db.get(key.as_bytes())?
        };
        match raw {
            None => Ok(None),
            Some(bytes) => decode_value(key, &bytes).map(Some),
        }
    }

    /// Encode and store a value.
    pub fn put(&self, key: &str, val: &Value) -> Result<()> {
        let _g = self.lock.lock();
        self.db.put(key.as_bytes(), val.format().as_bytes())?;
        Ok(())
    }

    /// Delete a key; absence is not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        let _g = self.lock.lock();
        self.db.delete(key.as_bytes())?;
        Ok(())
    }

    /// Open a prefix iterator. See the module docs for seek semantics.
    #[must_use]
    pub fn iter<'a>(&'a self, prefix: &str, reverse: bool, seek: Option<&str>) -> EngineIter<'a> {
        let _g = self.lock.lock();
        let mut inner = self.db.raw_iterator();
        let prefix_bytes = prefix.as_bytes().to_vec();

        if reverse {
            match seek {
                Some(s) => {
                    inner.seek_for_prev([prefix.as_bytes(), s.as_bytes()].concat());
                }
                None => match prefix_successor(&prefix_bytes) {
                    Some(succ) => {
                        inner.seek_for_prev(&succ);
                        // seek_for_prev gives the last key <= succ; if the
                        // successor itself exists, step below it.
                        if inner.valid() && inner.key() == Some(&succ[..]) {
                            inner.prev();
                        }
                    }
                    None => inner.seek_to_last(),
                },
            }
        } else {
            match seek {
                Some(s) => inner.seek([prefix.as_bytes(), s.as_bytes()].concat()),
                None => inner.seek(&prefix_bytes),
            }
        }

        EngineIter {
            engine: self,
            inner,
            prefix: prefix_bytes,
            reverse,
            done: false,
        }
    }

    /// Start an atomic write batch. Nothing is visible until `commit`;
    /// dropping the batch discards it.
    #[must_use]
    pub fn batch(&self) -> EngineBatch<'_> {
        EngineBatch {
            engine: self,
            batch: WriteBatch::default(),
        }
    }

    /// Engine statistics text, if the engine exposes it.
    pub fn stats(&self) -> Result<Option<String>> {
        let _g = self.lock.lock();
        Ok(self.db.property_value("rocksdb.stats")?)
    }
}

fn decode_value(key: &str, bytes: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(bytes).map_err(|_| EngineError::Corruption {
        key: key.to_string(),
        source: LiteralError::UnexpectedEnd,
    })?;
    Value::parse(text).map_err(|source| EngineError::Corruption {
        key: key.to_string(),
        source,
    })
}

/// Smallest byte string greater than every string with this prefix, or
/// `None` when the prefix is all `0xff`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut succ = prefix.to_vec();
    while let Some(&last) = succ.last() {
        if last == 0xff {
            succ.pop();
        } else {
            *succ.last_mut().expect("non-empty") = last + 1;
            return Some(succ);
        }
    }
    None
}

/// Ordered prefix iterator yielding `(suffix, value)` pairs.
pub struct EngineIter<'a> {
    engine: &'a Engine,
    inner: DBRawIteratorWithThreadMode<'a, DB>,
    prefix: Vec<u8>,
    reverse: bool,
    done: bool,
}

impl EngineIter<'_> {
    /// Advance and return the next entry within the prefix, or `None`
    /// when the range is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<(String, Value)>> {
        let _g = self.engine.lock.lock();

        if self.done {
            return Ok(None);
        }
        if !self.inner.valid() {
            self.done = true;
            return Ok(None);
        }

        let key = self.inner.key().unwrap_or_default();
        if !key.starts_with(&self.prefix) {
            // Seek may land outside the prefix; keys are ordered, so the
            // range is over.
            self.done = true;
            return Ok(None);
        }

        let key_text = String::from_utf8_lossy(key).into_owned();
        let suffix = key_text[self.prefix.len()..].to_string();
        let raw = self.inner.value().unwrap_or_default();
        let value = decode_value(&key_text, raw)?;

        if self.reverse {
            self.inner.prev();
        } else {
            self.inner.next();
        }

        Ok(Some((suffix, value)))
    }
}

/// Scoped atomic write batch.
pub struct EngineBatch<'a> {
    engine: &'a Engine,
    batch: WriteBatch,
}

impl EngineBatch<'_> {
    /// Queue a put.
    pub fn put(&mut self, key: &str, val: &Value) {
        self.batch.put(key.as_bytes(), val.format().as_bytes());
    }

    /// Queue a delete.
    pub fn delete(&mut self, key: &str) {
        self.batch.delete(key.as_bytes());
    }

    /// Apply every queued operation atomically.
    pub fn commit(self) -> Result<()> {
        let _g = self.engine.lock.lock();
        self.engine.db.write(self.batch).map_err(EngineError::Batch)?;
        Ok(())
    }
}
