// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed model layer over the client: ordered ids, secondary indexes,
//! set-algebra selection, and a bounded result cache.
//!
//! # Key Namespaces
//!
//! For a model table `T`, three lexicographically disjoint namespaces
//! share the table-name prefix (their exact shape is the on-disk format
//! and must not change):
//!
//! ```text
//! T.<lexid>            row: the record mapping, in insertion order
//! Ts.<ckey>.<lexid>    index: value is the predicate SOURCE that
//!                      produced ckey (or the verbatim key itself)
//! T#wcount             meta: monotone write counter, the change token
//! ```
//!
//! Persisting the predicate source is what makes updates and removals
//! self-contained: old index entries are re-derived from `Ts.*` values,
//! not from whatever predicates the current build declares.
//!
//! Both shared counters live broker-side: ids come from the broker's
//! `next_id` and `T#wcount` is incremented by the batch commit itself
//! (`batch_bump`), never by a peer-observed value written back later -
//! peers interleave freely between any two of a client's calls, so a
//! client-side read-then-write would lose increments.
//!
//! # Selection
//!
//! [`Orm::select`] walks one index range per requested ckey (ckey-major
//! order), deduplicates ids across ranges, and either unions rows or
//! intersects them (a row qualifies when its stored `ckeys` contain every
//! requested key). `seek` is inclusive in both directions; pagination
//! advances it to `last_id - 1` (reverse) or `last_id + 1` (forward).
//! Results are cached per table until the table's `wcount` moves.

pub mod expr;
pub mod model;

pub use expr::{Expr, ExprError, IndexKey, EVAL_ERROR_CKEY, WILDCARD};
pub use model::{FieldDefault, FieldSpec, Model, ModelError, Record};

use crate::client::{Mdb, MdbError};
use crate::config::SELECT_CACHE_CAP;
use crate::lexokey::{is_lexo_str, LexoKey};
use crate::literal::Value;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// ORM-level failures.
#[derive(Debug)]
pub enum OrmError {
    /// Update with an absent or unparseable id.
    RefError {
        /// The id rendering that failed to parse.
        id: String,
    },

    /// Update against a row that does not exist.
    NotFound {
        /// The id of the missing row.
        id: String,
    },

    /// An index predicate source was rejected.
    ConfigError {
        /// The offending source text.
        source: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Record construction failure.
    Model(ModelError),

    /// Transport/broker failure underneath.
    Mdb(MdbError),
}

impl fmt::Display for OrmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RefError { id } => write!(f, "update with invalid id {id:?}"),
            Self::NotFound { id } => write!(f, "updating non-existing row with id {id:?}"),
            Self::ConfigError { source, reason } => {
                write!(f, "index key {source:?} is not a pure expression: {reason}")
            }
            Self::Model(e) => write!(f, "{e}"),
            Self::Mdb(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for OrmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Model(e) => Some(e),
            Self::Mdb(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MdbError> for OrmError {
    fn from(e: MdbError) -> Self {
        Self::Mdb(e)
    }
}

impl From<ModelError> for OrmError {
    fn from(e: ModelError) -> Self {
        Self::Model(e)
    }
}

/// Result type for ORM operations.
pub type Result<T> = std::result::Result<T, OrmError>;

/// Set algebra applied across the requested ckeys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectMode {
    /// Rows whose stored ckeys contain every requested key.
    Inter,
    /// Rows reached through any requested key.
    Union,
}

/// Options for [`Orm::select`]; the defaults mirror "newest first,
/// intersection over the wildcard index".
#[derive(Debug, Clone)]
pub struct SelectOptions {
    /// Walk ids descending when true (default).
    pub reverse: bool,
    /// Set algebra across ckeys (default: intersection).
    pub mode: SelectMode,
    /// Requested index keys (default: the wildcard).
    pub ckeys: Vec<String>,
    /// Inclusive id bound to start from.
    pub seek: Option<LexoKey>,
    /// Maximum rows returned.
    pub limit: Option<usize>,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            reverse: true,
            mode: SelectMode::Inter,
            ckeys: vec![WILDCARD.to_string()],
            seek: None,
            limit: None,
        }
    }
}

impl SelectOptions {
    /// Defaults: reverse, intersection, wildcard, no seek, no limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk ids ascending.
    #[must_use]
    pub fn forward(mut self) -> Self {
        self.reverse = false;
        self
    }

    /// Union instead of intersection.
    #[must_use]
    pub fn union(mut self) -> Self {
        self.mode = SelectMode::Union;
        self
    }

    /// Replace the requested ckeys.
    #[must_use]
    pub fn ckeys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ckeys = keys.into_iter().map(Into::into).collect();
        if self.ckeys.is_empty() {
            self.ckeys.push(WILDCARD.to_string());
        }
        self
    }

    /// Start from this id (inclusive, in the iteration direction).
    #[must_use]
    pub fn seek(mut self, id: LexoKey) -> Self {
        self.seek = Some(id);
        self
    }

    /// Cap the number of returned rows.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SelectKey {
    reverse: bool,
    mode: SelectMode,
    ckeys: Vec<String>,
    seek: Option<String>,
    limit: Option<usize>,
}

struct CacheEntry {
    wcount: i64,
    rows: Arc<Vec<Record>>,
}

/// The model store: a client plus index/id/caching discipline.
pub struct Orm {
    mdb: Arc<Mdb>,
    caches: Mutex<HashMap<String, LruCache<SelectKey, CacheEntry>>>,
}

impl Orm {
    /// Wrap a connected client.
    #[must_use]
    pub fn new(mdb: Arc<Mdb>) -> Self {
        Self {
            mdb,
            caches: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to the store at `path` with default options.
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(Mdb::open(path)?))
    }

    /// The underlying client.
    #[must_use]
    pub fn mdb(&self) -> &Arc<Mdb> {
        &self.mdb
    }

    /// Insert a record: allocate its id, materialize its indexes, and
    /// write everything in one batch. The record's `id` and `ckeys` are
    /// filled in place; a caller-supplied `ckeys` is discarded.
    pub fn insert<M: Model>(&self, rec: &mut Record) -> Result<LexoKey> {
        let table = M::TABLE;
        let compiled = compile_index_keys::<M>()?;

        let _session = self.mdb.lock_session();

        let id = self.mdb.next_id(&row_prefix(table))?;
        rec.remove(model::FIELD_CKEYS);
        rec.set_id(id);

        let (ckeys, ikeys) = materialize(&compiled, &rec.to_value());
        rec.set_ckeys(&ckeys);

        let batch = self.mdb.write_batch()?;
        for (ckey, ikey) in ckeys.iter().zip(&ikeys) {
            batch.put(&index_key(table, ckey, id), &Value::Str(ikey.clone()))?;
        }
        batch.put(&row_key(table, id), &rec.to_value())?;
        batch.bump(&wcount_key(table))?;
        batch.commit()?;

        self.invalidate(table);
        log::debug!("[ORM] {table}: inserted {id}");
        Ok(id)
    }

    /// Update a row under its existing id: merge new fields over stored
    /// ones (new wins), re-derive every index entry from the persisted
    /// predicate sources, and swap old entries for new in one batch. The
    /// record is synced to the merged row in place.
    pub fn update<M: Model>(&self, rec: &mut Record) -> Result<()> {
        let table = M::TABLE;

        let _session = self.mdb.lock_session();

        let id = rec.id().ok_or_else(|| OrmError::RefError {
            id: rec
                .get(model::FIELD_ID)
                .map(Value::format)
                .unwrap_or_default(),
        })?;
        rec.remove(model::FIELD_CKEYS);

        let stored = match self.mdb.get(&row_key(table, id))? {
            Some(v) => Record::from_value(v)?,
            None => {
                return Err(OrmError::NotFound {
                    id: id.to_string(),
                })
            }
        };
        let old_ckeys = stored.ckeys();

        // How the old entries were computed, straight from the store.
        let mut sources: Vec<String> = Vec::new();
        for ckey in &old_ckeys {
            if let Some(Value::Str(src)) = self.mdb.get(&index_key(table, ckey, id))? {
                if !sources.contains(&src) {
                    sources.push(src);
                }
            }
        }

        let mut merged = stored;
        merged.merge_from(rec);

        let compiled = reparse_sources(sources);
        let (ckeys, ikeys) = materialize(&compiled, &merged.to_value());
        merged.set_ckeys(&ckeys);

        let batch = self.mdb.write_batch()?;
        for old_ckey in &old_ckeys {
            batch.delete(&index_key(table, old_ckey, id))?;
        }
        for (ckey, ikey) in ckeys.iter().zip(&ikeys) {
            batch.put(&index_key(table, ckey, id), &Value::Str(ikey.clone()))?;
        }
        batch.put(&row_key(table, id), &merged.to_value())?;
        batch.bump(&wcount_key(table))?;
        batch.commit()?;

        self.invalidate(table);
        *rec = merged;
        log::debug!("[ORM] {table}: updated {id}");
        Ok(())
    }

    /// Remove a row and all of its index entries. Idempotent: absent
    /// rows and unparseable ids are a no-op, and `wcount` only moves
    /// when something was actually deleted.
    pub fn remove<M: Model>(&self, rec: &Record) -> Result<()> {
        let table = M::TABLE;

        let _session = self.mdb.lock_session();

        let Some(id) = rec.id() else {
            return Ok(());
        };

        let stored = match self.mdb.get(&row_key(table, id))? {
            Some(v) => Record::from_value(v)?,
            None => return Ok(()),
        };

        let batch = self.mdb.write_batch()?;
        for ckey in stored.ckeys() {
            batch.delete(&index_key(table, &ckey, id))?;
        }
        batch.delete(&row_key(table, id))?;
        batch.bump(&wcount_key(table))?;
        batch.commit()?;

        self.invalidate(table);
        log::debug!("[ORM] {table}: removed {id}");
        Ok(())
    }

    /// Select rows through the index. See the module docs for order,
    /// seek, and caching semantics. The returned list is shared: a cache
    /// hit is the same `Arc` as the previous identical call.
    pub fn select<M: Model>(&self, opts: SelectOptions) -> Result<Arc<Vec<Record>>> {
        self.select_table(M::TABLE, opts)
    }

    fn select_table(&self, table: &str, opts: SelectOptions) -> Result<Arc<Vec<Record>>> {
        if opts.limit == Some(0) {
            return Ok(Arc::new(Vec::new()));
        }

        let _session = self.mdb.lock_session();

        let seek_str = opts.seek.map(|k| k.to_string());
        let current_wcount = self.wcount_value(table)?;
        let cache_key = SelectKey {
            reverse: opts.reverse,
            mode: opts.mode,
            ckeys: opts.ckeys.clone(),
            seek: seek_str.clone(),
            limit: opts.limit,
        };

        {
            let mut caches = self.caches.lock();
            if let Some(cache) = caches.get_mut(table) {
                if let Some(entry) = cache.get(&cache_key) {
                    if entry.wcount == current_wcount {
                        return Ok(Arc::clone(&entry.rows));
                    }
                }
            }
        }

        let limit = opts.limit.unwrap_or(usize::MAX);
        let mut seen: HashSet<String> = HashSet::new();
        let mut rows: Vec<Record> = Vec::new();

        'scan: for ckey in &opts.ckeys {
            let prefix = index_prefix(table, ckey);
            let iter = self
                .mdb
                .iterator(&prefix, opts.reverse, seek_str.as_deref())?;
            for entry in iter {
                let (suffix, _source) = entry?;
                if !seen.insert(suffix.clone()) {
                    continue;
                }
                if !is_lexo_str(&suffix) {
                    continue;
                }

                let Some(row_val) = self.mdb.get(&format!("{}{suffix}", row_prefix(table)))?
                else {
                    continue;
                };
                let row = Record::from_value(row_val)?;

                match opts.mode {
                    SelectMode::Union => {
                        rows.push(row);
                    }
                    SelectMode::Inter => {
                        let stored = row.ckeys();
                        if opts.ckeys.iter().all(|k| stored.contains(k)) {
                            rows.push(row);
                        } else {
                            continue;
                        }
                    }
                }
                if rows.len() >= limit {
                    break 'scan;
                }
            }
        }

        let rows = Arc::new(rows);
        let mut caches = self.caches.lock();
        caches
            .entry(table.to_string())
            .or_insert_with(|| {
                LruCache::new(NonZeroUsize::new(SELECT_CACHE_CAP).expect("non-zero cap"))
            })
            .put(
                cache_key,
                CacheEntry {
                    wcount: current_wcount,
                    rows: Arc::clone(&rows),
                },
            );
        Ok(rows)
    }

    /// Fetch exactly the row with this id, or `None`.
    pub fn getrow<M: Model>(&self, id: LexoKey) -> Result<Option<Record>> {
        let rows = self.select::<M>(SelectOptions::new().seek(id).limit(1))?;
        Ok(rows
            .first()
            .filter(|r| r.id() == Some(id))
            .cloned())
    }

    /// The table's write counter.
    pub fn wcount<M: Model>(&self) -> Result<i64> {
        self.wcount_value(M::TABLE)
    }

    fn wcount_value(&self, table: &str) -> Result<i64> {
        Ok(self
            .mdb
            .get(&wcount_key(table))?
            .and_then(|v| v.as_int())
            .unwrap_or(0))
    }

    fn invalidate(&self, table: &str) {
        self.caches.lock().remove(table);
    }
}

fn row_prefix(table: &str) -> String {
    format!("{table}.")
}

fn row_key(table: &str, id: LexoKey) -> String {
    format!("{table}.{id}")
}

fn index_prefix(table: &str, ckey: &str) -> String {
    format!("{table}s.{ckey}.")
}

fn index_key(table: &str, ckey: &str, id: LexoKey) -> String {
    format!("{table}s.{ckey}.{id}")
}

fn wcount_key(table: &str) -> String {
    format!("{table}#wcount")
}

/// Validate a model's declared index keys, prepending the wildcard.
fn compile_index_keys<M: Model>() -> Result<Vec<(String, Option<Expr>)>> {
    let mut compiled: Vec<(String, Option<Expr>)> = vec![(WILDCARD.to_string(), None)];
    for key in M::index_keys() {
        let source = key.source().to_string();
        if compiled.iter().any(|(s, _)| *s == source) {
            continue;
        }
        match key {
            IndexKey::Expr(_) => {
                let expr = Expr::parse(&source).map_err(|e| OrmError::ConfigError {
                    source: source.clone(),
                    reason: e.to_string(),
                })?;
                compiled.push((source, Some(expr)));
            }
            IndexKey::Literal(_) => {
                // A literal that parses as an expression would be
                // re-derived as one later; refuse the ambiguity now.
                if Expr::parse(&source).is_ok() {
                    return Err(OrmError::ConfigError {
                        source,
                        reason: "literal index key parses as an expression; declare it as Expr"
                            .to_string(),
                    });
                }
                compiled.push((source, None));
            }
        }
    }
    Ok(compiled)
}

/// Persisted sources self-describe: parse-as-expression wins, anything
/// else stays a verbatim key.
fn reparse_sources(sources: Vec<String>) -> Vec<(String, Option<Expr>)> {
    sources
        .into_iter()
        .map(|source| {
            let expr = Expr::parse(&source).ok();
            (source, expr)
        })
        .collect()
}

/// Evaluate compiled predicates against a record: `(ckeys, ikeys)`.
///
/// Evaluation failures index the sentinel instead of dropping the entry,
/// so the record can always be un-indexed later.
fn materialize(
    compiled: &[(String, Option<Expr>)],
    record: &Value,
) -> (Vec<String>, Vec<String>) {
    let mut ckeys = Vec::with_capacity(compiled.len());
    let mut ikeys = Vec::with_capacity(compiled.len());
    for (source, expr) in compiled {
        let ckey = match expr {
            Some(e) => e.eval(record).unwrap_or_else(|why| {
                log::warn!("[ORM] predicate {source:?} failed: {why}");
                EVAL_ERROR_CKEY.to_string()
            }),
            None => source.clone(),
        };
        ckeys.push(ckey);
        ikeys.push(source.clone());
    }
    (ckeys, ikeys)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl Model for Plain {
        const TABLE: &'static str = "Plain";

        fn fields() -> Vec<FieldSpec> {
            vec![FieldSpec::required("uid")]
        }

        fn index_keys() -> Vec<IndexKey> {
            vec![IndexKey::Expr("'uid=' + m.uid")]
        }
    }

    struct BadLiteral;

    impl Model for BadLiteral {
        const TABLE: &'static str = "BadLiteral";

        fn fields() -> Vec<FieldSpec> {
            Vec::new()
        }

        fn index_keys() -> Vec<IndexKey> {
            vec![IndexKey::Literal("m.uid")]
        }
    }

    #[test]
    fn test_namespace_keys_are_disjoint_and_exact() {
        let id = LexoKey::new(7);
        assert_eq!(row_key("User", id), "User.0000000000000007");
        assert_eq!(
            index_key("User", "uid=42", id),
            "Users.uid=42.0000000000000007"
        );
        assert_eq!(wcount_key("User"), "User#wcount");
        assert!(!index_prefix("User", "x").starts_with(&row_prefix("User")));
    }

    #[test]
    fn test_compile_adds_wildcard_first() {
        let compiled = compile_index_keys::<Plain>().unwrap();
        assert_eq!(compiled[0].0, WILDCARD);
        assert_eq!(compiled.len(), 2);
        assert!(compiled[1].1.is_some());
    }

    #[test]
    fn test_compile_rejects_ambiguous_literal() {
        assert!(matches!(
            compile_index_keys::<BadLiteral>(),
            Err(OrmError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_materialize_substitutes_sentinel_on_eval_error() {
        let compiled = compile_index_keys::<Plain>().unwrap();
        let rec = Record::new(); // no uid field
        let (ckeys, ikeys) = materialize(&compiled, &rec.to_value());
        assert_eq!(ckeys, [WILDCARD, EVAL_ERROR_CKEY]);
        assert_eq!(ikeys, [WILDCARD, "'uid=' + m.uid"]);
    }

    #[test]
    fn test_reparse_sources_self_describe() {
        let compiled = reparse_sources(vec!["items".to_string(), "'uid=' + m.uid".to_string()]);
        assert!(compiled[0].1.is_none());
        assert!(compiled[1].1.is_some());
    }
}
