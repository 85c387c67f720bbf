// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed records: field declarations, defaults, and reserved fields.
//!
//! A [`Model`] binds a table name, its field specs, and its index
//! predicates. Rows themselves are [`Record`]s - string-keyed mappings -
//! so the same machinery serves typed access and raw rows read back from
//! the store.
//!
//! Reserved fields: `id` (assigned by insert, never reassigned),
//! `ckeys` (materialized index keys, managed by the store and stripped
//! from user input), and `timestamp` (computed at construction). Visible
//! equality and hashing exclude all three.

use crate::lexokey::LexoKey;
use crate::literal::Value;
use crate::orm::expr::IndexKey;
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved: row id.
pub const FIELD_ID: &str = "id";
/// Reserved: materialized index keys.
pub const FIELD_CKEYS: &str = "ckeys";
/// Reserved: construction timestamp.
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// How a declared field gets its value when the caller omits it.
pub enum FieldDefault {
    /// No default: construction fails without a caller-supplied value.
    Required,
    /// A constant, cloned into the record.
    Value(Value),
    /// Computed at construction from the partially-built record.
    Computed(fn(&Record) -> Value),
}

/// One declared model field.
pub struct FieldSpec {
    /// Field name.
    pub name: &'static str,
    /// Fill-in behavior for omitted values.
    pub default: FieldDefault,
}

impl FieldSpec {
    /// A mandatory field.
    #[must_use]
    pub fn required(name: &'static str) -> Self {
        Self {
            name,
            default: FieldDefault::Required,
        }
    }

    /// A field with a constant default.
    #[must_use]
    pub fn with_default(name: &'static str, value: Value) -> Self {
        Self {
            name,
            default: FieldDefault::Value(value),
        }
    }

    /// A field with a computed default.
    #[must_use]
    pub fn computed(name: &'static str, f: fn(&Record) -> Value) -> Self {
        Self {
            name,
            default: FieldDefault::Computed(f),
        }
    }
}

/// A persistable table type: name, fields, index predicates.
pub trait Model {
    /// Table name; also the root of the `T.` / `Ts.` / `T#` namespaces.
    const TABLE: &'static str;

    /// Declared fields, applied in order at construction.
    fn fields() -> Vec<FieldSpec>;

    /// Index predicates; the wildcard `items` is always added on top.
    fn index_keys() -> Vec<IndexKey> {
        Vec::new()
    }
}

/// Record construction failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A required field was not supplied.
    MissingField {
        /// The field's name.
        field: String,
    },
    /// The initializer value is not a mapping.
    NotAMapping,
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "required field: {field:?}"),
            Self::NotAMapping => write!(f, "record initializer is not a mapping"),
        }
    }
}

impl std::error::Error for ModelError {}

/// A row: a string-keyed mapping with typed helpers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    /// An empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing mapping value; `Err` for non-mappings.
    pub fn from_value(value: Value) -> Result<Self, ModelError> {
        match value {
            Value::Map(fields) => Ok(Self { fields }),
            _ => Err(ModelError::NotAMapping),
        }
    }

    /// Construct a record for a model: apply declared defaults in order,
    /// then the base defaults (`id` null, `timestamp` now), then verify
    /// every required field is present.
    pub fn build<M: Model>(init: Record) -> Result<Self, ModelError> {
        let mut rec = init;

        for spec in M::fields() {
            if rec.fields.contains_key(spec.name) {
                continue;
            }
            match spec.default {
                FieldDefault::Required => {}
                FieldDefault::Value(v) => {
                    rec.fields.insert(spec.name.to_string(), v);
                }
                FieldDefault::Computed(f) => {
                    let v = f(&rec);
                    rec.fields.insert(spec.name.to_string(), v);
                }
            }
        }

        rec.fields
            .entry(FIELD_ID.to_string())
            .or_insert(Value::None);
        rec.fields
            .entry(FIELD_TIMESTAMP.to_string())
            .or_insert_with(|| Value::Float(now_seconds()));

        for spec in M::fields() {
            if !rec.fields.contains_key(spec.name) {
                return Err(ModelError::MissingField {
                    field: spec.name.to_string(),
                });
            }
        }

        Ok(rec)
    }

    /// Field lookup.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Set a field.
    pub fn set(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }

    /// Remove a field, returning its old value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// The row id, if present and parseable.
    ///
    /// Accepts both the canonical string rendering and a plain integer.
    #[must_use]
    pub fn id(&self) -> Option<LexoKey> {
        match self.fields.get(FIELD_ID)? {
            Value::Str(s) => LexoKey::parse(s).ok(),
            Value::Int(i) if *i >= 0 && u64::try_from(*i).is_ok_and(|v| v <= LexoKey::MAX.value()) => {
                Some(LexoKey::new(*i as u64))
            }
            _ => None,
        }
    }

    /// Assign the row id (canonical string form).
    pub fn set_id(&mut self, id: LexoKey) {
        self.fields
            .insert(FIELD_ID.to_string(), Value::Str(id.to_string()));
    }

    /// Stored index keys, as strings.
    #[must_use]
    pub fn ckeys(&self) -> Vec<String> {
        match self.fields.get(FIELD_CKEYS) {
            Some(Value::List(items)) => items
                .iter()
                .map(|v| match v {
                    Value::Str(s) => s.clone(),
                    other => other.format(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Replace the stored index keys.
    pub fn set_ckeys(&mut self, ckeys: &[String]) {
        self.fields.insert(
            FIELD_CKEYS.to_string(),
            Value::List(ckeys.iter().map(|c| Value::Str(c.clone())).collect()),
        );
    }

    /// Merge `other` into `self`; `other` wins on conflicts.
    pub fn merge_from(&mut self, other: &Record) {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
    }

    /// The record as a mapping value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Map(self.fields.clone())
    }

    /// The record's fields, consumed.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Map(self.fields)
    }

    /// The user-visible fields: everything except `id`, `timestamp`
    /// and `ckeys`.
    #[must_use]
    pub fn visible(&self) -> BTreeMap<String, Value> {
        self.fields
            .iter()
            .filter(|(k, _)| {
                k.as_str() != FIELD_ID
                    && k.as_str() != FIELD_TIMESTAMP
                    && k.as_str() != FIELD_CKEYS
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Equality on the user-visible fields only.
    #[must_use]
    pub fn visible_eq(&self, other: &Record) -> bool {
        self.visible() == other.visible()
    }

    /// Hash of the user-visible fields (via their canonical literal, so
    /// floats and nested values hash consistently).
    #[must_use]
    pub fn visible_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        Value::Map(self.visible()).format().hash(&mut hasher);
        hasher.finish()
    }
}

impl From<Record> for Value {
    fn from(rec: Record) -> Self {
        rec.into_value()
    }
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
