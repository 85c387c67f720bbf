// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-width decimal ids whose lexicographic order equals numeric order.
//!
//! Row ids and index suffixes are rendered as zero-padded decimal strings
//! of width [`LEXO_WIDTH`](crate::config::LEXO_WIDTH) so prefix-ordered
//! engine iteration walks them in insertion order. Arithmetic preserves
//! the width; exceeding it is an unrecoverable invariant violation (a
//! store would need 10^16 inserts to get there).

use crate::config::LEXO_WIDTH;
use std::fmt;

/// Largest value representable in `LEXO_WIDTH` decimal digits.
const MAX_VALUE: u64 = 10u64.pow(LEXO_WIDTH as u32) - 1;

/// A non-negative id with a fixed-width decimal rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LexoKey(u64);

impl LexoKey {
    /// The zero key, `"0000000000000000"`.
    pub const ZERO: Self = Self(0);

    /// The largest representable key, `"9999999999999999"`.
    pub const MAX: Self = Self(MAX_VALUE);

    /// Wrap a numeric value.
    ///
    /// # Panics
    ///
    /// Panics if the value does not fit in `LEXO_WIDTH` digits.
    #[must_use]
    pub fn new(value: u64) -> Self {
        assert!(value <= MAX_VALUE, "lexokey width overflow: {value}");
        Self(value)
    }

    /// Parse a decimal rendering: 1 to `LEXO_WIDTH` ASCII digits (shorter
    /// input is widened on the next [`fmt::Display`]).
    pub fn parse(text: &str) -> Result<Self, LexoKeyError> {
        let ok = !text.is_empty()
            && text.len() <= LEXO_WIDTH
            && text.bytes().all(|b| b.is_ascii_digit());
        if !ok {
            return Err(LexoKeyError {
                text: text.to_string(),
            });
        }
        // At most LEXO_WIDTH digits, which always fit u64.
        let value = text.parse::<u64>().map_err(|_| LexoKeyError {
            text: text.to_string(),
        })?;
        Ok(Self(value))
    }

    /// Parse an optional rendering; absent means the zero key.
    pub fn parse_opt(text: Option<&str>) -> Result<Self, LexoKeyError> {
        match text {
            Some(t) => Self::parse(t),
            None => Ok(Self::ZERO),
        }
    }

    /// Numeric value.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Next id.
    #[must_use]
    pub fn succ(self) -> Self {
        Self::new(self.0 + 1)
    }

    /// Previous id, saturating at zero (reverse pagination below the
    /// first row simply stays at the first row).
    #[must_use]
    pub fn pred(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Add an offset, preserving width.
    #[must_use]
    pub fn add(self, n: u64) -> Self {
        Self::new(self.0 + n)
    }

    /// Subtract an offset, saturating at zero.
    #[must_use]
    pub fn sub(self, n: u64) -> Self {
        Self(self.0.saturating_sub(n))
    }
}

impl fmt::Display for LexoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = LEXO_WIDTH)
    }
}

/// True for strings that are exactly `LEXO_WIDTH` ASCII digits.
#[must_use]
pub fn is_lexo_str(text: &str) -> bool {
    text.len() == LEXO_WIDTH && text.bytes().all(|b| b.is_ascii_digit())
}

/// Rejected id rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexoKeyError {
    /// The offending text.
    pub text: String,
}

impl fmt::Display for LexoKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid lexokey literal: {:?}", self.text)
    }
}

impl std::error::Error for LexoKeyError {}
