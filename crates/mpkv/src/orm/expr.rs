// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Index predicates: a small pure expression language.
//!
//! A predicate maps a record to its index key string (ckey). Sources are
//! persisted next to the index entries they produce, so updates and
//! removals re-derive old ckeys from what the store actually evaluated -
//! never from the code currently loaded - and code changes cannot orphan
//! index keys.
//!
//! # Grammar
//!
//! ```text
//! expr  = term { '+' term }
//! term  = string | field
//! field = 'm' { '.' ident }+          ; record access, nested maps ok
//! ```
//!
//! where `string` is a quoted literal (same escapes as the value
//! grammar) and `ident` is `[A-Za-z_][A-Za-z0-9_]*`. Evaluation
//! concatenates terms: strings verbatim, fields rendered textually
//! (a null field renders `None`, other values as their literal).
//!
//! `'uid=' + m.uid` over `{uid: 42}` yields `uid=42`.
//!
//! A source that does not parse as an expression is a verbatim index key
//! (the wildcard `items` is the canonical example). Evaluation errors -
//! a missing field - are not dropped: the record is indexed under the
//! sentinel `...` so the entry can still be re-derived and removed later.

use crate::literal::Value;
use std::fmt;

/// Ckey used when a predicate fails to evaluate against a record.
pub const EVAL_ERROR_CKEY: &str = "...";

/// The wildcard predicate every record is indexed under.
pub const WILDCARD: &str = "items";

/// A declared index key on a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKey {
    /// Index the string itself, verbatim.
    Literal(&'static str),
    /// Evaluate a predicate expression against each record.
    Expr(&'static str),
}

impl IndexKey {
    /// The source text that gets persisted with index entries.
    #[must_use]
    pub fn source(&self) -> &'static str {
        match self {
            Self::Literal(s) | Self::Expr(s) => s,
        }
    }
}

/// Why a predicate source was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprError {
    /// Byte offset of the rejection.
    pub pos: usize,
    /// Human-readable reason.
    pub reason: &'static str,
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.reason, self.pos)
    }
}

impl std::error::Error for ExprError {}

/// A parsed predicate expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expr {
    terms: Vec<Term>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Lit(String),
    Field(Vec<String>),
}

impl Expr {
    /// Parse a predicate source; `Err` means "not an expression".
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let mut p = ExprParser {
            bytes: src.as_bytes(),
            pos: 0,
        };
        let expr = p.expr()?;
        p.skip_ws();
        if p.pos != p.bytes.len() {
            return Err(ExprError {
                pos: p.pos,
                reason: "trailing bytes after expression",
            });
        }
        Ok(expr)
    }

    /// Evaluate against a record mapping.
    ///
    /// `Err` carries the missing field path; callers index the record
    /// under [`EVAL_ERROR_CKEY`] in that case.
    pub fn eval(&self, record: &Value) -> Result<String, String> {
        let mut out = String::new();
        for term in &self.terms {
            match term {
                Term::Lit(s) => out.push_str(s),
                Term::Field(path) => {
                    let mut cursor = record;
                    for part in path {
                        cursor = cursor
                            .get(part)
                            .ok_or_else(|| format!("missing field m.{}", path.join(".")))?;
                    }
                    render(cursor, &mut out);
                }
            }
        }
        Ok(out)
    }
}

/// Textual rendering of a field value inside a ckey.
fn render(value: &Value, out: &mut String) {
    match value {
        // Strings go in raw: `'uid=' + m.uid` must not double-quote.
        Value::Str(s) => out.push_str(s),
        other => out.push_str(&other.format()),
    }
}

struct ExprParser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl ExprParser<'_> {
    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn expr(&mut self) -> Result<Expr, ExprError> {
        let mut terms = vec![self.term()?];
        loop {
            self.skip_ws();
            if self.peek() == Some(b'+') {
                self.pos += 1;
                terms.push(self.term()?);
            } else {
                return Ok(Expr { terms });
            }
        }
    }

    fn term(&mut self) -> Result<Term, ExprError> {
        self.skip_ws();
        match self.peek() {
            Some(b'\'' | b'"') => self.string_lit(),
            Some(b'm') => self.field(),
            _ => Err(ExprError {
                pos: self.pos,
                reason: "expected string literal or record access",
            }),
        }
    }

    fn string_lit(&mut self) -> Result<Term, ExprError> {
        let quote = self.bytes[self.pos];
        self.pos += 1;
        let mut out = String::new();
        loop {
            let b = self.peek().ok_or(ExprError {
                pos: self.pos,
                reason: "unterminated string literal",
            })?;
            self.pos += 1;
            match b {
                b if b == quote => return Ok(Term::Lit(out)),
                b'\\' => {
                    let esc = self.peek().ok_or(ExprError {
                        pos: self.pos,
                        reason: "unterminated escape",
                    })?;
                    self.pos += 1;
                    match esc {
                        b'\'' => out.push('\''),
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'n' => out.push('\n'),
                        b't' => out.push('\t'),
                        _ => {
                            return Err(ExprError {
                                pos: self.pos - 1,
                                reason: "unknown escape in string literal",
                            })
                        }
                    }
                }
                b if b.is_ascii() => out.push(b as char),
                _ => {
                    // Multi-byte UTF-8: re-decode from the byte position.
                    self.pos -= 1;
                    let s = std::str::from_utf8(&self.bytes[self.pos..]).map_err(|_| ExprError {
                        pos: self.pos,
                        reason: "invalid utf-8 in string literal",
                    })?;
                    let c = s.chars().next().ok_or(ExprError {
                        pos: self.pos,
                        reason: "unterminated string literal",
                    })?;
                    out.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
    }

    fn field(&mut self) -> Result<Term, ExprError> {
        // 'm' then at least one '.ident'.
        self.pos += 1;
        let mut path = Vec::new();
        while self.peek() == Some(b'.') {
            self.pos += 1;
            let start = self.pos;
            match self.peek() {
                Some(b) if b.is_ascii_alphabetic() || b == b'_' => self.pos += 1,
                _ => {
                    return Err(ExprError {
                        pos: self.pos,
                        reason: "expected field name after '.'",
                    })
                }
            }
            while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
                self.pos += 1;
            }
            // Identifiers are ASCII-only by grammar, safe to slice.
            path.push(
                std::str::from_utf8(&self.bytes[start..self.pos])
                    .expect("ascii identifier")
                    .to_string(),
            );
        }
        if path.is_empty() {
            return Err(ExprError {
                pos: self.pos,
                reason: "record access needs at least one field",
            });
        }
        Ok(Term::Field(path))
    }
}
