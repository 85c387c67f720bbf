// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reversible textual literal encoding for structured values.
//!
//! Every value stored in the engine and every frame crossing the shared
//! region is the textual literal of a [`Value`]: `None`, `True`/`False`,
//! decimal integers, floats, quoted strings, lists and string-keyed
//! mappings. The parser accepts exactly this grammar and nothing else, so
//! a value read back either decodes to what was written or surfaces as
//! corruption at the reading site.
//!
//! # Grammar
//!
//! ```text
//! value   = 'None' | 'True' | 'False' | int | float | string | list | map
//! int     = ['-'] digit+
//! float   = ['-'] digit+ '.' digit* [exp] | ['-'] digit+ exp
//!         | ['-'] 'inf' | 'NaN'
//! string  = "'" char* "'" | '"' char* '"'        ; \' \" \\ \n \r \t \0 \xNN
//! list    = '[' [value (',' value)*] ']'
//! map     = '{' [string ':' value (',' ...)*] '}'
//! ```
//!
//! Canonical form (what the formatter emits): single-quoted strings,
//! `", "` / `": "` separators, map keys in sorted order, floats always
//! carrying a `.` or exponent. `parse(format(v)) == v` for every value,
//! and `format(parse(s)) == s` for canonical `s`.

use std::collections::BTreeMap;
use std::fmt;

/// A structured value in the store's literal universe.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The null value, rendered `None`.
    None,
    /// Boolean, rendered `True` / `False`.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Ordered list.
    List(Vec<Value>),
    /// String-keyed mapping; `BTreeMap` keeps the canonical key order.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Render the canonical textual literal.
    #[must_use]
    pub fn format(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) {
        match self {
            Self::None => out.push_str("None"),
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Int(i) => {
                out.push_str(&i.to_string());
            }
            Self::Float(f) => write_float(*f, out),
            Self::Str(s) => write_quoted(s, out),
            Self::List(items) => {
                out.push('[');
                for (n, item) in items.iter().enumerate() {
                    if n > 0 {
                        out.push_str(", ");
                    }
                    item.write_to(out);
                }
                out.push(']');
            }
            Self::Map(entries) => {
                out.push('{');
                for (n, (key, val)) in entries.iter().enumerate() {
                    if n > 0 {
                        out.push_str(", ");
                    }
                    write_quoted(key, out);
                    out.push_str(": ");
                    val.write_to(out);
                }
                out.push('}');
            }
        }
    }

    /// Parse a textual literal, rejecting anything outside the grammar
    /// (including trailing bytes).
    pub fn parse(input: &str) -> Result<Self, LiteralError> {
        let mut p = Parser {
            bytes: input.as_bytes(),
            pos: 0,
        };
        p.skip_ws();
        let value = p.value()?;
        p.skip_ws();
        if p.pos != p.bytes.len() {
            return Err(LiteralError::Trailing { pos: p.pos });
        }
        Ok(value)
    }

    /// Borrow the string content, if this is a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an `Int`.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Boolean content, if this is a `Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow the entries, if this is a `Map`.
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Borrow the items, if this is a `List`.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    /// True for the `None` value.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Map lookup shorthand; `None` (the Rust one) for non-maps too.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self::Map(entries)
    }
}

fn write_float(f: f64, out: &mut String) {
    if f.is_finite() {
        let s = f.to_string();
        out.push_str(&s);
        // Keep floats distinguishable from integers on re-parse.
        if !s.contains('.') && !s.contains('e') && !s.contains('E') {
            out.push_str(".0");
        }
    } else {
        out.push_str(&f.to_string()); // "inf", "-inf", "NaN"
    }
}

fn write_quoted(s: &str, out: &mut String) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('\'');
}

/// Errors from [`Value::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiteralError {
    /// Input ended inside a value.
    UnexpectedEnd,
    /// A byte outside the grammar at this offset.
    Unexpected { pos: usize },
    /// Unknown or malformed escape sequence.
    BadEscape { pos: usize },
    /// Integer does not fit in 64 bits (or malformed number).
    BadNumber { pos: usize },
    /// Map key is not a string literal.
    NonStringKey { pos: usize },
    /// Valid value followed by trailing bytes.
    Trailing { pos: usize },
}

impl fmt::Display for LiteralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd => write!(f, "literal ended unexpectedly"),
            Self::Unexpected { pos } => write!(f, "unexpected byte at offset {pos}"),
            Self::BadEscape { pos } => write!(f, "bad escape sequence at offset {pos}"),
            Self::BadNumber { pos } => write!(f, "malformed number at offset {pos}"),
            Self::NonStringKey { pos } => write!(f, "non-string mapping key at offset {pos}"),
            Self::Trailing { pos } => write!(f, "trailing bytes after literal at offset {pos}"),
        }
    }
}

impl std::error::Error for LiteralError {}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            if b == b' ' || b == b'\t' || b == b'\n' || b == b'\r' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Result<u8, LiteralError> {
        let b = self.peek().ok_or(LiteralError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(b)
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.bytes[self.pos..].starts_with(kw.as_bytes()) {
            self.pos += kw.len();
            true
        } else {
            false
        }
    }

    fn value(&mut self) -> Result<Value, LiteralError> {
        match self.peek().ok_or(LiteralError::UnexpectedEnd)? {
            b'N' => {
                if self.eat_keyword("None") {
                    Ok(Value::None)
                } else if self.eat_keyword("NaN") {
                    Ok(Value::Float(f64::NAN))
                } else {
                    Err(LiteralError::Unexpected { pos: self.pos })
                }
            }
            b'T' => {
                if self.eat_keyword("True") {
                    Ok(Value::Bool(true))
                } else {
                    Err(LiteralError::Unexpected { pos: self.pos })
                }
            }
            b'F' => {
                if self.eat_keyword("False") {
                    Ok(Value::Bool(false))
                } else {
                    Err(LiteralError::Unexpected { pos: self.pos })
                }
            }
            b'i' => {
                if self.eat_keyword("inf") {
                    Ok(Value::Float(f64::INFINITY))
                } else {
                    Err(LiteralError::Unexpected { pos: self.pos })
                }
            }
            b'\'' | b'"' => Ok(Value::Str(self.string()?)),
            b'[' => self.list(),
            b'{' => self.map(),
            b'-' | b'0'..=b'9' => self.number(),
            _ => Err(LiteralError::Unexpected { pos: self.pos }),
        }
    }

    fn string(&mut self) -> Result<String, LiteralError> {
        let quote = self.bump()?;
        let mut out = String::new();
        loop {
            let start = self.pos;
            let b = self.bump()?;
            match b {
                b if b == quote => return Ok(out),
                b'\\' => {
                    let esc = self.bump()?;
                    match esc {
                        b'\'' => out.push('\''),
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'n' => out.push('\n'),
                        b'r' => out.push('\r'),
                        b't' => out.push('\t'),
                        b'0' => out.push('\0'),
                        b'x' => {
                            let hi = self.bump()?;
                            let lo = self.bump()?;
                            let code = (hex_digit(hi).ok_or(LiteralError::BadEscape {
                                pos: start,
                            })? << 4)
                                | hex_digit(lo).ok_or(LiteralError::BadEscape { pos: start })?;
                            out.push(code as char);
                        }
                        _ => return Err(LiteralError::BadEscape { pos: start }),
                    }
                }
                _ => {
                    // Re-decode from the byte position so multi-byte UTF-8
                    // characters pass through intact.
                    self.pos = start;
                    let rest = &self.bytes[self.pos..];
                    let s = std::str::from_utf8(rest)
                        .map_err(|_| LiteralError::Unexpected { pos: self.pos })?;
                    let c = s.chars().next().ok_or(LiteralError::UnexpectedEnd)?;
                    out.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
    }

    fn number(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
            if self.eat_keyword("inf") {
                return Ok(Value::Float(f64::NEG_INFINITY));
            }
        }
        let mut is_float = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => self.pos += 1,
                b'.' | b'e' | b'E' => {
                    is_float = true;
                    self.pos += 1;
                }
                b'+' | b'-' if is_float => self.pos += 1,
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| LiteralError::BadNumber { pos: start })?;
        if is_float {
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|_| LiteralError::BadNumber { pos: start })
        } else {
            text.parse::<i64>()
                .map(Value::Int)
                .map_err(|_| LiteralError::BadNumber { pos: start })
        }
    }

    fn list(&mut self) -> Result<Value, LiteralError> {
        self.pos += 1; // '['
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Value::List(items));
        }
        loop {
            self.skip_ws();
            items.push(self.value()?);
            self.skip_ws();
            match self.bump()? {
                b',' => {}
                b']' => return Ok(Value::List(items)),
                _ => return Err(LiteralError::Unexpected { pos: self.pos - 1 }),
            }
        }
    }

    fn map(&mut self) -> Result<Value, LiteralError> {
        self.pos += 1; // '{'
        let mut entries = BTreeMap::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Value::Map(entries));
        }
        loop {
            self.skip_ws();
            match self.peek().ok_or(LiteralError::UnexpectedEnd)? {
                b'\'' | b'"' => {}
                _ => return Err(LiteralError::NonStringKey { pos: self.pos }),
            }
            let key = self.string()?;
            self.skip_ws();
            if self.bump()? != b':' {
                return Err(LiteralError::Unexpected { pos: self.pos - 1 });
            }
            self.skip_ws();
            let val = self.value()?;
            entries.insert(key, val);
            self.skip_ws();
            match self.bump()? {
                b',' => {}
                b'}' => return Ok(Value::Map(entries)),
                _ => return Err(LiteralError::Unexpected { pos: self.pos - 1 }),
            }
        }
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
