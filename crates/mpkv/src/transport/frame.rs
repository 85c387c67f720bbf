// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame encoding for slot transport.
//!
//! A frame is a string-keyed mapping serialized as a textual literal and
//! terminated by a single NUL byte; trailing frame bytes are ignored.
//! Peer frames carry `method` plus method-specific arguments, broker
//! frames carry `result` or `error`. Encoding that would overflow the
//! slot fails locally with [`FrameError::BufferTooSmall`] before any
//! state transition, so an oversized request never disturbs the slot.

use crate::config::{ERROR_TEXT_MAX, FRAME_SIZE};
use crate::literal::{LiteralError, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Key carrying the request method name.
pub const KEY_METHOD: &str = "method";
/// Key carrying a successful reply payload.
pub const KEY_RESULT: &str = "result";
/// Key carrying a failed reply's error text.
pub const KEY_ERROR: &str = "error";

/// Frame encode/decode failures.
#[derive(Debug)]
pub enum FrameError {
    /// Serialized frame (plus terminator) exceeds the slot frame size.
    BufferTooSmall {
        /// Encoded size including the NUL terminator.
        size: usize,
    },
    /// Frame bytes are not valid UTF-8 or not a literal.
    Malformed(LiteralError),
    /// Frame literal is valid but not a mapping.
    NotAMapping,
    /// No NUL terminator found in the slot frame.
    Unterminated,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall { size } => {
                write!(f, "frame of {size} bytes exceeds slot capacity {FRAME_SIZE}")
            }
            Self::Malformed(e) => write!(f, "malformed frame: {e}"),
            Self::NotAMapping => write!(f, "frame literal is not a mapping"),
            Self::Unterminated => write!(f, "frame has no terminator"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

/// Serialize a frame, appending the NUL terminator.
pub fn encode(frame: &Value) -> Result<Vec<u8>, FrameError> {
    let mut bytes = frame.format().into_bytes();
    bytes.push(0);
    if bytes.len() > FRAME_SIZE {
        return Err(FrameError::BufferTooSmall { size: bytes.len() });
    }
    Ok(bytes)
}

/// Parse frame bytes (terminator already stripped) into a mapping.
pub fn decode(bytes: &[u8]) -> Result<Value, FrameError> {
    let text = std::str::from_utf8(bytes).map_err(|_| FrameError::NotAMapping)?;
    let value = Value::parse(text).map_err(FrameError::Malformed)?;
    match value {
        Value::Map(_) => Ok(value),
        _ => Err(FrameError::NotAMapping),
    }
}

/// Build a request frame from a method name and arguments.
#[must_use]
pub fn request<I>(method: &str, args: I) -> Value
where
    I: IntoIterator<Item = (&'static str, Value)>,
{
    let mut map = BTreeMap::new();
    map.insert(KEY_METHOD.to_string(), Value::Str(method.to_string()));
    for (k, v) in args {
        map.insert(k.to_string(), v);
    }
    Value::Map(map)
}

/// Build a successful reply frame.
#[must_use]
pub fn reply(result: Value) -> Value {
    Value::Map(BTreeMap::from([(KEY_RESULT.to_string(), result)]))
}

/// Build an error reply frame, truncating the text so it always fits.
#[must_use]
pub fn error_reply(text: &str) -> Value {
    let mut text = text.to_string();
    if text.len() > ERROR_TEXT_MAX {
        let mut cut = ERROR_TEXT_MAX;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    Value::Map(BTreeMap::from([(KEY_ERROR.to_string(), Value::Str(text))]))
}
