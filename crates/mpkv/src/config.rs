// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration - single source of truth.
//!
//! This module centralizes ALL build-time constants: slot geometry,
//! polling periods, id width, shared-region naming and engine tuning.
//! **NEVER hardcode these values elsewhere!**
//!
//! # Layout Derivation
//!
//! The shared region is three parallel arrays indexed by slot:
//!
//! ```text
//! +-----------+-----------+--------------------------------------+
//! | lock[N]   | state[N]  | frame[N x FRAME_SIZE]                |
//! | 1 byte ea | 1 byte ea | NUL-terminated literal per slot      |
//! +-----------+-----------+--------------------------------------+
//! ```
//!
//! so `REGION_SIZE = 2 * MAX_PEERS + MAX_PEERS * FRAME_SIZE`.

use std::time::Duration;

/// Number of peer slots in the shared region.
///
/// This bounds the number of processes that can be connected to one
/// broker at the same time without queueing for a slot.
pub const MAX_PEERS: usize = 24;

/// Bytes per slot frame, including the NUL terminator.
///
/// Bounds the serialized size of any single request or reply. Must be
/// at least 512 so that error replies always fit.
pub const FRAME_SIZE: usize = 16 * 1024;

/// Maximum length of the `error` text in a reply frame.
///
/// Small enough that an error reply can never overflow a frame.
pub const ERROR_TEXT_MAX: usize = 384;

/// Polling period for slot state transitions and bootstrap retry.
pub const TICK: Duration = Duration::from_micros(10);

/// How long a connecting peer waits for a freshly spawned broker to
/// publish the shared region before giving up.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Cached select results retained per table (LRU).
pub const SELECT_CACHE_CAP: usize = 64;

/// Decimal digits in a [`LexoKey`](crate::LexoKey) rendering.
///
/// Row ids and index suffixes are zero-padded to this width so that
/// lexicographic order equals numeric order.
pub const LEXO_WIDTH: usize = 16;

/// Total shared-region size in bytes.
#[must_use]
pub const fn region_size() -> usize {
    2 * MAX_PEERS + MAX_PEERS * FRAME_SIZE
}

// =======================================================================
// Shared-region naming
//
// One data region and one bootstrap lock per engine directory. The names
// are derived from the engine path so that peers find the broker without
// coordination (same trick as deterministic segment naming in discovery).
// =======================================================================

/// Name salt for the data region.
const REGION_SALT: &str = "/mpkv_shm_";

/// Name salt for the bootstrap SysLock sentinel region.
const SYSLOCK_SALT: &str = "/mpkv_lk_";

/// Strip path separators (and drive separators) so a filesystem path can
/// be embedded in a POSIX shared-memory name.
#[must_use]
pub fn sanitize_path(path: &str) -> String {
    path.chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':'))
        .collect()
}

/// Deterministic data-region name for an engine directory.
#[must_use]
pub fn region_name(path: &str) -> String {
    truncate_name(format!("{REGION_SALT}{}", sanitize_path(path)))
}

/// Deterministic SysLock name for an engine directory.
#[must_use]
pub fn syslock_name(path: &str) -> String {
    truncate_name(format!("{SYSLOCK_SALT}{}", sanitize_path(path)))
}

/// Cap a region name at the POSIX limit, on a character boundary.
fn truncate_name(mut name: String) -> String {
    let mut end = 255.min(name.len());
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name.truncate(end);
    name
}

// =======================================================================
// Engine tuning (build-time constants per the adapter contract)
// =======================================================================

/// Engine block size in bytes.
pub const ENGINE_BLOCK_SIZE: usize = 16 * 1024;

/// Engine memtable budget in bytes.
pub const ENGINE_WRITE_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Run the engine with paranoid consistency checks.
pub const ENGINE_PARANOID_CHECKS: bool = true;
