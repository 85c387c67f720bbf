// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Slot-based request/response transport over a shared region.
//!
//! # Memory Layout
//!
//! ```text
//! +------------+------------+----------------------------------+
//! | lock[N]    | state[N]   | frame[N x FRAME_SIZE]            |
//! +------------+------------+----------------------------------+
//!   1 byte/slot  1 byte/slot  NUL-terminated mapping literal
//! ```
//!
//! Each slot is one peer's RPC channel. The lock byte carries slot
//! ownership (`FREE` / `HELD` / `CLEAN`), the state byte carries the
//! request cycle (`IDLE` / `REQUEST` / `RESPONSE`), and the frame holds
//! the serialized request or reply.
//!
//! # Synchronization Protocol
//!
//! Peer call:
//! 1. Write request literal into the frame (plain stores)
//! 2. `state = REQUEST` (Release) - publishes the frame bytes
//! 3. Spin (sleep TICK) until `state == RESPONSE` (Acquire)
//! 4. Read the reply from the frame
//! 5. `state = IDLE` for single-shot calls; sessions keep RESPONSE
//!
//! Broker scan:
//! 1. `state == REQUEST` (Acquire) - sees the full request frame
//! 2. Service, write reply into the frame
//! 3. `state = RESPONSE` (Release) - publishes the reply bytes
//!
//! Frame bytes themselves are plain (non-atomic) accesses; the state
//! byte's Release/Acquire pairing is the only publication point, and the
//! protocol never lets both sides touch a frame in the same phase. Lock
//! bytes use the same ordering for the claim (`FREE -> HELD` CAS under
//! SysLock) and release (`HELD -> CLEAN`) transitions.

pub mod frame;

use crate::config::{region_size, FRAME_SIZE, MAX_PEERS};
use crate::shm::SharedRegion;
use std::sync::atomic::AtomicU8;

/// Slot is unowned and claimable.
pub const LOCK_FREE: u8 = 0;
/// Slot is owned by a live peer.
pub const LOCK_HELD: u8 = 1;
/// Peer released the slot; broker must tear down sessions, then FREE it.
pub const LOCK_CLEAN: u8 = 2;

/// No request in flight.
pub const STATE_IDLE: u8 = 0;
/// Peer published a request frame.
pub const STATE_REQUEST: u8 = 1;
/// Broker published a reply frame.
pub const STATE_RESPONSE: u8 = 2;

const fn lock_offset(slot: usize) -> usize {
    slot % MAX_PEERS
}

const fn state_offset(slot: usize) -> usize {
    MAX_PEERS + slot % MAX_PEERS
}

const fn frame_offset(slot: usize) -> usize {
    2 * MAX_PEERS + (slot % MAX_PEERS) * FRAME_SIZE
}

/// Typed view over the shared region's slot arrays.
///
/// Both the broker (which creates the region) and peers (which attach)
/// drive the protocol through this view; it owns the mapping but not the
/// region name.
pub struct SlotBank {
    region: SharedRegion,
}

impl SlotBank {
    /// Wrap a mapped region.
    ///
    /// # Panics
    ///
    /// Panics if the mapping is smaller than the slot layout.
    #[must_use]
    pub fn new(region: SharedRegion) -> Self {
        assert!(
            region.size() >= region_size(),
            "region too small for slot layout: {} < {}",
            region.size(),
            region_size()
        );
        Self { region }
    }

    /// Name of the underlying region.
    #[must_use]
    pub fn region_name(&self) -> &str {
        self.region.name()
    }

    /// The lock byte of a slot.
    #[inline]
    #[must_use]
    pub fn lock(&self, slot: usize) -> &AtomicU8 {
        self.byte(lock_offset(slot))
    }

    /// The state byte of a slot.
    #[inline]
    #[must_use]
    pub fn state(&self, slot: usize) -> &AtomicU8 {
        self.byte(state_offset(slot))
    }

    fn byte(&self, offset: usize) -> &AtomicU8 {
        debug_assert!(offset < 2 * MAX_PEERS);
        // SAFETY:
        // - offset is within the lock/state arrays, which are inside the
        //   mapping (asserted >= region_size() at construction)
        // - AtomicU8 has the same layout as u8 and single-byte alignment
        // - all cross-process access to these bytes goes through atomics,
        //   matching the protocol's assumption that single-byte stores are
        //   atomic with respect to each other
        unsafe { &*self.region.as_ptr().add(offset).cast::<AtomicU8>() }
    }

    /// Copy an encoded frame (already NUL-terminated) into a slot.
    ///
    /// Callers must hold the slot in the phase that gives them frame
    /// ownership (peer at IDLE/RESPONSE, broker while servicing REQUEST).
    pub fn write_frame(&self, slot: usize, encoded: &[u8]) {
        debug_assert!(encoded.len() <= FRAME_SIZE, "frame overflow");
        // SAFETY:
        // - the destination range lies inside the mapping (layout assert)
        // - encoded.len() <= FRAME_SIZE (frame::encode enforces, debug
        //   asserted here), so the copy stays inside this slot's frame
        // - protocol phase gives the caller exclusive frame access; the
        //   subsequent state-byte Release store publishes these bytes
        unsafe {
            std::ptr::copy_nonoverlapping(
                encoded.as_ptr(),
                self.region.as_ptr().add(frame_offset(slot)),
                encoded.len(),
            );
        }
    }

    /// Copy a slot's frame out, up to (excluding) the NUL terminator.
    ///
    /// Returns `None` when no terminator is present in the frame, which
    /// means the frame was never written or is torn.
    #[must_use]
    pub fn read_frame(&self, slot: usize) -> Option<Vec<u8>> {
        // SAFETY:
        // - the source range is exactly this slot's frame, inside the
        //   mapping (layout assert at construction)
        // - the caller observed the peer/broker state byte with Acquire,
        //   so the bytes written before the matching Release are visible
        let raw = unsafe {
            std::slice::from_raw_parts(self.region.as_ptr().add(frame_offset(slot)), FRAME_SIZE)
        };
        let end = raw.iter().position(|&b| b == 0)?;
        Some(raw[..end].to_vec())
    }
}
