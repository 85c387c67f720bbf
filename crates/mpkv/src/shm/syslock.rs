// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-process mutex built from exclusive region creation.
//!
//! POSIX gives `shm_open(O_CREAT|O_EXCL)` first-creator-wins semantics,
//! which is enough to build a mutex that works between unrelated
//! processes: acquire spins until it can create the sentinel region,
//! release destroys it. Not reentrant. Used only to serialize broker
//! bootstrap and slot claiming, a handful of acquisitions per process
//! lifetime, so the spin is irrelevant to steady-state performance.

use super::{Result, SharedRegion, ShmError};
use crate::config::TICK;
use std::thread;

/// Sentinel region size; contents are never read.
const SENTINEL_SIZE: usize = 8;

/// Guard for a held cross-process lock; releases on drop.
pub struct SysLock {
    sentinel: SharedRegion,
}

impl SysLock {
    /// Block until the named lock is acquired.
    ///
    /// # Errors
    ///
    /// Propagates OS errors other than the name being taken.
    pub fn acquire(name: &str) -> Result<Self> {
        loop {
            match SharedRegion::create(name, SENTINEL_SIZE) {
                Ok(sentinel) => {
                    log::debug!("[SHM] SysLock acquired: {name}");
                    return Ok(Self { sentinel });
                }
                Err(ShmError::AlreadyExists(_)) => thread::sleep(TICK),
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for SysLock {
    fn drop(&mut self) {
        if let Err(e) = SharedRegion::unlink(self.sentinel.name()) {
            log::warn!("[SHM] SysLock release failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/mpkv_test_lock_{tag}_{ts}_{}", fastrand::u32(..))
    }

    #[test]
    fn test_acquire_release_reacquire() {
        let name = unique_name("cycle");
        let guard = SysLock::acquire(&name).expect("first acquire");
        drop(guard);
        let guard = SysLock::acquire(&name).expect("reacquire after release");
        drop(guard);
    }

    #[test]
    fn test_contended_acquire_waits_for_release() {
        let name = unique_name("contend");
        let held = SysLock::acquire(&name).expect("acquire");

        let name2 = name.clone();
        let waiter = thread::spawn(move || {
            let _guard = SysLock::acquire(&name2).expect("contended acquire");
        });

        // Give the waiter time to start spinning, then release.
        thread::sleep(std::time::Duration::from_millis(20));
        drop(held);
        waiter.join().expect("waiter finished");
    }

    #[test]
    fn test_mutual_exclusion() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let name = unique_name("excl");
        let inside = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::new();
        for _ in 0..4 {
            let name = name.clone();
            let inside = Arc::clone(&inside);
            workers.push(thread::spawn(move || {
                for _ in 0..20 {
                    let _guard = SysLock::acquire(&name).expect("acquire");
                    let now = inside.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(now, 0, "two holders inside the lock");
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for w in workers {
            w.join().expect("worker finished");
        }
    }
}
