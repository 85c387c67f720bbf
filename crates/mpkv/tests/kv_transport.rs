// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end transport tests: a broker on an in-process thread, clients
//! attached through the real shared region.

use mpkv::config::{region_name, region_size, MAX_PEERS};
use mpkv::shm::{SharedRegion, ShmError};
use mpkv::transport::{frame, SlotBank, LOCK_CLEAN, LOCK_FREE, LOCK_HELD, STATE_IDLE, STATE_REQUEST, STATE_RESPONSE};
use mpkv::{BrokerLaunch, Mdb, MdbError, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn open_store() -> (Arc<Mdb>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mdb = Mdb::builder(dir.path().to_str().unwrap())
        .launch(BrokerLaunch::Thread)
        .connect()
        .expect("connect");
    (mdb, dir)
}

/// Wait until the broker has torn down and unlinked the region, so the
/// engine directory can be removed safely.
fn wait_broker_exit(path: &str) {
    let name = region_name(path);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match SharedRegion::attach(&name, region_size()) {
            Err(ShmError::NotFound(_)) => return,
            _ => {
                assert!(Instant::now() < deadline, "broker never tore down {name}");
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// A protocol-level peer without the client conveniences; used to
/// simulate crashes (CLEAN without close) and slot exhaustion.
struct RawPeer {
    bank: SlotBank,
    slot: usize,
}

impl RawPeer {
    fn attach(path: &str) -> Option<Self> {
        let region = SharedRegion::attach(&region_name(path), region_size()).ok()?;
        let bank = SlotBank::new(region);
        let slot = (0..MAX_PEERS).find(|&i| {
            bank.lock(i)
                .compare_exchange(LOCK_FREE, LOCK_HELD, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })?;
        Some(Self { bank, slot })
    }

    fn call(&self, request: &Value, idle: bool) -> Value {
        let encoded = frame::encode(request).expect("encode");
        self.bank.write_frame(self.slot, &encoded);
        self.bank
            .state(self.slot)
            .store(STATE_REQUEST, Ordering::Release);
        while self.bank.state(self.slot).load(Ordering::Acquire) != STATE_RESPONSE {
            thread::sleep(Duration::from_micros(10));
        }
        let raw = self.bank.read_frame(self.slot).expect("reply");
        if idle {
            self.bank
                .state(self.slot)
                .store(STATE_IDLE, Ordering::Release);
        }
        frame::decode(&raw).expect("decode")
    }

    /// Disappear without closing anything, like a crashed process whose
    /// destructor still flagged the slot.
    fn crash(self) {
        self.bank
            .lock(self.slot)
            .store(LOCK_CLEAN, Ordering::Release);
    }
}

#[test]
fn test_put_get_delete_roundtrip() {
    let (db, dir) = open_store();
    let path = dir.path().to_str().unwrap().to_string();

    assert_eq!(db.get("missing").unwrap(), None);

    db.put("k", &Value::Int(7)).unwrap();
    assert_eq!(db.get("k").unwrap(), Some(Value::Int(7)));

    db.put("k", &Value::from("replaced")).unwrap();
    assert_eq!(db.get("k").unwrap(), Some(Value::from("replaced")));

    db.delete("k").unwrap();
    assert_eq!(db.get("k").unwrap(), None);
    // Idempotent delete.
    db.delete("k").unwrap();

    drop(db);
    wait_broker_exit(&path);
}

#[test]
fn test_every_put_is_observable_in_order() {
    let (db, dir) = open_store();
    let path = dir.path().to_str().unwrap().to_string();

    for i in 0..100i64 {
        db.put("counter", &Value::Int(i)).unwrap();
        assert_eq!(db.get("counter").unwrap(), Some(Value::Int(i)));
    }

    drop(db);
    wait_broker_exit(&path);
}

#[test]
fn test_iterator_streams_prefix_in_both_directions() {
    let (db, dir) = open_store();
    let path = dir.path().to_str().unwrap().to_string();

    for (k, v) in [("t.a", 1i64), ("t.b", 2), ("t.c", 3), ("u.x", 9)] {
        db.put(k, &Value::Int(v)).unwrap();
    }

    let forward: Vec<String> = db
        .iterator("t.", false, None)
        .unwrap()
        .map(|e| e.unwrap().0)
        .collect();
    assert_eq!(forward, ["a", "b", "c"]);

    let reverse: Vec<String> = db
        .iterator("t.", true, None)
        .unwrap()
        .map(|e| e.unwrap().0)
        .collect();
    assert_eq!(reverse, ["c", "b", "a"]);

    let seeked: Vec<String> = db
        .iterator("t.", false, Some("b"))
        .unwrap()
        .map(|e| e.unwrap().0)
        .collect();
    assert_eq!(seeked, ["b", "c"]);

    drop(db);
    wait_broker_exit(&path);
}

#[test]
fn test_iterator_nesting_refused_and_close_releases() {
    let (db, dir) = open_store();
    let path = dir.path().to_str().unwrap().to_string();

    db.put("n.1", &Value::None).unwrap();
    db.put("n.2", &Value::None).unwrap();

    let mut first = db.iterator("n.", false, None).unwrap();
    assert!(first.next().is_some());

    // Same slot, second session: the broker refuses.
    match db.iterator("n.", false, None) {
        Err(MdbError::Remote(text)) => assert!(text.contains("Nesting iterators"), "{text}"),
        other => panic!("expected nesting error, got {other:?}"),
    }

    // Early drop closes the session; a fresh iterator works.
    drop(first);
    let count = db.iterator("n.", false, None).unwrap().count();
    assert_eq!(count, 2);

    drop(db);
    wait_broker_exit(&path);
}

#[test]
fn test_batch_commits_atomically_and_rolls_back_on_drop() {
    let (db, dir) = open_store();
    let path = dir.path().to_str().unwrap().to_string();

    db.put("stay", &Value::Int(1)).unwrap();

    {
        let batch = db.write_batch().unwrap();
        batch.put("a", &Value::Int(10)).unwrap();
        batch.delete("stay").unwrap();
        // Dropped without commit: rollback.
    }
    assert_eq!(db.get("a").unwrap(), None);
    assert_eq!(db.get("stay").unwrap(), Some(Value::Int(1)));

    let batch = db.write_batch().unwrap();
    batch.put("a", &Value::Int(10)).unwrap();
    batch.put("b", &Value::Int(20)).unwrap();
    batch.delete("stay").unwrap();
    batch.commit().unwrap();

    assert_eq!(db.get("a").unwrap(), Some(Value::Int(10)));
    assert_eq!(db.get("b").unwrap(), Some(Value::Int(20)));
    assert_eq!(db.get("stay").unwrap(), None);

    drop(db);
    wait_broker_exit(&path);
}

#[test]
fn test_oversized_frame_fails_before_any_state_change() {
    let (db, dir) = open_store();
    let path = dir.path().to_str().unwrap().to_string();

    let huge = "x".repeat(64 * 1024);
    match db.put("big", &Value::from(huge)) {
        Err(MdbError::BufferTooSmall { .. }) => {}
        other => panic!("expected BufferTooSmall, got {other:?}"),
    }

    // The slot is untouched and fully usable.
    db.put("small", &Value::Int(1)).unwrap();
    assert_eq!(db.get("small").unwrap(), Some(Value::Int(1)));
    assert_eq!(db.get("big").unwrap(), None);

    drop(db);
    wait_broker_exit(&path);
}

#[test]
fn test_crashed_peer_slot_is_reclaimed_with_its_iterator() {
    let (db, dir) = open_store();
    let path = dir.path().to_str().unwrap().to_string();

    db.put("r.1", &Value::None).unwrap();

    let peer = RawPeer::attach(&path).expect("raw attach");
    let slot = peer.slot;
    let opened = peer.call(
        &frame::request(
            "iterator",
            [
                ("prefix", Value::from("r.")),
                ("reverse", Value::Bool(false)),
                ("seek", Value::None),
            ],
        ),
        false,
    );
    assert_eq!(opened.get("result"), Some(&Value::Bool(true)));

    // The peer dies mid-session.
    peer.crash();

    // The broker reclaims the slot on its next scan.
    let region = SharedRegion::attach(&region_name(&path), region_size()).unwrap();
    let bank = SlotBank::new(region);
    let deadline = Instant::now() + Duration::from_secs(5);
    while bank.lock(slot).load(Ordering::Acquire) != LOCK_FREE {
        assert!(Instant::now() < deadline, "slot never reclaimed");
        thread::sleep(Duration::from_millis(1));
    }

    // The engine iterator went with it: a new session on the surviving
    // client opens cleanly.
    let count = db.iterator("r.", false, None).unwrap().count();
    assert_eq!(count, 1);

    drop(bank);
    drop(db);
    wait_broker_exit(&path);
}

#[test]
fn test_full_region_exhausts_then_recovers() {
    let (db, dir) = open_store();
    let path = dir.path().to_str().unwrap().to_string();

    // Fill every remaining slot with raw peers.
    let mut peers = Vec::new();
    while let Some(peer) = RawPeer::attach(&path) {
        peers.push(peer);
    }
    assert_eq!(peers.len(), MAX_PEERS - 1);

    // Release the registered client, then grab its slot as soon as the
    // broker frees it, so every slot is held by a raw peer.
    drop(db);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(peer) = RawPeer::attach(&path) {
            peers.push(peer);
            break;
        }
        assert!(Instant::now() < deadline, "released slot never reclaimed");
        thread::sleep(Duration::from_millis(1));
    }

    // A fresh connect must claim a slot - and finds none.
    match Mdb::builder(&path)
        .launch(BrokerLaunch::Thread)
        .nonblocking()
        .connect()
    {
        Err(MdbError::Exhausted) => {}
        other => panic!("expected Exhausted, got {:?}", other.map(|_| ())),
    }

    // One peer leaving makes room again.
    peers.pop().unwrap().crash();
    let db = Mdb::builder(&path)
        .launch(BrokerLaunch::Thread)
        .connect()
        .expect("connect after reclaim");
    db.put("back", &Value::Bool(true)).unwrap();

    drop(db);
    for peer in peers {
        peer.crash();
    }
    wait_broker_exit(&path);
}

#[test]
fn test_stats_reports_engine_text() {
    let (db, dir) = open_store();
    let path = dir.path().to_str().unwrap().to_string();

    db.put("s", &Value::Int(1)).unwrap();
    let stats = db.stats().unwrap();
    assert!(stats.is_some_and(|s| !s.is_empty()));

    drop(db);
    wait_broker_exit(&path);
}

#[test]
fn test_next_id_is_monotone_across_interleaved_allocations() {
    let (db, dir) = open_store();
    let path = dir.path().to_str().unwrap().to_string();

    // Allocate twice without writing rows in between: the high-water
    // cache must keep ids unique.
    let a = db.next_id("Seq.").unwrap();
    let b = db.next_id("Seq.").unwrap();
    assert!(b > a);
    assert_eq!(a.value(), 0);
    assert_eq!(b.value(), 1);

    // A stored row pushes the scan past the cache.
    db.put("Seq.0000000000000005", &Value::None).unwrap();
    let c = db.next_id("Seq.").unwrap();
    assert_eq!(c.value(), 6);

    drop(db);
    wait_broker_exit(&path);
}
