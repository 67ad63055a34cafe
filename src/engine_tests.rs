//! End-to-end engine scenarios: page-boundary behavior, region
//! transitions, pending I/O, manual locking, replica tail-sync, and
//! checkpoint/recovery, each driven through the public store surface.

use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;

use crate::address::Address;
use crate::common::{Config, SyncMode};
use crate::locking::{LockKind, LockRequest};
use crate::record::required_size;
use crate::scan::BufferingMode;
use crate::status::{CompletedOp, DeleteOutcome, ReadOutcome, UpdateOutcome};
use crate::store::{RawStoreFunctions, Spinel, SpinelStore, StoreFunctions};

const PAGE: u64 = 1024;

fn engine_config(dir: &Path) -> Config {
    Config {
        storage_dir: dir.to_string_lossy().to_string(),
        memory_size: 16 * PAGE,
        page_size: PAGE as u32,
        index_buckets: 256,
        segment_size: 8 * PAGE,
        sector_size: 512,
        max_key_size: 64,
        max_value_size: 800,
        ..Default::default()
    }
}

fn open(dir: &Path) -> Arc<Spinel> {
    SpinelStore::open(engine_config(dir), RawStoreFunctions).unwrap()
}

#[test]
fn scenario_page_boundary_fillers() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    store.upsert(b"1", &[1u8; 800]).unwrap();
    store.upsert(b"2", &[2u8; 800]).unwrap();

    // Third value sized so its record exactly fills out page 1.
    let tail = store.hlog().tail_address().control();
    assert!(tail < 2 * PAGE);
    let remaining = (2 * PAGE - tail) as u32;
    let p2v2len = (0..=remaining as usize)
        .find(|&len| required_size(1, len, false) == remaining)
        .expect("some value length lands exactly on the page boundary");
    store.upsert(b"3", &vec![3u8; p2v2len]).unwrap();
    assert_eq!(store.hlog().tail_address().control(), 2 * PAGE);

    store.upsert(b"4", &[4u8; 64]).unwrap();

    let entries: Vec<_> = store
        .scan(BufferingMode::SinglePageBuffering)
        .collect::<crate::common::Result<_>>()
        .unwrap();
    let sizes: Vec<usize> = entries.iter().map(|e| e.value.len()).collect();
    let keys: Vec<&[u8]> = entries.iter().map(|e| e.key.as_slice()).collect();
    assert_eq!(keys, vec![b"1" as &[u8], b"2", b"3", b"4"]);
    assert_eq!(sizes, vec![800, 800, p2v2len, 64]);

    // No record straddles a page.
    let geometry = *store.hlog().geometry();
    for entry in &entries {
        let last_byte = Address::from_control(entry.next_address.control() - 1);
        assert_eq!(geometry.page(entry.address), geometry.page(last_byte));
    }
}

#[test]
fn scenario_in_place_then_copy_update() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    store.upsert(b"1", b"10").unwrap();

    // While the record is mutable, a same-size upsert happens in place.
    assert_eq!(
        store.upsert(b"1", b"11").unwrap(),
        UpdateOutcome::InPlaceUpdated
    );

    // Freeze the mutable region, then update again.
    let tail = store.hlog().tail_address();
    store.hlog().shift_read_only(tail);
    store.epoch().drain_blocking();

    assert_eq!(store.upsert(b"1", b"20").unwrap(), UpdateOutcome::CopyUpdated);
    assert_eq!(store.read(b"1").unwrap(), ReadOutcome::Found(b"20".to_vec()));

    // Both versions are on the log; the newer one is the reachable head.
    let versions: Vec<_> = store
        .scan(BufferingMode::SinglePageBuffering)
        .map(|e| e.unwrap())
        .filter(|e| e.key == b"1")
        .collect();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions.last().unwrap().value, b"20");
    assert_eq!(
        versions.last().unwrap().info.previous_address(),
        versions.first().unwrap().address
    );
}

#[test]
fn scenario_pending_read_roundtrip() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    for i in 0..700u32 {
        store
            .upsert(format!("key-{}", i).as_bytes(), &i.to_le_bytes())
            .unwrap();
    }
    store.flush_and_evict(true).unwrap();

    let serial = match store.read(b"key-100").unwrap() {
        ReadOutcome::Pending(serial) => serial,
        other => panic!("expected a pending read, got {:?}", other),
    };

    let completed = store.complete_pending(true).unwrap();
    assert_eq!(completed.len(), 1);
    match &completed[0] {
        CompletedOp::Read { serial: s, result } => {
            assert_eq!(*s, serial);
            assert_eq!(
                result.as_ref().unwrap(),
                &ReadOutcome::Found(100u32.to_le_bytes().to_vec())
            );
        }
        other => panic!("unexpected completion {:?}", other),
    }
}

#[test]
fn scenario_manual_multi_key_lock() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    store.upsert(b"24", &7u64.to_le_bytes()).unwrap();
    store.upsert(b"51", &35u64.to_le_bytes()).unwrap();
    store.upsert(b"R", &0u64.to_le_bytes()).unwrap();

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let reader = {
        let store = store.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Acquire) {
                match store.read(b"R").unwrap() {
                    ReadOutcome::Found(v) => {
                        let value = u64::from_le_bytes(v.try_into().unwrap());
                        assert!(value == 0 || value == 42, "torn read: {}", value);
                    }
                    other => panic!("R disappeared: {:?}", other),
                }
            }
        })
    };

    // Lock {S(24), S(51), X(R)}, derive R from the two reads, publish R.
    let requests = [
        LockRequest::shared(b"24"),
        LockRequest::shared(b"51"),
        LockRequest::exclusive(b"R"),
    ];
    let set = store
        .lock_table()
        .try_lock(&requests, std::time::Duration::from_secs(1))
        .unwrap();
    let a = match store.read_locked(b"24", &set).unwrap() {
        ReadOutcome::Found(v) => u64::from_le_bytes(v.try_into().unwrap()),
        other => panic!("{:?}", other),
    };
    let b = match store.read_locked(b"51", &set).unwrap() {
        ReadOutcome::Found(v) => u64::from_le_bytes(v.try_into().unwrap()),
        other => panic!("{:?}", other),
    };
    assert!(set.covers(crate::index::KeyHash::of(b"R"), LockKind::Exclusive));
    store
        .upsert_locked(b"R", &(a + b).to_le_bytes(), &set)
        .unwrap();
    drop(set);

    stop.store(true, std::sync::atomic::Ordering::Release);
    reader.join().unwrap();

    assert_eq!(
        store.read(b"R").unwrap(),
        ReadOutcome::Found(42u64.to_le_bytes().to_vec())
    );
    // No lock leaked: every latch returned to idle.
    for bucket in 0..store.config().index_buckets {
        assert!(!store.lock_table().latch(bucket).is_locked());
    }
}

#[test]
fn scenario_aof_truncate_behind_replica() {
    struct SinkClient;
    impl crate::aof::ReplicaClient for SinkClient {
        fn send(&self, _bytes: &[u8]) -> crate::common::Result<()> {
            Ok(())
        }
    }

    let dir = tempdir().unwrap();
    let mut config = engine_config(dir.path());
    config.aof.enabled = true;
    config.aof.main_memory = true;
    config.aof.page_size = 64;
    config.sync_mode = SyncMode::Always;
    let store = SpinelStore::open(config, RawStoreFunctions).unwrap();
    let aof = store.aof().unwrap().clone();

    let replica = aof.register_replica(0, Arc::new(SinkClient)).unwrap();
    for i in 0..32u32 {
        store.upsert(&i.to_le_bytes(), &[0u8; 48]).unwrap();
    }
    aof.stream_pending();
    let acked = aof.cursor(replica).unwrap().previous_address;
    assert_eq!(acked, aof.committed_until());

    // Truncating just past the cursor is capped at the cursor itself,
    // and the registered cursor stays valid.
    let cut = aof.safe_truncate_until(acked + 1).unwrap();
    assert!(cut <= acked);
    assert!(aof.cursor(replica).unwrap().previous_address >= cut);

    // A new replica starting inside the truncated prefix is refused in
    // non-lossy mode.
    let err = aof.register_replica(0, Arc::new(SinkClient)).unwrap_err();
    assert!(matches!(
        err,
        crate::common::SpinelError::ReplicaTooFarBehind { .. }
    ));
}

#[test]
fn scenario_checkpoint_recover_scan() {
    let dir = tempdir().unwrap();
    let total: u32 = 5000;
    let checkpoint_every: u32 = 1000;
    {
        let store = open(dir.path());
        for i in 0..total {
            store
                .upsert(format!("user:{}", i).as_bytes(), &(i * 3).to_le_bytes())
                .unwrap();
            if (i + 1) % checkpoint_every == 0 {
                store.checkpoint_foldover().unwrap();
            }
        }
        // Simulated crash: the store is dropped without close().
    }

    let store = open(dir.path());
    let live = store.collect_live().unwrap();
    assert_eq!(live.len(), total as usize);
    for (key, value) in live {
        let id: u32 = std::str::from_utf8(&key)
            .unwrap()
            .strip_prefix("user:")
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(value, (id * 3).to_le_bytes().to_vec());
    }
}

#[test]
fn scenario_upsert_read_delete_laws() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    store.upsert(b"law", b"v").unwrap();
    assert_eq!(store.read(b"law").unwrap(), ReadOutcome::Found(b"v".to_vec()));

    assert_eq!(store.delete(b"law").unwrap(), DeleteOutcome::InPlace);
    assert_eq!(store.read(b"law").unwrap(), ReadOutcome::NotFound);

    // Deleting a key whose record left the mutable region appends a
    // tombstone instead of chasing the disk.
    store.upsert(b"law2", b"v").unwrap();
    let tail = store.hlog().tail_address();
    store.hlog().shift_read_only(tail);
    store.epoch().drain_blocking();
    assert_eq!(store.delete(b"law2").unwrap(), DeleteOutcome::Appended);
    assert_eq!(store.read(b"law2").unwrap(), ReadOutcome::NotFound);
}

#[test]
fn scenario_rmw_counter_semantics() {
    struct CounterFunctions;
    impl StoreFunctions for CounterFunctions {
        fn initial_value(&self, _key: &[u8], input: &[u8]) -> Vec<u8> {
            input.to_vec()
        }
        fn copy_value(&self, _key: &[u8], input: &[u8], old_value: &[u8]) -> Vec<u8> {
            let old = u64::from_le_bytes(old_value.try_into().unwrap());
            let delta = u64::from_le_bytes(input.try_into().unwrap());
            (old + delta).to_le_bytes().to_vec()
        }
        fn update_in_place(&self, _key: &[u8], input: &[u8], value: &mut [u8]) -> bool {
            let old = u64::from_le_bytes((&*value).try_into().unwrap());
            let delta = u64::from_le_bytes(input.try_into().unwrap());
            value.copy_from_slice(&(old + delta).to_le_bytes());
            true
        }
        fn read_value(&self, _key: &[u8], _input: Option<&[u8]>, value: &[u8]) -> Vec<u8> {
            value.to_vec()
        }
    }

    let dir = tempdir().unwrap();
    let store = SpinelStore::open(engine_config(dir.path()), CounterFunctions).unwrap();

    assert_eq!(
        store.rmw(b"hits", &1u64.to_le_bytes()).unwrap(),
        UpdateOutcome::Created
    );
    for _ in 0..9 {
        assert_eq!(
            store.rmw(b"hits", &1u64.to_le_bytes()).unwrap(),
            UpdateOutcome::InPlaceUpdated
        );
    }
    assert_eq!(
        store.read(b"hits").unwrap(),
        ReadOutcome::Found(10u64.to_le_bytes().to_vec())
    );

    // Freeze the region: the next increment must copy forward.
    let tail = store.hlog().tail_address();
    store.hlog().shift_read_only(tail);
    store.epoch().drain_blocking();
    assert_eq!(
        store.rmw(b"hits", &5u64.to_le_bytes()).unwrap(),
        UpdateOutcome::CopyUpdated
    );
    assert_eq!(
        store.read(b"hits").unwrap(),
        ReadOutcome::Found(15u64.to_le_bytes().to_vec())
    );
}

#[test]
fn scenario_rmw_pending_resumes_with_same_input() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    store.upsert(b"cold", b"original").unwrap();
    store.flush_and_evict(true).unwrap();

    // The old value is on disk; the RMW must fetch it first.
    let outcome = store.rmw(b"cold", b"rewritten").unwrap();
    let serial = match outcome {
        UpdateOutcome::Pending(serial) => serial,
        other => panic!("expected pending rmw, got {:?}", other),
    };
    let completed = store.complete_pending(true).unwrap();
    assert_eq!(completed.len(), 1);
    match &completed[0] {
        CompletedOp::Rmw { serial: s, result } => {
            assert_eq!(*s, serial);
            assert_eq!(result.as_ref().unwrap(), &UpdateOutcome::CopyUpdated);
        }
        other => panic!("unexpected completion {:?}", other),
    }
    assert_eq!(
        store.read(b"cold").unwrap(),
        ReadOutcome::Found(b"rewritten".to_vec())
    );
}

#[test]
fn scenario_threshold_monotonicity_under_churn() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    let mut last = (
        Address::NULL.control(),
        Address::NULL.control(),
        Address::NULL.control(),
        Address::NULL.control(),
    );
    for i in 0..400u32 {
        store.upsert(&i.to_le_bytes(), &[0u8; 128]).unwrap();
        if i % 50 == 49 {
            store.flush_and_evict(true).unwrap();
        }
        let stats = store.stats();
        let now = (
            stats.begin_address,
            stats.head_address,
            stats.read_only_address,
            stats.tail_address,
        );
        assert!(now.0 >= last.0 && now.1 >= last.1 && now.2 >= last.2 && now.3 >= last.3);
        assert!(now.0 <= now.1 && now.1 <= now.2 && now.2 <= now.3);
        last = now;
    }
}
