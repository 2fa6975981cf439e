//! zonekv - Integration Tests
//! End-to-end tests validating the full engine lifecycle:
//! open → put → get → delete → scan → flush → compact → crash recovery.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use zonekv::{Config, MemoryZonedDevice, WriteBatch, ZoneKv};

mod common {
    use super::*;

    /// Small zones and buffers so flushes and compactions happen quickly.
    pub fn config() -> Config {
        Config::small("unused").with_sync_writes(false)
    }

    pub fn device() -> MemoryZonedDevice {
        MemoryZonedDevice::new(1024 * 1024, 96)
    }

    pub fn open(device: &MemoryZonedDevice, config: Config) -> ZoneKv {
        ZoneKv::open_with_device(config, Arc::new(device.clone())).unwrap()
    }

    pub fn table_count(db: &ZoneKv) -> usize {
        (0..7)
            .map(|level| {
                db.get_property(&format!("zonekv.num-files-at-level{}", level))
                    .unwrap()
                    .parse::<usize>()
                    .unwrap()
            })
            .sum()
    }

    /// Poll `check` until it holds or the deadline passes.
    pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        check()
    }
}

#[test]
fn test_basic_put_get_delete() {
    let device = common::device();
    let db = common::open(&device, common::config());

    db.put(b"name".to_vec(), b"zonekv".to_vec(), false).unwrap();
    db.put(b"version".to_vec(), b"0.1.0".to_vec(), true).unwrap();

    assert_eq!(db.get(b"name").unwrap(), Some(b"zonekv".to_vec()));
    assert_eq!(db.get(b"version").unwrap(), Some(b"0.1.0".to_vec()));
    assert_eq!(db.get(b"missing").unwrap(), None);

    db.delete(b"name".to_vec(), false).unwrap();
    assert_eq!(db.get(b"name").unwrap(), None);
    assert_eq!(db.get(b"version").unwrap(), Some(b"0.1.0".to_vec()));
}

#[test]
fn test_invalid_arguments_rejected() {
    let device = common::device();
    let config = common::config();
    let max = config.max_value_size;
    let db = common::open(&device, config);

    assert!(matches!(
        db.put(Vec::new(), b"v".to_vec(), false),
        Err(zonekv::Error::InvalidArgument(_))
    ));
    assert!(matches!(
        db.put(b"k".to_vec(), vec![0u8; max + 1], false),
        Err(zonekv::Error::InvalidArgument(_))
    ));
}

#[test]
fn test_scan_sorted_order_skips_deleted() {
    let device = common::device();
    let db = common::open(&device, common::config());

    db.put(b"charlie".to_vec(), b"3".to_vec(), false).unwrap();
    db.put(b"alpha".to_vec(), b"1".to_vec(), false).unwrap();
    db.put(b"bravo".to_vec(), b"2".to_vec(), false).unwrap();
    db.put(b"delta".to_vec(), b"4".to_vec(), false).unwrap();
    db.delete(b"bravo".to_vec(), false).unwrap();

    let entries = db.scan().unwrap();
    let keys: Vec<&[u8]> = entries.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![&b"alpha"[..], b"charlie", b"delta"]);

    let mut iter = db.new_iterator(None).unwrap();
    iter.seek(b"b").unwrap();
    assert_eq!(iter.key(), Some(&b"charlie"[..]));
    assert_eq!(iter.value(), Some(&b"3"[..]));
}

#[test]
fn test_write_batch_is_atomic_and_ordered() {
    let device = common::device();
    let db = common::open(&device, common::config());

    let mut batch = WriteBatch::new();
    batch.put(b"k".to_vec(), b"first".to_vec());
    batch.put(b"other".to_vec(), b"x".to_vec());
    batch.put(b"k".to_vec(), b"second".to_vec());
    batch.delete(b"other".to_vec());
    db.write(batch, true).unwrap();

    assert_eq!(db.get(b"k").unwrap(), Some(b"second".to_vec()));
    assert_eq!(db.get(b"other").unwrap(), None);
}

#[test]
fn test_unflushed_writes_survive_reopen() {
    let device = common::device();
    {
        let db = common::open(&device, common::config());
        db.put(b"A".to_vec(), b"1".to_vec(), false).unwrap();
        db.put(b"B".to_vec(), b"2".to_vec(), false).unwrap();
        db.put(b"C".to_vec(), b"3".to_vec(), false).unwrap();
        db.delete(b"B".to_vec(), false).unwrap();
    }

    let db = common::open(&device, common::config());
    assert_eq!(db.get(b"A").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"B").unwrap(), None);
    assert_eq!(db.get(b"C").unwrap(), Some(b"3".to_vec()));
    assert!(db.metrics().wal_recoveries.load(Ordering::Relaxed) >= 1);

    // Writes continue with higher sequence numbers.
    db.put(b"A".to_vec(), b"one".to_vec(), true).unwrap();
    drop(db);
    let db = common::open(&device, common::config());
    assert_eq!(db.get(b"A").unwrap(), Some(b"one".to_vec()));
}

#[test]
fn test_file_device_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::small(dir.path()).with_geometry(1024 * 1024, 24);
    {
        let db = ZoneKv::open(config.clone()).unwrap();
        for i in 0..200 {
            db.put(format!("key_{:04}", i), format!("value_{}", i), false).unwrap();
        }
        db.flush(true, true, false).unwrap();
        db.put(b"tail".to_vec(), b"in the log".to_vec(), true).unwrap();
        db.close().unwrap();
    }

    let db = ZoneKv::open(config).unwrap();
    assert_eq!(db.get(b"key_0042").unwrap(), Some(b"value_42".to_vec()));
    assert_eq!(db.get(b"tail").unwrap(), Some(b"in the log".to_vec()));
    assert_eq!(db.scan().unwrap().len(), 201);
}

#[test]
fn test_large_value_goes_to_value_file() {
    let device = common::device();
    let db = common::open(&device, common::config());
    let records = |db: &ZoneKv| -> u64 { db.value_file_stats().values().map(|s| s.total).sum() };
    let before = records(&db);

    let big = vec![0xAB; 300_000];
    db.put(b"big".to_vec(), big.clone(), false).unwrap();
    db.put(b"small".to_vec(), b"tiny".to_vec(), false).unwrap();
    db.flush(true, true, false).unwrap();

    assert_eq!(records(&db), before + 1);
    assert_eq!(db.get(b"big").unwrap(), Some(big.clone()));
    assert_eq!(db.get(b"small").unwrap(), Some(b"tiny".to_vec()));
    assert!(db.get_property("zonekv.value-files").unwrap().contains("total"));

    drop(db);
    let db = common::open(&device, common::config());
    assert_eq!(db.get(b"big").unwrap(), Some(big));
}

#[test]
fn test_compaction_keeps_newest_and_deletes_old_table() {
    let device = common::device();
    let db = common::open(&device, common::config());

    db.put(b"k".to_vec(), b"v1".to_vec(), false).unwrap();
    db.flush(true, true, false).unwrap();
    db.put(b"k".to_vec(), b"v2".to_vec(), false).unwrap();
    db.flush(true, true, false).unwrap();
    assert_eq!(common::table_count(&db), 2);

    db.compact().unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(
        db.get_property("zonekv.num-files-at-level0").as_deref(),
        Some("0")
    );
    assert_eq!(common::table_count(&db), 1);
}

#[test]
fn test_latest_write_wins_across_flushes() {
    let device = common::device();
    let db = common::open(&device, common::config());

    for round in 0..5 {
        for i in 0..300 {
            db.put(format!("key_{:04}", i), format!("round_{}_{}", round, i), false)
                .unwrap();
        }
        db.flush(true, true, false).unwrap();
    }
    for i in (0..300).step_by(3) {
        db.delete(format!("key_{:04}", i), false).unwrap();
    }

    for i in 0..300 {
        let value = db.get(format!("key_{:04}", i).as_bytes()).unwrap();
        if i % 3 == 0 {
            assert_eq!(value, None);
        } else {
            assert_eq!(value, Some(format!("round_4_{}", i).into_bytes()));
        }
    }

    db.compact().unwrap();
    assert_eq!(db.scan().unwrap().len(), 200);
    assert_eq!(
        db.get(b"key_0001").unwrap(),
        Some(b"round_4_1".to_vec())
    );
}

#[test]
fn test_snapshot_sees_old_value_through_compaction() {
    let device = common::device();
    let db = common::open(&device, common::config());

    db.put(b"k".to_vec(), b"old".to_vec(), false).unwrap();
    db.put(b"gone".to_vec(), b"here".to_vec(), false).unwrap();
    let snapshot = db.snapshot();
    db.put(b"k".to_vec(), b"new".to_vec(), false).unwrap();
    db.delete(b"gone".to_vec(), false).unwrap();

    assert_eq!(db.get(b"k").unwrap(), Some(b"new".to_vec()));
    assert_eq!(db.get_at(b"k", &snapshot).unwrap(), Some(b"old".to_vec()));

    db.flush(true, true, false).unwrap();
    db.compact().unwrap();
    assert_eq!(db.get_at(b"k", &snapshot).unwrap(), Some(b"old".to_vec()));
    assert_eq!(db.get_at(b"gone", &snapshot).unwrap(), Some(b"here".to_vec()));
    assert_eq!(db.get(b"gone").unwrap(), None);

    let at_snapshot: Vec<_> = db
        .new_iterator(Some(&snapshot))
        .unwrap()
        .collect::<zonekv::Result<_>>()
        .unwrap();
    assert_eq!(
        at_snapshot,
        vec![
            (b"gone".to_vec(), b"here".to_vec()),
            (b"k".to_vec(), b"old".to_vec())
        ]
    );
}

#[test]
fn test_snapshots_of_many_versions_survive_compaction() {
    let device = common::device();
    let db = common::open(&device, common::config());

    let version = |i: usize| {
        let mut value = format!("v{:04}", i).into_bytes();
        value.resize(1000, b'.');
        value
    };
    let mut snapshots = Vec::new();
    for i in 0..200 {
        db.put(b"k".to_vec(), version(i), false).unwrap();
        snapshots.push((i, db.snapshot()));
    }

    db.flush(true, true, false).unwrap();
    db.compact().unwrap();

    for (i, snapshot) in &snapshots {
        assert_eq!(
            db.get_at(b"k", snapshot).unwrap(),
            Some(version(*i)),
            "snapshot after write {}",
            i
        );
    }
    assert_eq!(db.get(b"k").unwrap(), Some(version(199)));
}

#[test]
fn test_open_rejects_zone_smaller_than_value_section() {
    let device = MemoryZonedDevice::new(256 * 1024, 96);
    let result = ZoneKv::open_with_device(common::config(), Arc::new(device));
    assert!(matches!(result, Err(zonekv::Error::InvalidArgument(_))));
}

#[test]
fn test_concurrent_writers_group_commit() {
    let device = common::device();
    let db = Arc::new(common::open(&device, common::config()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = Arc::clone(&db);
            std::thread::spawn(move || {
                for i in 0..250 {
                    db.put(format!("t{}_{:04}", t, i), format!("v{}", i), i % 50 == 0)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(db.scan().unwrap().len(), 1000);
    assert_eq!(db.get(b"t3_0249").unwrap(), Some(b"v249".to_vec()));
    assert!(db.metrics().group_commits.load(Ordering::Relaxed) <= 1000);
}

#[test]
fn test_sparse_value_file_is_emptied_and_reclaimed() {
    let device = common::device();
    let config = common::config().with_idle_after(Duration::ZERO);
    let value = |i: usize| vec![i as u8; 40 * 1024];

    let sparse = {
        let db = common::open(&device, config.clone());
        for i in 0..4 {
            db.put(format!("big{}", i), value(i), false).unwrap();
        }
        db.flush(true, true, false).unwrap();
        let files: Vec<u64> = db.value_file_stats().keys().copied().collect();
        assert_eq!(files.len(), 1);

        for i in 0..3 {
            db.put(format!("big{}", i), b"small".to_vec(), false).unwrap();
        }
        db.flush(true, true, false).unwrap();
        db.compact().unwrap();
        let stats = db.value_file_stats()[&files[0]];
        assert_eq!(stats.total, 4);
        assert_eq!(stats.deleted, 3);
        files[0]
    };

    // After reopening the file is closed for writing and becomes a candidate.
    let db = common::open(&device, config);
    let moved = common::wait_until(Duration::from_secs(10), || {
        db.metrics().values_moved.load(Ordering::Relaxed) >= 1
    });
    assert!(moved, "live value was not moved out of the sparse file");
    assert_eq!(db.get(b"big3").unwrap(), Some(value(3)));

    db.flush(true, true, false).unwrap();
    db.compact().unwrap();
    assert!(!db.value_file_stats().contains_key(&sparse));
    assert_eq!(db.get(b"big3").unwrap(), Some(value(3)));
    assert_eq!(db.get(b"big0").unwrap(), Some(b"small".to_vec()));
}

#[test]
fn test_properties() {
    let device = common::device();
    let db = common::open(&device, common::config());
    db.put(b"a".to_vec(), b"1".to_vec(), false).unwrap();
    db.flush(true, true, false).unwrap();

    assert_eq!(
        db.get_property("zonekv.num-files-at-level0").as_deref(),
        Some("1")
    );
    assert_eq!(db.get_property("zonekv.num-files-at-level7"), None);
    assert_eq!(db.get_property("zonekv.unknown"), None);
    assert_eq!(db.get_property("other.stats"), None);
    assert!(db.get_property("zonekv.stats").unwrap().contains("Level"));
    assert!(db.get_property("zonekv.sstables").unwrap().contains("level 0"));
    assert!(db.get_property("zonekv.zones").unwrap().contains("zone"));
    assert!(db.get_property("zonekv.metrics").unwrap().contains("flushes"));
}

#[test]
fn test_closing_flush_stops_writes() {
    let device = common::device();
    let db = common::open(&device, common::config());
    db.put(b"a".to_vec(), b"1".to_vec(), false).unwrap();
    db.flush(true, true, true).unwrap();
    assert!(matches!(
        db.put(b"b".to_vec(), b"2".to_vec(), false),
        Err(zonekv::Error::ShuttingDown)
    ));
    drop(db);

    let db = common::open(&device, common::config());
    assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
}
