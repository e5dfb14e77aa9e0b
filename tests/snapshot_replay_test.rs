//! End-to-end test: a replicated map service running on the segmented log,
//! snapshotted mid-stream, compacted, and rebuilt on a fresh replica from
//! snapshot plus log tail.

use tempfile::TempDir;

use raft_logstore::{
    LogManager, LogManagerOptions, MapCommand, MapService, SnapshotService, StorageError,
};

fn test_options(dir: &TempDir) -> LogManagerOptions {
    LogManagerOptions {
        dir: dir.path().to_path_buf(),
        max_segment_size: 1024,
        max_entry_size: 4096,
        index_granularity: 4,
        flush_on_append: false,
    }
}

fn put(session: u64, sequence: u64, key: &str, value: &str) -> MapCommand {
    MapCommand::Put {
        session,
        sequence,
        key: key.to_string(),
        value: value.as_bytes().to_vec(),
    }
}

#[test]
fn test_snapshot_restore_replays_to_equivalent_state() {
    let dir = TempDir::new().unwrap();
    let manager = LogManager::<MapCommand>::open(test_options(&dir)).unwrap();

    // A primary replica applies every command as it is appended.
    let mut primary = MapService::new();
    for i in 1..=40u64 {
        let command = put(1, i, &format!("key_{}", i % 8), &format!("value_{}", i));
        let indexed = manager.append(command).unwrap();
        primary.apply(&indexed).unwrap();
    }

    // Snapshot at the current applied index.
    let snapshot_index = primary.last_applied();
    assert_eq!(snapshot_index, 40);
    let mut snapshot = Vec::new();
    primary.backup(&mut snapshot).unwrap();

    // More traffic after the snapshot.
    for i in 41..=60u64 {
        let command = put(1, i, &format!("key_{}", i % 8), &format!("value_{}", i));
        let indexed = manager.append(command).unwrap();
        primary.apply(&indexed).unwrap();
    }

    // A fresh replica bootstraps from the snapshot, then catches up from
    // the log tail only.
    let mut replica = MapService::new();
    replica.restore(&mut snapshot.as_slice()).unwrap();
    assert_eq!(replica.last_applied(), snapshot_index);

    let next = manager.replay_into(&mut replica, snapshot_index + 1).unwrap();
    assert_eq!(next, manager.last_index() + 1);

    assert_eq!(replica.last_applied(), primary.last_applied());
    assert_eq!(replica.len(), primary.len());
    for i in 0..8u64 {
        let key = format!("key_{}", i);
        assert_eq!(replica.get(&key), primary.get(&key));
        assert_eq!(replica.version(&key), primary.version(&key));
    }
}

#[test]
fn test_compaction_after_snapshot_preserves_tail_reads() {
    let dir = TempDir::new().unwrap();
    let manager = LogManager::<MapCommand>::open(test_options(&dir)).unwrap();

    let mut service = MapService::new();
    for i in 1..=80u64 {
        let indexed = manager
            .append(put(1, i, &format!("key_{}", i), "x"))
            .unwrap();
        service.apply(&indexed).unwrap();
    }
    let segments_before = manager.segment_count();
    assert!(segments_before > 2);

    // With the snapshot durable, the covered prefix can go.
    let snapshot_index = service.last_applied();
    let removed = manager.compact(snapshot_index).unwrap();
    assert!(removed > 0);

    let first = manager.first_index();
    assert!(first > 1);
    assert!(matches!(
        manager.read(first - 1),
        Err(StorageError::InvalidIndex { .. })
    ));

    // The retained tail still replays cleanly onto a restored replica.
    let mut snapshot = Vec::new();
    service.backup(&mut snapshot).unwrap();
    let mut replica = MapService::new();
    replica.restore(&mut snapshot.as_slice()).unwrap();
    manager.replay_into(&mut replica, first).unwrap();
    assert_eq!(replica.last_applied(), service.last_applied());
    assert_eq!(replica.len(), service.len());
}

#[test]
fn test_replay_skips_duplicate_client_commands() {
    let dir = TempDir::new().unwrap();
    let manager = LogManager::<MapCommand>::open(test_options(&dir)).unwrap();

    // A client retry appends the same (session, sequence) command twice at
    // two log indices; state machines apply its effect once.
    manager.append(put(7, 1, "counter", "first")).unwrap();
    manager.append(put(7, 1, "counter", "retry")).unwrap();
    manager.append(put(7, 2, "counter", "second")).unwrap();

    let mut service = MapService::new();
    manager.replay_into(&mut service, 1).unwrap();

    assert_eq!(service.get("counter"), Some("second".as_bytes()));
    // Versions advance once per effective command, not per log entry.
    assert_eq!(service.version("counter"), Some(2));
    assert_eq!(service.last_applied(), 3);
}

#[test]
fn test_restart_then_replay_matches_pre_restart_state() {
    let dir = TempDir::new().unwrap();
    let mut before = MapService::new();
    {
        let manager = LogManager::<MapCommand>::open(test_options(&dir)).unwrap();
        for i in 1..=50u64 {
            let indexed = manager
                .append(put(1, i, &format!("key_{}", i % 5), &format!("v{}", i)))
                .unwrap();
            before.apply(&indexed).unwrap();
        }
        manager.flush().unwrap();
    }

    let manager = LogManager::<MapCommand>::open(test_options(&dir)).unwrap();
    assert_eq!(manager.last_index(), 50);

    let mut after = MapService::new();
    manager.replay_into(&mut after, 1).unwrap();

    assert_eq!(after.last_applied(), before.last_applied());
    for i in 0..5u64 {
        let key = format!("key_{}", i);
        assert_eq!(after.get(&key), before.get(&key));
        assert_eq!(after.version(&key), before.version(&key));
    }
}

#[test]
fn test_truncate_then_replay_reflects_rewritten_suffix() {
    let dir = TempDir::new().unwrap();
    let manager = LogManager::<MapCommand>::open(test_options(&dir)).unwrap();

    for i in 1..=30u64 {
        manager.append(put(1, i, "key", &format!("old_{}", i))).unwrap();
    }

    // A leadership change invalidates the suffix; the replacement entries
    // reuse the truncated indices.
    manager.truncate(21).unwrap();
    for i in 21..=25u64 {
        let indexed = manager.append(put(2, i, "key", &format!("new_{}", i))).unwrap();
        assert_eq!(indexed.index, i);
    }

    let mut service = MapService::new();
    manager.replay_into(&mut service, 1).unwrap();
    assert_eq!(service.get("key"), Some("new_25".as_bytes()));
    assert_eq!(service.last_applied(), 25);
}
