//! On-disk behaviour: reopen, snapshots and torn journal tails.

use bucketsync_protocol::{BucketChecksum, Checkpoint, OpId, OplogEntry, SyncDataBatch, SyncDataBucket};
use bucketsync_store::{scan_journal, LocalStore, Row, StoreConfig};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use tempfile::tempdir;

fn sync_one(store: &LocalStore) {
    let data = SyncDataBucket::new(
        "bucket1",
        vec![
            OplogEntry::put(1, "assets", "O1", r#"{"description": "bar"}"#, 1),
            OplogEntry::put(2, "assets", "O2", r#"{"description": "baz"}"#, 2),
        ],
    );
    store.save_sync_data(&SyncDataBatch::from(data)).unwrap();
    let result = store
        .sync_local_database(&Checkpoint::new(2, vec![BucketChecksum::new("bucket1", 3)]), None)
        .unwrap();
    assert!(result.ready);
}

#[test]
fn synced_rows_and_queue_survive_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = LocalStore::open(dir.path()).unwrap();
        sync_one(&store);
        store
            .write_transaction(|tx| {
                let row: Row = json!({"make": "acme"}).as_object().cloned().unwrap();
                tx.put("assets", "O3", row)
            })
            .unwrap();
    }

    let store = LocalStore::open(dir.path()).unwrap();
    assert!(store.open_scan().is_clean());
    assert!(store.has_completed_sync());
    assert_eq!(store.get_all("assets").len(), 3);
    assert_eq!(store.next_crud_item().unwrap().id, "O3");
    assert_eq!(
        store.bucket_states()[0].op_id,
        OpId::new(2),
    );

    // The CRUD sequence continues where it left off.
    store
        .write_transaction(|tx| tx.delete("assets", "O1"))
        .unwrap();
    let ids: Vec<u64> = store.read(|t| t.crud().map(|e| e.client_id).collect());
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn forced_compaction_snapshots_journal() {
    let dir = tempdir().unwrap();
    {
        let store = LocalStore::open(dir.path()).unwrap();
        sync_one(&store);
        let before = store.journal_size().unwrap();
        store.force_compact().unwrap();
        assert!(store.journal_size().unwrap() <= before);
    }

    let bytes = std::fs::read(dir.path().join("journal.bsj")).unwrap();
    let scan = scan_journal(&bytes);
    assert_eq!(scan.snapshots, 1);
    assert_eq!(scan.commits, 0);

    let store = LocalStore::open(dir.path()).unwrap();
    assert_eq!(store.get("assets", "O2").unwrap()["description"], "baz");
}

#[test]
fn torn_tail_is_dropped_on_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = LocalStore::open_with_config(
            dir.path(),
            StoreConfig::new().with_sync_on_commit(false),
        )
        .unwrap();
        sync_one(&store);
    }
    {
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("journal.bsj"))
            .unwrap();
        file.write_all(b"BSJR\x01\x00\x01\xff\xff").unwrap();
    }

    let store = LocalStore::open(dir.path()).unwrap();
    assert!(!store.open_scan().is_clean());
    assert_eq!(store.get_all("assets").len(), 2);

    // The truncated journal is clean for the next opener.
    drop(store);
    let store = LocalStore::open(dir.path()).unwrap();
    assert!(store.open_scan().is_clean());
}
