//! Crash simulation and log-driven recovery.
//!
//! A crash is simulated by leaking the storage so neither the final
//! checkpoint nor the clean-shutdown flush runs; the next open must
//! rebuild everything from the write-ahead log.

use lithic::primitives::wal::record::WalRecord;
use lithic::primitives::wal::WriteAheadLog;
use lithic::storage::config::GlobalOptions;
use lithic::storage::engine::PaginatedStorage;
use lithic::types::{RecordId, Result, StorageError, VERSION_SKIP_CHECK};
use lithic::{ClientTransaction, StorageSession};
use tempfile::tempdir;

fn crash(storage: PaginatedStorage) {
    std::mem::forget(storage);
}

#[test]
fn checkpointed_record_survives_a_crash() -> Result<()> {
    let dir = tempdir().unwrap();
    let rid = {
        let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
        let id = storage.add_cluster("Account", None)?;
        let (rid, version) = storage
            .create_record(Some(id), b"alice", 0)?
            .completed()
            .unwrap();
        assert_eq!(version, 1);
        storage.make_full_checkpoint()?;
        crash(storage);
        rid
    };

    let storage = PaginatedStorage::open(dir.path())?;
    let record = storage.read_record(rid)?.unwrap();
    assert_eq!(record.content, b"alice");
    assert_eq!(record.version, 1);
    assert_eq!(storage.count_records(rid.cluster_id)?, 1);
    storage.close()?;
    Ok(())
}

#[test]
fn replay_rebuilds_pages_that_never_reached_disk() -> Result<()> {
    let dir = tempdir().unwrap();
    let (id, rids) = {
        let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
        let id = storage.add_cluster("data", None)?;
        let mut rids = Vec::new();
        for content in [b"a".as_slice(), b"b", b"c"] {
            let (rid, _) = storage
                .create_record(Some(id), content, 0)?
                .completed()
                .unwrap();
            rids.push(rid);
        }
        storage.update_record(rids[0], b"a2", 1, 0)?;
        storage.delete_record(rids[1], VERSION_SKIP_CHECK)?;
        crash(storage);
        (id, rids)
    };

    let storage = PaginatedStorage::open(dir.path())?;
    let first = storage.read_record(rids[0])?.unwrap();
    assert_eq!(first.content, b"a2");
    assert_eq!(first.version, 2);
    assert!(storage.read_record(rids[1])?.is_none());
    assert_eq!(storage.read_record(rids[2])?.unwrap().content, b"c");
    assert_eq!(storage.count_records(id)?, 2);
    storage.close()?;

    // Recovery already checkpointed; a further reopen sees the same state.
    let storage = PaginatedStorage::open(dir.path())?;
    assert_eq!(storage.count_records(id)?, 2);
    assert_eq!(storage.read_record(rids[0])?.unwrap().content, b"a2");
    storage.close()?;
    Ok(())
}

#[test]
fn committed_transaction_survives_a_crash() -> Result<()> {
    let dir = tempdir().unwrap();
    let (id, updated, actual) = {
        let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
        let id = storage.add_cluster("data", None)?;
        let (seed, version) = storage
            .create_record(Some(id), b"seed", 0)?
            .completed()
            .unwrap();
        let mut session = StorageSession::new();
        let mut tx = ClientTransaction::new(1);
        let created = tx.create(id, b"fresh".to_vec(), 0);
        tx.update(seed, b"seed updated".to_vec(), version, 0);
        let results = storage.commit(&mut session, &tx)?;
        let actual = results
            .iter()
            .find(|r| r.requested == created)
            .unwrap()
            .actual;
        crash(storage);
        (id, seed, actual)
    };

    let storage = PaginatedStorage::open(dir.path())?;
    assert_eq!(storage.read_record(updated)?.unwrap().content, b"seed updated");
    assert_eq!(storage.read_record(actual)?.unwrap().content, b"fresh");
    assert_eq!(storage.count_records(id)?, 2);
    storage.close()?;
    Ok(())
}

#[test]
fn rolled_back_transaction_stays_rolled_back_after_a_crash() -> Result<()> {
    let dir = tempdir().unwrap();
    let (r1, r2) = {
        let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
        let id = storage.add_cluster("data", None)?;
        let (r1, v1) = storage
            .create_record(Some(id), b"original", 0)?
            .completed()
            .unwrap();
        let (r2, v2) = storage
            .create_record(Some(id), b"victim", 0)?
            .completed()
            .unwrap();
        let mut session = StorageSession::new();
        let mut tx = ClientTransaction::new(1);
        tx.update(r1, b"changed".to_vec(), v1, 0);
        tx.delete(r2, v2 + 1); // stale version fails the commit
        assert!(matches!(
            storage.commit(&mut session, &tx),
            Err(StorageError::ConcurrentModification { .. })
        ));
        crash(storage);
        (r1, r2)
    };

    let storage = PaginatedStorage::open(dir.path())?;
    let record = storage.read_record(r1)?.unwrap();
    assert_eq!(record.content, b"original");
    assert_eq!(record.version, 1);
    assert_eq!(storage.read_record(r2)?.unwrap().content, b"victim");
    storage.close()?;
    Ok(())
}

#[test]
fn fuzzy_checkpoint_preserves_everything_across_a_crash() -> Result<()> {
    let dir = tempdir().unwrap();
    let id = {
        let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
        let id = storage.add_cluster("data", None)?;
        for i in 0..5u32 {
            storage.create_record(Some(id), &i.to_be_bytes(), 0)?;
        }
        storage.make_fuzzy_checkpoint()?;
        for i in 5..10u32 {
            storage.create_record(Some(id), &i.to_be_bytes(), 0)?;
        }
        crash(storage);
        id
    };

    let storage = PaginatedStorage::open(dir.path())?;
    assert_eq!(storage.count_records(id)?, 10);
    let mut seen = Vec::new();
    let mut cursor = storage.first_record_id(id)?;
    while let Some(rid) = cursor {
        let record = storage.read_record(rid)?.unwrap();
        seen.push(u32::from_be_bytes(record.content.as_slice().try_into().unwrap()));
        cursor = storage.next_record_id(rid)?;
    }
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
    storage.close()?;
    Ok(())
}

#[test]
fn unit_left_open_by_a_crash_is_rolled_back() -> Result<()> {
    let dir = tempdir().unwrap();
    let rid = {
        let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
        let id = storage.add_cluster("data", None)?;
        let (rid, _) = storage
            .create_record(Some(id), b"stable", 0)?
            .completed()
            .unwrap();
        crash(storage);
        rid
    };
    {
        // A unit start with no matching end, as a crash mid-operation
        // would leave behind.
        let wal = WriteAheadLog::open(dir.path())?;
        wal.log(&WalRecord::UnitStart {
            unit: lithic::types::UnitId(9000),
        })?;
        wal.flush()?;
        wal.close()?;
    }

    let storage = PaginatedStorage::open(dir.path())?;
    assert_eq!(storage.read_record(rid)?.unwrap().content, b"stable");
    storage.close()?;

    // The synthesized rollback end keeps a later recovery consistent too.
    let storage = PaginatedStorage::open(dir.path())?;
    assert_eq!(storage.read_record(rid)?.unwrap().content, b"stable");
    storage.close()?;
    Ok(())
}

#[test]
fn truncated_log_tail_stops_replay_without_losing_earlier_records() -> Result<()> {
    let dir = tempdir().unwrap();
    let (id, keep) = {
        let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
        let id = storage.add_cluster("data", None)?;
        let (keep, _) = storage
            .create_record(Some(id), b"keep", 0)?
            .completed()
            .unwrap();
        storage.create_record(Some(id), b"tail", 0)?;
        crash(storage);
        (id, keep)
    };
    // Chop bytes off the log tail, as a crash mid-write would.
    let wal_path = dir.path().join("storage.wal");
    let len = std::fs::metadata(&wal_path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
    file.set_len(len - 5).unwrap();
    drop(file);

    let storage = PaginatedStorage::open(dir.path())?;
    assert_eq!(storage.read_record(keep)?.unwrap().content, b"keep");
    assert!(storage.count_records(id)? >= 1);
    storage.close()?;
    Ok(())
}

#[test]
fn missing_cluster_file_excludes_only_that_cluster() -> Result<()> {
    let dir = tempdir().unwrap();
    let (good, bad, bad_name) = {
        let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
        let good = storage.add_cluster("good", None)?;
        let bad = storage.add_cluster("bad", None)?;
        storage.create_record(Some(good), b"ok", 0)?;
        storage.create_record(Some(bad), b"doomed", 0)?;
        storage.close()?;
        (good, bad, format!("bad_{bad}.lcl"))
    };
    std::fs::remove_file(dir.path().join(bad_name)).unwrap();

    let storage = PaginatedStorage::open(dir.path())?;
    assert_eq!(storage.count_records(good)?, 1);
    assert!(matches!(
        storage.read_record(RecordId::new(bad, 0)),
        Err(StorageError::Configuration(_))
    ));
    storage.close()?;
    Ok(())
}
