//! Transaction commit: atomicity, provisional identities, unit framing.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lithic::primitives::wal::record::WalRecord;
use lithic::primitives::wal::WriteAheadLog;
use lithic::storage::config::GlobalOptions;
use lithic::storage::engine::PaginatedStorage;
use lithic::types::{Result, StorageError, VERSION_SKIP_CHECK};
use lithic::{ClientTransaction, StorageSession};
use tempfile::{tempdir, TempDir};

fn storage_with_cluster() -> Result<(TempDir, PaginatedStorage, u32)> {
    let dir = tempdir().unwrap();
    let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
    let id = storage.add_cluster("data", None)?;
    Ok((dir, storage, id))
}

#[test]
fn commit_applies_every_operation() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let (r1, v1) = storage
        .create_record(Some(id), b"one", 0)?
        .completed()
        .unwrap();
    let (r2, v2) = storage
        .create_record(Some(id), b"two", 0)?
        .completed()
        .unwrap();

    let mut session = StorageSession::new();
    let mut tx = ClientTransaction::new(7);
    let created = tx.create(id, b"three".to_vec(), 0);
    tx.update(r1, b"one updated".to_vec(), v1, 0);
    tx.delete(r2, v2);
    let results = storage.commit(&mut session, &tx)?;

    assert_eq!(results.len(), 3);
    let actual = results[0].actual;
    assert_ne!(actual, created);
    assert_eq!(results[0].requested, created);
    assert_eq!(storage.read_record(actual)?.unwrap().content, b"three");
    assert_eq!(storage.read_record(r1)?.unwrap().content, b"one updated");
    assert_eq!(results[1].version, v1 + 1);
    assert!(storage.read_record(r2)?.is_none());
    assert_eq!(results[2].version, -1);
    assert_eq!(session.active_transaction(), None);
    storage.close()?;
    Ok(())
}

#[test]
fn later_operations_may_target_in_transaction_creates() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let mut session = StorageSession::new();
    let mut tx = ClientTransaction::new(1);
    let provisional = tx.create(id, b"draft".to_vec(), 0);
    tx.update(provisional, b"final".to_vec(), VERSION_SKIP_CHECK, 0);
    let results = storage.commit(&mut session, &tx)?;

    let actual = results[0].actual;
    assert_eq!(results[1].actual, actual);
    let record = storage.read_record(actual)?.unwrap();
    assert_eq!(record.content, b"final");
    assert_eq!(record.version, 2);
    Ok(())
}

#[test]
fn failed_commit_leaves_no_trace() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let (r1, v1) = storage
        .create_record(Some(id), b"original", 0)?
        .completed()
        .unwrap();
    let (r2, v2) = storage
        .create_record(Some(id), b"victim", 0)?
        .completed()
        .unwrap();

    let mut session = StorageSession::new();
    let mut tx = ClientTransaction::new(2);
    tx.create(id, b"phantom".to_vec(), 0);
    tx.update(r1, b"changed".to_vec(), v1, 0);
    tx.delete(r2, v2 + 9); // stale version, must sink the whole batch
    assert!(matches!(
        storage.commit(&mut session, &tx),
        Err(StorageError::ConcurrentModification { .. })
    ));

    let record = storage.read_record(r1)?.unwrap();
    assert_eq!(record.content, b"original");
    assert_eq!(record.version, v1);
    assert_eq!(storage.read_record(r2)?.unwrap().content, b"victim");
    assert_eq!(storage.count_records(id)?, 2);
    Ok(())
}

#[test]
fn callback_runs_before_finalize_and_can_veto() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let (rid, version) = storage
        .create_record(Some(id), b"before", 0)?
        .completed()
        .unwrap();

    let mut session = StorageSession::new();
    let mut tx = ClientTransaction::new(6);
    tx.update(rid, b"after".to_vec(), version, 0);
    let err = storage
        .commit_with(&mut session, &tx, |results| {
            assert_eq!(results.len(), 1);
            Err(StorageError::State("veto".into()))
        })
        .unwrap_err();
    assert!(matches!(err, StorageError::State(_)));
    assert_eq!(storage.read_record(rid)?.unwrap().content, b"before");

    let results = storage.commit_with(&mut session, &tx, |_| Ok(()))?;
    assert_eq!(results[0].version, version + 1);
    assert_eq!(storage.read_record(rid)?.unwrap().content, b"after");
    Ok(())
}

#[test]
fn rollback_leaves_a_concurrent_writer_untouched() -> Result<()> {
    let dir = tempdir().unwrap();
    let storage = Arc::new(PaginatedStorage::create(dir.path(), GlobalOptions::default())?);
    let id = storage.add_cluster("data", None)?;
    let (anchor, _) = storage
        .create_record(Some(id), b"anchor", 0)?
        .completed()
        .unwrap();

    let mut session = StorageSession::new();
    let mut tx = ClientTransaction::new(9);
    tx.create(id, b"doomed".to_vec(), 0);

    // While the commit is mid-flight, another thread appends to the same
    // cluster. It has to wait until the rollback finished, and its record
    // must survive it.
    let writer = Arc::clone(&storage);
    let mut handle = None;
    let err = storage
        .commit_with(&mut session, &tx, |_| {
            let writer = Arc::clone(&writer);
            handle = Some(thread::spawn(move || {
                writer.create_record(Some(id), b"bystander", 0)
            }));
            thread::sleep(Duration::from_millis(50));
            Err(StorageError::State("veto".into()))
        })
        .unwrap_err();
    assert!(matches!(err, StorageError::State(_)));

    let (bystander, version) = handle.unwrap().join().unwrap()?.completed().unwrap();
    assert_eq!(version, 1);
    assert_eq!(
        storage.read_record(bystander)?.unwrap().content,
        b"bystander"
    );
    assert_eq!(storage.read_record(anchor)?.unwrap().content, b"anchor");
    assert_eq!(storage.count_records(id)?, 2);

    // Still there after the position maps are rebuilt from the pages.
    storage.close()?;
    let reopened = PaginatedStorage::open(dir.path())?;
    assert_eq!(
        reopened.read_record(bystander)?.unwrap().content,
        b"bystander"
    );
    assert_eq!(reopened.count_records(id)?, 2);
    Ok(())
}

#[test]
fn rollback_discards_buffered_operations() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let (rid, version) = storage
        .create_record(Some(id), b"keep", 0)?
        .completed()
        .unwrap();

    // A failed commit leaves the transaction bound so it can be rolled back.
    let mut session = StorageSession::new();
    let mut tx = ClientTransaction::new(8);
    tx.update(rid, b"never".to_vec(), version + 9, 0);
    assert!(storage.commit(&mut session, &tx).is_err());
    assert_eq!(session.active_transaction(), Some(8));

    storage.rollback(&mut session, &mut tx)?;
    assert!(tx.is_empty());
    assert_eq!(session.active_transaction(), None);
    assert!(storage.commit(&mut session, &tx)?.is_empty());
    assert_eq!(storage.read_record(rid)?.unwrap().content, b"keep");
    Ok(())
}

#[test]
fn rollback_checks_the_bound_transaction() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let (rid, version) = storage
        .create_record(Some(id), b"seed", 0)?
        .completed()
        .unwrap();

    // No transaction bound: rolling back is a no-op, the buffer survives.
    let mut session = StorageSession::new();
    let mut pending = ClientTransaction::new(11);
    pending.update(rid, b"pending".to_vec(), version, 0);
    storage.rollback(&mut session, &mut pending)?;
    assert!(!pending.is_empty());

    let mut stale = ClientTransaction::new(12);
    stale.delete(rid, version + 9);
    assert!(storage.commit(&mut session, &stale).is_err());

    // Only the bound transaction may be rolled back.
    assert!(matches!(
        storage.rollback(&mut session, &mut pending),
        Err(StorageError::State(_))
    ));
    storage.rollback(&mut session, &mut stale)?;
    assert!(stale.is_empty());
    assert_eq!(session.active_transaction(), None);
    Ok(())
}

#[test]
fn commit_drops_a_stale_bound_transaction() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let (rid, version) = storage
        .create_record(Some(id), b"seed", 0)?
        .completed()
        .unwrap();

    let mut session = StorageSession::new();
    let mut abandoned = ClientTransaction::new(1);
    abandoned.delete(rid, version + 9);
    assert!(storage.commit(&mut session, &abandoned).is_err());
    assert_eq!(session.active_transaction(), Some(1));

    // Committing a different transaction on the same session succeeds;
    // the abandoned one is simply dropped.
    let mut fresh = ClientTransaction::new(2);
    fresh.create(id, b"fresh".to_vec(), 0);
    let results = storage.commit(&mut session, &fresh)?;
    assert_eq!(results.len(), 1);
    assert_eq!(session.active_transaction(), None);
    Ok(())
}

#[test]
fn empty_transaction_commits_to_nothing() -> Result<()> {
    let (_dir, storage, _id) = storage_with_cluster()?;
    let mut session = StorageSession::new();
    let tx = ClientTransaction::new(3);
    assert!(storage.commit(&mut session, &tx)?.is_empty());
    Ok(())
}

#[test]
fn commit_is_framed_by_exactly_one_unit() -> Result<()> {
    let dir = tempdir().unwrap();
    let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
    let id = storage.add_cluster("data", None)?;
    let (r1, v1) = storage
        .create_record(Some(id), b"seed", 0)?
        .completed()
        .unwrap();
    // Trim the log so only the commit's records remain after the cut.
    storage.make_full_checkpoint()?;

    let mut session = StorageSession::new();
    let mut tx = ClientTransaction::new(4);
    tx.create(id, b"a".to_vec(), 0);
    tx.create(id, b"b".to_vec(), 0);
    tx.update(r1, b"seed updated".to_vec(), v1, 0);
    storage.commit(&mut session, &tx)?;

    // Skip the clean shutdown so the log survives for inspection.
    std::mem::forget(storage);

    let wal = WriteAheadLog::open(dir.path())?;
    let mut starts = Vec::new();
    let mut ends = Vec::new();
    let mut update_units = Vec::new();
    let mut cursor = wal.begin();
    while let Some(lsn) = cursor {
        match wal.read(lsn)? {
            WalRecord::UnitStart { unit } => starts.push(unit),
            WalRecord::UnitEnd { unit, rollback } => {
                assert!(!rollback);
                ends.push(unit);
            }
            WalRecord::PageUpdate { unit, .. } => update_units.push(unit),
            _ => {}
        }
        cursor = wal.next(lsn)?;
    }
    assert_eq!(starts.len(), 1, "one unit start per commit");
    assert_eq!(ends, starts);
    assert!(!update_units.is_empty());
    assert!(update_units.iter().all(|unit| *unit == starts[0]));
    Ok(())
}

#[test]
fn transactions_are_refused_without_a_wal() -> Result<()> {
    let dir = tempdir().unwrap();
    let options = GlobalOptions {
        wal_enabled: false,
        ..GlobalOptions::default()
    };
    let storage = PaginatedStorage::create(dir.path(), options)?;
    let id = storage.add_cluster("data", None)?;
    let mut session = StorageSession::new();
    let mut tx = ClientTransaction::new(5);
    tx.create(id, b"x".to_vec(), 0);
    assert!(matches!(
        storage.commit(&mut session, &tx),
        Err(StorageError::WalUnavailable)
    ));
    storage.close()?;
    Ok(())
}
