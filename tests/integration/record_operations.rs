//! Record CRUD and the optimistic version check.

use lithic::storage::config::GlobalOptions;
use lithic::storage::conflict::ConflictResolution;
use lithic::storage::engine::{OperationOutcome, PaginatedStorage};
use lithic::types::{
    RecordId, Result, StorageError, VERSION_NO_BUMP, VERSION_SKIP_CHECK, VERSION_UNTRACKED,
};
use tempfile::{tempdir, TempDir};

fn storage_with_cluster() -> Result<(TempDir, PaginatedStorage, u32)> {
    let dir = tempdir().unwrap();
    let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
    let id = storage.add_cluster("data", None)?;
    Ok((dir, storage, id))
}

#[test]
fn create_read_update_delete() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;

    let (rid, version) = storage
        .create_record(Some(id), b"first", 0)?
        .completed()
        .unwrap();
    assert_eq!(version, 1);
    assert_eq!(storage.read_record(rid)?.unwrap().content, b"first");

    let version = storage
        .update_record(rid, b"second", version, 0)?
        .completed()
        .unwrap();
    assert_eq!(version, 2);
    assert_eq!(storage.read_record(rid)?.unwrap().content, b"second");

    assert_eq!(
        storage.delete_record(rid, version)?,
        OperationOutcome::Completed(true)
    );
    assert!(storage.read_record(rid)?.is_none());
    storage.close()?;
    Ok(())
}

#[test]
fn stale_version_is_a_concurrent_modification() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let (rid, _) = storage
        .create_record(Some(id), b"v1", 0)?
        .completed()
        .unwrap();
    storage.update_record(rid, b"v2", 1, 0)?;

    // A second writer still holding version 1 must not win.
    match storage.update_record(rid, b"stale", 1, 0) {
        Err(StorageError::ConcurrentModification {
            stored, requested, ..
        }) => {
            assert_eq!(stored, 2);
            assert_eq!(requested, 1);
        }
        other => panic!("expected a version conflict, got {other:?}"),
    }
    // The losing write left no trace.
    let record = storage.read_record(rid)?.unwrap();
    assert_eq!(record.content, b"v2");
    assert_eq!(record.version, 2);
    Ok(())
}

#[test]
fn content_strategy_overwrites_on_conflict() -> Result<()> {
    let dir = tempdir().unwrap();
    let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
    let id = storage.add_cluster("events", Some(ConflictResolution::Content))?;
    let (rid, _) = storage
        .create_record(Some(id), b"v1", 0)?
        .completed()
        .unwrap();
    storage.update_record(rid, b"v2", 1, 0)?;

    let version = storage
        .update_record(rid, b"forced", 1, 0)?
        .completed()
        .unwrap();
    assert_eq!(version, 3);
    assert_eq!(storage.read_record(rid)?.unwrap().content, b"forced");
    Ok(())
}

#[test]
fn version_sentinels_skip_the_check() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let (rid, _) = storage
        .create_record(Some(id), b"v1", 0)?
        .completed()
        .unwrap();

    let version = storage
        .update_record(rid, b"bumped", VERSION_SKIP_CHECK, 0)?
        .completed()
        .unwrap();
    assert_eq!(version, 2);

    let version = storage
        .update_record(rid, b"kept", VERSION_NO_BUMP, 0)?
        .completed()
        .unwrap();
    assert_eq!(version, 2);
    assert_eq!(storage.read_record(rid)?.unwrap().version, 2);
    Ok(())
}

#[test]
fn update_of_a_missing_record_is_a_no_op() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let outcome = storage.update_record(RecordId::new(id, 42), b"x", VERSION_SKIP_CHECK, 0)?;
    assert_eq!(outcome.completed(), Some(VERSION_UNTRACKED));
    Ok(())
}

#[test]
fn delete_is_idempotent_and_version_checked() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let (rid, version) = storage
        .create_record(Some(id), b"doomed", 0)?
        .completed()
        .unwrap();

    assert!(matches!(
        storage.delete_record(rid, version + 5),
        Err(StorageError::ConcurrentModification { .. })
    ));
    assert_eq!(
        storage.delete_record(rid, version)?,
        OperationOutcome::Completed(true)
    );
    assert_eq!(
        storage.delete_record(rid, version)?,
        OperationOutcome::Completed(false)
    );
    Ok(())
}

#[test]
fn hidden_records_read_as_absent() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let (rid, _) = storage
        .create_record(Some(id), b"ghost", 0)?
        .completed()
        .unwrap();
    assert_eq!(
        storage.hide_record(rid)?,
        OperationOutcome::Completed(true)
    );
    assert!(storage.read_record(rid)?.is_none());
    assert_eq!(
        storage.hide_record(rid)?,
        OperationOutcome::Completed(false)
    );
    assert_eq!(storage.count_records(id)?, 0);
    Ok(())
}

#[test]
fn positions_are_never_reissued() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let (first, _) = storage
        .create_record(Some(id), b"a", 0)?
        .completed()
        .unwrap();
    storage.delete_record(first, VERSION_SKIP_CHECK)?;
    let (second, _) = storage
        .create_record(Some(id), b"b", 0)?
        .completed()
        .unwrap();
    assert!(second.position > first.position);
    Ok(())
}

#[test]
fn iteration_walks_live_records_in_position_order() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let mut rids = Vec::new();
    for i in 0..5u8 {
        let (rid, _) = storage
            .create_record(Some(id), &[i], 0)?
            .completed()
            .unwrap();
        rids.push(rid);
    }
    storage.delete_record(rids[2], VERSION_SKIP_CHECK)?;

    let mut seen = Vec::new();
    let mut cursor = storage.first_record_id(id)?;
    while let Some(rid) = cursor {
        seen.push(storage.read_record(rid)?.unwrap().content[0]);
        cursor = storage.next_record_id(rid)?;
    }
    assert_eq!(seen, vec![0, 1, 3, 4]);
    assert_eq!(storage.count_records(id)?, 4);
    Ok(())
}

#[test]
fn oversized_records_are_refused_cleanly() -> Result<()> {
    let (_dir, storage, id) = storage_with_cluster()?;
    let huge = vec![0u8; 64 * 1024];
    assert!(matches!(
        storage.create_record(Some(id), &huge, 0),
        Err(StorageError::Configuration(_))
    ));
    // The failed create did not burn the cluster's state.
    let (rid, version) = storage
        .create_record(Some(id), b"fits", 0)?
        .completed()
        .unwrap();
    assert_eq!(version, 1);
    assert_eq!(storage.read_record(rid)?.unwrap().content, b"fits");
    Ok(())
}
