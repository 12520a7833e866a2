//! Storage lifecycle: create, reopen, cluster management, delete.

use lithic::storage::config::{CompressionMethod, GlobalOptions};
use lithic::storage::engine::PaginatedStorage;
use lithic::types::{Result, StorageError, StorageStatus};
use tempfile::tempdir;

#[test]
fn create_close_reopen_round_trip() -> Result<()> {
    let dir = tempdir().unwrap();
    {
        let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
        assert_eq!(storage.status(), StorageStatus::Open);
        storage.add_cluster("Account", None)?;
        storage.close()?;
    }
    let storage = PaginatedStorage::open(dir.path())?;
    assert_eq!(
        storage.cluster_names()?,
        vec!["internal", "index", "manindex", "default", "Account"]
    );
    assert_eq!(storage.cluster_id_by_name("account")?, Some(4));
    storage.close()?;
    Ok(())
}

#[test]
fn create_refuses_an_existing_storage() -> Result<()> {
    let dir = tempdir().unwrap();
    PaginatedStorage::create(dir.path(), GlobalOptions::default())?.close()?;
    assert!(matches!(
        PaginatedStorage::create(dir.path(), GlobalOptions::default()),
        Err(StorageError::State(_))
    ));
    Ok(())
}

#[test]
fn default_cluster_serves_unqualified_creates() -> Result<()> {
    let dir = tempdir().unwrap();
    let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
    let id = storage.add_cluster("data", None)?;
    storage.set_default_cluster(id)?;
    assert_eq!(storage.default_cluster()?, Some(id));

    let (rid, version) = storage
        .create_record(None, b"payload", 0)?
        .completed()
        .unwrap();
    assert_eq!(rid.cluster_id, id);
    assert_eq!(version, 1);
    storage.close()?;
    Ok(())
}

#[test]
fn dropped_cluster_is_gone_after_reopen() -> Result<()> {
    let dir = tempdir().unwrap();
    {
        let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
        let keep = storage.add_cluster("keep", None)?;
        let drop_id = storage.add_cluster("gone", None)?;
        storage.create_record(Some(keep), b"kept", 0)?;
        storage.create_record(Some(drop_id), b"lost", 0)?;
        storage.drop_cluster(drop_id)?;
        storage.close()?;
    }
    let storage = PaginatedStorage::open(dir.path())?;
    let names = storage.cluster_names()?;
    assert!(names.contains(&"keep".to_owned()));
    assert!(!names.contains(&"gone".to_owned()));
    assert_eq!(storage.cluster_id_by_name("gone")?, None);
    let keep = storage.cluster_id_by_name("keep")?.unwrap();
    assert_eq!(storage.count_records(keep)?, 1);
    storage.close()?;
    Ok(())
}

#[test]
fn truncated_cluster_is_empty_but_keeps_its_slot() -> Result<()> {
    let dir = tempdir().unwrap();
    let id = {
        let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
        let id = storage.add_cluster("events", None)?;
        for i in 0..5u8 {
            storage.create_record(Some(id), &[i], 0)?;
        }
        storage.truncate_cluster(id)?;
        assert_eq!(storage.count_records(id)?, 0);
        assert!(storage.first_record_id(id)?.is_none());

        // The cluster stays usable afterwards.
        let (rid, version) = storage
            .create_record(Some(id), b"post", 0)?
            .completed()
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(storage.read_record(rid)?.unwrap().content, b"post");
        storage.close()?;
        id
    };
    let storage = PaginatedStorage::open(dir.path())?;
    assert_eq!(storage.cluster_id_by_name("events")?, Some(id));
    assert_eq!(storage.count_records(id)?, 1);
    storage.close()?;
    Ok(())
}

#[test]
fn dropped_cluster_slot_is_reused() -> Result<()> {
    let dir = tempdir().unwrap();
    let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
    let a = storage.add_cluster("a", None)?;
    let b = storage.add_cluster("b", None)?;
    storage.drop_cluster(a)?;
    let c = storage.add_cluster("c", None)?;
    assert_eq!(c, a);
    assert_ne!(c, b);
    storage.close()?;
    Ok(())
}

#[test]
fn storage_without_wal_still_persists_records() -> Result<()> {
    let dir = tempdir().unwrap();
    let options = GlobalOptions {
        wal_enabled: false,
        ..GlobalOptions::default()
    };
    let rid = {
        let storage = PaginatedStorage::create(dir.path(), options)?;
        let id = storage.add_cluster("data", None)?;
        let (rid, _) = storage
            .create_record(Some(id), b"no wal", 0)?
            .completed()
            .unwrap();
        storage.close()?;
        rid
    };
    let storage = PaginatedStorage::open(dir.path())?;
    let record = storage.read_record(rid)?.unwrap();
    assert_eq!(record.content, b"no wal");
    storage.close()?;
    Ok(())
}

#[test]
fn snappy_compressed_records_round_trip_across_reopen() -> Result<()> {
    let dir = tempdir().unwrap();
    let options = GlobalOptions {
        compression: CompressionMethod::Snappy,
        ..GlobalOptions::default()
    };
    let payload = vec![7u8; 2048];
    let rid = {
        let storage = PaginatedStorage::create(dir.path(), options)?;
        let id = storage.add_cluster("data", None)?;
        let (rid, _) = storage
            .create_record(Some(id), &payload, 0)?
            .completed()
            .unwrap();
        storage.close()?;
        rid
    };
    let storage = PaginatedStorage::open(dir.path())?;
    assert_eq!(storage.read_record(rid)?.unwrap().content, payload);
    storage.close()?;
    Ok(())
}

#[test]
fn freeze_flushes_and_then_releases_writers() -> Result<()> {
    let dir = tempdir().unwrap();
    let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
    let id = storage.add_cluster("data", None)?;
    let (rid, _) = storage
        .create_record(Some(id), b"frozen in", 0)?
        .completed()
        .unwrap();
    {
        let _frozen = storage.freeze()?;
        // The flushed files alone must already contain the record.
        assert!(storage.check_integrity()?.is_empty());
    }
    let (rid2, _) = storage
        .create_record(Some(id), b"after thaw", 0)?
        .completed()
        .unwrap();
    assert_eq!(storage.read_record(rid)?.unwrap().content, b"frozen in");
    assert_eq!(storage.read_record(rid2)?.unwrap().content, b"after thaw");
    storage.close()?;
    Ok(())
}

#[test]
fn delete_leaves_no_files_behind() -> Result<()> {
    let dir = tempdir().unwrap();
    let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
    let id = storage.add_cluster("data", None)?;
    storage.create_record(Some(id), b"x", 0)?;
    storage.delete()?;
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    Ok(())
}

#[test]
fn integrity_check_passes_on_a_clean_storage() -> Result<()> {
    let dir = tempdir().unwrap();
    let storage = PaginatedStorage::create(dir.path(), GlobalOptions::default())?;
    let id = storage.add_cluster("data", None)?;
    for i in 0..100u32 {
        storage.create_record(Some(id), &i.to_be_bytes(), 0)?;
    }
    storage.make_full_checkpoint()?;
    assert!(storage.check_integrity()?.is_empty());
    storage.close()?;
    Ok(())
}
