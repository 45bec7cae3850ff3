//! Integration tests for the Domla archive
//!
//! These tests exercise the storage engine through its public surface:
//! sharding, the reverse-delta revision chain, locking, folder bookkeeping
//! and the maintenance operations.

use std::path::Path;

use tempfile::TempDir;

use domla_common::config::ArchiveConfig;
use domla_common::error::Error;
use domla_common::types::Document;
use domla_storage::DocumentStorage;

const CONTENT: &[u8] = &[3, 2, 1, 0, 1, 2, 3];

/// Test helper for an ephemeral single-shard archive
fn create_memory_storage() -> DocumentStorage {
    DocumentStorage::open(&ArchiveConfig::in_memory()).expect("failed to open in-memory archive")
}

/// Test helper for an on-disk archive with the given shard count
fn create_disk_storage(backends: usize) -> (DocumentStorage, TempDir) {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let config = ArchiveConfig {
        data_location: temp_dir.path().join("data").to_string_lossy().to_string(),
        backends,
        ..ArchiveConfig::default()
    };
    let storage = DocumentStorage::open(&config).expect("failed to open archive");
    (storage, temp_dir)
}

fn header_in(path: &str, name: &str, display: &str) -> Document {
    Document {
        folder_path: path.to_string(),
        file_name: name.to_string(),
        display_name: display.to_string(),
        ..Document::default()
    }
}

// ============================================================================
// Shard layout
// ============================================================================

#[test]
fn storage_creates_requested_buckets() {
    let (_storage, temp_dir) = create_disk_storage(10);

    let data = temp_dir.path().join("data");
    for number in 1..=10 {
        let file = data.join(format!("{number:03}domla.archive"));
        assert!(file.is_file(), "missing shard file {file:?}");
    }
}

#[test]
fn documents_spread_over_shards_stay_addressable() {
    let (storage, _temp_dir) = create_disk_storage(10);

    let mut ids = Vec::new();
    for index in 0..32 {
        let mut header = header_in("/bulk", &format!("file{index}.bin"), "Bulk");
        storage
            .save(&mut header, &[index as u8; 16], "willi", "")
            .unwrap();
        ids.push(header.id);
    }

    for id in ids {
        let found = storage.find_by_id(&id, 0).unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.folder_path, "/bulk");
    }
}

// ============================================================================
// Save and read back
// ============================================================================

#[test]
fn save_new_document_and_read_back() {
    let storage = create_memory_storage();

    let mut header = Document::default();
    storage.save(&mut header, CONTENT, "willi", "").unwrap();

    assert!(!header.id.is_empty());
    assert_eq!(header.revision, 1);
    assert_eq!(header.creator, "willi");

    let content = storage.read(&header.id, "willi").unwrap();
    assert_eq!(content.data, CONTENT);
    assert_eq!(content.revision, 1);
}

#[test]
fn zero_length_content_is_legal() {
    let storage = create_memory_storage();

    let mut header = Document::default();
    storage.save(&mut header, &[], "willi", "").unwrap();

    let content = storage.read(&header.id, "willi").unwrap();
    assert!(content.data.is_empty());

    // A second empty revision still produces a well-formed patch chain.
    storage.save(&mut header, &[], "willi", "").unwrap();
    assert_eq!(storage.read_at(&header.id, "willi", 1).unwrap().data, Vec::<u8>::new());
}

#[test]
fn reverse_delta_round_trip() {
    let storage = create_memory_storage();

    let first: Vec<u8> = b"0123456789"
        .iter()
        .copied()
        .cycle()
        .take(30)
        .collect();
    let mut second = first.clone();
    second[10..20].copy_from_slice(b"9876543210");

    let mut header = Document::default();
    storage.save(&mut header, &first, "willi", "").unwrap();
    storage.save(&mut header, &second, "willi", "").unwrap();

    assert_eq!(storage.find_by_id(&header.id, 0).unwrap().revision, 2);
    assert_eq!(storage.read(&header.id, "willi").unwrap().data, second);
    assert_eq!(storage.read_at(&header.id, "willi", 1).unwrap().data, first);
    assert_eq!(storage.read_at(&header.id, "willi", 2).unwrap().data, second);
}

#[test]
fn revision_chain_reconstructs_every_step() {
    let storage = create_memory_storage();

    let mut header = Document::default();
    let mut revisions = Vec::new();
    for step in 0u8..5 {
        let bytes: Vec<u8> = (0..64).map(|i| (i as u8).wrapping_mul(step + 1)).collect();
        storage.save(&mut header, &bytes, "willi", "").unwrap();
        revisions.push(bytes);
    }

    for (index, expected) in revisions.iter().enumerate() {
        let revision = (index + 1) as i64;
        let content = storage.read_at(&header.id, "willi", revision).unwrap();
        assert_eq!(&content.data, expected, "revision {revision}");
    }
}

#[test]
fn history_sequence_is_dense() {
    let storage = create_memory_storage();

    let mut header = header_in("/one", "test.xxx", "Testing");
    storage.save(&mut header, CONTENT, "willi", "").unwrap();
    storage.save(&mut header, &[1, 2, 3], "willi", "").unwrap();
    storage.rename(&header.id, "willi", "Renamed").unwrap();
    storage.assign_keywords(&header.id, "alpha beta", "willi").unwrap();

    let entries = storage.revisions(&header.id).unwrap();
    let sequence: Vec<i64> = entries.iter().map(|entry| entry.revision).collect();
    assert_eq!(sequence, vec![1, 2, 3, 4]);

    assert_eq!(entries[0].action, "Created");
    assert!(entries[1].action.contains("Revision"));
    assert_eq!(entries[2].action, "Retitled");
    assert_eq!(entries[3].action, "Keywords");
}

#[test]
fn update_records_changed_fields() {
    let storage = create_memory_storage();

    let mut header = header_in("/one", "test.xxx", "Testing");
    storage.save(&mut header, CONTENT, "willi", "").unwrap();

    header.file_name = "renamed.xxx".to_string();
    header.display_name = "Retitled".to_string();
    storage.save(&mut header, &[9, 9, 9], "willi", "").unwrap();

    let entries = storage.revisions(&header.id).unwrap();
    let action = &entries[1].action;
    assert!(action.contains("Renamed"), "{action}");
    assert!(action.contains("Retitled"), "{action}");
    assert!(action.contains("Revision"), "{action}");
}

// ============================================================================
// Locking
// ============================================================================

#[test]
fn lock_enforcement() {
    let storage = create_memory_storage();

    let mut header = Document::default();
    storage.save(&mut header, CONTENT, "willi", "").unwrap();
    storage.lock(&header.id, "willi").unwrap();

    let loaded = storage.load(&header.id, "willi").unwrap();
    assert_eq!(loaded.locker, "willi");

    // Another user cannot write over the lock.
    let error = storage
        .save(&mut header.clone(), &[1, 2, 3], "otto", "")
        .unwrap_err();
    assert!(matches!(error, Error::Lock(_)), "{error:?}");

    // The lock owner can, and can release the lock.
    storage.save(&mut header, &[1, 2, 3], "willi", "").unwrap();
    storage.unlock(&header.id, "willi").unwrap();

    let loaded = storage.load(&header.id, "willi").unwrap();
    assert_eq!(loaded.locker, "");
}

#[test]
fn foreign_lock_cannot_be_taken_or_released() {
    let storage = create_memory_storage();

    let mut header = Document::default();
    storage.save(&mut header, CONTENT, "willi", "").unwrap();
    storage.lock(&header.id, "willi").unwrap();

    assert!(matches!(
        storage.lock(&header.id, "otto").unwrap_err(),
        Error::Lock(_)
    ));
    assert!(matches!(
        storage.unlock(&header.id, "otto").unwrap_err(),
        Error::Lock(_)
    ));
}

// ============================================================================
// Folder operations
// ============================================================================

#[test]
fn find_document_in_folder() {
    let storage = create_memory_storage();

    let mut header = header_in("/one", "test.xxx", "Testing");
    storage.save(&mut header, CONTENT, "willi", "").unwrap();

    let found = storage.find("/one", "test.xxx").unwrap().unwrap();
    assert_eq!(found.id, header.id);

    // Case-insensitive on both sides.
    let found = storage.find("/One", "TEST.XXX").unwrap().unwrap();
    assert_eq!(found.id, header.id);

    assert!(storage.find("/two", "test.xxx").unwrap().is_none());
}

#[test]
fn move_updates_tree() {
    let storage = create_memory_storage();

    let infos = storage.folders_for_path("/").unwrap();
    assert_eq!(infos.len(), 1);

    let mut header = header_in("/one", "test.xxx", "Testing");
    storage.save(&mut header, CONTENT, "willi", "").unwrap();

    let infos = storage.folders_for_path("/").unwrap();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[1].name, "/one");

    storage
        .move_document(&header.id, "/one", "/two", "willi")
        .unwrap();

    let infos = storage.folders_for_path("/").unwrap();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[1].name, "/two");

    let loaded = storage.find_by_id(&header.id, 0).unwrap();
    assert_eq!(loaded.folder_path, "/two");
}

#[test]
fn link_creates_second_assignment_without_duplicating() {
    let storage = create_memory_storage();

    let mut header = header_in("/one", "test.xxx", "Testing");
    storage.save(&mut header, CONTENT, "willi", "").unwrap();
    storage.link(&header.id, "/one", "/two", "willi").unwrap();

    let folders = storage.folders_of(&header.id).unwrap();
    assert_eq!(folders.len(), 2);
    assert!(folders.contains(&"/one".to_string()));
    assert!(folders.contains(&"/two".to_string()));

    let found = storage.find_title("/two", "Testing").unwrap();
    assert!(!found.is_empty());
    assert_eq!(found[0].id, header.id);
}

#[test]
fn copy_clones_under_a_new_id() {
    let storage = create_memory_storage();

    let mut header = header_in("/one", "test.xxx", "Testing");
    storage.save(&mut header, CONTENT, "willi", "").unwrap();
    let clone_id = storage.copy(&header.id, "/one", "/two", "willi").unwrap();

    assert_ne!(clone_id, header.id);

    let found = storage.find_title("/two", "Testing").unwrap();
    assert!(!found.is_empty());
    assert_eq!(found[0].id, clone_id);

    // The clone carries the reconstructed latest content.
    assert_eq!(storage.read(&clone_id, "willi").unwrap().data, CONTENT);
}

#[test]
fn associate_info_to_document() {
    let storage = create_memory_storage();

    let mut header = header_in("/one", "test.xxx", "Testing");
    storage.save(&mut header, CONTENT, "willi", "").unwrap();
    storage
        .associate(&header.id, "/one", "AnId", "AType", "willi")
        .unwrap();

    let loaded = storage.find_by_id(&header.id, 0).unwrap();
    assert_eq!(loaded.associated_item, "AnId");
    assert_eq!(loaded.associated_class, "AType");
}

// ============================================================================
// Delete, undelete, destroy
// ============================================================================

#[test]
fn delete_and_undelete_document() {
    let storage = create_memory_storage();

    let mut header = header_in("/one", "test.xxx", "Testing");
    storage.save(&mut header, CONTENT, "willi", "").unwrap();
    storage.delete(&header.id, "willi").unwrap();

    let loaded = storage.load(&header.id, "willi").unwrap();
    assert!(loaded.deleted);

    // Gone from the folder tree while deleted.
    assert_eq!(storage.folders_for_path("/").unwrap().len(), 1);

    // Deleting twice is invalid.
    assert!(matches!(
        storage.delete(&header.id, "willi").unwrap_err(),
        Error::Lock(_)
    ));

    storage.undelete(&header.id, "willi").unwrap();
    let loaded = storage.load(&header.id, "willi").unwrap();
    assert!(!loaded.deleted);
    assert_eq!(storage.folders_for_path("/").unwrap().len(), 2);
}

#[test]
fn undelete_many_documents() {
    let storage = create_memory_storage();

    let mut header = Document::default();
    storage.save(&mut header, CONTENT, "willi", "").unwrap();
    storage.delete(&header.id, "willi").unwrap();
    storage
        .undelete_many(&[header.id.clone()], "willi")
        .unwrap();

    let loaded = storage.load(&header.id, "willi").unwrap();
    assert!(!loaded.deleted);
}

#[test]
fn destroy_removes_every_trace() {
    let storage = create_memory_storage();

    let mut header = header_in("/one", "test.xxx", "Testing");
    storage.save(&mut header, CONTENT, "willi", "").unwrap();
    storage
        .assign_metadata(&header.id, "Number=1", "willi")
        .unwrap();

    storage.destroy(&header.id, "willi").unwrap();

    assert!(matches!(
        storage.load(&header.id, "willi").unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(storage.revisions(&header.id).is_err());
    assert!(storage.folders_of(&header.id).unwrap().is_empty());
    assert_eq!(storage.folders_for_path("/").unwrap().len(), 1);
}

#[test]
fn find_deleted_honours_depth() {
    let storage = create_memory_storage();

    let mut shallow = header_in("/one", "shallow.bin", "Shallow");
    storage.save(&mut shallow, CONTENT, "willi", "").unwrap();
    storage.delete(&shallow.id, "willi").unwrap();

    let mut deep = header_in("/one/two/three", "deep.bin", "Deep");
    storage.save(&mut deep, CONTENT, "willi", "").unwrap();
    storage.delete(&deep.id, "willi").unwrap();

    // Unlimited depth sees both.
    let all = storage.find_deleted("/", None).unwrap();
    assert_eq!(all.len(), 2);

    // One level below /one only matches the shallow document.
    let near = storage.find_deleted("/one", Some(0)).unwrap();
    assert_eq!(near.len(), 1);
    assert_eq!(near[0].id, shallow.id);

    let wider = storage.find_deleted("/one", Some(2)).unwrap();
    assert_eq!(wider.len(), 2);
}

// ============================================================================
// The viewonly user
// ============================================================================

#[test]
fn viewonly_mutations_are_denied() {
    let storage = create_memory_storage();

    let mut header = Document::default();
    storage.save(&mut header, CONTENT, "willi", "").unwrap();

    let mut fresh = Document::default();
    assert!(matches!(
        storage.save(&mut fresh, CONTENT, "viewonly", "").unwrap_err(),
        Error::Auth(_)
    ));
    assert!(matches!(
        storage.delete(&header.id, "viewonly").unwrap_err(),
        Error::Auth(_)
    ));
    assert!(matches!(
        storage.lock(&header.id, "viewonly").unwrap_err(),
        Error::Auth(_)
    ));
    assert!(matches!(
        storage
            .move_document(&header.id, "/", "/two", "viewonly")
            .unwrap_err(),
        Error::Auth(_)
    ));

    // Reading stays allowed.
    assert_eq!(storage.read(&header.id, "viewonly").unwrap().data, CONTENT);
}

// ============================================================================
// Keyword and filename search
// ============================================================================

#[test]
fn find_by_keywords_and_filenames() {
    let storage = create_memory_storage();

    let mut header = header_in("/one", "report-2024.pdf", "Report");
    header.keywords = "yearly report finance".to_string();
    storage.save(&mut header, CONTENT, "willi", "").unwrap();

    let by_keyword = storage.find_keywords("finance").unwrap();
    assert_eq!(by_keyword.len(), 1);
    assert_eq!(by_keyword[0].id, header.id);

    let by_name = storage.find_filenames("report").unwrap();
    assert_eq!(by_name.len(), 1);

    let by_pattern = storage.find_filename_match("^report-[0-9]{4}").unwrap();
    assert_eq!(by_pattern.len(), 1);

    assert!(storage.find_keywords("absent").unwrap().is_empty());
    assert!(storage.find_keywords("").unwrap().is_empty());
}

// ============================================================================
// Meta data
// ============================================================================

#[test]
fn meta_fts_round_trip() {
    let storage = create_memory_storage();

    let mut header = Document::default();
    storage.save(&mut header, CONTENT, "willi", "").unwrap();

    storage
        .assign_metadata(
            &header.id,
            "InterneNummer=12345\u{1e}ExterneNummer=abc",
            "willi",
        )
        .unwrap();

    let found = storage.find_metadata("InterneNummer=123").unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, header.id);

    let both = storage
        .find_metadata("InterneNummer=123\u{1e}ExterneNummer=abc")
        .unwrap();
    assert_eq!(both.len(), 1);

    storage.replace_metadata(&header.id, "", "willi").unwrap();
    assert!(storage.find_metadata("InterneNummer=123").unwrap().is_empty());
}

#[test]
fn meta_tags_are_listed() {
    let storage = create_memory_storage();

    let mut header = Document::default();
    storage.save(&mut header, CONTENT, "willi", "").unwrap();
    storage
        .assign_metadata(&header.id, "Alpha=1\u{1e}Beta=2", "willi")
        .unwrap();

    let tags = storage.list_meta_tags().unwrap();
    assert_eq!(tags, vec!["Alpha".to_string(), "Beta".to_string()]);

    let of_document = storage.list_meta_tags_of(&header.id).unwrap();
    assert_eq!(
        of_document,
        vec!["Alpha=1".to_string(), "Beta=2".to_string()]
    );

    assert!(matches!(
        storage.assign_metadata(&header.id, "", "willi").unwrap_err(),
        Error::Invalid(_)
    ));
}

// ============================================================================
// Maintenance
// ============================================================================

#[test]
fn backup_and_restore_round_trip() {
    let (storage, temp_dir) = create_disk_storage(2);
    let backup_dir = temp_dir.path().join("backup");

    let mut kept = header_in("/keep", "keep.bin", "Kept");
    storage.save(&mut kept, CONTENT, "willi", "").unwrap();

    storage.backup(&backup_dir).unwrap();
    assert!(backup_dir.join("001domla.archive").is_file());
    assert!(backup_dir.join("002domla.archive").is_file());

    let mut dropped = header_in("/drop", "drop.bin", "Dropped");
    storage.save(&mut dropped, CONTENT, "willi", "").unwrap();

    storage.restore(&backup_dir).unwrap();

    // The pre-backup document survives, the later one is gone.
    assert_eq!(storage.read(&kept.id, "willi").unwrap().data, CONTENT);
    assert!(storage.load(&dropped.id, "willi").is_err());

    // The folder tree was rebuilt from the restored shards.
    let infos = storage.folders_for_path("/").unwrap();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[1].name, "/keep");
}

#[test]
fn restore_from_missing_backup_fails() {
    let (storage, temp_dir) = create_disk_storage(1);
    let error = storage.restore(Path::new(&temp_dir.path().join("nowhere"))).unwrap_err();
    assert!(matches!(error, Error::NotFound(_)));
}

#[test]
fn rebuild_fulltext_covers_live_documents() {
    let storage = create_memory_storage();

    let mut header = header_in("/one", "report.pdf", "Yearly Report");
    header.keywords = "finance numbers".to_string();
    storage.save(&mut header, CONTENT, "willi", "").unwrap();

    let mut deleted = header_in("/one", "old.pdf", "Old");
    storage.save(&mut deleted, CONTENT, "willi", "").unwrap();
    storage.delete(&deleted.id, "willi").unwrap();

    storage.rebuild_fulltext().unwrap();
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn shutdown_is_idempotent() {
    let mut storage = create_memory_storage();
    storage.shutdown();
    storage.shutdown();
}
