//! End-to-end sessions: backing up a directory tree, deduplicating repacks,
//! encryption upgrades and the paranoia checks over the results.

use std::{fs, io::Write as _, path::Path, sync::Arc};

use engine::{
    backup,
    blobpack::read::read_blob_verified,
    catalog::{blobs::*, files::FileRevision, storages::StorageRecord, Catalog},
    compress,
    crypto::EncryptWriter,
    defaults::Settings,
    fetch, paranoia,
    readcache::ReadCache,
    repack::{repack, RepackMode},
    storage::{blob_path, md5_hex, memory::MemoryStorage, SharedStorage, Storage, StorageKind},
};
use filetime::{set_file_mtime, FileTime};

const STORAGE_ID: [u8; 32] = [1; 32];

async fn setup() -> (Catalog, tempfile::TempDir, Arc<MemoryStorage>, SharedStorage) {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::open(&dir.path().join("catalog.db")).await.unwrap();

    let memory = Arc::new(MemoryStorage::new(STORAGE_ID));
    let mut transaction = catalog.transaction().await.unwrap();
    transaction
        .insert_storage(&StorageRecord {
            storage_id: STORAGE_ID,
            readable_label: "mock".to_string(),
            kind: StorageKind::Memory.as_str().to_string(),
            identifier: "{}".to_string(),
            root_path: String::new(),
        })
        .await
        .unwrap();
    transaction.commit().await.unwrap();

    (catalog, dir, memory.clone(), memory as SharedStorage)
}

fn write_tree(root: &Path) {
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("alpha.txt"), "alpha ".repeat(500)).unwrap();
    fs::write(root.join("sub/beta.bin"), (0..100_000u32).flat_map(u32::to_le_bytes).collect::<Vec<_>>())
        .unwrap();
    fs::write(root.join("empty"), b"").unwrap();
    fs::write(root.join("dup1.txt"), "same content here".repeat(200)).unwrap();
    fs::write(root.join("dup2.txt"), "same content here".repeat(200)).unwrap();

    // pin mtimes so the unchanged detection has a stable baseline
    for name in ["alpha.txt", "sub/beta.bin", "empty", "dup1.txt", "dup2.txt"] {
        set_file_mtime(root.join(name), FileTime::from_unix_time(1_000_000, 0)).unwrap();
    }
}

#[tokio::test]
async fn backup_session_round_trip() {
    let (catalog, _dir, memory, storage) = setup().await;
    let data_dir = tempfile::tempdir().unwrap();
    write_tree(data_dir.path());

    let summary = backup::run(&catalog, vec![storage.clone()], Settings::default(), data_dir.path())
        .await
        .unwrap();

    assert_eq!(summary.files_seen, 5);
    assert_eq!(summary.new_revisions, 5);
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.blobs_written, 1);

    // duplicate files share a single entry; the empty file gets the one
    // zero-length entry
    let blob_ids = catalog.all_blob_ids().await.unwrap();
    assert_eq!(blob_ids.len(), 1);
    let entries = catalog.entries_for_blob(&blob_ids[0]).await.unwrap();
    assert_eq!(entries.len(), 4);

    paranoia::assert_catalog_clean(&catalog, &Settings::default()).await.unwrap();
    assert_eq!(paranoia::verify_all_blobs(&catalog, &[storage.clone()]).await.unwrap(), 1);

    let report = paranoia::check_storage(&catalog, &storage, false).await.unwrap();
    assert!(report.is_clean(), "{report:?}");

    // an immediate re-run sees only unchanged files and writes nothing
    let summary = backup::run(&catalog, vec![storage.clone()], Settings::default(), data_dir.path())
        .await
        .unwrap();
    assert_eq!(summary.unchanged, 5);
    assert_eq!(summary.new_revisions, 0);
    assert_eq!(summary.blobs_written, 0);
    assert_eq!(memory.object_count(), 1);
}

#[tokio::test]
async fn stored_files_read_back_through_the_cache() {
    let (catalog, _dir, memory, storage) = setup().await;
    let data_dir = tempfile::tempdir().unwrap();
    write_tree(data_dir.path());

    backup::run(&catalog, vec![storage.clone()], Settings::default(), data_dir.path())
        .await
        .unwrap();

    let cache = ReadCache::new();
    let storages = vec![storage.clone()];

    for name in ["alpha.txt", "sub/beta.bin", "empty", "dup1.txt", "dup2.txt"] {
        let on_disk = fs::read(data_dir.path().join(name)).unwrap();
        let path = data_dir.path().join(name);
        let restored =
            fetch::read_path(&catalog, &cache, &storages, path.to_str().unwrap()).await.unwrap();
        assert_eq!(restored, on_disk, "{name} must read back byte-identical");
    }

    // the whole blob is well under one chunk, so all five contents come out
    // of a single backend range request
    assert_eq!(memory.request_count(), 1);
    memory.assert_no_overlapping_reads();

    let missing = fetch::read_path(&catalog, &cache, &storages, "/not/backed/up").await;
    assert!(missing.unwrap_err().to_string().contains("no such entry"));
}

#[tokio::test]
async fn backup_tracks_changes_and_deletions() {
    let (catalog, _dir, _memory, storage) = setup().await;
    let data_dir = tempfile::tempdir().unwrap();
    write_tree(data_dir.path());

    backup::run(&catalog, vec![storage.clone()], Settings::default(), data_dir.path())
        .await
        .unwrap();

    // change one file's content (and mtime), remove another
    fs::write(data_dir.path().join("alpha.txt"), "fresh bytes entirely".repeat(100)).unwrap();
    set_file_mtime(data_dir.path().join("alpha.txt"), FileTime::from_unix_time(1_000_777, 0))
        .unwrap();
    fs::remove_file(data_dir.path().join("dup2.txt")).unwrap();

    let summary = backup::run(&catalog, vec![storage.clone()], Settings::default(), data_dir.path())
        .await
        .unwrap();

    assert_eq!(summary.new_revisions, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.blobs_written, 1);

    let alpha = data_dir.path().join("alpha.txt");
    let history = catalog.get_revision_history(alpha.to_str().unwrap()).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].end.is_some());
    assert!(history[1].end.is_none());
    assert!(history[1].start > history[0].start);

    let dup2 = data_dir.path().join("dup2.txt");
    let history = catalog.get_revision_history(dup2.to_str().unwrap()).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].end.is_some(), "deleted file's revision must be closed");

    // the content of the deleted file is still referenced by dup1 and held
    paranoia::assert_catalog_clean(&catalog, &Settings::default()).await.unwrap();
    paranoia::verify_all_blobs(&catalog, &[storage]).await.unwrap();
}

/// Builds a blob directly, bypassing backup, so tests can construct layouts
/// (shared hashes, shared keys) the packer itself would refuse to produce.
async fn plant_blob(
    catalog: &Catalog,
    storage: &Arc<MemoryStorage>,
    blob_id: [u8; 32],
    contents: &[(&str, Vec<u8>)],
    shared_key: Option<[u8; 16]>,
) -> BlobRecord {
    let settings = Settings::default();
    let padding_key: [u8; 16] = blob_id[16..].try_into().unwrap();

    let mut bytes = Vec::new();
    let mut entries = Vec::new();
    let mut offset = 0u64;

    for (i, (_, data)) in contents.iter().enumerate() {
        let key = shared_key.unwrap_or_else(|| {
            let mut key = [0u8; 16];
            key[0] = i as u8 + 1;
            key[1..].copy_from_slice(&blob_id[..15]);
            key
        });

        let mut writer = EncryptWriter::new(&mut bytes, offset, &key);
        writer.write_all(data).unwrap();
        drop(writer);

        entries.push(BlobEntryRecord {
            hash: compress::sha256(data),
            blob_id,
            encryption_key: key,
            final_size: data.len() as u64,
            offset,
            compression_alg: String::new(),
        });
        offset += data.len() as u64;
    }

    let (pad_min, pad_max) = settings.padding_bounds(offset);
    let pad_len = (pad_min + pad_max) / 2;
    let mut writer = EncryptWriter::new(&mut bytes, offset, &padding_key);
    writer.write_all(&vec![0u8; pad_len as usize]).unwrap();
    drop(writer);

    let blob = BlobRecord {
        blob_id,
        padding_key,
        size: bytes.len() as u64,
        final_hash: compress::sha256(&bytes),
    };

    let path = blob_path("", &blob_id);
    storage.insert(path.clone(), bytes.clone());

    let mut transaction = catalog.transaction().await.unwrap();
    transaction.insert_blob(&blob).await.unwrap();
    for ((path, data), entry) in contents.iter().zip(&entries) {
        transaction.upsert_size(&entry.hash, data.len() as u64).await.unwrap();
        transaction.insert_blob_entry(entry).await.unwrap();

        // an open revision referencing the content, so nothing is orphaned
        if transaction.get_open_revision(path).await.unwrap().is_none() {
            transaction
                .insert_revision(&FileRevision {
                    path: (*path).to_string(),
                    hash: entry.hash,
                    start: 1_000,
                    end: None,
                    fs_modified: 900,
                    permissions: 0o644,
                })
                .await
                .unwrap();
        }
    }
    transaction
        .insert_blob_location(&BlobLocation {
            blob_id,
            storage_id: STORAGE_ID,
            path,
            checksum: md5_hex(&bytes),
            timestamp: 1_000,
        })
        .await
        .unwrap();
    transaction.commit().await.unwrap();

    blob
}

#[tokio::test]
async fn repack_dedupe_round_trip() {
    let (catalog, _dir, memory, storage) = setup().await;

    let shared: Vec<u8> = "shared across blobs".repeat(300).into_bytes();
    let a: Vec<u8> = "unique to blob one".repeat(300).into_bytes();
    let b: Vec<u8> = "unique to blob two".repeat(300).into_bytes();
    let c: Vec<u8> = "in the bystander blob".repeat(300).into_bytes();

    plant_blob(
        &catalog,
        &memory,
        [0x11; 32],
        &[("/data/shared", shared.clone()), ("/data/a", a.clone())],
        None,
    )
    .await;
    plant_blob(
        &catalog,
        &memory,
        [0x22; 32],
        &[("/data/shared", shared.clone()), ("/data/b", b.clone())],
        None,
    )
    .await;
    plant_blob(&catalog, &memory, [0x33; 32], &[("/data/c", c.clone())], None).await;

    let summary = repack(
        &catalog,
        vec![storage.clone()],
        Settings::default(),
        RepackMode::Deduplicate,
    )
    .await
    .unwrap();

    assert_eq!(summary.rewritten, 2);
    assert_eq!(summary.new_blobs, 1);
    assert_eq!(summary.deleted_duplicates, 0);

    // the rewritten blobs are gone from the catalog, the bystander remains
    assert!(catalog.get_blob(&[0x11; 32]).await.unwrap().is_none());
    assert!(catalog.get_blob(&[0x22; 32]).await.unwrap().is_none());
    assert!(catalog.get_blob(&[0x33; 32]).await.unwrap().is_some());

    // no hash appears in more than one entry anymore
    let mut transaction = catalog.transaction().await.unwrap();
    assert!(transaction.duplicate_content_blob_ids().await.unwrap().is_empty());
    transaction.commit().await.unwrap();

    paranoia::assert_catalog_clean(&catalog, &Settings::default()).await.unwrap();

    // every content is still downloadable and hashes back to itself
    assert_eq!(paranoia::verify_all_blobs(&catalog, &[storage.clone()]).await.unwrap(), 2);

    // the old physical objects linger in storage until the unknown-file
    // sweep removes them
    let report = paranoia::check_storage(&catalog, &storage, false).await.unwrap();
    assert_eq!(report.unexpected.len(), 2);
    assert!(report.missing.is_empty());

    let report = paranoia::check_storage(&catalog, &storage, true).await.unwrap();
    assert_eq!(report.unexpected.len(), 2);

    let report = paranoia::check_storage(&catalog, &storage, false).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
}

#[tokio::test]
async fn repack_upgrades_legacy_encryption() {
    let (catalog, _dir, memory, storage) = setup().await;

    let one: Vec<u8> = "legacy entry one".repeat(100).into_bytes();
    let two: Vec<u8> = "legacy entry two".repeat(100).into_bytes();

    plant_blob(
        &catalog,
        &memory,
        [0x44; 32],
        &[("/legacy/one", one.clone()), ("/legacy/two", two.clone())],
        Some([0x55; 16]),
    )
    .await;

    let mut transaction = catalog.transaction().await.unwrap();
    assert_eq!(transaction.legacy_blob_ids().await.unwrap(), vec![[0x44; 32]]);
    transaction.commit().await.unwrap();

    let summary = repack(
        &catalog,
        vec![storage.clone()],
        Settings::default(),
        RepackMode::UpgradeEncryption,
    )
    .await
    .unwrap();
    assert_eq!(summary.rewritten, 1);
    assert_eq!(summary.new_blobs, 1);

    let mut transaction = catalog.transaction().await.unwrap();
    assert!(transaction.legacy_blob_ids().await.unwrap().is_empty());
    transaction.commit().await.unwrap();

    // the new blob carries one distinct key per entry
    let blob_ids = catalog.all_blob_ids().await.unwrap();
    assert_eq!(blob_ids.len(), 1);
    let entries = catalog.entries_for_blob(&blob_ids[0]).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_ne!(entries[0].encryption_key, entries[1].encryption_key);

    paranoia::assert_catalog_clean(&catalog, &Settings::default()).await.unwrap();
    paranoia::verify_all_blobs(&catalog, &[storage]).await.unwrap();
}

#[tokio::test]
async fn repack_refuses_a_set_with_dangling_co_residency() {
    let (catalog, _dir, memory, storage) = setup().await;

    let shared: Vec<u8> = "shared".repeat(300).into_bytes();
    plant_blob(&catalog, &memory, [0x66; 32], &[("/x/shared", shared.clone())], None).await;
    plant_blob(&catalog, &memory, [0x77; 32], &[("/y/shared2", shared.clone())], None).await;

    // only one of the two blobs holding the shared hash is given
    let result = repack(
        &catalog,
        vec![storage],
        Settings::default(),
        RepackMode::FromList(vec![[0x66; 32]]),
    )
    .await;

    assert!(result.is_err());
    assert!(catalog.get_blob(&[0x66; 32]).await.unwrap().is_some());
}

#[tokio::test]
async fn relational_paranoia_reports_violations() {
    let (catalog, _dir, _memory, _storage) = setup().await;

    // a file whose content is stored in no blob at all
    let mut transaction = catalog.transaction().await.unwrap();
    transaction.upsert_size(&[0xab; 32], 42).await.unwrap();
    transaction
        .insert_revision(&FileRevision {
            path: "/lost/file".to_string(),
            hash: [0xab; 32],
            start: 1_000,
            end: None,
            fs_modified: 900,
            permissions: 0o600,
        })
        .await
        .unwrap();

    let violations =
        paranoia::relational_check(&mut transaction, &Settings::default()).await.unwrap();
    transaction.commit().await.unwrap();

    assert!(violations
        .iter()
        .any(|v| v.check.contains("stored in some blob")), "{violations:?}");

    assert!(paranoia::assert_catalog_clean(&catalog, &Settings::default()).await.is_err());
}

#[tokio::test]
async fn storage_paranoia_reports_missing_and_mismatched_objects() {
    let (catalog, _dir, memory, storage) = setup().await;

    let content: Vec<u8> = "stored then damaged".repeat(100).into_bytes();
    let blob = plant_blob(&catalog, &memory, [0x88; 32], &[("/p/file", content)], None).await;
    let path = blob_path("", &blob.blob_id);

    // tamper: recorded checksum no longer matches what the storage holds
    let mut damaged = memory.object(&path).unwrap();
    damaged[0] ^= 0xff;
    memory.insert(path.clone(), damaged);

    let report = paranoia::check_storage(&catalog, &storage, false).await.unwrap();
    assert_eq!(report.mismatched, vec![path.clone()]);

    // remove it entirely: now it is missing
    memory.delete_blob(&path).await.unwrap();
    let report = paranoia::check_storage(&catalog, &storage, false).await.unwrap();
    assert_eq!(report.missing, vec![path]);
}

#[tokio::test]
async fn replication_brings_a_new_storage_up_to_date() {
    let (catalog, _dir, _memory, storage) = setup().await;
    let data_dir = tempfile::tempdir().unwrap();
    write_tree(data_dir.path());

    backup::run(&catalog, vec![storage.clone()], Settings::default(), data_dir.path())
        .await
        .unwrap();

    let second = Arc::new(MemoryStorage::new([2; 32]));
    let mut transaction = catalog.transaction().await.unwrap();
    transaction
        .insert_storage(&StorageRecord {
            storage_id: [2; 32],
            readable_label: "mirror".to_string(),
            kind: StorageKind::Memory.as_str().to_string(),
            identifier: "{}".to_string(),
            root_path: String::new(),
        })
        .await
        .unwrap();
    transaction.commit().await.unwrap();

    let second_shared = second.clone() as SharedStorage;
    let copied =
        engine::replicate::replicate_missing(&catalog, &[storage.clone()], &second_shared)
            .await
            .unwrap();
    assert_eq!(copied, 1);

    let report = paranoia::check_storage(&catalog, &second_shared, false).await.unwrap();
    assert!(report.is_clean(), "{report:?}");

    let blob_ids = catalog.all_blob_ids().await.unwrap();
    assert_eq!(catalog.locations_for_blob(&blob_ids[0]).await.unwrap().len(), 2);

    // blobs already mirrored are left alone
    let copied = engine::replicate::replicate_missing(&catalog, &[storage], &second_shared)
        .await
        .unwrap();
    assert_eq!(copied, 0);

    paranoia::verify_all_blobs(&catalog, &[second_shared]).await.unwrap();
}

#[tokio::test]
async fn verified_read_of_a_planted_blob() {
    let (catalog, _dir, memory, _storage) = setup().await;

    let data: Vec<u8> = "plain uncompressed entry".repeat(50).into_bytes();
    let blob = plant_blob(&catalog, &memory, [0x99; 32], &[("/v/file", data.clone())], None).await;

    let entries = catalog.entries_for_blob(&blob.blob_id).await.unwrap();
    let sizes = engine::blobpack::read::expected_sizes(&catalog, &entries).await.unwrap();

    let stored = memory.object(&blob_path("", &blob.blob_id)).unwrap();
    let verified = read_blob_verified(&stored[..], &blob, &entries, &sizes).await.unwrap();

    assert_eq!(verified.len(), 1);
    assert_eq!(verified[0].data, data);
}
