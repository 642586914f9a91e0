//! The backup pipeline: walk a directory tree, fingerprint files by SHA-256,
//! pack unseen content into blobs, and commit the catalog rows.
//!
//! All catalog mutations of one session land in a single transaction that is
//! committed only after every targeted storage has reported a verified
//! upload, so a crash at any point leaves the previous catalog state intact
//! and at worst some unreferenced objects in storage (reconciled by the
//! unknown-file sweep of storage paranoia).

pub mod walker;

use std::{collections::HashSet, fs::File, os::unix::fs::PermissionsExt, path::Path};

use filetime::FileTime;
use human_bytes::human_bytes;
use memmap2::Mmap;
use sha2::{Digest, Sha256};
use shared::types::ContentHash;

use crate::{
    blobpack::{record_packed, Packer},
    catalog::{files::FileRevision, Catalog},
    compress,
    defaults::Settings,
    log, logger,
    storage::SharedStorage,
};

/// What one backup session did, for logs and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BackupSummary {
    pub files_seen: u64,
    pub unchanged: u64,
    pub refreshed: u64,
    pub new_revisions: u64,
    pub deleted: u64,
    pub blobs_written: u64,
    pub bytes_packed: u64,
}

enum FileAction {
    Refresh { path: String, fs_modified: i64 },
    NewRevision { close: bool, revision: FileRevision, size: u64 },
}

/// Runs one backup session of `root` into the given storages.
pub async fn run(
    catalog: &Catalog,
    storages: Vec<SharedStorage>,
    settings: Settings,
    root: &Path,
) -> anyhow::Result<BackupSummary> {
    if !root.try_exists()? {
        anyhow::bail!("backup source {} does not exist, aborting", root.display());
    }

    let files = walker::walk_files(root)?;
    logger::global().progress_set_total(files.len() as u64);
    log!("[backup] walking {} files under {}", files.len(), root.display());

    let session_time = Catalog::get_unix_timestamp();
    let mut packer = Packer::new(catalog.clone(), storages, settings);
    let mut actions = Vec::new();
    let mut seen_paths = HashSet::new();
    let mut summary = BackupSummary::default();

    for file in files {
        summary.files_seen += 1;
        logger::global().increment_progress(file.display().to_string());

        let Some(path) = file.to_str().map(str::to_string) else {
            log!("[backup] skipping non-UTF-8 path {}", file.display());
            continue;
        };
        if let Err(e) = crate::catalog::files::validate_path(&path) {
            log!("[backup] skipping {}: {}", path, e);
            continue;
        }
        seen_paths.insert(path.clone());

        let metadata = std::fs::metadata(&file)?;
        let fs_modified = FileTime::from_last_modification_time(&metadata).unix_seconds();
        let permissions = metadata.permissions().mode() & 0o777;

        let open_revision = catalog.get_open_revision(&path).await?;

        // cheap unchanged check first: matching mtime means matching content
        if let Some(revision) = &open_revision {
            if revision.fs_modified == fs_modified {
                summary.unchanged += 1;
                continue;
            }
        }

        let (hash, data) = match hash_file(&file) {
            Ok(hashed) => hashed,
            Err(e) => {
                log!("[backup] cannot read {}: {}, skipping", path, e);
                continue;
            }
        };

        // a file that changed size while we hashed it is being written to;
        // leave it for the next session
        let after = std::fs::metadata(&file)?;
        if after.len() != data.len() as u64 {
            log!("[backup] {} changed while hashing, skipping", path);
            continue;
        }

        match &open_revision {
            Some(revision) if revision.hash == hash => {
                summary.refreshed += 1;
                actions.push(FileAction::Refresh { path, fs_modified });
            }
            Some(_) | None => {
                summary.new_revisions += 1;
                summary.bytes_packed += data.len() as u64;

                // a rapid re-observation within one second still has to open
                // a strictly later revision than the one it closes
                let now = Catalog::get_unix_timestamp();
                let start = match &open_revision {
                    Some(revision) => now.max(revision.start + 1),
                    None => now,
                };

                actions.push(FileAction::NewRevision {
                    close: open_revision.is_some(),
                    revision: FileRevision {
                        path,
                        hash,
                        start,
                        end: None,
                        fs_modified,
                        permissions,
                    },
                    size: data.len() as u64,
                });

                packer.add_entry(hash, data).await?;
            }
        }
    }

    // deletion detection: open revisions under the root that the walk did
    // not see stopped existing at the walk's timestamp
    let deleted: Vec<String> = match root.to_str() {
        Some(root) => {
            let mut transaction = catalog.transaction().await?;
            let known_open = transaction.get_open_paths_under(root).await?;
            transaction.commit().await?;

            let prefix = format!("{}/", root.trim_end_matches('/'));
            known_open
                .into_iter()
                // LIKE treats _ and % as wildcards, so re-check the prefix
                .filter(|path| path == root || path.starts_with(&prefix))
                .filter(|path| !seen_paths.contains(path))
                .collect()
        }
        None => Vec::new(),
    };
    summary.deleted = deleted.len() as u64;

    // uploads happen before the commit; the catalog only ever references
    // blobs whose storages confirmed them
    let packed = packer.finish().await?;
    summary.blobs_written = packed.len() as u64;

    let mut transaction = catalog.transaction().await?;

    for action in &actions {
        match action {
            FileAction::Refresh { path, fs_modified } => {
                transaction.update_fs_modified(path, *fs_modified).await?;
            }
            FileAction::NewRevision { close, revision, size } => {
                if *close {
                    transaction.close_revision(&revision.path, revision.start).await?;
                }
                transaction.upsert_size(&revision.hash, *size).await?;
                transaction.insert_revision(revision).await?;
            }
        }
    }

    for blob in &packed {
        record_packed(&mut transaction, blob).await?;
    }

    for path in &deleted {
        transaction.close_revision(path, session_time).await?;
    }

    transaction.commit().await?;

    log!(
        "[backup] session done: {} files, {} new, {} unchanged, {} deleted, {} blobs ({})",
        summary.files_seen,
        summary.new_revisions,
        summary.unchanged,
        summary.deleted,
        summary.blobs_written,
        human_bytes(summary.bytes_packed as f64)
    );

    Ok(summary)
}

/// Reads and hashes one file. Memory-maps non-empty files so big files do not
/// get double-buffered.
fn hash_file(path: &Path) -> std::io::Result<(ContentHash, Vec<u8>)> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();

    if len == 0 {
        return Ok((compress::sha256(&[]), Vec::new()));
    }

    let mmap = unsafe { Mmap::map(&file)? };
    let mut hasher = Sha256::new();
    hasher.update(&mmap[..]);

    Ok((hasher.finalize().into(), mmap.to_vec()))
}
