//! The repacker: atomically replaces a set of blobs with newly packed
//! equivalents. Used for deduplication, encryption upgrades and size
//! rebalancing. New blobs are uploaded and verified first; one transaction
//! then swaps the catalog rows. Old physical objects are left in storage for
//! the unknown-file sweep to reconcile.

use std::collections::{HashMap, HashSet};

use futures::TryStreamExt;
use shared::types::{BlobId, ContentHash, StorageId};

use crate::{
    blobpack::{
        read::{expected_sizes, read_blob_verified},
        record_packed, Packer,
    },
    catalog::{blobs::BlobLocation, Catalog},
    defaults::{Settings, VERIFY_WORKERS},
    log, paranoia,
    storage::SharedStorage,
};

/// How the set of blobs to rewrite is chosen.
pub enum RepackMode {
    /// Repack exactly these blobs.
    FromList(Vec<BlobId>),
    /// Repack every blob containing a content stored more than once.
    Deduplicate,
    /// Re-encrypt blobs whose entries share a single key with per-entry keys.
    UpgradeEncryption,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RepackSummary {
    pub rewritten: u64,
    pub deleted_duplicates: u64,
    pub new_blobs: u64,
}

/// Runs one repack. `storages` must cover every storage the candidate blobs
/// live in; new blobs are replicated to all of them.
pub async fn repack(
    catalog: &Catalog,
    storages: Vec<SharedStorage>,
    settings: Settings,
    mode: RepackMode,
) -> anyhow::Result<RepackSummary> {
    let by_id: HashMap<StorageId, SharedStorage> =
        storages.iter().map(|storage| (storage.get_id(), storage.clone())).collect();

    // stage 1: select the candidate set
    let mut transaction = catalog.transaction().await?;
    let candidates = match mode {
        RepackMode::FromList(blob_ids) => blob_ids,
        RepackMode::Deduplicate => transaction.duplicate_content_blob_ids().await?,
        RepackMode::UpgradeEncryption => transaction.legacy_blob_ids().await?,
    };

    let candidate_set: HashSet<BlobId> = candidates.iter().copied().collect();
    anyhow::ensure!(candidate_set.len() == candidates.len(), "repack set contains duplicates");

    if candidates.is_empty() {
        transaction.commit().await?;
        log!("[repack] nothing to do");
        return Ok(RepackSummary::default());
    }

    // stage 2: guard. Every blob co-resident with a candidate's content must
    // itself be a candidate, otherwise deleting the candidate would leave a
    // dangling shared hash.
    let closure = transaction.blobs_sharing_content(&candidates).await?;
    for blob_id in &closure {
        anyhow::ensure!(
            candidate_set.contains(blob_id),
            "blob {} shares content with the repack set but is not part of it",
            hex::encode(blob_id)
        );
    }

    // large blobs are never rewritten: either they keep their content, or,
    // when everything in them is already claimed elsewhere, they are dropped
    let mut claimed: HashSet<ContentHash> = HashSet::new();
    let mut keep_claimed: HashSet<ContentHash> = HashSet::new();
    let mut rewrite = Vec::new();
    let mut delete_only = Vec::new();

    for blob_id in &candidates {
        let entries = transaction.entries_for_blob(blob_id).await?;
        let large = transaction.max_entry_size(blob_id).await? >= settings.min_blob_size;

        if large {
            if entries.iter().all(|entry| claimed.contains(&entry.hash)) {
                delete_only.push(*blob_id);
            } else {
                for entry in &entries {
                    claimed.insert(entry.hash);
                    keep_claimed.insert(entry.hash);
                }
            }
        } else {
            for entry in &entries {
                claimed.insert(entry.hash);
            }
            rewrite.push(*blob_id);
        }
    }
    transaction.commit().await?;

    log!(
        "[repack] rewriting {} blobs, dropping {} duplicate large blobs",
        rewrite.len(),
        delete_only.len()
    );

    // stage 3 + 4: download each blob through the verified reader and feed
    // its entries to the packer. Entries of one blob are accumulated before
    // queueing so the download connection is not held open against the
    // packer's back-pressure.
    let mut packer = Packer::rewriting(catalog.clone(), storages.clone(), settings.clone());

    for blob_id in &rewrite {
        let blob = catalog
            .get_blob(blob_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("blob {} vanished mid-repack", hex::encode(blob_id)))?;
        let entries = catalog.entries_for_blob(blob_id).await?;
        let sizes = expected_sizes(catalog, &entries).await?;

        let locations = catalog.locations_for_blob(blob_id).await?;
        let location = pick_location(&locations, &by_id)?;
        let storage = &by_id[&location.storage_id];
        let reader = storage.download_section(&location.path, 0, blob.size).await?;

        let verified = read_blob_verified(reader, &blob, &entries, &sizes).await?;

        for entry in verified {
            if keep_claimed.contains(&entry.hash) {
                continue;
            }
            packer.add_entry(entry.hash, entry.data).await?;
        }
    }

    let packed = packer.finish().await?;

    // stage 5: commit the swap in one transaction, with the relational
    // paranoia checks run against the post-swap state before committing
    let mut transaction = catalog.transaction().await?;

    for blob in &packed {
        record_packed(&mut transaction, blob).await?;
    }
    for blob_id in rewrite.iter().chain(&delete_only) {
        transaction.delete_blob(blob_id).await?;
    }

    let violations = paranoia::relational_check(&mut transaction, &settings).await?;
    anyhow::ensure!(
        violations.is_empty(),
        "catalog violation: repack would commit a broken catalog: {violations:?}"
    );

    transaction.commit().await?;

    // stage 6: re-download every new blob and verify it end to end
    futures::stream::iter(packed.iter().map(anyhow::Ok))
        .try_for_each_concurrent(VERIFY_WORKERS, |blob| {
            let by_id = &by_id;
            async move {
                let location = pick_location(&blob.locations, by_id)?;
                let storage = &by_id[&location.storage_id];
                let reader = storage.download_section(&location.path, 0, blob.blob.size).await?;

                let records: Vec<_> = blob.entries.iter().map(|e| e.record.clone()).collect();
                let sizes: HashMap<ContentHash, u64> = blob
                    .entries
                    .iter()
                    .map(|entry| (entry.record.hash, entry.plaintext_size))
                    .collect();

                read_blob_verified(reader, &blob.blob, &records, &sizes).await?;
                Ok(())
            }
        })
        .await?;

    let summary = RepackSummary {
        rewritten: rewrite.len() as u64,
        deleted_duplicates: delete_only.len() as u64,
        new_blobs: packed.len() as u64,
    };

    log!(
        "[repack] done: {} rewritten into {} new blobs, {} duplicates deleted",
        summary.rewritten,
        summary.new_blobs,
        summary.deleted_duplicates
    );

    Ok(summary)
}

fn pick_location<'a>(
    locations: &'a [BlobLocation],
    by_id: &HashMap<StorageId, SharedStorage>,
) -> anyhow::Result<&'a BlobLocation> {
    locations
        .iter()
        .find(|location| by_id.contains_key(&location.storage_id))
        .ok_or_else(|| anyhow::anyhow!("no reachable storage holds the blob"))
}
