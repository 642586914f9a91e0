//! Cross-storage replication: brings a storage up to date with every blob
//! the catalog knows about. Used after registering a new storage and after
//! storage paranoia reports missing objects.

use std::collections::HashMap;

use futures::TryStreamExt;
use sha2::{Digest, Sha256};
use shared::types::BlobHash;
use tokio::io::AsyncReadExt;

use crate::{
    catalog::{blobs::BlobLocation, Catalog},
    defaults::REPLICATION_WORKERS,
    log,
    storage::{ChecksumTracker, SharedStorage},
};

/// Copies every blob that has no location in `target` from any reachable
/// source storage, re-hashing the bytes in transit. Returns how many blobs
/// were copied; the new locations are committed in one transaction.
pub async fn replicate_missing(
    catalog: &Catalog,
    sources: &[SharedStorage],
    target: &SharedStorage,
) -> anyhow::Result<usize> {
    let by_id: HashMap<_, _> =
        sources.iter().map(|storage| (storage.get_id(), storage.clone())).collect();
    let target_id = target.get_id();

    let mut missing = Vec::new();
    for blob_id in catalog.all_blob_ids().await? {
        let locations = catalog.locations_for_blob(&blob_id).await?;
        if !locations.iter().any(|location| location.storage_id == target_id) {
            missing.push((blob_id, locations));
        }
    }

    log!("[replicate] {} blobs missing from the target storage", missing.len());

    let new_locations: Vec<BlobLocation> = futures::stream::iter(missing.into_iter().map(anyhow::Ok))
        .map_ok(|(blob_id, locations)| {
            let by_id = &by_id;
            async move {
                let blob = catalog
                    .get_blob(&blob_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("blob {} vanished", hex::encode(blob_id)))?;
                let source = locations
                    .iter()
                    .find(|location| by_id.contains_key(&location.storage_id))
                    .ok_or_else(|| {
                        anyhow::anyhow!("no reachable storage holds blob {}", hex::encode(blob_id))
                    })?;

                let mut reader = by_id[&source.storage_id]
                    .download_section(&source.path, 0, blob.size)
                    .await?;
                let mut upload = target.begin_blob_upload(blob_id).await?;

                let mut hasher = Sha256::new();
                let mut checksums = ChecksumTracker::default();
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let n = reader.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    checksums.update(&buf[..n]);
                    upload.write(&buf[..n]).await?;
                }

                let transit_hash: BlobHash = hasher.finalize().into();
                if transit_hash != blob.final_hash || checksums.total() != blob.size {
                    panic!(
                        "data damage: blob {} read back differently while replicating",
                        hex::encode(blob_id)
                    );
                }

                let result = upload.finish().await?;
                let (md5, etag) = checksums.finalize();
                if result.checksum != md5 && result.checksum != etag {
                    panic!(
                        "data damage: replication checksum {} for blob {} matches neither {} nor {}",
                        result.checksum,
                        hex::encode(blob_id),
                        md5,
                        etag
                    );
                }

                Ok(BlobLocation {
                    blob_id,
                    storage_id: target_id,
                    path: result.path,
                    checksum: result.checksum,
                    timestamp: Catalog::get_unix_timestamp(),
                })
            }
        })
        .try_buffer_unordered(REPLICATION_WORKERS)
        .try_collect()
        .await?;

    let copied = new_locations.len();

    let mut transaction = catalog.transaction().await?;
    for location in &new_locations {
        transaction.insert_blob_location(location).await?;
    }
    transaction.commit().await?;

    log!("[replicate] copied {} blobs", copied);
    Ok(copied)
}
