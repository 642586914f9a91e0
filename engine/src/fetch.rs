//! Random access to stored contents: pulls one entry out of a blob through
//! the range read cache, without downloading the rest of the blob. This is
//! the read path behind restores and filesystem front ends, and the reason
//! entries are encrypted independently at their own offsets.

use std::collections::HashMap;

use cipher::StreamCipher;
use shared::types::ContentHash;

use crate::{
    catalog::Catalog,
    compress,
    crypto::cipher_at,
    readcache::ReadCache,
    storage::SharedStorage,
};

/// Reads and verifies the content with the given hash. Fails with a clear
/// "no such entry" when the catalog does not know the content; a content
/// that decrypts or decompresses to the wrong bytes is data damage.
pub async fn read_content(
    catalog: &Catalog,
    cache: &ReadCache,
    storages: &[SharedStorage],
    hash: &ContentHash,
) -> anyhow::Result<Vec<u8>> {
    let entry = catalog
        .entry_for_hash(hash)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no such entry: {}", hex::encode(hash)))?;

    let by_id: HashMap<_, _> =
        storages.iter().map(|storage| (storage.get_id(), storage.clone())).collect();
    let location = catalog
        .locations_for_blob(&entry.blob_id)
        .await?
        .into_iter()
        .find(|location| by_id.contains_key(&location.storage_id))
        .ok_or_else(|| {
            anyhow::anyhow!("no reachable storage holds blob {}", hex::encode(entry.blob_id))
        })?;

    let mut reader = cache
        .download_section(
            by_id[&location.storage_id].clone(),
            &location.path,
            entry.offset,
            entry.final_size,
        )
        .await?;

    let mut encrypted = reader.read_to_end().await?;
    anyhow::ensure!(
        encrypted.len() as u64 == entry.final_size,
        "blob {} ended {} bytes short of entry {}",
        hex::encode(entry.blob_id),
        entry.final_size - encrypted.len() as u64,
        hex::encode(hash)
    );

    let mut cipher = cipher_at(entry.offset, &entry.encryption_key);
    cipher.apply_keystream(&mut encrypted);

    let codec = compress::by_name(&entry.compression_alg)?;
    let mut data = Vec::new();
    {
        use std::io::Read;
        codec.decompress(Box::new(&encrypted[..]))?.read_to_end(&mut data)?;
    }

    if compress::sha256(&data) != *hash {
        panic!(
            "data damage: content {} read back from blob {} hashes differently",
            hex::encode(hash),
            hex::encode(entry.blob_id)
        );
    }

    Ok(data)
}

/// Reads the current content of a path, as of its open revision.
pub async fn read_path(
    catalog: &Catalog,
    cache: &ReadCache,
    storages: &[SharedStorage],
    path: &str,
) -> anyhow::Result<Vec<u8>> {
    let revision = catalog
        .get_open_revision(path)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no such entry: {path}"))?;

    read_content(catalog, cache, storages, &revision.hash).await
}
