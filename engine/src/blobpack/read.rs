//! Reading a blob back with end-to-end verification: every entry is bounded,
//! decrypted, decompressed and re-hashed against the catalog; the padding
//! must decrypt to zeros; the whole encrypted stream must match the recorded
//! size and final hash. Any mismatch is data damage and panics the process.

use std::{collections::HashMap, io::Read};

use cipher::StreamCipher;
use sha2::{Digest, Sha256};
use shared::types::{BlobHash, ContentHash};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    catalog::blobs::{BlobEntryRecord, BlobRecord},
    compress,
    crypto::cipher_at,
};

const READ_STEP: usize = 64 * 1024;

/// One decrypted, decompressed, verified entry of a blob.
pub struct VerifiedEntry {
    pub hash: ContentHash,
    pub data: Vec<u8>,
}

/// Consumes a byte stream purporting to be the given blob and returns its
/// verified entries. `entries` must be the catalog rows of the blob in
/// `(offset, final_size)` order; `expected_sizes` the decompressed size of
/// every content in it.
pub async fn read_blob_verified(
    mut reader: impl AsyncRead + Send + Unpin,
    blob: &BlobRecord,
    entries: &[BlobEntryRecord],
    expected_sizes: &HashMap<ContentHash, u64>,
) -> anyhow::Result<Vec<VerifiedEntry>> {
    let mut enc_hasher = Sha256::new();
    let mut consumed: u64 = 0;
    let mut verified = Vec::with_capacity(entries.len());

    for entry in entries {
        if entry.offset != consumed {
            panic!(
                "catalog violation: blob {} entry at offset {} follows {} consumed bytes",
                hex::encode(blob.blob_id),
                entry.offset,
                consumed
            );
        }

        // read the entry's encrypted bytes, hashing the raw stream as we go
        let mut encrypted = vec![0u8; entry.final_size as usize];
        reader.read_exact(&mut encrypted).await.map_err(|e| {
            anyhow::anyhow!("blob {} ended inside an entry: {e}", hex::encode(blob.blob_id))
        })?;
        enc_hasher.update(&encrypted);
        consumed += entry.final_size;

        let mut cipher = cipher_at(entry.offset, &entry.encryption_key);
        cipher.apply_keystream(&mut encrypted);

        let codec = compress::by_name(&entry.compression_alg)
            .map_err(|e| anyhow::anyhow!("blob {}: {e}", hex::encode(blob.blob_id)))?;
        let mut data = Vec::new();
        codec
            .decompress(Box::new(&encrypted[..]))
            .and_then(|mut decompressed| Ok(decompressed.read_to_end(&mut data)?))
            .unwrap_or_else(|e| {
                panic!(
                    "data damage: entry {} of blob {} fails to decompress: {e}",
                    hex::encode(entry.hash),
                    hex::encode(blob.blob_id)
                )
            });

        if compress::sha256(&data) != entry.hash {
            panic!(
                "data damage: entry at offset {} of blob {} does not hash to {}",
                entry.offset,
                hex::encode(blob.blob_id),
                hex::encode(entry.hash)
            );
        }

        match expected_sizes.get(&entry.hash) {
            Some(&size) if size == data.len() as u64 => {}
            Some(&size) => panic!(
                "data damage: entry {} of blob {} decompressed to {} bytes, catalog says {}",
                hex::encode(entry.hash),
                hex::encode(blob.blob_id),
                data.len(),
                size
            ),
            None => panic!(
                "catalog violation: entry {} of blob {} has no sizes row",
                hex::encode(entry.hash),
                hex::encode(blob.blob_id)
            ),
        }

        verified.push(VerifiedEntry { hash: entry.hash, data });
    }

    // everything after the last entry is padding: encrypted zeros under the
    // blob's padding key
    let mut pad_cipher = cipher_at(consumed, &blob.padding_key);
    let mut buf = vec![0u8; READ_STEP];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        enc_hasher.update(&buf[..n]);
        consumed += n as u64;

        pad_cipher.apply_keystream(&mut buf[..n]);
        if buf[..n].iter().any(|&b| b != 0) {
            panic!("data damage: blob {} padding is not zeros", hex::encode(blob.blob_id));
        }
    }

    if consumed != blob.size {
        panic!(
            "data damage: blob {} is {} bytes, catalog says {}",
            hex::encode(blob.blob_id),
            consumed,
            blob.size
        );
    }

    let final_hash: BlobHash = enc_hasher.finalize().into();
    if final_hash != blob.final_hash {
        panic!(
            "data damage: blob {} encrypted bytes hash to {}, catalog says {}",
            hex::encode(blob.blob_id),
            hex::encode(final_hash),
            hex::encode(blob.final_hash)
        );
    }

    Ok(verified)
}

/// Collects the decompressed sizes the catalog expects for a set of entries.
pub async fn expected_sizes(
    catalog: &crate::catalog::Catalog,
    entries: &[BlobEntryRecord],
) -> anyhow::Result<HashMap<ContentHash, u64>> {
    let mut transaction = catalog.transaction().await?;

    let mut sizes = HashMap::with_capacity(entries.len());
    for entry in entries {
        if let Some(size) = transaction.get_size(&entry.hash).await? {
            sizes.insert(entry.hash, size);
        }
    }

    transaction.commit().await?;
    Ok(sizes)
}
