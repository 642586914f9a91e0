//! Writing queued entries out as encrypted, padded blobs.

use std::io::Write;

use cipher::StreamCipher;
use rand::Rng;
use sha2::{Digest, Sha256};
use shared::types::{BlobHash, BlobId, EntryKey, PaddingKey};

use crate::{
    blobpack::{PackedBlob, PackedEntry, Packer},
    catalog::{
        blobs::{BlobEntryRecord, BlobLocation, BlobRecord},
        Catalog,
    },
    compress,
    crypto::EncryptWriter,
    storage::{BlobUpload, ChecksumTracker},
};

/// Encrypted padding is produced and uploaded in slices of this size.
const PADDING_WRITE_STEP: usize = 64 * 1024;

impl Packer {
    pub(super) async fn write_blobs(&mut self) -> anyhow::Result<()> {
        while !self.pending.is_empty() {
            let result = self.write_one_blob().await;
            if result.is_err() {
                // the queue is in an undefined state now; disarm the drop
                // guard so the original error surfaces instead
                self.dirty = false;
                return result;
            }
        }

        self.pending_size = self.pending.iter().map(|e| e.data.len() as u64).sum();
        Ok(())
    }

    async fn write_one_blob(&mut self) -> anyhow::Result<()> {
        let mut blob_id = BlobId::default();
        getrandom::getrandom(&mut blob_id)?;
        let mut padding_key = PaddingKey::default();
        getrandom::getrandom(&mut padding_key)?;

        let mut uploads = Vec::with_capacity(self.storages.len());
        for storage in &self.storages {
            uploads.push(storage.begin_blob_upload(blob_id).await?);
        }

        let mut blob = BlobWriter {
            uploads,
            hasher: Sha256::new(),
            checksums: ChecksumTracker::default(),
        };

        let result = self
            .pack_entries_into(blob_id, padding_key, &mut blob)
            .await;

        match result {
            Ok(packed) => {
                self.packed.push(packed);
                Ok(())
            }
            Err(e) => {
                for upload in blob.uploads {
                    // best-effort release of the partial uploads
                    upload.abort().await.ok();
                }
                Err(e)
            }
        }
    }

    async fn pack_entries_into(
        &mut self,
        blob_id: BlobId,
        padding_key: PaddingKey,
        blob: &mut BlobWriter,
    ) -> anyhow::Result<PackedBlob> {
        let mut entries: Vec<PackedEntry> = Vec::new();
        let mut offset: u64 = 0;
        let mut plaintext_size: u64 = 0;

        while let Some(entry) = self.pending.pop_front() {
            // the hash is the contract with everything downstream; a content
            // that does not match it must never reach a blob
            if compress::sha256(&entry.data) != entry.hash {
                panic!(
                    "data damage: content queued as {} hashes differently",
                    hex::encode(entry.hash)
                );
            }

            let mut key = EntryKey::default();
            getrandom::getrandom(&mut key)?;

            let source_path = self
                .catalog
                .best_source_path(&entry.hash)
                .await?
                .unwrap_or_default();
            let codecs = compress::pick_codecs(&source_path, entry.data.len() as u64, &self.settings);

            let mut encrypted = Vec::new();
            let compressed = {
                let mut writer = EncryptWriter::new(&mut encrypted, offset, &key);
                let compressed = compress::run_chain(&codecs, &entry.data, &mut writer)?;
                writer.flush()?;
                compressed
            };

            blob.write_everywhere(&encrypted).await?;

            entries.push(PackedEntry {
                record: BlobEntryRecord {
                    hash: entry.hash,
                    blob_id,
                    encryption_key: key,
                    final_size: compressed.written,
                    offset,
                    compression_alg: compressed.alg.to_string(),
                },
                plaintext_size: entry.data.len() as u64,
            });

            offset += compressed.written;
            plaintext_size += entry.data.len() as u64;

            if plaintext_size >= self.settings.min_blob_size
                || entries.len() >= self.settings.max_blob_entries
            {
                break;
            }
        }

        // the padding makes blob sizes unrelatable to their contents; its key
        // is stored so the padding stays reproducible and verifiable
        let (pad_min, pad_max) = self.settings.padding_bounds(offset);
        let pad_len = rand::thread_rng().gen_range(pad_min..=pad_max);

        let mut pad_cipher = crate::crypto::cipher_at(offset, &padding_key);
        let mut remaining = pad_len;
        while remaining > 0 {
            let step = (remaining as usize).min(PADDING_WRITE_STEP);
            let mut chunk = vec![0u8; step];
            pad_cipher.apply_keystream(&mut chunk);

            blob.write_everywhere(&chunk).await?;
            remaining -= step as u64;
        }

        let total_size = offset + pad_len;
        let final_hash: BlobHash = std::mem::take(&mut blob.hasher).finalize().into();

        // close the uploads and cross-check everything each storage reports
        let (md5, etag) = std::mem::take(&mut blob.checksums).finalize();
        let timestamp = Catalog::get_unix_timestamp();

        let mut locations = Vec::new();
        for (upload, storage) in std::mem::take(&mut blob.uploads).into_iter().zip(&self.storages)
        {
            let result = upload.finish().await?;

            if result.size != total_size {
                panic!(
                    "data damage: storage reported {} bytes for blob {}, packer wrote {}",
                    result.size,
                    hex::encode(blob_id),
                    total_size
                );
            }
            if result.checksum != md5 && result.checksum != etag {
                panic!(
                    "data damage: storage checksum {} for blob {} matches neither {} nor {}",
                    result.checksum,
                    hex::encode(blob_id),
                    md5,
                    etag
                );
            }

            locations.push(BlobLocation {
                blob_id,
                storage_id: storage.get_id(),
                path: result.path,
                checksum: result.checksum,
                timestamp,
            });
        }

        crate::log!(
            "wrote blob {} with {} entries, {} bytes",
            hex::encode(blob_id),
            entries.len(),
            total_size
        );

        Ok(PackedBlob {
            blob: BlobRecord { blob_id, padding_key, size: total_size, final_hash },
            entries,
            locations,
        })
    }
}

/// The write fan-out of one in-flight blob: every target's upload plus the
/// running final hash and local checksum derivation.
struct BlobWriter {
    uploads: Vec<Box<dyn BlobUpload>>,
    hasher: Sha256,
    checksums: ChecksumTracker,
}

impl BlobWriter {
    async fn write_everywhere(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.hasher.update(buf);
        self.checksums.update(buf);

        futures::future::try_join_all(self.uploads.iter_mut().map(|upload| upload.write(buf)))
            .await?;

        Ok(())
    }
}
