//! Packing contents into encrypted, padded blobs and reading them back with
//! full verification.
//!
//! A blob is a single immutable object: the concatenation of every entry's
//! compressed-then-encrypted bytes, followed by encrypted zero padding. Each
//! entry has its own key and is encrypted at its byte offset within the blob,
//! so entries can be decrypted independently. All entry metadata lives in the
//! catalog; the blob itself carries no header.

pub mod pack;
pub mod read;

use std::collections::{HashSet, VecDeque};

use shared::types::ContentHash;

use crate::{
    catalog::{
        blobs::{BlobEntryRecord, BlobLocation, BlobRecord},
        Catalog, Transaction,
    },
    defaults::Settings,
    storage::SharedStorage,
};

/// One entry queued for packing.
pub(crate) struct PendingEntry {
    pub hash: ContentHash,
    pub data: Vec<u8>,
}

/// One entry of a finished blob, with the decompressed size that belongs in
/// the `sizes` table.
#[derive(Clone, Debug)]
pub struct PackedEntry {
    pub record: BlobEntryRecord,
    pub plaintext_size: u64,
}

/// The catalog rows produced by one finished blob. Nothing is committed by
/// the packer itself; the owning session records these in its transaction.
#[derive(Clone, Debug)]
pub struct PackedBlob {
    pub blob: BlobRecord,
    pub entries: Vec<PackedEntry>,
    pub locations: Vec<BlobLocation>,
}

/// Accepts a stream of `(content hash, plaintext)` entries, deduplicates
/// them, and writes encrypted padded blobs to every target storage. Closes a
/// blob once the accumulated plaintext reaches `min_blob_size` or the entry
/// count exceeds `max_blob_entries`.
pub struct Packer {
    catalog: Catalog,
    storages: Vec<SharedStorage>,
    settings: Settings,
    pending: VecDeque<PendingEntry>,
    pending_size: u64,
    queued_hashes: HashSet<ContentHash>,
    packed: Vec<PackedBlob>,
    dedup_against_catalog: bool,
    dirty: bool,
}

impl Packer {
    pub fn new(catalog: Catalog, storages: Vec<SharedStorage>, settings: Settings) -> Self {
        assert!(!storages.is_empty(), "bug: a packer needs at least one target storage");

        Self {
            catalog,
            storages,
            settings,
            pending: VecDeque::new(),
            pending_size: 0,
            queued_hashes: HashSet::new(),
            packed: Vec::new(),
            dedup_against_catalog: true,
            dirty: false,
        }
    }

    /// A packer for rewriting existing blobs: the contents fed to it are
    /// still recorded under their old blobs, so only in-packer deduplication
    /// applies.
    pub fn rewriting(catalog: Catalog, storages: Vec<SharedStorage>, settings: Settings) -> Self {
        let mut packer = Self::new(catalog, storages, settings);
        packer.dedup_against_catalog = false;
        packer
    }

    /// Queues one content for packing. Returns whether it was accepted;
    /// contents already stored in some blob, or already queued here, are
    /// skipped so identical data is only stored once.
    pub async fn add_entry(&mut self, hash: ContentHash, data: Vec<u8>) -> anyhow::Result<bool> {
        if self.queued_hashes.contains(&hash) {
            return Ok(false);
        }
        if self.dedup_against_catalog && self.catalog.hash_known(&hash).await? {
            return Ok(false);
        }

        self.queued_hashes.insert(hash);
        self.pending_size += data.len() as u64;
        self.pending.push_back(PendingEntry { hash, data });
        self.dirty = true;

        if self.pending_size >= self.settings.min_blob_size
            || self.pending.len() > self.settings.max_blob_entries
        {
            self.write_blobs().await?;
        }

        Ok(true)
    }

    /// Packs everything still pending and returns the records of every blob
    /// written by this packer, in order.
    pub async fn finish(mut self) -> anyhow::Result<Vec<PackedBlob>> {
        let result = self.write_blobs().await;
        self.dirty = false;
        result?;

        Ok(std::mem::take(&mut self.packed))
    }
}

impl Drop for Packer {
    fn drop(&mut self) {
        if self.dirty && !std::thread::panicking() {
            panic!("Packer was dropped while dirty, without calling finish()");
        }
    }
}

/// Records one packed blob in the catalog: sizes for its contents, the blob
/// row, its entries and its locations.
pub async fn record_packed(
    transaction: &mut Transaction<'_>,
    packed: &PackedBlob,
) -> anyhow::Result<()> {
    transaction.insert_blob(&packed.blob).await?;

    for entry in &packed.entries {
        transaction.upsert_size(&entry.record.hash, entry.plaintext_size).await?;
        transaction.insert_blob_entry(&entry.record).await?;
    }

    for location in &packed.locations {
        transaction.insert_blob_location(location).await?;
    }

    Ok(())
}
