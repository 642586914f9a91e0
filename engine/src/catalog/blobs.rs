//! Catalog access for blobs, their entries and their storage locations.

use itertools::Itertools;
use shared::types::{BlobHash, BlobId, ContentHash, EntryKey, PaddingKey, StorageId};
use sqlx::Row;

use crate::catalog::{to_hash, to_key, Catalog, Transaction};

/// One immutable encrypted container object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobRecord {
    pub blob_id: BlobId,
    pub padding_key: PaddingKey,
    pub size: u64,
    pub final_hash: BlobHash,
}

/// One compressed, encrypted content inside a blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobEntryRecord {
    pub hash: ContentHash,
    pub blob_id: BlobId,
    pub encryption_key: EntryKey,
    pub final_size: u64,
    pub offset: u64,
    pub compression_alg: String,
}

/// A blob's physical location in one storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobLocation {
    pub blob_id: BlobId,
    pub storage_id: StorageId,
    pub path: String,
    pub checksum: String,
    pub timestamp: i64,
}

impl Catalog {
    pub async fn entry_for_hash(
        &self,
        hash: &ContentHash,
    ) -> anyhow::Result<Option<BlobEntryRecord>> {
        let mut transaction = self.transaction().await?;
        let result = transaction.entry_for_hash(hash).await;
        transaction.commit().await?;

        result
    }

    pub async fn hash_known(&self, hash: &ContentHash) -> anyhow::Result<bool> {
        let mut transaction = self.transaction().await?;
        let result = transaction.hash_known(hash).await;
        transaction.commit().await?;

        result
    }

    pub async fn best_source_path(&self, hash: &ContentHash) -> anyhow::Result<Option<String>> {
        let mut transaction = self.transaction().await?;
        let result = transaction.best_source_path(hash).await;
        transaction.commit().await?;

        result
    }

    pub async fn get_blob(&self, blob_id: &BlobId) -> anyhow::Result<Option<BlobRecord>> {
        let mut transaction = self.transaction().await?;
        let result = transaction.get_blob(blob_id).await;
        transaction.commit().await?;

        result
    }

    pub async fn entries_for_blob(&self, blob_id: &BlobId) -> anyhow::Result<Vec<BlobEntryRecord>> {
        let mut transaction = self.transaction().await?;
        let result = transaction.entries_for_blob(blob_id).await;
        transaction.commit().await?;

        result
    }

    pub async fn locations_for_blob(&self, blob_id: &BlobId) -> anyhow::Result<Vec<BlobLocation>> {
        let mut transaction = self.transaction().await?;
        let result = transaction.locations_for_blob(blob_id).await;
        transaction.commit().await?;

        result
    }

    pub async fn all_blob_ids(&self) -> anyhow::Result<Vec<BlobId>> {
        let mut transaction = self.transaction().await?;
        let result = transaction.all_blob_ids().await;
        transaction.commit().await?;

        result
    }
}

impl Transaction<'_> {
    /// Where one content lives: any blob entry holding the hash.
    pub async fn entry_for_hash(
        &mut self,
        hash: &ContentHash,
    ) -> anyhow::Result<Option<BlobEntryRecord>> {
        let row = sqlx::query(
            r#"select hash, blob_id, encryption_key, final_size, "offset", compression_alg
               from blob_entries where hash = $1 limit 1"#,
        )
        .bind(hash.to_vec())
        .fetch_optional(&mut self.transaction)
        .await?;

        Ok(row.map(entry_from_row))
    }

    /// Whether a content hash is already stored inside some blob.
    pub async fn hash_known(&mut self, hash: &ContentHash) -> anyhow::Result<bool> {
        let row = sqlx::query("select 1 from blob_entries where hash = $1 limit 1")
            .bind(hash.to_vec())
            .fetch_optional(&mut self.transaction)
            .await?;

        Ok(row.is_some())
    }

    /// The most representative path a content has been seen at, used to pick
    /// its compression. JPEG paths win so the JPEG codec applies consistently.
    pub async fn best_source_path(&mut self, hash: &ContentHash) -> anyhow::Result<Option<String>> {
        let row = sqlx::query(
            "select path from files where hash = $1
             order by case
                 when lower(path) like '%.jpg' or lower(path) like '%.jpeg' then 0
                 else 1
             end, path
             limit 1",
        )
        .bind(hash.to_vec())
        .fetch_optional(&mut self.transaction)
        .await?;

        Ok(row.map(|row| row.get(0)))
    }

    pub async fn insert_blob(&mut self, blob: &BlobRecord) -> anyhow::Result<()> {
        sqlx::query(
            "insert into blobs (blob_id, padding_key, size, final_hash) values ($1, $2, $3, $4)",
        )
        .bind(blob.blob_id.to_vec())
        .bind(blob.padding_key.to_vec())
        .bind(cast::i64(blob.size).expect("blob size overflow"))
        .bind(blob.final_hash.to_vec())
        .execute(&mut self.transaction)
        .await?;

        Ok(())
    }

    pub async fn insert_blob_entry(&mut self, entry: &BlobEntryRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"insert into blob_entries (hash, blob_id, encryption_key, final_size, "offset", compression_alg)
               values ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(entry.hash.to_vec())
        .bind(entry.blob_id.to_vec())
        .bind(entry.encryption_key.to_vec())
        .bind(cast::i64(entry.final_size).expect("entry size overflow"))
        .bind(cast::i64(entry.offset).expect("entry offset overflow"))
        .bind(&entry.compression_alg)
        .execute(&mut self.transaction)
        .await?;

        Ok(())
    }

    pub async fn insert_blob_location(&mut self, location: &BlobLocation) -> anyhow::Result<()> {
        sqlx::query(
            "insert into blob_storage (blob_id, storage_id, path, checksum, timestamp)
             values ($1, $2, $3, $4, $5)",
        )
        .bind(location.blob_id.to_vec())
        .bind(location.storage_id.to_vec())
        .bind(&location.path)
        .bind(&location.checksum)
        .bind(location.timestamp)
        .execute(&mut self.transaction)
        .await?;

        Ok(())
    }

    pub async fn get_blob(&mut self, blob_id: &BlobId) -> anyhow::Result<Option<BlobRecord>> {
        let row = sqlx::query(
            "select blob_id, padding_key, size, final_hash from blobs where blob_id = $1",
        )
        .bind(blob_id.to_vec())
        .fetch_optional(&mut self.transaction)
        .await?;

        Ok(row.map(|row| BlobRecord {
            blob_id: to_hash(row.get("blob_id")),
            padding_key: to_key(row.get("padding_key")),
            size: cast::u64(row.get::<i64, _>("size")).expect("negative blob size in catalog"),
            final_hash: to_hash(row.get("final_hash")),
        }))
    }

    /// The entries of a blob in their on-disk order. The zero-length entry
    /// (if any) sorts before a data entry at the same offset.
    pub async fn entries_for_blob(
        &mut self,
        blob_id: &BlobId,
    ) -> anyhow::Result<Vec<BlobEntryRecord>> {
        let rows = sqlx::query(
            r#"select hash, blob_id, encryption_key, final_size, "offset", compression_alg
               from blob_entries where blob_id = $1 order by "offset", final_size"#,
        )
        .bind(blob_id.to_vec())
        .fetch_all(&mut self.transaction)
        .await?;

        Ok(rows.into_iter().map(entry_from_row).collect())
    }

    pub async fn locations_for_blob(
        &mut self,
        blob_id: &BlobId,
    ) -> anyhow::Result<Vec<BlobLocation>> {
        let rows = sqlx::query(
            "select blob_id, storage_id, path, checksum, timestamp
             from blob_storage where blob_id = $1",
        )
        .bind(blob_id.to_vec())
        .fetch_all(&mut self.transaction)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| BlobLocation {
                blob_id: to_hash(row.get("blob_id")),
                storage_id: to_hash(row.get("storage_id")),
                path: row.get("path"),
                checksum: row.get::<Option<String>, _>("checksum").unwrap_or_default(),
                timestamp: row.get::<Option<i64>, _>("timestamp").unwrap_or_default(),
            })
            .collect())
    }

    pub async fn all_blob_ids(&mut self) -> anyhow::Result<Vec<BlobId>> {
        let rows = sqlx::query("select blob_id from blobs")
            .fetch_all(&mut self.transaction)
            .await?;

        Ok(rows.into_iter().map(|row| to_hash(row.get(0))).collect())
    }

    /// Deletes a blob with its entries (cascading) and locations.
    pub async fn delete_blob(&mut self, blob_id: &BlobId) -> anyhow::Result<()> {
        sqlx::query("delete from blob_storage where blob_id = $1")
            .bind(blob_id.to_vec())
            .execute(&mut self.transaction)
            .await?;

        sqlx::query("delete from blobs where blob_id = $1")
            .bind(blob_id.to_vec())
            .execute(&mut self.transaction)
            .await?;

        Ok(())
    }

    /// Blob IDs containing any content that appears in more than one entry,
    /// the candidates for a dedup repack.
    pub async fn duplicate_content_blob_ids(&mut self) -> anyhow::Result<Vec<BlobId>> {
        let rows = sqlx::query(
            "select distinct blob_id from blob_entries
             where hash in (select hash from blob_entries group by hash having count(*) > 1)
             order by blob_id",
        )
        .fetch_all(&mut self.transaction)
        .await?;

        Ok(rows.into_iter().map(|row| to_hash(row.get(0))).collect())
    }

    /// Blob IDs whose entries all share one encryption key even though there
    /// is more than one entry, the candidates for an encryption upgrade.
    pub async fn legacy_blob_ids(&mut self) -> anyhow::Result<Vec<BlobId>> {
        let rows = sqlx::query(
            "select blob_id from blob_entries
             group by blob_id
             having count(*) > 1 and count(distinct encryption_key) = 1
             order by blob_id",
        )
        .fetch_all(&mut self.transaction)
        .await?;

        Ok(rows.into_iter().map(|row| to_hash(row.get(0))).collect())
    }

    /// All blob IDs sharing at least one content hash with any of the given
    /// blobs (including the given blobs themselves).
    pub async fn blobs_sharing_content(
        &mut self,
        blob_ids: &[BlobId],
    ) -> anyhow::Result<Vec<BlobId>> {
        if blob_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..blob_ids.len()).map(|_| "?").join(", ");
        let sql = format!(
            "select distinct peer.blob_id from blob_entries own
             join blob_entries peer on peer.hash = own.hash
             where own.blob_id in ({placeholders})
             order by peer.blob_id"
        );

        let mut query = sqlx::query(&sql);
        for blob_id in blob_ids {
            query = query.bind(blob_id.to_vec());
        }

        let rows = query.fetch_all(&mut self.transaction).await?;

        Ok(rows.into_iter().map(|row| to_hash(row.get(0))).collect())
    }

    /// The largest decompressed entry size inside a blob.
    pub async fn max_entry_size(&mut self, blob_id: &BlobId) -> anyhow::Result<u64> {
        let row = sqlx::query(
            "select coalesce(max(s.size), 0) from blob_entries be
             join sizes s on s.hash = be.hash
             where be.blob_id = $1",
        )
        .bind(blob_id.to_vec())
        .fetch_one(&mut self.transaction)
        .await?;

        Ok(cast::u64(row.get::<i64, _>(0)).expect("negative size in catalog"))
    }

    /// The single zero-length entry shared by all empty files, if it exists.
    pub async fn zero_length_entry(&mut self) -> anyhow::Result<Option<BlobEntryRecord>> {
        let row = sqlx::query(
            r#"select be.hash, be.blob_id, be.encryption_key, be.final_size, be."offset", be.compression_alg
               from blob_entries be join sizes s on s.hash = be.hash
               where s.size = 0 limit 1"#,
        )
        .fetch_optional(&mut self.transaction)
        .await?;

        Ok(row.map(entry_from_row))
    }

    /// The expected `{path -> (checksum, size)}` mapping of one storage's blob
    /// tree, used by storage paranoia.
    pub async fn expected_objects(
        &mut self,
        storage_id: &StorageId,
    ) -> anyhow::Result<Vec<(String, String, u64)>> {
        let rows = sqlx::query(
            "select bs.path, bs.checksum, b.size from blob_storage bs
             join blobs b on b.blob_id = bs.blob_id
             where bs.storage_id = $1",
        )
        .bind(storage_id.to_vec())
        .fetch_all(&mut self.transaction)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("path"),
                    row.get::<Option<String>, _>("checksum").unwrap_or_default(),
                    cast::u64(row.get::<i64, _>("size")).expect("negative blob size in catalog"),
                )
            })
            .collect())
    }
}

fn entry_from_row(row: sqlx::sqlite::SqliteRow) -> BlobEntryRecord {
    BlobEntryRecord {
        hash: to_hash(row.get("hash")),
        blob_id: to_hash(row.get("blob_id")),
        encryption_key: to_key(row.get("encryption_key")),
        final_size: cast::u64(row.get::<i64, _>("final_size")).expect("negative entry size"),
        offset: cast::u64(row.get::<i64, _>("offset")).expect("negative entry offset"),
        compression_alg: row.get("compression_alg"),
    }
}
