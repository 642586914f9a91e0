//! The relational catalog binding hashes, files, blobs, blob entries and
//! storage locations. Contains the `Transaction` struct that can be used to
//! perform database transactions and has all the necessary methods to access
//! the database. The `Catalog` struct is used to create a `Transaction` and
//! has shorthand methods for most of the same methods in `Transaction`.
//!
//! All engine state that must survive a crash lives here; blobs themselves
//! are immutable once written, so a transaction over these tables is the
//! only commit point in the system.

pub mod blobs;
pub mod files;
pub mod storages;

use std::{
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteQueryResult},
    Error, Sqlite, SqlitePool,
};

#[derive(Clone, Debug)]
pub struct Catalog {
    db_pool: SqlitePool,
}

pub struct Transaction<'a> {
    transaction: sqlx::Transaction<'a, Sqlite>,
}

impl Catalog {
    /// Opens (creating if missing) the catalog database at the given path,
    /// with write-ahead logging and a single shared connection.
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let catalog = Self {
            db_pool: SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await?,
        };

        Self::create_db_structure(&catalog.db_pool).await?;

        Ok(catalog)
    }

    async fn create_db_structure(pool: &SqlitePool) -> Result<SqliteQueryResult, Error> {
        sqlx::query(
            r#"create table if not exists sizes
            (
                hash blob not null
                    constraint sizes_pk
                    primary key,
                size integer not null
            );

            create table if not exists files
            (
                path        text not null,
                hash        blob not null references sizes (hash),
                start       integer not null,
                "end"       integer,
                fs_modified integer not null,
                permissions integer not null,
                constraint files_path_start_unique unique (path, start)
            );

            create unique index if not exists files_open_revision_unique
                on files (path) where "end" is null;
            create unique index if not exists files_closed_revision_unique
                on files (path, "end") where "end" is not null;
            create index if not exists files_hash_idx on files (hash);

            create table if not exists blobs
            (
                blob_id     blob not null
                    constraint blobs_pk
                    primary key,
                padding_key blob not null unique,
                size        integer not null,
                final_hash  blob not null unique
            );

            create table if not exists blob_entries
            (
                hash            blob not null references sizes (hash),
                blob_id         blob not null references blobs (blob_id) on delete cascade,
                encryption_key  blob not null,
                final_size      integer not null,
                "offset"        integer not null,
                compression_alg text not null
            );

            create index if not exists blob_entries_hash_idx on blob_entries (hash);
            create index if not exists blob_entries_blob_idx on blob_entries (blob_id, "offset");

            create table if not exists storage
            (
                storage_id     blob not null
                    constraint storage_pk
                    primary key,
                readable_label text not null unique,
                type           text not null,
                identifier     text not null,
                root_path      text not null
            );

            create table if not exists blob_storage
            (
                blob_id    blob not null references blobs (blob_id),
                storage_id blob not null references storage (storage_id),
                path       text not null,
                checksum   text,
                timestamp  integer,
                constraint blob_storage_location_unique unique (storage_id, path)
            );

            create index if not exists blob_storage_blob_idx on blob_storage (blob_id);"#,
        )
        .execute(pool)
        .await
    }

    pub async fn transaction(&self) -> anyhow::Result<Transaction> {
        let transaction = self.db_pool.begin().await?;

        Ok(Transaction { transaction })
    }

    pub fn get_unix_timestamp() -> i64 {
        cast::i64(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        )
        .expect("timestamp overflow")
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.db_pool
    }
}

impl Transaction<'_> {
    pub async fn commit(self) -> anyhow::Result<()> {
        self.transaction.commit().await?;

        Ok(())
    }

    pub async fn rollback(self) -> anyhow::Result<()> {
        self.transaction.rollback().await?;

        Ok(())
    }

    /// Runs an ad-hoc query with integer binds and returns how many rows it
    /// produced. Used by the paranoia engine's zero-row checks.
    pub(crate) async fn raw_rows(&mut self, sql: &str, binds: &[i64]) -> anyhow::Result<i64> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(bind);
        }

        Ok(query.fetch_all(&mut self.transaction).await?.len() as i64)
    }

    /// As `raw_rows`, for the padding-bounds check and its mixed-type binds.
    pub(crate) async fn raw_rows_with_padding_bounds(
        &mut self,
        sql: &str,
        min_bytes: u64,
        min_percent: f64,
        max_bytes: u64,
        max_percent: f64,
    ) -> anyhow::Result<i64> {
        let rows = sqlx::query(sql)
            .bind(cast::i64(min_bytes).expect("padding bound overflow"))
            .bind(min_percent)
            .bind(cast::i64(max_bytes).expect("padding bound overflow"))
            .bind(max_percent)
            .fetch_all(&mut self.transaction)
            .await?;

        Ok(rows.len() as i64)
    }
}

/// Converts a stored 32-byte blob column back to its array form.
pub(crate) fn to_hash(bytes: Vec<u8>) -> [u8; 32] {
    bytes.try_into().expect("catalog holds a hash column of the wrong width")
}

/// Converts a stored 16-byte key column back to its array form.
pub(crate) fn to_key(bytes: Vec<u8>) -> [u8; 16] {
    bytes.try_into().expect("catalog holds a key column of the wrong width")
}

#[cfg(test)]
pub(crate) async fn open_test_catalog() -> (Catalog, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let catalog = Catalog::open(&dir.path().join("catalog.db")).await.expect("open catalog");

    (catalog, dir)
}
