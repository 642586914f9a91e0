//! Catalog access for registered storages.

use shared::types::StorageId;
use sqlx::Row;

use crate::catalog::{to_hash, Catalog, Transaction};

/// One registered storage: where blobs can be replicated to. The `identifier`
/// is kind-specific opaque configuration (for S3 a JSON credential block).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageRecord {
    pub storage_id: StorageId,
    pub readable_label: String,
    pub kind: String,
    pub identifier: String,
    pub root_path: String,
}

impl Catalog {
    pub async fn list_storages(&self) -> anyhow::Result<Vec<StorageRecord>> {
        let mut transaction = self.transaction().await?;
        let result = transaction.list_storages().await;
        transaction.commit().await?;

        result
    }

    pub async fn get_storage_by_label(
        &self,
        label: &str,
    ) -> anyhow::Result<Option<StorageRecord>> {
        let mut transaction = self.transaction().await?;
        let result = transaction.get_storage_by_label(label).await;
        transaction.commit().await?;

        result
    }
}

impl Transaction<'_> {
    pub async fn insert_storage(&mut self, storage: &StorageRecord) -> anyhow::Result<()> {
        sqlx::query(
            "insert into storage (storage_id, readable_label, type, identifier, root_path)
             values ($1, $2, $3, $4, $5)",
        )
        .bind(storage.storage_id.to_vec())
        .bind(&storage.readable_label)
        .bind(&storage.kind)
        .bind(&storage.identifier)
        .bind(&storage.root_path)
        .execute(&mut self.transaction)
        .await?;

        Ok(())
    }

    pub async fn list_storages(&mut self) -> anyhow::Result<Vec<StorageRecord>> {
        let rows = sqlx::query(
            "select storage_id, readable_label, type, identifier, root_path
             from storage order by readable_label",
        )
        .fetch_all(&mut self.transaction)
        .await?;

        Ok(rows.into_iter().map(storage_from_row).collect())
    }

    pub async fn get_storage_by_label(
        &mut self,
        label: &str,
    ) -> anyhow::Result<Option<StorageRecord>> {
        let row = sqlx::query(
            "select storage_id, readable_label, type, identifier, root_path
             from storage where readable_label = $1",
        )
        .bind(label)
        .fetch_optional(&mut self.transaction)
        .await?;

        Ok(row.map(storage_from_row))
    }
}

fn storage_from_row(row: sqlx::sqlite::SqliteRow) -> StorageRecord {
    StorageRecord {
        storage_id: to_hash(row.get("storage_id")),
        readable_label: row.get("readable_label"),
        kind: row.get("type"),
        identifier: row.get("identifier"),
        root_path: row.get("root_path"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::open_test_catalog;

    #[tokio::test]
    async fn storages_round_trip_and_labels_are_unique() {
        let (catalog, _dir) = open_test_catalog().await;

        let record = StorageRecord {
            storage_id: [1u8; 32],
            readable_label: "primary-bucket".to_string(),
            kind: "S3".to_string(),
            identifier: r#"{"bucket_name":"backups"}"#.to_string(),
            root_path: "engine".to_string(),
        };

        let mut transaction = catalog.transaction().await.unwrap();
        transaction.insert_storage(&record).await.unwrap();
        transaction.commit().await.unwrap();

        let found = catalog.get_storage_by_label("primary-bucket").await.unwrap().unwrap();
        assert_eq!(found, record);

        let mut duplicate = record.clone();
        duplicate.storage_id = [2u8; 32];
        let mut transaction = catalog.transaction().await.unwrap();
        assert!(transaction.insert_storage(&duplicate).await.is_err());
    }
}
