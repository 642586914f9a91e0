//! Catalog access for path revisions (`files`) and content sizes (`sizes`).
//!
//! A path's history is a sequence of non-overlapping revisions; the one with
//! `end` unset is current. Content rows in `sizes` are born when first seen
//! and never deleted while referenced.

use shared::types::ContentHash;
use sqlx::Row;

use crate::{
    catalog::{to_hash, Catalog, Transaction},
    defaults::MAX_PATH_LENGTH,
};

/// One revision of a path: the binding of a path to a content hash over a
/// time interval.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRevision {
    pub path: String,
    pub hash: ContentHash,
    pub start: i64,
    pub end: Option<i64>,
    pub fs_modified: i64,
    pub permissions: u32,
}

/// Validates a catalog file path: absolute, normalized, UTF-8 without control
/// characters, no trailing slash and at most `MAX_PATH_LENGTH` bytes.
pub fn validate_path(path: &str) -> anyhow::Result<()> {
    anyhow::ensure!(path.len() > 1, "path too short: {path:?}");
    anyhow::ensure!(path.len() <= MAX_PATH_LENGTH, "path too long ({} bytes)", path.len());
    anyhow::ensure!(path.starts_with('/'), "path is not absolute: {path:?}");
    anyhow::ensure!(!path.ends_with('/'), "path ends in a slash: {path:?}");
    anyhow::ensure!(!path.chars().any(char::is_control), "path contains control characters");

    for component in path[1..].split('/') {
        anyhow::ensure!(!component.is_empty(), "path contains an empty component: {path:?}");
        anyhow::ensure!(
            component != "." && component != "..",
            "path is not normalized: {path:?}"
        );
    }

    Ok(())
}

impl Catalog {
    pub async fn get_open_revision(&self, path: &str) -> anyhow::Result<Option<FileRevision>> {
        let mut transaction = self.transaction().await?;
        let result = transaction.get_open_revision(path).await;
        transaction.commit().await?;

        result
    }

    pub async fn get_revision_history(&self, path: &str) -> anyhow::Result<Vec<FileRevision>> {
        let mut transaction = self.transaction().await?;
        let result = transaction.get_revision_history(path).await;
        transaction.commit().await?;

        result
    }
}

impl Transaction<'_> {
    /// Gets the current (open) revision of a path, if one exists.
    pub async fn get_open_revision(&mut self, path: &str) -> anyhow::Result<Option<FileRevision>> {
        let row = sqlx::query(
            r#"select path, hash, start, "end", fs_modified, permissions
               from files where path = $1 and "end" is null"#,
        )
        .bind(path)
        .fetch_optional(&mut self.transaction)
        .await?;

        Ok(row.map(revision_from_row))
    }

    /// Gets every revision of a path, oldest first.
    pub async fn get_revision_history(&mut self, path: &str) -> anyhow::Result<Vec<FileRevision>> {
        let rows = sqlx::query(
            r#"select path, hash, start, "end", fs_modified, permissions
               from files where path = $1 order by start"#,
        )
        .bind(path)
        .fetch_all(&mut self.transaction)
        .await?;

        Ok(rows.into_iter().map(revision_from_row).collect())
    }

    /// Gets all paths that currently have an open revision below a root.
    pub async fn get_open_paths_under(&mut self, root: &str) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            r#"select path from files
               where "end" is null and (path = $1 or path like $2)"#,
        )
        .bind(root)
        .bind(format!("{}/%", root.trim_end_matches('/')))
        .fetch_all(&mut self.transaction)
        .await?;

        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    /// Closes the open revision of a path, making its content historical. A
    /// revision observed and closed within the same second still ends
    /// strictly after it started.
    pub async fn close_revision(&mut self, path: &str, end: i64) -> anyhow::Result<()> {
        sqlx::query(r#"update files set "end" = max($2, start + 1) where path = $1 and "end" is null"#)
            .bind(path)
            .bind(end)
            .execute(&mut self.transaction)
            .await?;

        Ok(())
    }

    /// Opens a new revision for a path. The caller must have closed any
    /// previous open revision first.
    pub async fn insert_revision(&mut self, revision: &FileRevision) -> anyhow::Result<()> {
        validate_path(&revision.path)?;

        sqlx::query(
            r#"insert into files (path, hash, start, "end", fs_modified, permissions)
               values ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(&revision.path)
        .bind(revision.hash.to_vec())
        .bind(revision.start)
        .bind(revision.end)
        .bind(revision.fs_modified)
        .bind(i64::from(revision.permissions))
        .execute(&mut self.transaction)
        .await?;

        Ok(())
    }

    /// Refreshes the filesystem mtime on the open revision of a path, used
    /// when the content turned out to be unchanged.
    pub async fn update_fs_modified(&mut self, path: &str, fs_modified: i64) -> anyhow::Result<()> {
        sqlx::query(r#"update files set fs_modified = $2 where path = $1 and "end" is null"#)
            .bind(path)
            .bind(fs_modified)
            .execute(&mut self.transaction)
            .await?;

        Ok(())
    }

    /// Records the decompressed size of a content, ignoring the insert if the
    /// content is already known.
    pub async fn upsert_size(&mut self, hash: &ContentHash, size: u64) -> anyhow::Result<()> {
        sqlx::query("insert or ignore into sizes (hash, size) values ($1, $2)")
            .bind(hash.to_vec())
            .bind(cast::i64(size).expect("content size overflow"))
            .execute(&mut self.transaction)
            .await?;

        Ok(())
    }

    pub async fn get_size(&mut self, hash: &ContentHash) -> anyhow::Result<Option<u64>> {
        let row = sqlx::query("select size from sizes where hash = $1")
            .bind(hash.to_vec())
            .fetch_optional(&mut self.transaction)
            .await?;

        Ok(row.map(|row| cast::u64(row.get::<i64, _>(0)).expect("negative size in catalog")))
    }
}

fn revision_from_row(row: sqlx::sqlite::SqliteRow) -> FileRevision {
    FileRevision {
        path: row.get("path"),
        hash: to_hash(row.get("hash")),
        start: row.get("start"),
        end: row.get("end"),
        fs_modified: row.get("fs_modified"),
        permissions: cast::u32(row.get::<i64, _>("permissions"))
            .expect("permissions out of range in catalog"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::open_test_catalog;

    #[test]
    fn path_validation() {
        for good in ["/a", "/home/user/file.txt", "/x/y.z"] {
            assert!(validate_path(good).is_ok(), "{good:?} should validate");
        }

        for bad in [
            "",
            "/",
            "relative/path",
            "/ends/in/slash/",
            "/double//slash",
            "/dot/./component",
            "/dotdot/../component",
            "/control\u{7}char",
        ] {
            assert!(validate_path(bad).is_err(), "{bad:?} should be rejected");
        }

        let long = format!("/{}", "a".repeat(MAX_PATH_LENGTH));
        assert!(validate_path(&long).is_err());
    }

    #[tokio::test]
    async fn revision_lifecycle() {
        let (catalog, _dir) = open_test_catalog().await;
        let hash_a = [1u8; 32];
        let hash_b = [2u8; 32];

        let mut transaction = catalog.transaction().await.unwrap();
        transaction.upsert_size(&hash_a, 10).await.unwrap();
        transaction.upsert_size(&hash_b, 20).await.unwrap();
        transaction
            .insert_revision(&FileRevision {
                path: "/data/file".to_string(),
                hash: hash_a,
                start: 100,
                end: None,
                fs_modified: 90,
                permissions: 0o644,
            })
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        let open = catalog.get_open_revision("/data/file").await.unwrap().unwrap();
        assert_eq!(open.hash, hash_a);

        // content changes: close the old revision and open a new one
        let mut transaction = catalog.transaction().await.unwrap();
        transaction.close_revision("/data/file", 200).await.unwrap();
        transaction
            .insert_revision(&FileRevision {
                path: "/data/file".to_string(),
                hash: hash_b,
                start: 200,
                end: None,
                fs_modified: 195,
                permissions: 0o644,
            })
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        let history = catalog.get_revision_history("/data/file").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].end, Some(200));
        assert_eq!(history[1].hash, hash_b);
        assert_eq!(history[1].end, None);
    }

    #[tokio::test]
    async fn at_most_one_open_revision_per_path() {
        let (catalog, _dir) = open_test_catalog().await;

        let mut transaction = catalog.transaction().await.unwrap();
        transaction.upsert_size(&[3u8; 32], 1).await.unwrap();
        let revision = FileRevision {
            path: "/x/y".to_string(),
            hash: [3u8; 32],
            start: 1,
            end: None,
            fs_modified: 1,
            permissions: 0o600,
        };
        transaction.insert_revision(&revision).await.unwrap();

        let mut second = revision.clone();
        second.start = 2;
        assert!(transaction.insert_revision(&second).await.is_err());
    }
}
