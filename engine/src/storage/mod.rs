//! The object store abstraction. Every backend produces and consumes opaque
//! byte ranges at string paths; blobs live under a two-level fan-out key
//! `XX/XX/<64-hex blob_id>` below the storage root so no directory grows too
//! large. Uploads report a vendor checksum that the packer re-derives locally
//! from the streamed bytes.

pub mod local;
pub mod memory;
pub mod s3;

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use shared::{
    constants::{DB_BACKUP_PREFIX, DB_V2BACKUP_PREFIX},
    types::{BlobId, StorageId},
};
use tokio::io::AsyncRead;

use crate::{
    defaults::{S3_MULTIPART_PART_SIZE, STORAGE_MAX_RETRIES, STORAGE_RETRY_BASE_DELAY_MS},
    log,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    #[error("{0}")]
    S3Error(#[from] ::s3::error::S3Error),
    #[error("{0}")]
    HttpError(#[from] reqwest::Error),
    #[error("object {0} not found in storage")]
    NotFound(String),
    #[error("object {0} is publicly accessible")]
    PubliclyAccessible(String),
    #[error("malformed blob path {0:?}")]
    MalformedBlobPath(String),
}

/// The kind tag of a storage, stored in the catalog's `type` column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    S3,
    GDrive,
    Local,
    Memory,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::S3 => "S3",
            StorageKind::GDrive => "GDrive",
            StorageKind::Local => "Local",
            StorageKind::Memory => "Mock",
        }
    }
}

/// What an upload reports once every byte has been durably stored.
#[derive(Clone, Debug)]
pub struct UploadResult {
    pub path: String,
    pub checksum: String,
    pub size: u64,
}

/// One object in the blob tree of a storage.
#[derive(Clone, Debug)]
pub struct ListedBlob {
    pub path: String,
    pub checksum: String,
    pub size: u64,
    pub blob_id: BlobId,
}

/// A sink for one in-flight object upload. Implementations buffer/stream as
/// they see fit but must not make the object visible until `finish`.
#[async_trait]
pub trait BlobUpload: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<(), StoreError>;

    /// Completes the upload and returns where the object ended up, with the
    /// vendor checksum and total size the backend observed.
    async fn finish(self: Box<Self>) -> Result<UploadResult, StoreError>;

    /// Abandons the upload, releasing any partial state on the backend.
    async fn abort(self: Box<Self>) -> Result<(), StoreError>;
}

/// How storages are passed around: shared, type-erased handles.
pub type SharedStorage = std::sync::Arc<dyn Storage>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Stable 32-byte identifier of this storage.
    fn get_id(&self) -> StorageId;

    /// Opens an upload for the given blob under the blob tree.
    async fn begin_blob_upload(&self, blob_id: BlobId) -> Result<Box<dyn BlobUpload>, StoreError>;

    /// Opens an upload for a catalog database backup under the storage root.
    async fn begin_database_upload(&self, filename: &str)
        -> Result<Box<dyn BlobUpload>, StoreError>;

    /// Reads `length` bytes starting at `offset`. A zero-length request
    /// returns an empty reader without touching the backend.
    async fn download_section(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, StoreError>;

    /// Lists every object in the blob tree, excluding database backups.
    async fn list_blobs(&self) -> Result<Vec<ListedBlob>, StoreError>;

    /// HEAD-equivalent: `(checksum, size)` of one object.
    async fn metadata(&self, path: &str) -> Result<(String, u64), StoreError>;

    /// Irrevocably removes one object.
    async fn delete_blob(&self, path: &str) -> Result<(), StoreError>;
}

/// The object key of a blob below a storage root: `XX/XX/<64hex>`, where the
/// directories are the first two hex pairs of the blob ID.
pub fn blob_path(root_path: &str, blob_id: &BlobId) -> String {
    let hex = hex::encode(blob_id);
    let key = format!("{}/{}/{}", &hex[..2], &hex[2..4], hex);

    join_root(root_path, &key)
}

/// Joins a path below the storage root, tolerating empty and slash-terminated roots.
pub fn join_root(root_path: &str, key: &str) -> String {
    let root = root_path.trim_end_matches('/');
    if root.is_empty() {
        key.to_string()
    } else {
        format!("{root}/{key}")
    }
}

/// Recovers the blob ID from a blob tree key, verifying the fan-out directories.
pub fn parse_blob_path(root_path: &str, path: &str) -> Result<BlobId, StoreError> {
    let root = root_path.trim_end_matches('/');
    let key = if root.is_empty() {
        path
    } else {
        path.strip_prefix(root)
            .and_then(|p| p.strip_prefix('/'))
            .ok_or_else(|| StoreError::MalformedBlobPath(path.to_string()))?
    };

    let malformed = || StoreError::MalformedBlobPath(path.to_string());

    let mut parts = key.split('/');
    let (a, b, name) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), Some(name), None) => (a, b, name),
        _ => return Err(malformed()),
    };

    if name.len() != 64 || a != &name[..2] || b != &name[2..4] {
        return Err(malformed());
    }

    let blob_id: BlobId = hex::decode(name)
        .map_err(|_| malformed())?
        .try_into()
        .map_err(|_| malformed())?;

    Ok(blob_id)
}

/// Whether a storage key belongs to a catalog database backup.
pub fn is_database_backup(key: &str) -> bool {
    key.starts_with(DB_BACKUP_PREFIX) || key.starts_with(DB_V2BACKUP_PREFIX)
}

/// Runs a fallible storage operation with exponential backoff, up to
/// `STORAGE_MAX_RETRIES` attempts. Only transient backend failures should be
/// routed through here; everything else surfaces immediately at the caller.
pub async fn with_retries<T, F, Fut>(what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delay = Duration::from_millis(STORAGE_RETRY_BASE_DELAY_MS);

    for attempt in 1..=STORAGE_MAX_RETRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt == STORAGE_MAX_RETRIES => return Err(e),
            Err(e) => {
                log!("[storage] {} failed (attempt {}): {}, retrying", what, attempt, e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }

    unreachable!("retry loop returns on the last attempt");
}

/// Derives the checksums a backend may legitimately report for a byte stream:
/// the plain MD5 of the whole object, or the multipart ETag (MD5 of the
/// concatenated fixed-size part MD5s, suffixed with the part count).
pub struct ChecksumTracker {
    whole: Md5,
    part: Md5,
    part_len: u64,
    part_digests: Vec<[u8; 16]>,
    total: u64,
}

impl Default for ChecksumTracker {
    fn default() -> Self {
        Self {
            whole: Md5::new(),
            part: Md5::new(),
            part_len: 0,
            part_digests: Vec::new(),
            total: 0,
        }
    }
}

impl ChecksumTracker {
    pub fn update(&mut self, mut buf: &[u8]) {
        self.whole.update(buf);
        self.total += buf.len() as u64;

        while !buf.is_empty() {
            let room = (S3_MULTIPART_PART_SIZE - self.part_len) as usize;
            let take = room.min(buf.len());
            self.part.update(&buf[..take]);
            self.part_len += take as u64;
            buf = &buf[take..];

            if self.part_len == S3_MULTIPART_PART_SIZE {
                self.part_digests.push(self.part.finalize_reset().into());
                self.part_len = 0;
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns `(md5_hex, multipart_etag)` for the bytes seen so far.
    pub fn finalize(mut self) -> (String, String) {
        if self.part_len > 0 || self.part_digests.is_empty() {
            self.part_digests.push(self.part.finalize_reset().into());
        }

        let mut etag_hasher = Md5::new();
        for digest in &self.part_digests {
            etag_hasher.update(digest);
        }
        let etag = format!("{}-{}", hex::encode(etag_hasher.finalize()), self.part_digests.len());

        (hex::encode(self.whole.finalize()), etag)
    }
}

/// MD5 of a byte slice as a lowercase hex string, the checksum format of the
/// simple (non-multipart) backends.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}
