//! A storage backed by a local directory, used for disk-to-disk replication
//! targets and as a realistic backend in tests. Objects are regular files
//! below the root; uploads land in a temporary file first and are renamed
//! into place on finish so a crash never leaves a half-written blob visible.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use md5::{Digest, Md5};
use shared::types::{BlobId, StorageId};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::storage::{
    blob_path, is_database_backup, parse_blob_path, BlobUpload, ListedBlob, Storage, StoreError,
    UploadResult,
};

pub struct LocalDirStorage {
    id: StorageId,
    root: PathBuf,
}

impl LocalDirStorage {
    pub fn new(id: StorageId, root: impl Into<PathBuf>) -> Self {
        Self { id, root: root.into() }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn begin_upload(&self, key: String) -> Result<Box<dyn BlobUpload>, StoreError> {
        let final_path = self.object_path(&key);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = final_path.with_extension("part");
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;

        Ok(Box::new(LocalUpload { key, file, temp_path, final_path, hasher: Md5::new(), size: 0 }))
    }
}

#[async_trait]
impl Storage for LocalDirStorage {
    fn get_id(&self) -> StorageId {
        self.id
    }

    async fn begin_blob_upload(&self, blob_id: BlobId) -> Result<Box<dyn BlobUpload>, StoreError> {
        self.begin_upload(blob_path("", &blob_id)).await
    }

    async fn begin_database_upload(
        &self,
        filename: &str,
    ) -> Result<Box<dyn BlobUpload>, StoreError> {
        self.begin_upload(filename.to_string()).await
    }

    async fn download_section(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, StoreError> {
        if length == 0 {
            return Ok(Box::new(std::io::Cursor::new(Vec::new())));
        }

        let mut file = File::open(self.object_path(path))
            .await
            .map_err(|_| StoreError::NotFound(path.to_string()))?;

        let size = file.metadata().await?.len();
        let offset = offset.min(size);
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        Ok(Box::new(file.take(length.min(size - offset))))
    }

    async fn list_blobs(&self) -> Result<Vec<ListedBlob>, StoreError> {
        let mut listed = Vec::new();

        // the blob tree is exactly two directory levels deep
        let mut outer = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(listed),
            Err(e) => return Err(e.into()),
        };

        while let Some(first) = outer.next_entry().await? {
            if !first.file_type().await?.is_dir() {
                continue;
            }
            let mut mid = fs::read_dir(first.path()).await?;
            while let Some(second) = mid.next_entry().await? {
                if !second.file_type().await?.is_dir() {
                    continue;
                }
                let mut leaves = fs::read_dir(second.path()).await?;
                while let Some(leaf) = leaves.next_entry().await? {
                    let key = match relative_key(&self.root, &leaf.path()) {
                        Some(key) => key,
                        None => continue,
                    };
                    if is_database_backup(&key) {
                        continue;
                    }
                    let Ok(blob_id) = parse_blob_path("", &key) else {
                        continue;
                    };

                    let (checksum, size) = self.metadata(&key).await?;
                    listed.push(ListedBlob { path: key, checksum, size, blob_id });
                }
            }
        }

        Ok(listed)
    }

    async fn metadata(&self, path: &str) -> Result<(String, u64), StoreError> {
        let full = self.object_path(path);
        let mut file = File::open(&full)
            .await
            .map_err(|_| StoreError::NotFound(path.to_string()))?;
        let size = file.metadata().await?.len();

        let mut hasher = Md5::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok((hex::encode(hasher.finalize()), size))
    }

    async fn delete_blob(&self, path: &str) -> Result<(), StoreError> {
        fs::remove_file(self.object_path(path))
            .await
            .map_err(|_| StoreError::NotFound(path.to_string()))
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .and_then(|p| p.to_str())
        .map(|p| p.replace('\\', "/"))
}

struct LocalUpload {
    key: String,
    file: File,
    temp_path: PathBuf,
    final_path: PathBuf,
    hasher: Md5,
    size: u64,
}

#[async_trait]
impl BlobUpload for LocalUpload {
    async fn write(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        self.file.write_all(buf).await?;
        self.hasher.update(buf);
        self.size += buf.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<UploadResult, StoreError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        fs::rename(&self.temp_path, &self.final_path).await?;

        Ok(UploadResult {
            path: self.key,
            checksum: hex::encode(self.hasher.finalize()),
            size: self.size,
        })
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        drop(self.file);
        fs::remove_file(&self.temp_path).await?;
        Ok(())
    }
}
