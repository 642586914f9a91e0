//! An S3-compatible storage backend. All uploads go through multipart with a
//! fixed 16 MiB part size so the ETag survives Glacier lifecycle transitions,
//! and every completed upload is checked to not be publicly readable.

use async_trait::async_trait;
use futures::StreamExt;
use s3::{creds::Credentials, Bucket, Region};
use serde::{Deserialize, Serialize};
use shared::types::{BlobId, StorageId};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::{
    defaults::S3_MULTIPART_PART_SIZE,
    log,
    storage::{
        blob_path, is_database_backup, join_root, parse_blob_path, with_retries, BlobUpload,
        ListedBlob, Storage, StoreError, UploadResult,
    },
};

/// How many bytes one backend GET covers when pumping a long section.
const DOWNLOAD_STEP: u64 = 8 * 1024 * 1024;

const CONTENT_TYPE: &str = "application/octet-stream";

/// The kind-specific configuration stored in the catalog's `identifier` column.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    pub bucket_name: String,
    pub access_key: String,
    pub secret_key: String,
}

pub struct S3Storage {
    id: StorageId,
    root_path: String,
    bucket: Bucket,
    public_url: String,
}

impl S3Storage {
    pub fn new(id: StorageId, config: S3Config, root_path: impl Into<String>) -> Result<Self, StoreError> {
        let bucket = Bucket::new(
            &config.bucket_name,
            Region::Custom { region: config.region.clone(), endpoint: config.endpoint.clone() },
            Credentials::new(Some(&config.access_key), Some(&config.secret_key), None, None, None)
                .map_err(|e| StoreError::NotFound(e.to_string()))?,
        )?
        .with_path_style();

        let public_url = bucket.url();

        Ok(Self { id, root_path: root_path.into(), bucket, public_url })
    }

    /// Builds a storage from the opaque catalog identifier (JSON `S3Config`).
    pub fn from_identifier(
        id: StorageId,
        identifier: &str,
        root_path: &str,
    ) -> Result<Self, StoreError> {
        let config: S3Config = serde_json::from_str(identifier)
            .map_err(|e| StoreError::MalformedBlobPath(e.to_string()))?;
        Self::new(id, config, root_path)
    }

    async fn begin_upload(&self, path: String) -> Result<Box<dyn BlobUpload>, StoreError> {
        Ok(Box::new(S3Upload {
            bucket: self.bucket.clone(),
            public_url: self.public_url.clone(),
            path,
            buffer: Vec::new(),
            upload_id: None,
            parts: Vec::new(),
            size: 0,
        }))
    }
}

#[async_trait]
impl Storage for S3Storage {
    fn get_id(&self) -> StorageId {
        self.id
    }

    async fn begin_blob_upload(&self, blob_id: BlobId) -> Result<Box<dyn BlobUpload>, StoreError> {
        self.begin_upload(blob_path(&self.root_path, &blob_id)).await
    }

    async fn begin_database_upload(
        &self,
        filename: &str,
    ) -> Result<Box<dyn BlobUpload>, StoreError> {
        self.begin_upload(join_root(&self.root_path, filename)).await
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

        let bucket = self.bucket.clone();
        let path = path.to_string();
        let (reader, mut writer) = tokio::io::duplex(64 * 1024);

        // pump the section through a bounded pipe in backend-sized steps, so a
        // multi-gigabyte continuous reader never materializes in memory
        tokio::spawn(async move {
            let mut position = offset;
            let end = offset + length;

            while position < end {
                let step_end = (position + DOWNLOAD_STEP).min(end);
                let response = with_retries("download_section", || async {
                    Ok(bucket.get_object_range(&path, position, Some(step_end - 1)).await?)
                })
                .await;

                let data = match response {
                    Ok(response) => response.bytes().to_vec(),
                    Err(e) => {
                        log!("[s3] range read of {} failed: {}", path, e);
                        return;
                    }
                };

                // a short (or empty) range response means we ran off the end
                // of the object; the pipe closing surfaces it as end-of-stream
                let done = (data.len() as u64) < step_end - position;
                if writer.write_all(&data).await.is_err() {
                    return;
                }
                if done {
                    return;
                }

                position = step_end;
            }
        });

        Ok(Box::new(reader))
    }

    async fn list_blobs(&self) -> Result<Vec<ListedBlob>, StoreError> {
        // fan the listing out by the first fan-out directory (256 prefixes)
        let listings = futures::stream::iter(0u32..256)
            .map(|i| {
                let bucket = self.bucket.clone();
                let prefix = join_root(&self.root_path, &format!("{i:02x}/"));
                async move { bucket.list(prefix, None).await }
            })
            .buffer_unordered(256)
            .collect::<Vec<_>>()
            .await;

        let mut blobs = Vec::new();
        for listing in listings {
            for page in listing? {
                for object in page.contents {
                    if is_database_backup(&object.key) {
                        continue;
                    }
                    let blob_id = match parse_blob_path(&self.root_path, &object.key) {
                        Ok(blob_id) => blob_id,
                        Err(_) => {
                            log!("[s3] ignoring stray object {}", object.key);
                            continue;
                        }
                    };
                    blobs.push(ListedBlob {
                        path: object.key,
                        checksum: trim_etag(object.e_tag.as_deref().unwrap_or_default()),
                        size: object.size,
                        blob_id,
                    });
                }
            }
        }

        Ok(blobs)
    }

    async fn metadata(&self, path: &str) -> Result<(String, u64), StoreError> {
        let (head, code) = with_retries("metadata", || async {
            Ok(self.bucket.head_object(path).await?)
        })
        .await?;

        if code == 404 {
            return Err(StoreError::NotFound(path.to_string()));
        }

        let checksum = trim_etag(head.e_tag.as_deref().unwrap_or_default());
        let size = head.content_length.unwrap_or_default().max(0) as u64;

        Ok((checksum, size))
    }

    async fn delete_blob(&self, path: &str) -> Result<(), StoreError> {
        with_retries("delete_blob", || async {
            self.bucket.delete_object(path).await?;
            Ok(())
        })
        .await
    }
}

fn trim_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

struct S3Upload {
    bucket: Bucket,
    public_url: String,
    path: String,
    buffer: Vec<u8>,
    upload_id: Option<String>,
    parts: Vec<s3::serde_types::Part>,
    size: u64,
}

impl S3Upload {
    async fn flush_part(&mut self) -> Result<(), StoreError> {
        let chunk: Vec<u8> = self.buffer.drain(..S3_MULTIPART_PART_SIZE as usize).collect();

        let upload_id = match &self.upload_id {
            Some(upload_id) => upload_id.clone(),
            None => {
                let initiated = with_retries("initiate_multipart_upload", || async {
                    Ok(self.bucket.initiate_multipart_upload(&self.path, CONTENT_TYPE).await?)
                })
                .await?;
                self.upload_id = Some(initiated.upload_id.clone());
                initiated.upload_id
            }
        };

        let part_number = self.parts.len() as u32 + 1;
        let part = with_retries("put_multipart_chunk", || async {
            Ok(self
                .bucket
                .put_multipart_chunk(chunk.clone(), &self.path, part_number, &upload_id, CONTENT_TYPE)
                .await?)
        })
        .await?;

        self.parts.push(part);
        Ok(())
    }

    /// The object must never be readable without credentials: an authenticated
    /// HEAD has to succeed while an anonymous GET has to be rejected.
    async fn check_not_public(&self) -> Result<(), StoreError> {
        let (_, code) = self.bucket.head_object(&self.path).await?;
        if code != 200 {
            return Err(StoreError::NotFound(self.path.clone()));
        }

        let url = format!("{}/{}", self.public_url.trim_end_matches('/'), self.path);
        let response = reqwest::get(&url).await?;
        if response.status().is_success() {
            return Err(StoreError::PubliclyAccessible(self.path.clone()));
        }

        Ok(())
    }
}

#[async_trait]
impl BlobUpload for S3Upload {
    async fn write(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        self.buffer.extend_from_slice(buf);
        self.size += buf.len() as u64;

        while self.buffer.len() as u64 >= S3_MULTIPART_PART_SIZE {
            self.flush_part().await?;
        }

        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<UploadResult, StoreError> {
        if self.upload_id.is_none() {
            // small object: a single plain PUT keeps the ETag a simple MD5
            let buffer = std::mem::take(&mut self.buffer);
            with_retries("put_object", || async {
                self.bucket.put_object(&self.path, &buffer).await?;
                Ok(())
            })
            .await?;
        } else {
            if !self.buffer.is_empty() {
                let chunk: Vec<u8> = std::mem::take(&mut self.buffer);
                let upload_id = self.upload_id.clone().expect("upload id was just checked");
                let part_number = self.parts.len() as u32 + 1;
                let part = with_retries("put_multipart_chunk", || async {
                    Ok(self
                        .bucket
                        .put_multipart_chunk(
                            chunk.clone(),
                            &self.path,
                            part_number,
                            &upload_id,
                            CONTENT_TYPE,
                        )
                        .await?)
                })
                .await?;
                self.parts.push(part);
            }

            let upload_id = self.upload_id.clone().expect("upload id was just checked");
            with_retries("complete_multipart_upload", || async {
                self.bucket
                    .complete_multipart_upload(&self.path, &upload_id, self.parts.clone())
                    .await?;
                Ok(())
            })
            .await?;
        }

        self.check_not_public().await?;

        let (head, _) = self.bucket.head_object(&self.path).await?;
        let checksum = trim_etag(head.e_tag.as_deref().unwrap_or_default());

        Ok(UploadResult { path: self.path.clone(), checksum, size: self.size })
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        if let Some(upload_id) = &self.upload_id {
            self.bucket.abort_upload(&self.path, upload_id).await?;
        }
        Ok(())
    }
}
