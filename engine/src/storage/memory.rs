//! An in-memory storage used by tests. Serves range requests through lazy
//! readers that record how many bytes were actually consumed, so tests can
//! assert that backend reads never overlap and that read-ahead stays bounded.

use std::{
    collections::BTreeMap,
    io::Cursor,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::Relaxed},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use shared::types::{BlobId, StorageId};
use tokio::io::{AsyncRead, ReadBuf};

use crate::storage::{
    blob_path, is_database_backup, join_root, md5_hex, parse_blob_path, BlobUpload, ListedBlob,
    Storage, StoreError, UploadResult,
};

#[derive(Clone)]
pub struct MemoryStorage {
    id: StorageId,
    root_path: String,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, Vec<u8>>,
    requests: Vec<RequestRecord>,
}

struct RequestRecord {
    path: String,
    offset: u64,
    length: u64,
    consumed: Arc<AtomicU64>,
    valid: Arc<AtomicBool>,
}

/// One `download_section` call served by the backend, with the number of
/// bytes the caller actually pulled off the returned reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeRequest {
    pub path: String,
    pub offset: u64,
    pub length: u64,
    pub consumed: u64,
}

impl MemoryStorage {
    pub fn new(id: StorageId) -> Self {
        Self { id, root_path: String::new(), inner: Arc::new(Mutex::new(Inner::default())) }
    }

    /// Seeds an object directly, bypassing the upload path.
    pub fn insert(&self, path: impl Into<String>, data: Vec<u8>) {
        self.inner.lock().unwrap().objects.insert(path.into(), data);
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().objects.get(path).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    /// Every range request served so far, in order.
    pub fn requests(&self) -> Vec<RangeRequest> {
        let inner = self.inner.lock().unwrap();
        inner
            .requests
            .iter()
            .map(|record| RangeRequest {
                path: record.path.clone(),
                offset: record.offset,
                length: record.length,
                consumed: record.consumed.load(Relaxed),
            })
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.inner.lock().unwrap().requests.len()
    }

    /// Total bytes pulled off all readers this storage ever handed out.
    pub fn total_consumed(&self) -> u64 {
        self.requests().iter().map(|request| request.consumed).sum()
    }

    /// Makes every reader handed out so far fail its next read, simulating a
    /// backend dropping long-lived connections.
    pub fn truncate_open_readers(&self) {
        let inner = self.inner.lock().unwrap();
        for record in &inner.requests {
            record.valid.store(false, Relaxed);
        }
    }

    /// Asserts that no two readers consumed the same byte of one path.
    pub fn assert_no_overlapping_reads(&self) {
        let requests = self.requests();
        for (i, a) in requests.iter().enumerate() {
            for b in &requests[i + 1..] {
                if a.path != b.path {
                    continue;
                }
                let a_end = a.offset + a.consumed;
                let b_end = b.offset + b.consumed;
                assert!(
                    a_end <= b.offset || b_end <= a.offset,
                    "overlapping backend reads: {a:?} and {b:?}"
                );
            }
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn get_id(&self) -> StorageId {
        self.id
    }

    async fn begin_blob_upload(&self, blob_id: BlobId) -> Result<Box<dyn BlobUpload>, StoreError> {
        Ok(Box::new(MemoryUpload {
            path: blob_path(&self.root_path, &blob_id),
            buffer: Vec::new(),
            inner: self.inner.clone(),
        }))
    }

    async fn begin_database_upload(
        &self,
        filename: &str,
    ) -> Result<Box<dyn BlobUpload>, StoreError> {
        Ok(Box::new(MemoryUpload {
            path: join_root(&self.root_path, filename),
            buffer: Vec::new(),
            inner: self.inner.clone(),
        }))
    }

    async fn download_section(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, StoreError> {
        if length == 0 {
            return Ok(Box::new(Cursor::new(Vec::new())));
        }

        let mut inner = self.inner.lock().unwrap();
        let data = inner.objects.get(path).ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        let start = (offset as usize).min(data.len());
        let end = ((offset + length) as usize).min(data.len());
        let section = data[start..end].to_vec();

        let consumed = Arc::new(AtomicU64::new(0));
        let valid = Arc::new(AtomicBool::new(true));
        inner.requests.push(RequestRecord {
            path: path.to_string(),
            offset,
            length,
            consumed: consumed.clone(),
            valid: valid.clone(),
        });

        Ok(Box::new(TrackedReader { data: section, pos: 0, consumed, valid }))
    }

    async fn list_blobs(&self) -> Result<Vec<ListedBlob>, StoreError> {
        let inner = self.inner.lock().unwrap();

        let mut listed = Vec::new();
        for (path, data) in &inner.objects {
            if is_database_backup(path) {
                continue;
            }
            let Ok(blob_id) = parse_blob_path(&self.root_path, path) else {
                continue;
            };
            listed.push(ListedBlob {
                path: path.clone(),
                checksum: md5_hex(data),
                size: data.len() as u64,
                blob_id,
            });
        }

        Ok(listed)
    }

    async fn metadata(&self, path: &str) -> Result<(String, u64), StoreError> {
        let inner = self.inner.lock().unwrap();
        let data = inner.objects.get(path).ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        Ok((md5_hex(data), data.len() as u64))
    }

    async fn delete_blob(&self, path: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }
}

/// A reader over one served section that counts consumed bytes and can be
/// invalidated to simulate a dropped connection.
struct TrackedReader {
    data: Vec<u8>,
    pos: usize,
    consumed: Arc<AtomicU64>,
    valid: Arc<AtomicBool>,
}

impl AsyncRead for TrackedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.valid.load(Relaxed) {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "backend dropped the connection",
            )));
        }

        let remaining = self.data.len() - self.pos;
        let n = remaining.min(buf.remaining());
        if n > 0 {
            let pos = self.pos;
            buf.put_slice(&self.data[pos..pos + n]);
            self.pos += n;
            self.consumed.fetch_add(n as u64, Relaxed);
        }

        Poll::Ready(Ok(()))
    }
}

struct MemoryUpload {
    path: String,
    buffer: Vec<u8>,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl BlobUpload for MemoryUpload {
    async fn write(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        self.buffer.extend_from_slice(buf);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<UploadResult, StoreError> {
        let result = UploadResult {
            path: self.path.clone(),
            checksum: md5_hex(&self.buffer),
            size: self.buffer.len() as u64,
        };

        self.inner.lock().unwrap().objects.insert(self.path, self.buffer);
        Ok(result)
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
