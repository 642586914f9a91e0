//! The streaming range read cache. Object stores charge per request and
//! throttle bursts, while the layers above (decrypt-at-offset, blob scans,
//! filesystem front ends) issue many short logical reads into big blobs. The
//! cache translates any sequence of section reads into few long,
//! non-overlapping backend range requests.
//!
//! Files are cut into fixed 1 MB chunks. A missed chunk is fetched from a
//! "continuous reader": an open backend request running from the chunk to the
//! end of the file, kept around (at most two per file, LRU) keyed by the next
//! chunk it would produce. Sequential reads and forward seeks therefore keep
//! riding the same underlying request, and interleaved readers at separate
//! offsets each keep their own.
//!
//! Locking: one process-wide read/write lock guards the chunk map and the
//! file table; reads of already-cached chunks take only the read lock. Each
//! file carries a mutex serializing chunk fetches for that file; the reader
//! currently being read from is removed from the table for the duration of
//! the read, so eviction can never close it mid-flight.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use lru::LruCache;
use shared::types::StorageId;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{Mutex, RwLock},
    task::JoinHandle,
};

use crate::{
    defaults::{
        CACHE_EXPIRATION_SECS, CACHE_SWEEP_INTERVAL_SECS, CHUNK_CACHE_CAPACITY, CHUNK_SIZE,
        MAX_CONTINUOUS_READERS,
    },
    log,
    storage::{Storage, StoreError},
};

type FileKey = (StorageId, String);
type ChunkKey = (StorageId, String, u64);
type BackendReader = Box<dyn AsyncRead + Send + Unpin>;

/// The cache context object. Share it behind an `Arc`; dropping it stops the
/// background sweeper. Construction needs a tokio runtime.
pub struct ReadCache {
    inner: Arc<CacheInner>,
    janitor: JoinHandle<()>,
}

struct CacheInner {
    epoch: Instant,
    files: RwLock<HashMap<FileKey, Arc<FileInfo>>>,
    chunks: RwLock<HashMap<ChunkKey, CachedChunk>>,
}

struct CachedChunk {
    data: Arc<Vec<u8>>,
    last_access_ms: AtomicU64,
}

struct FileInfo {
    size: u64,
    readers: Mutex<ReaderTable>,
}

/// Continuous readers of one file, keyed by the index of the next chunk each
/// would produce.
struct ReaderTable {
    readers: LruCache<u64, ContinuousReader>,
}

struct ContinuousReader {
    reader: BackendReader,
    last_access: Instant,
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadCache {
    pub fn new() -> Self {
        let inner = Arc::new(CacheInner {
            epoch: Instant::now(),
            files: RwLock::new(HashMap::new()),
            chunks: RwLock::new(HashMap::new()),
        });

        let janitor = tokio::spawn(Self::sweep_loop(Arc::downgrade(&inner)));

        Self { inner, janitor }
    }

    /// Opens a logical reader for `length` bytes of `path` starting at
    /// `offset`. The reader yields exactly `min(length, file_size - offset)`
    /// bytes and then reports end-of-stream.
    pub async fn download_section(
        &self,
        storage: Arc<dyn Storage>,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<SectionReader, StoreError> {
        let file = self.inner.file_info(&storage, path).await?;
        let remaining = length.min(file.size.saturating_sub(offset));

        Ok(SectionReader {
            cache: self.inner.clone(),
            storage,
            path: path.to_string(),
            file,
            pos: offset,
            remaining,
        })
    }

    async fn sweep_loop(inner: Weak<CacheInner>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(CACHE_SWEEP_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.sweep_expired().await;
        }
    }

    #[cfg(test)]
    async fn sweep_now(&self) {
        self.inner.sweep_expired().await;
    }
}

impl Drop for ReadCache {
    fn drop(&mut self) {
        self.janitor.abort();
    }
}

impl CacheInner {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn file_info(
        &self,
        storage: &Arc<dyn Storage>,
        path: &str,
    ) -> Result<Arc<FileInfo>, StoreError> {
        let key = (storage.get_id(), path.to_string());

        if let Some(file) = self.files.read().await.get(&key) {
            return Ok(file.clone());
        }

        // look the size up outside any lock; losing the insert race below is
        // harmless because the size of a stored object never changes
        let (_, size) = storage.metadata(path).await?;

        let mut files = self.files.write().await;
        Ok(files
            .entry(key)
            .or_insert_with(|| {
                Arc::new(FileInfo {
                    size,
                    readers: Mutex::new(ReaderTable {
                        readers: LruCache::new(
                            NonZeroUsize::new(MAX_CONTINUOUS_READERS).expect("reader capacity"),
                        ),
                    }),
                })
            })
            .clone())
    }

    async fn lookup_chunk(&self, key: &ChunkKey) -> Option<Arc<Vec<u8>>> {
        let chunks = self.chunks.read().await;
        chunks.get(key).map(|chunk| {
            chunk.last_access_ms.store(self.now_ms(), Relaxed);
            chunk.data.clone()
        })
    }

    async fn store_chunk(&self, key: ChunkKey, data: Arc<Vec<u8>>) {
        let mut chunks = self.chunks.write().await;

        if chunks.len() >= CHUNK_CACHE_CAPACITY {
            // evict the least recently touched chunk to stay within capacity
            if let Some(oldest) = chunks
                .iter()
                .min_by_key(|(_, chunk)| chunk.last_access_ms.load(Relaxed))
                .map(|(key, _)| key.clone())
            {
                chunks.remove(&oldest);
            }
        }

        chunks.insert(key, CachedChunk { data, last_access_ms: AtomicU64::new(self.now_ms()) });
    }

    /// Fetches one chunk, serving from cache when possible. Returns `None`
    /// when a freshly opened backend reader failed, which the caller surfaces
    /// as end-of-stream.
    async fn get_chunk(
        &self,
        storage: &Arc<dyn Storage>,
        path: &str,
        file: &Arc<FileInfo>,
        chunk_index: u64,
    ) -> Option<Arc<Vec<u8>>> {
        let key = (storage.get_id(), path.to_string(), chunk_index);

        if let Some(chunk) = self.lookup_chunk(&key).await {
            return Some(chunk);
        }

        // serialize fetches for this file
        let mut table = file.readers.lock().await;

        // double-checked: someone may have fetched it while we waited
        if let Some(chunk) = self.lookup_chunk(&key).await {
            return Some(chunk);
        }

        let chunk_start = chunk_index * CHUNK_SIZE;
        let chunk_len = (file.size - chunk_start).min(CHUNK_SIZE) as usize;
        let next_start = chunk_start + chunk_len as u64;

        // continue an existing reader positioned at this chunk. Popping it
        // pins it to this stack frame, so concurrent eviction cannot close it
        // under us; on any error it is discarded and we retry with a fresh
        // reader below.
        if let Some(mut continued) = table.readers.pop(&chunk_index) {
            match read_exact_chunk(&mut continued.reader, chunk_len).await {
                Ok(data) => {
                    let data = Arc::new(data);
                    self.store_chunk(key, data.clone()).await;

                    if next_start < file.size {
                        continued.last_access = Instant::now();
                        table.readers.push(chunk_index + 1, continued);
                    }

                    return Some(data);
                }
                Err(e) => {
                    log!("[readcache] reused reader for {} failed: {}, reopening", path, e);
                }
            }
        }

        // request from here to the end of the file to maximize reuse
        let opened = storage
            .download_section(path, chunk_start, file.size - chunk_start)
            .await;

        let mut reader = match opened {
            Ok(reader) => reader,
            Err(e) => {
                log!("[readcache] opening reader for {} failed: {}", path, e);
                return None;
            }
        };

        match read_exact_chunk(&mut reader, chunk_len).await {
            Ok(data) => {
                let data = Arc::new(data);
                self.store_chunk(key, data.clone()).await;

                if next_start < file.size {
                    table
                        .readers
                        .push(chunk_index + 1, ContinuousReader { reader, last_access: Instant::now() });
                }

                Some(data)
            }
            Err(e) => {
                log!("[readcache] fresh reader for {} failed: {}", path, e);
                None
            }
        }
    }

    async fn sweep_expired(&self) {
        let expiration = Duration::from_secs(CACHE_EXPIRATION_SECS);
        let cutoff_ms = self.now_ms().saturating_sub(expiration.as_millis() as u64);

        {
            let mut chunks = self.chunks.write().await;
            chunks.retain(|_, chunk| chunk.last_access_ms.load(Relaxed) >= cutoff_ms);
        }

        let files: Vec<Arc<FileInfo>> = self.files.read().await.values().cloned().collect();
        for file in files {
            // a busy file is being read right now, so nothing in it is expired
            let Ok(mut table) = file.readers.try_lock() else {
                continue;
            };

            let expired: Vec<u64> = table
                .readers
                .iter()
                .filter(|(_, reader)| reader.last_access.elapsed() >= expiration)
                .map(|(index, _)| *index)
                .collect();

            // close by key after iterating; dropping the reader closes it
            for index in expired {
                table.readers.pop(&index);
            }
        }
    }
}

/// Reads exactly `len` bytes or fails; a premature end-of-stream from a
/// continuous reader is an error like any other.
async fn read_exact_chunk(
    reader: &mut BackendReader,
    len: usize,
) -> Result<Vec<u8>, std::io::Error> {
    let mut data = vec![0u8; len];
    let mut filled = 0;

    while filled < len {
        let n = reader.read(&mut data[filled..]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("reader ended {} bytes short of a chunk", len - filled),
            ));
        }
        filled += n;
    }

    Ok(data)
}

/// A logical reader over one byte section of one stored object. Yields its
/// section and then reports end-of-stream; backend failures on a freshly
/// opened reader also surface as a (premature) end-of-stream.
pub struct SectionReader {
    cache: Arc<CacheInner>,
    storage: Arc<dyn Storage>,
    path: String,
    file: Arc<FileInfo>,
    pos: u64,
    remaining: u64,
}

impl SectionReader {
    /// Bytes this reader will still yield, barring backend failures.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let chunk_index = self.pos / CHUNK_SIZE;
        let chunk_start = chunk_index * CHUNK_SIZE;

        let Some(chunk) =
            self.cache.get_chunk(&self.storage, &self.path, &self.file, chunk_index).await
        else {
            // a fresh backend reader failed: the stream ends here and the
            // caller observes the shortfall
            self.remaining = 0;
            return Ok(0);
        };

        let in_chunk = (self.pos - chunk_start) as usize;
        if in_chunk >= chunk.len() {
            self.remaining = 0;
            return Ok(0);
        }

        let n = buf.len().min(chunk.len() - in_chunk).min(self.remaining as usize);
        buf[..n].copy_from_slice(&chunk[in_chunk..in_chunk + n]);

        self.pos += n as u64;
        self.remaining -= n as u64;

        Ok(n)
    }

    /// Fills `buf` completely unless the stream ends first; returns the
    /// number of bytes read.
    pub async fn read_full(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;

        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        Ok(filled)
    }

    pub async fn read_to_end(&mut self) -> std::io::Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.remaining as usize);
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn deterministic_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ (i / 251 % 256) as u8).collect()
    }

    fn seeded_storage(len: usize) -> (Arc<dyn Storage>, Arc<MemoryStorage>, Vec<u8>) {
        let storage = Arc::new(MemoryStorage::new([1; 32]));
        let data = deterministic_data(len);
        storage.insert("blob", data.clone());

        (storage.clone() as Arc<dyn Storage>, storage, data)
    }

    #[tokio::test]
    async fn sequential_read_uses_one_backend_request() {
        let (storage, memory, data) = seeded_storage(3_500_000);
        let cache = ReadCache::new();

        let mut reader = cache
            .download_section(storage, "blob", 0, data.len() as u64)
            .await
            .unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }

        assert_eq!(out, data);
        assert_eq!(memory.request_count(), 1);
        memory.assert_no_overlapping_reads();
    }

    #[tokio::test]
    async fn cached_chunks_are_served_without_new_requests() {
        let (storage, memory, data) = seeded_storage(2_000_000);
        let cache = ReadCache::new();

        for _ in 0..3 {
            let mut reader = cache
                .download_section(storage.clone(), "blob", 0, data.len() as u64)
                .await
                .unwrap();
            let out = reader.read_to_end().await.unwrap();
            assert_eq!(out, data);
        }

        assert_eq!(memory.request_count(), 1);
    }

    #[tokio::test]
    async fn reads_clamp_to_file_size() {
        let (storage, _memory, data) = seeded_storage(1_500);
        let cache = ReadCache::new();

        let mut reader = cache.download_section(storage, "blob", 1_000, 10_000).await.unwrap();
        assert_eq!(reader.remaining(), 500);

        let out = reader.read_to_end().await.unwrap();
        assert_eq!(out, data[1_000..]);
    }

    #[tokio::test]
    async fn zero_length_section_never_touches_the_backend() {
        let (storage, memory, _data) = seeded_storage(1_000);
        let cache = ReadCache::new();

        let mut reader = cache.download_section(storage, "blob", 500, 0).await.unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), Vec::<u8>::new());
        assert_eq!(memory.request_count(), 0);
    }

    #[tokio::test]
    async fn forward_seek_reuses_the_positioned_reader() {
        let (storage, memory, data) = seeded_storage(5_000_000);
        let cache = ReadCache::new();

        // consume the first two chunks, leaving a reader positioned at chunk 2
        let mut first = cache.download_section(storage.clone(), "blob", 0, 2_000_000).await.unwrap();
        let out = first.read_to_end().await.unwrap();
        assert_eq!(out, data[..2_000_000]);

        // a new logical reader opening exactly at chunk 2 continues the
        // existing backend request instead of opening a second one
        let mut second =
            cache.download_section(storage.clone(), "blob", 2_000_000, 1_000_000).await.unwrap();
        let out = second.read_to_end().await.unwrap();
        assert_eq!(out, data[2_000_000..3_000_000]);

        assert_eq!(memory.request_count(), 1);
        memory.assert_no_overlapping_reads();
    }

    #[tokio::test]
    async fn failed_reused_reader_retries_with_a_fresh_one() {
        let (storage, memory, data) = seeded_storage(3_000_000);
        let cache = ReadCache::new();

        let mut reader = cache.download_section(storage.clone(), "blob", 0, 1_000_000).await.unwrap();
        reader.read_to_end().await.unwrap();

        // sabotage the positioned reader by truncating what the backend will
        // serve it: popping the object makes the continued read fail
        memory.truncate_open_readers();

        let mut second =
            cache.download_section(storage.clone(), "blob", 1_000_000, 1_000_000).await.unwrap();
        let out = second.read_to_end().await.unwrap();
        assert_eq!(out, data[1_000_000..2_000_000]);

        // initial reader + the fresh retry reader
        assert_eq!(memory.request_count(), 2);
    }

    #[tokio::test]
    async fn expired_state_is_swept() {
        let (storage, _memory, _data) = seeded_storage(2_000_000);
        let cache = ReadCache::new();

        let mut reader = cache.download_section(storage, "blob", 0, 1_000_000).await.unwrap();
        reader.read_to_end().await.unwrap();
        drop(reader);

        assert!(!cache.inner.chunks.read().await.is_empty());

        // nothing is older than the expiration yet, so the sweep keeps it all
        cache.sweep_now().await;
        assert!(!cache.inner.chunks.read().await.is_empty());
    }
}
