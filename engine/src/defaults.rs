//! Contains the default values for the configuration and various constants.

/// The size of a single cached chunk in the range read cache.
pub const CHUNK_SIZE: u64 = 1_000_000;

/// Maximum number of chunks held by the range read cache before the oldest are evicted.
pub const CHUNK_CACHE_CAPACITY: usize = 500;

/// Maximum number of open continuous readers kept per file in the range read cache.
pub const MAX_CONTINUOUS_READERS: usize = 2;

/// Seconds since last access after which cached chunks and readers are expired.
pub const CACHE_EXPIRATION_SECS: u64 = 5 * 60;

/// Interval of the background sweep that evicts expired chunks and readers.
pub const CACHE_SWEEP_INTERVAL_SECS: u64 = 60;

/// Minimum number of trailing padding bytes appended to every blob.
pub const PADDING_MIN_BYTES: u64 = 128;

/// Maximum number of trailing padding bytes appended to every blob, before the
/// percentage-based part.
pub const PADDING_MAX_BYTES: u64 = 16 * 1024;

/// Minimum padding as a percentage of the packed (pre-padding) blob size.
pub const PADDING_MIN_PERCENT: f64 = 1.0;

/// Maximum padding as a percentage of the packed (pre-padding) blob size.
pub const PADDING_MAX_PERCENT: f64 = 3.0;

/// Contents smaller than this are stored without compression.
pub const MIN_COMPRESS_SIZE: u64 = 1024;

/// Total plaintext size after which the packer closes the current blob and starts a new one.
/// Also the threshold above which a blob is considered "large" and never repacked.
pub const MIN_BLOB_SIZE: u64 = 16 * 1024 * 1024; // 16 MiB

/// Maximum number of entries that can be packed into a single blob.
pub const MAX_BLOB_ENTRIES: usize = 5_000;

/// File extensions that are already compressed and not worth running through zstd.
pub const NO_COMPRESSION_EXTS: &[&str] = &[
    "7z", "br", "bz2", "flac", "gif", "gz", "heic", "lz4", "mkv", "mov", "mp3", "mp4", "ogg",
    "opus", "png", "rar", "webm", "webp", "xz", "zip", "zst",
];

/// Number of workers used for cross-storage replication.
pub const REPLICATION_WORKERS: usize = 8;

/// Number of workers used for blob verification.
pub const VERIFY_WORKERS: usize = 16;

/// Maximum number of attempts for a transient storage operation.
pub const STORAGE_MAX_RETRIES: u32 = 10;

/// Base delay for the exponential backoff between storage retries.
pub const STORAGE_RETRY_BASE_DELAY_MS: u64 = 500;

/// Fixed multipart part size for S3 uploads. Glacier Deep Archive transitions
/// recalculate multipart ETags with 16 MiB parts, so every upload uses the same
/// size to keep the ETag stable across lifecycle transitions.
pub const S3_MULTIPART_PART_SIZE: u64 = 1 << 24;

/// Maximum accepted clock skew when validating that a revision start is not in the future.
pub const FUTURE_SKEW_SECS: i64 = 60;

/// Maximum byte length of a catalog file path.
pub const MAX_PATH_LENGTH: usize = 4096;

/// Tunables consumed by compression selection and the blob packer. The constants
/// above are the defaults; tests and embedders override individual fields.
#[derive(Clone, Debug)]
pub struct Settings {
    pub padding_min_bytes: u64,
    pub padding_max_bytes: u64,
    pub padding_min_percent: f64,
    pub padding_max_percent: f64,
    pub min_compress_size: u64,
    pub min_blob_size: u64,
    pub max_blob_entries: usize,
    pub no_compression_exts: Vec<String>,
    pub disable_lepton: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            padding_min_bytes: PADDING_MIN_BYTES,
            padding_max_bytes: PADDING_MAX_BYTES,
            padding_min_percent: PADDING_MIN_PERCENT,
            padding_max_percent: PADDING_MAX_PERCENT,
            min_compress_size: MIN_COMPRESS_SIZE,
            min_blob_size: MIN_BLOB_SIZE,
            max_blob_entries: MAX_BLOB_ENTRIES,
            no_compression_exts: NO_COMPRESSION_EXTS.iter().map(|e| (*e).to_string()).collect(),
            disable_lepton: false,
        }
    }
}

impl Settings {
    /// Bounds for the padding appended after `packed_size` bytes of entries.
    /// The operation order matches the SQL form of the paranoia check, so
    /// both sides truncate identically.
    pub fn padding_bounds(&self, packed_size: u64) -> (u64, u64) {
        let min = (self.padding_min_bytes as f64 + self.padding_min_percent * packed_size as f64 / 100.0) as u64;
        let max = (self.padding_max_bytes as f64 + self.padding_max_percent * packed_size as f64 / 100.0) as u64;

        (min, max)
    }
}
