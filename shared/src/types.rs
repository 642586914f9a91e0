//! Defines types used across the engine.

/// The type for the SHA-256 hash of a piece of content, after decompression.
/// This is the content-addressing key for the whole system.
pub type ContentHash = [u8; 32];

/// The type for the SHA-256 hash of an entire encrypted blob, as it would be
/// read back from storage.
pub type BlobHash = [u8; 32];

/// The type for a blob ID, 32 random bytes.
pub type BlobId = [u8; 32];

/// The type for a storage ID, 32 random bytes.
pub type StorageId = [u8; 32];

/// The type for a per-entry AES-128 encryption key.
pub type EntryKey = [u8; 16];

/// The type for the key that encrypts the trailing zero padding of a blob.
pub type PaddingKey = [u8; 16];

/// The length of `ContentHash`, `BlobHash`, `BlobId` and `StorageId`.
pub const HASH_SIZE: usize = 32;

/// The length of `EntryKey` and `PaddingKey`.
pub const KEY_SIZE: usize = 16;
