//! Seekable AES-128-CTR streams. Every blob entry (and the trailing padding) is
//! encrypted with its own key starting at the entry's byte offset within the
//! blob, so any byte range of a blob can be decrypted independently: the CTR
//! counter at position `n` is `n / 16` and the first `n % 16` keystream bytes
//! of that block are discarded.
//!
//! There is no authentication at this layer; integrity comes from the SHA-256
//! of the decrypted, decompressed entry checked by the blob reader.

use std::io::{Read, Write};

use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use shared::{constants::AES_BLOCK_SIZE, types::EntryKey};

pub type Aes128Ctr = Ctr128BE<Aes128>;

/// Returns the CTR IV for a logical byte position, along with the number of
/// keystream bytes of that block to discard before the first useful XOR.
pub fn iv_for(seek_offset: u64) -> ([u8; AES_BLOCK_SIZE], usize) {
    let mut iv = [0u8; AES_BLOCK_SIZE];
    iv[8..].copy_from_slice(&(seek_offset / AES_BLOCK_SIZE as u64).to_be_bytes());

    (iv, (seek_offset % AES_BLOCK_SIZE as u64) as usize)
}

/// Builds a cipher whose keystream is positioned at `seek_offset`, matching a
/// one-shot stream that had been XORed from position 0 continuously.
pub fn cipher_at(seek_offset: u64, key: &EntryKey) -> Aes128Ctr {
    let (iv, skip) = iv_for(seek_offset);
    let mut cipher = Aes128Ctr::new(key.into(), (&iv).into());

    let mut discard = [0u8; AES_BLOCK_SIZE];
    cipher.apply_keystream(&mut discard[..skip]);

    cipher
}

/// A writer that XORs bytes with the CTR keystream before passing them on.
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: Aes128Ctr,
}

impl<W: Write> EncryptWriter<W> {
    pub fn new(inner: W, seek_offset: u64, key: &EntryKey) -> Self {
        Self { inner, cipher: cipher_at(seek_offset, key) }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut encrypted = buf.to_vec();
        self.cipher.apply_keystream(&mut encrypted);

        // the keystream has already advanced over the whole buffer, so the
        // ciphertext must be written out completely before returning
        self.inner.write_all(&encrypted)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A reader that XORs bytes coming from the source with the CTR keystream. The
/// source's first byte must correspond to logical position `seek_offset`.
/// Encryption and decryption are the same XOR, so this undoes `EncryptWriter`.
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: Aes128Ctr,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(inner: R, seek_offset: u64, key: &EntryKey) -> Self {
        Self { inner, cipher: cipher_at(seek_offset, key) }
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);

        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EntryKey {
        let mut key = [0u8; 16];
        key.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8 * 7);
        key
    }

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn iv_matches_counter_math() {
        let (iv, skip) = iv_for(0);
        assert_eq!(iv, [0; 16]);
        assert_eq!(skip, 0);

        let (iv, skip) = iv_for(16);
        assert_eq!(u128::from_be_bytes(iv), 1);
        assert_eq!(skip, 0);

        let (iv, skip) = iv_for(16 * 5 + 13);
        assert_eq!(u128::from_be_bytes(iv), 5);
        assert_eq!(skip, 13);
    }

    #[test]
    fn round_trip_at_offsets() {
        let key = test_key();
        let plaintext = test_data(1000);

        for offset in [0u64, 1, 15, 16, 17, 160, 1_000_003] {
            let mut encrypted = Vec::new();
            let mut writer = EncryptWriter::new(&mut encrypted, offset, &key);
            writer.write_all(&plaintext).unwrap();
            drop(writer);

            assert_ne!(encrypted, plaintext);

            let mut reader = DecryptReader::new(&encrypted[..], offset, &key);
            let mut decrypted = Vec::new();
            reader.read_to_end(&mut decrypted).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn suffix_decrypts_independently() {
        // decrypting cipher[o..] at seek_offset + o must equal plaintext[o..]
        let key = test_key();
        let plaintext = test_data(200);
        let seek_offset = 37u64;

        let mut encrypted = Vec::new();
        EncryptWriter::new(&mut encrypted, seek_offset, &key)
            .write_all(&plaintext)
            .unwrap();

        for o in 0..=plaintext.len() {
            let mut reader = DecryptReader::new(&encrypted[o..], seek_offset + o as u64, &key);
            let mut suffix = Vec::new();
            reader.read_to_end(&mut suffix).unwrap();
            assert_eq!(suffix, plaintext[o..], "suffix at {o}");
        }
    }

    #[test]
    fn split_writes_match_single_write() {
        let key = test_key();
        let plaintext = test_data(100);

        let mut whole = Vec::new();
        EncryptWriter::new(&mut whole, 5, &key).write_all(&plaintext).unwrap();

        let mut split = Vec::new();
        let mut writer = EncryptWriter::new(&mut split, 5, &key);
        for chunk in plaintext.chunks(7) {
            writer.write_all(chunk).unwrap();
        }
        drop(writer);

        assert_eq!(whole, split);
    }
}
