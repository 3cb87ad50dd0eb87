//! Cipher collaborator and hash helpers.
//!
//! The engine never implements ciphers itself. The host supplies a
//! [`FileCipher`]; the engine only computes the per-part ivs and hashes.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Cipher failure reported by the host implementation.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CipherError(pub String);

/// Block size of the chained cipher; encrypted parts are padded to it.
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Stream and chained block ciphers used for encrypted parts.
pub trait FileCipher: Send + Sync + 'static {
    /// Applies a counter-mode keystream in place (encrypt and decrypt alike).
    fn ctr_apply(&self, key: &[u8], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CipherError>;

    /// Encrypts whole blocks in place, updating `iv` to chain the next call.
    fn encrypt_chained(&self, key: &[u8], iv: &mut Vec<u8>, data: &mut [u8])
        -> Result<(), CipherError>;

    /// Decrypts whole blocks in place, updating `iv` to chain the next call.
    fn decrypt_chained(&self, key: &[u8], iv: &mut Vec<u8>, data: &mut [u8])
        -> Result<(), CipherError>;

    /// Length of the iv carried between chained calls (IGE uses two blocks).
    fn chained_iv_len(&self) -> usize {
        2 * CIPHER_BLOCK_SIZE
    }
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Counter iv for the CDN block starting at byte `offset`.
///
/// Bytes 12..16 of the redirect iv are replaced by the big-endian block
/// index `offset / 16`.
pub fn cdn_part_iv(base: &[u8; 16], offset: i64) -> [u8; 16] {
    let mut iv = *base;
    let block = ((offset / 16) as u32).to_be_bytes();
    iv[12..16].copy_from_slice(&block);
    iv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_cdn_part_iv_replaces_counter() {
        let base = [0xaa; 16];
        let iv = cdn_part_iv(&base, 16 * 0x0102_0304);
        assert_eq!(&iv[..12], &[0xaa; 12]);
        assert_eq!(&iv[12..], &[0x01, 0x02, 0x03, 0x04]);
    }
}
