//! Cryptographic primitives
//!
//! - [`ContentEnc`]: authenticated, randomly accessible block encryption of
//!   file contents (AES-256-GCM with per-file keys)
//! - [`NameTransform`]: deterministic, directory-IV scoped encryption of
//!   path components
//!
//! All sub-keys are derived from a single [`MasterKey`] with HKDF-SHA256.

mod content;
mod names;

pub use content::{
    BlockRange, ContentEnc, FileHeader, FileId, BLOCK_OVERHEAD, CIPHER_BLOCK_SIZE, FILE_ID_LEN,
    HEADER_LEN, MAX_FILE_SIZE, NONCE_LEN, PLAIN_BLOCK_SIZE, TAG_LEN,
};
pub use names::{NameTransform, DIRIV_LEN, NAME_MAX};

use crate::error::{Error, Result};
use rand::RngCore;
use ring::hkdf;
use zeroize::Zeroizing;

/// Master key size in bytes
pub const KEY_SIZE: usize = 32;

/// HKDF label for per-file content keys (followed by the file id)
const HKDF_INFO_CONTENT: &[u8] = b"veilfs content";
/// HKDF label for the name encryption key
const HKDF_INFO_NAMES: &[u8] = b"veilfs names";
/// HKDF label for the synthetic-IV key used by name encryption
const HKDF_INFO_NAME_SIV: &[u8] = b"veilfs name siv";

/// Master key (zeroized on drop)
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl MasterKey {
    /// Generate a fresh random master key
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(key.as_mut());
        MasterKey { key }
    }

    /// Build a master key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidConfig(format!(
                "master key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(MasterKey { key })
    }

    /// Parse a hex encoded master key (surrounding whitespace is ignored)
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim())
                .map_err(|e| Error::InvalidConfig(format!("master key is not valid hex: {}", e)))?,
        );
        Self::from_bytes(&bytes)
    }

    /// Hex encoding of the key, for writing a key file
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.key.as_ref()))
    }

    /// HKDF pseudo-random key all sub-keys are expanded from
    pub(crate) fn prk(&self) -> hkdf::Prk {
        hkdf::Salt::new(hkdf::HKDF_SHA256, &[]).extract(self.key.as_ref())
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([redacted])")
    }
}

/// Fill a fixed-size array with random bytes
pub(crate) fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}
