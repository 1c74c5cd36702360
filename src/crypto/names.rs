//! File name encryption
//!
//! Names are encrypted deterministically so the encrypted name of a plaintext
//! name can be computed for lookups, and are scoped by the parent directory's
//! IV so equal names in different directories look unrelated:
//!
//! ```text
//! padded = PKCS#7(name, 16)
//! siv    = HMAC-SHA256(siv_key, dir_iv || padded)[..12]
//! out    = base64url(siv || AES-256-GCM(name_key, nonce = siv, aad = dir_iv, padded))
//! ```
//!
//! A nonce only repeats for the same (dir_iv, name) pair, which produces the
//! same ciphertext anyway.

use super::{MasterKey, HKDF_INFO_NAMES, HKDF_INFO_NAME_SIV};
use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::hmac;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

/// Directory IV length
pub const DIRIV_LEN: usize = 16;

/// Longest name the backing filesystem accepts
pub const NAME_MAX: usize = 255;

/// Names are padded to a multiple of this to hide their exact length
const NAME_PAD: usize = 16;

const GCM_TAG_LEN: usize = 16;

struct NameKeys {
    aead: LessSafeKey,
    siv: hmac::Key,
}

/// Encrypts and decrypts path components
///
/// Constructed either with keys (encrypted names) or via
/// [`NameTransform::plaintext`], in which case names pass through unchanged.
pub struct NameTransform {
    keys: Option<NameKeys>,
}

impl NameTransform {
    /// Name transform that encrypts names
    pub fn new(key: &MasterKey) -> Result<Self> {
        let prk = key.prk();
        let aead = prk
            .expand(&[HKDF_INFO_NAMES], &AES_256_GCM)
            .map_err(|_| Error::Internal("HKDF expand failed".to_string()))?;
        let siv = prk
            .expand(&[HKDF_INFO_NAME_SIV], hmac::HMAC_SHA256)
            .map_err(|_| Error::Internal("HKDF expand failed".to_string()))?;
        Ok(NameTransform {
            keys: Some(NameKeys {
                aead: LessSafeKey::new(UnboundKey::from(aead)),
                siv: hmac::Key::from(siv),
            }),
        })
    }

    /// Name transform for plaintext-names mode
    pub fn plaintext() -> Self {
        NameTransform { keys: None }
    }

    /// Whether names are stored unencrypted
    pub fn plaintext_names(&self) -> bool {
        self.keys.is_none()
    }

    fn synthetic_iv(keys: &NameKeys, iv: &[u8; DIRIV_LEN], padded: &[u8]) -> [u8; NONCE_LEN] {
        let mut ctx = hmac::Context::with_key(&keys.siv);
        ctx.update(iv);
        ctx.update(padded);
        let tag = ctx.sign();
        let mut siv = [0u8; NONCE_LEN];
        siv.copy_from_slice(&tag.as_ref()[..NONCE_LEN]);
        siv
    }

    /// Encrypt one path component under a directory IV
    pub fn encrypt_name(&self, plain: &OsStr, iv: &[u8; DIRIV_LEN]) -> Result<OsString> {
        let Some(keys) = &self.keys else {
            return Ok(plain.to_os_string());
        };

        let mut padded = plain.as_bytes().to_vec();
        let pad = NAME_PAD - padded.len() % NAME_PAD;
        padded.resize(padded.len() + pad, pad as u8);

        let siv = Self::synthetic_iv(keys, iv, &padded);
        keys.aead
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(siv), Aad::from(iv), &mut padded)
            .map_err(|_| Error::Internal("AEAD seal failed".to_string()))?;

        let mut raw = siv.to_vec();
        raw.extend_from_slice(&padded);
        let encoded = self.b64_encode(&raw);
        if encoded.len() > NAME_MAX {
            return Err(Error::NameTooLong(encoded.len()));
        }
        Ok(OsString::from(encoded))
    }

    /// Decrypt one encrypted path component
    ///
    /// Malformed input yields [`Error::CorruptName`], never a panic.
    pub fn decrypt_name(&self, cipher: &OsStr, iv: &[u8; DIRIV_LEN]) -> Result<OsString> {
        let Some(keys) = &self.keys else {
            return Ok(cipher.to_os_string());
        };
        let corrupt = |why: &str| {
            Error::CorruptName(format!("{}: {}", cipher.to_string_lossy(), why))
        };

        let encoded = cipher.to_str().ok_or_else(|| corrupt("not valid base64"))?;
        let raw = self
            .b64_decode(encoded)
            .map_err(|_| corrupt("not valid base64"))?;
        if raw.len() < NONCE_LEN + NAME_PAD + GCM_TAG_LEN {
            return Err(corrupt("too short"));
        }

        let mut siv = [0u8; NONCE_LEN];
        siv.copy_from_slice(&raw[..NONCE_LEN]);
        let mut body = raw[NONCE_LEN..].to_vec();
        let padded_len = keys
            .aead
            .open_in_place(Nonce::assume_unique_for_key(siv), Aad::from(iv), &mut body)
            .map_err(|_| corrupt("authentication failed"))?
            .len();
        body.truncate(padded_len);

        if Self::synthetic_iv(keys, iv, &body) != siv {
            return Err(corrupt("synthetic IV mismatch"));
        }

        let pad = *body.last().ok_or_else(|| corrupt("empty"))? as usize;
        if pad == 0 || pad > NAME_PAD || pad > body.len() {
            return Err(corrupt("bad padding"));
        }
        if body[body.len() - pad..].iter().any(|&b| b as usize != pad) {
            return Err(corrupt("bad padding"));
        }
        body.truncate(body.len() - pad);

        if body.is_empty() || body == b"." || body == b".." || body.contains(&b'/') || body.contains(&0)
        {
            return Err(corrupt("invalid plaintext name"));
        }
        Ok(OsString::from_vec(body))
    }

    /// Base64 encoding used for names and symlink targets on disk
    pub fn b64_encode(&self, data: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(data)
    }

    /// Inverse of [`NameTransform::b64_encode`]
    pub fn b64_decode(&self, s: &str) -> Result<Vec<u8>> {
        URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| Error::CorruptName(format!("{}: {}", s, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn transform() -> NameTransform {
        NameTransform::new(&MasterKey::generate()).unwrap()
    }

    fn os(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    fn test_roundtrip() {
        let nt = transform();
        let iv = [7u8; DIRIV_LEN];
        for name in ["a", "hello.txt", "exactly16bytes!!", "ünïcödé", "with space"] {
            let enc = nt.encrypt_name(os(name), &iv).unwrap();
            assert_ne!(enc, os(name));
            assert_eq!(nt.decrypt_name(&enc, &iv).unwrap(), os(name));
        }
    }

    #[test]
    fn test_deterministic() {
        let nt = transform();
        let iv = [1u8; DIRIV_LEN];
        assert_eq!(
            nt.encrypt_name(os("file"), &iv).unwrap(),
            nt.encrypt_name(os("file"), &iv).unwrap()
        );
    }

    #[test]
    fn test_iv_changes_ciphertext() {
        let nt = transform();
        let a = nt.encrypt_name(os("file"), &[1u8; DIRIV_LEN]).unwrap();
        let b = nt.encrypt_name(os("file"), &[2u8; DIRIV_LEN]).unwrap();
        assert_ne!(a, b);
        assert!(nt.decrypt_name(&a, &[2u8; DIRIV_LEN]).is_err());
    }

    #[test]
    fn test_injective_per_directory() {
        let nt = transform();
        let iv = [3u8; DIRIV_LEN];
        let names: HashSet<_> = (0..500)
            .map(|i| nt.encrypt_name(os(&format!("name-{}", i)), &iv).unwrap())
            .collect();
        assert_eq!(names.len(), 500);
    }

    #[test]
    fn test_corrupt_names_are_reported() {
        let nt = transform();
        let iv = [4u8; DIRIV_LEN];
        let good = nt.encrypt_name(os("file"), &iv).unwrap();

        let mut flipped = good.clone().into_vec();
        flipped[5] = if flipped[5] == b'A' { b'B' } else { b'A' };

        for bad in [
            OsString::from("veilfs.diriv"),
            OsString::from("AAAA"),
            OsString::from_vec(flipped),
            OsString::from_vec(vec![0xff, 0xfe]),
        ] {
            assert!(nt.decrypt_name(&bad, &iv).unwrap_err().is_corrupt_name());
        }
    }

    #[test]
    fn test_wrong_key_is_corrupt() {
        let iv = [5u8; DIRIV_LEN];
        let enc = transform().encrypt_name(os("file"), &iv).unwrap();
        assert!(transform().decrypt_name(&enc, &iv).is_err());
    }

    #[test]
    fn test_name_too_long() {
        let nt = transform();
        let long = "x".repeat(200);
        assert!(matches!(
            nt.encrypt_name(os(&long), &[0u8; DIRIV_LEN]),
            Err(Error::NameTooLong(_))
        ));
    }

    #[test]
    fn test_plaintext_mode_is_identity() {
        let nt = NameTransform::plaintext();
        let iv = [0u8; DIRIV_LEN];
        assert!(nt.plaintext_names());
        assert_eq!(nt.encrypt_name(os("file.txt"), &iv).unwrap(), os("file.txt"));
        assert_eq!(nt.decrypt_name(os("file.txt"), &iv).unwrap(), os("file.txt"));
        assert!(!transform().plaintext_names());
    }

    #[test]
    fn test_b64() {
        let nt = transform();
        let data = [0u8, 255, 62, 63];
        let enc = nt.b64_encode(&data);
        assert!(!enc.contains('/') && !enc.contains('='));
        assert_eq!(nt.b64_decode(&enc).unwrap(), data);
        assert!(nt.b64_decode("a/b").is_err());
    }
}
