//! Configuration of a ciphertext tree
//!
//! Stored as JSON in [`CONF_DEFAULT_NAME`] at the root of the ciphertext
//! directory. The master key itself is never stored here, only a key check
//! value that lets a wrong key be rejected before any file is touched.

use crate::crypto::ContentEnc;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name of the configuration file in the root of the ciphertext directory
pub const CONF_DEFAULT_NAME: &str = "veilfs.conf";

/// On-disk format version
pub const CONFIG_VERSION: u32 = 1;

/// Known plaintext encrypted into `key_check`
const KEY_CHECK_PLAINTEXT: &[u8] = b"veilfs key check";

/// Configuration of one ciphertext tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Format version
    pub version: u32,

    /// Store names in the clear (no directory IVs)
    #[serde(default)]
    pub plaintext_names: bool,

    /// Seconds without activity before the idle callback fires, 0 = never
    #[serde(default)]
    pub idle_timeout_secs: u64,

    /// Known plaintext encrypted under the master key
    #[serde(with = "hex_serde")]
    pub key_check: Vec<u8>,
}

impl Config {
    /// New configuration whose key check matches `content`
    pub fn new(plaintext_names: bool, idle_timeout_secs: u64, content: &ContentEnc) -> Result<Self> {
        Ok(Config {
            version: CONFIG_VERSION,
            plaintext_names,
            idle_timeout_secs,
            key_check: Self::create_key_check(content)?,
        })
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load the configuration stored in a ciphertext directory
    pub fn load_from_cipherdir<P: AsRef<Path>>(cipherdir: P) -> Result<Self> {
        Self::load(cipherdir.as_ref().join(CONF_DEFAULT_NAME))
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("VEILFS_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.trim().parse::<u64>() {
                self.idle_timeout_secs = secs;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.version != CONFIG_VERSION {
            return Err(Error::InvalidConfig(format!(
                "Unsupported config version {}, expected {}",
                self.version, CONFIG_VERSION
            )));
        }

        if self.key_check.is_empty() {
            return Err(Error::InvalidConfig("Key check is missing".to_string()));
        }

        Ok(())
    }

    /// Idle timeout, `None` when the idle monitor is disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn create_key_check(content: &ContentEnc) -> Result<Vec<u8>> {
        content.encrypt_standalone(KEY_CHECK_PLAINTEXT)
    }

    /// Check that `content` was derived from the key this tree was created with
    pub fn verify_key(&self, content: &ContentEnc) -> Result<()> {
        match content.decrypt_standalone(&self.key_check) {
            Ok(plain) if plain == KEY_CHECK_PLAINTEXT => Ok(()),
            Ok(_) | Err(Error::AuthenticationFailed) | Err(Error::CorruptHeader(_)) => {
                Err(Error::WrongKey)
            }
            Err(e) => Err(e),
        }
    }
}

/// Hex serialization for byte arrays
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let content = ContentEnc::new(&MasterKey::generate());
        let config = Config::new(true, 0, &content).unwrap();
        let path = dir.path().join(CONF_DEFAULT_NAME);
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.plaintext_names);
        assert_eq!(loaded.key_check, config.key_check);
        loaded.verify_key(&content).unwrap();
    }

    #[test]
    fn test_wrong_key() {
        let config = Config::new(false, 0, &ContentEnc::new(&MasterKey::generate())).unwrap();
        let other = ContentEnc::new(&MasterKey::generate());
        assert!(matches!(config.verify_key(&other), Err(Error::WrongKey)));
    }

    #[test]
    fn test_validate() {
        let content = ContentEnc::new(&MasterKey::generate());
        let mut config = Config::new(false, 0, &content).unwrap();
        assert!(config.validate().is_ok());

        config.version = 99;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.version = CONFIG_VERSION;
        config.key_check.clear();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_idle_timeout() {
        let content = ContentEnc::new(&MasterKey::generate());
        let mut config = Config::new(false, 0, &content).unwrap();
        assert_eq!(config.idle_timeout(), None);
        config.idle_timeout_secs = 30;
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONF_DEFAULT_NAME);
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
        assert!(matches!(
            Config::load(dir.path().join("missing")),
            Err(Error::Config(_))
        ));
    }
}
