//! Encrypted overlay filesystem core
//!
//! Maps a plaintext view onto a ciphertext directory tree. The FUSE
//! dispatch layer lives outside this crate and calls into [`RootState`].

mod attr;
mod backing;
mod diriv;
mod file;
mod idle;
mod inomap;
mod node;
mod root;

pub use attr::{Attr, DirEntry, FileKind};
pub use backing::{Backing, CipherRoot, SystemBacking};
pub use diriv::{DirIv, DirIvReader, DirIvStore, DirIvWriter, DIRIV_FILENAME};
pub use file::{OpenFile, OpenFileTable};
pub use idle::IdleMonitor;
pub use inomap::{InoMap, QIno, FIRST_INO, UNKNOWN_INO};
pub use root::{OpenGuard, RootState, CORRUPTION_REPORT_TIMEOUT};

use crate::config::{Config, CONF_DEFAULT_NAME};
use crate::crypto::{ContentEnc, MasterKey};
use crate::error::{Error, Result};
use std::path::Path;
use tracing::info;

/// Initialize an empty directory as a ciphertext tree
///
/// Writes the configuration file and, unless names are stored in the clear,
/// the IV of the root directory.
pub fn init_cipherdir(
    cipherdir: &Path,
    plaintext_names: bool,
    idle_timeout_secs: u64,
    key: &MasterKey,
) -> Result<Config> {
    if std::fs::read_dir(cipherdir)?.next().is_some() {
        return Err(Error::InvalidConfig(format!(
            "{} is not empty",
            cipherdir.display()
        )));
    }

    let config = Config::new(plaintext_names, idle_timeout_secs, &ContentEnc::new(key))?;
    config.save(cipherdir.join(CONF_DEFAULT_NAME))?;
    if !plaintext_names {
        DirIvStore::open(cipherdir)?.write().create_iv(Path::new(""))?;
    }
    info!(
        "initialized ciphertext directory {} (plaintext names: {})",
        cipherdir.display(),
        plaintext_names
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_cipherdir() {
        let dir = tempdir().unwrap();
        let key = MasterKey::generate();
        let config = init_cipherdir(dir.path(), false, 0, &key).unwrap();
        assert!(!config.plaintext_names);
        assert!(dir.path().join(CONF_DEFAULT_NAME).exists());
        assert!(dir.path().join(DIRIV_FILENAME).exists());

        let loaded = Config::load_from_cipherdir(dir.path()).unwrap();
        assert!(RootState::new(dir.path(), loaded, &key).is_ok());

        // A second init finds the directory populated
        assert!(init_cipherdir(dir.path(), false, 0, &key).is_err());
    }

    #[test]
    fn test_init_plaintext_names() {
        let dir = tempdir().unwrap();
        init_cipherdir(dir.path(), true, 0, &MasterKey::generate()).unwrap();
        assert!(!dir.path().join(DIRIV_FILENAME).exists());
    }
}
