//! Per-directory IVs
//!
//! Every directory of an encrypted-names tree holds a [`DIRIV_FILENAME`] file
//! with [`DIRIV_LEN`] random bytes. Names inside the directory are encrypted
//! under this IV, so the file is written once at directory creation and never
//! modified afterwards.
//!
//! Reads take the store lock shared, creation and any operation that moves or
//! removes directories take it exclusive, so no reader can observe a
//! directory whose IV is half written.

use super::backing::{Backing, CipherRoot, SystemBacking};
use crate::crypto::{random_array, DIRIV_LEN};
use crate::error::{Error, Result};
use nix::unistd::{unlinkat, UnlinkatFlags};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the IV file inside every backing directory
pub const DIRIV_FILENAME: &str = "veilfs.diriv";

/// Directory IV
pub type DirIv = [u8; DIRIV_LEN];

/// IV files are read-only once written
const DIRIV_MODE: u32 = 0o400;

/// Directory-IV store for one ciphertext tree
pub struct DirIvStore {
    /// Root of the ciphertext tree
    root: Arc<CipherRoot>,
    /// Shared for lookups, exclusive while IV files are created or moved
    lock: RwLock<()>,
    /// Ciphertext directory (relative to root) -> IV
    cache: Mutex<HashMap<PathBuf, DirIv>>,
}

/// Shared access: IVs can be read but not created
pub struct DirIvReader<'a> {
    store: &'a DirIvStore,
    _guard: RwLockReadGuard<'a, ()>,
}

/// Exclusive access: IVs can be read and created, the cache can be dropped
pub struct DirIvWriter<'a> {
    store: &'a DirIvStore,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl DirIvStore {
    /// Create a store on an opened ciphertext directory
    pub fn new(root: Arc<CipherRoot>) -> Self {
        DirIvStore {
            root,
            lock: RwLock::new(()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Open the ciphertext directory at `path` and create a store on it
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(CipherRoot::open(path)?)))
    }

    /// Acquire shared access
    pub fn read(&self) -> DirIvReader<'_> {
        DirIvReader {
            store: self,
            _guard: self.lock.read(),
        }
    }

    /// Acquire exclusive access
    pub fn write(&self) -> DirIvWriter<'_> {
        DirIvWriter {
            store: self,
            _guard: self.lock.write(),
        }
    }

    /// Read the IV of a ciphertext directory (relative path, "" = root)
    pub fn get_iv(&self, dir: &Path) -> Result<DirIv> {
        self.read().get_iv(dir)
    }

    /// Write the IV of a freshly created ciphertext directory
    pub fn set_iv(&self, dir: &Path, iv: &DirIv) -> Result<()> {
        self.write().set_iv(dir, iv)
    }

    fn load(&self, dir: &Path) -> Result<DirIv> {
        if let Some(iv) = self.cache.lock().get(dir) {
            return Ok(*iv);
        }

        let dirfd = self.root.open_dir(dir)?;
        let mut file = SystemBacking
            .openat(
                dirfd.as_fd(),
                OsStr::new(DIRIV_FILENAME),
                libc::O_RDONLY | libc::O_NOFOLLOW,
                0,
            )
            .map_err(|e| {
                warn!("cannot open directory IV in {:?}: {}", dir, e);
                Error::Io(e)
            })?;

        let mut buf = Vec::with_capacity(DIRIV_LEN + 1);
        Read::by_ref(&mut file)
            .take(DIRIV_LEN as u64 + 1)
            .read_to_end(&mut buf)?;
        if buf.len() != DIRIV_LEN {
            warn!(
                "directory IV in {:?} has {} bytes, expected {}",
                dir,
                buf.len(),
                DIRIV_LEN
            );
            return Err(Error::CorruptHeader(format!(
                "directory IV in {:?} has wrong length {}",
                dir,
                buf.len()
            )));
        }

        let mut iv = [0u8; DIRIV_LEN];
        iv.copy_from_slice(&buf);
        self.cache.lock().insert(dir.to_path_buf(), iv);
        Ok(iv)
    }

    fn store(&self, dir: &Path, iv: &DirIv) -> Result<()> {
        let dirfd = self.root.open_dir(dir)?;
        let mut file = SystemBacking.openat(
            dirfd.as_fd(),
            OsStr::new(DIRIV_FILENAME),
            libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL | libc::O_NOFOLLOW,
            DIRIV_MODE,
        )?;
        if let Err(e) = file.write_all(iv).and_then(|_| file.sync_all()) {
            warn!("writing directory IV in {:?} failed: {}", dir, e);
            let _ = unlinkat(dirfd.as_fd(), DIRIV_FILENAME, UnlinkatFlags::NoRemoveDir);
            return Err(Error::Io(e));
        }
        debug!("created directory IV in {:?}", dir);
        self.cache.lock().insert(dir.to_path_buf(), *iv);
        Ok(())
    }
}

impl DirIvReader<'_> {
    /// Read the IV of a ciphertext directory
    pub fn get_iv(&self, dir: &Path) -> Result<DirIv> {
        self.store.load(dir)
    }
}

impl DirIvWriter<'_> {
    /// Read the IV of a ciphertext directory
    pub fn get_iv(&self, dir: &Path) -> Result<DirIv> {
        self.store.load(dir)
    }

    /// Create the IV file of a ciphertext directory; fails if one exists
    pub fn set_iv(&self, dir: &Path, iv: &DirIv) -> Result<()> {
        self.store.store(dir, iv)
    }

    /// Create a random IV for a ciphertext directory
    pub fn create_iv(&self, dir: &Path) -> Result<DirIv> {
        let iv: DirIv = random_array();
        self.store.store(dir, &iv)?;
        Ok(iv)
    }

    /// Remove the IV file of a ciphertext directory, returning the IV so a
    /// failed follow-up operation can put it back with [`DirIvWriter::set_iv`]
    pub fn remove_iv(&self, dir: &Path) -> Result<DirIv> {
        let iv = self.store.load(dir)?;
        let dirfd = self.store.root.open_dir(dir)?;
        unlinkat(dirfd.as_fd(), DIRIV_FILENAME, UnlinkatFlags::NoRemoveDir)?;
        self.invalidate();
        Ok(iv)
    }

    /// Drop every cached IV (after directories were moved or removed)
    pub fn invalidate(&self) {
        self.store.cache.lock().clear();
    }
}
