//! Root coordinator
//!
//! [`RootState`] is constructed once per mounted ciphertext tree and shared
//! (behind an `Arc`) by every operation. It owns the crypto engines, the
//! inode map, the directory-IV store, the two locks of the core and the
//! mitigated-corruption channel.

use super::backing::{Backing, CipherRoot, SystemBacking};
use super::diriv::DirIvStore;
use super::file::OpenFileTable;
use super::inomap::InoMap;
use crate::config::{Config, CONF_DEFAULT_NAME};
use crate::crypto::{ContentEnc, MasterKey, NameTransform};
use crate::error::{Error, Result};
use crossbeam_channel::{SendTimeoutError, Sender};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::ffi::{OsStr, OsString};
use std::fs::{File, Permissions};
use std::os::fd::BorrowedFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a corruption report may wait for a slow consumer
pub const CORRUPTION_REPORT_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(any(target_os = "linux", target_os = "android"))]
const O_DIRECT: i32 = libc::O_DIRECT;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const O_DIRECT: i32 = 0;

/// Shared state of one mounted ciphertext tree
pub struct RootState {
    /// Every backing operation is resolved below this fd
    cipher_root: Arc<CipherRoot>,
    config: Config,
    names: NameTransform,
    content: ContentEnc,
    inomap: InoMap,
    dir_ivs: DirIvStore,
    /// Held shared by every open; taken exclusive while
    /// [`OpenGuard::open_write_only_file`] relaxes file permissions
    open_write_only_lock: RwLock<()>,
    open_files: OpenFileTable,
    backing: Box<dyn Backing>,
    /// Consumer of mitigated corruptions (fsck), if any
    mitigated_corruptions: Option<Sender<String>>,
    /// Reset to 0 by every [`RootState::is_filtered`] call, set to 1 by the
    /// idle monitor
    is_idle: AtomicU32,
}

impl RootState {
    /// Set up the coordinator for a ciphertext tree
    ///
    /// Fails with [`Error::WrongKey`] if `key` does not match the key check
    /// stored in `config`.
    pub fn new(cipherdir: impl Into<PathBuf>, config: Config, key: &MasterKey) -> Result<Self> {
        config.validate()?;
        let content = ContentEnc::new(key);
        config.verify_key(&content)?;
        let names = if config.plaintext_names {
            NameTransform::plaintext()
        } else {
            NameTransform::new(key)?
        };
        let cipher_root = Arc::new(CipherRoot::open(cipherdir)?);

        Ok(RootState {
            dir_ivs: DirIvStore::new(Arc::clone(&cipher_root)),
            cipher_root,
            config,
            names,
            content,
            inomap: InoMap::new(),
            open_write_only_lock: RwLock::new(()),
            open_files: OpenFileTable::new(),
            backing: Box::new(SystemBacking),
            mitigated_corruptions: None,
            is_idle: AtomicU32::new(0),
        })
    }

    /// Replace the backing store primitives
    pub fn with_backing(mut self, backing: Box<dyn Backing>) -> Self {
        self.backing = backing;
        self
    }

    /// Report mitigated corruptions to `tx`
    pub fn with_corruption_reporter(mut self, tx: Sender<String>) -> Self {
        self.mitigated_corruptions = Some(tx);
        self
    }

    pub fn cipherdir(&self) -> &Path {
        self.cipher_root.path()
    }

    pub(crate) fn cipher_root(&self) -> &CipherRoot {
        &self.cipher_root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn names(&self) -> &NameTransform {
        &self.names
    }

    pub fn content(&self) -> &ContentEnc {
        &self.content
    }

    pub fn inomap(&self) -> &InoMap {
        &self.inomap
    }

    pub fn dir_ivs(&self) -> &DirIvStore {
        &self.dir_ivs
    }

    pub(crate) fn backing(&self) -> &dyn Backing {
        self.backing.as_ref()
    }

    pub(crate) fn open_files(&self) -> &OpenFileTable {
        &self.open_files
    }

    /// Number of backing files with open handles
    pub fn open_file_count(&self) -> usize {
        self.open_files.count()
    }

    /// Convert the open flags a caller asked for into the flags used on the
    /// backing file. The result always contains `O_NOFOLLOW`.
    pub fn mangle_open_flags(flags: i32) -> i32 {
        let mut new_flags = flags;
        // Read-modify-write needs read access
        if new_flags & libc::O_ACCMODE == libc::O_WRONLY {
            new_flags = (new_flags & !libc::O_ACCMODE) | libc::O_RDWR;
        }
        // RMW seeks back, and offsets are translated by the content layer
        new_flags &= !libc::O_APPEND;
        // The header shifts every block, so aligned plaintext I/O is never
        // aligned on the backing file
        new_flags &= !O_DIRECT;
        // Create is a separate operation
        new_flags &= !libc::O_CREAT;
        new_flags | libc::O_NOFOLLOW
    }

    /// Hand the name of a corrupt item to the corruption consumer
    ///
    /// A no-op without a consumer. A consumer that does not drain the channel
    /// delays the caller by at most [`CORRUPTION_REPORT_TIMEOUT`].
    pub fn report_mitigated_corruption(&self, item: &str) {
        let Some(tx) = &self.mitigated_corruptions else {
            return;
        };
        match tx.send_timeout(item.to_string(), CORRUPTION_REPORT_TIMEOUT) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!("reporting mitigated corruption of {:?} timed out", item);
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                debug!("corruption consumer is gone, dropping report for {:?}", item);
            }
        }
    }

    /// Whether a plaintext path is forbidden because it would clash with an
    /// internal file. Also marks the filesystem as active.
    pub fn is_filtered(&self, path: &Path) -> bool {
        self.is_idle.store(0, Ordering::Relaxed);

        if !self.config.plaintext_names {
            return false;
        }
        let relative = path.strip_prefix("/").unwrap_or(path);
        if relative == Path::new(CONF_DEFAULT_NAME) {
            info!(
                "the name /{} is reserved when plaintext names are used",
                CONF_DEFAULT_NAME
            );
            return true;
        }
        // The IV file needs no filtering: IV files are never created in
        // plaintext-names mode
        false
    }

    /// [`RootState::is_filtered`] as an error
    pub(crate) fn check_filtered(&self, path: &Path) -> Result<()> {
        if self.is_filtered(path) {
            return Err(Error::ReservedName(path.display().to_string()));
        }
        Ok(())
    }

    /// Whether no activity was seen since the idle flag was last set
    pub fn is_idle(&self) -> bool {
        self.is_idle.load(Ordering::Relaxed) == 1
    }

    /// Set the idle flag, returning whether it was already set
    pub fn mark_idle(&self) -> bool {
        self.is_idle.swap(1, Ordering::Relaxed) == 1
    }

    /// Encrypt a symlink target for storage as the backing link target
    pub fn encrypt_symlink_target(&self, target: &OsStr) -> Result<OsString> {
        if self.config.plaintext_names || target.is_empty() {
            return Ok(target.to_os_string());
        }
        let cipher = self.content.encrypt_standalone(target.as_bytes())?;
        Ok(OsString::from(self.names.b64_encode(&cipher)))
    }

    /// Decrypt a backing symlink target. Performs no I/O.
    ///
    /// The empty string decrypts to the empty string.
    pub fn decrypt_symlink_target(&self, cipher64: &OsStr) -> Result<OsString> {
        if self.config.plaintext_names || cipher64.is_empty() {
            return Ok(cipher64.to_os_string());
        }
        let encoded = cipher64
            .to_str()
            .ok_or_else(|| Error::CorruptName(cipher64.to_string_lossy().into_owned()))?;
        let cipher = self.names.b64_decode(encoded)?;
        let plain = self.content.decrypt_standalone(&cipher)?;
        Ok(OsString::from_vec(plain))
    }

    /// Start an open: holds the write-only-open lock shared until dropped
    pub fn open_guard(&self) -> OpenGuard<'_> {
        OpenGuard {
            root: self,
            shared: Some(self.open_write_only_lock.read()),
        }
    }
}

/// An open in progress, holding the write-only-open lock shared
pub struct OpenGuard<'a> {
    root: &'a RootState,
    shared: Option<RwLockReadGuard<'a, ()>>,
}

impl<'a> OpenGuard<'a> {
    /// Open a backing file that has no read permission
    ///
    /// Read-modify-write always needs read access, so the file is opened
    /// write-only, made readable for the owner, opened read-write, and its
    /// permissions restored. While permissions are relaxed the lock is held
    /// exclusive so no concurrent open can see them. Permissions and lock are
    /// restored on every path out of here.
    pub fn open_write_only_file(
        &mut self,
        dir: BorrowedFd<'_>,
        cname: &OsStr,
        new_flags: i32,
    ) -> Result<File> {
        let wo = self
            .root
            .backing
            .openat(dir, cname, libc::O_WRONLY | libc::O_NOFOLLOW, 0)?;
        let perms = wo.metadata()?.permissions().mode() & 0o7777;
        if perms & 0o400 != 0 {
            warn!(
                "open_write_only_file: unexpected permissions {:#o}, returning EPERM",
                perms
            );
            return Err(Error::PermissionViolation(format!(
                "{} is readable ({:#o})",
                cname.to_string_lossy(),
                perms
            )));
        }

        // Upgrade the lock to block other opens, downgrade again below
        drop(self.shared.take());
        let exclusive = self.root.open_write_only_lock.write();
        let result = self.relax_and_open(&wo, perms, dir, cname, new_flags);
        self.shared = Some(RwLockWriteGuard::downgrade(exclusive));
        result
    }

    fn relax_and_open(
        &self,
        wo: &File,
        perms: u32,
        dir: BorrowedFd<'_>,
        cname: &OsStr,
        new_flags: i32,
    ) -> Result<File> {
        if let Err(e) = wo.set_permissions(Permissions::from_mode(perms | 0o400)) {
            warn!("open_write_only_file: changing permissions failed: {}", e);
            return Err(Error::Io(e));
        }
        let rw = self.root.backing.openat(dir, cname, new_flags, 0);
        if let Err(e) = wo.set_permissions(Permissions::from_mode(perms)) {
            warn!("open_write_only_file: reverting permissions failed: {}", e);
        }
        Ok(rw?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::os::fd::AsFd;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tempfile::{tempdir, TempDir};

    fn root(plaintext_names: bool) -> (TempDir, RootState) {
        let dir = tempdir().unwrap();
        let key = MasterKey::generate();
        let config = crate::fs::init_cipherdir(dir.path(), plaintext_names, 0, &key).unwrap();
        let state = RootState::new(dir.path(), config, &key).unwrap();
        (dir, state)
    }

    fn mode_of(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[test]
    fn test_wrong_key_rejected() {
        let dir = tempdir().unwrap();
        let config = crate::fs::init_cipherdir(dir.path(), false, 0, &MasterKey::generate()).unwrap();
        assert!(matches!(
            RootState::new(dir.path(), config, &MasterKey::generate()),
            Err(Error::WrongKey)
        ));
    }

    #[test]
    fn test_mangle_open_flags() {
        let flags = libc::O_WRONLY | libc::O_APPEND | O_DIRECT | libc::O_CREAT | libc::O_TRUNC;
        let mangled = RootState::mangle_open_flags(flags);
        assert_eq!(mangled & libc::O_ACCMODE, libc::O_RDWR);
        assert_eq!(mangled & libc::O_APPEND, 0);
        assert_eq!(mangled & O_DIRECT, 0);
        assert_eq!(mangled & libc::O_CREAT, 0);
        assert_ne!(mangled & libc::O_NOFOLLOW, 0);
        assert_ne!(mangled & libc::O_TRUNC, 0);

        for flags in [libc::O_RDONLY, libc::O_RDWR, libc::O_RDONLY | libc::O_EXCL] {
            let mangled = RootState::mangle_open_flags(flags);
            assert_eq!(mangled & libc::O_ACCMODE, flags & libc::O_ACCMODE);
            assert_ne!(mangled & libc::O_NOFOLLOW, 0);
        }
    }

    #[test]
    fn test_is_filtered() {
        let (_dir, plain) = root(true);
        assert!(plain.is_filtered(Path::new("veilfs.conf")));
        assert!(plain.is_filtered(Path::new("/veilfs.conf")));
        assert!(!plain.is_filtered(Path::new("sub/veilfs.conf")));
        assert!(!plain.is_filtered(Path::new("veilfs.diriv")));

        let (_dir, encrypted) = root(false);
        assert!(!encrypted.is_filtered(Path::new("veilfs.conf")));
    }

    #[test]
    fn test_is_filtered_resets_idle() {
        let (_dir, state) = root(false);
        assert!(!state.mark_idle());
        assert!(state.is_idle());
        state.is_filtered(Path::new("anything"));
        assert!(!state.is_idle());

        let (_dir, plain) = root(true);
        plain.mark_idle();
        assert!(plain.is_filtered(Path::new("veilfs.conf")));
        assert!(!plain.is_idle());
    }

    #[test]
    fn test_report_without_consumer() {
        let (_dir, state) = root(false);
        let start = Instant::now();
        state.report_mitigated_corruption("item");
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_report_delivers() {
        let (_dir, state) = root(false);
        let (tx, rx) = crossbeam_channel::bounded(4);
        let state = state.with_corruption_reporter(tx);
        state.report_mitigated_corruption("bad-name");
        assert_eq!(rx.try_recv().unwrap(), "bad-name");
    }

    #[test]
    fn test_report_with_stuck_consumer_times_out() {
        let (_dir, state) = root(false);
        let (tx, _rx) = crossbeam_channel::bounded(0);
        let state = state.with_corruption_reporter(tx);
        let start = Instant::now();
        state.report_mitigated_corruption("stuck");
        let elapsed = start.elapsed();
        assert!(elapsed >= CORRUPTION_REPORT_TIMEOUT);
        assert!(elapsed < CORRUPTION_REPORT_TIMEOUT * 5);
    }

    #[test]
    fn test_symlink_targets() {
        let (_dir, state) = root(false);
        assert_eq!(state.decrypt_symlink_target(OsStr::new("")).unwrap(), "");

        let enc = state.encrypt_symlink_target(OsStr::new("../some/target")).unwrap();
        assert_ne!(enc, "../some/target");
        assert_eq!(state.decrypt_symlink_target(&enc).unwrap(), "../some/target");

        let mut bad = enc.into_vec();
        let last = bad.len() - 1;
        bad[last] = if bad[last] == b'A' { b'B' } else { b'A' };
        assert!(state.decrypt_symlink_target(&OsString::from_vec(bad)).is_err());

        let (_dir, plain) = root(true);
        assert_eq!(plain.encrypt_symlink_target(OsStr::new("t")).unwrap(), "t");
    }

    #[test]
    fn test_open_write_only_file_rejects_readable_file() {
        let (dir, state) = root(false);
        let path = dir.path().join("readable");
        std::fs::write(&path, b"x").unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();

        let mut guard = state.open_guard();
        let err = guard
            .open_write_only_file(
                state.cipher_root().as_fd(),
                OsStr::new("readable"),
                libc::O_RDWR,
            )
            .unwrap_err();
        assert!(matches!(err, Error::PermissionViolation(_)));
        assert_eq!(err.errno(), libc::EPERM);
        assert_eq!(mode_of(&path), 0o644);
    }

    #[test]
    fn test_open_write_only_file_restores_permissions() {
        let (dir, state) = root(false);
        let path = dir.path().join("wo");
        std::fs::write(&path, b"x").unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o220)).unwrap();
        let before = mode_of(&path);

        let mut guard = state.open_guard();
        let file = guard
            .open_write_only_file(
                state.cipher_root().as_fd(),
                OsStr::new("wo"),
                libc::O_RDWR | libc::O_NOFOLLOW,
            )
            .unwrap();
        assert_eq!(mode_of(&path), before);
        drop(guard);

        let mut buf = [0u8; 1];
        use std::os::unix::fs::FileExt;
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 1);
        assert_eq!(&buf, b"x");
    }

    /// Fails every read-write open, counts all opens
    struct FailingRw {
        opens: AtomicUsize,
    }

    impl Backing for FailingRw {
        fn openat(&self, dir: BorrowedFd<'_>, name: &OsStr, flags: i32, mode: u32) -> io::Result<File> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if flags & libc::O_ACCMODE == libc::O_RDWR {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            SystemBacking.openat(dir, name, flags, mode)
        }
    }

    #[test]
    fn test_open_write_only_file_restores_permissions_on_failure() {
        let (dir, state) = root(false);
        let state = state.with_backing(Box::new(FailingRw {
            opens: AtomicUsize::new(0),
        }));
        let path = dir.path().join("wo");
        std::fs::write(&path, b"x").unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o200)).unwrap();

        let mut guard = state.open_guard();
        let err = guard
            .open_write_only_file(state.cipher_root().as_fd(), OsStr::new("wo"), libc::O_RDWR)
            .unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(mode_of(&path), 0o200);
        drop(guard);

        // The lock is back in shared mode and released with the guard
        assert!(state.open_write_only_lock.try_write().is_some());
    }

    #[test]
    fn test_open_write_only_file_blocks_concurrent_opens() {
        let (dir, state) = root(false);
        let state = Arc::new(state);
        let path = dir.path().join("wo");
        std::fs::write(&path, b"x").unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o200)).unwrap();

        let other = state.open_guard();
        let handle = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                let mut guard = state.open_guard();
                let opened = guard.open_write_only_file(
                    state.cipher_root().as_fd(),
                    OsStr::new("wo"),
                    libc::O_RDWR,
                );
                opened.map(|_| ())
            })
        };

        // While another open holds the lock shared, permissions stay untouched
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(mode_of(&path), 0o200);
        drop(other);

        handle.join().unwrap().unwrap();
        assert_eq!(mode_of(&path), 0o200);
    }
}
