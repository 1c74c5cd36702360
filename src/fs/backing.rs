//! Backing store primitives
//!
//! The ciphertext directory is opened once as a [`CipherRoot`]. Every path
//! below it is resolved one component at a time with `openat` and
//! `O_NOFOLLOW`, and the final operation is performed relative to the
//! parent directory fd. A symlink planted anywhere in the backing tree
//! therefore fails the operation instead of redirecting it.

use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::{fstatat, FileStat, Mode};
use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};

/// Open primitive on the backing store
///
/// `fstat`, `fchmod` and `close` are performed on the returned [`File`]
/// (`metadata`, `set_permissions`, drop).
pub trait Backing: Send + Sync {
    /// `openat(2)` relative to `dir`
    fn openat(&self, dir: BorrowedFd<'_>, name: &OsStr, flags: i32, mode: u32) -> io::Result<File>;
}

/// Backing store on the local kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBacking;

impl Backing for SystemBacking {
    fn openat(&self, dir: BorrowedFd<'_>, name: &OsStr, flags: i32, mode: u32) -> io::Result<File> {
        let fd = nix::fcntl::openat(
            dir,
            name,
            OFlag::from_bits_truncate(flags) | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(mode as libc::mode_t),
        )?;
        Ok(File::from(fd))
    }
}

/// Flags for opening a directory as an `*at` anchor
fn dir_flags() -> OFlag {
    OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC
}

/// Open the directory `name` inside `dir` without following a symlink
pub fn open_dir_at(dir: BorrowedFd<'_>, name: &OsStr) -> io::Result<OwnedFd> {
    Ok(nix::fcntl::openat(dir, name, dir_flags(), Mode::empty())?)
}

/// `fstatat` without following symlinks; `None` if the name does not exist
///
/// Directory entries can vanish between `readdir` and `stat`.
pub fn stat_at(dir: BorrowedFd<'_>, name: &OsStr) -> io::Result<Option<FileStat>> {
    match fstatat(dir, name, AtFlags::AT_SYMLINK_NOFOLLOW) {
        Ok(st) => Ok(Some(st)),
        Err(nix::errno::Errno::ENOENT) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The ciphertext directory, opened once
pub struct CipherRoot {
    path: PathBuf,
    fd: OwnedFd,
}

impl CipherRoot {
    /// Open the ciphertext directory. The directory itself may be reached
    /// through a symlink; nothing below it may.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY)
            .open(&path)?;
        Ok(CipherRoot {
            path,
            fd: OwnedFd::from(file),
        })
    }

    /// Path the root was opened at, for messages and the config file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the ciphertext directory `cdir` ("" = root)
    pub fn open_dir(&self, cdir: &Path) -> io::Result<OwnedFd> {
        let mut dir = open_dir_at(self.fd.as_fd(), OsStr::new("."))?;
        for component in cdir.components() {
            match component {
                Component::Normal(name) => dir = open_dir_at(dir.as_fd(), name)?,
                Component::CurDir => {}
                _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
            }
        }
        Ok(dir)
    }

    /// Parent directory of `cpath` and the final name inside it
    ///
    /// The root itself resolves to (root, ".").
    pub fn open_parent(&self, cpath: &Path) -> io::Result<(OwnedFd, OsString)> {
        match cpath.file_name() {
            Some(name) => {
                let parent = cpath.parent().unwrap_or(Path::new(""));
                Ok((self.open_dir(parent)?, name.to_os_string()))
            }
            None => Ok((self.open_dir(Path::new(""))?, OsString::from("."))),
        }
    }
}

impl AsFd for CipherRoot {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
