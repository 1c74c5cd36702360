//! Path-level operations on the plaintext tree
//!
//! Every operation takes a plaintext path relative to the mount point, maps
//! it to the ciphertext tree and performs the backing operation relative to
//! the parent directory fd (see [`CipherRoot`](super::backing::CipherRoot)).
//! Operations that only look names up hold the directory-IV store shared;
//! operations that create, move or remove directories hold it exclusive.

use super::attr::{Attr, DirEntry, FileKind};
use super::backing::{open_dir_at, stat_at};
use super::diriv::{DirIv, DIRIV_FILENAME};
use super::file::OpenFile;
use super::inomap::QIno;
use super::root::RootState;
use crate::config::CONF_DEFAULT_NAME;
use crate::crypto::ContentEnc;
use crate::error::{Error, Result};
use nix::dir::Dir;
use nix::fcntl::{readlinkat, renameat, OFlag};
use nix::sys::stat::{mkdirat, FileStat, Mode};
use nix::unistd::{symlinkat, unlinkat, UnlinkatFlags};
use std::ffi::{OsStr, OsString};
use std::fs::{File, Permissions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Plaintext path components, rejecting anything that leaves the tree
fn plain_components(path: &Path) -> Result<Vec<&OsStr>> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(Ok(name)),
            Component::RootDir | Component::CurDir => None,
            Component::ParentDir | Component::Prefix(_) => Some(Err(Error::PermissionViolation(
                format!("{} leaves the tree", path.display()),
            ))),
        })
        .collect()
}

fn errno(code: i32) -> Error {
    Error::Io(io::Error::from_raw_os_error(code))
}

/// `stat` of `name` inside `dir`, ENOENT if it does not exist
fn stat_name(dir: BorrowedFd<'_>, name: &OsStr) -> Result<FileStat> {
    stat_at(dir, name)?.ok_or_else(|| errno(libc::ENOENT))
}

fn is_dir_at(dir: BorrowedFd<'_>, name: &OsStr) -> Result<bool> {
    Ok(stat_at(dir, name)?
        .map_or(false, |st| FileKind::from_mode(st.st_mode as u32) == FileKind::Directory))
}

/// Names inside a directory, without "." and ".."
fn list_names(dir: BorrowedFd<'_>) -> Result<Vec<OsString>> {
    let mut handle = Dir::openat(
        dir,
        ".",
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    let mut names = Vec::new();
    for entry in handle.iter() {
        let entry = entry?;
        let name = OsStr::from_bytes(entry.file_name().to_bytes());
        if name != "." && name != ".." {
            names.push(name.to_os_string());
        }
    }
    Ok(names)
}

impl RootState {
    /// Ciphertext path (relative to the ciphertext directory) of a plaintext
    /// path
    pub fn encrypt_path(&self, path: &Path) -> Result<PathBuf> {
        let ivs = self.dir_ivs().read();
        self.encrypt_path_with(path, |dir| ivs.get_iv(dir))
    }

    fn encrypt_path_with<F>(&self, path: &Path, get_iv: F) -> Result<PathBuf>
    where
        F: Fn(&Path) -> Result<DirIv>,
    {
        let components = plain_components(path)?;
        if self.config().plaintext_names {
            return Ok(components.into_iter().collect());
        }

        let mut cpath = PathBuf::new();
        for name in components {
            let iv = get_iv(&cpath)?;
            cpath.push(self.names().encrypt_name(name, &iv)?);
        }
        Ok(cpath)
    }

    /// Plaintext size of `name` inside `dir`
    fn plain_size(&self, dir: BorrowedFd<'_>, name: &OsStr, st: &FileStat) -> Result<u64> {
        Ok(match FileKind::from_mode(st.st_mode as u32) {
            FileKind::RegularFile => ContentEnc::cipher_size_to_plain_size(st.st_size as u64),
            FileKind::Symlink => {
                let target = readlinkat(dir, name)?;
                self.decrypt_symlink_target(&target)?.len() as u64
            }
            _ => st.st_size as u64,
        })
    }

    /// Attributes of an existing backing node, taking one reference on its
    /// virtual inode once everything else succeeded
    fn referenced_attr(&self, dir: BorrowedFd<'_>, name: &OsStr) -> Result<Attr> {
        let st = stat_name(dir, name)?;
        let size = self.plain_size(dir, name, &st)?;
        let ino = self
            .inomap()
            .virtualize(st.st_dev as u64, st.st_ino as u64);
        Ok(Attr::from_stat(&st, ino, size))
    }

    /// Look up a node, taking one reference on its virtual inode
    ///
    /// Every successful lookup must eventually be balanced by
    /// [`RootState::forget`].
    pub fn lookup(&self, path: &Path) -> Result<Attr> {
        self.check_filtered(path)?;
        let cpath = self.encrypt_path(path)?;
        let (dir, name) = self.cipher_root().open_parent(&cpath)?;
        self.referenced_attr(dir.as_fd(), &name)
    }

    /// Attributes of a node, without taking a reference
    ///
    /// The inode number is the one handed out by a live lookup, or
    /// [`UNKNOWN_INO`](super::inomap::UNKNOWN_INO) if there is none.
    pub fn getattr(&self, path: &Path) -> Result<Attr> {
        self.check_filtered(path)?;
        let cpath = self.encrypt_path(path)?;
        let (dir, name) = self.cipher_root().open_parent(&cpath)?;
        let st = stat_name(dir.as_fd(), &name)?;
        let size = self.plain_size(dir.as_fd(), &name, &st)?;
        let ino = self.inomap().peek_or_unknown(QIno::from_stat(&st));
        Ok(Attr::from_stat(&st, ino, size))
    }

    /// Drop `count` lookup references on a virtual inode
    pub fn forget(&self, ino: u64, count: u64) -> bool {
        self.inomap().forget(ino, count)
    }

    /// Decrypted listing of a directory
    ///
    /// Entries whose names fail to decrypt are skipped and reported as
    /// mitigated corruptions; the listing itself still succeeds. So are
    /// entries removed while the listing is read.
    pub fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        self.check_filtered(path)?;
        let ivs = self.dir_ivs().read();
        let cdir = self.encrypt_path_with(path, |dir| ivs.get_iv(dir))?;
        let plaintext_names = self.config().plaintext_names;
        let iv = if plaintext_names {
            [0u8; crate::crypto::DIRIV_LEN]
        } else {
            ivs.get_iv(&cdir)?
        };
        let is_root = cdir.as_os_str().is_empty();
        let dir = self.cipher_root().open_dir(&cdir)?;

        let mut entries = Vec::new();
        for cname in list_names(dir.as_fd())? {
            if is_root && cname == CONF_DEFAULT_NAME {
                continue;
            }
            if !plaintext_names && cname == DIRIV_FILENAME {
                continue;
            }

            let name = match self.names().decrypt_name(&cname, &iv) {
                Ok(name) => name,
                Err(e) if e.is_corrupt_name() => {
                    warn!("read_dir: skipping entry: {}", e);
                    self.report_mitigated_corruption(&cdir.join(&cname).to_string_lossy());
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(st) = stat_at(dir.as_fd(), &cname)? else {
                debug!("read_dir: {:?} vanished during listing", cname);
                continue;
            };
            entries.push(DirEntry {
                name,
                kind: FileKind::from_mode(st.st_mode as u32),
                ino: self.inomap().peek_or_unknown(QIno::from_stat(&st)),
            });
        }
        Ok(entries)
    }

    /// Create a directory, returning its attributes with one reference taken
    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<Attr> {
        self.check_filtered(path)?;
        let ivs = self.dir_ivs().write();
        let cpath = self.encrypt_path_with(path, |dir| ivs.get_iv(dir))?;
        let (parent, name) = self.cipher_root().open_parent(&cpath)?;

        if self.config().plaintext_names {
            mkdirat(
                parent.as_fd(),
                name.as_os_str(),
                Mode::from_bits_truncate(mode as libc::mode_t),
            )?;
        } else {
            // Owner access is needed to write the IV file
            mkdirat(parent.as_fd(), name.as_os_str(), Mode::S_IRWXU)?;
            let created = ivs.create_iv(&cpath).and_then(|_| {
                let dir = File::from(open_dir_at(parent.as_fd(), &name)?);
                dir.set_permissions(Permissions::from_mode(mode))
                    .map_err(Error::Io)
            });
            if let Err(e) = created {
                warn!("mkdir {}: {}, removing directory", cpath.display(), e);
                if let Ok(dir) = open_dir_at(parent.as_fd(), &name) {
                    let _ = unlinkat(dir.as_fd(), DIRIV_FILENAME, UnlinkatFlags::NoRemoveDir);
                }
                let _ = unlinkat(parent.as_fd(), name.as_os_str(), UnlinkatFlags::RemoveDir);
                ivs.invalidate();
                return Err(e);
            }
        }

        self.referenced_attr(parent.as_fd(), &name)
    }

    /// Remove an empty directory
    pub fn rmdir(&self, path: &Path) -> Result<()> {
        self.check_filtered(path)?;
        let ivs = self.dir_ivs().write();
        let cpath = self.encrypt_path_with(path, |dir| ivs.get_iv(dir))?;
        let (parent, name) = self.cipher_root().open_parent(&cpath)?;

        if self.config().plaintext_names {
            unlinkat(parent.as_fd(), name.as_os_str(), UnlinkatFlags::RemoveDir)?;
            return Ok(());
        }

        let dir = open_dir_at(parent.as_fd(), &name)?;
        if list_names(dir.as_fd())?.iter().any(|n| n != DIRIV_FILENAME) {
            return Err(errno(libc::ENOTEMPTY));
        }
        let iv = ivs.remove_iv(&cpath)?;
        if let Err(e) = unlinkat(parent.as_fd(), name.as_os_str(), UnlinkatFlags::RemoveDir) {
            warn!("rmdir {}: {}, restoring directory IV", cpath.display(), e);
            if let Err(e2) = ivs.set_iv(&cpath, &iv) {
                warn!("rmdir {}: restoring directory IV failed: {}", cpath.display(), e2);
            }
            return Err(e.into());
        }
        debug!("removed directory {}", cpath.display());
        Ok(())
    }

    /// Create and open a new regular file
    pub fn create(self: &Arc<Self>, path: &Path, flags: i32, mode: u32) -> Result<(Attr, OpenFile)> {
        self.check_filtered(path)?;
        let ivs = self.dir_ivs().read();
        let cpath = self.encrypt_path_with(path, |dir| ivs.get_iv(dir))?;
        let (parent, name) = self.cipher_root().open_parent(&cpath)?;

        let new_flags = Self::mangle_open_flags(flags) | libc::O_CREAT | libc::O_EXCL;
        let file = {
            let _guard = self.open_guard();
            self.backing().openat(parent.as_fd(), &name, new_flags, mode)?
        };
        drop(ivs);

        let file = OpenFile::new(Arc::clone(self), file)?;
        let attr = self.referenced_attr(parent.as_fd(), &name)?;
        Ok((attr, file))
    }

    /// Open an existing regular file
    ///
    /// A write-only request on a file without read permission is served by
    /// temporarily granting the owner read access.
    pub fn open(self: &Arc<Self>, path: &Path, flags: i32) -> Result<OpenFile> {
        self.check_filtered(path)?;
        let ivs = self.dir_ivs().read();
        let cpath = self.encrypt_path_with(path, |dir| ivs.get_iv(dir))?;
        let (parent, name) = self.cipher_root().open_parent(&cpath)?;

        let file = self.open_backing(parent.as_fd(), &name, flags)?;
        drop(ivs);
        OpenFile::new(Arc::clone(self), file)
    }

    fn open_backing(&self, dir: BorrowedFd<'_>, cname: &OsStr, flags: i32) -> Result<File> {
        let new_flags = Self::mangle_open_flags(flags);
        let mut guard = self.open_guard();
        match self.backing().openat(dir, cname, new_flags, 0) {
            Ok(file) => Ok(file),
            Err(e)
                if e.raw_os_error() == Some(libc::EACCES)
                    && flags & libc::O_ACCMODE == libc::O_WRONLY =>
            {
                debug!("open: EACCES on write-only open, retrying with relaxed permissions");
                guard.open_write_only_file(dir, cname, new_flags)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Remove a file or symlink
    pub fn unlink(&self, path: &Path) -> Result<()> {
        self.check_filtered(path)?;
        let ivs = self.dir_ivs().read();
        let cpath = self.encrypt_path_with(path, |dir| ivs.get_iv(dir))?;
        let (parent, name) = self.cipher_root().open_parent(&cpath)?;
        unlinkat(parent.as_fd(), name.as_os_str(), UnlinkatFlags::NoRemoveDir)?;
        Ok(())
    }

    /// Move a node. Moving a directory keeps its IV file, so names below it
    /// stay valid.
    ///
    /// A directory may replace an empty directory. In encrypted-names mode
    /// the target still holds its IV file, which is removed first and put
    /// back if the rename fails.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.check_filtered(from)?;
        self.check_filtered(to)?;
        let ivs = self.dir_ivs().write();
        let cfrom = self.encrypt_path_with(from, |dir| ivs.get_iv(dir))?;
        let cto = self.encrypt_path_with(to, |dir| ivs.get_iv(dir))?;
        if cfrom == cto {
            return Ok(());
        }
        let (from_dir, from_name) = self.cipher_root().open_parent(&cfrom)?;
        let (to_dir, to_name) = self.cipher_root().open_parent(&cto)?;

        let mut target_iv = None;
        if !self.config().plaintext_names
            && is_dir_at(from_dir.as_fd(), &from_name)?
            && is_dir_at(to_dir.as_fd(), &to_name)?
        {
            let target = open_dir_at(to_dir.as_fd(), &to_name)?;
            let names = list_names(target.as_fd())?;
            if names.len() == 1 && names[0] == DIRIV_FILENAME {
                target_iv = Some(ivs.remove_iv(&cto)?);
            }
        }

        let renamed = renameat(
            from_dir.as_fd(),
            from_name.as_os_str(),
            to_dir.as_fd(),
            to_name.as_os_str(),
        );
        ivs.invalidate();
        if let Err(e) = renamed {
            if let Some(iv) = target_iv {
                warn!("rename to {}: {}, restoring directory IV", cto.display(), e);
                if let Err(e2) = ivs.set_iv(&cto, &iv) {
                    warn!("rename to {}: restoring directory IV failed: {}", cto.display(), e2);
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Create a symlink at `link` pointing to `target`
    pub fn symlink(&self, target: &OsStr, link: &Path) -> Result<Attr> {
        self.check_filtered(link)?;
        let ivs = self.dir_ivs().read();
        let cpath = self.encrypt_path_with(link, |dir| ivs.get_iv(dir))?;
        let ctarget = self.encrypt_symlink_target(target)?;
        let (parent, name) = self.cipher_root().open_parent(&cpath)?;
        symlinkat(ctarget.as_os_str(), parent.as_fd(), name.as_os_str())?;

        let st = stat_name(parent.as_fd(), &name)?;
        let ino = self
            .inomap()
            .virtualize(st.st_dev as u64, st.st_ino as u64);
        Ok(Attr::from_stat(&st, ino, target.len() as u64))
    }

    /// Plaintext target of a symlink
    pub fn readlink(&self, path: &Path) -> Result<OsString> {
        self.check_filtered(path)?;
        let cpath = self.encrypt_path(path)?;
        let (parent, name) = self.cipher_root().open_parent(&cpath)?;
        let target = readlinkat(parent.as_fd(), name.as_os_str())?;
        self.decrypt_symlink_target(&target)
    }

    /// Change the plaintext size of a file by path
    pub fn truncate(self: &Arc<Self>, path: &Path, size: u64) -> Result<()> {
        self.open(path, libc::O_WRONLY)?.truncate(size)
    }
}
