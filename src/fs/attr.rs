//! Plaintext view of backing file attributes

use nix::sys::stat::FileStat;
use std::time::{Duration, SystemTime};

/// File type of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// File type bits of an `st_mode`
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => FileKind::Directory,
            m if m == libc::S_IFLNK as u32 => FileKind::Symlink,
            m if m == libc::S_IFBLK as u32 => FileKind::BlockDevice,
            m if m == libc::S_IFCHR as u32 => FileKind::CharDevice,
            m if m == libc::S_IFIFO as u32 => FileKind::Fifo,
            m if m == libc::S_IFSOCK as u32 => FileKind::Socket,
            _ => FileKind::RegularFile,
        }
    }
}

/// Attributes as presented to callers: virtual inode, plaintext size
#[derive(Debug, Clone)]
pub struct Attr {
    pub ino: u64,
    pub kind: FileKind,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs < 0 {
        return SystemTime::UNIX_EPOCH;
    }
    SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs.clamp(0, 999_999_999) as u32)
}

impl Attr {
    /// Build from a backing `stat`; `ino` and `size` are the translated values
    pub fn from_stat(st: &FileStat, ino: u64, size: u64) -> Self {
        Attr {
            ino,
            kind: FileKind::from_mode(st.st_mode as u32),
            size,
            blocks: st.st_blocks as u64,
            atime: system_time(st.st_atime as i64, st.st_atime_nsec as i64),
            mtime: system_time(st.st_mtime as i64, st.st_mtime_nsec as i64),
            ctime: system_time(st.st_ctime as i64, st.st_ctime_nsec as i64),
            perm: (st.st_mode & 0o7777) as u16,
            nlink: st.st_nlink as u32,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev as u32,
            blksize: st.st_blksize as u32,
        }
    }
}

/// One entry of a decrypted directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: std::ffi::OsString,
    pub kind: FileKind,
    pub ino: u64,
}
