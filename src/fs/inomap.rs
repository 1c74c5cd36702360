//! Inode number virtualization
//!
//! The ciphertext tree may span several backing devices, and inode numbers
//! are only unique per device. Every (device, inode) pair observed is
//! assigned a number from a private counter, so two devices sharing an inode
//! number can never collide and raw backing numbers never leak through.
//!
//! Only references taken by [`InoMap::virtualize`] keep a mapping alive.
//! Attribute and listing paths never allocate; they report the live mapping
//! if there is one and [`UNKNOWN_INO`] otherwise.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nix::sys::stat::FileStat;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// First virtual inode number handed out
pub const FIRST_INO: u64 = 1;

/// Inode number reported for a backing inode nobody holds a reference on
pub const UNKNOWN_INO: u64 = 0xffff_ffff;

/// A backing inode: device id plus inode number on that device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QIno {
    pub dev: u64,
    pub ino: u64,
}

impl QIno {
    pub fn new(dev: u64, ino: u64) -> Self {
        QIno { dev, ino }
    }

    /// Backing inode of a metadata record
    pub fn from_metadata(meta: &Metadata) -> Self {
        QIno {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    /// Backing inode of a `stat` record
    pub fn from_stat(st: &FileStat) -> Self {
        QIno {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
        }
    }
}

#[derive(Debug)]
struct Slot {
    vino: u64,
    refs: u64,
}

/// Maps backing inodes to process-unique virtual inode numbers
pub struct InoMap {
    next_ino: AtomicU64,
    /// Backing inode -> slot. Lock order: `forward` shard before `reverse`.
    forward: DashMap<QIno, Slot>,
    /// Virtual inode -> backing inode, for releasing by virtual number
    reverse: DashMap<u64, QIno>,
}

impl InoMap {
    pub fn new() -> Self {
        InoMap {
            next_ino: AtomicU64::new(FIRST_INO),
            forward: DashMap::new(),
            reverse: DashMap::new(),
        }
    }

    fn slot<'a>(&'a self, q: QIno) -> dashmap::mapref::one::RefMut<'a, QIno, Slot> {
        self.forward.entry(q).or_insert_with(|| {
            let mut vino = self.next_ino.fetch_add(1, Ordering::SeqCst);
            if vino == UNKNOWN_INO {
                vino = self.next_ino.fetch_add(1, Ordering::SeqCst);
            }
            self.reverse.insert(vino, q);
            debug!(dev = q.dev, ino = q.ino, vino, "new virtual inode");
            Slot { vino, refs: 0 }
        })
    }

    /// Virtual inode for a backing inode, taking one reference
    ///
    /// Repeated and concurrent calls for the same pair return the same number.
    pub fn virtualize(&self, dev: u64, ino: u64) -> u64 {
        let mut slot = self.slot(QIno::new(dev, ino));
        slot.refs += 1;
        slot.vino
    }

    /// Virtual inode if the backing inode is currently mapped
    pub fn peek(&self, dev: u64, ino: u64) -> Option<u64> {
        self.forward.get(&QIno::new(dev, ino)).map(|s| s.vino)
    }

    /// Number to report for a backing inode without taking a reference
    pub fn peek_or_unknown(&self, q: QIno) -> u64 {
        self.peek(q.dev, q.ino).unwrap_or(UNKNOWN_INO)
    }

    /// Backing inode of a virtual inode
    pub fn resolve(&self, vino: u64) -> Option<QIno> {
        self.reverse.get(&vino).map(|q| *q)
    }

    /// Drop one reference; the mapping is removed when none remain.
    /// Returns whether the mapping was removed.
    pub fn release(&self, dev: u64, ino: u64) -> bool {
        self.release_n(QIno::new(dev, ino), 1)
    }

    /// Drop `count` references held on a virtual inode (batched forget)
    pub fn forget(&self, vino: u64, count: u64) -> bool {
        match self.resolve(vino) {
            Some(q) => self.release_n(q, count),
            None => {
                warn!(vino, "forget on unknown virtual inode");
                false
            }
        }
    }

    fn release_n(&self, q: QIno, count: u64) -> bool {
        match self.forward.entry(q) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                slot.refs = slot.refs.saturating_sub(count);
                if slot.refs > 0 {
                    return false;
                }
                let slot = entry.remove();
                self.reverse.remove(&slot.vino);
                debug!(dev = q.dev, ino = q.ino, vino = slot.vino, "released virtual inode");
                true
            }
            Entry::Vacant(_) => {
                warn!(dev = q.dev, ino = q.ino, "release of unmapped inode");
                false
            }
        }
    }

    /// Number of live mappings
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

impl Default for InoMap {
    fn default() -> Self {
        Self::new()
    }
}
