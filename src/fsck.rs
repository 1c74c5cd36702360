//! Consistency check of a whole ciphertext tree
//!
//! Walks the plaintext view, decrypting every name, file and symlink target.
//! Directory entries whose names cannot be decrypted never surface in the
//! walk; they arrive through the mitigated-corruption channel instead.

use crate::config::Config;
use crate::crypto::{MasterKey, PLAIN_BLOCK_SIZE};
use crate::error::Result;
use crate::fs::{FileKind, RootState};
use crossbeam_channel::bounded;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Capacity of the mitigated-corruption channel
const FSCK_CHANNEL_CAPACITY: usize = 32;

/// Plaintext bytes decrypted per read
const READ_CHUNK: usize = 64 * PLAIN_BLOCK_SIZE;

/// Outcome of a check
#[derive(Debug, Default)]
pub struct FsckReport {
    pub dirs: usize,
    pub files: usize,
    pub symlinks: usize,
    /// Plaintext paths that failed to decrypt
    pub corrupt: Vec<PathBuf>,
    /// Ciphertext paths skipped by directory listings
    pub mitigated: Vec<String>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.mitigated.is_empty()
    }

    /// Number of problems found
    pub fn errors(&self) -> usize {
        self.corrupt.len() + self.mitigated.len()
    }
}

/// Check every node below `cipherdir`
pub fn fsck(cipherdir: &Path, key: &MasterKey) -> Result<FsckReport> {
    let config = Config::load_from_cipherdir(cipherdir)?;
    let (tx, rx) = bounded::<String>(FSCK_CHANNEL_CAPACITY);
    let root = Arc::new(RootState::new(cipherdir, config, key)?.with_corruption_reporter(tx));

    let collector = std::thread::Builder::new()
        .name("veilfs-fsck".to_string())
        .spawn(move || {
            rx.iter()
                .inspect(|item| warn!("fsck: corrupt entry {}", item))
                .collect::<Vec<_>>()
        })?;

    let mut report = FsckReport::default();
    check_dir(&root, Path::new(""), &mut report);

    // Dropping the last handle on the root closes the channel
    drop(root);
    report.mitigated = collector.join().unwrap_or_default();

    info!(
        "fsck: checked {} directories, {} files, {} symlinks, {} errors",
        report.dirs,
        report.files,
        report.symlinks,
        report.errors()
    );
    Ok(report)
}

fn check_dir(root: &Arc<RootState>, dir: &Path, report: &mut FsckReport) {
    report.dirs += 1;
    let entries = match root.read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("fsck: cannot list {}: {}", dir.display(), e);
            report.corrupt.push(dir.to_path_buf());
            return;
        }
    };

    for entry in entries {
        let path = dir.join(&entry.name);
        match entry.kind {
            FileKind::Directory => check_dir(root, &path, report),
            FileKind::RegularFile => {
                report.files += 1;
                if let Err(e) = check_file(root, &path) {
                    warn!("fsck: file {}: {}", path.display(), e);
                    report.corrupt.push(path);
                }
            }
            FileKind::Symlink => {
                report.symlinks += 1;
                if let Err(e) = root.readlink(&path) {
                    warn!("fsck: symlink {}: {}", path.display(), e);
                    report.corrupt.push(path);
                }
            }
            _ => {}
        }
    }
}

fn check_file(root: &Arc<RootState>, path: &Path) -> Result<()> {
    let file = root.open(path, libc::O_RDONLY)?;
    let size = file.size()?;
    let mut offset = 0;
    while offset < size {
        let chunk = file.read(offset, READ_CHUNK)?;
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len() as u64;
    }
    Ok(())
}
