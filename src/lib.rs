//! veilfs - Encrypted overlay filesystem core
//!
//! Presents a plaintext view of a ciphertext directory tree. File contents
//! are encrypted block-wise with authenticated encryption, file names are
//! encrypted per directory, and inode numbers of the backing tree are
//! virtualized. Mounting (the FUSE dispatch layer) is left to the caller.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod fsck;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crypto::MasterKey;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{Attr, DirEntry, FileKind, OpenFile, RootState};
}
