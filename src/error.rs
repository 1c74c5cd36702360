//! Error types for veilfs
//!
//! Every failure the core can produce maps onto one variant here, and every
//! variant maps onto an errno so the dispatch layer can reply directly.

use thiserror::Error;

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the backing store, passed through verbatim
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A content block or symlink target failed authentication
    #[error("authentication failed: ciphertext is corrupt or was tampered with")]
    AuthenticationFailed,

    /// An encrypted file name could not be decrypted
    #[error("corrupt encrypted name: {0}")]
    CorruptName(String),

    /// File header is missing, truncated or carries an unknown version
    #[error("corrupt file header: {0}")]
    CorruptHeader(String),

    /// The write-only open workaround found a file it must not touch
    #[error("permission invariant violated: {0}")]
    PermissionViolation(String),

    /// Name is reserved for internal control files
    #[error("name is reserved: {0}")]
    ReservedName(String),

    /// Encrypted name exceeds the backing filesystem limit
    #[error("encrypted name too long: {0} bytes")]
    NameTooLong(usize),

    /// Offset lies beyond the addressable block range
    #[error("file offset {0} exceeds the maximum supported file size")]
    FileTooLarge(u64),

    /// Path does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Master key does not match the filesystem
    #[error("wrong master key")]
    WrongKey,

    /// Configuration file could not be read or written
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration values are invalid
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errno to hand back to the kernel for this error
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::AuthenticationFailed
            | Error::CorruptName(_)
            | Error::CorruptHeader(_)
            | Error::WrongKey => libc::EIO,
            Error::PermissionViolation(_) | Error::ReservedName(_) => libc::EPERM,
            Error::NameTooLong(_) => libc::ENAMETOOLONG,
            Error::FileTooLarge(_) => libc::EFBIG,
            Error::NotFound(_) => libc::ENOENT,
            Error::Config(_) | Error::InvalidConfig(_) => libc::EINVAL,
            Error::Internal(_) => libc::EIO,
        }
    }

    /// Whether this error denotes a corrupt single item that can be skipped
    pub fn is_corrupt_name(&self) -> bool {
        matches!(self, Error::CorruptName(_))
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(e.into())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
