#![forbid(unsafe_code)]
//! Error types for jfs.
//!
//! # Error Taxonomy
//!
//! jfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `jfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `JfsError` | `jfs-error` (this crate) | Errors returned by the engine, the CLI and API consumers |
//!
//! ## Mapping Policy: ParseError → JfsError
//!
//! `jfs-error` does not depend on `jfs-types`. The conversion happens in
//! `jfs-inode` and `jfs-core`, which know whether the bytes came from a
//! mount-time structure (`Format`) or from live metadata (`Corruption`,
//! carrying the block number).
//!
//! ## Retry is not an error
//!
//! Concurrent modification of an indirect-block chain is resolved inside the
//! block-map code by re-walking the chain. It has no variant here and can
//! never reach a caller.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`JfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `BadInode` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `PermissionDenied` | `EACCES` |
//! | `NotPermitted` | `EPERM` |
//! | `ReadOnly` | `EROFS` |
//! | `FileTooLarge` | `EFBIG` |
//! | `TransactionTooLarge` | `ENOSPC` |
//! | `StaleInode` | `ESTALE` |

use thiserror::Error;

/// Unified error type for all jfs operations.
#[derive(Debug, Error)]
pub enum JfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The in-memory inode was poisoned by an earlier consistency failure.
    ///
    /// Every operation on a poisoned inode fails with this error; nothing
    /// attempts to repair it until the inode is evicted and re-read.
    #[error("inode {ino} is marked bad")]
    BadInode { ino: u64 },

    /// Invalid on-disk format (wrong filesystem type, unknown revision).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without further context.
    #[error("parse error: {0}")]
    Parse(String),

    /// On-disk or requested geometry is invalid.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Caller passed an argument the operation cannot honour.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No free blocks or inodes available.
    #[error("no space left on device")]
    NoSpace,

    /// Inode or other named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Insufficient permissions for the requested operation.
    #[error("permission denied")]
    PermissionDenied,

    /// The inode's append-only or immutable flag forbids the operation.
    #[error("operation not permitted")]
    NotPermitted,

    /// Filesystem is read-only, either by mount option or after a journal abort.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Logical block or size is beyond what the block map can address.
    #[error("file too large")]
    FileTooLarge,

    /// A handle asked for more credits than one transaction can carry.
    #[error("transaction too large: requested {requested} credits, max {max}")]
    TransactionTooLarge { requested: u32, max: u32 },

    /// The inode number refers to an inode that was deleted.
    #[error("stale inode {ino}")]
    StaleInode { ino: u64 },
}

impl JfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive. `TransactionTooLarge` reports `ENOSPC`
    /// because the journal, not the caller, is the exhausted resource.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::BadInode { .. } => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace | Self::TransactionTooLarge { .. } => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::NotPermitted => libc::EPERM,
            Self::ReadOnly => libc::EROFS,
            Self::FileTooLarge => libc::EFBIG,
            Self::StaleInode { .. } => libc::ESTALE,
        }
    }

    /// True for errors that mean the on-disk image is inconsistent.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::BadInode { .. })
    }
}

/// Result alias using `JfsError`.
pub type Result<T> = std::result::Result<T, JfsError>;
