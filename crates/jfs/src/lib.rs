#![forbid(unsafe_code)]
//! jfs public API facade.
//!
//! Re-exports the mount, format and file-level API from `jfs-core` so
//! downstream consumers (the CLI, embedders) depend on one crate.

pub use jfs_core::*;
