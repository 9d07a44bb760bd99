#![forbid(unsafe_code)]
//! On-disk format parsing for jfs structures.
//!
//! Pure parsing crate with no I/O. Converts byte slices into typed
//! structures for the superblock, group descriptors and inode records, and
//! writes them back in place so fields this crate does not model survive a
//! round trip untouched.

pub mod group;
pub mod inode;
pub mod superblock;

pub use group::GroupDesc;
pub use inode::RawInode;
pub use superblock::Superblock;
