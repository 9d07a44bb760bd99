//! Serializable summaries for the CLI and for tests.

use jfs_inode::{FileType, Inode};
use jfs_journal::JournalStats;
use jfs_ondisk::Superblock;
use jfs_ondisk::superblock::RO_COMPAT_LARGE_FILE;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Superblock-level state of a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsState {
    Clean,
    /// Mounted, or not unmounted cleanly.
    NotClean,
    /// An inconsistency was recorded; a check is needed.
    Errors,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsReport {
    pub volume_name: String,
    pub uuid: String,
    pub block_size: u32,
    pub blocks_count: u64,
    pub free_blocks: u64,
    pub inodes_count: u64,
    pub free_inodes: u64,
    pub groups: u32,
    pub state: FsState,
    pub mount_count: u16,
    pub error_count: u32,
    /// Head of the on-disk orphan chain (0 when empty).
    pub last_orphan: u32,
    pub large_file: bool,
    /// Only present for a mounted filesystem.
    pub journal: Option<JournalStats>,
}

impl FsReport {
    /// Report built from the superblock alone.
    #[must_use]
    pub fn from_superblock(sb: &Superblock) -> Self {
        let state = if sb.has_error_state() {
            FsState::Errors
        } else if sb.is_clean() {
            FsState::Clean
        } else {
            FsState::NotClean
        };
        Self {
            volume_name: sb.volume_name.clone(),
            uuid: format_uuid(&sb.uuid),
            block_size: sb.block_size().unwrap_or(0),
            blocks_count: u64::from(sb.blocks_count),
            free_blocks: u64::from(sb.free_blocks_count),
            inodes_count: u64::from(sb.inodes_count),
            free_inodes: u64::from(sb.free_inodes_count),
            groups: sb.groups_count(),
            state,
            mount_count: sb.mnt_count,
            error_count: sb.error_count,
            last_orphan: sb.last_orphan,
            large_file: sb.has_ro_compat(RO_COMPAT_LARGE_FILE),
            journal: None,
        }
    }
}

fn format_uuid(uuid: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, byte) in uuid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// One inode as the CLI prints it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeReport {
    pub ino: u64,
    pub file_type: Option<FileType>,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// 512-byte sectors charged, indirect blocks included.
    pub sectors: u64,
    pub links: u16,
    pub flags: u32,
    pub dtime: u32,
    pub generation: u32,
    pub on_orphan_list: bool,
    /// Raw block map; zero is a hole.
    pub block_map: Vec<u32>,
}

impl InodeReport {
    #[must_use]
    pub fn from_inode(inode: &Inode) -> Self {
        let state = inode.snapshot();
        Self {
            ino: inode.ino().0,
            file_type: state.file_type(),
            mode: state.mode,
            uid: state.uid,
            gid: state.gid,
            size: state.size,
            sectors: state.blocks,
            links: state.links_count,
            flags: state.flags,
            dtime: state.dtime,
            generation: state.generation,
            on_orphan_list: inode.is_on_orphan_list(),
            block_map: inode.pointers().iter().map(|ptr| ptr.raw()).collect(),
        }
    }
}
