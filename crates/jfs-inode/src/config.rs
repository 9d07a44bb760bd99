//! Mount options and transaction sizing.

use jfs_error::{JfsError, Result};
use jfs_journal::JournalConfig;
use jfs_ondisk::superblock::{ERRORS_CONTINUE, ERRORS_PANIC};
use jfs_types::BlockSize;
use serde::{Deserialize, Serialize};

/// How file data is written relative to the metadata that references it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataMode {
    /// Data goes through the journal like metadata.
    Journal,
    /// Data is written before the transaction that references it commits.
    #[default]
    Ordered,
    /// Data is written whenever the cache flushes it.
    Writeback,
}

/// Reaction to a detected filesystem inconsistency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorBehavior {
    /// Record the error and keep going.
    Continue,
    /// Abort the journal; every later update fails with `ReadOnly`.
    #[default]
    RemountReadOnly,
    /// Treated like `RemountReadOnly`; a library never takes the process down.
    Panic,
}

impl ErrorBehavior {
    /// Behavior recorded in the superblock `errors` field.
    #[must_use]
    pub fn from_superblock(raw: u16) -> Self {
        match raw {
            ERRORS_CONTINUE => Self::Continue,
            ERRORS_PANIC => Self::Panic,
            _ => Self::RemountReadOnly,
        }
    }
}

/// Options fixed for the lifetime of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    pub data_mode: DataMode,
    /// `None` uses the behavior stored in the superblock.
    pub errors: Option<ErrorBehavior>,
    /// Commit every write and truncate before returning.
    pub sync: bool,
    pub read_only: bool,
    /// Store only the low 16 bits of uid/gid.
    pub no_uid32: bool,
    /// Mount read-write even though the superblock records errors.
    pub force: bool,
    /// Cap on the block-count term of a truncate transaction.
    pub max_truncate_credits: u32,
    pub journal: JournalConfig,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            data_mode: DataMode::default(),
            errors: None,
            sync: false,
            read_only: false,
            no_uid32: false,
            force: false,
            max_truncate_credits: TransactionBudget::DEFAULT_CAP,
            journal: JournalConfig::default(),
        }
    }
}

/// Journal credit estimates for the operations that open handles.
///
/// The only tunable is `cap`, the largest number of blocks a truncate
/// transaction reserves for freeing. Construction guarantees that no
/// estimate handed out by this type exceeds the journal's per-transaction
/// capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBudget {
    cap: u32,
    journal_capacity: u32,
}

impl TransactionBudget {
    /// Fixed overhead of a truncate: inode, superblock, bitmap, group
    /// descriptor and the boundary data block, with slack.
    pub const DATA_TRANS_BLOCKS: u32 = 8;
    /// A freeing loop with no more than this many credits left extends or
    /// restarts its handle before touching the next bitmap.
    pub const RESERVE_TRANS_BLOCKS: u32 = 12;
    pub const MIN_TRUNCATE_BLOCKS: u32 = 2;
    pub const DEFAULT_CAP: u32 = 64;
    /// Credits for an inode-only update (orphan registration, attribute change).
    pub const INODE_UPDATE: u32 = 3;
    /// Depth of the block map below the inode.
    const INDIRECTS: u32 = 3;

    pub fn new(cap: u32, journal_capacity: u32) -> Result<Self> {
        if cap < Self::MIN_TRUNCATE_BLOCKS {
            return Err(JfsError::InvalidArgument(format!(
                "truncate credit cap {cap} is below {}",
                Self::MIN_TRUNCATE_BLOCKS
            )));
        }
        let worst = (cap + Self::DATA_TRANS_BLOCKS).max(Self::write_credits(true));
        if worst > journal_capacity {
            return Err(JfsError::InvalidArgument(format!(
                "transaction budget needs {worst} credits, journal holds {journal_capacity}"
            )));
        }
        Ok(Self {
            cap,
            journal_capacity,
        })
    }

    #[must_use]
    pub fn cap(&self) -> u32 {
        self.cap
    }

    #[must_use]
    pub fn journal_capacity(&self) -> u32 {
        self.journal_capacity
    }

    /// Credits for one truncate transaction of an inode charged with
    /// `sectors` 512-byte sectors.
    #[must_use]
    pub fn truncate_credits(&self, sectors: u64, block_size: BlockSize) -> u32 {
        let blocks = sectors >> (block_size.shift() - 9);
        let needed = blocks.clamp(u64::from(Self::MIN_TRUNCATE_BLOCKS), u64::from(self.cap));
        // Clamped to `cap`, which is a u32.
        Self::DATA_TRANS_BLOCKS + u32::try_from(needed).unwrap_or(self.cap)
    }

    /// Credits to map and write one block: every level of the map, its
    /// bitmap and descriptor, the inode and the superblock. Journaled data
    /// also needs the data block itself in each transaction it may touch.
    #[must_use]
    pub const fn write_credits(journal_data: bool) -> u32 {
        let per_block = 1 + Self::INDIRECTS;
        if journal_data {
            3 * per_block + 2
        } else {
            2 * per_block + 2
        }
    }

    /// Whether a handle with `remaining` credits should try to grow before
    /// freeing more blocks.
    #[must_use]
    pub fn needs_more(remaining: u32) -> bool {
        remaining <= Self::RESERVE_TRANS_BLOCKS
    }
}
