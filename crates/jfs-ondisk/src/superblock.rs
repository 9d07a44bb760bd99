//! The primary superblock (1024 bytes at byte offset 1024).

use jfs_types::{
    GOOD_OLD_FIRST_INO, GOOD_OLD_INODE_SIZE, GroupNumber, ParseError, SUPER_MAGIC,
    SUPERBLOCK_SIZE, block_size_from_log, ensure_slice, read_fixed, read_le_u16, read_le_u32,
    trim_nul_padded, write_fixed, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

// ── State and error behaviour ───────────────────────────────────────────────

/// Unmounted cleanly.
pub const STATE_VALID: u16 = 0x0001;
/// Errors detected; an external check is required.
pub const STATE_ERROR: u16 = 0x0002;
/// Orphans being recovered.
pub const STATE_ORPHAN: u16 = 0x0004;

pub const ERRORS_CONTINUE: u16 = 1;
pub const ERRORS_RO: u16 = 2;
pub const ERRORS_PANIC: u16 = 3;

// ── Feature bits ────────────────────────────────────────────────────────────

pub const COMPAT_HAS_JOURNAL: u32 = 0x0004;

pub const RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const RO_COMPAT_LARGE_FILE: u32 = 0x0002;

pub const INCOMPAT_FILETYPE: u32 = 0x0002;
pub const INCOMPAT_RECOVER: u32 = 0x0004;

pub const SUPPORTED_INCOMPAT: u32 = INCOMPAT_FILETYPE | INCOMPAT_RECOVER;
pub const SUPPORTED_RO_COMPAT: u32 = RO_COMPAT_SPARSE_SUPER | RO_COMPAT_LARGE_FILE;

pub const GOOD_OLD_REV: u32 = 0;
pub const DYNAMIC_REV: u32 = 1;

/// Size of one on-disk group descriptor.
pub const GROUP_DESC_SIZE: u32 = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,

    // ── Revision ─────────────────────────────────────────────────────────
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub creator_os: u32,

    // ── Features ─────────────────────────────────────────────────────────
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,

    // ── State & error tracking ───────────────────────────────────────────
    pub state: u16,
    pub errors: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub error_count: u32,

    // ── Timestamps ───────────────────────────────────────────────────────
    pub mtime: u32,
    pub wtime: u32,
    pub lastcheck: u32,
    pub mkfs_time: u32,

    // ── Journal / recovery ───────────────────────────────────────────────
    pub journal_inum: u32,
    pub last_orphan: u32,
}

impl Superblock {
    /// Parse a superblock from a 1024-byte superblock region.
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let rev_level = read_le_u32(region, 0x4C)?;
        let (inode_size, first_ino) = if rev_level == GOOD_OLD_REV {
            (GOOD_OLD_INODE_SIZE, GOOD_OLD_FIRST_INO)
        } else {
            (read_le_u16(region, 0x58)?, read_le_u32(region, 0x54)?)
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            reserved_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size: read_le_u32(region, 0x18)?,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size,
            first_ino,

            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),

            rev_level,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            creator_os: read_le_u32(region, 0x48)?,

            feature_compat: read_le_u32(region, 0x5C)?,
            feature_incompat: read_le_u32(region, 0x60)?,
            feature_ro_compat: read_le_u32(region, 0x64)?,

            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            error_count: read_le_u32(region, 0x194)?,

            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            lastcheck: read_le_u32(region, 0x40)?,
            mkfs_time: read_le_u32(region, 0x108)?,

            journal_inum: read_le_u32(region, 0xE0)?,
            last_orphan: read_le_u32(region, 0xE8)?,
        })
    }

    /// Write every modelled field into `region`, leaving other bytes intact.
    pub fn write_region(&self, region: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(region, 0, SUPERBLOCK_SIZE)?;

        write_le_u32(region, 0x00, self.inodes_count)?;
        write_le_u32(region, 0x04, self.blocks_count)?;
        write_le_u32(region, 0x08, self.reserved_blocks_count)?;
        write_le_u32(region, 0x0C, self.free_blocks_count)?;
        write_le_u32(region, 0x10, self.free_inodes_count)?;
        write_le_u32(region, 0x14, self.first_data_block)?;
        write_le_u32(region, 0x18, self.log_block_size)?;
        // Fragments are the same size as blocks.
        write_le_u32(region, 0x1C, self.log_block_size)?;
        write_le_u32(region, 0x20, self.blocks_per_group)?;
        write_le_u32(region, 0x24, self.blocks_per_group)?;
        write_le_u32(region, 0x28, self.inodes_per_group)?;
        write_le_u32(region, 0x2C, self.mtime)?;
        write_le_u32(region, 0x30, self.wtime)?;
        write_le_u16(region, 0x34, self.mnt_count)?;
        write_le_u16(region, 0x36, self.max_mnt_count)?;
        write_le_u16(region, 0x38, self.magic)?;
        write_le_u16(region, 0x3A, self.state)?;
        write_le_u16(region, 0x3C, self.errors)?;
        write_le_u16(region, 0x3E, self.minor_rev_level)?;
        write_le_u32(region, 0x40, self.lastcheck)?;
        write_le_u32(region, 0x48, self.creator_os)?;
        write_le_u32(region, 0x4C, self.rev_level)?;
        if self.rev_level != GOOD_OLD_REV {
            write_le_u32(region, 0x54, self.first_ino)?;
            write_le_u16(region, 0x58, self.inode_size)?;
        }
        write_le_u32(region, 0x5C, self.feature_compat)?;
        write_le_u32(region, 0x60, self.feature_incompat)?;
        write_le_u32(region, 0x64, self.feature_ro_compat)?;
        write_fixed(region, 0x68, &self.uuid)?;

        let mut name = [0_u8; 16];
        let bytes = self.volume_name.as_bytes();
        let len = bytes.len().min(name.len());
        name[..len].copy_from_slice(&bytes[..len]);
        write_fixed(region, 0x78, &name)?;

        write_le_u32(region, 0xE0, self.journal_inum)?;
        write_le_u32(region, 0xE8, self.last_orphan)?;
        write_le_u32(region, 0x108, self.mkfs_time)?;
        write_le_u32(region, 0x194, self.error_count)?;
        Ok(())
    }

    /// Block size in bytes, if the log field is sane.
    #[must_use]
    pub fn block_size(&self) -> Option<u32> {
        block_size_from_log(self.log_block_size)
    }

    /// Number of block groups (the last one may be short).
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        let data_blocks = self.blocks_count.saturating_sub(self.first_data_block);
        data_blocks.div_ceil(self.blocks_per_group)
    }

    /// First block of the group descriptor table.
    #[must_use]
    pub fn gdt_start_block(&self) -> u32 {
        self.first_data_block + 1
    }

    /// Number of blocks occupied by the group descriptor table.
    #[must_use]
    pub fn gdt_blocks(&self) -> u32 {
        let Some(bs) = self.block_size() else {
            return 0;
        };
        (self.groups_count() * GROUP_DESC_SIZE).div_ceil(bs)
    }

    /// Whether `group` carries a superblock and descriptor-table copy.
    #[must_use]
    pub fn group_has_super(&self, group: GroupNumber) -> bool {
        group_has_super(group, self.has_ro_compat(RO_COMPAT_SPARSE_SUPER))
    }

    #[must_use]
    pub fn has_ro_compat(&self, mask: u32) -> bool {
        self.feature_ro_compat & mask != 0
    }

    #[must_use]
    pub fn has_incompat(&self, mask: u32) -> bool {
        self.feature_incompat & mask != 0
    }

    #[must_use]
    pub fn has_error_state(&self) -> bool {
        self.state & STATE_ERROR != 0
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.state & STATE_VALID != 0
    }

    /// Mount-time validation of geometry and feature bits.
    pub fn validate(&self) -> Result<(), ParseError> {
        let Some(block_size) = self.block_size() else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };
        if !matches!(block_size, 1024 | 2048 | 4096) {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "unsupported block size",
            });
        }
        if self.rev_level > DYNAMIC_REV {
            return Err(ParseError::InvalidField {
                field: "s_rev_level",
                reason: "unknown revision",
            });
        }
        if self.feature_incompat & !SUPPORTED_INCOMPAT != 0 {
            return Err(ParseError::InvalidField {
                field: "s_feature_incompat",
                reason: "unknown incompatible feature bits",
            });
        }
        if self.blocks_per_group == 0 || self.blocks_per_group > block_size * 8 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "must be in 1..=block_size*8",
            });
        }
        if self.inodes_per_group == 0 || self.inodes_per_group > block_size * 8 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "must be in 1..=block_size*8",
            });
        }
        if self.inode_size < GOOD_OLD_INODE_SIZE
            || !self.inode_size.is_power_of_two()
            || u32::from(self.inode_size) > block_size
        {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two in 128..=block_size",
            });
        }
        let expected_first = u32::from(block_size == 1024);
        if self.first_data_block != expected_first {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 1 for 1K blocks and 0 otherwise",
            });
        }
        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "no blocks after first_data_block",
            });
        }
        let max_inodes = u64::from(self.groups_count()) * u64::from(self.inodes_per_group);
        if u64::from(self.inodes_count) > max_inodes {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "inodes_count exceeds groups * inodes_per_group",
            });
        }
        if self.first_ino < GOOD_OLD_FIRST_INO || self.first_ino > self.inodes_count {
            return Err(ParseError::InvalidField {
                field: "s_first_ino",
                reason: "out of range",
            });
        }
        Ok(())
    }
}

/// Backup placement rule: every group without `sparse_super`, otherwise
/// groups 0, 1 and powers of 3, 5 and 7.
#[must_use]
pub fn group_has_super(group: GroupNumber, sparse_super: bool) -> bool {
    if group.0 <= 1 || !sparse_super {
        return true;
    }
    if group.0 & 1 == 0 {
        return false;
    }
    [3_u32, 5, 7]
        .iter()
        .any(|&base| is_power_of(group.0, base))
}

fn is_power_of(mut value: u32, base: u32) -> bool {
    while value > 1 && value % base == 0 {
        value /= base;
    }
    value == 1
}
