//! Block group descriptors (32 bytes each, packed after the superblock).

use jfs_types::{ParseError, ensure_slice, read_le_u16, read_le_u32, write_le_u16, write_le_u32};
use serde::{Deserialize, Serialize};

use crate::superblock::GROUP_DESC_SIZE;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDesc {
    pub const SIZE: usize = GROUP_DESC_SIZE as usize;

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, Self::SIZE)?;
        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }

    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(bytes, 0, Self::SIZE)?;
        write_le_u32(bytes, 0x00, self.block_bitmap)?;
        write_le_u32(bytes, 0x04, self.inode_bitmap)?;
        write_le_u32(bytes, 0x08, self.inode_table)?;
        write_le_u16(bytes, 0x0C, self.free_blocks_count)?;
        write_le_u16(bytes, 0x0E, self.free_inodes_count)?;
        write_le_u16(bytes, 0x10, self.used_dirs_count)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_layout() {
        let mut raw = [0_u8; 32];
        raw[0x00..0x04].copy_from_slice(&3_u32.to_le_bytes());
        raw[0x04..0x08].copy_from_slice(&4_u32.to_le_bytes());
        raw[0x08..0x0C].copy_from_slice(&5_u32.to_le_bytes());
        raw[0x0C..0x0E].copy_from_slice(&900_u16.to_le_bytes());
        raw[0x0E..0x10].copy_from_slice(&120_u16.to_le_bytes());
        raw[0x10..0x12].copy_from_slice(&2_u16.to_le_bytes());
        let gd = GroupDesc::parse_from_bytes(&raw).unwrap();
        assert_eq!(
            gd,
            GroupDesc {
                block_bitmap: 3,
                inode_bitmap: 4,
                inode_table: 5,
                free_blocks_count: 900,
                free_inodes_count: 120,
                used_dirs_count: 2,
            }
        );
    }

    #[test]
    fn write_keeps_padding() {
        let mut raw = [0xEE_u8; 32];
        GroupDesc::default().write_to_bytes(&mut raw).unwrap();
        assert_eq!(&raw[0x12..], &[0xEE; 14]);
        assert!(GroupDesc::parse_from_bytes(&raw[..16]).is_err());
    }
}
