//! Fixed 128-byte inode record.
//!
//! Fields are kept exactly as stored: 16-bit uid/gid halves are separate and
//! the block map is fifteen verbatim [`DiskPtr`]s. Interpreting them
//! (combining halves, choosing between `size_high` and `dir_acl`) is the
//! inode manager's job.

use jfs_types::{
    DiskPtr, GOOD_OLD_INODE_SIZE, N_BLOCKS, ParseError, ensure_slice, read_fixed, read_le_u16,
    read_le_u32, write_fixed, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

const BLOCK_MAP_OFFSET: usize = 0x28;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInode {
    pub mode: u16,
    pub uid_low: u16,
    pub size_low: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    /// Deletion time, or the next orphan's inode number while on the orphan list.
    pub dtime: u32,
    pub gid_low: u16,
    pub links_count: u16,
    /// 512-byte sectors charged to this inode.
    pub blocks: u32,
    pub flags: u32,
    pub block: [DiskPtr; N_BLOCKS],
    pub generation: u32,
    pub file_acl: u32,
    /// High 32 bits of the size for regular files, directory ACL otherwise.
    pub size_high: u32,
    pub faddr: u32,
    pub uid_high: u16,
    pub gid_high: u16,
}

impl RawInode {
    pub const SIZE: usize = GOOD_OLD_INODE_SIZE as usize;

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, Self::SIZE)?;

        let mut block = [DiskPtr::HOLE; N_BLOCKS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = DiskPtr::from_disk_bytes(read_fixed::<4>(bytes, BLOCK_MAP_OFFSET + i * 4)?);
        }

        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid_low: read_le_u16(bytes, 0x02)?,
            size_low: read_le_u32(bytes, 0x04)?,
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            gid_low: read_le_u16(bytes, 0x18)?,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            block,
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: read_le_u32(bytes, 0x68)?,
            size_high: read_le_u32(bytes, 0x6C)?,
            faddr: read_le_u32(bytes, 0x70)?,
            uid_high: read_le_u16(bytes, 0x78)?,
            gid_high: read_le_u16(bytes, 0x7A)?,
        })
    }

    /// Encode into the first 128 bytes of `bytes`; trailing bytes of a larger
    /// inode slot are left alone.
    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(bytes, 0, Self::SIZE)?;
        write_le_u16(bytes, 0x00, self.mode)?;
        write_le_u16(bytes, 0x02, self.uid_low)?;
        write_le_u32(bytes, 0x04, self.size_low)?;
        write_le_u32(bytes, 0x08, self.atime)?;
        write_le_u32(bytes, 0x0C, self.ctime)?;
        write_le_u32(bytes, 0x10, self.mtime)?;
        write_le_u32(bytes, 0x14, self.dtime)?;
        write_le_u16(bytes, 0x18, self.gid_low)?;
        write_le_u16(bytes, 0x1A, self.links_count)?;
        write_le_u32(bytes, 0x1C, self.blocks)?;
        write_le_u32(bytes, 0x20, self.flags)?;
        for (i, ptr) in self.block.iter().enumerate() {
            write_fixed(bytes, BLOCK_MAP_OFFSET + i * 4, &ptr.to_disk_bytes())?;
        }
        write_le_u32(bytes, 0x64, self.generation)?;
        write_le_u32(bytes, 0x68, self.file_acl)?;
        write_le_u32(bytes, 0x6C, self.size_high)?;
        write_le_u32(bytes, 0x70, self.faddr)?;
        write_le_u16(bytes, 0x78, self.uid_high)?;
        write_le_u16(bytes, 0x7A, self.gid_high)?;
        Ok(())
    }

    /// The block map viewed as raw bytes, as used by inline symlink targets.
    #[must_use]
    pub fn block_bytes(&self) -> [u8; N_BLOCKS * 4] {
        let mut out = [0_u8; N_BLOCKS * 4];
        for (chunk, ptr) in out.chunks_exact_mut(4).zip(self.block.iter()) {
            chunk.copy_from_slice(&ptr.to_disk_bytes());
        }
        out
    }
}
