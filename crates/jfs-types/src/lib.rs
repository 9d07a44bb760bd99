#![forbid(unsafe_code)]
//! Shared vocabulary for the jfs workspace.
//!
//! Unit-carrying newtypes for block, inode and group numbers, the
//! little-endian field helpers used by every on-disk parser, and the
//! fixed layout constants of the indirect-block inode format.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const SUPERBLOCK_OFFSET: usize = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const SUPER_MAGIC: u16 = 0xEF53;

/// Minimum on-disk inode record size (revision 0 layout).
pub const GOOD_OLD_INODE_SIZE: u16 = 128;
/// First inode number available to regular files on revision 0 images.
pub const GOOD_OLD_FIRST_INO: u32 = 11;

// ── Block-map layout ────────────────────────────────────────────────────────

/// Number of direct block slots in the inode.
pub const NDIR_BLOCKS: usize = 12;
/// Slot of the single-indirect pointer.
pub const IND_BLOCK: usize = NDIR_BLOCKS;
/// Slot of the double-indirect pointer.
pub const DIND_BLOCK: usize = IND_BLOCK + 1;
/// Slot of the triple-indirect pointer.
pub const TIND_BLOCK: usize = DIND_BLOCK + 1;
/// Total number of block slots stored in the inode.
pub const N_BLOCKS: usize = TIND_BLOCK + 1;
/// Width in bytes of one on-disk block pointer.
pub const POINTER_SIZE: usize = 4;
/// Deepest chain from the inode to a data block (inode slot + three levels).
pub const MAX_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Block group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Logical block index within a file (not a device address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalBlock(pub u64);

/// Validated block size (must be a power of two in 1024..=4096).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1024, 4096].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=4096).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=4096",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size in bytes as a `usize`, for buffer sizing.
    #[must_use]
    pub fn bytes(self) -> usize {
        self.0 as usize
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Number of block pointers held by one indirect block.
    #[must_use]
    pub fn pointers_per_block(self) -> u64 {
        u64::from(self.0) / POINTER_SIZE as u64
    }

    /// `log2(pointers_per_block)`.
    #[must_use]
    pub fn pointers_shift(self) -> u32 {
        self.shift() - POINTER_SIZE.trailing_zeros()
    }

    /// Number of 512-byte sectors covered by one block.
    #[must_use]
    pub fn sectors(self) -> u64 {
        u64::from(self.0 >> 9)
    }

    /// Convert a byte offset to the logical block containing it.
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> LogicalBlock {
        LogicalBlock(byte_offset >> u64::from(self.shift()))
    }

    /// Number of blocks needed to hold `size` bytes (rounded up).
    #[must_use]
    pub fn blocks_for_size(self, size: u64) -> u64 {
        size.div_ceil(u64::from(self.0))
    }

    /// Offset of `byte_offset` within its block.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // masked to below block size
    pub fn offset_in_block(self, byte_offset: u64) -> usize {
        (byte_offset & (u64::from(self.0) - 1)) as usize
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let actual = data.len();
    let end = offset.checked_add(len).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "overflow",
    })?;
    data.get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: actual.saturating_sub(offset),
        })
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_fixed(data: &mut [u8], offset: usize, value: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, value.len())?.copy_from_slice(value);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

#[must_use]
pub fn block_size_from_log(log_block_size: u32) -> Option<u32> {
    let shift = 10_u32.checked_add(log_block_size)?;
    1_u32.checked_shl(shift)
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InodeNumber {
    pub const BAD_BLOCKS: Self = Self(1);
    pub const ROOT: Self = Self(2);
    pub const JOURNAL: Self = Self(8);

    /// Narrow to the 32-bit on-disk representation.
    pub fn to_u32(self) -> Result<u32, ParseError> {
        u32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "inode_number",
        })
    }
}

// ── Block pointers ──────────────────────────────────────────────────────────

/// A block pointer exactly as stored on disk (little-endian 32-bit).
///
/// The tree code copies and compares these without byte-swapping. Only
/// [`DiskPtr::slot`] and [`DiskPtr::get`] convert to a host-order number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskPtr(u32);

impl DiskPtr {
    pub const HOLE: Self = Self(0);

    /// Encode a host-order block number into on-disk order.
    #[must_use]
    pub fn from_block(block: u32) -> Self {
        Self(block.to_le())
    }

    /// Take four bytes copied verbatim from a pointer array.
    #[must_use]
    pub fn from_disk_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_ne_bytes(bytes))
    }

    /// The verbatim on-disk bytes.
    #[must_use]
    pub fn to_disk_bytes(self) -> [u8; 4] {
        self.0.to_ne_bytes()
    }

    /// Raw stored value, for atomic storage.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Host-order block number (0 for a hole).
    #[must_use]
    pub fn get(self) -> u32 {
        u32::from_le(self.0)
    }

    #[must_use]
    pub fn is_hole(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn slot(self) -> Slot {
        if self.is_hole() {
            Slot::Hole
        } else {
            Slot::Allocated(BlockNumber(u64::from(self.get())))
        }
    }
}

/// Decoded content of one block-map slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    Hole,
    Allocated(BlockNumber),
}

impl Slot {
    #[must_use]
    pub fn block(self) -> Option<BlockNumber> {
        match self {
            Self::Hole => None,
            Self::Allocated(block) => Some(block),
        }
    }
}

/// Read pointer `index` out of an indirect block image.
#[inline]
pub fn read_ptr(data: &[u8], index: usize) -> Result<DiskPtr, ParseError> {
    read_fixed::<4>(data, index * POINTER_SIZE).map(DiskPtr::from_disk_bytes)
}

/// Store pointer `index` into an indirect block image.
#[inline]
pub fn write_ptr(data: &mut [u8], index: usize, ptr: DiskPtr) -> Result<(), ParseError> {
    write_fixed(data, index * POINTER_SIZE, &ptr.to_disk_bytes())
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u16 = 0o010_000;
/// Character device.
pub const S_IFCHR: u16 = 0o020_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Block device.
pub const S_IFBLK: u16 = 0o060_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140_000;

// ── Inode flags (i_flags) ───────────────────────────────────────────────────

/// Synchronous updates.
pub const SYNC_FL: u32 = 0x0000_0008;
/// Immutable file.
pub const IMMUTABLE_FL: u32 = 0x0000_0010;
/// Append-only file.
pub const APPEND_FL: u32 = 0x0000_0020;
/// Do not dump.
pub const NODUMP_FL: u32 = 0x0000_0040;
/// Do not update access time.
pub const NOATIME_FL: u32 = 0x0000_0080;
/// File data should be journaled.
pub const JOURNAL_DATA_FL: u32 = 0x0000_4000;
/// Flags a user may change through setattr.
pub const FL_USER_MODIFIABLE: u32 =
    SYNC_FL | IMMUTABLE_FL | APPEND_FL | NODUMP_FL | NOATIME_FL | JOURNAL_DATA_FL;

/// Maximum fast symlink target size (stored in the inode's block slots).
pub const FAST_SYMLINK_MAX: usize = N_BLOCKS * POINTER_SIZE;

// ── Checked arithmetic helpers ──────────────────────────────────────────────

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Subtract a block count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, count: u64) -> Option<Self> {
        self.0.checked_sub(count).map(Self)
    }

    /// Narrow to `u32`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_u32(self) -> Result<u32, ParseError> {
        u32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "block_number",
        })
    }
}

/// Compute the inode's block group from its inode number.
///
/// Inode numbers are 1-indexed; group assignment uses `(ino - 1) / inodes_per_group`.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // group count is u32
pub fn inode_to_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    GroupNumber(((ino.0.saturating_sub(1)) / u64::from(inodes_per_group)) as u32)
}

/// Compute the index of an inode within its block group.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // modulo by u32 always fits in u32
pub fn inode_index_in_group(ino: InodeNumber, inodes_per_group: u32) -> u32 {
    ((ino.0.saturating_sub(1)) % u64::from(inodes_per_group)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let data = [0x34, 0x12, 0x78, 0x56, 0x34, 0x12];
        assert_eq!(read_le_u16(&data, 0).unwrap(), 0x1234);
        assert_eq!(read_le_u32(&data, 2).unwrap(), 0x1234_5678);
        assert!(read_le_u32(&data, 4).is_err());
        assert_eq!(read_fixed::<2>(&data, 4).unwrap(), [0x34, 0x12]);
    }

    #[test]
    fn test_write_helpers() {
        let mut data = [0_u8; 6];
        write_le_u16(&mut data, 0, 0xBEEF).unwrap();
        write_le_u32(&mut data, 2, 0xDEAD_BEEF).unwrap();
        assert_eq!(read_le_u16(&data, 0).unwrap(), 0xBEEF);
        assert_eq!(read_le_u32(&data, 2).unwrap(), 0xDEAD_BEEF);
        assert!(matches!(
            write_le_u32(&mut data, 4, 1),
            Err(ParseError::InsufficientData { needed: 4, .. })
        ));
        assert!(write_fixed(&mut data, usize::MAX, &[1]).is_err());
    }

    #[test]
    fn test_trim_nul_padded() {
        assert_eq!(trim_nul_padded(b"scratch\0\0\0"), "scratch");
        assert_eq!(trim_nul_padded(b"\0\0"), "");
    }

    #[test]
    fn test_block_size_from_log() {
        assert_eq!(block_size_from_log(0), Some(1024));
        assert_eq!(block_size_from_log(2), Some(4096));
        assert_eq!(block_size_from_log(40), None);
    }

    #[test]
    fn test_block_size_validation() {
        assert!(BlockSize::new(1024).is_ok());
        assert!(BlockSize::new(2048).is_ok());
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(512).is_err());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(8192).is_err());
    }

    #[test]
    fn test_block_size_conversions() {
        let bs = BlockSize::new(1024).unwrap();
        assert_eq!(bs.shift(), 10);
        assert_eq!(bs.pointers_per_block(), 256);
        assert_eq!(bs.pointers_shift(), 8);
        assert_eq!(bs.sectors(), 2);
        assert_eq!(bs.byte_to_block(5000), LogicalBlock(4));
        assert_eq!(bs.blocks_for_size(0), 0);
        assert_eq!(bs.blocks_for_size(1), 1);
        assert_eq!(bs.blocks_for_size(2048), 2);
        assert_eq!(bs.offset_in_block(5000), 904);

        let big = BlockSize::new(4096).unwrap();
        assert_eq!(big.pointers_per_block(), 1024);
        assert_eq!(big.pointers_shift(), 10);
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(IND_BLOCK, 12);
        assert_eq!(DIND_BLOCK, 13);
        assert_eq!(TIND_BLOCK, 14);
        assert_eq!(N_BLOCKS, 15);
        assert_eq!(FAST_SYMLINK_MAX, 60);
    }

    #[test]
    fn test_inode_group_math() {
        assert_eq!(inode_to_group(InodeNumber(1), 128), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(128), 128), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(129), 128), GroupNumber(1));
        assert_eq!(inode_index_in_group(InodeNumber(1), 128), 0);
        assert_eq!(inode_index_in_group(InodeNumber(130), 128), 1);
    }

    #[test]
    fn test_checked_ops() {
        assert_eq!(BlockNumber(5).checked_add(3), Some(BlockNumber(8)));
        assert_eq!(BlockNumber(u64::MAX).checked_add(1), None);
        assert_eq!(BlockNumber(0).checked_sub(1), None);
        assert_eq!(BlockNumber(7).to_u32(), Ok(7));
        assert!(BlockNumber(u64::from(u32::MAX) + 1).to_u32().is_err());
        assert!(InodeNumber(u64::MAX).to_u32().is_err());
    }

    #[test]
    fn disk_ptr_keeps_on_disk_order() {
        let ptr = DiskPtr::from_block(0x0102_0304);
        assert_eq!(ptr.to_disk_bytes(), [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(ptr.get(), 0x0102_0304);
        assert_eq!(DiskPtr::from_disk_bytes([0x04, 0x03, 0x02, 0x01]), ptr);
        assert_eq!(DiskPtr::from_raw(ptr.raw()), ptr);
        assert_eq!(ptr.slot(), Slot::Allocated(BlockNumber(0x0102_0304)));
        assert_eq!(DiskPtr::HOLE.slot(), Slot::Hole);
        assert!(DiskPtr::default().is_hole());
        assert_eq!(Slot::Hole.block(), None);
    }

    #[test]
    fn pointer_array_access() {
        let mut block = vec![0_u8; 1024];
        write_ptr(&mut block, 255, DiskPtr::from_block(77)).unwrap();
        assert_eq!(read_ptr(&block, 255).unwrap().get(), 77);
        assert_eq!(&block[1020..], &[77, 0, 0, 0]);
        assert!(read_ptr(&block, 256).is_err());
    }
}
