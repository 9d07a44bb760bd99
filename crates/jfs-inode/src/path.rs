//! Logical block → block-map path.
//!
//! The fifteen inode slots address four tiers: twelve direct blocks, then
//! one single, one double and one triple indirect tree. A path is the list
//! of slot offsets to follow from the inode down to the data pointer.

use jfs_error::{JfsError, Result};
use jfs_types::{BlockSize, DIND_BLOCK, IND_BLOCK, LogicalBlock, MAX_DEPTH, NDIR_BLOCKS, TIND_BLOCK};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Offsets from the inode to one data pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPath {
    offsets: [usize; MAX_DEPTH],
    depth: usize,
    boundary: bool,
}

impl BlockPath {
    /// One offset per level; the first indexes the inode's slot array.
    #[must_use]
    pub fn offsets(&self) -> &[usize] {
        &self.offsets[..self.depth]
    }

    /// Number of levels, 1 for a direct block.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The target is the last slot of its containing block (or of the
    /// direct array).
    #[must_use]
    pub fn is_boundary(&self) -> bool {
        self.boundary
    }
}

/// Number of logical blocks the whole map can address.
#[must_use]
pub fn addressable_blocks(block_size: BlockSize) -> u64 {
    let ptrs = block_size.pointers_per_block();
    NDIR_BLOCKS as u64 + ptrs + ptrs * ptrs + ptrs * ptrs * ptrs
}

/// Split `block` into per-level offsets.
///
/// Blocks beyond the triple-indirect tier fail with `FileTooLarge`.
pub fn block_to_path(block_size: BlockSize, block: LogicalBlock) -> Result<BlockPath> {
    let ptrs = block_size.pointers_per_block();
    let bits = block_size.pointers_shift();
    let mask = ptrs - 1;
    let direct = NDIR_BLOCKS as u64;
    let double = 1_u64 << (bits * 2);

    let mut offsets = [0_usize; MAX_DEPTH];
    let mut rest = block.0;
    let (depth, last) = 'tier: {
        if rest < direct {
            offsets[0] = slot(rest);
            break 'tier (1, direct);
        }
        rest -= direct;
        if rest < ptrs {
            offsets[0] = IND_BLOCK;
            offsets[1] = slot(rest);
            break 'tier (2, ptrs);
        }
        rest -= ptrs;
        if rest < double {
            offsets[0] = DIND_BLOCK;
            offsets[1] = slot(rest >> bits);
            offsets[2] = slot(rest & mask);
            break 'tier (3, ptrs);
        }
        rest -= double;
        if (rest >> (bits * 2)) < ptrs {
            offsets[0] = TIND_BLOCK;
            offsets[1] = slot(rest >> (bits * 2));
            offsets[2] = slot((rest >> bits) & mask);
            offsets[3] = slot(rest & mask);
            break 'tier (4, ptrs);
        }
        warn!(target: "jfs::tree", block = block.0, "block_beyond_map");
        return Err(JfsError::FileTooLarge);
    };

    Ok(BlockPath {
        offsets,
        depth,
        boundary: (rest & mask) == last - 1,
    })
}

/// Largest file size the map and the 32-bit sector count can describe.
#[must_use]
pub fn max_file_size(block_size: BlockSize) -> u64 {
    let bits = block_size.shift();
    let by_map = addressable_blocks(block_size) << bits;
    // `blocks` is a 32-bit count of 512-byte sectors.
    let by_sectors = (512_u64 << 32) - u64::from(block_size.get());
    by_map.min(by_sectors)
}

#[expect(clippy::cast_possible_truncation)]
fn slot(value: u64) -> usize {
    // Every caller passes a value below the pointers-per-block count.
    value as usize
}
