#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on block/inode bitmaps.
//! 2. **FsGeometry**: group arithmetic derived from the superblock.
//! 3. **GroupStats**: cached per-group counters and metadata locations.
//! 4. **Allocator**: goal-directed block allocation and Orlov-style inode
//!    placement. Every bitmap and descriptor change is made through a
//!    journal [`Handle`].
//!
//! Blocks released by a transaction that has not committed yet are never
//! handed out again until it does. Otherwise a crash could leave the old
//! owner's committed pointer aimed at the new owner's data.

use jfs_block::BufferCache;
use jfs_error::{JfsError, Result};
use jfs_journal::Handle;
use jfs_ondisk::superblock::{GROUP_DESC_SIZE, RO_COMPAT_SPARSE_SUPER, group_has_super};
use jfs_ondisk::{GroupDesc, Superblock};
use jfs_types::{BlockNumber, GroupNumber, InodeNumber};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let free = (0..count).filter(|&idx| !bitmap_get(bitmap, idx)).count();
    u32::try_from(free).unwrap_or(count)
}

/// First clear bit in `start..count`, wrapping to `0..start`, for which
/// `usable` also holds.
pub fn bitmap_find_usable(
    bitmap: &[u8],
    count: u32,
    start: u32,
    mut usable: impl FnMut(u32) -> bool,
) -> Option<u32> {
    let start = start.min(count);
    (start..count)
        .chain(0..start)
        .find(|&idx| !bitmap_get(bitmap, idx) && usable(idx))
}

// ── Filesystem geometry ─────────────────────────────────────────────────────

/// Cached filesystem geometry needed by the allocator and the inode layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGeometry {
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub total_blocks: u64,
    pub total_inodes: u32,
    pub first_data_block: u32,
    pub first_ino: u32,
    pub group_count: u32,
    pub inode_size: u16,
    pub gdt_blocks: u32,
    pub sparse_super: bool,
}

impl FsGeometry {
    /// Derive geometry from a validated superblock.
    pub fn from_superblock(sb: &Superblock) -> Result<Self> {
        let block_size = sb
            .block_size()
            .ok_or_else(|| JfsError::InvalidGeometry("bad s_log_block_size".to_owned()))?;
        if sb.blocks_per_group == 0 || sb.inodes_per_group == 0 || sb.inode_size == 0 {
            return Err(JfsError::InvalidGeometry(
                "zero blocks/inodes per group or inode size".to_owned(),
            ));
        }
        let group_count = sb.groups_count();
        if group_count == 0 {
            return Err(JfsError::InvalidGeometry("no block groups".to_owned()));
        }
        let expected_inodes = u64::from(group_count) * u64::from(sb.inodes_per_group);
        if expected_inodes != u64::from(sb.inodes_count) {
            return Err(JfsError::InvalidGeometry(format!(
                "inodes_count {} != {group_count} groups * {} inodes",
                sb.inodes_count, sb.inodes_per_group
            )));
        }
        Ok(Self {
            block_size,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            total_blocks: u64::from(sb.blocks_count),
            total_inodes: sb.inodes_count,
            first_data_block: sb.first_data_block,
            first_ino: sb.first_ino,
            group_count,
            inode_size: sb.inode_size,
            gdt_blocks: sb.gdt_blocks(),
            sparse_super: sb.has_ro_compat(RO_COMPAT_SPARSE_SUPER),
        })
    }

    /// First block of `group`.
    #[must_use]
    pub fn group_first_block(&self, group: GroupNumber) -> BlockNumber {
        BlockNumber(
            u64::from(self.first_data_block)
                + u64::from(group.0) * u64::from(self.blocks_per_group),
        )
    }

    /// Number of blocks in a specific group (last group may be shorter).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let remaining = self
            .total_blocks
            .saturating_sub(self.group_first_block(group).0);
        if remaining >= u64::from(self.blocks_per_group) {
            self.blocks_per_group
        } else {
            remaining as u32
        }
    }

    /// Absolute block number for a relative block within a group.
    #[must_use]
    pub fn group_block_to_absolute(&self, group: GroupNumber, rel_block: u32) -> BlockNumber {
        BlockNumber(self.group_first_block(group).0 + u64::from(rel_block))
    }

    /// Convert absolute block to (group, relative_block).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn absolute_to_group_block(&self, block: BlockNumber) -> (GroupNumber, u32) {
        let rel = block.0.saturating_sub(u64::from(self.first_data_block));
        let group = (rel / u64::from(self.blocks_per_group)) as u32;
        let offset = (rel % u64::from(self.blocks_per_group)) as u32;
        (GroupNumber(group), offset)
    }

    /// Whether `block` lies inside the data area of the device.
    #[must_use]
    pub fn contains_block(&self, block: BlockNumber) -> bool {
        block.0 >= u64::from(self.first_data_block) && block.0 < self.total_blocks
    }

    /// Blocks occupied by one group's inode table.
    #[must_use]
    pub fn inode_table_blocks(&self) -> u32 {
        (self.inodes_per_group * u32::from(self.inode_size)).div_ceil(self.block_size)
    }

    #[must_use]
    pub fn gdt_start(&self) -> BlockNumber {
        BlockNumber(u64::from(self.first_data_block) + 1)
    }

    #[must_use]
    pub fn group_has_super(&self, group: GroupNumber) -> bool {
        group_has_super(group, self.sparse_super)
    }

    /// Blocks at the start of `group` holding a superblock and descriptor
    /// table copy (zero for groups without a backup).
    #[must_use]
    pub fn super_blocks_in_group(&self, group: GroupNumber) -> u32 {
        if self.group_has_super(group) {
            1 + self.gdt_blocks
        } else {
            0
        }
    }

    /// Descriptor-table block and byte offset holding `group`'s descriptor.
    #[must_use]
    pub fn group_desc_location(&self, group: GroupNumber) -> (BlockNumber, usize) {
        let per_block = self.block_size / GROUP_DESC_SIZE;
        let block = self.gdt_start().0 + u64::from(group.0 / per_block);
        let offset = (group.0 % per_block) * GROUP_DESC_SIZE;
        (BlockNumber(block), offset as usize)
    }

    /// (group, index within group) of an inode number.
    #[must_use]
    pub fn inode_group(&self, ino: InodeNumber) -> (GroupNumber, u32) {
        (
            jfs_types::inode_to_group(ino, self.inodes_per_group),
            jfs_types::inode_index_in_group(ino, self.inodes_per_group),
        )
    }

    /// Standard placement of a group's metadata: optional superblock and
    /// descriptor copy, block bitmap, inode bitmap, inode table.
    #[must_use]
    pub fn default_layout(&self, group: GroupNumber) -> GroupStats {
        let first = self.group_first_block(group).0;
        let block_bitmap = first + u64::from(self.super_blocks_in_group(group));
        let inode_table = block_bitmap + 2;
        let used = self.super_blocks_in_group(group) + 2 + self.inode_table_blocks();
        GroupStats {
            group,
            free_blocks: self.blocks_in_group(group).saturating_sub(used),
            free_inodes: self.inodes_per_group,
            used_dirs: 0,
            block_bitmap: BlockNumber(block_bitmap),
            inode_bitmap: BlockNumber(block_bitmap + 1),
            inode_table: BlockNumber(inode_table),
        }
    }
}

// ── Group stats ─────────────────────────────────────────────────────────────

/// Cached per-group statistics loaded from group descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    pub group: GroupNumber,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub used_dirs: u32,
    pub block_bitmap: BlockNumber,
    pub inode_bitmap: BlockNumber,
    pub inode_table: BlockNumber,
}

impl GroupStats {
    #[must_use]
    pub fn from_group_desc(group: GroupNumber, gd: &GroupDesc) -> Self {
        Self {
            group,
            free_blocks: u32::from(gd.free_blocks_count),
            free_inodes: u32::from(gd.free_inodes_count),
            used_dirs: u32::from(gd.used_dirs_count),
            block_bitmap: BlockNumber(u64::from(gd.block_bitmap)),
            inode_bitmap: BlockNumber(u64::from(gd.inode_bitmap)),
            inode_table: BlockNumber(u64::from(gd.inode_table)),
        }
    }

    pub fn to_group_desc(&self) -> Result<GroupDesc> {
        let narrow = |value: u32, field: &str| {
            u16::try_from(value).map_err(|_| {
                JfsError::InvalidGeometry(format!("group {} {field} {value} exceeds u16", self.group.0))
            })
        };
        let block = |block: BlockNumber| {
            block
                .to_u32()
                .map_err(|e| JfsError::InvalidGeometry(e.to_string()))
        };
        Ok(GroupDesc {
            block_bitmap: block(self.block_bitmap)?,
            inode_bitmap: block(self.inode_bitmap)?,
            inode_table: block(self.inode_table)?,
            free_blocks_count: narrow(self.free_blocks, "free_blocks")?,
            free_inodes_count: narrow(self.free_inodes, "free_inodes")?,
            used_dirs_count: narrow(self.used_dirs, "used_dirs")?,
        })
    }

    /// Half-open block ranges of this group's metadata.
    fn system_zones(&self, geo: &FsGeometry) -> [(u64, u64); 4] {
        let first = geo.group_first_block(self.group).0;
        let table = self.inode_table.0;
        [
            (first, first + u64::from(geo.super_blocks_in_group(self.group))),
            (self.block_bitmap.0, self.block_bitmap.0 + 1),
            (self.inode_bitmap.0, self.inode_bitmap.0 + 1),
            (table, table + u64::from(geo.inode_table_blocks())),
        ]
    }

    fn overlaps_system_zone(&self, geo: &FsGeometry, start: u64, end: u64) -> bool {
        self.system_zones(geo)
            .iter()
            .any(|&(lo, hi)| lo < hi && start < hi && lo < end)
    }
}

/// Aggregate counters for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocTotals {
    pub free_blocks: u64,
    pub free_inodes: u64,
    pub used_dirs: u64,
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Journaled block and inode allocator over the cached group descriptors.
pub struct Allocator {
    cache: Arc<BufferCache>,
    geo: FsGeometry,
    groups: Mutex<Vec<GroupStats>>,
    /// Blocks freed by a transaction that may not have committed yet.
    pending_frees: Mutex<BTreeMap<BlockNumber, u64>>,
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("geo", &self.geo)
            .field("pending_frees", &self.pending_frees.lock().len())
            .finish_non_exhaustive()
    }
}

impl Allocator {
    /// Read and check every group descriptor.
    pub fn load(cache: Arc<BufferCache>, geo: FsGeometry) -> Result<Self> {
        let mut groups = Vec::with_capacity(geo.group_count as usize);
        for g in 0..geo.group_count {
            let group = GroupNumber(g);
            let (block, offset) = geo.group_desc_location(group);
            let buf = cache.read(block)?;
            let gd = GroupDesc::parse_from_bytes(&buf.read()[offset..])
                .map_err(|e| JfsError::Format(format!("group descriptor {g}: {e}")))?;
            let stats = GroupStats::from_group_desc(group, &gd);
            check_descriptor(&geo, &stats)?;
            groups.push(stats);
        }
        debug!(
            target: "jfs::alloc",
            groups = groups.len(),
            free_blocks = groups.iter().map(|g| u64::from(g.free_blocks)).sum::<u64>(),
            "allocator_loaded"
        );
        Ok(Self {
            cache,
            geo,
            groups: Mutex::new(groups),
            pending_frees: Mutex::new(BTreeMap::new()),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    #[must_use]
    pub fn group_stats(&self) -> Vec<GroupStats> {
        self.groups.lock().clone()
    }

    #[must_use]
    pub fn totals(&self) -> AllocTotals {
        let groups = self.groups.lock();
        AllocTotals {
            free_blocks: groups.iter().map(|g| u64::from(g.free_blocks)).sum(),
            free_inodes: groups.iter().map(|g| u64::from(g.free_inodes)).sum(),
            used_dirs: groups.iter().map(|g| u64::from(g.used_dirs)).sum(),
        }
    }

    /// Blocks waiting for their freeing transaction to commit.
    #[must_use]
    pub fn pending_free_count(&self) -> usize {
        self.pending_frees.lock().len()
    }

    /// Whether any block of `start..start + count` is group metadata or
    /// outside the data area.
    #[must_use]
    pub fn is_system_zone(&self, start: BlockNumber, count: u64) -> bool {
        let groups = self.groups.lock();
        self.range_hits_system_zone(&groups, start, count)
    }

    fn range_hits_system_zone(&self, groups: &[GroupStats], start: BlockNumber, count: u64) -> bool {
        let Some(end) = start.0.checked_add(count) else {
            return true;
        };
        if !self.geo.contains_block(start) || end > self.geo.total_blocks {
            return true;
        }
        let mut block = start.0;
        while block < end {
            let (group, _) = self.geo.absolute_to_group_block(BlockNumber(block));
            let Some(gs) = groups.get(group.0 as usize) else {
                return true;
            };
            let group_end = self.group_end(group).min(end);
            if gs.overlaps_system_zone(&self.geo, block, group_end) {
                return true;
            }
            block = group_end;
        }
        false
    }

    fn group_end(&self, group: GroupNumber) -> u64 {
        self.geo.group_first_block(group).0 + u64::from(self.geo.blocks_in_group(group))
    }

    /// Whether the block bitmap marks `block` allocated.
    pub fn block_in_use(&self, block: BlockNumber) -> Result<bool> {
        if !self.geo.contains_block(block) {
            return Ok(false);
        }
        let (group, rel) = self.geo.absolute_to_group_block(block);
        let bitmap_block = self.group(group)?.block_bitmap;
        let buf = self.cache.read(bitmap_block)?;
        let used = bitmap_get(&buf.read(), rel);
        Ok(used)
    }

    /// Whether the inode bitmap marks `ino` allocated.
    pub fn inode_in_use(&self, ino: InodeNumber) -> Result<bool> {
        if ino.0 == 0 || ino.0 > u64::from(self.geo.total_inodes) {
            return Ok(false);
        }
        let (group, index) = self.geo.inode_group(ino);
        let bitmap_block = self.group(group)?.inode_bitmap;
        let buf = self.cache.read(bitmap_block)?;
        let used = bitmap_get(&buf.read(), index);
        Ok(used)
    }

    /// Inode-table block and byte offset of `ino`'s on-disk record.
    pub fn inode_location(&self, ino: InodeNumber) -> Result<(BlockNumber, usize)> {
        if ino.0 == 0 || ino.0 > u64::from(self.geo.total_inodes) {
            return Err(JfsError::BadInode { ino: ino.0 });
        }
        let (group, index) = self.geo.inode_group(ino);
        let table = self.group(group)?.inode_table;
        let byte = u64::from(index) * u64::from(self.geo.inode_size);
        let block_size = u64::from(self.geo.block_size);
        let offset = usize::try_from(byte % block_size)
            .map_err(|_| JfsError::InvalidGeometry("inode offset".to_owned()))?;
        Ok((BlockNumber(table.0 + byte / block_size), offset))
    }

    fn group(&self, group: GroupNumber) -> Result<GroupStats> {
        self.groups
            .lock()
            .get(group.0 as usize)
            .copied()
            .ok_or_else(|| JfsError::Corruption {
                block: 0,
                detail: format!("group {} out of range", group.0),
            })
    }

    // ── Blocks ──────────────────────────────────────────────────────────────

    /// Allocate one block as close to `goal` as possible.
    ///
    /// Strategy:
    /// 1. The goal block itself, then forward through the goal group.
    /// 2. Groups within 8 of the goal group.
    /// 3. Every other group.
    pub fn new_block(&self, handle: &mut Handle<'_>, goal: BlockNumber) -> Result<BlockNumber> {
        let committed = handle.journal().committed_tid();
        let goal = if self.geo.contains_block(goal) {
            goal
        } else {
            BlockNumber(u64::from(self.geo.first_data_block))
        };
        let (goal_group, goal_offset) = self.geo.absolute_to_group_block(goal);

        let mut groups = self.groups.lock();
        self.pending_frees.lock().retain(|_, tid| *tid > committed);
        for group in search_order(goal_group, self.geo.group_count) {
            let start = if group == goal_group { goal_offset } else { 0 };
            if let Some(block) = self.try_alloc_in_group(handle, &mut groups, group, start)? {
                trace!(
                    target: "jfs::alloc",
                    goal = goal.0,
                    block = block.0,
                    hit = block == goal,
                    "block_allocated"
                );
                return Ok(block);
            }
        }
        drop(groups);
        warn!(target: "jfs::alloc", goal = goal.0, "no_free_blocks");
        Err(JfsError::NoSpace)
    }

    fn try_alloc_in_group(
        &self,
        handle: &mut Handle<'_>,
        groups: &mut [GroupStats],
        group: GroupNumber,
        start: u32,
    ) -> Result<Option<BlockNumber>> {
        let gidx = group.0 as usize;
        let Some(gs) = groups.get(gidx).copied() else {
            return Ok(None);
        };
        if gs.free_blocks == 0 {
            return Ok(None);
        }
        let first = self.geo.group_first_block(group).0;
        let bitmap = self.cache.read(gs.block_bitmap)?;
        let found = {
            let pending = self.pending_frees.lock();
            let bits = bitmap.read();
            bitmap_find_usable(&bits, self.geo.blocks_in_group(group), start, |rel| {
                !pending.contains_key(&BlockNumber(first + u64::from(rel)))
            })
        };
        let Some(rel) = found else {
            return Ok(None);
        };
        let block = BlockNumber(first + u64::from(rel));
        if gs.overlaps_system_zone(&self.geo, block.0, block.0 + 1) {
            error!(target: "jfs::alloc", block = block.0, group = group.0, "allocating_system_zone_block");
            return Err(JfsError::Corruption {
                block: block.0,
                detail: format!("group {} bitmap marks its own metadata free", group.0),
            });
        }

        handle.get_write_access(&bitmap)?;
        bitmap_set(&mut bitmap.write(), rel);
        handle.dirty_metadata(&bitmap)?;
        groups[gidx].free_blocks -= 1;
        self.write_group_desc(handle, &groups[gidx])?;
        Ok(Some(block))
    }

    /// Release `count` blocks starting at `start`.
    ///
    /// The range may cross group boundaries. Metadata blocks and blocks
    /// outside the data area are refused without touching any bitmap. Bits
    /// already clear are reported as `Corruption` after the rest of the
    /// range has been released.
    pub fn free_blocks(&self, handle: &mut Handle<'_>, start: BlockNumber, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let tid = handle.tid();
        let mut groups = self.groups.lock();
        if self.range_hits_system_zone(&groups, start, count) {
            drop(groups);
            error!(target: "jfs::alloc", block = start.0, count, "freeing_system_zone");
            return Err(JfsError::Corruption {
                block: start.0,
                detail: format!("freeing {count} block(s) in system zone or outside data area"),
            });
        }

        let end = start.0 + count;
        let mut already_free = 0_u64;
        let mut block = start.0;
        while block < end {
            let (group, _) = self.geo.absolute_to_group_block(BlockNumber(block));
            let gidx = group.0 as usize;
            let group_end = self.group_end(group).min(end);
            let bitmap = self.cache.read(groups[gidx].block_bitmap)?;
            handle.get_write_access(&bitmap)?;
            let mut freed = 0_u32;
            {
                let mut bits = bitmap.write();
                let mut pending = self.pending_frees.lock();
                for abs in block..group_end {
                    let (_, bit) = self.geo.absolute_to_group_block(BlockNumber(abs));
                    if bitmap_get(&bits, bit) {
                        bitmap_clear(&mut bits, bit);
                        pending.insert(BlockNumber(abs), tid);
                        freed += 1;
                    } else {
                        already_free += 1;
                        error!(target: "jfs::alloc", block = abs, "bit_already_cleared");
                    }
                }
            }
            handle.dirty_metadata(&bitmap)?;
            groups[gidx].free_blocks += freed;
            self.write_group_desc(handle, &groups[gidx])?;
            block = group_end;
        }
        drop(groups);
        trace!(target: "jfs::alloc", block = start.0, count, tid, "blocks_freed");

        if already_free > 0 {
            return Err(JfsError::Corruption {
                block: start.0,
                detail: format!("{already_free} block(s) already free in bitmap"),
            });
        }
        Ok(())
    }

    // ── Inodes ──────────────────────────────────────────────────────────────

    /// Allocate an inode.
    ///
    /// - Directories: spread across groups (above-average free inodes and
    ///   free blocks, fewest directories).
    /// - Files: co-locate with the parent directory's group.
    pub fn new_inode(
        &self,
        handle: &mut Handle<'_>,
        parent_group: GroupNumber,
        is_directory: bool,
    ) -> Result<InodeNumber> {
        let mut groups = self.groups.lock();
        let target = if is_directory {
            orlov_choose_group_for_dir(&groups)?
        } else {
            parent_group
        };
        for group in search_order(target, self.geo.group_count) {
            if let Some(ino) = self.try_alloc_inode_in_group(handle, &mut groups, group, is_directory)? {
                debug!(target: "jfs::alloc", ino = ino.0, group = group.0, is_directory, "inode_allocated");
                return Ok(ino);
            }
        }
        Err(JfsError::NoSpace)
    }

    fn try_alloc_inode_in_group(
        &self,
        handle: &mut Handle<'_>,
        groups: &mut [GroupStats],
        group: GroupNumber,
        is_directory: bool,
    ) -> Result<Option<InodeNumber>> {
        let gidx = group.0 as usize;
        let Some(gs) = groups.get(gidx).copied() else {
            return Ok(None);
        };
        if gs.free_inodes == 0 {
            return Ok(None);
        }
        // Inodes below first_ino are reserved and live in group 0.
        let first_usable = if group.0 == 0 {
            self.geo.first_ino.saturating_sub(1)
        } else {
            0
        };
        let bitmap = self.cache.read(gs.inode_bitmap)?;
        let found = {
            let bits = bitmap.read();
            (first_usable..self.geo.inodes_per_group).find(|&idx| !bitmap_get(&bits, idx))
        };
        let Some(idx) = found else {
            return Ok(None);
        };

        handle.get_write_access(&bitmap)?;
        bitmap_set(&mut bitmap.write(), idx);
        handle.dirty_metadata(&bitmap)?;
        groups[gidx].free_inodes -= 1;
        if is_directory {
            groups[gidx].used_dirs += 1;
        }
        self.write_group_desc(handle, &groups[gidx])?;

        let ino = u64::from(group.0) * u64::from(self.geo.inodes_per_group) + u64::from(idx) + 1;
        Ok(Some(InodeNumber(ino)))
    }

    /// Release an inode number.
    pub fn free_inode(&self, handle: &mut Handle<'_>, ino: InodeNumber, is_directory: bool) -> Result<()> {
        if ino.0 < u64::from(self.geo.first_ino) || ino.0 > u64::from(self.geo.total_inodes) {
            error!(target: "jfs::alloc", ino = ino.0, "freeing_reserved_or_nonexistent_inode");
            return Err(JfsError::Corruption {
                block: 0,
                detail: format!("freeing reserved or nonexistent inode {}", ino.0),
            });
        }
        let (group, index) = self.geo.inode_group(ino);
        let gidx = group.0 as usize;
        let mut groups = self.groups.lock();
        let bitmap = self.cache.read(groups[gidx].inode_bitmap)?;
        if !bitmap_get(&bitmap.read(), index) {
            drop(groups);
            error!(target: "jfs::alloc", ino = ino.0, "inode_bit_already_cleared");
            return Err(JfsError::Corruption {
                block: bitmap.block().0,
                detail: format!("bit already cleared for inode {}", ino.0),
            });
        }
        handle.get_write_access(&bitmap)?;
        bitmap_clear(&mut bitmap.write(), index);
        handle.dirty_metadata(&bitmap)?;
        groups[gidx].free_inodes += 1;
        if is_directory {
            groups[gidx].used_dirs = groups[gidx].used_dirs.saturating_sub(1);
        }
        self.write_group_desc(handle, &groups[gidx])?;
        drop(groups);
        debug!(target: "jfs::alloc", ino = ino.0, "inode_freed");
        Ok(())
    }

    /// Patch `stats`' counters into its on-disk descriptor.
    fn write_group_desc(&self, handle: &mut Handle<'_>, stats: &GroupStats) -> Result<()> {
        let (block, offset) = self.geo.group_desc_location(stats.group);
        let buf = self.cache.read(block)?;
        handle.get_write_access(&buf)?;
        {
            let mut data = buf.write();
            let existing = GroupDesc::parse_from_bytes(&data[offset..]).map_err(|e| {
                JfsError::Corruption {
                    block: block.0,
                    detail: format!("group descriptor {}: {e}", stats.group.0),
                }
            })?;
            let updated = GroupDesc {
                free_blocks_count: u16::try_from(stats.free_blocks).unwrap_or(u16::MAX),
                free_inodes_count: u16::try_from(stats.free_inodes).unwrap_or(u16::MAX),
                used_dirs_count: u16::try_from(stats.used_dirs).unwrap_or(u16::MAX),
                ..existing
            };
            updated
                .write_to_bytes(&mut data[offset..])
                .map_err(|e| JfsError::Corruption {
                    block: block.0,
                    detail: format!("group descriptor {}: {e}", stats.group.0),
                })?;
        }
        handle.dirty_metadata(&buf)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Goal group, then groups within 8 of it, then every remaining group.
fn search_order(goal: GroupNumber, group_count: u32) -> Vec<GroupNumber> {
    let mut order = Vec::with_capacity(group_count as usize);
    let mut push = |g: u32| {
        let group = GroupNumber(g);
        if g < group_count && !order.contains(&group) {
            order.push(group);
        }
    };
    push(goal.0);
    for delta in 1..=8_u32 {
        push(goal.0.saturating_add(delta));
        if let Some(g) = goal.0.checked_sub(delta) {
            push(g);
        }
    }
    for g in 0..group_count {
        push(g);
    }
    order
}

/// Orlov: choose a group for a new directory.
fn orlov_choose_group_for_dir(groups: &[GroupStats]) -> Result<GroupNumber> {
    if groups.is_empty() {
        return Err(JfsError::NoSpace);
    }
    let n = groups.len() as u64;
    let avg_free_inodes = groups.iter().map(|g| u64::from(g.free_inodes)).sum::<u64>() / n;
    let avg_free_blocks = groups.iter().map(|g| u64::from(g.free_blocks)).sum::<u64>() / n;

    let best = groups
        .iter()
        .filter(|gs| gs.free_inodes > 0)
        .filter(|gs| u64::from(gs.free_inodes) >= avg_free_inodes)
        .filter(|gs| u64::from(gs.free_blocks) >= avg_free_blocks)
        .min_by_key(|gs| (gs.used_dirs, gs.group));
    if let Some(gs) = best {
        return Ok(gs.group);
    }
    // Fallback: any group with free inodes.
    groups
        .iter()
        .find(|gs| gs.free_inodes > 0)
        .map(|gs| gs.group)
        .ok_or(JfsError::NoSpace)
}

/// Mount-time sanity check of one descriptor's metadata locations.
fn check_descriptor(geo: &FsGeometry, gs: &GroupStats) -> Result<()> {
    let first = geo.group_first_block(gs.group).0;
    let end = first + u64::from(geo.blocks_in_group(gs.group));
    let inside = |block: u64, len: u64| block >= first && block + len <= end;
    let table_len = u64::from(geo.inode_table_blocks());
    let checks = [
        ("block bitmap", gs.block_bitmap.0, 1),
        ("inode bitmap", gs.inode_bitmap.0, 1),
        ("inode table", gs.inode_table.0, table_len),
    ];
    for (what, block, len) in checks {
        if !inside(block, len) {
            return Err(JfsError::Format(format!(
                "{what} for group {} not in group (block {block})",
                gs.group.0
            )));
        }
    }
    if gs.free_blocks > geo.blocks_in_group(gs.group) || gs.free_inodes > geo.inodes_per_group {
        return Err(JfsError::Format(format!(
            "group {} free counts exceed group size",
            gs.group.0
        )));
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use jfs_block::{ByteBlockDevice, MemByteDevice};
    use jfs_journal::{Journal, JournalConfig};

    const BLOCK_SIZE: u32 = 1024;

    fn make_geometry() -> FsGeometry {
        FsGeometry {
            block_size: BLOCK_SIZE,
            blocks_per_group: 256,
            inodes_per_group: 32,
            total_blocks: 1024,
            total_inodes: 128,
            first_data_block: 1,
            first_ino: 11,
            group_count: 4,
            inode_size: 128,
            gdt_blocks: 1,
            sparse_super: true,
        }
    }

    /// Lay out bitmaps and descriptors the way mkfs does.
    fn format_groups(cache: &BufferCache, geo: &FsGeometry) {
        let gdt = cache.read(geo.gdt_start()).unwrap();
        for g in 0..geo.group_count {
            let group = GroupNumber(g);
            let mut stats = geo.default_layout(group);
            let bitmap = cache.read(stats.block_bitmap).unwrap();
            {
                let mut bits = bitmap.write();
                let first = geo.group_first_block(group).0;
                for zone in stats.system_zones(geo) {
                    for b in zone.0..zone.1 {
                        bitmap_set(&mut bits, u32::try_from(b - first).unwrap());
                    }
                }
                for pad in geo.blocks_in_group(group)..BLOCK_SIZE * 8 {
                    bitmap_set(&mut bits, pad);
                }
            }
            cache.write_back(&bitmap).unwrap();
            let inodes = cache.read(stats.inode_bitmap).unwrap();
            if g == 0 {
                let mut bits = inodes.write();
                for idx in 0..geo.first_ino - 1 {
                    bitmap_set(&mut bits, idx);
                }
                stats.free_inodes -= geo.first_ino - 1;
            }
            cache.write_back(&inodes).unwrap();
            let (_, offset) = geo.group_desc_location(group);
            stats
                .to_group_desc()
                .unwrap()
                .write_to_bytes(&mut gdt.write()[offset..])
                .unwrap();
        }
        cache.write_back(&gdt).unwrap();
    }

    struct Fixture {
        mem: MemByteDevice,
        journal: Journal,
        alloc: Allocator,
    }

    fn fixture() -> Fixture {
        let geo = make_geometry();
        let mem = MemByteDevice::new(BLOCK_SIZE as usize * 1024);
        let dev = ByteBlockDevice::new(mem.clone(), BLOCK_SIZE).unwrap();
        let cache = Arc::new(BufferCache::new(Arc::new(dev), 256).unwrap());
        format_groups(&cache, &geo);
        let journal = Journal::new(Arc::clone(&cache), JournalConfig::default());
        let alloc = Allocator::load(Arc::clone(&cache), geo).unwrap();
        Fixture {
            mem,
            journal,
            alloc,
        }
    }

    // ── Bitmap tests ────────────────────────────────────────────────────

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0_u8; 4];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 9);
        assert!(bitmap_get(&bm, 0));
        assert!(bitmap_get(&bm, 9));
        assert_eq!(bm[1], 0b0000_0010);
        bitmap_clear(&mut bm, 9);
        assert!(!bitmap_get(&bm, 9));
        assert!(!bitmap_get(&bm, 1000));
    }

    #[test]
    fn bitmap_count_free_some_allocated() {
        let mut bm = vec![0_u8; 2];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 3);
        bitmap_set(&mut bm, 15);
        assert_eq!(bitmap_count_free(&bm, 16), 13);
        assert_eq!(bitmap_count_free(&bm, 4), 2);
    }

    #[test]
    fn bitmap_find_usable_wraps_and_filters() {
        let mut bm = vec![0xFF_u8; 2];
        bitmap_clear(&mut bm, 2);
        bitmap_clear(&mut bm, 12);
        assert_eq!(bitmap_find_usable(&bm, 16, 5, |_| true), Some(12));
        assert_eq!(bitmap_find_usable(&bm, 16, 13, |_| true), Some(2));
        assert_eq!(bitmap_find_usable(&bm, 16, 0, |idx| idx != 2), Some(12));
        assert_eq!(bitmap_find_usable(&bm, 10, 5, |idx| idx != 2), None);
    }

    // ── Geometry tests ──────────────────────────────────────────────────

    #[test]
    fn geometry_group_block_conversion() {
        let geo = make_geometry();
        assert_eq!(geo.group_block_to_absolute(GroupNumber(1), 5), BlockNumber(262));
        assert_eq!(geo.absolute_to_group_block(BlockNumber(262)), (GroupNumber(1), 5));
        assert_eq!(geo.absolute_to_group_block(BlockNumber(1)), (GroupNumber(0), 0));
        assert_eq!(geo.blocks_in_group(GroupNumber(0)), 256);
        assert_eq!(geo.blocks_in_group(GroupNumber(3)), 255);
    }

    #[test]
    fn geometry_layout_respects_sparse_super() {
        let geo = make_geometry();
        assert_eq!(geo.super_blocks_in_group(GroupNumber(0)), 2);
        assert_eq!(geo.super_blocks_in_group(GroupNumber(2)), 0);
        let g0 = geo.default_layout(GroupNumber(0));
        assert_eq!(g0.block_bitmap, BlockNumber(3));
        assert_eq!(g0.inode_bitmap, BlockNumber(4));
        assert_eq!(g0.inode_table, BlockNumber(5));
        assert_eq!(g0.free_blocks, 256 - 2 - 2 - 4);
        let g2 = geo.default_layout(GroupNumber(2));
        assert_eq!(g2.block_bitmap, BlockNumber(513));
    }

    #[test]
    fn geometry_from_superblock_rejects_inconsistent_inode_count() {
        let sb = Superblock {
            blocks_count: 1024,
            first_data_block: 1,
            log_block_size: 0,
            blocks_per_group: 256,
            inodes_per_group: 32,
            inodes_count: 100,
            inode_size: 128,
            first_ino: 11,
            ..Superblock::default()
        };
        assert!(matches!(
            FsGeometry::from_superblock(&sb),
            Err(JfsError::InvalidGeometry(_))
        ));
        let sb = Superblock {
            inodes_count: 128,
            ..sb
        };
        assert_eq!(FsGeometry::from_superblock(&sb).unwrap().group_count, 4);
    }

    #[test]
    fn group_desc_location_packs_descriptors() {
        let geo = make_geometry();
        assert_eq!(geo.group_desc_location(GroupNumber(0)), (BlockNumber(2), 0));
        assert_eq!(geo.group_desc_location(GroupNumber(3)), (BlockNumber(2), 96));
    }

    // ── Block allocation ────────────────────────────────────────────────

    #[test]
    fn new_block_takes_free_goal() {
        let f = fixture();
        let mut handle = f.journal.start(16).unwrap();
        let a = f.alloc.new_block(&mut handle, BlockNumber(100)).unwrap();
        let b = f.alloc.new_block(&mut handle, BlockNumber(100)).unwrap();
        assert_eq!(a, BlockNumber(100));
        assert_eq!(b, BlockNumber(101));
        handle.stop().unwrap();
        assert!(f.alloc.block_in_use(a).unwrap());
    }

    #[test]
    fn new_block_never_returns_metadata() {
        let f = fixture();
        let mut handle = f.journal.start(16).unwrap();
        let block = f.alloc.new_block(&mut handle, BlockNumber(3)).unwrap();
        assert_eq!(block, BlockNumber(9));
        assert!(!f.alloc.is_system_zone(block, 1));
        handle.stop().unwrap();
    }

    #[test]
    fn invalid_goal_falls_back_to_first_data_block() {
        let f = fixture();
        let mut handle = f.journal.start(16).unwrap();
        let block = f.alloc.new_block(&mut handle, BlockNumber(5000)).unwrap();
        assert_eq!(block, BlockNumber(9));
        handle.stop().unwrap();
    }

    #[test]
    fn freed_block_not_reused_before_commit() {
        let f = fixture();
        let mut handle = f.journal.start(16).unwrap();
        let block = f.alloc.new_block(&mut handle, BlockNumber(200)).unwrap();
        handle.stop().unwrap();
        f.journal.force_commit().unwrap();

        let mut handle = f.journal.start(16).unwrap();
        f.alloc.free_blocks(&mut handle, block, 1).unwrap();
        assert_eq!(f.alloc.pending_free_count(), 1);
        let other = f.alloc.new_block(&mut handle, block).unwrap();
        assert_ne!(other, block);
        handle.stop().unwrap();
        f.journal.force_commit().unwrap();

        let mut handle = f.journal.start(16).unwrap();
        let again = f.alloc.new_block(&mut handle, block).unwrap();
        assert_eq!(again, block);
        assert_eq!(f.alloc.pending_free_count(), 0);
        handle.stop().unwrap();
    }

    #[test]
    fn free_blocks_releases_contiguous_run() {
        let f = fixture();
        let before = f.alloc.totals().free_blocks;
        let mut handle = f.journal.start(32).unwrap();
        let mut got = Vec::new();
        for goal in [250_u64, 251, 252, 253, 254, 255, 256] {
            got.push(f.alloc.new_block(&mut handle, BlockNumber(goal)).unwrap());
        }
        assert_eq!(got.last(), Some(&BlockNumber(256)));
        f.alloc.free_blocks(&mut handle, BlockNumber(250), 7).unwrap();
        handle.stop().unwrap();
        assert_eq!(f.alloc.totals().free_blocks, before);
    }

    #[test]
    fn double_free_is_corruption() {
        let f = fixture();
        let mut handle = f.journal.start(16).unwrap();
        let block = f.alloc.new_block(&mut handle, BlockNumber(300)).unwrap();
        f.alloc.free_blocks(&mut handle, block, 1).unwrap();
        let err = f.alloc.free_blocks(&mut handle, block, 1).unwrap_err();
        assert!(err.is_corruption());
        handle.stop().unwrap();
    }

    #[test]
    fn freeing_metadata_or_out_of_range_is_refused() {
        let f = fixture();
        let before = f.alloc.totals();
        let mut handle = f.journal.start(16).unwrap();
        for (start, count) in [(3_u64, 1_u64), (0, 1), (1020, 10), (8, 2)] {
            let err = f
                .alloc
                .free_blocks(&mut handle, BlockNumber(start), count)
                .unwrap_err();
            assert!(err.is_corruption(), "{start}+{count}");
        }
        handle.stop().unwrap();
        assert_eq!(f.alloc.totals(), before);
    }

    #[test]
    fn exhausting_space_reports_no_space() {
        let f = fixture();
        let free = f.alloc.totals().free_blocks;
        let mut handle = f.journal.start(16).unwrap();
        let mut allocated = 0_u64;
        loop {
            match f.alloc.new_block(&mut handle, BlockNumber(1)) {
                Ok(_) => allocated += 1,
                Err(JfsError::NoSpace) => break,
                Err(other) => panic!("unexpected {other}"),
            }
        }
        handle.stop().unwrap();
        assert_eq!(allocated, free);
        assert_eq!(f.alloc.totals().free_blocks, 0);
    }

    #[test]
    fn descriptor_counts_reach_disk_on_commit() {
        let f = fixture();
        let mut handle = f.journal.start(16).unwrap();
        f.alloc.new_block(&mut handle, BlockNumber(600)).unwrap();
        handle.stop().unwrap();
        f.journal.force_commit().unwrap();

        let dev = ByteBlockDevice::new(f.mem.clone(), BLOCK_SIZE).unwrap();
        let fresh = Arc::new(BufferCache::new(Arc::new(dev), 64).unwrap());
        let reloaded = Allocator::load(fresh, make_geometry()).unwrap();
        assert_eq!(reloaded.group_stats(), f.alloc.group_stats());
        assert!(reloaded.block_in_use(BlockNumber(600)).unwrap());
    }

    // ── Inode allocation ────────────────────────────────────────────────

    #[test]
    fn first_inode_skips_reserved_range() {
        let f = fixture();
        let mut handle = f.journal.start(16).unwrap();
        let ino = f.alloc.new_inode(&mut handle, GroupNumber(0), false).unwrap();
        assert_eq!(ino, InodeNumber(11));
        handle.stop().unwrap();
        assert!(f.alloc.inode_in_use(ino).unwrap());
        assert!(!f.alloc.inode_in_use(InodeNumber(12)).unwrap());
    }

    #[test]
    fn directories_spread_to_emptiest_group() {
        let f = fixture();
        let mut handle = f.journal.start(16).unwrap();
        let dir = f.alloc.new_inode(&mut handle, GroupNumber(0), true).unwrap();
        // Group 0 has fewer free inodes (reserved range) than average.
        assert_ne!(f.alloc.geometry().inode_group(dir).0, GroupNumber(0));
        handle.stop().unwrap();
        assert_eq!(f.alloc.totals().used_dirs, 1);
    }

    #[test]
    fn free_inode_roundtrip_and_reserved_refused() {
        let f = fixture();
        let before = f.alloc.totals().free_inodes;
        let mut handle = f.journal.start(16).unwrap();
        let ino = f.alloc.new_inode(&mut handle, GroupNumber(1), false).unwrap();
        assert_eq!(ino, InodeNumber(33));
        f.alloc.free_inode(&mut handle, ino, false).unwrap();
        assert!(f.alloc.free_inode(&mut handle, ino, false).unwrap_err().is_corruption());
        assert!(f
            .alloc
            .free_inode(&mut handle, InodeNumber(2), false)
            .unwrap_err()
            .is_corruption());
        handle.stop().unwrap();
        assert_eq!(f.alloc.totals().free_inodes, before);
    }

    #[test]
    fn inode_location_arithmetic() {
        let f = fixture();
        assert_eq!(f.alloc.inode_location(InodeNumber(1)).unwrap(), (BlockNumber(5), 0));
        assert_eq!(f.alloc.inode_location(InodeNumber(10)).unwrap(), (BlockNumber(6), 128));
        let g1 = f.alloc.group_stats()[1].inode_table;
        assert_eq!(f.alloc.inode_location(InodeNumber(33)).unwrap(), (g1, 0));
        assert!(matches!(
            f.alloc.inode_location(InodeNumber(129)),
            Err(JfsError::BadInode { ino: 129 })
        ));
    }
}
