//! Creating an empty filesystem.

use jfs_alloc::{FsGeometry, GroupStats, bitmap_set};
use jfs_block::{BufferCache, ByteBlockDevice, ByteDevice};
use jfs_error::{JfsError, Result};
use jfs_inode::ErrorBehavior;
use jfs_inode::super_info::superblock_location;
use jfs_ondisk::superblock::{
    DYNAMIC_REV, ERRORS_CONTINUE, ERRORS_PANIC, ERRORS_RO, INCOMPAT_FILETYPE,
    RO_COMPAT_SPARSE_SUPER, STATE_VALID,
};
use jfs_ondisk::{RawInode, Superblock};
use jfs_types::{
    BlockNumber, GOOD_OLD_FIRST_INO, GroupNumber, InodeNumber, S_IFDIR, SUPER_MAGIC, SUPERBLOCK_SIZE,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// A trailing group with fewer free blocks than this is not worth keeping.
const MIN_GROUP_DATA_BLOCKS: u32 = 50;

const FORMAT_CACHE_CAPACITY: usize = 64;

const VOLUME_NAME_MAX: usize = 16;

/// Layout of a new filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// 1024, 2048 or 4096.
    pub block_size: u32,
    /// Zero uses the whole device.
    pub blocks_count: u32,
    /// Zero fills one bitmap block: eight times the block size.
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub volume_name: String,
    /// Behavior recorded in the superblock for mounts that do not override it.
    pub errors: ErrorBehavior,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks_count: 0,
            blocks_per_group: 0,
            inodes_per_group: 256,
            inode_size: 128,
            volume_name: String::new(),
            errors: ErrorBehavior::default(),
        }
    }
}

fn errors_field(errors: ErrorBehavior) -> u16 {
    match errors {
        ErrorBehavior::Continue => ERRORS_CONTINUE,
        ErrorBehavior::RemountReadOnly => ERRORS_RO,
        ErrorBehavior::Panic => ERRORS_PANIC,
    }
}

fn volume_uuid() -> [u8; 16] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    (nanos ^ (u128::from(std::process::id()) << 96)).to_le_bytes()
}

/// Write an empty filesystem onto `dev` and return its superblock.
///
/// Every group gets its bitmaps and a zeroed inode table; inodes below the
/// first regular inode are reserved, and inode 2 becomes an empty root
/// directory. A trailing group too small to hold data is dropped.
pub fn format<D: ByteDevice + 'static>(dev: D, opts: &FormatOptions) -> Result<Superblock> {
    if !matches!(opts.block_size, 1024 | 2048 | 4096) {
        return Err(JfsError::InvalidArgument(format!(
            "block size {} is not 1024, 2048 or 4096",
            opts.block_size
        )));
    }
    if opts.volume_name.len() > VOLUME_NAME_MAX {
        return Err(JfsError::InvalidArgument(format!(
            "volume name longer than {VOLUME_NAME_MAX} bytes"
        )));
    }
    let block_size = opts.block_size;
    let device_blocks = dev.len_bytes() / u64::from(block_size);
    let blocks_count = if opts.blocks_count == 0 {
        u32::try_from(device_blocks).unwrap_or(u32::MAX)
    } else {
        opts.blocks_count
    };
    if u64::from(blocks_count) > device_blocks {
        return Err(JfsError::InvalidArgument(format!(
            "{blocks_count} blocks do not fit a device of {device_blocks}"
        )));
    }
    let blocks_per_group = if opts.blocks_per_group == 0 {
        block_size * 8
    } else {
        opts.blocks_per_group
    };

    let now = jfs_inode::unix_now();
    let mut sb = Superblock {
        blocks_count,
        first_data_block: u32::from(block_size == 1024),
        log_block_size: block_size.trailing_zeros() - 10,
        blocks_per_group,
        inodes_per_group: opts.inodes_per_group,
        inode_size: opts.inode_size,
        first_ino: GOOD_OLD_FIRST_INO,
        magic: SUPER_MAGIC,
        uuid: volume_uuid(),
        volume_name: opts.volume_name.clone(),
        rev_level: DYNAMIC_REV,
        feature_incompat: INCOMPAT_FILETYPE,
        feature_ro_compat: RO_COMPAT_SPARSE_SUPER,
        state: STATE_VALID,
        errors: errors_field(opts.errors),
        max_mnt_count: 20,
        wtime: now,
        lastcheck: now,
        mkfs_time: now,
        ..Superblock::default()
    };
    let geo = fit_geometry(&mut sb)?;

    let block_dev = ByteBlockDevice::new(dev, block_size)?;
    let cache = BufferCache::new(Arc::new(block_dev), FORMAT_CACHE_CAPACITY)?;
    let mut groups = Vec::new();
    for g in 0..geo.group_count {
        let group = GroupNumber(g);
        let mut stats = geo.default_layout(group);
        write_block_bitmap(&cache, &geo, &stats)?;
        let reserved = if g == 0 { geo.first_ino - 1 } else { 0 };
        write_inode_bitmap(&cache, &geo, &stats, reserved)?;
        stats.free_inodes -= reserved;
        for block in stats.inode_table.0..stats.inode_table.0 + u64::from(geo.inode_table_blocks()) {
            let buf = cache.get(BlockNumber(block))?;
            buf.zero();
            cache.write_back(&buf)?;
        }
        groups.push(stats);
    }
    write_root(&cache, &geo, &groups[0], now)?;
    groups[0].used_dirs = 1;

    sb.free_blocks_count = groups.iter().map(|g| g.free_blocks).sum();
    sb.free_inodes_count = groups.iter().map(|g| g.free_inodes).sum();
    write_super_copies(&cache, &geo, &sb, &groups)?;
    cache.device().sync()?;
    info!(
        target: "jfs::format",
        block_size,
        blocks = sb.blocks_count,
        inodes = sb.inodes_count,
        groups = geo.group_count,
        free_blocks = sb.free_blocks_count,
        "formatted"
    );
    Ok(sb)
}

/// Settle `blocks_count` and `inodes_count`, dropping a runt last group.
fn fit_geometry(sb: &mut Superblock) -> Result<FsGeometry> {
    loop {
        sb.inodes_count = sb
            .groups_count()
            .checked_mul(sb.inodes_per_group)
            .ok_or_else(|| JfsError::InvalidArgument("too many inodes".to_owned()))?;
        sb.validate()
            .map_err(|e| JfsError::InvalidArgument(e.to_string()))?;
        let geo = FsGeometry::from_superblock(sb)?;
        let overhead = |group| geo.super_blocks_in_group(group) + 2 + geo.inode_table_blocks();
        if overhead(GroupNumber(0)) + MIN_GROUP_DATA_BLOCKS > geo.blocks_in_group(GroupNumber(0)) {
            return Err(JfsError::InvalidArgument(format!(
                "a group of {} blocks cannot hold its own metadata",
                geo.blocks_in_group(GroupNumber(0))
            )));
        }
        let last = GroupNumber(geo.group_count - 1);
        if overhead(last) + MIN_GROUP_DATA_BLOCKS <= geo.blocks_in_group(last) {
            return Ok(geo);
        }
        debug!(
            target: "jfs::format",
            group = last.0,
            blocks = geo.blocks_in_group(last),
            "dropping_short_group"
        );
        sb.blocks_count -= geo.blocks_in_group(last);
    }
}

#[expect(clippy::cast_possible_truncation)]
fn write_block_bitmap(cache: &BufferCache, geo: &FsGeometry, stats: &GroupStats) -> Result<()> {
    let first = geo.group_first_block(stats.group).0;
    let table = stats.inode_table.0;
    let zones = [
        (first, first + u64::from(geo.super_blocks_in_group(stats.group))),
        (stats.block_bitmap.0, stats.block_bitmap.0 + 1),
        (stats.inode_bitmap.0, stats.inode_bitmap.0 + 1),
        (table, table + u64::from(geo.inode_table_blocks())),
    ];
    let buf = cache.get(stats.block_bitmap)?;
    buf.zero();
    {
        let mut bits = buf.write();
        for (lo, hi) in zones {
            for block in lo..hi {
                bitmap_set(&mut bits, (block - first) as u32);
            }
        }
        // Bits past the end of a short group must never look free.
        for pad in geo.blocks_in_group(stats.group)..geo.block_size * 8 {
            bitmap_set(&mut bits, pad);
        }
    }
    cache.write_back(&buf)
}

fn write_inode_bitmap(
    cache: &BufferCache,
    geo: &FsGeometry,
    stats: &GroupStats,
    reserved: u32,
) -> Result<()> {
    let buf = cache.get(stats.inode_bitmap)?;
    buf.zero();
    {
        let mut bits = buf.write();
        for idx in 0..reserved {
            bitmap_set(&mut bits, idx);
        }
        for pad in geo.inodes_per_group..geo.block_size * 8 {
            bitmap_set(&mut bits, pad);
        }
    }
    cache.write_back(&buf)
}

fn write_root(cache: &BufferCache, geo: &FsGeometry, group0: &GroupStats, now: u32) -> Result<()> {
    let (_, index) = geo.inode_group(InodeNumber::ROOT);
    let byte = u64::from(index) * u64::from(geo.inode_size);
    let block = BlockNumber(group0.inode_table.0 + byte / u64::from(geo.block_size));
    let offset = usize::try_from(byte % u64::from(geo.block_size))
        .map_err(|_| JfsError::InvalidGeometry("inode offset overflows usize".to_owned()))?;
    let root = RawInode {
        mode: S_IFDIR | 0o755,
        links_count: 2,
        atime: now,
        ctime: now,
        mtime: now,
        ..RawInode::default()
    };
    let buf = cache.read(block)?;
    root.write_to_bytes(&mut buf.write()[offset..])
        .map_err(|e| JfsError::Format(format!("root inode: {e}")))?;
    cache.write_back(&buf)
}

/// Primary superblock and descriptor table, then the backups.
fn write_super_copies(
    cache: &BufferCache,
    geo: &FsGeometry,
    sb: &Superblock,
    groups: &[GroupStats],
) -> Result<()> {
    let bs = cache.block_size();
    let mut table = vec![0_u8; geo.gdt_blocks as usize * bs];
    for stats in groups {
        let offset = stats.group.0 as usize * jfs_ondisk::GroupDesc::SIZE;
        stats
            .to_group_desc()?
            .write_to_bytes(&mut table[offset..])
            .map_err(|e| JfsError::Format(format!("group {} descriptor: {e}", stats.group.0)))?;
    }

    for stats in groups.iter().filter(|s| geo.group_has_super(s.group)) {
        let first = geo.group_first_block(stats.group);
        let (sb_block, sb_offset) = if stats.group.0 == 0 {
            superblock_location(bs)
        } else {
            (first, 0)
        };
        let buf = cache.read(sb_block)?;
        {
            let mut data = buf.write();
            let region = &mut data[sb_offset..sb_offset + SUPERBLOCK_SIZE];
            region.fill(0);
            sb.write_region(region)
                .map_err(|e| JfsError::Format(format!("superblock: {e}")))?;
        }
        cache.write_back(&buf)?;

        for (i, chunk) in table.chunks(bs).enumerate() {
            let block = BlockNumber(first.0 + 1 + i as u64);
            let buf = cache.get(block)?;
            buf.write().copy_from_slice(chunk);
            buf.set_uptodate();
            cache.write_back(&buf)?;
        }
    }
    debug!(target: "jfs::format", gdt_blocks = geo.gdt_blocks, "superblock_copies_written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jfs_block::MemByteDevice;
    use jfs_block::read_superblock_region;

    fn mem(blocks: usize, block_size: usize) -> MemByteDevice {
        MemByteDevice::new(blocks * block_size)
    }

    #[test]
    fn formats_single_group_1k() {
        let dev = mem(4096, 1024);
        let sb = format(dev.clone(), &FormatOptions::default()).unwrap();
        assert_eq!(sb.blocks_count, 4096);
        assert_eq!(sb.first_data_block, 1);
        assert_eq!(sb.inodes_count, 256);

        let region = read_superblock_region(&dev).unwrap();
        let back = Superblock::parse_region(&region).unwrap();
        assert_eq!(back.magic, SUPER_MAGIC);
        assert_eq!(back.free_blocks_count, sb.free_blocks_count);
        assert!(back.is_clean());
        assert_eq!(back.free_inodes_count, 256 - 10);
    }

    #[test]
    fn drops_runt_last_group() {
        // 8193 data blocks: the second group would hold a single block.
        let dev = mem(8194, 1024);
        let sb = format(dev, &FormatOptions::default()).unwrap();
        assert_eq!(sb.blocks_count, 8193);
        assert_eq!(sb.groups_count(), 1);
    }

    #[test]
    fn multi_group_4k_has_backups() {
        let opts = FormatOptions {
            block_size: 4096,
            blocks_per_group: 1024,
            ..FormatOptions::default()
        };
        let dev = mem(4096, 4096);
        let sb = format(dev.clone(), &opts).unwrap();
        assert_eq!(sb.groups_count(), 4);
        assert_eq!(sb.first_data_block, 0);

        // Group 1 keeps a backup superblock at its first block.
        let mut backup = vec![0_u8; SUPERBLOCK_SIZE];
        dev.read_exact_at(1024 * 4096, &mut backup).unwrap();
        let copy = Superblock::parse_region(&backup).unwrap();
        assert_eq!(copy.uuid, sb.uuid);
        assert_eq!(copy.blocks_count, sb.blocks_count);
    }

    #[test]
    fn rejects_bad_options() {
        let dev = mem(1024, 1024);
        let bad_bs = FormatOptions {
            block_size: 512,
            ..FormatOptions::default()
        };
        assert!(matches!(format(dev.clone(), &bad_bs), Err(JfsError::InvalidArgument(_))));
        let too_big = FormatOptions {
            blocks_count: 2048,
            ..FormatOptions::default()
        };
        assert!(matches!(format(dev.clone(), &too_big), Err(JfsError::InvalidArgument(_))));
        let long_name = FormatOptions {
            volume_name: "a-name-well-past-sixteen".to_owned(),
            ..FormatOptions::default()
        };
        assert!(matches!(format(dev, &long_name), Err(JfsError::InvalidArgument(_))));
    }
}
