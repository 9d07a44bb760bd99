#![allow(dead_code)]

use jfs_alloc::FsGeometry;
use jfs_core::{
    BlockMapping, ByteDevice, Filesystem, FormatOptions, Inode, LogicalBlock, MemByteDevice,
    MountOptions, format, read_superblock,
};
use jfs_ondisk::RawInode;
use jfs_types::{InodeNumber, S_IFREG};
use std::sync::Arc;

pub const BLOCK_SIZE: usize = 1024;

/// 8 MiB, one block group at 1K blocks.
pub const IMAGE_BLOCKS: usize = 8192;

pub fn fresh_image(blocks: usize) -> MemByteDevice {
    let dev = MemByteDevice::new(blocks * BLOCK_SIZE);
    format(dev.clone(), &FormatOptions::default()).expect("format");
    dev
}

pub fn mount(dev: &MemByteDevice, opts: MountOptions) -> Filesystem {
    Filesystem::mount(dev.clone(), opts).expect("mount")
}

pub fn fresh_fs() -> (MemByteDevice, Filesystem) {
    let dev = fresh_image(IMAGE_BLOCKS);
    let fs = mount(&dev, MountOptions::default());
    (dev, fs)
}

/// Mount whose journal forces a restart every couple of freed blocks.
pub fn tight_options() -> MountOptions {
    let mut opts = MountOptions::default();
    opts.journal.max_transaction_credits = 20;
    opts.max_truncate_credits = 4;
    opts
}

pub fn new_file(fs: &Filesystem) -> Arc<Inode> {
    let root = fs.root().expect("root");
    fs.create(Some(&root), S_IFREG | 0o644, 1000, 1000)
        .expect("create file")
}

/// Contents of logical block `block` in patterned test files.
pub fn pattern(block: u64) -> Vec<u8> {
    (0..BLOCK_SIZE)
        .map(|i| ((block as usize * 31 + i) % 251) as u8)
        .collect()
}

/// Write `count` patterned blocks starting at logical block 0.
pub fn fill_blocks(fs: &Filesystem, inode: &Inode, count: u64) {
    for block in 0..count {
        let written = fs
            .write_at(inode, block * BLOCK_SIZE as u64, &pattern(block), false)
            .expect("write block");
        assert_eq!(written, BLOCK_SIZE);
    }
}

pub fn physical(fs: &Filesystem, inode: &Inode, block: u64) -> Option<u64> {
    match fs
        .get_block(inode, LogicalBlock(block), false)
        .expect("map block")
    {
        BlockMapping::Mapped { block, .. } => Some(block.0),
        BlockMapping::Hole => None,
    }
}

pub fn sectors(inode: &Inode) -> u64 {
    inode.snapshot().blocks
}

/// The on-disk record of `ino`, read straight from the device.
pub fn raw_inode(dev: &MemByteDevice, ino: InodeNumber) -> RawInode {
    let sb = read_superblock(dev).expect("superblock");
    let geo = FsGeometry::from_superblock(&sb).expect("geometry");
    let (group, index) = geo.inode_group(ino);
    let table = geo.default_layout(group).inode_table;
    let offset = table.0 * u64::from(geo.block_size)
        + u64::from(index) * u64::from(geo.inode_size);
    let mut bytes = vec![0_u8; RawInode::SIZE];
    dev.read_exact_at(offset, &mut bytes).expect("read inode");
    RawInode::parse_from_bytes(&bytes).expect("parse inode")
}

/// Pointer `index` of an indirect block as currently cached.
pub fn indirect_entry(fs: &Filesystem, block: u64, index: usize) -> u32 {
    let buf = fs
        .context()
        .cache()
        .read(jfs_types::BlockNumber(block))
        .expect("read indirect");
    buf.ptr(index).expect("entry").get()
}
