#![forbid(unsafe_code)]

mod common;

use common::{BLOCK_SIZE, fill_blocks, fresh_fs, indirect_entry, new_file, physical, sectors};
use jfs_core::{BlockMapping, LogicalBlock};
use jfs_inode::block_to_path;
use jfs_types::{BlockSize, IND_BLOCK};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

fn one_k() -> BlockSize {
    BlockSize::new(1024).expect("block size")
}

// ── Paths ───────────────────────────────────────────────────────────────────

#[test]
fn direct_paths_mark_only_the_last_slot() {
    let fifth = block_to_path(one_k(), LogicalBlock(5)).expect("path");
    assert_eq!(fifth.offsets(), &[5]);
    assert!(!fifth.is_boundary());

    let last = block_to_path(one_k(), LogicalBlock(11)).expect("path");
    assert_eq!(last.offsets(), &[11]);
    assert!(last.is_boundary());

    let first_indirect = block_to_path(one_k(), LogicalBlock(12)).expect("path");
    assert_eq!(first_indirect.offsets(), &[IND_BLOCK, 0]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn paths_depend_only_on_block_and_size(
        raw in 0_u64..16_843_020,
        log in 0_u32..3,
    ) {
        let bs = BlockSize::new(1024 << log).expect("block size");
        let first = block_to_path(bs, LogicalBlock(raw)).expect("in range");
        let second = block_to_path(bs, LogicalBlock(raw)).expect("in range");
        prop_assert_eq!(first, second);
    }
}

// ── Allocation ──────────────────────────────────────────────────────────────

#[test]
fn twenty_blocks_allocate_one_indirect_block() {
    let (_dev, fs) = fresh_fs();
    let inode = new_file(&fs);

    let mut indirect_after_first = None;
    for block in 0..20_u64 {
        let mapping = fs
            .get_block(&inode, LogicalBlock(block), true)
            .expect("allocate");
        assert!(matches!(mapping, BlockMapping::Mapped { new: true, .. }));
        if block == 12 {
            indirect_after_first = Some(inode.ptr(IND_BLOCK).get());
        }
    }

    let indirect = inode.ptr(IND_BLOCK).get();
    assert_ne!(indirect, 0);
    assert_eq!(indirect_after_first, Some(indirect));
    for index in 0..8 {
        assert_ne!(indirect_entry(&fs, u64::from(indirect), index), 0);
    }
    for index in 8..256 {
        assert_eq!(indirect_entry(&fs, u64::from(indirect), index), 0);
    }
    // Twenty data blocks and the indirect block, two sectors each.
    assert_eq!(sectors(&inode), 42);
}

#[test]
fn sequential_writes_land_contiguously() {
    let (_dev, fs) = fresh_fs();
    let inode = new_file(&fs);
    let block = vec![0xa5_u8; BLOCK_SIZE];
    fs.write_at(&inode, 0, &block, false).expect("first write");
    fs.write_at(&inode, BLOCK_SIZE as u64, &block, false)
        .expect("second write");

    let first = physical(&fs, &inode, 0).expect("block 0 mapped");
    let second = physical(&fs, &inode, 1).expect("block 1 mapped");
    assert_eq!(second, first + 1);
    assert_eq!(inode.snapshot().size, 2 * BLOCK_SIZE as u64);
}

#[test]
fn existing_block_is_not_reallocated() {
    let (_dev, fs) = fresh_fs();
    let inode = new_file(&fs);
    let first = fs
        .get_block(&inode, LogicalBlock(3), true)
        .expect("allocate");
    let again = fs
        .get_block(&inode, LogicalBlock(3), true)
        .expect("map");
    assert_eq!(first.block(), again.block());
    assert!(matches!(again, BlockMapping::Mapped { new: false, .. }));
    assert_eq!(sectors(&inode), 2);
}

#[test]
fn lookup_without_create_reports_holes() {
    let (_dev, fs) = fresh_fs();
    let inode = new_file(&fs);
    fill_blocks(&fs, &inode, 2);
    assert_eq!(
        fs.get_block(&inode, LogicalBlock(40), false).expect("lookup"),
        BlockMapping::Hole
    );
    assert_eq!(inode.ptr(IND_BLOCK).get(), 0);
}

#[test]
fn sparse_write_reads_back_zeros_in_the_gap() {
    let (_dev, fs) = fresh_fs();
    let inode = new_file(&fs);
    let data = vec![7_u8; 100];
    let offset = 20 * BLOCK_SIZE as u64 + 10;
    fs.write_at(&inode, offset, &data, false).expect("write");
    assert_eq!(inode.snapshot().size, offset + 100);

    let back = fs.read_at(&inode, 0, usize::MAX).expect("read");
    assert_eq!(back.len() as u64, offset + 100);
    assert!(back[..offset as usize].iter().all(|&b| b == 0));
    assert_eq!(&back[offset as usize..], &data[..]);
    // One data block plus the indirect block.
    assert_eq!(sectors(&inode), 4);
}

#[test]
fn concurrent_allocations_get_distinct_blocks() {
    let (_dev, fs) = fresh_fs();
    let inode = new_file(&fs);
    let threads = 4_u64;
    let per_thread = 40_u64;

    let results: Vec<Vec<(u64, u64)>> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|t| {
                let fs = &fs;
                let inode = &inode;
                scope.spawn(move || {
                    (0..per_thread)
                        .map(|i| {
                            let logical = i * threads + t;
                            let mapping = fs
                                .get_block(inode, LogicalBlock(logical), true)
                                .expect("allocate");
                            (logical, mapping.block().expect("mapped").0)
                        })
                        .collect()
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("worker"))
            .collect()
    });

    let mapped: BTreeMap<u64, u64> = results.into_iter().flatten().collect();
    assert_eq!(mapped.len() as u64, threads * per_thread);
    let distinct: BTreeSet<u64> = mapped.values().copied().collect();
    assert_eq!(distinct.len(), mapped.len());
    for (logical, block) in &mapped {
        assert_eq!(physical(&fs, &inode, *logical), Some(*block));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn allocations_round_trip(
        blocks in proptest::collection::btree_set(0_u64..2_000, 1..40),
    ) {
        let (_dev, fs) = fresh_fs();
        let inode = new_file(&fs);
        let mut placed = Vec::new();
        for &block in &blocks {
            let mapping = fs
                .get_block(&inode, LogicalBlock(block), true)
                .expect("allocate");
            placed.push((block, mapping.block().expect("mapped").0));
        }
        for (block, physical_block) in placed {
            prop_assert_eq!(physical(&fs, &inode, block), Some(physical_block));
        }
    }
}
