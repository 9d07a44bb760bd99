#![forbid(unsafe_code)]

mod common;

use common::{
    BLOCK_SIZE, IMAGE_BLOCKS, fill_blocks, fresh_image, mount, new_file, pattern, physical,
    raw_inode, sectors, tight_options,
};
use jfs_core::{
    ErrorBehavior, FsState, InodeNumber, JfsError, MemByteDevice, MountOptions, inspect,
};
use jfs_types::{DiskPtr, IND_BLOCK, N_BLOCKS};

const BS: u64 = BLOCK_SIZE as u64;

/// Shrink a 20-block file to 5 blocks on a journal that aborts right after
/// the truncate's first commit, then drop the mount without unmounting.
fn interrupted_truncate(dev: &MemByteDevice) -> InodeNumber {
    let fs = mount(dev, tight_options());
    let inode = new_file(&fs);
    fill_blocks(&fs, &inode, 20);
    fs.sync().expect("sync");

    fs.context().journal().set_abort_after(1);
    let result = fs.truncate(&inode, 5 * BS);
    assert!(matches!(result, Err(JfsError::ReadOnly)), "{result:?}");
    assert!(fs.context().journal().is_aborted());
    inode.ino()
}

/// The same file shrunk without interruption: (pointers, sectors, free blocks).
fn uninterrupted_truncate() -> ([DiskPtr; N_BLOCKS], u64, u64) {
    let dev = fresh_image(IMAGE_BLOCKS);
    let fs = mount(&dev, tight_options());
    let inode = new_file(&fs);
    fill_blocks(&fs, &inode, 20);
    fs.sync().expect("sync");
    fs.truncate(&inode, 5 * BS).expect("truncate");
    fs.sync().expect("sync");
    (inode.pointers(), sectors(&inode), fs.report().free_blocks)
}

// ── Interrupted truncate ────────────────────────────────────────────────────

#[test]
fn crash_mid_truncate_leaves_new_size_and_orphan_on_disk() {
    let dev = fresh_image(IMAGE_BLOCKS);
    let ino = interrupted_truncate(&dev);

    let raw = raw_inode(&dev, ino);
    assert_eq!(raw.size_low, 5 * 1024);
    // Nothing was freed yet: every pointer of the 20-block file survives.
    assert!(raw.block[..IND_BLOCK + 1].iter().all(|ptr| !ptr.is_hole()));
    assert_eq!(raw.blocks, 42);
    let report = inspect(&dev).expect("inspect");
    assert_eq!(u64::from(report.last_orphan), ino.0);
    assert_eq!(report.state, FsState::NotClean);
}

#[test]
fn recovery_finishes_interrupted_truncate() {
    let dev = fresh_image(IMAGE_BLOCKS);
    let ino = interrupted_truncate(&dev);
    let (expected_ptrs, expected_sectors, expected_free) = uninterrupted_truncate();

    let fs = mount(&dev, MountOptions::default());
    assert_eq!(fs.recovery().truncated, 1);
    assert_eq!(fs.recovery().deleted, 0);
    assert_eq!(fs.report().last_orphan, 0);

    let inode = fs.inode(ino).expect("inode");
    assert_eq!(inode.pointers(), expected_ptrs);
    assert_eq!(sectors(&inode), expected_sectors);
    assert_eq!(sectors(&inode), 10);
    assert_eq!(inode.snapshot().size, 5 * BS);
    for block in 5..20 {
        assert_eq!(physical(&fs, &inode, block), None);
    }
    let data = fs.read_at(&inode, 0, usize::MAX).expect("read");
    for block in 0..5 {
        let range = (block * BS) as usize..((block + 1) * BS) as usize;
        assert_eq!(&data[range], &pattern(block)[..]);
    }
    assert_eq!(fs.report().free_blocks, expected_free);
    assert_eq!(fs.report().error_count, 0);

    drop(inode);
    fs.unmount().expect("unmount");
    assert_eq!(inspect(&dev).expect("inspect").state, FsState::Clean);
}

#[test]
fn recovery_on_read_only_mount_still_runs() {
    let dev = fresh_image(IMAGE_BLOCKS);
    let ino = interrupted_truncate(&dev);

    let opts = MountOptions {
        read_only: true,
        ..MountOptions::default()
    };
    let fs = mount(&dev, opts);
    assert!(fs.is_read_only());
    assert_eq!(fs.recovery().truncated, 1);
    let inode = fs.inode(ino).expect("inode");
    assert_eq!(sectors(&inode), 10);
    assert!(matches!(fs.truncate(&inode, 0), Err(JfsError::ReadOnly)));
}

#[test]
fn every_crash_point_of_a_long_truncate_recovers_cleanly() {
    let mut crashes = 0;
    let mut finished = false;
    for commits in 1..1_000_u64 {
        let dev = fresh_image(IMAGE_BLOCKS);
        let fs = mount(&dev, tight_options());
        let baseline = fs.report().free_blocks;
        let inode = new_file(&fs);
        fill_blocks(&fs, &inode, 300);
        fs.sync().expect("sync");

        fs.context().journal().set_abort_after(commits);
        if fs.truncate(&inode, 0).is_ok() {
            finished = true;
            break;
        }
        crashes += 1;
        drop(inode);
        drop(fs);

        let fs = mount(&dev, MountOptions::default());
        assert_eq!(fs.recovery().truncated, 1, "crash after commit {commits}");
        let report = fs.report();
        assert_eq!(report.error_count, 0, "crash after commit {commits}");
        assert_eq!(report.free_blocks, baseline, "crash after commit {commits}");
        assert_eq!(report.last_orphan, 0);
        assert!(!fs.is_read_only());
    }
    assert!(finished);
    assert!(crashes > 3, "only {crashes} crash points");
}

#[test]
fn failed_recovery_leaves_a_read_only_mount() {
    let dev = fresh_image(IMAGE_BLOCKS);
    let ino = interrupted_truncate(&dev);
    let ind = u64::from(raw_inode(&dev, ino).block[IND_BLOCK].get());
    dev.fail_reads_at(ind * BS, BS);

    let fs = mount(&dev, MountOptions::default());
    assert!(fs.is_read_only());
    assert!(fs.recovery().skipped);
    assert_eq!(fs.report().state, FsState::Errors);
    let inode = fs.inode(ino).expect("inode still readable");
    assert!(matches!(fs.truncate(&inode, 0), Err(JfsError::ReadOnly)));
    drop(inode);
    fs.unmount().expect("unmount");

    dev.clear_failures();
    assert_eq!(inspect(&dev).expect("inspect").state, FsState::Errors);
}

// ── Unlinked inodes ─────────────────────────────────────────────────────────

#[test]
fn last_release_of_unlinked_file_frees_everything() {
    let dev = fresh_image(IMAGE_BLOCKS);
    let fs = mount(&dev, MountOptions::default());
    let before = fs.report();
    let inode = new_file(&fs);
    fill_blocks(&fs, &inode, 30);

    fs.unlink(&inode).expect("unlink");
    assert!(inode.is_on_orphan_list());
    // Still readable while referenced.
    let head = fs.read_at(&inode, 0, BLOCK_SIZE).expect("read");
    assert_eq!(head, pattern(0));

    let ino = inode.ino();
    fs.release(inode).expect("release");
    let after = fs.report();
    assert_eq!(after.free_blocks, before.free_blocks);
    assert_eq!(after.free_inodes, before.free_inodes);
    assert_eq!(after.last_orphan, 0);
    assert!(!fs.context().allocator().inode_in_use(ino).expect("bitmap"));
    assert!(matches!(fs.inode(ino), Err(JfsError::BadInode { .. })));
}

#[test]
fn crash_with_open_unlinked_file_deletes_it_at_mount() {
    let dev = fresh_image(IMAGE_BLOCKS);
    let fs = mount(&dev, MountOptions::default());
    let before = fs.report();
    let inode = new_file(&fs);
    fill_blocks(&fs, &inode, 30);
    fs.unlink(&inode).expect("unlink");
    fs.sync().expect("sync");
    let ino = inode.ino();
    assert_eq!(u64::from(inspect(&dev).expect("inspect").last_orphan), ino.0);
    drop(inode);
    drop(fs);

    let fs = mount(&dev, MountOptions::default());
    assert_eq!(fs.recovery().deleted, 1);
    assert_eq!(fs.recovery().truncated, 0);
    let after = fs.report();
    assert_eq!(after.free_blocks, before.free_blocks);
    assert_eq!(after.free_inodes, before.free_inodes);
    assert_eq!(after.last_orphan, 0);
    assert!(!fs.context().allocator().inode_in_use(ino).expect("bitmap"));
    assert_ne!(raw_inode(&dev, ino).dtime, 0);
}

#[test]
fn orphan_chain_links_through_dtime() {
    let dev = fresh_image(IMAGE_BLOCKS);
    let fs = mount(&dev, MountOptions::default());
    let first = new_file(&fs);
    let second = new_file(&fs);
    fill_blocks(&fs, &first, 3);
    fill_blocks(&fs, &second, 3);
    fs.unlink(&first).expect("unlink first");
    fs.unlink(&second).expect("unlink second");
    fs.sync().expect("sync");

    assert_eq!(
        fs.context().orphans().inodes(),
        vec![second.ino(), first.ino()]
    );
    assert_eq!(u64::from(inspect(&dev).expect("inspect").last_orphan), second.ino().0);
    assert_eq!(u64::from(raw_inode(&dev, second.ino()).dtime), first.ino().0);
    assert_eq!(raw_inode(&dev, first.ino()).dtime, 0);

    // Removing the head patches the superblock; the chain stays intact.
    fs.release(second).expect("release second");
    assert_eq!(fs.context().orphans().inodes(), vec![first.ino()]);
    assert_eq!(u64::from(fs.report().last_orphan), first.ino().0);
    fs.release(first).expect("release first");
    assert!(fs.context().orphans().is_empty());
    assert_eq!(fs.report().last_orphan, 0);
}

// ── Error handling ──────────────────────────────────────────────────────────

/// A file whose single indirect block cannot be read after remount.
fn image_with_unreadable_indirect() -> (MemByteDevice, InodeNumber) {
    let dev = fresh_image(IMAGE_BLOCKS);
    let fs = mount(&dev, MountOptions::default());
    let inode = new_file(&fs);
    fill_blocks(&fs, &inode, 20);
    let ind = u64::from(inode.ptr(IND_BLOCK).get());
    let ino = inode.ino();
    drop(inode);
    fs.unmount().expect("unmount");
    dev.fail_reads_at(ind * BS, BS);
    (dev, ino)
}

#[test]
fn unreadable_indirect_block_is_skipped_when_continuing() {
    let (dev, ino) = image_with_unreadable_indirect();
    let opts = MountOptions {
        errors: Some(ErrorBehavior::Continue),
        ..MountOptions::default()
    };
    let fs = mount(&dev, opts);
    let inode = fs.inode(ino).expect("inode");

    fs.truncate(&inode, 0).expect("truncate continues past the bad branch");

    assert!(!fs.is_read_only());
    for block in 0..12 {
        assert_eq!(physical(&fs, &inode, block), None);
    }
    let report = fs.report();
    assert_eq!(report.state, FsState::Errors);
    assert!(report.error_count >= 1);
    // The error reached the device even though nothing was committed yet.
    dev.clear_failures();
    assert_eq!(inspect(&dev).expect("inspect").state, FsState::Errors);
}

#[test]
fn unreadable_indirect_block_remounts_read_only() {
    let (dev, ino) = image_with_unreadable_indirect();
    let opts = MountOptions {
        errors: Some(ErrorBehavior::RemountReadOnly),
        ..MountOptions::default()
    };
    let fs = mount(&dev, opts);
    let inode = fs.inode(ino).expect("inode");

    let _ = fs.truncate(&inode, 0);

    assert!(fs.is_read_only());
    assert!(fs.context().journal().is_aborted());
    assert!(matches!(
        fs.write_at(&inode, 0, b"late", false),
        Err(JfsError::ReadOnly)
    ));
    drop(inode);
    fs.unmount().expect("unmount after abort");

    dev.clear_failures();
    let fs = mount(&dev, MountOptions::default());
    assert!(fs.is_read_only(), "errors recorded on disk force read-only");
}
