//! In-memory inode.
//!
//! The block map lives in fifteen atomics holding the pointers in on-disk
//! byte order, so the lock-free lookup path can read slots while an
//! allocator splices under the state lock. Everything else is behind
//! `state`.

use jfs_error::{JfsError, Result};
use jfs_ondisk::RawInode;
use jfs_types::{
    APPEND_FL, BlockNumber, DiskPtr, FAST_SYMLINK_MAX, IMMUTABLE_FL, InodeNumber, N_BLOCKS,
    S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, SYNC_FL,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// uid/gid stored when a 32-bit id does not fit a 16-bit field.
pub const OVERFLOW_ID: u16 = 65534;

/// File type decoded from the mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileType {
    #[must_use]
    pub fn from_mode(mode: u16) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::RegularFile),
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            S_IFCHR => Some(Self::CharDevice),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFIFO => Some(Self::Fifo),
            S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }
}

/// Mutable inode attributes.
///
/// `size` is the logical size seen by readers; `disk_size` is what gets
/// written to the inode table. They differ while a file grows (the new size
/// is only recorded once its blocks are spliced in) and while a truncate
/// has shortened `size` but not yet started freeing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeState {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub disk_size: u64,
    pub links_count: u16,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    /// Deletion time, or the next orphan while the inode is on the orphan list.
    pub dtime: u32,
    /// 512-byte sectors charged to the inode, indirect blocks included.
    pub blocks: u64,
    pub flags: u32,
    pub generation: u32,
    pub file_acl: u32,
    pub faddr: u32,
    /// Logical block of the last allocation.
    pub next_alloc_block: u64,
    /// Physical block of the last allocation.
    pub next_alloc_goal: u64,
}

impl InodeState {
    /// Decode the attribute part of an on-disk record.
    #[must_use]
    pub fn from_raw(raw: &RawInode, no_uid32: bool) -> Self {
        let (uid, gid) = if no_uid32 {
            (u32::from(raw.uid_low), u32::from(raw.gid_low))
        } else {
            (
                u32::from(raw.uid_low) | (u32::from(raw.uid_high) << 16),
                u32::from(raw.gid_low) | (u32::from(raw.gid_high) << 16),
            )
        };
        let mut size = u64::from(raw.size_low);
        if raw.mode & S_IFMT == S_IFREG {
            size |= u64::from(raw.size_high) << 32;
        }
        Self {
            mode: raw.mode,
            uid,
            gid,
            size,
            disk_size: size,
            links_count: raw.links_count,
            atime: raw.atime,
            ctime: raw.ctime,
            mtime: raw.mtime,
            dtime: raw.dtime,
            blocks: u64::from(raw.blocks),
            flags: raw.flags,
            generation: raw.generation,
            file_acl: raw.file_acl,
            faddr: raw.faddr,
            next_alloc_block: 0,
            next_alloc_goal: 0,
        }
    }

    /// Encode into a record carrying `block` as its map.
    pub fn to_raw(&self, block: [DiskPtr; N_BLOCKS], no_uid32: bool) -> Result<RawInode> {
        let (uid_low, uid_high) = split_id(self.uid, no_uid32);
        let (gid_low, gid_high) = split_id(self.gid, no_uid32);
        let blocks = u32::try_from(self.blocks).map_err(|_| JfsError::Corruption {
            block: 0,
            detail: format!("inode charged with {} sectors", self.blocks),
        })?;
        #[expect(clippy::cast_possible_truncation)]
        let size_low = self.disk_size as u32;
        let size_high = if self.is_reg() {
            u32::try_from(self.disk_size >> 32).map_err(|_| JfsError::FileTooLarge)?
        } else {
            0
        };
        Ok(RawInode {
            mode: self.mode,
            uid_low,
            size_low,
            atime: self.atime,
            ctime: self.ctime,
            mtime: self.mtime,
            dtime: self.dtime,
            gid_low,
            links_count: self.links_count,
            blocks,
            flags: self.flags,
            block,
            generation: self.generation,
            file_acl: self.file_acl,
            size_high,
            faddr: self.faddr,
            uid_high,
            gid_high,
        })
    }

    #[must_use]
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    #[must_use]
    pub fn is_reg(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    #[must_use]
    pub fn is_append_or_immutable(&self) -> bool {
        self.flags & (APPEND_FL | IMMUTABLE_FL) != 0
    }

    #[must_use]
    pub fn is_sync(&self) -> bool {
        self.flags & SYNC_FL != 0
    }

    /// A symlink whose target lives in the slot array: no blocks charged
    /// other than an extended-attribute block.
    #[must_use]
    pub fn is_fast_symlink(&self, sectors_per_block: u64) -> bool {
        let acl_sectors = if self.file_acl == 0 { 0 } else { sectors_per_block };
        self.is_symlink() && self.blocks.saturating_sub(acl_sectors) == 0
    }

    /// Whether the block map of this inode may be cut back.
    #[must_use]
    pub fn can_truncate(&self, sectors_per_block: u64) -> bool {
        (self.is_reg() || self.is_dir() || self.is_symlink())
            && !self.is_fast_symlink(sectors_per_block)
            && !self.is_append_or_immutable()
    }
}

fn split_id(id: u32, no_uid32: bool) -> (u16, u16) {
    if no_uid32 {
        return (u16::try_from(id).unwrap_or(OVERFLOW_ID), 0);
    }
    #[expect(clippy::cast_possible_truncation)]
    let parts = (id as u16, (id >> 16) as u16);
    parts
}

/// A cached inode.
#[derive(Debug)]
pub struct Inode {
    ino: InodeNumber,
    /// Inode-table block and byte offset of the on-disk record.
    location: (BlockNumber, usize),
    data: [AtomicU32; N_BLOCKS],
    state: Mutex<InodeState>,
    /// Shared by allocating lookups, exclusive while truncate frees.
    truncate_lock: RwLock<()>,
    /// Serializes whole operations (write, truncate, setattr) on this inode.
    io_lock: Mutex<()>,
    bad: AtomicBool,
    on_orphan: AtomicBool,
}

impl Inode {
    #[must_use]
    pub fn new(
        ino: InodeNumber,
        location: (BlockNumber, usize),
        block: [DiskPtr; N_BLOCKS],
        state: InodeState,
    ) -> Self {
        Self {
            ino,
            location,
            data: block.map(|ptr| AtomicU32::new(ptr.raw())),
            state: Mutex::new(state),
            truncate_lock: RwLock::new(()),
            io_lock: Mutex::new(()),
            bad: AtomicBool::new(false),
            on_orphan: AtomicBool::new(false),
        }
    }

    /// An inode that fails every operation.
    #[must_use]
    pub fn poisoned(ino: InodeNumber) -> Self {
        let inode = Self::new(
            ino,
            (BlockNumber(0), 0),
            [DiskPtr::HOLE; N_BLOCKS],
            InodeState::default(),
        );
        inode.mark_bad();
        inode
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn location(&self) -> (BlockNumber, usize) {
        self.location
    }

    /// Current value of slot `index` of the inode's map.
    #[must_use]
    pub fn ptr(&self, index: usize) -> DiskPtr {
        DiskPtr::from_raw(self.data[index].load(Ordering::Acquire))
    }

    pub(crate) fn set_ptr(&self, index: usize, ptr: DiskPtr) {
        self.data[index].store(ptr.raw(), Ordering::Release);
    }

    #[must_use]
    pub fn pointers(&self) -> [DiskPtr; N_BLOCKS] {
        std::array::from_fn(|i| self.ptr(i))
    }

    /// Copy of the current attributes.
    #[must_use]
    pub fn snapshot(&self) -> InodeState {
        self.state.lock().clone()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock()
    }

    pub(crate) fn truncate_lock(&self) -> &RwLock<()> {
        &self.truncate_lock
    }

    /// Hold for the duration of one write, truncate or attribute change.
    pub fn lock_io(&self) -> MutexGuard<'_, ()> {
        self.io_lock.lock()
    }

    #[must_use]
    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Acquire)
    }

    pub fn mark_bad(&self) {
        self.bad.store(true, Ordering::Release);
    }

    pub fn check_bad(&self) -> Result<()> {
        if self.is_bad() {
            return Err(JfsError::BadInode { ino: self.ino.0 });
        }
        Ok(())
    }

    #[must_use]
    pub fn is_on_orphan_list(&self) -> bool {
        self.on_orphan.load(Ordering::Acquire)
    }

    pub(crate) fn set_on_orphan_list(&self, on: bool) {
        self.on_orphan.store(on, Ordering::Release);
    }

    /// Target of a fast symlink, read from the slot array.
    #[must_use]
    pub fn fast_symlink_target(&self, sectors_per_block: u64) -> Option<Vec<u8>> {
        let state = self.state.lock();
        if !state.is_fast_symlink(sectors_per_block) {
            return None;
        }
        let len = usize::try_from(state.size).map_or(FAST_SYMLINK_MAX, |n| n.min(FAST_SYMLINK_MAX));
        drop(state);
        let mut bytes = Vec::with_capacity(FAST_SYMLINK_MAX);
        for i in 0..N_BLOCKS {
            bytes.extend_from_slice(&self.ptr(i).to_disk_bytes());
        }
        bytes.truncate(len);
        Some(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jfs_types::{JOURNAL_DATA_FL, S_IFREG};

    fn regular(size: u64) -> InodeState {
        InodeState {
            mode: S_IFREG | 0o644,
            size,
            disk_size: size,
            links_count: 1,
            ..InodeState::default()
        }
    }

    #[test]
    fn large_uid_splits_into_halves() {
        let state = InodeState {
            uid: 0x0012_3456,
            gid: 70_000,
            ..regular(0)
        };
        let raw = state.to_raw([DiskPtr::HOLE; N_BLOCKS], false).unwrap();
        assert_eq!(raw.uid_low, 0x3456);
        assert_eq!(raw.uid_high, 0x0012);
        let back = InodeState::from_raw(&raw, false);
        assert_eq!(back.uid, 0x0012_3456);
        assert_eq!(back.gid, 70_000);
    }

    #[test]
    fn no_uid32_stores_overflow_id() {
        let state = InodeState {
            uid: 70_000,
            gid: 100,
            ..regular(0)
        };
        let raw = state.to_raw([DiskPtr::HOLE; N_BLOCKS], true).unwrap();
        assert_eq!(raw.uid_low, OVERFLOW_ID);
        assert_eq!(raw.uid_high, 0);
        assert_eq!(raw.gid_low, 100);
    }

    #[test]
    fn disk_size_not_size_is_encoded() {
        let mut state = regular(5 << 32);
        state.disk_size = 4096;
        let raw = state.to_raw([DiskPtr::HOLE; N_BLOCKS], false).unwrap();
        assert_eq!(raw.size_low, 4096);
        assert_eq!(raw.size_high, 0);

        state.disk_size = (3 << 32) + 7;
        let raw = state.to_raw([DiskPtr::HOLE; N_BLOCKS], false).unwrap();
        assert_eq!((raw.size_high, raw.size_low), (3, 7));
        assert_eq!(InodeState::from_raw(&raw, false).size, (3 << 32) + 7);
    }

    #[test]
    fn directory_ignores_size_high() {
        let raw = RawInode {
            mode: S_IFDIR | 0o755,
            size_low: 1024,
            size_high: 99,
            links_count: 2,
            ..RawInode::default()
        };
        assert_eq!(InodeState::from_raw(&raw, false).size, 1024);
    }

    #[test]
    fn pointers_are_kept_verbatim() {
        let mut block = [DiskPtr::HOLE; N_BLOCKS];
        block[0] = DiskPtr::from_block(0x0102_0304);
        let inode = Inode::new(InodeNumber(12), (BlockNumber(5), 0), block, regular(1));
        assert_eq!(inode.ptr(0).to_disk_bytes(), [4, 3, 2, 1]);
        assert_eq!(inode.ptr(0).get(), 0x0102_0304);
        assert!(inode.ptr(1).is_hole());
    }

    #[test]
    fn fast_symlink_detection_and_target() {
        let mut block = [DiskPtr::HOLE; N_BLOCKS];
        block[0] = DiskPtr::from_disk_bytes(*b"/tmp");
        block[1] = DiskPtr::from_disk_bytes(*b"/abc");
        let state = InodeState {
            mode: S_IFLNK | 0o777,
            size: 8,
            disk_size: 8,
            links_count: 1,
            ..InodeState::default()
        };
        let inode = Inode::new(InodeNumber(13), (BlockNumber(5), 128), block, state);
        assert!(inode.snapshot().is_fast_symlink(2));
        assert!(!inode.snapshot().can_truncate(2));
        assert_eq!(inode.fast_symlink_target(2).unwrap(), b"/tmp/abc");

        let slow = InodeState {
            blocks: 2,
            ..inode.snapshot()
        };
        assert!(!slow.is_fast_symlink(2));
        assert!(slow.can_truncate(2));
        // A symlink charged only with its ACL block is still fast.
        let acl = InodeState {
            blocks: 2,
            file_acl: 77,
            ..inode.snapshot()
        };
        assert!(acl.is_fast_symlink(2));
    }

    #[test]
    fn append_only_and_devices_not_truncatable() {
        let append = InodeState {
            flags: APPEND_FL,
            ..regular(10)
        };
        assert!(!append.can_truncate(2));
        let fifo = InodeState {
            mode: S_IFIFO | 0o600,
            ..regular(0)
        };
        assert!(!fifo.can_truncate(2));
        let journaled = InodeState {
            flags: JOURNAL_DATA_FL,
            ..regular(0)
        };
        assert!(journaled.can_truncate(2));
    }

    #[test]
    fn poisoned_inode_fails_checks() {
        let inode = Inode::poisoned(InodeNumber(40));
        assert!(matches!(inode.check_bad(), Err(JfsError::BadInode { ino: 40 })));
    }

    #[test]
    fn oversized_sector_count_is_rejected() {
        let state = InodeState {
            blocks: u64::from(u32::MAX) + 1,
            ..regular(0)
        };
        assert!(state.to_raw([DiskPtr::HOLE; N_BLOCKS], false).is_err());
    }
}
