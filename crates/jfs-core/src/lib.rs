#![forbid(unsafe_code)]
//! Formatting, mounting and the file-level API of jfs.
//!
//! [`format`] lays an empty filesystem onto a byte device. [`Filesystem`]
//! mounts one: it validates the superblock, builds the buffer cache, the
//! journal and the inode engine, and finishes any truncate or delete left
//! on the orphan list by an earlier crash before handing out inodes.
//!
//! Crash behavior is observable in process: keep a clone of a
//! [`MemByteDevice`](jfs_block::MemByteDevice), drop the mounted
//! filesystem without [`Filesystem::unmount`], and mount the clone.

mod format;
mod report;

pub use format::{FormatOptions, format};
pub use report::{FsReport, FsState, InodeReport};

pub use jfs_block::{ByteDevice, FileByteDevice, MemByteDevice};
pub use jfs_error::{JfsError, Result};
pub use jfs_inode::{
    BlockMapping, DataMode, ErrorBehavior, FileType, FsContext, Inode, InodeState, MountOptions,
    OrphanReport, SetAttr, TransactionBudget,
};
pub use jfs_journal::JournalConfig;
pub use jfs_types::{InodeNumber, LogicalBlock, S_IFDIR, S_IFREG};

use jfs_block::{BufferCache, ByteBlockDevice, read_superblock_region};
use jfs_ondisk::Superblock;
use jfs_ondisk::superblock::SUPPORTED_RO_COMPAT;
use jfs_types::SUPER_MAGIC;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Soft limit on cached blocks per mount.
const CACHE_CAPACITY: usize = 4096;

/// Read and validate the superblock of `dev` without mounting.
pub fn read_superblock(dev: &dyn ByteDevice) -> Result<Superblock> {
    let region = read_superblock_region(dev)?;
    let sb = Superblock::parse_region(&region)
        .map_err(|e| JfsError::Format(format!("superblock: {e}")))?;
    if sb.magic != SUPER_MAGIC {
        return Err(JfsError::Format(format!(
            "bad superblock magic {:#06x}",
            sb.magic
        )));
    }
    sb.validate()
        .map_err(|e| JfsError::Format(format!("superblock: {e}")))?;
    Ok(sb)
}

/// Summary of the filesystem on `dev`, from its superblock alone.
pub fn inspect(dev: &dyn ByteDevice) -> Result<FsReport> {
    read_superblock(dev).map(|sb| FsReport::from_superblock(&sb))
}

/// A mounted filesystem.
pub struct Filesystem {
    ctx: FsContext,
    recovery: OrphanReport,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("ctx", &self.ctx)
            .field("recovery", &self.recovery)
            .finish()
    }
}

impl Filesystem {
    /// Mount the image at `path`. An image that cannot be opened for
    /// writing mounts read-only.
    pub fn open(path: impl AsRef<Path>, opts: MountOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        let mut opts = opts;
        if !dev.is_writable() && !opts.read_only {
            info!(target: "jfs::mount", "image_not_writable_mounting_read_only");
            opts.read_only = true;
        }
        Self::mount(dev, opts)
    }

    /// Mount the filesystem on `dev`.
    ///
    /// A superblock recording errors mounts read-only unless
    /// [`MountOptions::force`] is set. Orphan recovery runs before this
    /// returns; its outcome is available from [`recovery`](Self::recovery).
    pub fn mount<D: ByteDevice + 'static>(dev: D, opts: MountOptions) -> Result<Self> {
        let sb = read_superblock(&dev)?;
        let mut opts = opts;
        if sb.has_error_state() && !opts.read_only && !opts.force {
            warn!(target: "jfs::mount", "filesystem_has_errors_mounting_read_only");
            opts.read_only = true;
        }
        if sb.feature_ro_compat & !SUPPORTED_RO_COMPAT != 0 && !opts.read_only {
            return Err(JfsError::Format(format!(
                "unsupported read-only-compatible features {:#x}; mount read-only",
                sb.feature_ro_compat & !SUPPORTED_RO_COMPAT
            )));
        }
        if !sb.is_clean() && !opts.read_only {
            warn!(target: "jfs::mount", mnt_count = sb.mnt_count, "mounting_unclean_filesystem");
        }
        let block_size = sb
            .block_size()
            .ok_or_else(|| JfsError::Format("bad s_log_block_size".to_owned()))?;
        let needed = u64::from(sb.blocks_count) * u64::from(block_size);
        if dev.len_bytes() < needed {
            return Err(JfsError::Format(format!(
                "device holds {} bytes, filesystem needs {needed}",
                dev.len_bytes()
            )));
        }

        let block_dev = ByteBlockDevice::new(dev, block_size)?;
        let cache = Arc::new(BufferCache::new(Arc::new(block_dev), CACHE_CAPACITY)?);
        let ctx = FsContext::new(cache, sb, opts)?;
        ctx.super_info().mark_mounted(jfs_inode::unix_now())?;
        let recovery = match ctx.recover_orphans() {
            Ok(report) => report,
            // An error that stopped the journal leaves a read-only mount
            // for the next check to repair.
            Err(err) if ctx.journal().is_aborted() => {
                error!(target: "jfs::mount", error = %err, "orphan_recovery_failed_mounting_read_only");
                ctx.super_info().set_read_only(true);
                OrphanReport {
                    skipped: true,
                    ..OrphanReport::default()
                }
            }
            Err(err) => return Err(err),
        };
        info!(
            target: "jfs::mount",
            block_size,
            read_only = ctx.super_info().is_read_only(),
            data_mode = ?ctx.options().data_mode,
            orphans_deleted = recovery.deleted,
            orphans_truncated = recovery.truncated,
            "mounted"
        );
        Ok(Self { ctx, recovery })
    }

    /// Engine behind this mount.
    #[must_use]
    pub fn context(&self) -> &FsContext {
        &self.ctx
    }

    /// What orphan recovery did at mount.
    #[must_use]
    pub fn recovery(&self) -> OrphanReport {
        self.recovery
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.ctx.super_info().is_read_only()
    }

    // ── Inodes ──────────────────────────────────────────────────────────────

    /// The in-memory inode `ino`, failing if it cannot be used.
    pub fn inode(&self, ino: InodeNumber) -> Result<Arc<Inode>> {
        let inode = self.ctx.iget(ino);
        inode.check_bad()?;
        Ok(inode)
    }

    pub fn root(&self) -> Result<Arc<Inode>> {
        self.inode(InodeNumber::ROOT)
    }

    /// Create an inode with one link (two for a directory).
    pub fn create(&self, dir: Option<&Inode>, mode: u16, uid: u32, gid: u32) -> Result<Arc<Inode>> {
        self.ctx.create(dir, mode, uid, gid)
    }

    pub fn link(&self, inode: &Inode) -> Result<()> {
        self.ctx.link(inode)
    }

    /// Drop a link. The inode is deleted once it has no links and its last
    /// reference is [`release`](Self::release)d.
    pub fn unlink(&self, inode: &Arc<Inode>) -> Result<()> {
        self.ctx.unlink(inode)
    }

    /// Give up a reference obtained from this filesystem.
    pub fn release(&self, inode: Arc<Inode>) -> Result<()> {
        self.ctx.iput(inode)
    }

    pub fn setattr(&self, inode: &Arc<Inode>, attr: &SetAttr) -> Result<()> {
        let _io = inode.lock_io();
        self.ctx.setattr(inode, attr)
    }

    /// Set the size of `inode`, freeing every block past it.
    pub fn truncate(&self, inode: &Arc<Inode>, size: u64) -> Result<()> {
        self.setattr(inode, &SetAttr::size(size))
    }

    /// Flush `inode`; `sync` waits for its transaction to commit.
    pub fn write_inode(&self, inode: &Inode, sync: bool) -> Result<()> {
        self.ctx.write_inode(inode, sync)
    }

    // ── Data ────────────────────────────────────────────────────────────────

    /// Map a logical block, allocating it when `create` is set.
    pub fn get_block(&self, inode: &Inode, block: LogicalBlock, create: bool) -> Result<BlockMapping> {
        if !create {
            return self.ctx.get_block(None, inode, block, false);
        }
        // Taken before the handle: a truncate of this inode restarts its
        // transaction while excluding allocators, and would wait on us.
        let _io = inode.lock_io();
        let credits = TransactionBudget::write_credits(self.ctx.journals_data(&inode.snapshot()));
        let mut handle = self.ctx.start(credits)?;
        let mapped = self.ctx.get_block(Some(&mut handle), inode, block, true);
        let stopped = handle.stop();
        let mapping = mapped?;
        stopped?;
        Ok(mapping)
    }

    pub fn write_at(&self, inode: &Inode, offset: u64, data: &[u8], sync: bool) -> Result<usize> {
        self.ctx.write_at(inode, offset, data, sync)
    }

    pub fn read_at(&self, inode: &Inode, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.ctx.read_at(inode, offset, len)
    }

    // ── Whole filesystem ────────────────────────────────────────────────────

    /// Commit the running transaction and write back unjournaled data.
    pub fn sync(&self) -> Result<()> {
        self.ctx.journal().force_commit()?;
        self.ctx.cache().sync_dirty()?;
        Ok(())
    }

    #[must_use]
    pub fn report(&self) -> FsReport {
        let mut report = FsReport::from_superblock(&self.ctx.super_info().snapshot());
        let totals = self.ctx.allocator().totals();
        report.free_blocks = totals.free_blocks;
        report.free_inodes = totals.free_inodes;
        report.journal = Some(self.ctx.journal().stats());
        report
    }

    /// Commit everything and mark the filesystem clean.
    ///
    /// A mount whose journal aborted has nothing left to write and is
    /// simply dropped.
    pub fn unmount(self) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.journal().is_aborted() {
            warn!(target: "jfs::mount", "unmounting_after_journal_abort");
            return Ok(());
        }
        if ctx.super_info().is_read_only() {
            info!(target: "jfs::mount", read_only = true, "unmounted");
            return Ok(());
        }
        ctx.journal().force_commit()?;
        ctx.cache().sync_dirty()?;
        let clean = ctx.orphans().is_empty();
        ctx.super_info()
            .commit_super(ctx.allocator().totals(), clean, jfs_inode::unix_now())?;
        ctx.cache().sync_dirty()?;
        info!(target: "jfs::mount", clean, "unmounted");
        Ok(())
    }
}
