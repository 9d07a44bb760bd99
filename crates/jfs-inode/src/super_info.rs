//! Mounted superblock state and error handling.

use crate::config::{ErrorBehavior, MountOptions};
use jfs_alloc::AllocTotals;
use jfs_block::{Buffer, BufferCache};
use jfs_error::{JfsError, Result};
use jfs_journal::{Handle, Journal};
use jfs_ondisk::Superblock;
use jfs_ondisk::superblock::{STATE_ERROR, STATE_VALID};
use jfs_types::{BlockNumber, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// The mounted superblock.
///
/// The parsed copy is authoritative; every change is re-encoded into the
/// cached superblock buffer under a journal handle so it commits with the
/// metadata it describes.
pub struct SuperInfo {
    cache: Arc<BufferCache>,
    journal: Arc<Journal>,
    buf: Arc<Buffer>,
    /// Byte offset of the superblock inside `buf`.
    offset: usize,
    sb: Mutex<Superblock>,
    opts: MountOptions,
    errors: ErrorBehavior,
    read_only: AtomicBool,
    recovering_orphans: AtomicBool,
}

impl std::fmt::Debug for SuperInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperInfo")
            .field("block", &self.buf.block())
            .field("errors", &self.errors)
            .field("read_only", &self.is_read_only())
            .finish_non_exhaustive()
    }
}

/// Device block holding the superblock and its offset within it.
#[must_use]
pub fn superblock_location(block_size: usize) -> (BlockNumber, usize) {
    if block_size > SUPERBLOCK_OFFSET {
        (BlockNumber(0), SUPERBLOCK_OFFSET)
    } else {
        (BlockNumber((SUPERBLOCK_OFFSET / block_size) as u64), 0)
    }
}

impl SuperInfo {
    pub fn new(
        cache: Arc<BufferCache>,
        journal: Arc<Journal>,
        sb: Superblock,
        opts: MountOptions,
    ) -> Result<Self> {
        let (block, offset) = superblock_location(cache.block_size());
        let buf = cache.read(block)?;
        let errors = opts
            .errors
            .unwrap_or_else(|| ErrorBehavior::from_superblock(sb.errors));
        Ok(Self {
            cache,
            journal,
            buf,
            offset,
            sb: Mutex::new(sb),
            read_only: AtomicBool::new(opts.read_only),
            opts,
            errors,
            recovering_orphans: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> Superblock {
        self.sb.lock().clone()
    }

    #[must_use]
    pub fn has_ro_compat(&self, mask: u32) -> bool {
        self.sb.lock().has_ro_compat(mask)
    }

    /// Head of the on-disk orphan chain.
    #[must_use]
    pub fn last_orphan(&self) -> u32 {
        self.sb.lock().last_orphan
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.opts
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire) || self.journal.is_aborted()
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    #[must_use]
    pub fn is_recovering_orphans(&self) -> bool {
        self.recovering_orphans.load(Ordering::Acquire)
    }

    pub(crate) fn set_recovering_orphans(&self, on: bool) {
        self.recovering_orphans.store(on, Ordering::Release);
    }

    /// Change the superblock inside `handle`'s transaction.
    pub fn modify<R>(&self, handle: &mut Handle<'_>, f: impl FnOnce(&mut Superblock) -> R) -> Result<R> {
        handle.get_write_access(&self.buf)?;
        let out = {
            let mut sb = self.sb.lock();
            let out = f(&mut sb);
            self.encode(&sb)?;
            out
        };
        handle.dirty_metadata(&self.buf)?;
        Ok(out)
    }

    fn encode(&self, sb: &Superblock) -> Result<()> {
        let mut data = self.buf.write();
        sb.write_region(&mut data[self.offset..self.offset + SUPERBLOCK_SIZE])
            .map_err(|e| JfsError::Corruption {
                block: self.buf.block().0,
                detail: format!("superblock encode: {e}"),
            })
    }

    /// Record a detected inconsistency and react per the error behavior.
    ///
    /// The error state is written straight to the device so it survives a
    /// journal abort. Callers must not hold the superblock lock or an inode
    /// state lock.
    pub fn fs_error(&self, function: &'static str, detail: &str) {
        error!(target: "jfs::super", function, detail, behavior = ?self.errors, "fs_error");
        let sb = {
            let mut sb = self.sb.lock();
            sb.state |= STATE_ERROR;
            sb.error_count = sb.error_count.saturating_add(1);
            if let Err(err) = self.encode(&sb) {
                warn!(target: "jfs::super", error = %err, "error_state_encode_failed");
            }
            sb.clone()
        };
        if !self.journal.is_aborted() && !self.read_only.load(Ordering::Acquire) {
            if let Err(err) = self.write_error_state(&sb) {
                warn!(target: "jfs::super", error = %err, "error_state_write_failed");
            }
        }
        match self.errors {
            ErrorBehavior::Continue => {}
            ErrorBehavior::RemountReadOnly | ErrorBehavior::Panic => {
                error!(target: "jfs::super", function, "remounting_read_only");
                self.journal.abort();
                self.set_read_only(true);
            }
        }
    }

    /// Patch the error fields of the on-device superblock, leaving the rest
    /// as last committed.
    fn write_error_state(&self, current: &Superblock) -> Result<()> {
        let dev = self.cache.device();
        let block = self.buf.block();
        let mut raw = dev.read_block(block)?.into_inner();
        let region = &mut raw[self.offset..self.offset + SUPERBLOCK_SIZE];
        let mut on_disk = Superblock::parse_region(region).map_err(|e| JfsError::Corruption {
            block: block.0,
            detail: format!("superblock: {e}"),
        })?;
        on_disk.state |= STATE_ERROR;
        on_disk.error_count = current.error_count;
        on_disk
            .write_region(region)
            .map_err(|e| JfsError::Corruption {
                block: block.0,
                detail: format!("superblock encode: {e}"),
            })?;
        dev.write_block(block, &raw)?;
        dev.sync()
    }

    /// Mark the filesystem in use: clear the clean flag and count the mount.
    pub fn mark_mounted(&self, now: u32) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        let mut handle = self.journal.start(1)?;
        self.modify(&mut handle, |sb| {
            sb.state &= !STATE_VALID;
            sb.mnt_count = sb.mnt_count.saturating_add(1);
            sb.mtime = now;
        })?;
        handle.set_sync();
        handle.stop()
    }

    /// Final superblock update at unmount.
    pub fn commit_super(&self, totals: AllocTotals, clean: bool, now: u32) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        let mut handle = self.journal.start(1)?;
        let state = self.modify(&mut handle, |sb| {
            sb.free_blocks_count = u32::try_from(totals.free_blocks).unwrap_or(u32::MAX);
            sb.free_inodes_count = u32::try_from(totals.free_inodes).unwrap_or(u32::MAX);
            sb.wtime = now;
            if clean && sb.state & STATE_ERROR == 0 {
                sb.state |= STATE_VALID;
            }
            sb.state
        })?;
        handle.set_sync();
        handle.stop()?;
        info!(target: "jfs::super", state, clean, "superblock_committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_location_by_block_size() {
        assert_eq!(superblock_location(1024), (BlockNumber(1), 0));
        assert_eq!(superblock_location(2048), (BlockNumber(0), 1024));
        assert_eq!(superblock_location(4096), (BlockNumber(0), 1024));
    }
}
