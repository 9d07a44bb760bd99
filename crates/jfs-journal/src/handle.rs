//! Per-operation journal handles.

use crate::Journal;
use jfs_block::Buffer;
use jfs_error::Result;
use jfs_types::BlockNumber;
use std::sync::Arc;
use tracing::warn;

/// An open update against the running transaction.
///
/// A handle owns a number of buffer credits; every distinct buffer first
/// dirtied through it consumes one. Dropping a handle without calling
/// [`Handle::stop`] stops it and discards the error.
#[derive(Debug)]
pub struct Handle<'j> {
    journal: &'j Journal,
    tid: u64,
    credits: u32,
    sync: bool,
    active: bool,
}

impl<'j> Handle<'j> {
    pub(crate) fn new(journal: &'j Journal, tid: u64, credits: u32) -> Self {
        Self {
            journal,
            tid,
            credits,
            sync: false,
            active: true,
        }
    }

    #[must_use]
    pub fn journal(&self) -> &'j Journal {
        self.journal
    }

    /// Transaction this handle is attached to.
    #[must_use]
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// Credits not yet consumed.
    #[must_use]
    pub fn credits(&self) -> u32 {
        self.credits
    }

    #[must_use]
    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// Make `stop` wait until the transaction reaches the device.
    pub fn set_sync(&mut self) {
        self.sync = true;
    }

    /// Try to add `credits` to this handle inside the same transaction.
    ///
    /// `Ok(false)` means the transaction cannot grow; the caller should
    /// [`restart`](Self::restart).
    pub fn extend(&mut self, credits: u32) -> Result<bool> {
        let granted = self.journal.handle_extend(self.tid, credits)?;
        if granted {
            self.credits += credits;
        }
        Ok(granted)
    }

    /// Close the current transaction and continue in a fresh one with
    /// `credits`. Everything dirtied so far commits together.
    pub fn restart(&mut self, credits: u32) -> Result<()> {
        self.active = false;
        self.tid = self
            .journal
            .handle_restart(self.tid, self.credits, credits)?;
        self.credits = credits;
        self.active = true;
        Ok(())
    }

    /// Declare intent to modify `buf`.
    pub fn get_write_access(&mut self, buf: &Arc<Buffer>) -> Result<()> {
        if self.journal.handle_write_access(buf)? {
            self.consume(buf.block());
        }
        Ok(())
    }

    /// Record `buf` as modified metadata of this transaction.
    pub fn dirty_metadata(&mut self, buf: &Arc<Buffer>) -> Result<()> {
        if self.journal.handle_dirty_metadata(buf)? {
            self.consume(buf.block());
        }
        Ok(())
    }

    /// Record `buf` as file data to be written before this transaction's
    /// metadata.
    pub fn dirty_data(&mut self, buf: &Arc<Buffer>) -> Result<()> {
        self.journal.handle_dirty_data(buf)
    }

    /// Drop any pending write of `buf`. Used for buffers that become garbage
    /// inside the transaction that dirtied them.
    pub fn forget(&mut self, buf: &Arc<Buffer>) -> Result<()> {
        if self.journal.handle_forget(buf.block())? {
            self.credits += 1;
        }
        Ok(())
    }

    /// Forget `block` and make sure no earlier pending copy of it is
    /// written once it is freed.
    pub fn revoke(&mut self, block: BlockNumber) -> Result<()> {
        self.journal.handle_revoke(block)
    }

    /// Detach from the transaction.
    pub fn stop(mut self) -> Result<()> {
        if !self.active {
            // A failed restart already detached this handle.
            return self.journal.check_aborted();
        }
        self.active = false;
        self.journal.handle_stop(self.tid, self.credits, self.sync)
    }

    fn consume(&mut self, block: BlockNumber) {
        if self.credits == 0 {
            warn!(
                target: "jfs::journal",
                tid = self.tid,
                block = block.0,
                "handle_out_of_credits"
            );
            return;
        }
        self.credits -= 1;
    }
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            let _ = self.journal.handle_stop(self.tid, self.credits, self.sync);
        }
    }
}
