//! The orphan list.
//!
//! Inodes whose truncate or delete is in flight are chained on disk from
//! the superblock's `last_orphan` through each inode's `dtime` field. The
//! in-memory list mirrors the chain, newest first, so removal knows which
//! predecessor to patch.

use crate::FsContext;
use crate::inode::Inode;
use jfs_error::{JfsError, Result};
use jfs_journal::Handle;
use jfs_ondisk::superblock::STATE_ERROR;
use jfs_types::InodeNumber;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// In-memory mirror of the on-disk orphan chain.
#[derive(Debug, Default)]
pub struct OrphanList {
    /// Head of the chain first.
    list: Mutex<Vec<Arc<Inode>>>,
}

impl OrphanList {
    /// Inode numbers in chain order.
    #[must_use]
    pub fn inodes(&self) -> Vec<InodeNumber> {
        self.list.lock().iter().map(|inode| inode.ino()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Drop `inode` from memory only, leaving the on-disk chain as is.
    pub fn forget_in_memory(&self, inode: &Inode) {
        let mut list = self.list.lock();
        if let Some(pos) = list.iter().position(|o| o.ino() == inode.ino()) {
            list.remove(pos);
            inode.set_on_orphan_list(false);
        }
    }

    /// Put an inode read back from the on-disk chain at the head.
    fn adopt(&self, inode: &Arc<Inode>) {
        let mut list = self.list.lock();
        if !inode.is_on_orphan_list() {
            list.insert(0, Arc::clone(inode));
            inode.set_on_orphan_list(true);
        }
    }
}

/// What one orphan recovery pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanReport {
    /// Unlinked inodes whose blocks and inode were released.
    pub deleted: u32,
    /// Live inodes whose interrupted truncate was finished.
    pub truncated: u32,
    /// The chain was not finished: the filesystem already had errors, or
    /// recovery hit one and the mount went read-only.
    pub skipped: bool,
}

fn ino_u32(ino: InodeNumber) -> Result<u32> {
    ino.to_u32().map_err(|_| JfsError::BadInode { ino: ino.0 })
}

impl FsContext {
    /// Put `inode` at the head of the orphan chain.
    ///
    /// A no-op when it is already on the list.
    pub fn orphan_add(&self, handle: &mut Handle<'_>, inode: &Arc<Inode>) -> Result<()> {
        let mut list = self.orphans.list.lock();
        if inode.is_on_orphan_list() {
            return Ok(());
        }
        let ino = ino_u32(inode.ino())?;
        let next = self
            .sb
            .modify(handle, |sb| std::mem::replace(&mut sb.last_orphan, ino))?;
        inode.lock_state().dtime = next;
        self.mark_dirty(handle, inode)?;
        list.insert(0, Arc::clone(inode));
        inode.set_on_orphan_list(true);
        debug!(target: "jfs::orphan", ino, next, "orphan_added");
        Ok(())
    }

    /// Unlink `inode` from the orphan chain.
    ///
    /// A no-op when it is not on the list.
    pub fn orphan_del(&self, handle: &mut Handle<'_>, inode: &Inode) -> Result<()> {
        let mut list = self.orphans.list.lock();
        let Some(pos) = list.iter().position(|o| o.ino() == inode.ino()) else {
            return Ok(());
        };
        let next = inode.lock_state().dtime;
        let entry = list.remove(pos);
        inode.set_on_orphan_list(false);
        if pos == 0 {
            self.sb.modify(handle, |sb| sb.last_orphan = next)?;
        } else {
            let prev = &list[pos - 1];
            prev.lock_state().dtime = next;
            self.mark_dirty(handle, prev)?;
        }
        inode.lock_state().dtime = 0;
        self.mark_dirty(handle, inode)?;
        drop(list);
        debug!(target: "jfs::orphan", ino = entry.ino().0, next, "orphan_removed");
        Ok(())
    }

    /// Finish every truncate and delete recorded on the orphan chain.
    ///
    /// Runs at mount. A filesystem already marked as having errors gets
    /// its chain discarded instead, since following it could free blocks
    /// twice.
    pub fn recover_orphans(&self) -> Result<OrphanReport> {
        let mut report = OrphanReport::default();
        let head = self.sb.last_orphan();
        if head == 0 {
            return Ok(report);
        }
        if self.sb.snapshot().state & STATE_ERROR != 0 {
            warn!(target: "jfs::orphan", head, "errors_on_filesystem_clearing_orphans");
            if !self.sb.is_read_only() {
                let mut handle = self.start(1)?;
                self.sb.modify(&mut handle, |sb| sb.last_orphan = 0)?;
                handle.stop()?;
            }
            report.skipped = true;
            return Ok(report);
        }
        if self.journal.is_aborted() {
            return Err(JfsError::ReadOnly);
        }

        let was_read_only = self.sb.is_read_only();
        if was_read_only {
            info!(target: "jfs::orphan", "recovering_orphans_on_read_only_fs");
            self.sb.set_read_only(false);
        }
        self.sb.set_recovering_orphans(true);
        let result = self.drain_orphans(&mut report);
        self.sb.set_recovering_orphans(false);
        let committed = if result.is_ok() {
            self.journal.force_commit()
        } else {
            Ok(())
        };
        if was_read_only {
            self.sb.set_read_only(true);
        }
        result?;
        committed?;
        if report.deleted > 0 || report.truncated > 0 {
            info!(
                target: "jfs::orphan",
                deleted = report.deleted,
                truncated = report.truncated,
                "orphans_recovered"
            );
        }
        Ok(report)
    }

    fn drain_orphans(&self, report: &mut OrphanReport) -> Result<()> {
        loop {
            let head = self.sb.last_orphan();
            if head == 0 {
                return Ok(());
            }
            let Some(inode) = self.orphan_get(InodeNumber(u64::from(head))) else {
                warn!(target: "jfs::orphan", ino = head, "bad_orphan_inode");
                let mut handle = self.start(1)?;
                self.sb.modify(&mut handle, |sb| sb.last_orphan = 0)?;
                return handle.stop();
            };
            self.orphans.adopt(&inode);
            if inode.snapshot().links_count > 0 {
                debug!(target: "jfs::orphan", ino = head, size = inode.snapshot().size, "truncating_orphan");
                self.truncate(&inode)?;
                report.truncated += 1;
            } else {
                debug!(target: "jfs::orphan", ino = head, "deleting_orphan");
                report.deleted += 1;
            }
            // The last reference to an unlinked inode deletes it here.
            self.iput(inode)?;
            if self.sb.last_orphan() == head {
                let detail = format!("orphan inode {head} was not consumed");
                self.sb.fs_error("recover_orphans", &detail);
                return Err(JfsError::Corruption {
                    block: 0,
                    detail,
                });
            }
        }
    }

    /// Load and validate one orphan chain entry.
    fn orphan_get(&self, ino: InodeNumber) -> Option<Arc<Inode>> {
        let geo = self.alloc.geometry();
        let max = u64::from(geo.total_inodes);
        if ino.0 < u64::from(geo.first_ino) || ino.0 > max {
            return None;
        }
        if !self.alloc.inode_in_use(ino).unwrap_or(false) {
            return None;
        }
        let inode = self.iget(ino);
        if inode.is_bad() || u64::from(inode.snapshot().dtime) > max {
            return None;
        }
        Some(inode)
    }
}
