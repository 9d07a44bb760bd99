//! Inode creation, attribute changes, link counting and deletion.

use crate::FsContext;
use crate::config::TransactionBudget;
use crate::inode::{FileType, Inode, InodeState};
use crate::path::max_file_size;
use jfs_error::{JfsError, Result};
use jfs_journal::Handle;
use jfs_types::{
    APPEND_FL, DiskPtr, FL_USER_MODIFIABLE, GroupNumber, IMMUTABLE_FL, JOURNAL_DATA_FL, N_BLOCKS,
    S_IFMT,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Largest link count an inode may carry.
pub const LINK_MAX: u16 = 32_000;

/// Attribute change request; `None` fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttr {
    pub size: Option<u64>,
    /// Permission bits; the file type is kept.
    pub mode: Option<u16>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
    /// User-modifiable inode flags.
    pub flags: Option<u32>,
}

impl SetAttr {
    #[must_use]
    pub fn size(size: u64) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }

    fn changes_owner(&self, state: &InodeState) -> bool {
        self.uid.is_some_and(|uid| uid != state.uid) || self.gid.is_some_and(|gid| gid != state.gid)
    }
}

/// Run `f` under a fresh handle and stop it, reporting the first error.
fn with_handle<R>(
    ctx: &FsContext,
    credits: u32,
    f: impl FnOnce(&mut Handle<'_>) -> Result<R>,
) -> Result<R> {
    let mut handle = ctx.start(credits)?;
    let result = f(&mut handle);
    let stopped = handle.stop();
    let out = result?;
    stopped?;
    Ok(out)
}

impl FsContext {
    /// Allocate and initialise a new inode near `dir`.
    ///
    /// Flags are inherited from `dir`; symlinks never inherit the
    /// append-only or immutable flags.
    pub fn create(&self, dir: Option<&Inode>, mode: u16, uid: u32, gid: u32) -> Result<Arc<Inode>> {
        let Some(file_type) = FileType::from_mode(mode) else {
            return Err(JfsError::InvalidArgument(format!("bad file mode {mode:#o}")));
        };
        let is_dir = file_type == FileType::Directory;
        let (parent_group, mut flags) = match dir {
            Some(dir) => {
                dir.check_bad()?;
                let (group, _) = self.alloc.geometry().inode_group(dir.ino());
                (group, dir.snapshot().flags & FL_USER_MODIFIABLE)
            }
            None => (GroupNumber(0), 0),
        };
        if file_type == FileType::Symlink {
            flags &= !(IMMUTABLE_FL | APPEND_FL);
        }

        let inode = with_handle(self, TransactionBudget::INODE_UPDATE + 2, |handle| {
            let ino = self.alloc.new_inode(handle, parent_group, is_dir)?;
            let location = self.alloc.inode_location(ino)?;
            let now = crate::unix_now();
            let state = InodeState {
                mode,
                uid,
                gid,
                links_count: if is_dir { 2 } else { 1 },
                atime: now,
                ctime: now,
                mtime: now,
                flags,
                generation: self.next_generation(),
                ..InodeState::default()
            };
            let inode = Arc::new(Inode::new(ino, location, [DiskPtr::HOLE; N_BLOCKS], state));
            if let Err(err) = self.mark_dirty(handle, &inode) {
                if let Err(free_err) = self.alloc.free_inode(handle, ino, is_dir) {
                    warn!(target: "jfs::inode", ino = ino.0, error = %free_err, "inode_release_failed");
                }
                return Err(err);
            }
            if inode.snapshot().is_sync() || self.options().sync {
                handle.set_sync();
            }
            Ok(inode)
        })?;
        self.inodes
            .lock()
            .insert(inode.ino(), Arc::downgrade(&inode));
        debug!(target: "jfs::inode", ino = inode.ino().0, mode, "inode_created");
        Ok(inode)
    }

    /// Add a name for `inode`.
    pub fn link(&self, inode: &Inode) -> Result<()> {
        inode.check_bad()?;
        let _io = inode.lock_io();
        with_handle(self, TransactionBudget::INODE_UPDATE, |handle| {
            {
                let mut state = inode.lock_state();
                if state.links_count >= LINK_MAX {
                    return Err(JfsError::InvalidArgument(format!(
                        "inode {} already has {LINK_MAX} links",
                        inode.ino().0
                    )));
                }
                state.links_count += 1;
                state.ctime = crate::unix_now();
            }
            self.mark_dirty(handle, inode)
        })
    }

    /// Drop a name of `inode`.
    ///
    /// The last name puts the inode on the orphan list; it is deleted when
    /// its last in-memory reference goes through [`iput`](Self::iput).
    pub fn unlink(&self, inode: &Arc<Inode>) -> Result<()> {
        inode.check_bad()?;
        let _io = inode.lock_io();
        with_handle(self, TransactionBudget::INODE_UPDATE, |handle| {
            let links = {
                let mut state = inode.lock_state();
                if state.links_count == 0 {
                    warn!(target: "jfs::inode", ino = inode.ino().0, "unlinking_nonexistent_file");
                    state.links_count = 1;
                }
                state.links_count -= 1;
                state.ctime = crate::unix_now();
                state.links_count
            };
            if links == 0 {
                self.orphan_add(handle, inode)?;
            }
            if inode.snapshot().is_sync() || self.options().sync {
                handle.set_sync();
            }
            self.mark_dirty(handle, inode)
        })
    }

    /// Apply an attribute change.
    ///
    /// A size change runs a truncate. Shrinking a regular file records the
    /// inode as an orphan with the new size in a transaction of its own
    /// first, so a crash anywhere in the truncate is finished at the next
    /// mount.
    pub fn setattr(&self, inode: &Arc<Inode>, attr: &SetAttr) -> Result<()> {
        inode.check_bad()?;
        if self.sb.is_read_only() {
            return Err(JfsError::ReadOnly);
        }
        let before = inode.snapshot();
        if let Some(size) = attr.size {
            if size != before.size && before.is_append_or_immutable() {
                return Err(JfsError::NotPermitted);
            }
            if size > max_file_size(self.block_size) {
                return Err(JfsError::FileTooLarge);
            }
        }

        if attr.changes_owner(&before) {
            with_handle(self, TransactionBudget::INODE_UPDATE, |handle| {
                {
                    let mut state = inode.lock_state();
                    if let Some(uid) = attr.uid {
                        state.uid = uid;
                    }
                    if let Some(gid) = attr.gid {
                        state.gid = gid;
                    }
                    state.ctime = crate::unix_now();
                }
                self.mark_dirty(handle, inode)
            })?;
        }

        if let Some(size) = attr.size.filter(|&size| before.is_reg() && size < before.size) {
            with_handle(self, TransactionBudget::INODE_UPDATE, |handle| {
                let added = self.orphan_add(handle, inode);
                inode.lock_state().disk_size = size;
                let dirtied = self.mark_dirty(handle, inode);
                added.and(dirtied)
            })?;
        }

        if let Some(flags) = attr.flags {
            if (flags ^ before.flags) & JOURNAL_DATA_FL != 0 {
                // Everything written under the old mode must be on disk
                // before the inode's data starts taking the other path.
                self.journal.force_commit()?;
                info!(
                    target: "jfs::inode",
                    ino = inode.ino().0,
                    journal_data = flags & JOURNAL_DATA_FL != 0,
                    "journal_data_toggled"
                );
            }
        }

        {
            let mut state = inode.lock_state();
            if let Some(mode) = attr.mode {
                state.mode = (state.mode & S_IFMT) | (mode & !S_IFMT);
            }
            if let Some(atime) = attr.atime {
                state.atime = atime;
            }
            if let Some(mtime) = attr.mtime {
                state.mtime = mtime;
            }
            if let Some(flags) = attr.flags {
                state.flags = (state.flags & !FL_USER_MODIFIABLE) | (flags & FL_USER_MODIFIABLE);
            }
            if attr.mode.is_some() || attr.flags.is_some() {
                state.ctime = crate::unix_now();
            }
            if let Some(size) = attr.size {
                state.size = size;
            }
        }

        if attr.size.is_some() {
            let result = self.truncate(inode);
            // A truncate that never got a handle leaves the in-memory entry.
            if inode.snapshot().links_count > 0 {
                self.orphans.forget_in_memory(inode);
            }
            return result;
        }
        with_handle(self, TransactionBudget::INODE_UPDATE, |handle| {
            self.mark_dirty(handle, inode)
        })
    }

    /// Release the blocks and the inode number of an unlinked inode.
    ///
    /// Called for the last reference to an inode without links. A bad
    /// inode is dropped from memory without touching the disk.
    pub fn delete_inode(&self, inode: &Arc<Inode>) -> Result<()> {
        if inode.is_bad() {
            self.orphans.forget_in_memory(inode);
            return Ok(());
        }
        let mut handle = match self.start(self.truncate_credits(inode)) {
            Ok(handle) => handle,
            Err(err) => {
                self.orphans.forget_in_memory(inode);
                return Err(err);
            }
        };
        let result = self.delete_in(&mut handle, inode);
        let stopped = handle.stop();
        result?;
        stopped
    }

    fn delete_in(&self, handle: &mut Handle<'_>, inode: &Arc<Inode>) -> Result<()> {
        let state = inode.snapshot();
        if state.is_sync() || self.options().sync {
            handle.set_sync();
        }
        inode.lock_state().size = 0;
        let has_map = (state.is_reg() || state.is_dir() || state.is_symlink())
            && !state.is_fast_symlink(self.block_size.sectors());
        if has_map && state.blocks > 0 {
            self.truncate_in(handle, inode, None)?;
        }
        self.orphan_del(handle, inode)?;
        inode.lock_state().dtime = crate::unix_now();
        // Never free an inode number whose record could not be updated.
        self.mark_dirty(handle, inode)?;
        self.alloc.free_inode(handle, inode.ino(), state.is_dir())?;
        inode.mark_bad();
        info!(
            target: "jfs::inode",
            ino = inode.ino().0,
            sectors_left = inode.snapshot().blocks,
            "inode_deleted"
        );
        Ok(())
    }
}
