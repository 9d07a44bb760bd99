//! Loading and committing on-disk inodes.

use crate::FsContext;
use crate::inode::{FileType, Inode, InodeState};
use jfs_error::{JfsError, Result};
use jfs_journal::Handle;
use jfs_ondisk::RawInode;
use jfs_ondisk::superblock::RO_COMPAT_LARGE_FILE;
use jfs_types::InodeNumber;
use tracing::{debug, info, trace};

/// Sizes above this need the large-file feature.
const LARGE_FILE_THRESHOLD: u64 = 0x7FFF_FFFF;

impl FsContext {
    /// Load `ino` from the inode table.
    ///
    /// Never fails: an inode that cannot be read or makes no sense comes
    /// back poisoned. Unreadable and malformed records are also reported
    /// through [`fs_error`](crate::SuperInfo::fs_error); an unlinked inode
    /// outside orphan recovery is simply stale.
    pub fn read_inode(&self, ino: InodeNumber) -> Inode {
        match self.load_inode(ino) {
            Ok(inode) => inode,
            Err(err) => {
                if !matches!(err, JfsError::StaleInode { .. }) {
                    self.sb.fs_error("read_inode", &format!("inode {}: {err}", ino.0));
                }
                debug!(target: "jfs::inode", ino = ino.0, error = %err, "inode_poisoned");
                Inode::poisoned(ino)
            }
        }
    }

    fn load_inode(&self, ino: InodeNumber) -> Result<Inode> {
        let geo = self.alloc.geometry();
        let reserved_ok = ino == InodeNumber::ROOT || ino == InodeNumber::JOURNAL;
        if (!reserved_ok && ino.0 < u64::from(geo.first_ino)) || ino.0 > u64::from(geo.total_inodes) {
            return Err(JfsError::BadInode { ino: ino.0 });
        }
        let location = self.alloc.inode_location(ino)?;
        let (block, offset) = location;
        let buf = self.cache.read(block)?;
        let raw = RawInode::parse_from_bytes(&buf.read()[offset..]).map_err(|e| {
            JfsError::Corruption {
                block: block.0,
                detail: format!("inode {}: {e}", ino.0),
            }
        })?;
        drop(buf);

        if raw.links_count == 0 && (raw.mode == 0 || !self.sb.is_recovering_orphans()) {
            return Err(JfsError::StaleInode { ino: ino.0 });
        }
        if FileType::from_mode(raw.mode).is_none() {
            return Err(JfsError::Corruption {
                block: block.0,
                detail: format!("inode {} has bogus mode {:#o}", ino.0, raw.mode),
            });
        }
        let state = InodeState::from_raw(&raw, self.options().no_uid32);
        trace!(
            target: "jfs::inode",
            ino = ino.0,
            size = state.size,
            blocks = state.blocks,
            links = state.links_count,
            "inode_loaded"
        );
        Ok(Inode::new(ino, location, raw.block, state))
    }

    /// Re-encode `inode` into its table block under `handle`.
    ///
    /// Safe to call repeatedly in one transaction: only the first call
    /// consumes a credit.
    pub fn mark_dirty(&self, handle: &mut Handle<'_>, inode: &Inode) -> Result<()> {
        inode.check_bad()?;
        let (block, offset) = inode.location();
        let buf = self.cache.read(block)?;
        handle.get_write_access(&buf)?;
        let needs_large_file = {
            let state = inode.lock_state();
            let raw = state.to_raw(inode.pointers(), self.options().no_uid32)?;
            raw.write_to_bytes(&mut buf.write()[offset..])
                .map_err(|e| JfsError::Corruption {
                    block: block.0,
                    detail: format!("inode {}: {e}", inode.ino().0),
                })?;
            state.is_reg() && state.disk_size > LARGE_FILE_THRESHOLD
        };
        if needs_large_file && !self.sb.has_ro_compat(RO_COMPAT_LARGE_FILE) {
            self.sb.modify(handle, |sb| sb.feature_ro_compat |= RO_COMPAT_LARGE_FILE)?;
            handle.set_sync();
            info!(target: "jfs::super", ino = inode.ino().0, "large_file_feature_set");
        }
        handle.dirty_metadata(&buf)
    }

    /// After a data write: commit now if the write, the inode or the mount
    /// asks for synchronous semantics.
    pub fn commit_on_write(&self, inode: &Inode, sync_write: bool) -> Result<()> {
        if sync_write || self.options().sync || inode.snapshot().is_sync() {
            self.journal.force_commit()?;
        }
        Ok(())
    }

    /// Flush `inode`.
    ///
    /// Inode changes are already journaled by [`mark_dirty`](Self::mark_dirty),
    /// so only a synchronous request does anything: it commits the running
    /// transaction.
    pub fn write_inode(&self, inode: &Inode, sync: bool) -> Result<()> {
        inode.check_bad()?;
        if sync {
            self.journal.force_commit()?;
        }
        Ok(())
    }
}
