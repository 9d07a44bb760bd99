//! Cutting a file back to its current size.
//!
//! A truncate may span several transactions. The inode goes on the orphan
//! list and its on-disk size is shortened in the first one; from then on
//! every intermediate commit leaves a tree that a later truncate to the
//! same size can finish, which is exactly what orphan recovery does.

use crate::FsContext;
use crate::inode::Inode;
use crate::path::{BlockPath, block_to_path};
use crate::tree::{BlockMapping, Parent};
use jfs_block::Buffer;
use jfs_error::{JfsError, Result};
use jfs_journal::Handle;
use jfs_types::{DIND_BLOCK, DiskPtr, IND_BLOCK, LogicalBlock, NDIR_BLOCKS, POINTER_SIZE, TIND_BLOCK};
use std::sync::Arc;
use tracing::{debug, info};

impl FsContext {
    /// Free every block of `inode` past its current size.
    ///
    /// Inodes without a block map (devices, fast symlinks) and append-only
    /// or immutable files are left alone.
    pub fn truncate(&self, inode: &Arc<Inode>) -> Result<()> {
        inode.check_bad()?;
        let state = inode.snapshot();
        if !state.can_truncate(self.block_size.sectors()) {
            debug!(target: "jfs::truncate", ino = inode.ino().0, mode = state.mode, "truncate_skipped");
            return Ok(());
        }
        // Read before the handle exists so no I/O waits inside the transaction.
        let boundary = self.preload_boundary(inode, state.size)?;
        let mut handle = self.start(self.truncate_credits(inode))?;
        let result = self.truncate_in(&mut handle, inode, boundary.as_ref());
        let stopped = handle.stop();
        result?;
        stopped
    }

    /// The partially kept block at the new end of file, if it is mapped.
    pub(crate) fn preload_boundary(&self, inode: &Inode, size: u64) -> Result<Option<Arc<Buffer>>> {
        if self.block_size.offset_in_block(size) == 0 {
            return Ok(None);
        }
        let logical = self.block_size.byte_to_block(size);
        match self.get_block(None, inode, logical, false)? {
            BlockMapping::Mapped { block, .. } => Ok(Some(self.cache.read(block)?)),
            BlockMapping::Hole => Ok(None),
        }
    }

    /// Truncate inside the caller's transaction.
    pub(crate) fn truncate_in(
        &self,
        handle: &mut Handle<'_>,
        inode: &Arc<Inode>,
        boundary: Option<&Arc<Buffer>>,
    ) -> Result<()> {
        let (size, blocks_before) = {
            let state = inode.lock_state();
            (state.size, state.blocks)
        };
        let first_freed = LogicalBlock(self.block_size.blocks_for_size(size));
        let path = match block_to_path(self.block_size, first_freed) {
            Ok(path) => Some(path),
            Err(JfsError::FileTooLarge) => None,
            Err(err) => return Err(err),
        };

        if let Some(buf) = boundary {
            self.zero_tail(handle, inode, buf, self.block_size.offset_in_block(size))?;
        }

        if let Some(path) = path {
            self.orphan_add(handle, inode)?;
            inode.lock_state().disk_size = size;
            self.mark_dirty(handle, inode)?;
            {
                let _exclusive = inode.truncate_lock().write();
                self.free_tree(handle, inode, &path)?;
            }
            let now = crate::unix_now();
            {
                let mut state = inode.lock_state();
                state.mtime = now;
                state.ctime = now;
            }
        } else {
            // Nothing addressable lies past the new size.
            inode.lock_state().disk_size = size;
        }
        self.mark_dirty(handle, inode)?;

        let state = inode.snapshot();
        if state.is_sync() || self.options().sync {
            handle.set_sync();
        }
        // An unlinked inode keeps its orphan record until it is deleted.
        if state.links_count > 0 {
            self.orphan_del(handle, inode)?;
        }
        info!(
            target: "jfs::truncate",
            ino = inode.ino().0,
            size,
            sectors_before = blocks_before,
            sectors_after = state.blocks,
            "truncated"
        );
        Ok(())
    }

    /// Zero the boundary block past the new end of file and journal it the
    /// way this inode's data is journaled.
    fn zero_tail(&self, handle: &mut Handle<'_>, inode: &Inode, buf: &Arc<Buffer>, offset: usize) -> Result<()> {
        let journal_data = self.journals_data(&inode.lock_state());
        if journal_data {
            handle.get_write_access(buf)?;
        }
        buf.write()[offset..].fill(0);
        self.dirty_file_data(handle, buf, journal_data)
    }

    /// Free everything from the block `path` addresses to the end of the map.
    fn free_tree(&self, handle: &mut Handle<'_>, inode: &Inode, path: &BlockPath) -> Result<()> {
        let offsets = path.offsets();
        let n = offsets.len();
        let ptrs = self.cache.block_size() / POINTER_SIZE;

        if n == 1 {
            self.free_data(handle, inode, &Parent::Inode, offsets[0]..NDIR_BLOCKS)?;
        } else {
            let shared = self.find_shared(inode, offsets)?;
            let last = shared.chain.len() - 1;
            if !shared.top.is_hole() {
                let depth = n - 1 - last;
                match shared.block_at(last) {
                    None => {
                        self.free_branches(handle, inode, &Parent::Detached(shared.top), 0..1, depth)?;
                        inode.set_ptr(shared.root_slot(), DiskPtr::HOLE);
                    }
                    Some((buf, index)) => {
                        self.free_branches(handle, inode, &Parent::Block(buf), index..index + 1, depth)?;
                    }
                }
            }
            // Clear the right-hand ends of the blocks on the kept branch.
            for idx in (1..=last).rev() {
                let Some((buf, index)) = shared.block_at(idx) else {
                    continue;
                };
                let start = if idx == last { shared.first_clear } else { index + 1 };
                self.free_branches(handle, inode, &Parent::Block(buf), start..ptrs, n - 1 - idx)?;
            }
        }

        // Whole subtrees right of the cut.
        let first_whole = if offsets[0] < NDIR_BLOCKS {
            IND_BLOCK
        } else {
            offsets[0] + 1
        };
        for (slot, depth) in [(IND_BLOCK, 1), (DIND_BLOCK, 2), (TIND_BLOCK, 3)] {
            if slot < first_whole {
                continue;
            }
            let root = inode.ptr(slot);
            if root.is_hole() {
                continue;
            }
            self.free_branches(handle, inode, &Parent::Detached(root), 0..1, depth)?;
            inode.set_ptr(slot, DiskPtr::HOLE);
        }
        Ok(())
    }
}
