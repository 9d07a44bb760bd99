//! The indirection tree: walking, growing and cutting an inode's block map.
//!
//! Lookups never lock the tree. A walk records, for every level, the
//! pointer it read and where it read it from; before trusting a walk the
//! allocator re-reads every recorded location and starts over if anything
//! moved. Growth happens under the shared side of the inode's truncate
//! lock, freeing under the exclusive side.

use crate::config::{DataMode, TransactionBudget};
use crate::inode::{Inode, InodeState};
use crate::path::{BlockPath, block_to_path};
use crate::FsContext;
use jfs_block::Buffer;
use jfs_error::{JfsError, Result};
use jfs_journal::Handle;
use jfs_types::{BlockNumber, DiskPtr, JOURNAL_DATA_FL, LogicalBlock, POINTER_SIZE, Slot};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Result of mapping one logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockMapping {
    Mapped {
        block: BlockNumber,
        /// Allocated by this call; its contents are garbage.
        new: bool,
        /// Last slot of its indirect block (or of the direct array).
        boundary: bool,
    },
    Hole,
}

impl BlockMapping {
    #[must_use]
    pub fn block(&self) -> Option<BlockNumber> {
        match self {
            Self::Mapped { block, .. } => Some(*block),
            Self::Hole => None,
        }
    }
}

// ── Chains ──────────────────────────────────────────────────────────────────

/// Where a pointer of the chain is stored.
#[derive(Debug, Clone)]
pub(crate) enum Location {
    /// Slot of the inode's own array.
    Inode(usize),
    /// Slot of an indirect block.
    Block { buf: Arc<Buffer>, index: usize },
}

impl Location {
    fn index(&self) -> usize {
        match self {
            Self::Inode(index) | Self::Block { index, .. } => *index,
        }
    }

    fn load(&self, inode: &Inode) -> Result<DiskPtr> {
        match self {
            Self::Inode(index) => Ok(inode.ptr(*index)),
            Self::Block { buf, index } => buf.ptr(*index),
        }
    }

    fn store(&self, inode: &Inode, ptr: DiskPtr) -> Result<()> {
        match self {
            Self::Inode(index) => {
                inode.set_ptr(*index, ptr);
                Ok(())
            }
            Self::Block { buf, index } => buf.set_ptr(*index, ptr),
        }
    }
}

/// One step of a walk: the pointer read and where it came from.
#[derive(Debug, Clone)]
pub(crate) struct Indirect {
    key: DiskPtr,
    loc: Location,
}

/// True when every recorded pointer still holds the value that was read.
fn verify_chain(inode: &Inode, chain: &[Indirect]) -> bool {
    chain
        .iter()
        .all(|step| step.loc.load(inode).is_ok_and(|now| now == step.key))
}

#[derive(Debug)]
enum Outcome {
    /// Every level resolved; the last key is the data block.
    Complete,
    /// The last step read a zero pointer.
    Hole,
    /// The block the last step points to could not be read.
    Failed(JfsError),
    /// A recorded pointer changed while the walk was blocked.
    Changed,
}

#[derive(Debug)]
struct Walk {
    chain: Vec<Indirect>,
    outcome: Outcome,
}

/// Growing the tree lost a race and must walk again.
#[derive(Debug)]
enum TreeError {
    Again,
    Fs(JfsError),
}

impl From<JfsError> for TreeError {
    fn from(err: JfsError) -> Self {
        Self::Fs(err)
    }
}

/// A freshly allocated, not yet attached sub-chain.
#[derive(Debug, Default)]
struct NewBranch {
    /// One block per missing level, top first; the last is the data block.
    keys: Vec<BlockNumber>,
    /// Buffers of the new indirect blocks (`keys[..len - 1]`).
    bufs: Vec<Arc<Buffer>>,
}

/// Container of a pointer range being freed.
pub(crate) enum Parent<'a> {
    /// The inode's own slots.
    Inode,
    /// An indirect block still referenced by the tree.
    Block(&'a Arc<Buffer>),
    /// A subtree root already cut out of the tree.
    Detached(DiskPtr),
}

impl Parent<'_> {
    fn get(&self, inode: &Inode, index: usize) -> Result<DiskPtr> {
        match self {
            Self::Inode => Ok(inode.ptr(index)),
            Self::Block(buf) => buf.ptr(index),
            Self::Detached(ptr) => Ok(*ptr),
        }
    }

    fn clear(&self, inode: &Inode, index: usize) -> Result<()> {
        match self {
            Self::Inode => {
                inode.set_ptr(index, DiskPtr::HOLE);
                Ok(())
            }
            Self::Block(buf) => buf.set_ptr(index, DiskPtr::HOLE),
            Self::Detached(_) => Ok(()),
        }
    }

    fn buffer(&self) -> Option<&Arc<Buffer>> {
        match self {
            Self::Block(buf) => Some(buf),
            Self::Inode | Self::Detached(_) => None,
        }
    }
}

/// What survives a partial truncate, as computed by `find_shared`.
#[derive(Debug)]
pub(crate) struct Shared {
    /// Path down to the deepest pointer that stays.
    pub(crate) chain: Vec<Indirect>,
    /// Root of a subtree to free whole, or a hole.
    pub(crate) top: DiskPtr,
    /// First slot to clear in the block holding the last chain entry.
    pub(crate) first_clear: usize,
}

impl Shared {
    /// Indirect block holding entry `idx` and the entry's slot.
    pub(crate) fn block_at(&self, idx: usize) -> Option<(&Arc<Buffer>, usize)> {
        match &self.chain.get(idx)?.loc {
            Location::Block { buf, index } => Some((buf, *index)),
            Location::Inode(_) => None,
        }
    }

    /// Inode slot of the first entry.
    pub(crate) fn root_slot(&self) -> usize {
        self.chain.first().map_or(0, |step| step.loc.index())
    }
}

fn to_ptr(block: BlockNumber) -> Result<DiskPtr> {
    block
        .to_u32()
        .map(DiskPtr::from_block)
        .map_err(|e| JfsError::Corruption {
            block: block.0,
            detail: format!("block number does not fit a pointer: {e}"),
        })
}

fn ptr_block(ptr: DiskPtr) -> BlockNumber {
    BlockNumber(u64::from(ptr.get()))
}

impl FsContext {
    // ── Lookup ──────────────────────────────────────────────────────────────

    /// Map `block` of `inode`, allocating when `create` is set.
    ///
    /// Allocation needs a handle with at least
    /// [`TransactionBudget::write_credits`] credits, opened while holding
    /// [`Inode::lock_io`]. A truncate of the same inode restarts its
    /// transaction under the exclusive map lock, so a handle opened first
    /// and then blocked here would never stop.
    pub fn get_block(
        &self,
        handle: Option<&mut Handle<'_>>,
        inode: &Inode,
        block: LogicalBlock,
        create: bool,
    ) -> Result<BlockMapping> {
        inode.check_bad()?;
        let path = block_to_path(self.block_size, block)?;
        if !create {
            return self.map_block(inode, &path);
        }
        let Some(handle) = handle else {
            return Err(JfsError::InvalidArgument(
                "allocating a block needs a journal handle".to_owned(),
            ));
        };
        let _shared = inode.truncate_lock().read();
        self.alloc_path(handle, inode, block, &path)
    }

    fn map_block(&self, inode: &Inode, path: &BlockPath) -> Result<BlockMapping> {
        loop {
            let walk = self.get_branch(inode, path.offsets());
            match walk.outcome {
                Outcome::Complete => return self.mapped(inode, &walk.chain, path, false),
                Outcome::Hole => return Ok(BlockMapping::Hole),
                Outcome::Failed(err) => return Err(err),
                Outcome::Changed => {
                    trace!(target: "jfs::tree", ino = inode.ino().0, "chain_changed");
                }
            }
        }
    }

    fn mapped(
        &self,
        inode: &Inode,
        chain: &[Indirect],
        path: &BlockPath,
        new: bool,
    ) -> Result<BlockMapping> {
        let leaf = chain.last().map_or(DiskPtr::HOLE, |step| step.key);
        let block = self.check_ptr(inode, leaf, true, "get_block")?;
        Ok(BlockMapping::Mapped {
            block,
            new,
            boundary: path.is_boundary(),
        })
    }

    /// Follow `offsets` from the inode as far as the tree goes.
    fn get_branch(&self, inode: &Inode, offsets: &[usize]) -> Walk {
        let mut chain = Vec::with_capacity(offsets.len());
        let root = Location::Inode(offsets[0]);
        let key = inode.ptr(offsets[0]);
        chain.push(Indirect { key, loc: root });
        if key.is_hole() {
            return Walk {
                chain,
                outcome: Outcome::Hole,
            };
        }
        for &offset in &offsets[1..] {
            let parent = chain[chain.len() - 1].key;
            let buf = match self.read_indirect(inode, parent, true) {
                Ok(buf) => buf,
                Err(err) => {
                    return Walk {
                        chain,
                        outcome: Outcome::Failed(err),
                    };
                }
            };
            if !verify_chain(inode, &chain) {
                return Walk {
                    chain,
                    outcome: Outcome::Changed,
                };
            }
            let key = match buf.ptr(offset) {
                Ok(key) => key,
                Err(err) => {
                    return Walk {
                        chain,
                        outcome: Outcome::Failed(err),
                    };
                }
            };
            chain.push(Indirect {
                key,
                loc: Location::Block { buf, index: offset },
            });
            if key.is_hole() {
                return Walk {
                    chain,
                    outcome: Outcome::Hole,
                };
            }
        }
        Walk {
            chain,
            outcome: Outcome::Complete,
        }
    }

    /// Validate a tree pointer and return the block it names.
    ///
    /// A pointer outside the data area or into group metadata is an
    /// inconsistency; with `poison` the inode is also marked bad.
    fn check_ptr(
        &self,
        inode: &Inode,
        ptr: DiskPtr,
        poison: bool,
        function: &'static str,
    ) -> Result<BlockNumber> {
        let block = ptr_block(ptr);
        if block.0 < self.cache.block_count() && !self.alloc.is_system_zone(block, 1) {
            return Ok(block);
        }
        self.sb.fs_error(
            function,
            &format!("inode {} references invalid block {}", inode.ino().0, block.0),
        );
        if poison {
            inode.mark_bad();
        }
        Err(JfsError::Corruption {
            block: block.0,
            detail: format!("invalid block pointer in inode {}", inode.ino().0),
        })
    }

    fn read_indirect(&self, inode: &Inode, ptr: DiskPtr, poison: bool) -> Result<Arc<Buffer>> {
        let block = self.check_ptr(inode, ptr, poison, "read_indirect")?;
        self.cache.read(block)
    }

    // ── Growth ──────────────────────────────────────────────────────────────

    fn alloc_path(
        &self,
        handle: &mut Handle<'_>,
        inode: &Inode,
        block: LogicalBlock,
        path: &BlockPath,
    ) -> Result<BlockMapping> {
        let offsets = path.offsets();
        loop {
            let walk = self.get_branch(inode, offsets);
            match walk.outcome {
                Outcome::Complete => return self.mapped(inode, &walk.chain, path, false),
                Outcome::Failed(err) => return Err(err),
                Outcome::Changed => continue,
                Outcome::Hole => {}
            }
            let chain = walk.chain;
            let partial = chain.len() - 1;
            let goal = match self.find_goal(inode, block, &chain) {
                Ok(goal) => goal,
                Err(TreeError::Again) => continue,
                Err(TreeError::Fs(err)) => return Err(err),
            };
            let branch = self.alloc_branch(handle, inode, goal, &offsets[partial..])?;
            let leaf = branch.keys[branch.keys.len() - 1];
            match self.splice_branch(handle, inode, block, &chain, branch) {
                Ok(()) => {
                    trace!(
                        target: "jfs::tree",
                        ino = inode.ino().0,
                        logical = block.0,
                        block = leaf.0,
                        levels = offsets.len() - partial,
                        "branch_spliced"
                    );
                    return Ok(BlockMapping::Mapped {
                        block: leaf,
                        new: true,
                        boundary: path.is_boundary(),
                    });
                }
                Err(TreeError::Again) => {
                    debug!(target: "jfs::tree", ino = inode.ino().0, logical = block.0, "splice_raced");
                }
                Err(TreeError::Fs(err)) => return Err(err),
            }
        }
    }

    /// Preferred physical block for a new allocation at `block`.
    fn find_goal(
        &self,
        inode: &Inode,
        block: LogicalBlock,
        chain: &[Indirect],
    ) -> std::result::Result<BlockNumber, TreeError> {
        let hinted = {
            let mut state = inode.lock_state();
            if block.0 == state.next_alloc_block + 1 && state.next_alloc_goal != 0 {
                state.next_alloc_block += 1;
                state.next_alloc_goal += 1;
            }
            (block.0 == state.next_alloc_block && state.next_alloc_goal != 0)
                .then_some(BlockNumber(state.next_alloc_goal))
        };
        if !verify_chain(inode, chain) {
            return Err(TreeError::Again);
        }
        match hinted {
            Some(goal) => Ok(goal),
            None => Ok(self.find_near(inode, &chain[chain.len() - 1])?),
        }
    }

    /// Locality goal from the hole's neighbours.
    fn find_near(&self, inode: &Inode, hole: &Indirect) -> Result<BlockNumber> {
        match &hole.loc {
            Location::Inode(index) => {
                if let Some(ptr) = (0..*index).rev().map(|i| inode.ptr(i)).find(|p| !p.is_hole()) {
                    return Ok(ptr_block(ptr));
                }
                let geo = self.alloc.geometry();
                let (group, _) = geo.inode_group(inode.ino());
                let colour = self.colour() * (geo.blocks_per_group / 16);
                Ok(BlockNumber(geo.group_first_block(group).0 + u64::from(colour)))
            }
            Location::Block { buf, index } => {
                for i in (0..*index).rev() {
                    let ptr = buf.ptr(i)?;
                    if !ptr.is_hole() {
                        return Ok(ptr_block(ptr));
                    }
                }
                Ok(buf.block())
            }
        }
    }

    /// Allocate one block per missing level and link them top-down.
    ///
    /// `offsets[0]` is the hole's slot; `offsets[1..]` are the slots to fill
    /// inside each new indirect block. On failure everything allocated
    /// here is released again.
    fn alloc_branch(
        &self,
        handle: &mut Handle<'_>,
        inode: &Inode,
        goal: BlockNumber,
        offsets: &[usize],
    ) -> Result<NewBranch> {
        let mut branch = NewBranch::default();
        if let Err(err) = self.grow_branch(handle, inode, goal, offsets, &mut branch) {
            warn!(
                target: "jfs::tree",
                ino = inode.ino().0,
                allocated = branch.keys.len(),
                error = %err,
                "alloc_branch_failed"
            );
            self.abandon_branch(handle, inode, &branch);
            return Err(err);
        }
        Ok(branch)
    }

    fn grow_branch(
        &self,
        handle: &mut Handle<'_>,
        inode: &Inode,
        goal: BlockNumber,
        offsets: &[usize],
        branch: &mut NewBranch,
    ) -> Result<()> {
        let mut parent = self.alloc_block(handle, inode, goal)?;
        branch.keys.push(parent);
        for &offset in &offsets[1..] {
            let child = self.alloc_block(handle, inode, parent)?;
            branch.keys.push(child);
            let buf = self.cache.get(parent)?;
            handle.get_write_access(&buf)?;
            buf.zero();
            buf.set_ptr(offset, to_ptr(child)?)?;
            handle.dirty_metadata(&buf)?;
            branch.bufs.push(buf);
            parent = child;
        }
        Ok(())
    }

    fn abandon_branch(&self, handle: &mut Handle<'_>, inode: &Inode, branch: &NewBranch) {
        for buf in &branch.bufs {
            if let Err(err) = handle.forget(buf) {
                warn!(target: "jfs::tree", block = buf.block().0, error = %err, "forget_failed");
            }
        }
        for &block in &branch.keys {
            if let Err(err) = self.free_charged(handle, inode, block, 1) {
                warn!(target: "jfs::tree", block = block.0, error = %err, "release_failed");
            }
        }
    }

    /// Attach `branch` at the hole that ends `chain`.
    fn splice_branch(
        &self,
        handle: &mut Handle<'_>,
        inode: &Inode,
        block: LogicalBlock,
        chain: &[Indirect],
        branch: NewBranch,
    ) -> std::result::Result<(), TreeError> {
        let partial = chain.len() - 1;
        let hole = &chain[partial];
        if let Location::Block { buf, .. } = &hole.loc {
            if let Err(err) = handle.get_write_access(buf) {
                self.abandon_branch(handle, inode, &branch);
                return Err(err.into());
            }
        }
        let attached = (|| -> Result<bool> {
            let mut state = inode.lock_state();
            if !verify_chain(inode, &chain[..partial]) || !hole.loc.load(inode)?.is_hole() {
                return Ok(false);
            }
            hole.loc.store(inode, to_ptr(branch.keys[0])?)?;
            state.next_alloc_block = block.0;
            state.next_alloc_goal = branch.keys[branch.keys.len() - 1].0;
            state.ctime = crate::unix_now();
            Ok(true)
        })();
        match attached {
            Ok(true) => {}
            Ok(false) => {
                self.abandon_branch(handle, inode, &branch);
                return Err(TreeError::Again);
            }
            Err(err) => {
                self.abandon_branch(handle, inode, &branch);
                return Err(err.into());
            }
        }
        self.mark_dirty(handle, inode)?;
        if let Location::Block { buf, .. } = &hole.loc {
            handle.dirty_metadata(buf)?;
        }
        Ok(())
    }

    /// Allocate one block near `goal` and charge it to `inode`.
    fn alloc_block(&self, handle: &mut Handle<'_>, inode: &Inode, goal: BlockNumber) -> Result<BlockNumber> {
        let block = self.alloc.new_block(handle, goal)?;
        inode.lock_state().blocks += self.block_size.sectors();
        Ok(block)
    }

    /// Release `count` blocks from `start` and uncharge them from `inode`.
    ///
    /// A range the allocator refuses as inconsistent is recorded as a
    /// filesystem error and otherwise skipped.
    fn free_charged(
        &self,
        handle: &mut Handle<'_>,
        inode: &Inode,
        start: BlockNumber,
        count: u64,
    ) -> Result<()> {
        let result = self.alloc.free_blocks(handle, start, count);
        {
            let mut state = inode.lock_state();
            state.blocks = state
                .blocks
                .saturating_sub(count * self.block_size.sectors());
        }
        match result {
            Err(err) if err.is_corruption() => {
                self.sb.fs_error(
                    "free_blocks",
                    &format!("inode {}: {err}", inode.ino().0),
                );
                Ok(())
            }
            other => other,
        }
    }

    // ── Freeing ─────────────────────────────────────────────────────────────

    /// Data of this inode goes through the journal like metadata.
    pub fn journals_data(&self, state: &InodeState) -> bool {
        !state.is_reg()
            || self.options().data_mode == DataMode::Journal
            || state.flags & JOURNAL_DATA_FL != 0
    }

    /// Drop a freed block from the journal.
    ///
    /// Blocks whose old contents could be in the journal are revoked so no
    /// stale copy is ever written over a later owner; plain data blocks,
    /// and everything under full data journaling, are only forgotten.
    fn forget(
        &self,
        handle: &mut Handle<'_>,
        inode: &Inode,
        is_metadata: bool,
        buf: Option<&Arc<Buffer>>,
        block: BlockNumber,
    ) -> Result<()> {
        let journal_data = self.journals_data(&inode.lock_state());
        if self.options().data_mode == DataMode::Journal || (!is_metadata && !journal_data) {
            if let Some(buf) = buf {
                handle.forget(buf)?;
            }
            return Ok(());
        }
        handle.revoke(block)
    }

    pub(crate) fn truncate_credits(&self, inode: &Inode) -> u32 {
        let sectors = inode.lock_state().blocks;
        self.budget.truncate_credits(sectors, self.block_size)
    }

    /// Whether the handle is low and could not be grown in place, so the
    /// caller must restart it.
    fn must_restart(&self, handle: &mut Handle<'_>, inode: &Inode) -> Result<bool> {
        if !TransactionBudget::needs_more(handle.credits()) {
            return Ok(false);
        }
        let credits = self.truncate_credits(inode);
        Ok(!handle.extend(credits)?)
    }

    /// Commit what has been done so far and continue in a new transaction.
    pub(crate) fn restart_truncate(&self, handle: &mut Handle<'_>, inode: &Inode) -> Result<()> {
        self.mark_dirty(handle, inode)?;
        let credits = self.truncate_credits(inode);
        debug!(target: "jfs::truncate", ino = inode.ino().0, tid = handle.tid(), credits, "truncate_restart");
        handle.restart(credits)
    }

    /// Free the data blocks named in `slots` of `parent`, one allocator
    /// call per physically contiguous run.
    pub(crate) fn free_data(
        &self,
        handle: &mut Handle<'_>,
        inode: &Inode,
        parent: &Parent<'_>,
        slots: Range<usize>,
    ) -> Result<()> {
        if let Some(buf) = parent.buffer() {
            handle.get_write_access(buf)?;
        }
        // (first block, length, first slot) of the pending run.
        let mut run: Option<(u64, u64, usize)> = None;
        for i in slots.clone() {
            let Some(block) = parent.get(inode, i)?.slot().block() else {
                continue;
            };
            run = match run {
                None => Some((block.0, 1, i)),
                Some((start, count, first)) if block.0 == start + count => Some((start, count + 1, first)),
                Some((start, count, first)) => {
                    self.clear_blocks(handle, inode, parent, BlockNumber(start), count, first..i)?;
                    Some((block.0, 1, i))
                }
            };
        }
        if let Some((start, count, first)) = run {
            self.clear_blocks(handle, inode, parent, BlockNumber(start), count, first..slots.end)?;
        }
        if let Some(buf) = parent.buffer() {
            handle.dirty_metadata(buf)?;
        }
        Ok(())
    }

    /// Zero `slots` and free the run `start..start + count` they named.
    fn clear_blocks(
        &self,
        handle: &mut Handle<'_>,
        inode: &Inode,
        parent: &Parent<'_>,
        start: BlockNumber,
        count: u64,
        slots: Range<usize>,
    ) -> Result<()> {
        if self.must_restart(handle, inode)? {
            if let Some(buf) = parent.buffer() {
                handle.dirty_metadata(buf)?;
            }
            self.restart_truncate(handle, inode)?;
            if let Some(buf) = parent.buffer() {
                handle.get_write_access(buf)?;
            }
        }
        for i in slots {
            let Some(block) = parent.get(inode, i)?.slot().block() else {
                continue;
            };
            parent.clear(inode, i)?;
            let cached = self.cache.lookup(block);
            self.forget(handle, inode, false, cached.as_ref(), block)?;
        }
        self.free_charged(handle, inode, start, count)
    }

    /// Free every subtree named in `slots` of `parent`, `depth` levels of
    /// indirection deep, bottom-up and right to left.
    pub(crate) fn free_branches(
        &self,
        handle: &mut Handle<'_>,
        inode: &Inode,
        parent: &Parent<'_>,
        slots: Range<usize>,
        depth: usize,
    ) -> Result<()> {
        if depth == 0 {
            return self.free_data(handle, inode, parent, slots);
        }
        let ptrs = self.cache.block_size() / POINTER_SIZE;
        for i in slots.rev() {
            if handle.journal().is_aborted() {
                return Err(JfsError::ReadOnly);
            }
            let ptr = parent.get(inode, i)?;
            let Slot::Allocated(block) = ptr.slot() else {
                continue;
            };
            let buf = match self.read_indirect(inode, ptr, false) {
                Ok(buf) => buf,
                Err(err) => {
                    if !err.is_corruption() {
                        self.sb.fs_error(
                            "free_branches",
                            &format!("read failure, inode {}, block {}: {err}", inode.ino().0, block.0),
                        );
                    }
                    warn!(target: "jfs::truncate", ino = inode.ino().0, block = block.0, "skipping_unreadable_branch");
                    continue;
                }
            };
            self.free_branches(handle, inode, &Parent::Block(&buf), 0..ptrs, depth - 1)?;
            // The zeroed child must commit no later than the frees of the
            // blocks it named, so any restart happens before it is revoked.
            if self.must_restart(handle, inode)? {
                self.restart_truncate(handle, inode)?;
            }
            self.forget(handle, inode, true, Some(&buf), block)?;
            drop(buf);
            // Revoke, free and unlink from the parent in one transaction.
            self.free_charged(handle, inode, block, 1)?;
            if let Some(pbuf) = parent.buffer() {
                handle.get_write_access(pbuf)?;
                pbuf.set_ptr(i, DiskPtr::HOLE)?;
                handle.dirty_metadata(pbuf)?;
            }
        }
        Ok(())
    }

    /// Find the part of the branch at `offsets` that must survive a
    /// truncate to the first block it addresses.
    pub(crate) fn find_shared(&self, inode: &Inode, offsets: &[usize]) -> Result<Shared> {
        let mut k = offsets.len();
        while k > 1 && offsets[k - 1] == 0 {
            k -= 1;
        }
        let walk = self.get_branch(inode, &offsets[..k]);
        if let Outcome::Failed(err) = &walk.outcome {
            warn!(target: "jfs::truncate", ino = inode.ino().0, error = %err, "shared_branch_unreadable");
        }
        let mut chain = walk.chain;
        let partial = chain.len() - 1;

        // The hole was filled since the walk: the new branch survives.
        let last = &chain[partial];
        if last.key.is_hole() && !last.loc.load(inode)?.is_hole() {
            let first_clear = last.loc.index() + 1;
            return Ok(Shared {
                chain,
                top: DiskPtr::HOLE,
                first_clear,
            });
        }

        let mut p = partial;
        while p > 0 && self.all_zeroes(&chain[p])? {
            p -= 1;
        }
        let (top, first_clear) = if p == k - 1 && p > 0 {
            // The whole rest of the branch is ours and hangs off an
            // indirect block: clear from the split slot itself.
            (DiskPtr::HOLE, chain[p].loc.index())
        } else {
            // Leave the tree intact; the caller frees `top` and clears it.
            (chain[p].loc.load(inode)?, chain[p].loc.index() + 1)
        };
        chain.truncate(p + 1);
        Ok(Shared {
            chain,
            top,
            first_clear,
        })
    }

    /// Every slot left of `step` in its block is a hole.
    fn all_zeroes(&self, step: &Indirect) -> Result<bool> {
        let Location::Block { buf, index } = &step.loc else {
            return Ok(false);
        };
        for i in 0..*index {
            if !buf.ptr(i)?.is_hole() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
