#![forbid(unsafe_code)]
//! Inode engine for jfs.
//!
//! This crate owns everything between an inode number and the journaled
//! blocks behind it: loading and committing inodes, mapping logical blocks
//! through the fifteen-slot indirection tree, growing that tree under a
//! journal handle, shrinking it with a crash-safe truncate, and the
//! superblock-anchored orphan list that makes an interrupted truncate or
//! delete resumable.
//!
//! All state hangs off one [`FsContext`] per mounted filesystem.

pub mod config;
mod file;
pub mod inode;
mod lifecycle;
mod metadata;
mod orphan;
pub mod path;
pub mod super_info;
mod tree;
mod truncate;

pub use config::{DataMode, ErrorBehavior, MountOptions, TransactionBudget};
pub use inode::{FileType, Inode, InodeState};
pub use lifecycle::{LINK_MAX, SetAttr};
pub use orphan::{OrphanList, OrphanReport};
pub use path::{BlockPath, block_to_path, max_file_size};
pub use super_info::SuperInfo;
pub use tree::BlockMapping;

use jfs_alloc::{Allocator, FsGeometry};
use jfs_block::BufferCache;
use jfs_error::{JfsError, Result};
use jfs_journal::{Handle, Journal};
use jfs_ondisk::Superblock;
use jfs_types::{BlockSize, InodeNumber};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Number of allocation colours a group is split into.
const COLOURS: u32 = 16;

/// Per-mount engine state.
pub struct FsContext {
    cache: Arc<BufferCache>,
    journal: Arc<Journal>,
    alloc: Allocator,
    sb: SuperInfo,
    orphans: OrphanList,
    budget: TransactionBudget,
    block_size: BlockSize,
    inodes: Mutex<HashMap<InodeNumber, Weak<Inode>>>,
    /// Spreads the first allocations of concurrent writers across a group.
    colour: u32,
    next_generation: AtomicU32,
}

impl std::fmt::Debug for FsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsContext")
            .field("block_size", &self.block_size)
            .field("budget", &self.budget)
            .field("sb", &self.sb)
            .field("cached_inodes", &self.inodes.lock().len())
            .finish_non_exhaustive()
    }
}

impl FsContext {
    /// Build the engine over a validated superblock.
    pub fn new(cache: Arc<BufferCache>, sb: Superblock, opts: MountOptions) -> Result<Self> {
        let geo = FsGeometry::from_superblock(&sb)?;
        let block_size = BlockSize::new(geo.block_size)
            .map_err(|e| JfsError::InvalidGeometry(e.to_string()))?;
        if cache.block_size() != block_size.bytes() {
            return Err(JfsError::InvalidGeometry(format!(
                "device block size {} does not match superblock {}",
                cache.block_size(),
                block_size.get()
            )));
        }
        let budget = TransactionBudget::new(
            opts.max_truncate_credits,
            opts.journal.max_transaction_credits,
        )?;
        let journal = Arc::new(Journal::new(Arc::clone(&cache), opts.journal));
        let alloc = Allocator::load(Arc::clone(&cache), geo)?;
        let seed = sb.wtime ^ u32::from(sb.mnt_count);
        let sb = SuperInfo::new(Arc::clone(&cache), Arc::clone(&journal), sb, opts)?;
        Ok(Self {
            cache,
            journal,
            alloc,
            sb,
            orphans: OrphanList::default(),
            budget,
            block_size,
            inodes: Mutex::new(HashMap::new()),
            colour: std::process::id() % COLOURS,
            next_generation: AtomicU32::new(seed),
        })
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    #[must_use]
    pub fn super_info(&self) -> &SuperInfo {
        &self.sb
    }

    #[must_use]
    pub fn orphans(&self) -> &OrphanList {
        &self.orphans
    }

    #[must_use]
    pub fn budget(&self) -> TransactionBudget {
        self.budget
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        self.sb.options()
    }

    pub(crate) fn colour(&self) -> u32 {
        self.colour
    }

    pub(crate) fn next_generation(&self) -> u32 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a journal handle, failing fast on a read-only mount.
    pub fn start(&self, credits: u32) -> Result<Handle<'_>> {
        if self.sb.is_read_only() {
            return Err(JfsError::ReadOnly);
        }
        self.journal.start(credits)
    }

    // ── Inode cache ─────────────────────────────────────────────────────────

    /// The in-memory inode for `ino`, loading it on first use.
    ///
    /// Inodes that fail to load come back poisoned rather than as an error;
    /// every later operation on them fails with `BadInode`.
    pub fn iget(&self, ino: InodeNumber) -> Arc<Inode> {
        let mut inodes = self.inodes.lock();
        if let Some(inode) = inodes.get(&ino).and_then(Weak::upgrade) {
            return inode;
        }
        inodes.retain(|_, weak| weak.strong_count() > 0);
        let inode = Arc::new(self.read_inode(ino));
        inodes.insert(ino, Arc::downgrade(&inode));
        inode
    }

    /// Inode already in memory, if any.
    #[must_use]
    pub fn cached(&self, ino: InodeNumber) -> Option<Arc<Inode>> {
        self.inodes.lock().get(&ino).and_then(Weak::upgrade)
    }

    /// Release a reference; the last reference to an unlinked inode deletes it.
    pub fn iput(&self, inode: Arc<Inode>) -> Result<()> {
        if inode.is_bad() || inode.snapshot().links_count > 0 {
            return Ok(());
        }
        let last = {
            let mut inodes = self.inodes.lock();
            let pinned = usize::from(inode.is_on_orphan_list());
            let last = Arc::strong_count(&inode) - pinned <= 1;
            if last {
                inodes.remove(&inode.ino());
            }
            last
        };
        if !last {
            return Ok(());
        }
        debug!(target: "jfs::inode", ino = inode.ino().0, "final_iput");
        self.delete_inode(&inode)
    }
}

/// Seconds since the epoch as stored in inode timestamps.
#[must_use]
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}
