//! Shared buffer cache.
//!
//! Every device block that metadata code touches is represented by exactly
//! one [`Buffer`] while anyone holds a reference to it. Callers get an
//! `Arc<Buffer>`; dropping the `Arc` is the release. Dirty buffers are only
//! written when the owner asks (`write_back` / `sync_dirty`), so the journal
//! alone decides when metadata reaches the device.

use crate::BlockDevice;
use jfs_error::{JfsError, Result};
use jfs_types::{BlockNumber, DiskPtr, read_ptr, write_ptr};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace};

/// One cached device block.
#[derive(Debug)]
pub struct Buffer {
    block: BlockNumber,
    data: RwLock<Vec<u8>>,
    uptodate: AtomicBool,
    dirty: AtomicBool,
    journaled: AtomicBool,
}

impl Buffer {
    fn new(block: BlockNumber, block_size: usize) -> Self {
        Self {
            block,
            data: RwLock::new(vec![0_u8; block_size]),
            uptodate: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            journaled: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.uptodate.load(Ordering::Acquire)
    }

    pub fn set_uptodate(&self) {
        self.uptodate.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Owned by a running transaction; only its commit may write it.
    #[must_use]
    pub fn is_journaled(&self) -> bool {
        self.journaled.load(Ordering::Acquire)
    }

    pub fn set_journaled(&self, journaled: bool) {
        self.journaled.store(journaled, Ordering::Release);
    }

    /// Zero the whole block and mark it up to date (the `getblk` + memset idiom).
    pub fn zero(&self) {
        self.data.write().fill(0);
        self.set_uptodate();
    }

    /// Pointer `index` of this block viewed as an indirect block.
    pub fn ptr(&self, index: usize) -> Result<DiskPtr> {
        read_ptr(&self.data.read(), index).map_err(|err| JfsError::Corruption {
            block: self.block.0,
            detail: format!("pointer slot {index}: {err}"),
        })
    }

    pub fn set_ptr(&self, index: usize, ptr: DiskPtr) -> Result<()> {
        write_ptr(&mut self.data.write(), index, ptr).map_err(|err| JfsError::Corruption {
            block: self.block.0,
            detail: format!("pointer slot {index}: {err}"),
        })
    }
}

/// Counters exposed for tests and the CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub cached: usize,
}

/// Block cache handing out shared buffers (`bread` / `getblk` semantics).
pub struct BufferCache {
    dev: Arc<dyn BlockDevice>,
    block_size: usize,
    capacity: usize,
    buffers: Mutex<HashMap<BlockNumber, Arc<Buffer>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("cached", &self.buffers.lock().len())
            .finish_non_exhaustive()
    }
}

impl BufferCache {
    /// Wrap `dev`. `capacity` is a soft limit: only clean, unreferenced
    /// buffers are ever evicted.
    pub fn new(dev: Arc<dyn BlockDevice>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(JfsError::Format(
                "BufferCache capacity must be > 0".to_owned(),
            ));
        }
        let block_size = usize::try_from(dev.block_size())
            .map_err(|_| JfsError::Format("block_size does not fit usize".to_owned()))?;
        Ok(Self {
            dev,
            block_size,
            capacity,
            buffers: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.dev.block_count()
    }

    /// Buffer for `block` without reading it; contents may be stale.
    pub fn get(&self, block: BlockNumber) -> Result<Arc<Buffer>> {
        if block.0 >= self.dev.block_count() {
            return Err(JfsError::Corruption {
                block: block.0,
                detail: format!("block beyond device end {}", self.dev.block_count()),
            });
        }
        let mut buffers = self.buffers.lock();
        if let Some(buf) = buffers.get(&block) {
            return Ok(Arc::clone(buf));
        }
        if buffers.len() >= self.capacity {
            let before = buffers.len();
            buffers.retain(|_, buf| Arc::strong_count(buf) > 1 || buf.is_dirty());
            trace!(
                target: "jfs::cache",
                evicted = before - buffers.len(),
                "cache_shrink"
            );
        }
        let buf = Arc::new(Buffer::new(block, self.block_size));
        buffers.insert(block, Arc::clone(&buf));
        drop(buffers);
        Ok(buf)
    }

    /// Cached buffer for `block`, if any (`get_hash_table`).
    #[must_use]
    pub fn lookup(&self, block: BlockNumber) -> Option<Arc<Buffer>> {
        self.buffers.lock().get(&block).cloned()
    }

    /// Buffer for `block`, read from the device if not already up to date.
    pub fn read(&self, block: BlockNumber) -> Result<Arc<Buffer>> {
        let buf = self.get(block)?;
        if buf.is_uptodate() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(buf);
        }
        let mut data = buf.write();
        if !buf.is_uptodate() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            let raw = self.dev.read_block(block)?;
            data.copy_from_slice(raw.as_slice());
            buf.set_uptodate();
        }
        drop(data);
        Ok(buf)
    }

    /// Write the buffer's current contents to the device and clear dirty.
    pub fn write_back(&self, buf: &Buffer) -> Result<()> {
        let data = buf.read();
        self.dev.write_block(buf.block(), &data)?;
        drop(data);
        buf.clear_dirty();
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Discard any pending write for `block` (`bforget`).
    pub fn forget(&self, block: BlockNumber) {
        if let Some(buf) = self.buffers.lock().get(&block) {
            buf.clear_dirty();
        }
    }

    /// Write every dirty buffer not owned by a transaction and flush the device.
    pub fn sync_dirty(&self) -> Result<usize> {
        let mut dirty: Vec<Arc<Buffer>> = self
            .buffers
            .lock()
            .values()
            .filter(|buf| buf.is_dirty() && !buf.is_journaled())
            .cloned()
            .collect();
        dirty.sort_by_key(|buf| buf.block());
        for buf in &dirty {
            self.write_back(buf)?;
        }
        self.dev.sync()?;
        debug!(target: "jfs::cache", written = dirty.len(), "sync_dirty");
        Ok(dirty.len())
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            cached: self.buffers.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ByteBlockDevice, ByteDevice, MemByteDevice};

    fn make_cache(blocks: usize, capacity: usize) -> (MemByteDevice, BufferCache) {
        let mem = MemByteDevice::new(1024 * blocks);
        let dev = ByteBlockDevice::new(mem.clone(), 1024).expect("device");
        let cache = BufferCache::new(Arc::new(dev), capacity).expect("cache");
        (mem, cache)
    }

    #[test]
    fn read_returns_shared_buffer() {
        let (mem, cache) = make_cache(8, 16);
        mem.write_all_at(3 * 1024, &[9_u8; 1024]).unwrap();

        let a = cache.read(BlockNumber(3)).unwrap();
        let b = cache.read(BlockNumber(3)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.read()[0], 9);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn get_does_not_read() {
        let (mem, cache) = make_cache(8, 16);
        mem.write_all_at(2 * 1024, &[5_u8; 1024]).unwrap();
        let buf = cache.get(BlockNumber(2)).unwrap();
        assert!(!buf.is_uptodate());
        buf.zero();
        assert!(buf.is_uptodate());
        assert_eq!(cache.read(BlockNumber(2)).unwrap().read()[0], 0);
    }

    #[test]
    fn dirty_buffers_reach_device_only_on_write_back() {
        let (mem, cache) = make_cache(8, 16);
        let buf = cache.read(BlockNumber(1)).unwrap();
        buf.write()[10] = 0x77;
        buf.mark_dirty();
        assert_eq!(mem.snapshot()[1024 + 10], 0);

        assert_eq!(cache.sync_dirty().unwrap(), 1);
        assert_eq!(mem.snapshot()[1024 + 10], 0x77);
        assert!(!buf.is_dirty());
    }

    #[test]
    fn journaled_buffers_are_left_to_the_journal() {
        let (mem, cache) = make_cache(8, 16);
        let buf = cache.read(BlockNumber(3)).unwrap();
        buf.write()[0] = 0x42;
        buf.mark_dirty();
        buf.set_journaled(true);
        assert_eq!(cache.sync_dirty().unwrap(), 0);
        assert_eq!(mem.snapshot()[3 * 1024], 0);
        cache.write_back(&buf).unwrap();
        assert_eq!(mem.snapshot()[3 * 1024], 0x42);
    }

    #[test]
    fn lookup_never_creates() {
        let (_mem, cache) = make_cache(8, 16);
        assert!(cache.lookup(BlockNumber(4)).is_none());
        let buf = cache.get(BlockNumber(4)).unwrap();
        assert!(Arc::ptr_eq(&buf, &cache.lookup(BlockNumber(4)).unwrap()));
    }

    #[test]
    fn forget_discards_pending_write() {
        let (mem, cache) = make_cache(8, 16);
        let buf = cache.read(BlockNumber(4)).unwrap();
        buf.write()[0] = 1;
        buf.mark_dirty();
        cache.forget(BlockNumber(4));
        assert_eq!(cache.sync_dirty().unwrap(), 0);
        assert_eq!(mem.snapshot()[4 * 1024], 0);
    }

    #[test]
    fn pointer_accessors() {
        let (_mem, cache) = make_cache(8, 16);
        let buf = cache.get(BlockNumber(5)).unwrap();
        buf.zero();
        buf.set_ptr(3, DiskPtr::from_block(1234)).unwrap();
        assert_eq!(buf.ptr(3).unwrap().get(), 1234);
        assert!(buf.ptr(256).is_err());
    }

    #[test]
    fn read_error_leaves_buffer_not_uptodate() {
        let (mem, cache) = make_cache(8, 16);
        mem.fail_reads_at(6 * 1024, 1024);
        assert!(cache.read(BlockNumber(6)).is_err());
        mem.clear_failures();
        assert!(cache.read(BlockNumber(6)).unwrap().is_uptodate());
    }

    #[test]
    fn out_of_range_block_is_corruption() {
        let (_mem, cache) = make_cache(8, 16);
        let err = cache.read(BlockNumber(8)).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn eviction_keeps_referenced_and_dirty() {
        let (_mem, cache) = make_cache(16, 2);
        let held = cache.read(BlockNumber(1)).unwrap();
        let dirty = cache.read(BlockNumber(2)).unwrap();
        dirty.mark_dirty();
        drop(dirty);
        drop(cache.read(BlockNumber(3)).unwrap());
        drop(cache.read(BlockNumber(4)).unwrap());
        let again = cache.get(BlockNumber(1)).unwrap();
        assert!(Arc::ptr_eq(&held, &again));
        assert!(cache.get(BlockNumber(2)).unwrap().is_dirty());
    }
}
