#![forbid(unsafe_code)]
//! Journal used by the filesystem engine.
//!
//! A [`Journal`] groups metadata updates made through [`Handle`]s into
//! transactions. Exactly one transaction is running at a time; every handle
//! joins it. A transaction commits once it has been asked to (sync handle,
//! explicit [`Journal::force_commit`], [`Handle::restart`], or credit
//! exhaustion) and its last handle stops.
//!
//! Commit writes ordered data buffers first, then every metadata buffer, then
//! flushes the device. Metadata never reaches the device any other way, so a
//! crash between commits leaves the image at the previous commit boundary.
//! The log itself is not persisted: there is nothing to replay, and a
//! revoked block is simply dropped from the pending commit.
//!
//! After an abort (injected with [`Journal::set_abort_after`] or requested
//! with [`Journal::abort`]) nothing is written again and every handle
//! operation fails with `ReadOnly`.

mod handle;

pub use handle::Handle;

use jfs_block::{Buffer, BufferCache};
use jfs_error::{JfsError, Result};
use jfs_types::BlockNumber;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, trace, warn};

/// Journal tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Most buffer credits a single transaction may carry.
    pub max_transaction_credits: u32,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_transaction_credits: 1024,
        }
    }
}

/// Counters for tests and reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalStats {
    pub commits: u64,
    pub handles: u64,
    pub restarts: u64,
    pub extends: u64,
    pub extends_denied: u64,
    pub revokes: u64,
    pub metadata_blocks_written: u64,
    pub data_blocks_written: u64,
}

#[derive(Debug)]
struct Transaction {
    tid: u64,
    /// Handles currently attached.
    updates: u32,
    /// Credits reserved by attached handles plus credits already consumed.
    outstanding: u32,
    /// Commit requested; no new handles may join.
    locked: bool,
    sync: bool,
    reserved: HashSet<BlockNumber>,
    metadata: BTreeMap<BlockNumber, Arc<Buffer>>,
    data: BTreeMap<BlockNumber, Arc<Buffer>>,
    revoked: BTreeSet<BlockNumber>,
}

impl Transaction {
    fn new(tid: u64) -> Self {
        Self {
            tid,
            updates: 0,
            outstanding: 0,
            locked: false,
            sync: false,
            reserved: HashSet::new(),
            metadata: BTreeMap::new(),
            data: BTreeMap::new(),
            revoked: BTreeSet::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.metadata.is_empty() && self.data.is_empty() && self.revoked.is_empty()
    }
}

#[derive(Debug)]
struct JournalState {
    running: Transaction,
    committed_tid: u64,
    /// Successful commits left before the injected abort.
    abort_after: Option<u64>,
    stats: JournalStats,
}

/// The transaction manager.
pub struct Journal {
    cache: Arc<BufferCache>,
    config: JournalConfig,
    state: Mutex<JournalState>,
    commit_wait: Condvar,
    aborted: AtomicBool,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("config", &self.config)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

impl Journal {
    #[must_use]
    pub fn new(cache: Arc<BufferCache>, config: JournalConfig) -> Self {
        Self {
            cache,
            config,
            state: Mutex::new(JournalState {
                running: Transaction::new(1),
                committed_tid: 0,
                abort_after: None,
                stats: JournalStats::default(),
            }),
            commit_wait: Condvar::new(),
            aborted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> JournalConfig {
        self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Highest transaction id whose contents reached the device.
    #[must_use]
    pub fn committed_tid(&self) -> u64 {
        self.state.lock().committed_tid
    }

    #[must_use]
    pub fn stats(&self) -> JournalStats {
        self.state.lock().stats
    }

    /// Let `commits` more transactions commit, then abort on the next one.
    pub fn set_abort_after(&self, commits: u64) {
        self.state.lock().abort_after = Some(commits);
    }

    /// Abort immediately: nothing further is written.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        self.abort_locked(&mut state, "abort requested");
    }

    /// Open a handle reserving `credits` buffer credits.
    pub fn start(&self, credits: u32) -> Result<Handle<'_>> {
        let mut state = self.state.lock();
        let tid = self.join_running(&mut state, credits)?;
        state.stats.handles += 1;
        drop(state);
        trace!(target: "jfs::journal", tid, credits, "handle_start");
        Ok(Handle::new(self, tid, credits))
    }

    /// Commit the running transaction and wait for it to reach the device.
    ///
    /// Must not be called while the caller holds an open handle.
    pub fn force_commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.check_aborted()?;
        if state.running.updates == 0 && state.running.is_empty() {
            return Ok(());
        }
        let tid = state.running.tid;
        state.running.locked = true;
        if state.running.updates == 0 {
            self.commit_locked(&mut state)?;
        }
        self.wait_for_commit(&mut state, tid)
    }

    fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(JfsError::ReadOnly);
        }
        Ok(())
    }

    /// Attach `credits` to the running transaction, waiting out a locked one.
    fn join_running(&self, state: &mut MutexGuard<'_, JournalState>, credits: u32) -> Result<u64> {
        let max = self.config.max_transaction_credits;
        if credits > max {
            return Err(JfsError::TransactionTooLarge {
                requested: credits,
                max,
            });
        }
        loop {
            self.check_aborted()?;
            let running = &mut state.running;
            if running.locked {
                if running.updates == 0 {
                    self.commit_locked(state)?;
                } else {
                    self.commit_wait.wait(state);
                }
                continue;
            }
            if running.outstanding + credits > max {
                debug!(
                    target: "jfs::journal",
                    tid = running.tid,
                    outstanding = running.outstanding,
                    credits,
                    "transaction_full"
                );
                running.locked = true;
                continue;
            }
            running.updates += 1;
            running.outstanding += credits;
            return Ok(running.tid);
        }
    }

    fn wait_for_commit(&self, state: &mut MutexGuard<'_, JournalState>, tid: u64) -> Result<()> {
        while state.committed_tid < tid {
            self.check_aborted()?;
            self.commit_wait.wait(state);
        }
        Ok(())
    }

    fn abort_locked(&self, state: &mut JournalState, reason: &str) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        let running = &mut state.running;
        for buf in running.metadata.values().chain(running.data.values()) {
            buf.clear_dirty();
            buf.set_journaled(false);
        }
        error!(
            target: "jfs::journal",
            tid = running.tid,
            metadata = running.metadata.len(),
            reason,
            "journal_aborted"
        );
        running.metadata.clear();
        running.data.clear();
        self.commit_wait.notify_all();
    }

    /// Write the running transaction out and open the next one.
    ///
    /// Caller guarantees no handle is attached.
    fn commit_locked(&self, state: &mut JournalState) -> Result<()> {
        self.check_aborted()?;
        if state.abort_after == Some(0) {
            self.abort_locked(state, "injected crash");
            return Err(JfsError::ReadOnly);
        }
        let tid = state.running.tid;
        let result = self.write_transaction(&state.running);
        if let Err(err) = result {
            error!(target: "jfs::journal", tid, error = %err, "commit_write_failed");
            self.abort_locked(state, "commit write failure");
            return Err(err);
        }

        let done = std::mem::replace(&mut state.running, Transaction::new(tid + 1));
        for buf in done.metadata.values().chain(done.data.values()) {
            buf.set_journaled(false);
        }
        state.committed_tid = tid;
        state.stats.commits += 1;
        state.stats.metadata_blocks_written += done.metadata.len() as u64;
        state.stats.data_blocks_written += done.data.len() as u64;
        if let Some(left) = state.abort_after.as_mut() {
            *left -= 1;
        }
        info!(
            target: "jfs::journal",
            tid,
            metadata = done.metadata.len(),
            data = done.data.len(),
            revoked = done.revoked.len(),
            sync = done.sync,
            "transaction_committed"
        );
        self.commit_wait.notify_all();
        Ok(())
    }

    fn write_transaction(&self, txn: &Transaction) -> Result<()> {
        for buf in txn.data.values() {
            self.cache.write_back(buf)?;
        }
        for buf in txn.metadata.values() {
            self.cache.write_back(buf)?;
        }
        self.cache.device().sync()
    }

    // ── Handle plumbing ─────────────────────────────────────────────────────

    fn handle_stop(&self, tid: u64, unused_credits: u32, sync: bool) -> Result<()> {
        let mut state = self.state.lock();
        let running = &mut state.running;
        if running.tid != tid {
            warn!(target: "jfs::journal", tid, running = running.tid, "stop_on_stale_handle");
            return self.check_aborted();
        }
        running.updates -= 1;
        running.outstanding = running.outstanding.saturating_sub(unused_credits);
        if sync {
            running.sync = true;
            running.locked = true;
        }
        let (locked, idle) = (running.locked, running.updates == 0);
        if locked && idle {
            self.commit_locked(&mut state)?;
        } else if locked {
            self.commit_wait.notify_all();
        }
        if sync {
            self.wait_for_commit(&mut state, tid)?;
        }
        self.check_aborted()
    }

    fn handle_restart(&self, tid: u64, unused_credits: u32, credits: u32) -> Result<u64> {
        let mut state = self.state.lock();
        state.stats.restarts += 1;
        let running = &mut state.running;
        if running.tid == tid {
            running.updates -= 1;
            running.outstanding = running.outstanding.saturating_sub(unused_credits);
            running.locked = true;
            let idle = running.updates == 0;
            if idle {
                self.commit_locked(&mut state)?;
            } else {
                self.commit_wait.notify_all();
            }
        }
        debug!(target: "jfs::journal", tid, credits, "handle_restart");
        self.join_running(&mut state, credits)
    }

    fn handle_extend(&self, tid: u64, credits: u32) -> Result<bool> {
        self.check_aborted()?;
        let mut state = self.state.lock();
        let max = self.config.max_transaction_credits;
        let running = &mut state.running;
        if running.tid != tid || running.locked || running.outstanding + credits > max {
            state.stats.extends_denied += 1;
            return Ok(false);
        }
        running.outstanding += credits;
        state.stats.extends += 1;
        Ok(true)
    }

    /// Returns true when a credit was consumed.
    fn handle_write_access(&self, buf: &Arc<Buffer>) -> Result<bool> {
        self.check_aborted()?;
        let mut state = self.state.lock();
        let running = &mut state.running;
        running.revoked.remove(&buf.block());
        Ok(running.reserved.insert(buf.block()))
    }

    fn handle_dirty_metadata(&self, buf: &Arc<Buffer>) -> Result<bool> {
        self.check_aborted()?;
        let mut state = self.state.lock();
        let running = &mut state.running;
        let fresh = running.reserved.insert(buf.block());
        running.revoked.remove(&buf.block());
        buf.set_journaled(true);
        buf.mark_dirty();
        running.metadata.insert(buf.block(), Arc::clone(buf));
        Ok(fresh)
    }

    fn handle_dirty_data(&self, buf: &Arc<Buffer>) -> Result<()> {
        self.check_aborted()?;
        let mut state = self.state.lock();
        buf.set_journaled(true);
        buf.mark_dirty();
        state.running.data.insert(buf.block(), Arc::clone(buf));
        Ok(())
    }

    /// Returns true when the buffer's credit can be handed back.
    fn handle_forget(&self, block: BlockNumber) -> Result<bool> {
        self.check_aborted()?;
        let mut state = self.state.lock();
        let running = &mut state.running;
        let was_metadata = running.metadata.remove(&block);
        let was_data = running.data.remove(&block);
        for buf in was_metadata.iter().chain(was_data.iter()) {
            buf.set_journaled(false);
        }
        self.cache.forget(block);
        Ok(was_metadata.is_some() && running.reserved.remove(&block))
    }

    fn handle_revoke(&self, block: BlockNumber) -> Result<()> {
        self.check_aborted()?;
        let mut state = self.state.lock();
        let running = &mut state.running;
        if let Some(buf) = running.metadata.remove(&block) {
            buf.set_journaled(false);
        }
        if let Some(buf) = running.data.remove(&block) {
            buf.set_journaled(false);
        }
        running.reserved.remove(&block);
        running.revoked.insert(block);
        state.stats.revokes += 1;
        drop(state);
        self.cache.forget(block);
        trace!(target: "jfs::journal", block = block.0, "revoke");
        Ok(())
    }

    #[cfg(test)]
    fn running_snapshot(&self) -> (u64, u32, u32, usize, usize) {
        let state = self.state.lock();
        (
            state.running.tid,
            state.running.updates,
            state.running.outstanding,
            state.running.metadata.len(),
            state.running.revoked.len(),
        )
    }
}
