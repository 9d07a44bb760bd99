//! Byte-level file reads and writes on top of the block map.

use crate::FsContext;
use crate::config::{DataMode, TransactionBudget};
use crate::inode::Inode;
use crate::path::max_file_size;
use crate::tree::BlockMapping;
use jfs_block::Buffer;
use jfs_error::{JfsError, Result};
use jfs_journal::Handle;
use jfs_types::{APPEND_FL, IMMUTABLE_FL};
use std::sync::Arc;
use tracing::{debug, trace};

impl FsContext {
    /// Write `data` at `offset`, allocating blocks as needed.
    ///
    /// Each block goes in its own transaction, and the size grows only
    /// after that block is spliced in. A failure after some blocks were
    /// written returns the short count; a failure on the first block
    /// returns the error.
    pub fn write_at(&self, inode: &Inode, offset: u64, data: &[u8], sync: bool) -> Result<usize> {
        inode.check_bad()?;
        let _io = inode.lock_io();
        if data.is_empty() {
            return Ok(0);
        }
        let state = inode.snapshot();
        if !state.is_reg() {
            return Err(JfsError::InvalidArgument(format!(
                "inode {} is not a regular file",
                inode.ino().0
            )));
        }
        if state.flags & IMMUTABLE_FL != 0 {
            return Err(JfsError::NotPermitted);
        }
        if state.flags & APPEND_FL != 0 && offset != state.size {
            return Err(JfsError::NotPermitted);
        }
        let len = u64::try_from(data.len()).map_err(|_| JfsError::FileTooLarge)?;
        let end = offset.checked_add(len).ok_or(JfsError::FileTooLarge)?;
        if end > max_file_size(self.block_size) {
            return Err(JfsError::FileTooLarge);
        }

        let journal_data = self.journals_data(&state);
        let credits = TransactionBudget::write_credits(journal_data);
        let bs = self.block_size.bytes();
        let mut done = 0_usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let in_block = self.block_size.offset_in_block(pos);
            let n = (bs - in_block).min(data.len() - done);
            let chunk = &data[done..done + n];
            let result = self.start(credits).and_then(|mut handle| {
                let written = self.write_block(&mut handle, inode, pos, chunk, journal_data);
                let stopped = handle.stop();
                written.and(stopped)
            });
            if let Err(err) = result {
                debug!(target: "jfs::file", ino = inode.ino().0, pos, done, error = %err, "write_stopped");
                if done == 0 {
                    return Err(err);
                }
                // The blocks already written still honor a synchronous write.
                self.commit_on_write(inode, sync)?;
                return Ok(done);
            }
            done += n;
        }
        self.commit_on_write(inode, sync)?;
        trace!(target: "jfs::file", ino = inode.ino().0, offset, len = done, "write");
        Ok(done)
    }

    fn write_block(
        &self,
        handle: &mut Handle<'_>,
        inode: &Inode,
        pos: u64,
        chunk: &[u8],
        journal_data: bool,
    ) -> Result<()> {
        let logical = self.block_size.byte_to_block(pos);
        let in_block = self.block_size.offset_in_block(pos);
        let BlockMapping::Mapped { block, new, .. } = self.get_block(Some(handle), inode, logical, true)?
        else {
            return Err(JfsError::Corruption {
                block: 0,
                detail: format!("inode {} block {} still a hole after allocation", inode.ino().0, logical.0),
            });
        };
        let buf = if new {
            let buf = self.cache.get(block)?;
            buf.zero();
            buf
        } else {
            self.cache.read(block)?
        };
        if journal_data {
            handle.get_write_access(&buf)?;
        }
        buf.write()[in_block..in_block + chunk.len()].copy_from_slice(chunk);
        self.dirty_file_data(handle, &buf, journal_data)?;

        let end = pos + chunk.len() as u64;
        let now = crate::unix_now();
        {
            let mut state = inode.lock_state();
            if end > state.size {
                state.size = end;
                state.disk_size = end;
            }
            state.mtime = now;
            state.ctime = now;
        }
        self.mark_dirty(handle, inode)
    }

    /// Hand a file data buffer to the journal according to the data mode.
    pub(crate) fn dirty_file_data(
        &self,
        handle: &mut Handle<'_>,
        buf: &Arc<Buffer>,
        journal_data: bool,
    ) -> Result<()> {
        if journal_data {
            handle.dirty_metadata(buf)
        } else if self.options().data_mode == DataMode::Ordered {
            handle.dirty_data(buf)
        } else {
            buf.mark_dirty();
            Ok(())
        }
    }

    /// Read up to `len` bytes at `offset`; holes read as zeros.
    ///
    /// Reads stop at the end of file.
    pub fn read_at(&self, inode: &Inode, offset: u64, len: usize) -> Result<Vec<u8>> {
        inode.check_bad()?;
        let size = inode.snapshot().size;
        if offset >= size {
            return Ok(Vec::new());
        }
        let avail = usize::try_from(size - offset).unwrap_or(usize::MAX);
        let len = len.min(avail);
        let bs = self.block_size.bytes();
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let pos = offset + out.len() as u64;
            let in_block = self.block_size.offset_in_block(pos);
            let n = (bs - in_block).min(len - out.len());
            let logical = self.block_size.byte_to_block(pos);
            match self.get_block(None, inode, logical, false)? {
                BlockMapping::Mapped { block, .. } => {
                    let buf = self.cache.read(block)?;
                    out.extend_from_slice(&buf.read()[in_block..in_block + n]);
                }
                BlockMapping::Hole => out.resize(out.len() + n, 0),
            }
        }
        Ok(out)
    }
}
