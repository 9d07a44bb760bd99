//! Many threads sharing one journal with a small transaction capacity.

use jfs_block::{BlockDevice, BufferCache, ByteBlockDevice, MemByteDevice};
use jfs_journal::{Journal, JournalConfig};
use jfs_types::BlockNumber;
use std::sync::Arc;
use std::thread;

const BLOCK: usize = 1024;
const THREADS: u64 = 4;
const ROUNDS: u64 = 25;

fn setup(max: u32) -> (MemByteDevice, Arc<BufferCache>, Arc<Journal>) {
    let mem = MemByteDevice::new(BLOCK * 256);
    let dev: Arc<dyn BlockDevice> = Arc::new(ByteBlockDevice::new(mem.clone(), 1024).unwrap());
    let cache = Arc::new(BufferCache::new(dev, 512).unwrap());
    let journal = Arc::new(Journal::new(
        Arc::clone(&cache),
        JournalConfig {
            max_transaction_credits: max,
        },
    ));
    (mem, cache, journal)
}

#[test]
fn every_update_is_committed_exactly_once() {
    let (mem, cache, journal) = setup(8);
    let mut workers = Vec::new();
    for t in 0..THREADS {
        let cache = Arc::clone(&cache);
        let journal = Arc::clone(&journal);
        workers.push(thread::spawn(move || {
            for round in 0..ROUNDS {
                let mut handle = journal.start(3).unwrap();
                let block = BlockNumber(1 + t * ROUNDS + round);
                let buf = cache.read(block).unwrap();
                handle.get_write_access(&buf).unwrap();
                buf.write()[..8].copy_from_slice(&block.0.to_le_bytes());
                handle.dirty_metadata(&buf).unwrap();
                if round % 7 == 0 {
                    handle.restart(3).unwrap();
                }
                handle.stop().unwrap();
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    journal.force_commit().unwrap();

    let image = mem.snapshot();
    for block in 1..=THREADS * ROUNDS {
        let off = usize::try_from(block).unwrap() * BLOCK;
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&image[off..off + 8]);
        assert_eq!(u64::from_le_bytes(raw), block, "block {block}");
    }
    let stats = journal.stats();
    assert!(stats.commits > 1);
    assert_eq!(stats.metadata_blocks_written, THREADS * ROUNDS);
}

#[test]
fn sync_handles_wait_for_their_commit() {
    let (mem, cache, journal) = setup(64);
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let journal = Arc::clone(&journal);
            thread::spawn(move || {
                let mut handle = journal.start(1).unwrap();
                let buf = cache.read(BlockNumber(200 + t)).unwrap();
                handle.get_write_access(&buf).unwrap();
                buf.write()[0] = 0xC0 | u8::try_from(t).unwrap();
                handle.dirty_metadata(&buf).unwrap();
                handle.set_sync();
                let tid = handle.tid();
                handle.stop().unwrap();
                assert!(journal.committed_tid() >= tid);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    let image = mem.snapshot();
    for t in 0..THREADS {
        let off = usize::try_from(200 + t).unwrap() * BLOCK;
        assert_eq!(image[off], 0xC0 | u8::try_from(t).unwrap());
    }
}
