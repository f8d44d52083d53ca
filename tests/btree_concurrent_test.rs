//! Concurrency tests for the B+tree index

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use burrow::buffer::BufferPoolManager;
use burrow::common::{PageId, RecordId, SlotId};
use burrow::index::{BPlusTree, OrdComparator};
use burrow::storage::disk::DiskManager;

use tempfile::NamedTempFile;

type TestTree = BPlusTree<u32, RecordId, OrdComparator>;

fn create_tree(pool_size: usize) -> (Arc<TestTree>, Arc<BufferPoolManager>, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let disk_manager = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(pool_size, 2, disk_manager));
    let tree = Arc::new(
        BPlusTree::new("concurrent_index", Arc::clone(&bpm), OrdComparator, 4, 4).unwrap(),
    );
    (tree, bpm, temp_file)
}

fn record(key: u32) -> RecordId {
    RecordId::new(PageId::new(key), SlotId::new(0))
}

#[test]
fn test_concurrent_disjoint_inserts() {
    const THREADS: u32 = 8;
    const KEYS_PER_THREAD: u32 = 10;

    let (tree, _bpm, _temp) = create_tree(128);

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for key in tid * KEYS_PER_THREAD..(tid + 1) * KEYS_PER_THREAD {
                    assert!(tree.insert(key, record(key)).unwrap(), "insert {}", key);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    for key in 0..THREADS * KEYS_PER_THREAD {
        assert_eq!(
            tree.get_value(&key).unwrap(),
            Some(record(key)),
            "key {} missing after concurrent insert",
            key
        );
    }

    // In-order iteration sees every key exactly once
    let keys: Vec<u32> = tree.begin().unwrap().map(|e| e.unwrap().0).collect();
    assert_eq!(keys, (0..THREADS * KEYS_PER_THREAD).collect::<Vec<_>>());
}

#[test]
fn test_concurrent_interleaved_inserts() {
    const THREADS: u32 = 4;
    const TOTAL: u32 = 200;

    let (tree, _bpm, _temp) = create_tree(128);

    // Thread t inserts keys congruent to t modulo THREADS
    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let mut key = tid;
                while key < TOTAL {
                    assert!(tree.insert(key, record(key)).unwrap());
                    key += THREADS;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let keys: Vec<u32> = tree.begin().unwrap().map(|e| e.unwrap().0).collect();
    assert_eq!(keys, (0..TOTAL).collect::<Vec<_>>());
}

#[test]
fn test_concurrent_readers_during_inserts() {
    const TOTAL: u32 = 300;

    let (tree, _bpm, _temp) = create_tree(128);
    let watermark = Arc::new(AtomicU32::new(0));

    let writer = {
        let tree = Arc::clone(&tree);
        let watermark = Arc::clone(&watermark);
        thread::spawn(move || {
            for key in 0..TOTAL {
                tree.insert(key, record(key)).unwrap();
                watermark.store(key + 1, Ordering::Release);
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let watermark = Arc::clone(&watermark);
            thread::spawn(move || {
                while watermark.load(Ordering::Acquire) < TOTAL {
                    let bound = watermark.load(Ordering::Acquire);
                    if bound == 0 {
                        continue;
                    }
                    // Every key below the watermark is already durable
                    let key = bound - 1;
                    assert_eq!(
                        tree.get_value(&key).unwrap(),
                        Some(record(key)),
                        "key {} invisible to reader",
                        key
                    );
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for handle in readers {
        handle.join().unwrap();
    }

    let keys: Vec<u32> = tree.begin().unwrap().map(|e| e.unwrap().0).collect();
    assert_eq!(keys, (0..TOTAL).collect::<Vec<_>>());
}

#[test]
fn test_concurrent_inserts_and_deletes_disjoint() {
    const PRELOADED: u32 = 100;

    let (tree, _bpm, _temp) = create_tree(128);

    for key in 0..PRELOADED {
        tree.insert(key, record(key)).unwrap();
    }

    let deleters: Vec<_> = (0..2u32)
        .map(|tid| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let mut key = tid;
                while key < PRELOADED / 2 {
                    tree.remove(&key).unwrap();
                    key += 2;
                }
            })
        })
        .collect();

    let inserters: Vec<_> = (0..2u32)
        .map(|tid| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let mut key = PRELOADED + tid;
                while key < PRELOADED + 50 {
                    assert!(tree.insert(key, record(key)).unwrap());
                    key += 2;
                }
            })
        })
        .collect();

    for handle in deleters.into_iter().chain(inserters) {
        handle.join().unwrap();
    }

    for key in 0..PRELOADED / 2 {
        assert_eq!(tree.get_value(&key).unwrap(), None, "key {} survived", key);
    }
    for key in PRELOADED / 2..PRELOADED + 50 {
        assert_eq!(
            tree.get_value(&key).unwrap(),
            Some(record(key)),
            "key {} lost",
            key
        );
    }
}

#[test]
fn test_concurrent_repeated_rounds() {
    // Re-run a small mixed workload to shake out interleavings
    for _ in 0..10 {
        let (tree, _bpm, _temp) = create_tree(64);

        let handles: Vec<_> = (0..4u32)
            .map(|tid| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for key in tid * 25..(tid + 1) * 25 {
                        tree.insert(key, record(key)).unwrap();
                    }
                    for key in (tid * 25..(tid + 1) * 25).step_by(2) {
                        tree.remove(&key).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        for key in 0..100u32 {
            let expected = if key % 2 == 1 { Some(record(key)) } else { None };
            assert_eq!(tree.get_value(&key).unwrap(), expected, "key {}", key);
        }
    }
}
