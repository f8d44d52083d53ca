use std::sync::Arc;

use burrow::buffer::BufferPoolManager;
use burrow::common::{PageId, RecordId, SlotId};
use burrow::index::{BPlusTree, OrdComparator};
use burrow::storage::disk::DiskManager;

fn main() {
    println!("Burrow - disk-oriented storage and indexing core");
    println!("================================================\n");

    let db_path = "demo.db";

    let disk_manager = Arc::new(DiskManager::new(db_path).expect("failed to create disk manager"));
    println!("Created disk manager for: {}", db_path);

    let bpm = Arc::new(BufferPoolManager::new(16, 2, disk_manager));
    println!("Created buffer pool with 16 frames (LRU-2 replacement)\n");

    let tree: BPlusTree<u32, RecordId, OrdComparator> =
        BPlusTree::new("demo_index", Arc::clone(&bpm), OrdComparator, 8, 8)
            .expect("failed to create index");

    for key in [17u32, 3, 42, 8, 25, 1, 30, 12, 99, 54] {
        let rid = RecordId::new(PageId::new(key), SlotId::new(0));
        tree.insert(key, rid).expect("insert failed");
        println!("Inserted key {}", key);
    }

    println!("\nPoint lookups:");
    for key in [42u32, 13] {
        match tree.get_value(&key).expect("lookup failed") {
            Some(rid) => println!("  key {} -> {:?}", key, rid),
            None => println!("  key {} not found", key),
        }
    }

    println!("\nIn-order scan:");
    let keys: Vec<u32> = tree
        .begin()
        .expect("iterator failed")
        .map(|entry| entry.expect("scan failed").0)
        .collect();
    println!("  {:?}", keys);

    tree.remove(&42).expect("remove failed");
    println!("\nRemoved key 42; lookup now: {:?}", tree.get_value(&42).unwrap());

    bpm.flush_all_pages().expect("flush failed");
    println!("Flushed all pages to disk");

    std::fs::remove_file(db_path).ok();
    println!("\nDemo completed successfully!");
}
