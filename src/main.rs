use std::sync::Arc;

use mica::buffer::BufferPoolManager;
use mica::common::{PageId, RecordId, SlotId};
use mica::index::BPlusTree;
use mica::storage::disk::DiskManager;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    println!("Mica - a disk-oriented storage core");
    println!("===================================\n");

    let db_path = "demo.db";
    let disk = Arc::new(DiskManager::new(db_path).expect("failed to open database file"));
    println!("Opened database file: {}", db_path);

    let bpm = Arc::new(BufferPoolManager::new(16, 2, disk));
    println!("Created buffer pool with 16 frames (LRU-2 replacement)\n");

    let tree = BPlusTree::with_max_sizes("demo_index", bpm.clone(), 4, 4)
        .expect("failed to create index");

    for key in [42u32, 7, 19, 3, 56, 28, 11, 64, 35] {
        let rid = RecordId::new(PageId::new(key), SlotId::new(0));
        tree.insert(key, rid).expect("insert failed");
        println!("Inserted key {}", key);
    }

    println!("\nPoint lookups:");
    for key in [7u32, 28, 100] {
        match tree.get_value(key).expect("lookup failed") {
            Some(rid) => println!("  key {} -> {:?}", key, rid),
            None => println!("  key {} -> not found", key),
        }
    }

    println!("\nFull scan:");
    for entry in tree.iter().expect("scan failed") {
        let (key, rid) = entry.expect("scan failed");
        println!("  {} -> page {}", key, rid.page_id);
    }

    tree.remove(19).expect("remove failed");
    tree.remove(3).expect("remove failed");
    println!("\nRemoved keys 19 and 3; scan from 10:");
    for entry in tree.iter_from(10).expect("scan failed") {
        let (key, _) = entry.expect("scan failed");
        println!("  {}", key);
    }

    bpm.flush_all_pages().expect("flush failed");
    println!("\nFlushed all pages to disk");

    std::fs::remove_file(db_path).ok();
    println!("Demo completed successfully!");
}
