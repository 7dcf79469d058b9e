//! Integration tests for the disk manager

use mica::common::{PageId, PAGE_SIZE};
use mica::storage::disk::DiskManager;

#[test]
fn test_write_read_many_pages() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dm = DiskManager::new(temp_dir.path().join("many.db")).unwrap();

    for i in 0..32u32 {
        let mut data = [0u8; PAGE_SIZE];
        data[..4].copy_from_slice(&i.to_le_bytes());
        data[PAGE_SIZE - 1] = i as u8;
        dm.write_page(PageId::new(i), &data).unwrap();
    }

    for i in 0..32u32 {
        let mut data = [0u8; PAGE_SIZE];
        dm.read_page(PageId::new(i), &mut data).unwrap();
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&data[..4]);
        assert_eq!(u32::from_le_bytes(buf), i);
        assert_eq!(data[PAGE_SIZE - 1], i as u8);
    }

    assert_eq!(dm.num_pages(), 32);
    assert_eq!(dm.num_writes(), 32);
    assert_eq!(dm.num_reads(), 32);
}

#[test]
fn test_sparse_write_reads_zeroes_between() {
    let temp_dir = tempfile::tempdir().unwrap();
    let dm = DiskManager::new(temp_dir.path().join("sparse.db")).unwrap();

    let data = [9u8; PAGE_SIZE];
    dm.write_page(PageId::new(10), &data).unwrap();

    // Pages 0..10 were never written: they read back as zeroes.
    let mut buf = [1u8; PAGE_SIZE];
    dm.read_page(PageId::new(5), &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    dm.read_page(PageId::new(10), &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 9));
}

#[test]
fn test_persistence_across_instances() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("persist.db");

    {
        let dm = DiskManager::new(&path).unwrap();
        let mut data = [0u8; PAGE_SIZE];
        data[0] = 123;
        dm.write_page(PageId::new(0), &data).unwrap();
        dm.sync().unwrap();
    }

    let dm = DiskManager::new(&path).unwrap();
    assert_eq!(dm.num_pages(), 1);
    let mut data = [0u8; PAGE_SIZE];
    dm.read_page(PageId::new(0), &mut data).unwrap();
    assert_eq!(data[0], 123);
}

#[test]
fn test_concurrent_page_io() {
    use std::sync::Arc;
    use std::thread;

    let temp_dir = tempfile::tempdir().unwrap();
    let dm = Arc::new(DiskManager::new(temp_dir.path().join("conc.db")).unwrap());

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let dm = Arc::clone(&dm);
            thread::spawn(move || {
                for i in 0..16u32 {
                    let page_id = PageId::new(t * 16 + i);
                    let mut data = [0u8; PAGE_SIZE];
                    data[..4].copy_from_slice(&page_id.as_u32().to_le_bytes());
                    dm.write_page(page_id, &data).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    for p in 0..64u32 {
        let mut data = [0u8; PAGE_SIZE];
        dm.read_page(PageId::new(p), &mut data).unwrap();
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&data[..4]);
        assert_eq!(u32::from_le_bytes(buf), p);
    }
}
