use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::common::{
    FrameId, MicaError, PageId, Result, DEFAULT_HASH_BUCKET_SIZE, INVALID_PAGE_ID,
};
use crate::container::ExtendibleHashTable;
use crate::storage::disk::DiskManager;

use super::{Frame, LruKReplacer, ReadPageGuard, WritePageGuard};

struct PoolInner {
    /// Frames currently holding no page.
    free_list: VecDeque<FrameId>,
}

/// Shared pool state. Guards hold an `Arc` to this so their drop can unpin.
///
/// `latch` is the pool-wide mutex: every pool operation holds it while it
/// reads or writes pool bookkeeping. The page table and replacer keep their
/// own short internal locks but are only driven from under `latch`. Frame
/// content latches are a separate layer owned by clients through the page
/// guards; while holding `latch` the pool only ever locks the data of
/// unpinned frames (load, write-back, reset), which no guard can be
/// holding, so a guard owner blocked on `latch` can never be awaited.
pub(crate) struct PoolState {
    frames: Vec<Arc<Frame>>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: LruKReplacer,
    disk: Arc<DiskManager>,
    /// Monotonic page id allocator, seeded from the file length on open.
    next_page_id: AtomicU32,
    latch: Mutex<PoolInner>,
}

impl PoolState {
    /// Picks a frame to hold a new page: the free list first, then an
    /// eviction victim. A dirty victim is written back before reuse.
    fn acquire_frame(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = self.replacer.evict() else {
            return Err(MicaError::BufferPoolFull);
        };
        let frame = &self.frames[frame_id.as_usize()];
        let old_page_id = frame.page_id();

        if frame.is_dirty() {
            let data = frame.data.read();
            self.disk.write_page(old_page_id, &data[..])?;
            drop(data);
            frame.set_dirty(false);
            trace!(page_id = old_page_id.as_u32(), "wrote back evicted page");
        }

        self.page_table.remove(&old_page_id);
        frame.reset();
        Ok(frame_id)
    }

    /// Pins the frame holding `page_id`, loading it from disk if it is not
    /// resident. Runs entirely under the pool latch.
    fn pin_page(&self, page_id: PageId) -> Result<FrameId> {
        let mut inner = self.latch.lock();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            let frame = &self.frames[frame_id.as_usize()];
            frame.pin();
            self.replacer.record_access(frame_id);
            self.replacer.set_evictable(frame_id, false);
            return Ok(frame_id);
        }

        let frame_id = self.acquire_frame(&mut inner)?;
        let frame = &self.frames[frame_id.as_usize()];

        frame.set_page_id(page_id);
        {
            let mut data = frame.data.write();
            self.disk.read_page(page_id, &mut data[..])?;
        }
        frame.pin();

        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);
        Ok(frame_id)
    }

    /// Releases one pin on `page_id`. False when the page is not resident or
    /// was not pinned. The dirty flag is sticky: it is only ever OR'ed here
    /// and cleared by flushing.
    pub(crate) fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _inner = self.latch.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.as_usize()];
        if is_dirty {
            frame.set_dirty(true);
        }
        match frame.unpin() {
            None => false,
            Some(0) => {
                self.replacer.set_evictable(frame_id, true);
                true
            }
            Some(_) => true,
        }
    }
}

/// The buffer pool: a fixed array of frames caching disk pages, a free
/// list, a page table mapping page ids to frames, and an LRU-K replacer
/// choosing eviction victims. Pages handed out are pinned and latched via
/// RAII guards; a pinned page is never evicted.
pub struct BufferPoolManager {
    pool_size: usize,
    state: Arc<PoolState>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, replacer_k: usize, disk: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(Frame::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let next_page_id = disk.num_pages();
        let state = Arc::new(PoolState {
            frames,
            page_table: ExtendibleHashTable::new(DEFAULT_HASH_BUCKET_SIZE),
            replacer: LruKReplacer::new(replacer_k, pool_size),
            disk,
            next_page_id: AtomicU32::new(next_page_id),
            latch: Mutex::new(PoolInner { free_list }),
        });

        Self { pool_size, state }
    }

    /// Creates a brand-new page and returns it pinned for writing.
    /// Fails with `BufferPoolFull` when every frame is pinned.
    pub fn new_page(&self) -> Result<WritePageGuard> {
        let state = &self.state;
        let (frame_id, page_id) = {
            let mut inner = state.latch.lock();
            let frame_id = state.acquire_frame(&mut inner)?;
            let page_id = PageId::new(state.next_page_id.fetch_add(1, Ordering::SeqCst));

            let frame = &state.frames[frame_id.as_usize()];
            frame.set_page_id(page_id);
            frame.pin();

            state.page_table.insert(page_id, frame_id);
            state.replacer.record_access(frame_id);
            state.replacer.set_evictable(frame_id, false);
            (frame_id, page_id)
        };

        let frame = Arc::clone(&state.frames[frame_id.as_usize()]);
        Ok(WritePageGuard::new(page_id, frame, Arc::clone(state)))
    }

    /// Fetches `page_id` for shared access.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(MicaError::InvalidPageId(page_id));
        }
        let frame_id = self.state.pin_page(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        Ok(ReadPageGuard::new(page_id, frame, Arc::clone(&self.state)))
    }

    /// Fetches `page_id` for exclusive access.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(MicaError::InvalidPageId(page_id));
        }
        let frame_id = self.state.pin_page(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        Ok(WritePageGuard::new(page_id, frame, Arc::clone(&self.state)))
    }

    /// Releases one pin. Normally driven by guard drops; exposed because the
    /// pin/unpin protocol is part of the pool's contract.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.state.unpin_page(page_id, is_dirty)
    }

    /// Writes `page_id` to disk regardless of its dirty flag, then clears
    /// the flag. False when the page is not resident.
    ///
    /// The frame is pinned across the write so it cannot be evicted, and
    /// its content latch is taken outside the pool latch. A concurrent
    /// writer therefore delays the flush instead of deadlocking against it.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let state = &self.state;
        let frame_id = {
            let _inner = state.latch.lock();
            let Some(frame_id) = state.page_table.find(&page_id) else {
                return Ok(false);
            };
            let frame = &state.frames[frame_id.as_usize()];
            frame.pin();
            state.replacer.set_evictable(frame_id, false);
            frame_id
        };

        let frame = &state.frames[frame_id.as_usize()];
        {
            let data = frame.data.read();
            state.disk.write_page(page_id, &data[..])?;
        }
        frame.set_dirty(false);

        state.unpin_page(page_id, false);
        Ok(true)
    }

    /// Flushes every frame currently holding a page.
    pub fn flush_all_pages(&self) -> Result<()> {
        let page_ids: Vec<PageId> = {
            let _inner = self.state.latch.lock();
            self.state
                .frames
                .iter()
                .map(|frame| frame.page_id())
                .filter(|&page_id| page_id != INVALID_PAGE_ID)
                .collect()
        };

        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drops `page_id` from the pool and returns its frame to the free
    /// list. True when the page was not resident to begin with; false when
    /// it is pinned.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let state = &self.state;
        let mut inner = state.latch.lock();

        let Some(frame_id) = state.page_table.find(&page_id) else {
            return true;
        };
        let frame = &state.frames[frame_id.as_usize()];
        if frame.pin_count() > 0 {
            return false;
        }

        state.page_table.remove(&page_id);
        state.replacer.remove(frame_id);
        inner.free_list.push_back(frame_id);
        frame.reset();
        state.disk.deallocate_page(page_id);
        trace!(page_id = page_id.as_u32(), "deleted page from pool");
        true
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn free_frame_count(&self) -> usize {
        self.state.latch.lock().free_list.len()
    }

    /// Pin count of a resident page, None when not resident.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = &self.state;
        let _inner = state.latch.lock();
        state
            .page_table
            .find(&page_id)
            .map(|frame_id| state.frames[frame_id.as_usize()].pin_count())
    }

    /// Number of evictable frames tracked by the replacer.
    pub fn replacer_size(&self) -> usize {
        self.state.replacer.size()
    }

    /// Number of page ids handed out so far.
    pub fn num_allocated_pages(&self) -> u32 {
        self.state.next_page_id.load(Ordering::SeqCst)
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.state.disk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let disk = Arc::new(DiskManager::new(temp.path()).unwrap());
        (BufferPoolManager::new(pool_size, 2, disk), temp)
    }

    #[test]
    fn test_new_pool() {
        let (bpm, _temp) = create_bpm(10);
        assert_eq!(bpm.pool_size(), 10);
        assert_eq!(bpm.free_frame_count(), 10);
    }

    #[test]
    fn test_new_page_is_pinned() {
        let (bpm, _temp) = create_bpm(10);

        let guard = bpm.new_page().unwrap();
        assert_eq!(guard.page_id(), PageId::new(0));
        assert_eq!(bpm.get_pin_count(guard.page_id()), Some(1));
        assert_eq!(bpm.free_frame_count(), 9);
        assert_eq!(bpm.replacer_size(), 0);
    }

    #[test]
    fn test_page_ids_are_monotonic() {
        let (bpm, _temp) = create_bpm(10);

        for expect in 0..5u32 {
            let guard = bpm.new_page().unwrap();
            assert_eq!(guard.page_id(), PageId::new(expect));
        }
        assert_eq!(bpm.num_allocated_pages(), 5);
    }

    #[test]
    fn test_read_back_written_data() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = 42;
            guard.data_mut()[100] = 255;
            guard.page_id()
        };

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 42);
        assert_eq!(guard.data()[100], 255);
    }

    #[test]
    fn test_unpin_twice_fails() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = {
            let guard = bpm.new_page().unwrap();
            guard.page_id()
        };
        // The guard already unpinned on drop.
        assert!(!bpm.unpin_page(page_id, false));
    }

    #[test]
    fn test_fetch_not_resident_reads_disk() {
        let temp = NamedTempFile::new().unwrap();
        let disk = Arc::new(DiskManager::new(temp.path()).unwrap());

        let page_id = {
            let bpm = BufferPoolManager::new(4, 2, disk.clone());
            let page_id = {
                let mut guard = bpm.new_page().unwrap();
                guard.data_mut()[7] = 7;
                guard.page_id()
            };
            bpm.flush_page(page_id).unwrap();
            page_id
        };

        let bpm = BufferPoolManager::new(4, 2, disk);
        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[7], 7);
    }

    #[test]
    fn test_pool_full_when_all_pinned() {
        let (bpm, _temp) = create_bpm(2);

        let _g0 = bpm.new_page().unwrap();
        let _g1 = bpm.new_page().unwrap();
        assert!(matches!(bpm.new_page(), Err(MicaError::BufferPoolFull)));
    }

    #[test]
    fn test_eviction_prefers_free_frames() {
        let (bpm, _temp) = create_bpm(3);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let guard = bpm.new_page().unwrap();
            ids.push(guard.page_id());
        }
        assert_eq!(bpm.free_frame_count(), 0);

        // All unpinned: creating a fourth page must evict one.
        let guard = bpm.new_page().unwrap();
        assert_eq!(guard.page_id(), PageId::new(3));
    }

    #[test]
    fn test_delete_page() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = {
            let guard = bpm.new_page().unwrap();
            guard.page_id()
        };

        {
            let _guard = bpm.fetch_page_read(page_id).unwrap();
            assert!(!bpm.delete_page(page_id));
        }

        assert!(bpm.delete_page(page_id));
        assert_eq!(bpm.get_pin_count(page_id), None);
        assert_eq!(bpm.free_frame_count(), 10);
        // Deleting a non-resident page is vacuously true.
        assert!(bpm.delete_page(page_id));
    }

    #[test]
    fn test_flush_clears_dirty() {
        let (bpm, _temp) = create_bpm(4);

        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = 1;
            guard.page_id()
        };

        assert!(bpm.flush_page(page_id).unwrap());
        let before = bpm.disk_manager().num_writes();

        // Clean page: eviction must not write again.
        for _ in 0..4 {
            let _ = bpm.new_page().unwrap();
        }
        assert_eq!(bpm.disk_manager().num_writes(), before);
    }

    #[test]
    fn test_flush_missing_page() {
        let (bpm, _temp) = create_bpm(4);
        assert!(!bpm.flush_page(PageId::new(99)).unwrap());
    }

    #[test]
    fn test_concurrent_fetches() {
        use std::thread;

        let (bpm, _temp) = create_bpm(16);
        let bpm = Arc::new(bpm);

        let mut ids = Vec::new();
        for i in 0..8u8 {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = i;
            ids.push(guard.page_id());
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bpm = Arc::clone(&bpm);
                let ids = ids.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        for (i, &page_id) in ids.iter().enumerate() {
                            let guard = bpm.fetch_page_read(page_id).unwrap();
                            assert_eq!(guard.data()[0], i as u8);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
