use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::common::{
    BurrowError, FrameId, PageId, Result, INVALID_PAGE_ID, PAGE_SIZE, PAGE_TABLE_BUCKET_SIZE,
};
use crate::container::ExtendibleHashTable;
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::frame::PageDataLock;
use super::{Frame, LruKReplacer, ReadPageGuard, WritePageGuard};

/// State a dropped page guard needs to return its pin: the frame array,
/// the page table to resolve the page id, and the replacer to mark a
/// fully unpinned frame evictable.
pub(crate) struct PoolState {
    /// The buffer pool frames
    frames: Vec<Frame>,
    /// Page table: maps resident page IDs to frame IDs
    page_table: ExtendibleHashTable<PageId, FrameId>,
    /// LRU-K replacer for eviction decisions
    replacer: LruKReplacer,
    /// Free list: frames that hold no page
    free_list: Mutex<VecDeque<FrameId>>,
    /// Pool latch serializing directory manipulation
    latch: Mutex<()>,
}

impl PoolState {
    /// Decrements a page's pin count, stickily setting the dirty flag and
    /// marking the frame evictable when the count reaches zero.
    pub(crate) fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _latch = self.latch.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.as_usize()];
        if is_dirty {
            frame.mark_dirty();
        }
        match frame.unpin() {
            Some(0) => {
                self.replacer.set_evictable(frame_id, true);
                true
            }
            Some(_) => true,
            None => false,
        }
    }
}

/// BufferPoolManager brokers all page I/O: it caches disk pages in a fixed
/// array of frames, pins frames on behalf of callers, and evicts cold frames
/// through the LRU-K replacer, writing them back when dirty.
///
/// Callers access pages through RAII guards ([`ReadPageGuard`] /
/// [`WritePageGuard`]) that hold the page latch and a pin for their whole
/// lifetime, so latches and pins are released on every exit path.
pub struct BufferPoolManager {
    /// Number of frames in the buffer pool
    pool_size: usize,
    /// Shared state
    state: Arc<PoolState>,
    /// Disk scheduler performing the actual I/O
    disk_scheduler: DiskScheduler,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, replacer_k: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::new();

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Frame::new(frame_id));
            free_list.push_back(frame_id);
        }

        let state = Arc::new(PoolState {
            frames,
            page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_SIZE),
            replacer: LruKReplacer::new(pool_size, replacer_k),
            free_list: Mutex::new(free_list),
            latch: Mutex::new(()),
        });

        Self {
            pool_size,
            state,
            disk_scheduler: DiskScheduler::new(disk_manager),
        }
    }

    /// Allocates a fresh page and returns it write-latched and pinned.
    /// Fails with `BufferPoolFull` when every frame is pinned.
    pub fn new_page(&self) -> Result<WritePageGuard> {
        let (page_id, latch) = {
            let _latch = self.state.latch.lock();

            let frame_id = self.acquire_frame()?;
            let page_id = match self.disk_scheduler.disk_manager().allocate_page() {
                Ok(page_id) => page_id,
                Err(e) => {
                    self.state.free_list.lock().push_back(frame_id);
                    return Err(e);
                }
            };

            let frame = &self.state.frames[frame_id.as_usize()];
            frame.install(page_id, None);

            self.state.page_table.insert(page_id, frame_id);
            self.state.replacer.record_access(frame_id);
            self.state.replacer.set_evictable(frame_id, false);

            (page_id, frame.data_lock())
        };

        Ok(WritePageGuard::acquire(
            page_id,
            latch,
            Arc::clone(&self.state),
        ))
    }

    /// Fetches a page for shared access.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        let latch = self.pin_page(page_id)?;
        Ok(ReadPageGuard::acquire(
            page_id,
            latch,
            Arc::clone(&self.state),
        ))
    }

    /// Fetches a page for exclusive access.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        let latch = self.pin_page(page_id)?;
        Ok(WritePageGuard::acquire(
            page_id,
            latch,
            Arc::clone(&self.state),
        ))
    }

    /// Decrements a page's pin count; `is_dirty` is sticky. Returns false
    /// when the page is not resident or not pinned. Guards call this
    /// automatically on drop.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.state.unpin_page(page_id, is_dirty)
    }

    /// Writes a resident page back to disk and clears its dirty flag.
    /// Returns false when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Err(BurrowError::InvalidPageId(page_id));
        }

        let frame_id = {
            let _latch = self.state.latch.lock();
            match self.state.page_table.find(&page_id) {
                Some(frame_id) => frame_id,
                None => return Ok(false),
            }
        };

        // The pool latch is released before taking the page latch: a writer
        // holding the latch may itself be waiting on the pool.
        self.flush_frame(page_id, frame_id)
    }

    /// Flushes every dirty resident page.
    pub fn flush_all_pages(&self) -> Result<()> {
        let dirty: Vec<(PageId, FrameId)> = {
            let _latch = self.state.latch.lock();
            self.state
                .frames
                .iter()
                .filter(|f| f.page_id() != INVALID_PAGE_ID && f.is_dirty())
                .map(|f| (f.page_id(), f.frame_id()))
                .collect()
        };

        for (page_id, frame_id) in dirty {
            self.flush_frame(page_id, frame_id)?;
        }
        Ok(())
    }

    /// Drops a page from the pool and deallocates it on disk. Returns
    /// `Ok(true)` when the page is gone (or was never resident) and
    /// `Ok(false)` when it is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let _latch = self.state.latch.lock();

        let Some(frame_id) = self.state.page_table.find(&page_id) else {
            return Ok(true);
        };
        let frame = &self.state.frames[frame_id.as_usize()];
        if frame.pin_count() > 0 {
            return Ok(false);
        }

        self.state.page_table.remove(&page_id);
        self.state.replacer.remove(frame_id);
        frame.clear();
        self.state.free_list.lock().push_back(frame_id);

        self.disk_scheduler.disk_manager().deallocate_page(page_id)?;
        Ok(true)
    }

    /// Returns the pin count of a resident page.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        self.state
            .page_table
            .find(&page_id)
            .map(|frame_id| self.state.frames[frame_id.as_usize()].pin_count())
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn free_frame_count(&self) -> usize {
        self.state.free_list.lock().len()
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.disk_scheduler.disk_manager()
    }

    /// Pins a page's frame, reading the page from disk on a miss, and
    /// returns the frame's page latch for guard construction.
    fn pin_page(&self, page_id: PageId) -> Result<PageDataLock> {
        if page_id == INVALID_PAGE_ID {
            return Err(BurrowError::InvalidPageId(page_id));
        }

        let _latch = self.state.latch.lock();

        if let Some(frame_id) = self.state.page_table.find(&page_id) {
            let frame = &self.state.frames[frame_id.as_usize()];
            frame.pin();
            self.state.replacer.record_access(frame_id);
            self.state.replacer.set_evictable(frame_id, false);
            return Ok(frame.data_lock());
        }

        let frame_id = self.acquire_frame()?;
        let frame = &self.state.frames[frame_id.as_usize()];

        let mut data = [0u8; PAGE_SIZE];
        if let Err(e) = self.disk_scheduler.read_page_sync(page_id, &mut data) {
            self.state.free_list.lock().push_back(frame_id);
            return Err(e);
        }
        frame.install(page_id, Some(&data));

        self.state.page_table.insert(page_id, frame_id);
        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, false);

        Ok(frame.data_lock())
    }

    /// Obtains an empty frame: from the free list, or by evicting a victim
    /// (writing it back first when dirty). The caller holds the pool latch.
    fn acquire_frame(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.state.free_list.lock().pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self
            .state
            .replacer
            .evict()
            .ok_or(BurrowError::BufferPoolFull)?;
        let frame = &self.state.frames[frame_id.as_usize()];
        let old_page_id = frame.page_id();

        if frame.is_dirty() {
            debug!("writing back dirty page {} before eviction", old_page_id);
            let mut data = [0u8; PAGE_SIZE];
            frame.snapshot(&mut data);
            if let Err(e) = self.disk_scheduler.write_page_sync(old_page_id, &data) {
                // Put the victim back so its dirty data is not stranded
                self.state.replacer.record_access(frame_id);
                self.state.replacer.set_evictable(frame_id, true);
                return Err(e);
            }
        }

        self.state.page_table.remove(&old_page_id);
        frame.clear();

        Ok(frame_id)
    }

    fn flush_frame(&self, page_id: PageId, frame_id: FrameId) -> Result<bool> {
        let frame = &self.state.frames[frame_id.as_usize()];

        // The frame may have been evicted and reused since the lookup
        let mut data = [0u8; PAGE_SIZE];
        if !frame.snapshot_verified(page_id, &mut data) {
            return Ok(false);
        }

        self.disk_scheduler.write_page_sync(page_id, &data)?;
        frame.clear_dirty();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = BufferPoolManager::new(pool_size, 2, dm);
        (bpm, temp_file)
    }

    #[test]
    fn test_buffer_pool_manager_new() {
        let (bpm, _temp) = create_bpm(10);
        assert_eq!(bpm.pool_size(), 10);
        assert_eq!(bpm.free_frame_count(), 10);
    }

    #[test]
    fn test_buffer_pool_manager_new_page() {
        let (bpm, _temp) = create_bpm(10);

        let guard = bpm.new_page().unwrap();
        // Page 0 is the header page
        assert_eq!(guard.page_id(), PageId::new(1));
        assert_eq!(bpm.pin_count(guard.page_id()), Some(1));
        assert_eq!(bpm.free_frame_count(), 9);

        let page_id = guard.page_id();
        drop(guard);
        assert_eq!(bpm.pin_count(page_id), Some(0));
    }

    #[test]
    fn test_buffer_pool_manager_read_write() {
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
    fn test_buffer_pool_manager_flush() {
        let (bpm, temp) = create_bpm(10);

        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = 42;
            guard.page_id()
        };

        bpm.flush_page(page_id).unwrap();
        drop(bpm);

        let dm = Arc::new(DiskManager::new(temp.path()).unwrap());
        let bpm2 = BufferPoolManager::new(10, 2, dm);

        let guard = bpm2.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 42);
    }

    #[test]
    fn test_buffer_pool_manager_eviction_writes_back() {
        let (bpm, _temp) = create_bpm(3);

        let page_ids: Vec<PageId> = (0..3)
            .map(|i| {
                let mut guard = bpm.new_page().unwrap();
                guard.data_mut()[0] = i as u8;
                guard.page_id()
            })
            .collect();

        assert_eq!(bpm.free_frame_count(), 0);

        // Evicts one of the unpinned pages
        let extra = bpm.new_page().unwrap();
        assert_eq!(extra.page_id(), PageId::new(4));
        drop(extra);

        // Every original page is still readable, re-fetched from disk
        for (i, &pid) in page_ids.iter().enumerate() {
            let guard = bpm.fetch_page_read(pid).unwrap();
            assert_eq!(guard.data()[0], i as u8);
        }
    }

    #[test]
    fn test_buffer_pool_manager_full() {
        let (bpm, _temp) = create_bpm(2);

        let _guard1 = bpm.new_page().unwrap();
        let _guard2 = bpm.new_page().unwrap();

        assert!(matches!(bpm.new_page(), Err(BurrowError::BufferPoolFull)));
        assert!(matches!(
            bpm.fetch_page_read(PageId::new(0)),
            Err(BurrowError::BufferPoolFull)
        ));
    }

    #[test]
    fn test_buffer_pool_manager_unpin_page() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page().unwrap().page_id();

        {
            let _guard1 = bpm.fetch_page_read(page_id).unwrap();
            let _guard2 = bpm.fetch_page_read(page_id).unwrap();
            assert_eq!(bpm.pin_count(page_id), Some(2));
        }

        assert_eq!(bpm.pin_count(page_id), Some(0));
        // Unpinning below zero or a non-resident page reports failure
        assert!(!bpm.unpin_page(page_id, false));
        assert!(!bpm.unpin_page(PageId::new(9999), false));
    }

    #[test]
    fn test_buffer_pool_manager_delete_page() {
        let (bpm, _temp) = create_bpm(10);

        let guard = bpm.new_page().unwrap();
        let page_id = guard.page_id();

        // Pinned pages cannot be deleted
        assert!(!bpm.delete_page(page_id).unwrap());

        drop(guard);
        let free_before = bpm.free_frame_count();
        assert!(bpm.delete_page(page_id).unwrap());
        assert_eq!(bpm.pin_count(page_id), None);
        assert_eq!(bpm.free_frame_count(), free_before + 1);

        // Deleting a non-resident page is a no-op success
        assert!(bpm.delete_page(page_id).unwrap());
    }

    #[test]
    fn test_buffer_pool_manager_concurrent_readers() {
        use std::thread;

        let (bpm, _temp) = create_bpm(10);
        let bpm = Arc::new(bpm);

        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = 7;
            guard.page_id()
        };

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bpm = Arc::clone(&bpm);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let guard = bpm.fetch_page_read(page_id).unwrap();
                        assert_eq!(guard.data()[0], 7);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(bpm.pin_count(page_id), Some(0));
    }
}
