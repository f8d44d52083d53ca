use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock};

use crate::common::{PageId, PAGE_SIZE};

use super::buffer_pool_manager::PoolState;
use super::frame::PageDataLock;

/// A pin on a buffered page, returned to the pool on drop.
///
/// Guards embed this *after* their latch guard: struct fields drop in
/// declaration order, so the page latch is released before the unpin makes
/// the frame evictable.
struct PagePin {
    page_id: PageId,
    dirty: bool,
    pool: Arc<PoolState>,
}

impl Drop for PagePin {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.dirty);
    }
}

/// Shared access to a buffered page: holds the page's read latch and a pin
/// for its whole lifetime, so the bytes can neither change nor be evicted
/// until the guard drops.
pub struct ReadPageGuard {
    data: ArcRwLockReadGuard<RawRwLock, Box<[u8; PAGE_SIZE]>>,
    pin: PagePin,
}

impl ReadPageGuard {
    /// Blocks until the page's read latch is available. The caller has
    /// already pinned the frame; this guard owns that pin from here on.
    pub(crate) fn acquire(page_id: PageId, latch: PageDataLock, pool: Arc<PoolState>) -> Self {
        Self {
            data: latch.read_arc(),
            pin: PagePin {
                page_id,
                dirty: false,
                pool,
            },
        }
    }

    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }
}

/// Exclusive access to a buffered page. Writing through `data_mut` marks
/// the page dirty; the latch is released and the pin (with the dirty flag)
/// returned to the pool when the guard drops.
pub struct WritePageGuard {
    data: ArcRwLockWriteGuard<RawRwLock, Box<[u8; PAGE_SIZE]>>,
    pin: PagePin,
}

impl WritePageGuard {
    /// Blocks until the page's write latch is available. The caller has
    /// already pinned the frame; this guard owns that pin from here on.
    pub(crate) fn acquire(page_id: PageId, latch: PageDataLock, pool: Arc<PoolState>) -> Self {
        Self {
            data: latch.write_arc(),
            pin: PagePin {
                page_id,
                dirty: false,
                pool,
            },
        }
    }

    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    /// Mutable view of the page bytes; the page is dirty from now on.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.pin.dirty = true;
        &mut self.data[..]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use tempfile::NamedTempFile;

    use crate::buffer::BufferPoolManager;
    use crate::storage::disk::DiskManager;

    use super::*;

    fn create_bpm(pool_size: usize) -> (Arc<BufferPoolManager>, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        (Arc::new(BufferPoolManager::new(pool_size, 2, dm)), temp_file)
    }

    #[test]
    fn test_guards_own_one_pin_each() {
        let (bpm, _temp) = create_bpm(4);
        let page_id = bpm.new_page().unwrap().page_id();
        assert_eq!(bpm.pin_count(page_id), Some(0));

        let first = bpm.fetch_page_read(page_id).unwrap();
        let second = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(bpm.pin_count(page_id), Some(2));
        assert_eq!(first.page_id(), page_id);

        drop(first);
        assert_eq!(bpm.pin_count(page_id), Some(1));
        drop(second);
        assert_eq!(bpm.pin_count(page_id), Some(0));
    }

    #[test]
    fn test_write_guard_dirty_survives_eviction() {
        let (bpm, _temp) = create_bpm(2);

        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = 0x5A;
            guard.page_id()
        };

        // Without an explicit flush, only the dirty flag set by the guard
        // makes eviction write the page back
        for _ in 0..4 {
            drop(bpm.new_page().unwrap());
        }
        assert_eq!(bpm.pin_count(page_id), None);

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 0x5A);
    }

    #[test]
    fn test_untouched_write_guard_stays_clean() {
        let (bpm, _temp) = create_bpm(4);

        let page_id = bpm.new_page().unwrap().page_id();
        let writes_before = bpm.disk_manager().get_num_writes();

        // Write-latched but never written through
        drop(bpm.fetch_page_write(page_id).unwrap());
        drop(bpm.fetch_page_read(page_id).unwrap());

        // Nothing became dirty, so flushing all pages rewrites nothing new
        // beyond the page's original allocation
        bpm.flush_all_pages().unwrap();
        assert!(bpm.disk_manager().get_num_writes() <= writes_before + 1);
    }

    #[test]
    fn test_write_guard_blocks_readers() {
        let (bpm, _temp) = create_bpm(4);
        let page_id = bpm.new_page().unwrap().page_id();

        let mut write_guard = bpm.fetch_page_write(page_id).unwrap();
        write_guard.data_mut()[0] = 1;

        let (tx, rx) = mpsc::channel();
        let reader = {
            let bpm = Arc::clone(&bpm);
            thread::spawn(move || {
                let guard = bpm.fetch_page_read(page_id).unwrap();
                tx.send(guard.data()[0]).unwrap();
            })
        };

        // The reader cannot get past the write latch
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(write_guard);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        reader.join().unwrap();
    }
}
