use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::{FrameId, PageId, INVALID_PAGE_ID, PAGE_SIZE};

/// The page bytes of a frame behind the per-page reader-writer latch,
/// shared so a page guard can hold the latch without borrowing the pool.
pub(crate) type PageDataLock = Arc<RwLock<Box<[u8; PAGE_SIZE]>>>;

/// One slot of the buffer pool.
///
/// A frame is either empty (`INVALID_PAGE_ID`, zeroed bytes) or resident:
/// holding one disk page, a pin count, and a dirty flag. `install` and
/// `clear` flip a frame between the two states and are only called under
/// the pool latch on an unpinned frame; pins and the dirty flag are
/// atomics that page guards touch directly.
pub struct Frame {
    frame_id: FrameId,
    /// Raw id of the resident page; `u32::MAX` when empty
    page_id: AtomicU32,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
    data: PageDataLock,
}

impl Frame {
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: AtomicU32::new(INVALID_PAGE_ID.as_u32()),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            data: Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]))),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn page_id(&self) -> PageId {
        PageId::new(self.page_id.load(Ordering::Acquire))
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    /// Makes an empty frame resident: records the page id, loads the page
    /// bytes (`None` keeps the zeroed buffer of a freshly allocated page),
    /// and hands the caller the first pin.
    pub(crate) fn install(&self, page_id: PageId, bytes: Option<&[u8]>) {
        debug_assert_eq!(self.pin_count(), 0);

        self.page_id.store(page_id.as_u32(), Ordering::Release);
        if let Some(bytes) = bytes {
            assert_eq!(bytes.len(), PAGE_SIZE);
            self.data.write().copy_from_slice(bytes);
        }
        self.is_dirty.store(false, Ordering::Release);
        self.pin_count.store(1, Ordering::Release);
    }

    /// Returns the frame to its empty state. The caller guarantees the
    /// frame is unpinned and its contents are no longer needed.
    pub(crate) fn clear(&self) {
        self.page_id
            .store(INVALID_PAGE_ID.as_u32(), Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.is_dirty.store(false, Ordering::Release);
        self.data.write().fill(0);
    }

    /// Takes one more pin and returns the new count.
    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Releases one pin and returns the new count, or None when the frame
    /// was not pinned at all.
    pub(crate) fn unpin(&self) -> Option<u32> {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .ok()
            .map(|previous| previous - 1)
    }

    pub(crate) fn mark_dirty(&self) {
        self.is_dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dirty(&self) {
        self.is_dirty.store(false, Ordering::Release);
    }

    /// Copies the page bytes out under the read latch, for eviction
    /// write-back.
    pub(crate) fn snapshot(&self, out: &mut [u8; PAGE_SIZE]) {
        out.copy_from_slice(&self.data.read()[..]);
    }

    /// Like `snapshot`, but only if the frame still holds `expected` -
    /// a flush may race with eviction reusing the frame.
    pub(crate) fn snapshot_verified(&self, expected: PageId, out: &mut [u8; PAGE_SIZE]) -> bool {
        let bytes = self.data.read();
        if self.page_id() != expected {
            return false;
        }
        out.copy_from_slice(&bytes[..]);
        true
    }

    /// Hands out the shared page latch for guard construction.
    pub(crate) fn data_lock(&self) -> PageDataLock {
        Arc::clone(&self.data)
    }
}
