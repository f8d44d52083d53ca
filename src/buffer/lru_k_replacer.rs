use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::FrameId;

#[derive(Debug, Default)]
struct Entry {
    /// Number of recorded accesses
    in_count: u64,
    /// Whether this frame may be evicted
    evictable: bool,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<FrameId, Entry>,
    /// Frames with fewer than k accesses, front = most recently inserted
    history_list: VecDeque<FrameId>,
    /// Frames with at least k accesses, front = most recently accessed
    cache_list: VecDeque<FrameId>,
    /// Count of evictable frames
    curr_size: usize,
}

impl Inner {
    fn evict_from(list: &mut VecDeque<FrameId>, entries: &mut HashMap<FrameId, Entry>) -> Option<FrameId> {
        // Scan least-recent first
        let pos = list
            .iter()
            .rposition(|fid| entries.get(fid).is_some_and(|e| e.evictable))?;
        let fid = list.remove(pos).unwrap();
        entries.remove(&fid);
        Some(fid)
    }

    fn remove_from_list(list: &mut VecDeque<FrameId>, fid: FrameId) {
        if let Some(pos) = list.iter().position(|&f| f == fid) {
            list.remove(pos);
        }
    }
}

/// LRU-K replacement policy.
///
/// A frame with fewer than k recorded accesses has an infinite backward
/// k-distance and lives in the history list; eviction picks such frames
/// first, oldest first access winning. Frames with at least k accesses live
/// in the cache list ordered by recency, and the least recently used one is
/// evicted when the history list has no candidate.
pub struct LruKReplacer {
    k: usize,
    /// Maximum number of frames the replacer can track
    replacer_size: usize,
    inner: Mutex<Inner>,
}

impl LruKReplacer {
    pub fn new(replacer_size: usize, k: usize) -> Self {
        assert!(k > 0, "k must be positive");
        Self {
            k,
            replacer_size,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Evicts the frame with the largest backward k-distance.
    /// Returns None if there are no evictable frames.
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        let Inner {
            entries,
            history_list,
            cache_list,
            curr_size,
        } = &mut *inner;

        let victim =
            Inner::evict_from(history_list, entries).or_else(|| Inner::evict_from(cache_list, entries));

        if victim.is_some() {
            *curr_size -= 1;
        }
        victim
    }

    /// Records an access to the given frame, creating its entry on the first
    /// access and promoting it to the cache list at the k-th.
    pub fn record_access(&self, frame_id: FrameId) {
        self.check_frame_id(frame_id);
        let mut inner = self.inner.lock();

        let entry = inner.entries.entry(frame_id).or_default();
        entry.in_count += 1;
        let in_count = entry.in_count;

        if in_count == 1 {
            inner.history_list.push_front(frame_id);
        } else if in_count == self.k as u64 {
            Inner::remove_from_list(&mut inner.history_list, frame_id);
            inner.cache_list.push_front(frame_id);
        } else if in_count > self.k as u64 {
            Inner::remove_from_list(&mut inner.cache_list, frame_id);
            inner.cache_list.push_front(frame_id);
        }
    }

    /// Sets whether a frame is evictable, adjusting the evictable count.
    /// Unknown frames are ignored.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        self.check_frame_id(frame_id);
        let mut inner = self.inner.lock();

        let Some(entry) = inner.entries.get_mut(&frame_id) else {
            return;
        };
        if entry.evictable != evictable {
            entry.evictable = evictable;
            if evictable {
                inner.curr_size += 1;
            } else {
                inner.curr_size -= 1;
            }
        }
    }

    /// Forcibly drops a frame's entry regardless of its evictable flag.
    /// The caller guarantees the frame's pin count is zero.
    pub fn remove(&self, frame_id: FrameId) {
        self.check_frame_id(frame_id);
        let mut inner = self.inner.lock();

        let Some(entry) = inner.entries.remove(&frame_id) else {
            return;
        };
        if entry.in_count < self.k as u64 {
            Inner::remove_from_list(&mut inner.history_list, frame_id);
        } else {
            Inner::remove_from_list(&mut inner.cache_list, frame_id);
        }
        if entry.evictable {
            inner.curr_size -= 1;
        }
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.inner.lock().curr_size
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn check_frame_id(&self, frame_id: FrameId) {
        assert!(
            frame_id.as_usize() < self.replacer_size,
            "frame id {} out of range for replacer of size {}",
            frame_id,
            self.replacer_size
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_k_replacer_new() {
        let replacer = LruKReplacer::new(10, 2);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.k(), 2);
    }

    #[test]
    fn test_lru_k_replacer_evict_empty() {
        let replacer = LruKReplacer::new(10, 2);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_infinite_distance_fifo() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));
        replacer.record_access(FrameId::new(2));

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);
        replacer.set_evictable(FrameId::new(2), true);

        assert_eq!(replacer.size(), 3);

        // All frames have a single access (+inf distance): oldest first
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_k_replacer_history_before_cache() {
        let replacer = LruKReplacer::new(10, 2);

        // Frame 0 reaches k accesses, frame 1 does not
        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        // +inf distance beats any finite distance
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_lru_k_replacer_cache_lru_order() {
        let replacer = LruKReplacer::new(10, 2);

        for fid in 0..3 {
            replacer.record_access(FrameId::new(fid));
            replacer.record_access(FrameId::new(fid));
        }

        // Touch frame 0 again so frame 1 becomes the coldest
        replacer.record_access(FrameId::new(0));

        for fid in 0..3 {
            replacer.set_evictable(FrameId::new(fid), true);
        }

        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_lru_k_replacer_not_evictable() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));

        replacer.set_evictable(FrameId::new(1), true);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_replacer_toggle_evictable() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId::new(0));
        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(FrameId::new(0), false);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);

        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_lru_k_replacer_remove() {
        let replacer = LruKReplacer::new(10, 2);

        replacer.record_access(FrameId::new(0));
        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);

        replacer.remove(FrameId::new(0));
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    #[should_panic]
    fn test_lru_k_replacer_out_of_range() {
        let replacer = LruKReplacer::new(4, 2);
        replacer.record_access(FrameId::new(4));
    }
}
