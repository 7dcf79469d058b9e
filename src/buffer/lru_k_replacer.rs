use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::FrameId;

#[derive(Debug, Default)]
struct FrameEntry {
    access_count: usize,
    evictable: bool,
}

#[derive(Debug)]
struct LruKState {
    entries: HashMap<FrameId, FrameEntry>,
    /// Frames with fewer than k accesses, FIFO by first access (oldest at front).
    history: VecDeque<FrameId>,
    /// Frames with at least k accesses, most recently used at the front.
    cache: VecDeque<FrameId>,
    /// Number of evictable frames across both lists.
    curr_size: usize,
}

/// LRU-K replacement policy.
///
/// A frame's backward k-distance is the time since its k-th most recent
/// access, or +inf while it has fewer than k accesses. Eviction prefers the
/// largest distance: any under-k frame (all at +inf) beats every frame with
/// k accesses, and among under-k frames the one with the earliest first
/// access goes first. Frames with k or more accesses are kept in LRU order.
pub struct LruKReplacer {
    k: usize,
    /// Capacity bound: valid frame ids are [0, replacer_size).
    replacer_size: usize,
    state: Mutex<LruKState>,
}

impl LruKReplacer {
    pub fn new(k: usize, replacer_size: usize) -> Self {
        assert!(k > 0, "k must be positive");
        Self {
            k,
            replacer_size,
            state: Mutex::new(LruKState {
                entries: HashMap::new(),
                history: VecDeque::new(),
                cache: VecDeque::new(),
                curr_size: 0,
            }),
        }
    }

    fn check_frame_id(&self, frame_id: FrameId) {
        assert!(
            frame_id.as_usize() < self.replacer_size,
            "frame id {} out of range (pool size {})",
            frame_id,
            self.replacer_size
        );
    }

    /// Records an access to `frame_id`. On the k-th access the frame
    /// graduates from the history list to the front of the cache list; every
    /// later access moves it back to the front.
    pub fn record_access(&self, frame_id: FrameId) {
        self.check_frame_id(frame_id);
        let mut state = self.state.lock();

        let entry = state.entries.entry(frame_id).or_default();
        entry.access_count += 1;
        let count = entry.access_count;

        if count == self.k {
            if let Some(pos) = state.history.iter().position(|&f| f == frame_id) {
                state.history.remove(pos);
            }
            state.cache.push_front(frame_id);
        } else if count > self.k {
            if let Some(pos) = state.cache.iter().position(|&f| f == frame_id) {
                state.cache.remove(pos);
            }
            state.cache.push_front(frame_id);
        } else if !state.history.contains(&frame_id) {
            state.history.push_back(frame_id);
        }
    }

    /// Toggles whether `frame_id` may be evicted. Idempotent; a no-op for
    /// frames the replacer is not tracking.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        self.check_frame_id(frame_id);
        let mut state = self.state.lock();

        let changed = match state.entries.get_mut(&frame_id) {
            Some(entry) if entry.evictable != evictable => {
                entry.evictable = evictable;
                true
            }
            _ => false,
        };
        if changed {
            if evictable {
                state.curr_size += 1;
            } else {
                state.curr_size -= 1;
            }
        }
    }

    /// Evicts the evictable frame with the largest backward k-distance:
    /// the oldest history-list frame if any is evictable, otherwise the
    /// least recently used cache-list frame. The evicted frame's access
    /// history is dropped.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();
        if state.curr_size == 0 {
            return None;
        }

        if let Some(pos) = state
            .history
            .iter()
            .position(|f| state.entries[f].evictable)
        {
            let frame_id = state.history.remove(pos).unwrap();
            state.entries.remove(&frame_id);
            state.curr_size -= 1;
            return Some(frame_id);
        }

        if let Some(pos) = state
            .cache
            .iter()
            .rposition(|f| state.entries[f].evictable)
        {
            let frame_id = state.cache.remove(pos).unwrap();
            state.entries.remove(&frame_id);
            state.curr_size -= 1;
            return Some(frame_id);
        }

        None
    }

    /// Removes a specific frame and its access history, regardless of its
    /// k-distance. A no-op for untracked frames; removing a tracked frame
    /// that is not evictable is a contract violation.
    pub fn remove(&self, frame_id: FrameId) {
        self.check_frame_id(frame_id);
        let mut state = self.state.lock();

        let Some(entry) = state.entries.get(&frame_id) else {
            return;
        };
        assert!(
            entry.evictable,
            "cannot remove non-evictable frame {}",
            frame_id
        );

        if let Some(pos) = state.history.iter().position(|&f| f == frame_id) {
            state.history.remove(pos);
        } else if let Some(pos) = state.cache.iter().position(|&f| f == frame_id) {
            state.cache.remove(pos);
        }
        state.entries.remove(&frame_id);
        state.curr_size -= 1;
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.state.lock().curr_size
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_replacer_is_empty() {
        let replacer = LruKReplacer::new(2, 10);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.k(), 2);
    }

    #[test]
    fn test_history_evicts_oldest_first() {
        let replacer = LruKReplacer::new(2, 10);

        for i in 0..3 {
            replacer.record_access(FrameId::new(i));
            replacer.set_evictable(FrameId::new(i), true);
        }
        assert_eq!(replacer.size(), 3);

        // All under k accesses: FIFO on first access.
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_history_beats_cache() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));

        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        // Frame 1 has +inf distance, frame 0 a finite one.
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_cache_evicts_lru() {
        let replacer = LruKReplacer::new(2, 10);

        for i in 0..3 {
            replacer.record_access(FrameId::new(i));
            replacer.record_access(FrameId::new(i));
            replacer.set_evictable(FrameId::new(i), true);
        }
        // Re-access frame 0: it becomes the most recent.
        replacer.record_access(FrameId::new(0));

        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
        assert_eq!(replacer.evict(), Some(FrameId::new(2)));
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }

    #[test]
    fn test_set_evictable_is_idempotent() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(FrameId::new(0), false);
        replacer.set_evictable(FrameId::new(0), false);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_remove_tracked_evictable() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));
        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        replacer.remove(FrameId::new(0));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(FrameId::new(1)));
    }

    #[test]
    fn test_remove_untracked_is_noop() {
        let replacer = LruKReplacer::new(2, 10);
        replacer.remove(FrameId::new(5));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    #[should_panic(expected = "non-evictable")]
    fn test_remove_non_evictable_panics() {
        let replacer = LruKReplacer::new(2, 10);
        replacer.record_access(FrameId::new(0));
        replacer.remove(FrameId::new(0));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_invalid_frame_id_panics() {
        let replacer = LruKReplacer::new(2, 10);
        replacer.record_access(FrameId::new(10));
    }

    #[test]
    fn test_eviction_clears_history() {
        let replacer = LruKReplacer::new(2, 10);

        replacer.record_access(FrameId::new(0));
        replacer.set_evictable(FrameId::new(0), true);
        assert_eq!(replacer.evict(), Some(FrameId::new(0)));

        // A fresh access starts a new history: back to the under-k list.
        replacer.record_access(FrameId::new(0));
        replacer.record_access(FrameId::new(1));
        replacer.record_access(FrameId::new(1));
        replacer.set_evictable(FrameId::new(0), true);
        replacer.set_evictable(FrameId::new(1), true);

        assert_eq!(replacer.evict(), Some(FrameId::new(0)));
    }
}
