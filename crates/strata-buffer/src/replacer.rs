//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Trait for page replacement algorithms.
///
/// A replacer tracks exactly the frames that are candidates for eviction,
/// i.e. resident frames whose pin count has dropped to zero.
pub trait Replacer: Send + Sync {
    /// Removes and returns the frame to evict, or None if no frame is
    /// evictable.
    fn victim(&self) -> Option<FrameId>;

    /// Removes a frame from the replacer, making it non-evictable.
    /// No-op when the frame is not tracked.
    fn pin(&self, frame_id: FrameId);

    /// Inserts a frame as the most-recently-used entry. No-op when the
    /// frame is already tracked or the replacer is at capacity.
    fn unpin(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// LRU replacement policy.
///
/// "Recency" is the time of the unpin that made the frame evictable, so the
/// victim is always the least-recently-unpinned frame.
pub struct LruReplacer {
    /// Maximum number of frames the replacer may track.
    capacity: usize,
    /// Recency-ordered set of evictable frames.
    inner: Mutex<LruCache<FrameId, ()>>,
}

impl LruReplacer {
    /// Creates a new LRU replacer bounded by the given number of frames.
    pub fn new(num_pages: usize) -> Self {
        let capacity = num_pages.max(1);
        let cache_size = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            capacity,
            inner: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Returns the maximum number of frames this replacer may track.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Replacer for LruReplacer {
    fn victim(&self) -> Option<FrameId> {
        self.inner.lock().pop_lru().map(|(frame_id, _)| frame_id)
    }

    fn pin(&self, frame_id: FrameId) {
        self.inner.lock().pop(&frame_id);
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if !inner.contains(&frame_id) && inner.len() < self.capacity {
            inner.put(frame_id, ());
        }
    }

    fn size(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_replacer_new() {
        let replacer = LruReplacer::new(10);
        assert_eq!(replacer.capacity(), 10);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_replacer_victim_empty() {
        let replacer = LruReplacer::new(10);
        assert!(replacer.victim().is_none());
    }

    #[test]
    fn test_lru_replacer_victim_order() {
        let replacer = LruReplacer::new(10);

        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(2));
        replacer.unpin(FrameId(3));
        assert_eq!(replacer.size(), 3);

        // Least-recently-unpinned first
        assert_eq!(replacer.victim(), Some(FrameId(1)));
        assert_eq!(replacer.victim(), Some(FrameId(2)));
        assert_eq!(replacer.victim(), Some(FrameId(3)));
        assert!(replacer.victim().is_none());
    }

    #[test]
    fn test_lru_replacer_pin_removes() {
        let replacer = LruReplacer::new(10);

        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(2));
        assert_eq!(replacer.size(), 2);

        replacer.pin(FrameId(1));
        assert_eq!(replacer.size(), 1);

        assert_eq!(replacer.victim(), Some(FrameId(2)));
    }

    #[test]
    fn test_lru_replacer_pin_absent_is_noop() {
        let replacer = LruReplacer::new(10);

        replacer.unpin(FrameId(1));
        replacer.pin(FrameId(99));
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_lru_replacer_duplicate_unpin_keeps_position() {
        let replacer = LruReplacer::new(10);

        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(2));
        // Duplicate unpin must not refresh frame 1's recency
        replacer.unpin(FrameId(1));
        assert_eq!(replacer.size(), 2);

        assert_eq!(replacer.victim(), Some(FrameId(1)));
    }

    #[test]
    fn test_lru_replacer_capacity_bound() {
        let replacer = LruReplacer::new(3);

        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(2));
        replacer.unpin(FrameId(3));
        // At capacity: further unpins are dropped
        replacer.unpin(FrameId(4));

        assert_eq!(replacer.size(), 3);
        assert_eq!(replacer.victim(), Some(FrameId(1)));
    }

    #[test]
    fn test_lru_replacer_pin_unpin_cycle() {
        let replacer = LruReplacer::new(5);

        replacer.unpin(FrameId(0));
        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(2));

        // Re-pinning and unpinning moves the frame to the MRU end
        replacer.pin(FrameId(0));
        replacer.unpin(FrameId(0));

        assert_eq!(replacer.victim(), Some(FrameId(1)));
        assert_eq!(replacer.victim(), Some(FrameId(2)));
        assert_eq!(replacer.victim(), Some(FrameId(0)));
    }
}
