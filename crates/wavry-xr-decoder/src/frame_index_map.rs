use std::sync::atomic::{AtomicU64, Ordering};

use wavry_xr::{TrackingFrameIndex, NULL_FRAME_INDEX};

/// Default slot count, covering several seconds of in-flight frames at 90 Hz.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Correlates submission timestamps with tracking frame indices.
///
/// Each timestamp owns slot `pts % capacity`. Writes are last-write-wins and
/// there is no chaining: two in-flight timestamps that alias the same slot
/// lose the older index. Every operation is a single atomic on one slot, so the
/// submit path and the codec callback threads never contend on a lock.
#[derive(Debug)]
pub struct FrameIndexMap {
    slots: Box<[AtomicU64]>,
}

impl FrameIndexMap {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1))
            .map(|_| AtomicU64::new(NULL_FRAME_INDEX))
            .collect();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, pts: u64) -> &AtomicU64 {
        &self.slots[(pts % self.slots.len() as u64) as usize]
    }

    pub fn set(&self, pts: u64, frame_index: TrackingFrameIndex) {
        self.slot(pts).store(frame_index, Ordering::Release);
    }

    /// Reads the slot without clearing it.
    pub fn get(&self, pts: u64) -> Option<TrackingFrameIndex> {
        resolve(self.slot(pts).load(Ordering::Acquire))
    }

    /// Reads and empties the slot so a later aliasing timestamp cannot pick it up.
    pub fn get_and_clear(&self, pts: u64) -> Option<TrackingFrameIndex> {
        resolve(self.slot(pts).swap(NULL_FRAME_INDEX, Ordering::AcqRel))
    }
}

impl Default for FrameIndexMap {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[inline]
fn resolve(raw: u64) -> Option<TrackingFrameIndex> {
    (raw != NULL_FRAME_INDEX).then_some(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_map_resolves_nothing() {
        let map = FrameIndexMap::new(16);
        assert_eq!(map.get(0), None);
        assert_eq!(map.get_and_clear(12345), None);
    }

    #[test]
    fn test_get_keeps_value() {
        let map = FrameIndexMap::new(16);
        map.set(1_000_003, 7);
        assert_eq!(map.get(1_000_003), Some(7));
        assert_eq!(map.get(1_000_003), Some(7));
    }

    #[test]
    fn test_get_and_clear_twice() {
        let map = FrameIndexMap::new(16);
        map.set(40, 9);
        assert_eq!(map.get_and_clear(40), Some(9));
        assert_eq!(map.get_and_clear(40), None);
        assert_eq!(map.get(40), None);
    }

    #[test]
    fn test_aliasing_is_last_write_wins() {
        let map = FrameIndexMap::new(16);
        map.set(3, 100);
        map.set(3 + 16, 101);
        assert_eq!(map.get(3), Some(101));
        assert_eq!(map.get_and_clear(3 + 32), Some(101));
        assert_eq!(map.get(3), None);
    }

    #[test]
    fn test_last_write_per_slot_random() {
        let capacity = 64;
        let map = FrameIndexMap::new(capacity);
        let mut expected = HashMap::new();
        let mut rng = rand::thread_rng();
        for i in 0..2000u64 {
            let pts: u64 = rng.gen();
            map.set(pts, i);
            expected.insert(pts % capacity as u64, i);
        }
        for (slot, idx) in expected {
            assert_eq!(map.get(slot), Some(idx));
        }
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let map = FrameIndexMap::new(0);
        assert_eq!(map.capacity(), 1);
        map.set(99, 1);
        assert_eq!(map.get(5), Some(1));
    }

    #[test]
    fn test_each_value_consumed_once_across_threads() {
        let map = Arc::new(FrameIndexMap::new(DEFAULT_CAPACITY));
        for pts in 0..DEFAULT_CAPACITY as u64 {
            map.set(pts, pts + 1);
        }
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let map = map.clone();
                thread::spawn(move || {
                    (0..DEFAULT_CAPACITY as u64)
                        .filter(|pts| map.get_and_clear(*pts).is_some())
                        .count()
                })
            })
            .collect();
        let total: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(total, DEFAULT_CAPACITY);
    }
}
