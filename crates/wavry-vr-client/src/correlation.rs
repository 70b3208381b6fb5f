//! Frame index to pose correlation.
//!
//! Decode and transit put a variable delay between sampling a pose and
//! displaying the frame rendered for it. The store keeps the pose submitted
//! with each frame request so the display step can re-attach it.
//!
//! # Retention
//!
//! - Entries more than [`RETENTION_WINDOW`] indices behind the newest
//!   displayed frame are evicted; very late frames are assumed lost.
//! - An optional hard cap drops the oldest index when requests outpace
//!   displayed frames for a long time.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use wavry_vr::{FrameIndex, PoseSample};

pub const RETENTION_WINDOW: FrameIndex = 100;

#[derive(Debug)]
pub struct CorrelationStore {
    entries: Mutex<BTreeMap<FrameIndex, PoseSample>>,
    retention: FrameIndex,
    max_entries: Option<usize>,
}

impl Default for CorrelationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::with_retention(RETENTION_WINDOW)
    }

    pub fn with_retention(retention: FrameIndex) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            retention,
            max_entries: None,
        }
    }

    /// Caps the number of outstanding entries.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries.max(1));
        self
    }

    pub fn retention(&self) -> FrameIndex {
        self.retention
    }

    /// Inserts or overwrites the pose for `index`.
    pub fn record(&self, index: FrameIndex, pose: PoseSample) {
        let mut entries = self.lock();
        entries.insert(index, pose);
        if let Some(max) = self.max_entries {
            while entries.len() > max {
                entries.pop_first();
            }
        }
    }

    /// Removes and returns the pose recorded for `index`.
    pub fn take(&self, index: FrameIndex) -> Option<PoseSample> {
        self.lock().remove(&index)
    }

    /// Drops every entry older than `index - retention`. Returns how many
    /// entries were evicted.
    pub fn evict_before(&self, index: FrameIndex) -> usize {
        let cutoff = index.saturating_sub(self.retention);
        if cutoff == 0 {
            return 0;
        }
        let mut entries = self.lock();
        let kept = entries.split_off(&cutoff);
        let evicted = entries.len();
        *entries = kept;
        evicted
    }

    pub fn contains(&self, index: FrameIndex) -> bool {
        self.lock().contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<FrameIndex, PoseSample>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn pose(tag: i64) -> PoseSample {
        PoseSample::identity(tag)
    }

    #[test]
    fn test_take_returns_recorded_pose_once() {
        let store = CorrelationStore::new();
        store.record(7, pose(70));
        assert_eq!(store.take(7), Some(pose(70)));
        assert_eq!(store.take(7), None);
    }

    #[test]
    fn test_record_overwrites() {
        let store = CorrelationStore::new();
        store.record(3, pose(1));
        store.record(3, pose(2));
        assert_eq!(store.len(), 1);
        assert_eq!(store.take(3), Some(pose(2)));
    }

    #[test]
    fn test_unrecorded_index_misses() {
        let store = CorrelationStore::new();
        for i in 0..10 {
            store.record(i * 2, pose(i as i64));
        }
        for i in 0..10 {
            assert_eq!(store.take(i * 2 + 1), None);
        }
        assert_eq!(store.len(), 10);
    }

    #[test]
    fn test_evict_respects_window() {
        let store = CorrelationStore::new();
        for i in 0..=300 {
            store.record(i, pose(i as i64));
        }
        let evicted = store.evict_before(250);
        assert_eq!(evicted, 150);
        assert_eq!(store.take(149), None);
        assert_eq!(store.take(150), Some(pose(150)));
        assert_eq!(store.take(300), Some(pose(300)));
    }

    #[test]
    fn test_evict_near_zero_keeps_everything() {
        let store = CorrelationStore::new();
        store.record(0, pose(0));
        store.record(5, pose(5));
        assert_eq!(store.evict_before(100), 0);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_late_entry_is_evicted() {
        let store = CorrelationStore::new();
        store.record(42, pose(42));
        for i in 43..=143 {
            store.record(i, pose(i as i64));
            store.evict_before(i);
        }
        assert_eq!(store.take(42), None);
        assert_eq!(store.take(43), Some(pose(43)));
    }

    #[test]
    fn test_cap_drops_oldest() {
        let store = CorrelationStore::new().with_max_entries(180);
        for i in 1..=200 {
            store.record(i, pose(i as i64));
        }
        assert_eq!(store.len(), 180);
        assert!(!store.contains(20));
        assert!(store.contains(21));
    }

    #[test]
    fn test_concurrent_record_and_take() {
        let store = Arc::new(CorrelationStore::new());
        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..1_000 {
                    store.record(i, pose(i as i64));
                }
            })
        };
        writer.join().unwrap();

        let reader = {
            let store = store.clone();
            thread::spawn(move || (0..1_000).filter(|i| store.take(*i).is_some()).count())
        };
        assert_eq!(reader.join().unwrap(), 1_000);
        assert!(store.is_empty());
    }
}
