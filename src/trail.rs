//! Per-device position trails, persisted on every change.

use crate::error::Result;
use crate::geometry::LatLng;
use crate::storage::{LocalStore, TrailPoint};
use std::collections::{BTreeSet, HashMap};

pub struct PathAccumulator {
    store: LocalStore,
    trails: HashMap<String, Vec<TrailPoint>>,
}

impl PathAccumulator {
    pub fn new(store: LocalStore) -> Self {
        Self {
            store,
            trails: HashMap::new(),
        }
    }

    fn trail_mut(&mut self, device_id: &str) -> &mut Vec<TrailPoint> {
        let store = &self.store;
        self.trails
            .entry(device_id.to_string())
            .or_insert_with(|| store.load_trail(device_id))
    }

    /// Append `position` unless it equals the last recorded point.
    /// Returns whether the trail grew.
    pub fn record(&mut self, device_id: &str, position: LatLng) -> Result<bool> {
        if !position.is_valid() {
            log::warn!("Not recording invalid position for {}", device_id);
            return Ok(false);
        }

        let point = [position.lat, position.lng];
        let trail = self.trail_mut(device_id);
        if trail.last() == Some(&point) {
            return Ok(false);
        }
        trail.push(point);

        let snapshot = trail.clone();
        if let Err(e) = self.store.save_trail(device_id, &snapshot) {
            // Keep memory in step with disk so the next fix retries the write
            self.trail_mut(device_id).pop();
            return Err(e);
        }
        Ok(true)
    }

    pub fn points(&mut self, device_id: &str) -> &[TrailPoint] {
        self.trail_mut(device_id)
    }

    pub fn clear(&mut self, device_id: &str) -> Result<()> {
        self.trails.insert(device_id.to_string(), Vec::new());
        self.store.remove_trail(device_id)?;
        log::info!("Cleared trail for {}", device_id);
        Ok(())
    }

    /// Clear every trail in memory or on disk.
    pub fn clear_all(&mut self) -> Result<()> {
        let ids: BTreeSet<String> = self
            .trails
            .keys()
            .cloned()
            .chain(self.store.trail_ids())
            .collect();
        for id in ids {
            self.clear(&id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_point_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut acc = PathAccumulator::new(LocalStore::new(dir.path()));
        let p = LatLng::new(10.0, 124.0);

        assert!(acc.record("d1", p).unwrap());
        assert!(!acc.record("d1", p).unwrap());
        assert!(acc.record("d1", LatLng::new(10.0, 124.0001)).unwrap());
        assert!(acc.record("d1", p).unwrap());
        assert_eq!(acc.points("d1").len(), 3);
    }

    #[test]
    fn trail_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut acc = PathAccumulator::new(LocalStore::new(dir.path()));
            acc.record("d1", LatLng::new(1.0, 2.0)).unwrap();
            acc.record("d1", LatLng::new(3.0, 4.0)).unwrap();
        }

        let mut acc = PathAccumulator::new(LocalStore::new(dir.path()));
        // Last persisted point still suppresses a duplicate
        assert!(!acc.record("d1", LatLng::new(3.0, 4.0)).unwrap());
        assert_eq!(acc.points("d1"), &[[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn failed_write_is_not_kept() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the data dir should be makes every write fail
        let root = dir.path().join("not-a-dir");
        std::fs::write(&root, b"").unwrap();
        let mut acc = PathAccumulator::new(LocalStore::new(&root));
        let p = LatLng::new(10.0, 124.0);

        assert!(acc.record("d1", p).is_err());
        assert!(acc.points("d1").is_empty());
        assert!(acc.record("d1", p).is_err());
        assert!(acc.points("d1").is_empty());
    }

    #[test]
    fn invalid_positions_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut acc = PathAccumulator::new(LocalStore::new(dir.path()));
        assert!(!acc.record("d1", LatLng::new(f64::NAN, 0.0)).unwrap());
        assert!(acc.points("d1").is_empty());
    }

    #[test]
    fn clear_and_clear_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.save_trail("offline-dev", &[[5.0, 5.0]]).unwrap();

        let mut acc = PathAccumulator::new(store.clone());
        acc.record("d1", LatLng::new(1.0, 1.0)).unwrap();
        acc.record("d2", LatLng::new(2.0, 2.0)).unwrap();

        acc.clear("d1").unwrap();
        assert!(acc.points("d1").is_empty());
        assert!(store.load_trail("d1").is_empty());
        assert_eq!(acc.points("d2").len(), 1);

        acc.clear_all().unwrap();
        assert!(store.trail_ids().is_empty());
        assert!(acc.points("d2").is_empty());
        assert!(acc.points("offline-dev").is_empty());
    }
}
