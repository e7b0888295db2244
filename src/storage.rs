//! On-disk local state: per-device trails and the visible device set.
//!
//! Layout under the data dir:
//!   trails/<device id, percent-encoded>.json   [[lat, lng], ...]
//!   visible.json                               ["deviceId", ...]

use crate::error::Result;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub type TrailPoint = [f64; 2];

#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("petfence")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn trails_dir(&self) -> PathBuf {
        self.root.join("trails")
    }

    fn trail_path(&self, device_id: &str) -> PathBuf {
        self.trails_dir()
            .join(format!("{}.json", urlencoding::encode(device_id)))
    }

    pub fn load_trail(&self, device_id: &str) -> Vec<TrailPoint> {
        read_json(&self.trail_path(device_id)).unwrap_or_default()
    }

    pub fn save_trail(&self, device_id: &str, points: &[TrailPoint]) -> Result<()> {
        write_json(&self.trail_path(device_id), points)
    }

    pub fn remove_trail(&self, device_id: &str) -> Result<()> {
        match fs::remove_file(self.trail_path(device_id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Device ids that have a persisted trail.
    pub fn trail_ids(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.trails_dir()) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let stem = name.strip_suffix(".json")?;
                urlencoding::decode(stem).ok().map(|s| s.into_owned())
            })
            .collect();
        ids.sort();
        ids
    }

    /// `None` when nothing was ever saved, meaning all trackers are shown.
    pub fn load_visible(&self) -> Option<BTreeSet<String>> {
        read_json(&self.root.join("visible.json"))
    }

    pub fn save_visible(&self, ids: &BTreeSet<String>) -> Result<()> {
        write_json(&self.root.join("visible.json"), ids)
    }

    pub fn clear_visible(&self) -> Result<()> {
        match fs::remove_file(self.root.join("visible.json")) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring corrupt {}: {}", path.display(), e);
            None
        }
    }
}

/// Write through a temp file so a crash never leaves half a file behind.
fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trail_round_trip_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        assert!(store.load_trail("d/1").is_empty());
        store.save_trail("d/1", &[[1.0, 2.0], [3.0, 4.0]]).unwrap();
        assert_eq!(store.load_trail("d/1"), vec![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(store.trail_ids(), vec!["d/1".to_string()]);

        store.remove_trail("d/1").unwrap();
        store.remove_trail("d/1").unwrap();
        assert!(store.load_trail("d/1").is_empty());
        assert!(store.trail_ids().is_empty());
    }

    #[test]
    fn corrupt_trail_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        fs::create_dir_all(dir.path().join("trails")).unwrap();
        fs::write(dir.path().join("trails/d1.json"), "{not json").unwrap();
        assert!(store.load_trail("d1").is_empty());
    }

    #[test]
    fn visible_set_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert_eq!(store.load_visible(), None);

        let ids: BTreeSet<String> = ["d2", "d1"].iter().map(|s| s.to_string()).collect();
        store.save_visible(&ids).unwrap();
        assert_eq!(store.load_visible(), Some(ids));

        store.clear_visible().unwrap();
        assert_eq!(store.load_visible(), None);
    }
}
