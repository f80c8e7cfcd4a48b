// ============================================================
// Layer 6 — Training Statistics Store
// ============================================================
// Per-epoch numbers of a training run, kept as one JSON object:
//
//   {
//     "1": { "training_loss": 3.12, "validation_loss": 2.95 },
//     "2": { "training_loss": 2.71, "validation_cider": 0.41 }
//   }
//
// The file is loaded when a model is loaded, extended in memory
// and rewritten (pretty-printed) after every epoch. Entries are
// only ever added or overwritten, never removed.
//
// Reference: Rust Book §12 (I/O and File Handling)

use anyhow::{Context, Result};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

type EpochStats = BTreeMap<String, f64>;

#[derive(Debug, Clone, Default)]
pub struct StatsStore {
    path:  PathBuf,
    stats: BTreeMap<usize, EpochStats>,
}

impl StatsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), stats: BTreeMap::new() }
    }

    /// Load the existing file, or start empty when there is none.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::new(path));
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read stats file '{}'", path.display()))?;
        let stats = serde_json::from_str(&json)
            .with_context(|| format!("Malformed stats file '{}'", path.display()))?;
        tracing::info!("Loaded training stats from '{}'", path.display());
        Ok(Self { path, stats })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, epoch: usize, key: &str, value: f64) {
        self.stats.entry(epoch).or_default().insert(key.to_string(), value);
    }

    #[cfg(test)]
    pub fn get(&self, epoch: usize, key: &str) -> Option<f64> {
        self.stats.get(&epoch)?.get(key).copied()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create '{}'", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.stats)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Cannot write stats to '{}'", self.path.display()))?;
        tracing::debug!("Wrote stats to '{}'", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_then_extend_never_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train_stats.json");

        let mut stats = StatsStore::new(&path);
        stats.record(1, "training_loss", 3.5);
        stats.record(1, "validation_loss", 3.25);
        stats.save().unwrap();

        let mut again = StatsStore::load(&path).unwrap();
        again.record(2, "training_loss", 2.5);
        again.save().unwrap();

        let reloaded = StatsStore::load(&path).unwrap();
        assert_eq!(reloaded.get(1, "validation_loss"), Some(3.25));
        assert_eq!(reloaded.get(2, "training_loss"), Some(2.5));
        assert_eq!(reloaded.get(2, "validation_loss"), None);
    }

    #[test]
    fn test_keys_are_epoch_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let mut stats = StatsStore::new(&path);
        stats.record(10, "validation_cider", 0.5);
        stats.save().unwrap();

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["10"]["validation_cider"], 0.5);
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let stats = StatsStore::load(dir.path().join("none.json")).unwrap();
        assert_eq!(stats.get(1, "training_loss"), None);
    }
}
