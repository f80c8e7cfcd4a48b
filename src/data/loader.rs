// ============================================================
// Layer 4 — Dataset Registry and Caption Manifests
// ============================================================
// Two collaborators of the training core live here:
//
//   DatasetRegistry — a JSON file mapping dataset names to
//                     their locations, e.g.
//
//       {
//         "coco:train2014": {
//           "image_dir":    "/data/coco/train2014",
//           "caption_file": "/data/coco/captions_train2014.json",
//           "features_dir": "/data/coco/features"
//         }
//       }
//
//   ManifestSource  — reads one caption manifest, a JSON array
//                     of {image_id, file, caption} objects.
//
// Relative paths inside the registry are resolved against the
// registry file's own directory.
//
// Reference: serde_json crate documentation
//            Rust Book §9 (Error Handling)

use anyhow::{Context, Result};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use crate::domain::caption::{CaptionRecord, DatasetParams};
use crate::domain::error::CaptionError;
use crate::domain::traits::{CaptionSource, DatasetProvider};

pub struct DatasetRegistry {
    datasets: BTreeMap<String, DatasetParams>,
}

impl DatasetRegistry {
    /// Load the registry. A missing file yields an empty registry so
    /// that `validate` runs without a training set still report a
    /// helpful error later.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("Dataset config file '{}' does not exist", path.display());
            return Ok(Self { datasets: BTreeMap::new() });
        }

        let json = fs::read_to_string(path)
            .with_context(|| format!("Cannot read dataset config '{}'", path.display()))?;
        let raw: BTreeMap<String, DatasetParams> = serde_json::from_str(&json)
            .with_context(|| format!("Malformed dataset config '{}'", path.display()))?;

        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let datasets = raw
            .into_iter()
            .map(|(name, mut p)| {
                p.name         = name.clone();
                p.image_dir    = resolve(&base, &p.image_dir);
                p.caption_file = resolve(&base, &p.caption_file);
                p.features_dir = p.features_dir.map(|d| resolve(&base, &d));
                (name, p)
            })
            .collect();

        Ok(Self { datasets })
    }

    #[cfg(test)]
    pub fn from_params(params: Vec<DatasetParams>) -> Self {
        Self {
            datasets: params.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }
}

impl DatasetProvider for DatasetRegistry {
    fn get_params(&self, name: &str) -> Result<Vec<DatasetParams>> {
        name.split('+')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|n| {
                self.datasets.get(n).cloned().ok_or_else(|| {
                    CaptionError::Dataset(format!(
                        "dataset '{n}' is not configured (known: {})",
                        self.names().join(", ")
                    ))
                    .into()
                })
            })
            .collect()
    }

    fn names(&self) -> Vec<String> {
        self.datasets.keys().cloned().collect()
    }
}

fn resolve(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() { p.to_path_buf() } else { base.join(p) }
}

// ─── ManifestSource ───────────────────────────────────────────────────────────
pub struct ManifestSource {
    path: PathBuf,
}

impl ManifestSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CaptionSource for ManifestSource {
    fn load_records(&self) -> Result<Vec<CaptionRecord>> {
        let json = fs::read_to_string(&self.path)
            .with_context(|| format!("Cannot read caption file '{}'", self.path.display()))?;
        let records: Vec<CaptionRecord> = serde_json::from_str(&json)
            .with_context(|| format!("Malformed caption file '{}'", self.path.display()))?;

        if records.is_empty() {
            tracing::warn!("Caption file '{}' contains no captions", self.path.display());
        }
        tracing::debug!("Loaded {} captions from '{}'", records.len(), self.path.display());
        Ok(records)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn write_registry(dir: &Path) -> PathBuf {
        let path = dir.join("datasets.json");
        fs::write(
            &path,
            r#"{
                "toy:train": {"image_dir": "images", "caption_file": "train.json"},
                "toy:val":   {"image_dir": "/abs/images", "caption_file": "val.json",
                              "features_dir": "feats"}
            }"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_registry_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let reg = DatasetRegistry::load(write_registry(dir.path())).unwrap();

        let p = reg.get_params("toy:train").unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].name, "toy:train");
        assert_eq!(p[0].image_dir, dir.path().join("images"));

        let v = reg.get_params("toy:val").unwrap();
        assert_eq!(v[0].image_dir, PathBuf::from("/abs/images"));
        assert_eq!(v[0].features_dir, Some(dir.path().join("feats")));
    }

    #[test]
    fn test_registry_plus_joined_names() {
        let dir = tempfile::tempdir().unwrap();
        let reg = DatasetRegistry::load(write_registry(dir.path())).unwrap();
        let both = reg.get_params("toy:train+toy:val").unwrap();
        assert_eq!(both.len(), 2);
        assert!(reg.get_params("toy:test").is_err());
        assert_eq!(reg.names(), vec!["toy:train", "toy:val"]);
    }

    #[test]
    fn test_manifest_source_reads_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caps.json");
        fs::write(
            &path,
            r#"[{"image_id": "1", "file": "a.jpg", "caption": "A dog."},
                {"image_id": "1", "file": "a.jpg", "caption": "A brown dog."}]"#,
        )
        .unwrap();
        let records = ManifestSource::new(&path).load_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].caption, "A brown dog.");
    }
}
