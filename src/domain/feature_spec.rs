// ============================================================
// Layer 3 — Feature Specification
// ============================================================
// A model consumes two feature specs:
//   features         — encoder input (first decoder input)
//   persist_features — available at every decode step
//
// Each spec is written on the command line as a comma
// separated list, e.g. "resnet152,coco-feats.npy".
// Entries with a file extension are precomputed features
// read from disk (external); everything else names a
// backbone that runs inside the model (internal).

use serde::{Deserialize, Serialize};
use std::{fmt, path::Path};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub internal: Vec<String>,
    pub external: Vec<String>,
}

impl FeatureSpec {
    pub fn parse(spec: &str) -> Self {
        let mut parsed = FeatureSpec::default();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if is_external(entry) {
                parsed.external.push(entry.to_string());
            } else {
                parsed.internal.push(entry.to_string());
            }
        }
        parsed
    }

    pub fn is_empty(&self) -> bool {
        self.internal.is_empty() && self.external.is_empty()
    }

    /// Short form used in model directory names: backbone names
    /// plus external file stems, joined with '+'.
    pub fn short_name(&self) -> String {
        let stems = self.external.iter().map(|f| {
            Path::new(f)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| f.clone())
        });
        self.internal
            .iter()
            .cloned()
            .chain(stems)
            .collect::<Vec<_>>()
            .join("+")
    }
}

impl fmt::Display for FeatureSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let all: Vec<&str> = self
            .internal
            .iter()
            .chain(self.external.iter())
            .map(String::as_str)
            .collect();
        write!(f, "{}", all.join(","))
    }
}

/// Output shape of one feature source, per image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDim {
    Flat(usize),
    /// Convolutional map, channels x height x width
    Grid { channels: usize, height: usize, width: usize },
}

impl FeatureDim {
    /// Number of values once flattened.
    pub fn flat_len(&self) -> usize {
        match *self {
            FeatureDim::Flat(d) => d,
            FeatureDim::Grid { channels, height, width } => channels * height * width,
        }
    }

    pub fn is_grid(&self) -> bool {
        matches!(self, FeatureDim::Grid { .. })
    }
}

fn is_external(entry: &str) -> bool {
    Path::new(entry)
        .file_name()
        .and_then(|name| Path::new(name).extension())
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_internal_and_external() {
        let spec = FeatureSpec::parse("resnet152,feat.npy");
        assert_eq!(spec.internal, vec!["resnet152"]);
        assert_eq!(spec.external, vec!["feat.npy"]);
    }

    #[test]
    fn test_parse_keeps_order_and_ignores_blanks() {
        let spec = FeatureSpec::parse(" vgg16 , ,a/b/c.npy,resnet152-conv,d.lmdb");
        assert_eq!(spec.internal, vec!["vgg16", "resnet152-conv"]);
        assert_eq!(spec.external, vec!["a/b/c.npy", "d.lmdb"]);
    }

    #[test]
    fn test_empty_spec() {
        assert!(FeatureSpec::parse("").is_empty());
        assert!(!FeatureSpec::parse("alexnet").is_empty());
    }

    #[test]
    fn test_dotted_directory_is_not_an_extension() {
        let spec = FeatureSpec::parse("features.v2/resnet");
        assert_eq!(spec.internal, vec!["features.v2/resnet"]);
    }

    #[test]
    fn test_feature_dim_sizes() {
        let g = FeatureDim::Grid { channels: 2048, height: 7, width: 7 };
        assert_eq!(g.flat_len(), 2048 * 49);
        assert!(g.is_grid());
        assert_eq!(FeatureDim::Flat(4096).flat_len(), 4096);
    }

    #[test]
    fn test_short_name_uses_file_stems() {
        let spec = FeatureSpec::parse("resnet152,/data/coco-c3d.npy");
        assert_eq!(spec.short_name(), "resnet152+coco-c3d");
        assert_eq!(spec.to_string(), "resnet152,/data/coco-c3d.npy");
    }
}
