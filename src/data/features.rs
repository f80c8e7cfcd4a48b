// ============================================================
// Layer 4 — Precomputed (External) Features
// ============================================================
// External features are float32 .npy arrays computed offline:
//
//   [N, D]        flat vector per image
//   [N, C, H, W]  convolutional map per image (attention input)
//
// Row i belongs to the i-th distinct image of the dataset, in
// manifest order. Grid rows are re-laid out on load from
// channel-major [C, H*W] to location-major [H*W, C] so the
// batcher can hand attention a [B, L, C] tensor directly.
//
// Several files listed in one feature spec are concatenated
// per row: flat files feature-wise, grids channel-wise.

use anyhow::{bail, Context, Result};
use npyz::NpyFile;
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::domain::error::CaptionError;
use crate::domain::feature_spec::FeatureDim;

#[derive(Debug, Clone)]
pub struct FeatureTable {
    dim:  FeatureDim,
    rows: usize,
    data: Vec<f32>,
}

impl FeatureTable {
    pub fn new(dim: FeatureDim, rows: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * dim.flat_len() {
            bail!(
                "feature table holds {} values, expected {} rows x {}",
                data.len(),
                rows,
                dim.flat_len()
            );
        }
        Ok(Self { dim, rows, data })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Cannot open feature file '{}'", path.display()))?;
        let npy = NpyFile::new(BufReader::new(file))
            .with_context(|| format!("Cannot parse .npy header of '{}'", path.display()))?;
        let shape: Vec<usize> = npy.shape().iter().map(|&d| d as usize).collect();
        let raw: Vec<f32> = npy
            .into_vec()
            .with_context(|| format!("Cannot read float32 data from '{}'", path.display()))?;

        let table = match shape.as_slice() {
            [n, d] => FeatureTable::new(FeatureDim::Flat(*d), *n, raw)?,
            [n, c, h, w] => {
                let dim = FeatureDim::Grid { channels: *c, height: *h, width: *w };
                FeatureTable::new(dim, *n, channel_major_to_location_major(&raw, *n, *c, h * w))?
            }
            other => {
                return Err(CaptionError::InvalidFeatureShape(format!(
                    "'{}' has shape {:?}; expected [N, D] or [N, C, H, W]",
                    path.display(),
                    other
                ))
                .into())
            }
        };

        tracing::info!(
            "Loaded external features '{}': {} rows, {:?}",
            path.display(),
            table.rows,
            table.dim
        );
        Ok(table)
    }

    pub fn dim(&self) -> FeatureDim {
        self.dim
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn row(&self, i: usize) -> Option<&[f32]> {
        let len = self.dim.flat_len();
        self.data.get(i * len..(i + 1) * len)
    }

    /// View a grid table as flat vectors (used for encoder input).
    pub fn into_flat(self) -> Self {
        Self { dim: FeatureDim::Flat(self.dim.flat_len()), ..self }
    }

    /// Concatenate tables with the same row count, per row.
    pub fn concat(tables: Vec<FeatureTable>) -> Result<Self> {
        let mut iter = tables.into_iter();
        let Some(first) = iter.next() else {
            bail!("no feature tables to concatenate");
        };
        iter.try_fold(first, |acc, next| acc.concat_pair(next))
    }

    fn concat_pair(self, other: FeatureTable) -> Result<Self> {
        if self.rows != other.rows {
            bail!("feature files disagree on image count: {} vs {}", self.rows, other.rows);
        }
        let rows = self.rows;
        match (self.dim, other.dim) {
            (FeatureDim::Flat(a), FeatureDim::Flat(b)) => {
                let mut data = Vec::with_capacity(rows * (a + b));
                for r in 0..rows {
                    data.extend_from_slice(&self.data[r * a..(r + 1) * a]);
                    data.extend_from_slice(&other.data[r * b..(r + 1) * b]);
                }
                FeatureTable::new(FeatureDim::Flat(a + b), rows, data)
            }
            (
                FeatureDim::Grid { channels: ca, height: ha, width: wa },
                FeatureDim::Grid { channels: cb, height: hb, width: wb },
            ) => {
                if (ha, wa) != (hb, wb) {
                    return Err(CaptionError::InvalidFeatureShape(format!(
                        "cannot concatenate grids of {ha}x{wa} and {hb}x{wb}"
                    ))
                    .into());
                }
                let locs = ha * wa;
                let mut data = Vec::with_capacity(rows * locs * (ca + cb));
                for r in 0..rows {
                    for l in 0..locs {
                        let a0 = (r * locs + l) * ca;
                        let b0 = (r * locs + l) * cb;
                        data.extend_from_slice(&self.data[a0..a0 + ca]);
                        data.extend_from_slice(&other.data[b0..b0 + cb]);
                    }
                }
                let dim = FeatureDim::Grid { channels: ca + cb, height: ha, width: wa };
                FeatureTable::new(dim, rows, data)
            }
            (a, b) => Err(CaptionError::InvalidFeatureShape(format!(
                "cannot concatenate {a:?} with {b:?}"
            ))
            .into()),
        }
    }

    /// Stack the rows of several datasets' tables (same dim).
    pub fn append_rows(mut self, other: FeatureTable) -> Result<Self> {
        if self.dim != other.dim {
            return Err(CaptionError::InvalidFeatureShape(format!(
                "datasets provide different feature shapes: {:?} vs {:?}",
                self.dim, other.dim
            ))
            .into());
        }
        self.rows += other.rows;
        self.data.extend(other.data);
        Ok(self)
    }
}

fn channel_major_to_location_major(raw: &[f32], n: usize, c: usize, locs: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; raw.len()];
    for r in 0..n {
        let base = r * c * locs;
        for ch in 0..c {
            for l in 0..locs {
                out[base + l * c + ch] = raw[base + ch * locs + l];
            }
        }
    }
    out
}

/// Find an external feature file, trying the path as given and then
/// relative to the dataset's features directory.
pub fn resolve_feature_path(name: &str, features_dir: Option<&Path>) -> Result<PathBuf> {
    let direct = PathBuf::from(name);
    if direct.exists() {
        return Ok(direct);
    }
    if let Some(dir) = features_dir {
        let joined = dir.join(name);
        if joined.exists() {
            return Ok(joined);
        }
    }
    Err(CaptionError::Dataset(format!("external feature file '{name}' not found")).into())
}

/// Load and concatenate all files of one feature spec.
pub fn load_feature_set(names: &[String], features_dir: Option<&Path>) -> Result<Option<FeatureTable>> {
    if names.is_empty() {
        return Ok(None);
    }
    let tables = names
        .iter()
        .map(|n| resolve_feature_path(n, features_dir).and_then(|p| FeatureTable::load(&p)))
        .collect::<Result<Vec<_>>>()?;
    FeatureTable::concat(tables).map(Some)
}

/// External features shared by every batch of a data loader.
#[derive(Debug, Clone, Default)]
pub struct FeatureStore {
    /// Encoder input, always flat
    pub init:    Option<Arc<FeatureTable>>,
    pub persist: Option<Arc<FeatureTable>>,
}

impl FeatureStore {
    pub fn init_dim(&self) -> Option<FeatureDim> {
        self.init.as_ref().map(|t| t.dim())
    }

    pub fn persist_dim(&self) -> Option<FeatureDim> {
        self.persist.as_ref().map(|t| t.dim())
    }
}
