// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores a captioning model with Burn's
// DefaultRecorder (named MessagePack, full precision).
//
// Layout, one directory per epoch:
//
//   <model_path>/<model_name>/
//     run_config.json      ← TrainConfig of the latest run
//     ep1/
//       encoder.mpk        ← absent for soft attention
//       decoder.mpk
//       optimizer.mpk
//       state.json         ← epoch, ModelParams (with vocab), lr
//     ep2/
//     ...
//
// state.json carries a format_version. Older layouts are
// upgraded by infra::migration while loading; nothing else in
// the load path knows about them.
//
// Reference: Burn Book §5 (Records and Checkpointing)
//            Rust Book §9 (Error Handling)

use anyhow::{Context, Result};
use burn::{
    module::AutodiffModule,
    optim::Optimizer,
    prelude::*,
    record::{DefaultRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::domain::model_params::ModelParams;
use crate::infra::migration;
use crate::ml::model::CaptionModel;

pub const FORMAT_VERSION: u32 = 2;

const STATE_FILE: &str = "state.json";

/// Everything about a checkpoint except the tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Missing in the oldest checkpoints, which are version 1
    #[serde(default = "migration::oldest_version")]
    pub format_version:  u32,
    pub epoch:           usize,
    pub encoder_present: bool,
    pub params:          ModelParams,
    /// Learning rate in effect when the checkpoint was written
    pub learning_rate:   f64,
}

impl CheckpointState {
    pub fn new(epoch: usize, params: ModelParams, learning_rate: f64, encoder_present: bool) -> Self {
        Self { format_version: FORMAT_VERSION, epoch, encoder_present, params, learning_rate }
    }
}

/// All checkpoints of one named model.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn epoch_dir(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("ep{epoch}"))
    }

    /// Highest `ep<N>` directory, if any.
    pub fn latest_epoch(&self) -> Result<Option<usize>> {
        if !self.dir.is_dir() {
            return Ok(None);
        }
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Cannot list '{}'", self.dir.display()))?;

        let mut latest = None;
        for entry in entries {
            let entry = entry?;
            if !entry.path().join(STATE_FILE).is_file() {
                continue;
            }
            let name = entry.file_name();
            let epoch = name.to_str().and_then(|n| n.strip_prefix("ep")).and_then(|n| n.parse::<usize>().ok());
            latest = latest.max(epoch);
        }
        Ok(latest)
    }

    /// Write encoder, decoder, optimizer state and state.json for
    /// `state.epoch`; returns the epoch directory.
    pub fn save<B, O>(&self, model: &CaptionModel<B>, optim: &O, state: &CheckpointState) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        O: Optimizer<CaptionModel<B>, B>,
        CaptionModel<B>: AutodiffModule<B>,
    {
        let dir = self.epoch_dir(state.epoch);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint directory '{}'", dir.display()))?;

        let recorder = DefaultRecorder::new();
        if let Some(encoder) = &model.encoder {
            recorder
                .record(encoder.clone().into_record(), dir.join("encoder"))
                .with_context(|| format!("Failed to save encoder to '{}'", dir.display()))?;
        }
        recorder
            .record(model.decoder.clone().into_record(), dir.join("decoder"))
            .with_context(|| format!("Failed to save decoder to '{}'", dir.display()))?;
        recorder
            .record(optim.to_record(), dir.join("optimizer"))
            .with_context(|| format!("Failed to save optimizer state to '{}'", dir.display()))?;

        let json = serde_json::to_string_pretty(state)?;
        fs::write(dir.join(STATE_FILE), json)
            .with_context(|| format!("Cannot write '{}'", dir.join(STATE_FILE).display()))?;

        tracing::debug!("Saved checkpoint: epoch {}", state.epoch);
        Ok(dir)
    }

    /// Written once per run so the exact settings can be recovered.
    pub fn save_run_config<T: Serialize>(&self, cfg: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Cannot create model directory '{}'", self.dir.display()))?;
        let path = self.dir.join("run_config.json");
        fs::write(&path, serde_json::to_string_pretty(cfg)?)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;
        tracing::debug!("Saved run config to '{}'", path.display());
        Ok(())
    }
}

/// Read `state.json` from an epoch directory.
pub fn read_state(dir: &Path) -> Result<CheckpointState> {
    let path = dir.join(STATE_FILE);
    let json = fs::read_to_string(&path).with_context(|| {
        format!("Cannot read checkpoint state '{}'. Is this an epoch directory?", path.display())
    })?;
    serde_json::from_str(&json).with_context(|| format!("Malformed checkpoint state '{}'", path.display()))
}

/// Load the saved weights into `model`, which must have been built
/// from `state.params`.
pub fn load_model<B: Backend>(
    dir:    &Path,
    state:  &CheckpointState,
    model:  CaptionModel<B>,
    device: &B::Device,
) -> Result<CaptionModel<B>> {
    let recorder = DefaultRecorder::new();
    let CaptionModel { encoder, decoder } = model;

    let encoder = match (encoder, state.encoder_present) {
        (Some(fresh), true) if state.format_version < FORMAT_VERSION => {
            Some(migration::load_encoder(state.format_version, fresh, &dir.join("encoder"), device)?)
        }
        (Some(fresh), true) => {
            let record = recorder
                .load(dir.join("encoder"), device)
                .with_context(|| format!("Cannot load encoder from '{}'", dir.display()))?;
            Some(fresh.load_record(record))
        }
        (Some(fresh), false) => {
            tracing::warn!("Checkpoint '{}' has no encoder weights; keeping a fresh encoder", dir.display());
            Some(fresh)
        }
        (None, _) => None,
    };

    let record = recorder
        .load(dir.join("decoder"), device)
        .with_context(|| format!("Cannot load decoder from '{}'", dir.display()))?;
    let decoder = decoder.load_record(record);

    tracing::info!("Loaded model weights from '{}' (epoch {})", dir.display(), state.epoch);
    Ok(CaptionModel { encoder, decoder })
}

/// Restore optimizer state; a missing file leaves `optim` fresh.
pub fn load_optimizer<B, O>(dir: &Path, optim: O, device: &B::Device) -> Result<O>
where
    B: AutodiffBackend,
    O: Optimizer<CaptionModel<B>, B>,
    CaptionModel<B>: AutodiffModule<B>,
{
    if !dir.join("optimizer.mpk").is_file() {
        tracing::warn!("No optimizer state in '{}'; starting it fresh", dir.display());
        return Ok(optim);
    }
    let record = DefaultRecorder::new()
        .load(dir.join("optimizer"), device)
        .with_context(|| format!("Cannot load optimizer state from '{}'", dir.display()))?;
    Ok(optim.load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::feature_spec::{FeatureDim, FeatureSpec};
    use crate::domain::vocabulary::Vocabulary;
    use crate::ml::model::ExternalShapes;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;
    use burn::tensor::Tolerance;

    type TestBackend = NdArray<f32>;
    type AdBackend = Autodiff<TestBackend>;

    fn params() -> ModelParams {
        ModelParams {
            embed_size: 4,
            hidden_size: 6,
            features: FeatureSpec::parse("init.npy"),
            vocab: Some(Vocabulary::from_words(["a", "b", "c"])),
            ..Default::default()
        }
    }

    const SHAPES: ExternalShapes = ExternalShapes { init: Some(FeatureDim::Flat(3)), persist: None };

    #[test]
    fn test_roundtrip_restores_params_and_weights() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("model"));
        let device = Default::default();

        let model = CaptionModel::<AdBackend>::new(&params(), SHAPES, false, None, &device).unwrap();
        let optim = AdamConfig::new().init::<AdBackend, CaptionModel<AdBackend>>();
        let state = CheckpointState::new(3, params(), 0.01, true);
        let epoch_dir = manager.save(&model, &optim, &state).unwrap();
        assert_eq!(manager.latest_epoch().unwrap(), Some(3));

        let loaded_state = read_state(&epoch_dir).unwrap();
        assert_eq!(loaded_state, state);

        let fresh = CaptionModel::<TestBackend>::new(&loaded_state.params, SHAPES, false, None, &device).unwrap();
        let restored = load_model(&epoch_dir, &loaded_state, fresh, &device).unwrap();

        let before = model.valid();
        before
            .decoder
            .embed
            .weight
            .val()
            .into_data()
            .assert_approx_eq::<f32>(&restored.decoder.embed.weight.val().into_data(), Tolerance::absolute(0.0));
        let (a, b) = (before.encoder.unwrap(), restored.encoder.unwrap());
        a.linear
            .weight
            .val()
            .into_data()
            .assert_approx_eq::<f32>(&b.linear.weight.val().into_data(), Tolerance::absolute(0.0));

        assert!(load_optimizer::<AdBackend, _>(&epoch_dir, optim, &device).is_ok());
    }

    #[test]
    fn test_latest_epoch_ignores_stray_entries() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        for name in ["ep2", "ep10", "epX", "notes"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
            fs::write(dir.path().join(name).join(STATE_FILE), "{}").unwrap();
        }
        // directory without state.json is not a checkpoint
        fs::create_dir_all(dir.path().join("ep99")).unwrap();
        assert_eq!(manager.latest_epoch().unwrap(), Some(10));

        let empty = CheckpointManager::new(dir.path().join("missing"));
        assert_eq!(empty.latest_epoch().unwrap(), None);
    }

    #[test]
    fn test_state_without_version_is_legacy() {
        let json = serde_json::json!({
            "epoch": 1,
            "encoder_present": true,
            "params": params(),
            "learning_rate": 0.001,
        });
        let state: CheckpointState = serde_json::from_value(json).unwrap();
        assert_eq!(state.format_version, 1);
    }
}
