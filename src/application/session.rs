// ============================================================
// Layer 2 — Session Preparation
// ============================================================
// Shared by training and validation. Resolves, in order:
//
//   Step 1: model name and checkpoint directory (--resume picks
//           the newest ep<N> of that name)
//   Step 2: parameters from the checkpoint, external feature
//           paths remapped to the requested ones
//   Step 3: start epoch and learning rate
//   Step 4: vocabulary (the checkpoint's copy wins)
//
// and then builds datasets, loaders and the model on whatever
// backend the use case picked.

use anyhow::Result;
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    prelude::*,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::application::config::{RunConfig, TrainConfig, DEFAULT_LEARNING_RATE};
use crate::data::batcher::{CaptionBatch, CaptionBatcher};
use crate::data::dataset::{build_dataset, CaptionDataset};
use crate::data::features::FeatureStore;
use crate::data::images::ImageLoader;
use crate::data::loader::ManifestSource;
use crate::domain::caption::CaptionRecord;
use crate::domain::error::CaptionError;
use crate::domain::model_params::{AttentionKind, ModelParams};
use crate::domain::traits::{CaptionSource, DatasetProvider};
use crate::domain::vocabulary::Vocabulary;
use crate::infra::checkpoint::{self, CheckpointManager, CheckpointState};
use crate::infra::vocab_store::VocabStore;
use crate::ml::model::{CaptionModel, ExternalShapes};

/// An epoch directory and its state.json.
pub struct LoadedModel {
    pub dir:   PathBuf,
    pub state: CheckpointState,
}

pub struct Session {
    /// Final parameters, vocabulary included
    pub params:        ModelParams,
    pub vocab:         Vocabulary,
    pub checkpoints:   CheckpointManager,
    pub loaded:        Option<LoadedModel>,
    /// Epochs already done
    pub start_epoch:   usize,
    pub learning_rate: f64,
}

impl Session {
    pub fn prepare(cfg: &TrainConfig, load: Option<&Path>, datasets: &dyn DatasetProvider) -> Result<Self> {
        let mut params = cfg.model_params()?;

        // ── Step 1: Model name, resume ───────────────────────────────────────
        let model_name = cfg.model_name(&params, load);
        let checkpoints = CheckpointManager::new(cfg.model_path.join(&model_name));
        let mut load = load.map(Path::to_path_buf);
        if cfg.resume && load.is_none() {
            tracing::info!("Looking for the latest epoch of '{}'", checkpoints.dir().display());
            match checkpoints.latest_epoch()? {
                Some(epoch) => {
                    let dir = checkpoints.epoch_dir(epoch);
                    tracing::info!("Found matching model: '{}'", dir.display());
                    load = Some(dir);
                }
                None => tracing::warn!(
                    "Failed to resume: no checkpoints under '{}', starting from scratch",
                    checkpoints.dir().display()
                ),
            }
        }

        // ── Step 2: Checkpoint parameters ────────────────────────────────────
        let loaded = match load {
            Some(dir) => {
                let state = checkpoint::read_state(&dir)?;
                params = merge_loaded_params(&params, &state.params);
                tracing::info!("Loading model '{}' at epoch {}", dir.display(), state.epoch);
                Some(LoadedModel { dir, state })
            }
            None => None,
        };

        // ── Step 3: Start epoch, learning rate ───────────────────────────────
        let mut start_epoch = loaded.as_ref().map_or(0, |l| l.state.epoch);
        if cfg.force_epoch > 0 {
            start_epoch = cfg.force_epoch - 1;
            tracing::info!("Forcing start epoch to {}", cfg.force_epoch);
        }
        let learning_rate = cfg
            .learning_rate
            .or(loaded.as_ref().map(|l| l.state.learning_rate))
            .unwrap_or(DEFAULT_LEARNING_RATE);
        params.learning_rate = learning_rate;

        params.check_encoder_features()?;
        if params.attention == AttentionKind::Soft && !cfg.scorer_names().is_empty() {
            return Err(CaptionError::config(
                "the loaded model uses soft attention, which cannot sample captions for --validation-scoring",
            )
            .into());
        }

        // ── Step 4: Vocabulary ───────────────────────────────────────────────
        let vocab = match params.vocab.take() {
            Some(vocab) if loaded.is_some() => {
                tracing::info!("Using the vocabulary stored in the model");
                vocab
            }
            _ => {
                let directive = cfg.vocab.as_deref().ok_or_else(|| {
                    CaptionError::config("the model carries no vocabulary, use --vocab AUTO or a vocabulary file")
                })?;
                let name = cfg
                    .dataset
                    .as_deref()
                    .or(cfg.validate.as_deref())
                    .ok_or_else(|| CaptionError::config("a vocabulary can only be built from a --dataset"))?;
                VocabStore::new(&cfg.vocab_root, cfg.vocab_threshold)
                    .resolve(directive, name, || caption_records(datasets, name))?
            }
        };
        tracing::info!("Size of the vocabulary is {}", vocab.len());
        params.vocab = Some(vocab.clone());
        tracing::info!("{params}");

        Ok(Self { params, vocab, checkpoints, loaded, start_epoch, learning_rate })
    }

    /// Captions and external features of a (possibly '+'-joined) dataset.
    pub fn load_dataset(&self, datasets: &dyn DatasetProvider, name: &str) -> Result<(CaptionDataset, FeatureStore)> {
        tracing::info!("Loading dataset '{name}'");
        build_dataset(&datasets.get_params(name)?, &self.vocab, &self.params)
    }

    pub fn loader<B: Backend>(
        &self,
        cfg:     &TrainConfig,
        run:     &RunConfig,
        dataset: CaptionDataset,
        store:   FeatureStore,
        shuffle: bool,
        device:  &B::Device,
    ) -> Arc<dyn DataLoader<B, CaptionBatch<B>>> {
        // images are only decoded when a backbone needs them
        let images = self.params.has_internal_features().then(|| ImageLoader::new(cfg.crop_size));
        let builder = DataLoaderBuilder::new(CaptionBatcher::<B>::new(store, images, self.vocab.pad_id()))
            .batch_size(cfg.batch_size)
            .num_workers(run.loader_workers(cfg.num_workers))
            .set_device(device.clone());
        if shuffle {
            builder.shuffle(run.seed).build(dataset)
        } else {
            builder.build(dataset)
        }
    }

    /// Fresh model for `params`, with checkpoint weights when loaded.
    pub fn build_model<B: Backend>(
        &self,
        cfg:    &TrainConfig,
        shapes: ExternalShapes,
        device: &B::Device,
    ) -> Result<CaptionModel<B>> {
        let model = CaptionModel::new(&self.params, shapes, cfg.finetune, cfg.weights_dir.as_deref(), device)?;
        match &self.loaded {
            Some(l) => checkpoint::load_model(&l.dir, &l.state, model, device),
            None => Ok(model),
        }
    }

    /// `train_stats.json`, or `train_stats-<postfix>.json`.
    pub fn stats_path(&self, postfix: Option<&str>) -> PathBuf {
        let name = match postfix {
            Some(p) => format!("train_stats-{p}.json"),
            None => "train_stats.json".to_string(),
        };
        self.checkpoints.dir().join(name)
    }
}

/// Decoder input shapes implied by the external feature tables.
pub fn external_shapes(store: &FeatureStore) -> ExternalShapes {
    ExternalShapes { init: store.init_dim(), persist: store.persist_dim() }
}

/// Training and validation must feed the same external shapes.
pub fn check_same_shapes(train: ExternalShapes, valid: ExternalShapes) -> Result<(), CaptionError> {
    if train.init != valid.init || train.persist != valid.persist {
        return Err(CaptionError::Dataset(format!(
            "validation features {valid:?} do not match the training features {train:?}"
        )));
    }
    Ok(())
}

/// Parameters of a loaded checkpoint. Requested external feature
/// files replace the saved ones when they differ.
fn merge_loaded_params(requested: &ModelParams, saved: &ModelParams) -> ModelParams {
    let mut params = saved.clone();
    let features = &requested.features.external;
    if !features.is_empty() && &params.features.external != features {
        tracing::warn!(
            "External features changed: {:?} -> {:?}, updating feature paths",
            params.features.external,
            features
        );
        params.update_ext_features(features.clone());
    }
    let persist = &requested.persist_features.external;
    if !persist.is_empty() && &params.persist_features.external != persist {
        tracing::warn!(
            "External persist features changed: {:?} -> {:?}, updating feature paths",
            params.persist_features.external,
            persist
        );
        params.update_ext_persist_features(persist.clone());
    }
    params
}

fn caption_records(datasets: &dyn DatasetProvider, name: &str) -> Result<Vec<CaptionRecord>> {
    let mut records = Vec::new();
    for p in datasets.get_params(name)? {
        records.extend(ManifestSource::new(&p.caption_file).load_records()?);
    }
    Ok(records)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::features::tests::write_npy;
    use crate::data::loader::DatasetRegistry;
    use crate::domain::caption::DatasetParams;
    use crate::domain::feature_spec::{FeatureDim, FeatureSpec};
    use std::fs;

    /// Six captions of three images with 2-d flat features, all
    /// under `dir`.
    pub(crate) fn write_dataset(dir: &Path, name: &str) -> DatasetParams {
        let records: Vec<_> = [
            ("a", "A dog runs."),
            ("a", "a dog is running"),
            ("b", "a cat sits"),
            ("b", "the cat sits down"),
            ("c", "a dog and a cat"),
            ("c", "the dog sits"),
        ]
        .iter()
        .map(|(id, c)| serde_json::json!({"image_id": id, "file": format!("{id}.jpg"), "caption": c}))
        .collect();
        let caption_file = dir.join(format!("{name}.json"));
        fs::write(&caption_file, serde_json::to_string(&records).unwrap()).unwrap();
        write_npy(&dir.join("feats.npy"), &[3, 2], &[0.1, 0.9, 0.5, 0.5, 0.9, 0.1]);
        DatasetParams {
            name: name.to_string(),
            image_dir: dir.to_path_buf(),
            caption_file,
            features_dir: Some(dir.to_path_buf()),
        }
    }

    pub(crate) fn config(dir: &Path) -> TrainConfig {
        TrainConfig {
            dataset:         Some("toy".into()),
            vocab:           Some("AUTO".into()),
            vocab_root:      dir.join("vocab"),
            vocab_threshold: 1,
            features:        "feats.npy".into(),
            embed_size:      4,
            hidden_size:     6,
            batch_size:      2,
            model_path:      dir.join("models"),
            model_name:      Some("toy-model".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_session_builds_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DatasetRegistry::from_params(vec![write_dataset(dir.path(), "toy")]);
        let session = Session::prepare(&config(dir.path()), None, &registry).unwrap();

        assert!(session.vocab.contains("dog"));
        assert!(session.loaded.is_none());
        assert_eq!(session.start_epoch, 0);
        assert_eq!(session.learning_rate, DEFAULT_LEARNING_RATE);
        assert_eq!(session.checkpoints.dir(), dir.path().join("models/toy-model"));
        assert!(dir.path().join("vocab/toy.json").exists());
    }

    #[test]
    fn test_resume_without_checkpoints_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DatasetRegistry::from_params(vec![write_dataset(dir.path(), "toy")]);
        let cfg = TrainConfig { resume: true, ..config(dir.path()) };
        let session = Session::prepare(&cfg, None, &registry).unwrap();
        assert!(session.loaded.is_none());
    }

    #[test]
    fn test_loaded_state_sets_epoch_lr_and_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DatasetRegistry::from_params(vec![write_dataset(dir.path(), "toy")]);
        let epoch_dir = dir.path().join("models/saved/ep3");
        fs::create_dir_all(&epoch_dir).unwrap();

        let saved = ModelParams {
            features: FeatureSpec::parse("old.npy"),
            vocab: Some(Vocabulary::from_words(["zebra"])),
            ..Default::default()
        };
        let state = CheckpointState::new(3, saved, 0.0005, true);
        fs::write(epoch_dir.join("state.json"), serde_json::to_string(&state).unwrap()).unwrap();

        let cfg = TrainConfig { vocab: None, model_name: None, ..config(dir.path()) };
        let session = Session::prepare(&cfg, Some(&epoch_dir), &registry).unwrap();
        assert_eq!(session.start_epoch, 3);
        assert_eq!(session.learning_rate, 0.0005);
        assert!(session.vocab.contains("zebra"));
        assert_eq!(session.params.features.external, vec!["feats.npy".to_string()]);
        assert_eq!(session.checkpoints.dir(), dir.path().join("models/saved"));

        let forced = TrainConfig { force_epoch: 2, learning_rate: Some(0.01), ..cfg };
        let session = Session::prepare(&forced, Some(&epoch_dir), &registry).unwrap();
        assert_eq!(session.start_epoch, 1);
        assert_eq!(session.learning_rate, 0.01);
        assert_eq!(session.params.learning_rate, 0.01);
    }

    #[test]
    fn test_empty_features_use_the_checkpoint_ones() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DatasetRegistry::from_params(vec![write_dataset(dir.path(), "toy")]);
        let no_features = TrainConfig { features: String::new(), ..config(dir.path()) };
        let err = Session::prepare(&no_features, None, &registry).err().unwrap();
        assert!(matches!(err.downcast_ref::<CaptionError>(), Some(CaptionError::Configuration(_))));
        assert!(!dir.path().join("vocab").exists());

        let epoch_dir = dir.path().join("models/saved/ep1");
        fs::create_dir_all(&epoch_dir).unwrap();
        let saved = ModelParams {
            features: FeatureSpec::parse("feats.npy"),
            vocab: Some(Vocabulary::from_words(["dog"])),
            ..Default::default()
        };
        let state = CheckpointState::new(1, saved, 0.001, true);
        fs::write(epoch_dir.join("state.json"), serde_json::to_string(&state).unwrap()).unwrap();

        let session = Session::prepare(&no_features, Some(&epoch_dir), &registry).unwrap();
        assert_eq!(session.params.features.external, vec!["feats.npy".to_string()]);
    }

    #[test]
    fn test_shape_mismatch_between_splits() {
        let a = ExternalShapes { init: Some(FeatureDim::Flat(2)), persist: None };
        let b = ExternalShapes { init: Some(FeatureDim::Flat(3)), persist: None };
        assert!(check_same_shapes(a, a).is_ok());
        assert!(check_same_shapes(a, b).is_err());
    }
}
