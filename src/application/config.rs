// ============================================================
// Layer 2 — Run Configuration
// ============================================================
// TrainConfig is the one object the CLI hands to the use cases.
// It is serialisable so every run leaves a run_config.json next
// to its checkpoints.
//
// Enum-like settings (attention, optimizer, forcing policy,
// scorers) stay strings here and are parsed by validate(), so
// every configuration mistake surfaces before any file is
// written.
//
// Reference: Rust Book §5 (Structs), §9 (Error Handling)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::domain::error::CaptionError;
use crate::domain::feature_spec::FeatureSpec;
use crate::domain::forcing::{ForcingPolicy, ForcingSchedule};
use crate::domain::model_params::{AttentionKind, ModelParams};
use crate::infra::scoring::build_scorers;
use crate::infra::vocab_store::DEFAULT_THRESHOLD;
use crate::ml::trainer::OptimizerKind;

pub const DEFAULT_LEARNING_RATE: f64 = 0.001;

// ─── Training Configuration ──────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    // data
    pub dataset:             Option<String>,
    pub dataset_config_file: PathBuf,
    pub vocab:               Option<String>,
    pub vocab_root:          PathBuf,
    pub vocab_threshold:     usize,
    pub crop_size:           usize,
    pub num_workers:         usize,

    // model
    pub features:            String,
    pub persist_features:    String,
    pub attention:           String,
    pub regularize_attn:     bool,
    pub embed_size:          usize,
    pub hidden_size:         usize,
    pub num_layers:          usize,
    pub dropout:             f64,
    pub encoder_dropout:     f64,
    pub finetune:            bool,
    pub weights_dir:         Option<PathBuf>,

    // model files
    pub load_model:          Vec<PathBuf>,
    pub model_name:          Option<String>,
    pub model_basename:      String,
    pub model_path:          PathBuf,
    pub resume:              bool,
    pub force_epoch:         usize,

    // training
    pub num_epochs:          usize,
    pub num_batches:         usize,
    pub batch_size:          usize,
    pub learning_rate:       Option<f64>,
    pub grad_clip:           Option<f64>,
    pub optimizer:           String,
    pub weight_decay:        f64,
    pub lr_scheduler:        bool,
    pub log_step:            usize,

    // validation
    pub validate:            Option<String>,
    pub validate_only:       bool,
    pub validation_step:     usize,
    pub validation_scoring:  Option<String>,

    // teacher forcing
    pub teacher_forcing:     String,
    pub teacher_forcing_k:   f64,
    pub teacher_forcing_beta: f64,

    // runtime
    pub seed:                u64,
    pub cpu:                 bool,
    pub deterministic:       bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset:             None,
            dataset_config_file: PathBuf::from("datasets/datasets.json"),
            vocab:               None,
            vocab_root:          PathBuf::from("vocab_cache"),
            vocab_threshold:     DEFAULT_THRESHOLD,
            crop_size:           224,
            num_workers:         2,

            features:            "resnet152".to_string(),
            persist_features:    String::new(),
            attention:           "none".to_string(),
            regularize_attn:     false,
            embed_size:          256,
            hidden_size:         512,
            num_layers:          1,
            dropout:             0.0,
            encoder_dropout:     0.0,
            finetune:            false,
            weights_dir:         None,

            load_model:          Vec::new(),
            model_name:          None,
            model_basename:      "model".to_string(),
            model_path:          PathBuf::from("models"),
            resume:              false,
            force_epoch:         0,

            num_epochs:          5,
            num_batches:         0,
            batch_size:          128,
            learning_rate:       None,
            grad_clip:           None,
            optimizer:           "rmsprop".to_string(),
            weight_decay:        1e-6,
            lr_scheduler:        false,
            log_step:            10,

            validate:            None,
            validate_only:       false,
            validation_step:     1,
            validation_scoring:  None,

            teacher_forcing:     "always".to_string(),
            teacher_forcing_k:   6500.0,
            teacher_forcing_beta: 1.0,

            seed:                42,
            cpu:                 false,
            deterministic:       true,
        }
    }
}

impl TrainConfig {
    /// All configuration errors that can be detected without
    /// touching the filesystem.
    pub fn validate(&self) -> Result<(), CaptionError> {
        if self.lr_scheduler && self.validate.is_none() {
            return Err(CaptionError::config(
                "the lr scheduler needs validation enabled (e.g. --validate coco:val2017)",
            ));
        }
        if self.dataset.is_none() && !self.validate_only {
            return Err(CaptionError::config("no dataset selected, supply one with --dataset"));
        }
        if self.validate_only {
            if self.load_model.is_empty() {
                return Err(CaptionError::config("validation-only mode needs a model, use --load-model"));
            }
            if self.validate.is_none() {
                return Err(CaptionError::config("validation-only mode needs a dataset, use --validate"));
            }
        }
        if self.vocab.is_none() && self.load_model.is_empty() && !self.resume {
            return Err(CaptionError::config(
                "no vocabulary given, use --vocab AUTO to build or load a cached one",
            ));
        }
        if self.validation_step == 0 {
            return Err(CaptionError::config("--validation-step must be at least 1"));
        }

        let attention = self.attention_kind()?;
        self.optimizer_kind()?;
        self.forcing_policy()?;
        let scorers = self.scorer_names();
        build_scorers(&scorers)?;
        if attention == AttentionKind::Soft && !scorers.is_empty() {
            return Err(CaptionError::config(
                "soft attention models cannot sample captions, drop --validation-scoring",
            ));
        }
        Ok(())
    }

    pub fn attention_kind(&self) -> Result<AttentionKind, CaptionError> {
        self.attention.parse()
    }

    pub fn optimizer_kind(&self) -> Result<OptimizerKind, CaptionError> {
        self.optimizer.parse()
    }

    pub fn forcing_policy(&self) -> Result<ForcingPolicy, CaptionError> {
        self.teacher_forcing.parse()
    }

    pub fn forcing_schedule(&self) -> ForcingSchedule {
        ForcingSchedule::new(self.teacher_forcing_k, self.teacher_forcing_beta)
    }

    pub fn scorer_names(&self) -> Vec<String> {
        self.validation_scoring
            .as_deref()
            .map(|s| s.split(',').map(str::trim).filter(|n| !n.is_empty()).map(String::from).collect())
            .unwrap_or_default()
    }

    /// Model parameters requested on the command line, before any
    /// checkpoint is consulted.
    pub fn model_params(&self) -> Result<ModelParams, CaptionError> {
        Ok(ModelParams {
            embed_size:       self.embed_size,
            hidden_size:      self.hidden_size,
            num_layers:       self.num_layers,
            batch_size:       self.batch_size,
            learning_rate:    self.learning_rate.unwrap_or(DEFAULT_LEARNING_RATE),
            dropout:          self.dropout,
            encoder_dropout:  self.encoder_dropout,
            features:         FeatureSpec::parse(&self.features),
            persist_features: FeatureSpec::parse(&self.persist_features),
            attention:        self.attention_kind()?,
            vocab:            None,
        })
    }

    /// `--load-model` entries, or a single `None` for a fresh run.
    pub fn model_targets(&self) -> Vec<Option<&Path>> {
        if self.load_model.is_empty() {
            vec![None]
        } else {
            self.load_model.iter().map(|p| Some(p.as_path())).collect()
        }
    }

    /// Directory name of a model under `model_path`.
    ///
    /// `--model-name` wins, then the model directory of a loaded
    /// epoch, and otherwise the name is built from the parameters.
    pub fn model_name(&self, params: &ModelParams, load: Option<&Path>) -> String {
        if let Some(name) = &self.model_name {
            return name.clone();
        }
        if let Some(name) = load
            .and_then(Path::parent)
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
        {
            return name.to_string();
        }

        let mut feats = params.features.short_name();
        if params.has_persist_features() {
            feats.push('-');
            feats.push_str(&params.persist_features.short_name());
        }
        format!(
            "{}-{}-{}-{}-{}-{}-{}-{}-{}-{}-{}",
            self.model_basename,
            params.embed_size,
            params.hidden_size,
            params.num_layers,
            params.batch_size,
            self.optimizer.to_lowercase(),
            f2s(params.learning_rate),
            f2s(self.weight_decay),
            float_name(params.dropout),
            float_name(params.encoder_dropout),
            feats
        )
    }
}

/// Float without exponent and without trailing zeros: 0.001 → "0.001".
pub fn f2s(f: f64) -> String {
    format!("{f:.16}").trim_end_matches('0').to_string()
}

/// Dropout rates always keep one decimal: 0 → "0.0", 0.25 → "0.25".
fn float_name(f: f64) -> String {
    if f.fract() == 0.0 { format!("{f:.1}") } else { format!("{f}") }
}

// ─── Runtime ──────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    /// NdArray on the host
    Cpu,
    /// Wgpu, the default adapter
    Gpu,
}

/// Device, seed and determinism of one process, resolved once at
/// startup and passed down explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub device:        DeviceChoice,
    pub seed:          u64,
    /// Single-threaded data loading, so batch order only depends on the seed
    pub deterministic: bool,
}

impl RunConfig {
    pub fn loader_workers(&self, requested: usize) -> usize {
        if self.deterministic { 0 } else { requested }
    }
}

impl From<&TrainConfig> for RunConfig {
    fn from(cfg: &TrainConfig) -> Self {
        Self {
            device:        if cfg.cpu { DeviceChoice::Cpu } else { DeviceChoice::Gpu },
            seed:          cfg.seed,
            deterministic: cfg.deterministic,
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrainConfig {
        TrainConfig {
            dataset: Some("coco:train2014".into()),
            vocab: Some("AUTO".into()),
            ..Default::default()
        }
    }

    fn config_error(cfg: TrainConfig) -> String {
        match cfg.validate() {
            Err(CaptionError::Configuration(msg)) => msg,
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_default_config_with_dataset_and_vocab_is_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_configuration_errors() {
        assert!(config_error(TrainConfig { lr_scheduler: true, ..config() }).contains("scheduler"));
        assert!(config_error(TrainConfig { dataset: None, ..config() }).contains("dataset"));
        assert!(config_error(TrainConfig { validate_only: true, validate: Some("v".into()), ..config() })
            .contains("--load-model"));
        assert!(config_error(TrainConfig { vocab: None, ..config() }).contains("vocabulary"));
        assert!(config_error(TrainConfig { validation_step: 0, ..config() }).contains("validation-step"));
        config_error(TrainConfig { attention: "global".into(), ..config() });
        config_error(TrainConfig { optimizer: "sgd".into(), ..config() });
        assert!(matches!(
            TrainConfig { teacher_forcing: "sometimes".into(), ..config() }.validate(),
            Err(CaptionError::UnsupportedForcingPolicy(_))
        ));
        config_error(TrainConfig {
            attention: "soft".into(),
            validation_scoring: Some("cider".into()),
            ..config()
        });
    }

    #[test]
    fn test_unknown_scorer_fails_fast() {
        let cfg = TrainConfig { validation_scoring: Some("cider, bleu".into()), ..config() };
        assert!(matches!(cfg.validate(), Err(CaptionError::UnknownScorer(ref n)) if n == "bleu"));
    }

    #[test]
    fn test_loaded_model_may_carry_the_vocabulary() {
        let cfg = TrainConfig { vocab: None, load_model: vec!["models/m/ep3".into()], ..config() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_f2s_trims_trailing_zeros() {
        assert_eq!(f2s(0.001), "0.001");
        assert_eq!(f2s(1e-6), "0.000001");
        assert_eq!(f2s(0.5), "0.5");
    }

    #[test]
    fn test_model_name_from_params() {
        let cfg = TrainConfig { features: "resnet152,c3d.npy".into(), persist_features: "c3d.npy".into(), ..config() };
        let params = cfg.model_params().unwrap();
        assert_eq!(
            cfg.model_name(&params, None),
            "model-256-512-1-128-rmsprop-0.001-0.000001-0.0-0.0-resnet152+c3d-c3d"
        );
    }

    #[test]
    fn test_model_name_from_loaded_epoch_or_flag() {
        let cfg = config();
        let params = cfg.model_params().unwrap();
        assert_eq!(cfg.model_name(&params, Some(Path::new("models/my-model/ep4"))), "my-model");

        let named = TrainConfig { model_name: Some("fixed".into()), ..config() };
        assert_eq!(named.model_name(&params, Some(Path::new("models/my-model/ep4"))), "fixed");
    }

    #[test]
    fn test_run_config_from_flags() {
        let run = RunConfig::from(&TrainConfig { cpu: true, seed: 7, ..config() });
        assert_eq!(run.device, DeviceChoice::Cpu);
        assert_eq!(run.seed, 7);
        assert_eq!(run.loader_workers(4), 0);
        assert_eq!(RunConfig { deterministic: false, ..run }.loader_workers(4), 4);
    }
}
