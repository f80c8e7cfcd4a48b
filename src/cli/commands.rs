// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Two subcommands, `train` and `validate`. Flags shared by both
// live in small flattened groups so their defaults are declared
// once.
//
// Reference: Rust Book §12 (Building a CLI Program)
//            clap derive tutorial (flatten)

use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::application::config::TrainConfig;
use crate::infra::vocab_store::DEFAULT_THRESHOLD;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train (or continue training) a captioning model
    Train(TrainArgs),

    /// Evaluate saved models on a validation dataset
    Validate(ValidateArgs),
}

// ─── Shared Groups ────────────────────────────────────────────────────────────

#[derive(Args, Debug, Clone)]
pub struct DataArgs {
    /// JSON file mapping dataset names to their locations
    #[arg(long, default_value = "datasets/datasets.json")]
    pub dataset_config_file: PathBuf,

    /// Vocabulary directive or file: AUTO (build once, then use the
    /// cache), REGEN (always rebuild), or a path to a .txt/.json file
    #[arg(long)]
    pub vocab: Option<String>,

    /// Where AUTO/REGEN vocabularies are cached
    #[arg(long, default_value = "vocab_cache")]
    pub vocab_root: PathBuf,

    /// Minimum word count for a word to enter a built vocabulary
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    pub vocab_threshold: usize,

    /// Images are resized to crop_size x crop_size
    #[arg(long, default_value_t = 224)]
    pub crop_size: usize,

    /// Data loader threads (ignored with deterministic loading)
    #[arg(long, default_value_t = 2)]
    pub num_workers: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ModelFileArgs {
    /// Epoch directories of saved models, e.g. models/foo/ep3
    #[arg(long, num_args = 1..)]
    pub load_model: Vec<PathBuf>,

    /// Explicit model directory name under --model-path
    #[arg(long)]
    pub model_name: Option<String>,

    /// Where model directories are written
    #[arg(long, default_value = "models")]
    pub model_path: PathBuf,

    /// Directory with pre-trained backbone weights (<name>.mpk)
    #[arg(long)]
    pub weights_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ValidationArgs {
    /// Dataset to validate against
    #[arg(long)]
    pub validate: Option<String>,

    /// Validate every N epochs
    #[arg(long, default_value_t = 1)]
    pub validation_step: usize,

    /// Comma separated caption metrics, e.g. "cider"
    #[arg(long)]
    pub validation_scoring: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RuntimeArgs {
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Use the CPU (NdArray) backend even when a GPU is available
    #[arg(long)]
    pub cpu: bool,

    /// Allow multi-threaded data loading; batch order then varies
    #[arg(long)]
    pub nondeterministic: bool,
}

// ─── train ────────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Training dataset, several may be joined with '+'
    #[arg(long)]
    pub dataset: Option<String>,

    #[command(flatten)]
    pub data: DataArgs,

    /// Encoder input features, comma separated backbone names
    /// and/or .npy files, e.g. "resnet152,c3d.npy"
    #[arg(long, default_value = "resnet152")]
    pub features: String,

    /// Features given to the decoder at every step
    #[arg(long, default_value = "")]
    pub persist_features: String,

    /// none, spatial or soft
    #[arg(long, default_value = "none")]
    pub attention: String,

    /// Add the attention regulariser to the loss
    #[arg(long)]
    pub regularize_attn: bool,

    #[arg(long, default_value_t = 256)]
    pub embed_size: usize,

    #[arg(long, default_value_t = 512)]
    pub hidden_size: usize,

    #[arg(long, default_value_t = 1)]
    pub num_layers: usize,

    /// Dropout between LSTM layers / before the output layer
    #[arg(long, default_value_t = 0.0)]
    pub dropout: f64,

    /// Dropout after the encoder's linear layer
    #[arg(long, default_value_t = 0.0)]
    pub encoder_dropout: f64,

    /// Train the backbones too
    #[arg(long)]
    pub finetune: bool,

    #[command(flatten)]
    pub files: ModelFileArgs,

    /// Prefix of generated model names
    #[arg(long, default_value = "model")]
    pub model_basename: String,

    /// Continue from the newest epoch of the matching model
    #[arg(long)]
    pub resume: bool,

    /// Pretend the loaded model finished epoch N-1
    #[arg(long, default_value_t = 0)]
    pub force_epoch: usize,

    #[arg(long, default_value_t = 5)]
    pub num_epochs: usize,

    /// Stop every epoch after N batches, 0 = no limit
    #[arg(long, default_value_t = 0)]
    pub num_batches: usize,

    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,

    /// Overrides the rate stored in a loaded model (default 0.001)
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Clamp every gradient element to [-c, c]
    #[arg(long)]
    pub grad_clip: Option<f64>,

    /// rmsprop or adam
    #[arg(long, default_value = "rmsprop")]
    pub optimizer: String,

    #[arg(long, default_value_t = 1e-6)]
    pub weight_decay: f64,

    /// Reduce the learning rate when validation loss plateaus
    #[arg(long)]
    pub lr_scheduler: bool,

    #[arg(long, default_value_t = 10)]
    pub log_step: usize,

    #[command(flatten)]
    pub validation: ValidationArgs,

    /// always, sampled, additive or additive_sampled
    #[arg(long, default_value = "always")]
    pub teacher_forcing: String,

    /// Inverse sigmoid schedule parameter; larger waits longer
    /// before feeding the model its own predictions
    #[arg(long, default_value_t = 6500.0)]
    pub teacher_forcing_k: f64,

    /// Slope of the middle of the schedule
    #[arg(long, default_value_t = 1.0)]
    pub teacher_forcing_beta: f64,

    #[command(flatten)]
    pub runtime: RuntimeArgs,
}

impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        TrainConfig {
            dataset:              a.dataset,
            dataset_config_file:  a.data.dataset_config_file,
            vocab:                a.data.vocab,
            vocab_root:           a.data.vocab_root,
            vocab_threshold:      a.data.vocab_threshold,
            crop_size:            a.data.crop_size,
            num_workers:          a.data.num_workers,
            features:             a.features,
            persist_features:     a.persist_features,
            attention:            a.attention,
            regularize_attn:      a.regularize_attn,
            embed_size:           a.embed_size,
            hidden_size:          a.hidden_size,
            num_layers:           a.num_layers,
            dropout:              a.dropout,
            encoder_dropout:      a.encoder_dropout,
            finetune:             a.finetune,
            weights_dir:          a.files.weights_dir,
            load_model:           a.files.load_model,
            model_name:           a.files.model_name,
            model_basename:       a.model_basename,
            model_path:           a.files.model_path,
            resume:               a.resume,
            force_epoch:          a.force_epoch,
            num_epochs:           a.num_epochs,
            num_batches:          a.num_batches,
            batch_size:           a.batch_size,
            learning_rate:        a.learning_rate,
            grad_clip:            a.grad_clip,
            optimizer:            a.optimizer,
            weight_decay:         a.weight_decay,
            lr_scheduler:         a.lr_scheduler,
            log_step:             a.log_step,
            validate:             a.validation.validate,
            validate_only:        false,
            validation_step:      a.validation.validation_step,
            validation_scoring:   a.validation.validation_scoring,
            teacher_forcing:      a.teacher_forcing,
            teacher_forcing_k:    a.teacher_forcing_k,
            teacher_forcing_beta: a.teacher_forcing_beta,
            seed:                 a.runtime.seed,
            cpu:                  a.runtime.cpu,
            deterministic:        !a.runtime.nondeterministic,
        }
    }
}

// ─── validate ─────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub files: ModelFileArgs,

    #[command(flatten)]
    pub validation: ValidationArgs,

    #[command(flatten)]
    pub data: DataArgs,

    /// Replace the external feature files stored in the model
    #[arg(long, default_value = "")]
    pub features: String,

    #[arg(long, default_value = "")]
    pub persist_features: String,

    /// Include the attention penalty in the validation loss
    #[arg(long)]
    pub regularize_attn: bool,

    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,

    /// Stop after N batches, 0 = the whole dataset
    #[arg(long, default_value_t = 0)]
    pub num_batches: usize,

    /// Only used to warn: validation always feeds ground truth
    #[arg(long, default_value = "always")]
    pub teacher_forcing: String,

    #[command(flatten)]
    pub runtime: RuntimeArgs,
}

impl From<ValidateArgs> for TrainConfig {
    fn from(a: ValidateArgs) -> Self {
        TrainConfig {
            dataset_config_file: a.data.dataset_config_file,
            vocab:               a.data.vocab,
            vocab_root:          a.data.vocab_root,
            vocab_threshold:     a.data.vocab_threshold,
            crop_size:           a.data.crop_size,
            num_workers:         a.data.num_workers,
            features:            a.features,
            persist_features:    a.persist_features,
            regularize_attn:     a.regularize_attn,
            weights_dir:         a.files.weights_dir,
            load_model:          a.files.load_model,
            model_name:          a.files.model_name,
            model_path:          a.files.model_path,
            batch_size:          a.batch_size,
            num_batches:         a.num_batches,
            validate:            a.validation.validate,
            validate_only:       true,
            validation_step:     a.validation.validation_step,
            validation_scoring:  a.validation.validation_scoring,
            teacher_forcing:     a.teacher_forcing,
            seed:                a.runtime.seed,
            cpu:                 a.runtime.cpu,
            deterministic:       !a.runtime.nondeterministic,
            ..TrainConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    #[test]
    fn test_train_defaults_match_config_defaults() {
        let cli = Cli::try_parse_from(["caption_trainer", "train", "--dataset", "coco", "--vocab", "AUTO"]).unwrap();
        let Commands::Train(args) = cli.command else { panic!("expected train") };
        let cfg = TrainConfig::from(args);
        assert_eq!(
            cfg,
            TrainConfig { dataset: Some("coco".into()), vocab: Some("AUTO".into()), ..TrainConfig::default() }
        );
    }

    #[test]
    fn test_validate_collects_several_models() {
        let cli = Cli::try_parse_from([
            "caption_trainer",
            "validate",
            "--load-model",
            "models/a/ep1",
            "models/a/ep2",
            "--validate",
            "coco:val2014",
            "--validation-scoring",
            "cider",
            "--cpu",
        ])
        .unwrap();
        let Commands::Validate(args) = cli.command else { panic!("expected validate") };
        let cfg = TrainConfig::from(args);
        assert!(cfg.validate_only);
        assert_eq!(cfg.load_model.len(), 2);
        assert!(cfg.validate().is_ok());
    }
}
