// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Epoch loop over a CaptionModel on an autodiff backend.
//
// Per batch:
//   iteration = (epoch - start_epoch) * batches_per_epoch + i
//   teacher_p = schedule.teacher_prob(iteration)
//   forward (forcing policy) → loss (+ attention regulariser)
//   backward → GradientsParams (fresh every step) → optimiser
//
// Per epoch:
//   training_loss into the stats store
//   validation every `validation_step` epochs (model.valid())
//   plateau scheduler fed with the validation loss
//   checkpoint ep<N>/ and stats file written unconditionally
//
// Key Burn 0.20 points:
//   - gradient clipping and weight decay live in the optimiser
//     config (GradientClippingConfig::Value clamps elementwise)
//   - model.valid() moves to the inner backend, so validation
//     batches come from a loader on B::InnerBackend
//
// Reference: Burn Book §5, Tieleman & Hinton (2012) RMSProp,
//            Kingma & Ba (2015) Adam

use anyhow::Result;
use burn::{
    data::dataloader::DataLoader,
    grad_clipping::GradientClippingConfig,
    module::AutodiffModule,
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer, RmsPropConfig},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use crate::data::batcher::CaptionBatch;
use crate::domain::error::CaptionError;
use crate::domain::forcing::{ForcingPolicy, ForcingSchedule};
use crate::domain::model_params::ModelParams;
use crate::infra::checkpoint::{self, CheckpointManager, CheckpointState};
use crate::infra::stats::StatsStore;
use crate::ml::evaluator::Evaluator;
use crate::ml::model::CaptionModel;
use crate::ml::scheduler::ReduceLrOnPlateau;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    RmsProp,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = CaptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rmsprop" => Ok(OptimizerKind::RmsProp),
            "adam" => Ok(OptimizerKind::Adam),
            other => Err(CaptionError::config(format!("unknown optimizer '{other}' (expected rmsprop or adam)"))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OptimizerKind::RmsProp => "rmsprop",
            OptimizerKind::Adam => "adam",
        })
    }
}

#[derive(Debug, Clone)]
pub struct TrainerOptions {
    /// Epochs already done; training continues with start_epoch + 1
    pub start_epoch:     usize,
    pub num_epochs:      usize,
    /// Stop each epoch after this many batches, 0 = no limit
    pub num_batches:     usize,
    pub batch_size:      usize,
    pub log_step:        usize,
    pub learning_rate:   f64,
    pub optimizer:       OptimizerKind,
    pub weight_decay:    f64,
    pub grad_clip:       Option<f64>,
    pub lr_scheduler:    bool,
    pub validation_step: usize,
    pub forcing:         ForcingPolicy,
    pub schedule:        ForcingSchedule,
    pub regularize_attn: bool,
}

impl TrainerOptions {
    fn weight_decay(&self) -> Option<WeightDecayConfig> {
        (self.weight_decay > 0.0).then(|| WeightDecayConfig::new(self.weight_decay as f32))
    }

    fn grad_clipping(&self) -> Option<GradientClippingConfig> {
        self.grad_clip.map(|c| GradientClippingConfig::Value(c as f32))
    }

    /// torch defaults: alpha 0.99, eps 1e-8, no momentum
    fn rmsprop(&self) -> RmsPropConfig {
        RmsPropConfig::new()
            .with_alpha(0.99)
            .with_epsilon(1e-8)
            .with_momentum(0.0)
            .with_weight_decay(self.weight_decay())
            .with_grad_clipping(self.grad_clipping())
    }

    fn adam(&self) -> AdamConfig {
        AdamConfig::new()
            .with_epsilon(1e-8)
            .with_weight_decay(self.weight_decay())
            .with_grad_clipping(self.grad_clipping())
    }
}

pub struct Validation<'a, B: AutodiffBackend> {
    pub loader:    Arc<dyn DataLoader<B::InnerBackend, CaptionBatch<B::InnerBackend>>>,
    pub evaluator: Evaluator<'a>,
}

pub struct Trainer<'a, B: AutodiffBackend> {
    pub options:      TrainerOptions,
    /// Stored in every checkpoint
    pub params:       ModelParams,
    pub train_loader: Arc<dyn DataLoader<B, CaptionBatch<B>>>,
    pub validation:   Option<Validation<'a, B>>,
    pub checkpoints:  &'a CheckpointManager,
    pub stats:        &'a mut StatsStore,
    /// Epoch directory whose optimizer state is restored first
    pub resume_from:  Option<PathBuf>,
}

impl<B: AutodiffBackend> Trainer<'_, B> {
    pub fn run(self, model: CaptionModel<B>, rng: &mut StdRng, device: &B::Device) -> Result<CaptionModel<B>> {
        match self.options.optimizer {
            OptimizerKind::RmsProp => {
                let optim = self.options.rmsprop().init();
                self.train_with(model, optim, rng, device)
            }
            OptimizerKind::Adam => {
                let optim = self.options.adam().init();
                self.train_with(model, optim, rng, device)
            }
        }
    }

    fn train_with<O>(self, mut model: CaptionModel<B>, mut optim: O, rng: &mut StdRng, device: &B::Device) -> Result<CaptionModel<B>>
    where
        O: Optimizer<CaptionModel<B>, B>,
    {
        let opts = &self.options;
        if let Some(dir) = &self.resume_from {
            optim = checkpoint::load_optimizer(dir, optim, device)?;
        }

        let mut lr = opts.learning_rate;
        let mut scheduler = opts.lr_scheduler.then(|| ReduceLrOnPlateau::new(lr));
        let total_steps = self.train_loader.num_items().div_ceil(opts.batch_size.max(1));
        let epoch_steps = if opts.num_batches > 0 { total_steps.min(opts.num_batches) } else { total_steps };
        tracing::info!(
            "Training epochs {}..={} with {} ({} steps per epoch, lr={lr})",
            opts.start_epoch + 1,
            opts.num_epochs,
            opts.optimizer,
            epoch_steps
        );

        let mut teacher_p = 1.0;
        for epoch in opts.start_epoch..opts.num_epochs {
            let shown = epoch + 1;

            // ── Training phase ────────────────────────────────────────────────
            let mut loss_sum = 0.0f64;
            let mut batches = 0usize;

            for (i, batch) in self.train_loader.iter().enumerate() {
                if opts.num_batches > 0 && i >= opts.num_batches {
                    tracing::info!("Stopping epoch after {} batches", opts.num_batches);
                    break;
                }
                let iteration = (epoch - opts.start_epoch) * total_steps + i;
                teacher_p = opts.schedule.teacher_prob(iteration);

                let output = model.forward(&batch, opts.forcing, teacher_p, rng)?;
                let loss = model.loss(&output, opts.regularize_attn);
                let loss_val: f64 = loss.clone().into_scalar().elem::<f64>();
                loss_sum += loss_val;
                batches += 1;

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(lr, model, grads);

                if opts.log_step > 0 && (i + 1) % opts.log_step == 0 {
                    tracing::info!(
                        "Epoch [{shown}/{}], Step [{}/{total_steps}], Loss: {loss_val:.4}, Perplexity: {:5.4}, teacher_p: {teacher_p:.4}",
                        opts.num_epochs,
                        i + 1,
                        loss_val.exp()
                    );
                }
            }

            let train_loss = if batches > 0 { loss_sum / batches as f64 } else { f64::NAN };
            self.stats.record(shown, "training_loss", train_loss);

            // ── Validation phase ──────────────────────────────────────────────
            let mut summary = format!("Epoch {shown:>3}/{} | train_loss={train_loss:.4}", opts.num_epochs);
            if let Some(validation) = self.validation.as_ref().filter(|_| shown % opts.validation_step.max(1) == 0) {
                let model_valid = model.valid();
                let eval = validation.evaluator.run(
                    &model_valid,
                    validation.loader.as_ref(),
                    opts.forcing,
                    teacher_p,
                    rng,
                )?;
                self.stats.record(shown, "validation_loss", eval.loss);
                summary.push_str(&format!(" | val_loss={:.4}", eval.loss));
                for (key, score) in &eval.scores {
                    self.stats.record(shown, key, *score);
                    summary.push_str(&format!(" | {key}={score:.4}"));
                }
                if let Some(s) = scheduler.as_mut() {
                    lr = s.step(eval.loss);
                }
            }

            // ── Checkpoint + stats ────────────────────────────────────────────
            let state = CheckpointState::new(shown, self.params.clone(), lr, model.encoder.is_some());
            let dir = self.checkpoints.save(&model, &optim, &state)?;
            self.stats.save()?;
            tracing::info!("Checkpoint saved to '{}'", dir.display());

            println!("{summary} | lr={lr:.2e}");
        }

        tracing::info!("Training complete!");
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::batcher::CaptionBatcher;
    use crate::data::dataset::{CaptionDataset, CaptionSample};
    use crate::data::features::{FeatureStore, FeatureTable};
    use crate::domain::feature_spec::{FeatureDim, FeatureSpec};
    use crate::domain::vocabulary::Vocabulary;
    use crate::infra::checkpoint::read_state;
    use crate::ml::evaluator::reference_captions;
    use crate::ml::model::ExternalShapes;
    use burn::backend::{Autodiff, NdArray};
    use burn::data::dataloader::DataLoaderBuilder;
    use rand::SeedableRng;
    use std::path::PathBuf;

    type AdBackend = Autodiff<NdArray<f32>>;

    fn dataset() -> CaptionDataset {
        let samples = (0..4)
            .map(|i| CaptionSample {
                image_id:    format!("img{i}"),
                image_path:  PathBuf::from(format!("{i}.jpg")),
                caption:     vec![1, 4 + i % 2, 5, 2],
                feature_row: i,
            })
            .collect();
        CaptionDataset::new(samples)
    }

    fn store() -> FeatureStore {
        let table = FeatureTable::new(FeatureDim::Flat(3), 4, (0..12).map(|v| v as f32 / 12.0).collect()).unwrap();
        FeatureStore { init: Some(Arc::new(table)), persist: None }
    }

    fn options(optimizer: OptimizerKind) -> TrainerOptions {
        TrainerOptions {
            start_epoch:     0,
            num_epochs:      2,
            num_batches:     0,
            batch_size:      2,
            log_step:        1,
            learning_rate:   0.01,
            optimizer,
            weight_decay:    1e-6,
            grad_clip:       Some(5.0),
            lr_scheduler:    true,
            validation_step: 1,
            forcing:         ForcingPolicy::Sampled,
            schedule:        ForcingSchedule::default(),
            regularize_attn: false,
        }
    }

    #[test]
    fn test_epochs_write_checkpoints_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let vocab = Vocabulary::from_words(["a", "b"]);
        let params = ModelParams {
            embed_size: 4,
            hidden_size: 6,
            features: FeatureSpec::parse("f.npy"),
            vocab: Some(vocab.clone()),
            ..Default::default()
        };
        let shapes = ExternalShapes { init: Some(FeatureDim::Flat(3)), persist: None };
        let model = CaptionModel::<AdBackend>::new(&params, shapes, false, None, &device).unwrap();

        let train_loader = DataLoaderBuilder::new(CaptionBatcher::<AdBackend>::new(store(), None, 0))
            .batch_size(2)
            .shuffle(1)
            .build(dataset());
        let valid_loader = DataLoaderBuilder::new(CaptionBatcher::new(store(), None, 0))
            .batch_size(2)
            .build(dataset());

        let refs = reference_captions(&dataset(), &vocab);
        let scorers = Vec::new();
        let checkpoints = CheckpointManager::new(dir.path().join("model"));
        let mut stats = StatsStore::new(dir.path().join("model/train_stats.json"));

        for optimizer in [OptimizerKind::RmsProp, OptimizerKind::Adam] {
            let trainer = Trainer::<AdBackend> {
                options: options(optimizer),
                params: params.clone(),
                train_loader: train_loader.clone(),
                validation: Some(Validation {
                    loader:    valid_loader.clone(),
                    evaluator: Evaluator {
                        vocab:           &vocab,
                        scorers:         &scorers,
                        references:      &refs,
                        num_batches:     0,
                        regularize_attn: false,
                    },
                }),
                checkpoints: &checkpoints,
                stats: &mut stats,
                resume_from: None,
            };
            let mut rng = StdRng::seed_from_u64(42);
            trainer.run(model.clone(), &mut rng, &device).unwrap();
        }

        assert_eq!(checkpoints.latest_epoch().unwrap(), Some(2));
        let state = read_state(&checkpoints.epoch_dir(2)).unwrap();
        assert_eq!(state.epoch, 2);
        assert_eq!(state.params, params);

        let reloaded = StatsStore::load(dir.path().join("model/train_stats.json")).unwrap();
        for epoch in [1, 2] {
            assert!(reloaded.get(epoch, "training_loss").unwrap().is_finite());
            assert!(reloaded.get(epoch, "validation_loss").is_some());
        }
    }

    #[test]
    fn test_optimizer_names() {
        assert_eq!("RMSprop".parse::<OptimizerKind>().unwrap(), OptimizerKind::RmsProp);
        assert_eq!("adam".parse::<OptimizerKind>().unwrap(), OptimizerKind::Adam);
        assert!(matches!("sgd".parse::<OptimizerKind>(), Err(CaptionError::Configuration(_))));
    }
}
