// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates a training run, once per --load-model entry (or
// once for a fresh model):
//
//   Step 1: Validate the configuration      (nothing written yet)
//   Step 2: Pick the backend                (NdArray or Wgpu)
//   Step 3: Prepare the session             (resume, params, vocab)
//   Step 4: Build training data             (Layer 4 - data)
//   Step 5: Build validation data + scorers (Layer 4, Layer 6)
//   Step 6: Build / load the model          (Layer 5 - ml)
//   Step 7: Save run config, open stats     (Layer 6 - infra)
//   Step 8: Run the training loop           (Layer 5 - ml)
//
// Reference: Burn Book §5 (Training)

use anyhow::{Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    tensor::backend::AutodiffBackend,
};
use rand::{rngs::StdRng, SeedableRng};
use std::path::Path;

use crate::application::config::{DeviceChoice, RunConfig, TrainConfig};
use crate::application::session::{check_same_shapes, external_shapes, Session};
use crate::data::dataset::VocabCoverage;
use crate::data::loader::DatasetRegistry;
use crate::domain::error::CaptionError;
use crate::domain::forcing::ForcingPolicy;
use crate::domain::traits::DatasetProvider;
use crate::infra::scoring::build_scorers;
use crate::infra::stats::StatsStore;
use crate::ml::evaluator::{reference_captions, Evaluator};
use crate::ml::trainer::{Trainer, TrainerOptions, Validation};

pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<()> {
        // ── Step 1: Configuration ────────────────────────────────────────────
        self.config.validate()?;
        let run = RunConfig::from(&self.config);
        let registry = DatasetRegistry::load(&self.config.dataset_config_file)?;

        // ── Step 2: Backend ──────────────────────────────────────────────────
        for load in self.config.model_targets() {
            match run.device {
                DeviceChoice::Cpu => {
                    self.train::<Autodiff<NdArray>>(&registry, load, &run, &NdArrayDevice::default())?
                }
                DeviceChoice::Gpu => {
                    self.train::<Autodiff<Wgpu>>(&registry, load, &run, &WgpuDevice::default())?
                }
            }
        }
        Ok(())
    }

    fn train<B: AutodiffBackend>(
        &self,
        datasets: &dyn DatasetProvider,
        load:     Option<&Path>,
        run:      &RunConfig,
        device:   &B::Device,
    ) -> Result<()> {
        let cfg = &self.config;
        tracing::info!("Using device: {:?} (seed {})", device, run.seed);
        B::seed(device, run.seed);
        let mut rng = StdRng::seed_from_u64(run.seed);

        // ── Step 3: Session ──────────────────────────────────────────────────
        let session = Session::prepare(cfg, load, datasets)?;

        // ── Step 4: Training data ────────────────────────────────────────────
        let name = cfg
            .dataset
            .as_deref()
            .ok_or_else(|| CaptionError::config("no dataset selected, supply one with --dataset"))?;
        let (train_set, train_store) = session.load_dataset(datasets, name)?;
        let regularize_attn = cfg.regularize_attn && session.params.attention.is_attention();
        if session.start_epoch == 0 {
            println!("{}", VocabCoverage::measure(train_set.samples(), &session.vocab).summary());
        }
        let shapes = external_shapes(&train_store);
        let train_loader = session.loader::<B>(cfg, run, train_set, train_store, true, device);

        // ── Step 5: Validation data ──────────────────────────────────────────
        let scorers = build_scorers(&cfg.scorer_names())?;
        let valid = match cfg.validate.as_deref() {
            Some(name) => Some(session.load_dataset(datasets, name)?),
            None => None,
        };
        let references = valid
            .as_ref()
            .map(|(set, _)| reference_captions(set, &session.vocab))
            .unwrap_or_default();
        let validation = match valid {
            Some((set, store)) => {
                check_same_shapes(shapes, external_shapes(&store))?;
                Some(Validation::<B> {
                    loader:    session.loader::<B::InnerBackend>(cfg, run, set, store, false, device),
                    evaluator: Evaluator {
                        vocab:           &session.vocab,
                        scorers:         &scorers,
                        references:      &references,
                        num_batches:     cfg.num_batches,
                        regularize_attn,
                    },
                })
            }
            None => None,
        };

        // ── Step 6: Model ────────────────────────────────────────────────────
        let model = session.build_model::<B>(cfg, shapes, device)?;

        // ── Step 7: Run config and stats ─────────────────────────────────────
        session.checkpoints.save_run_config(cfg)?;
        let stats_path = session.stats_path(None);
        let mut stats = if session.loaded.is_some() {
            StatsStore::load(&stats_path)?
        } else {
            StatsStore::new(&stats_path)
        };

        let forcing = cfg.forcing_policy()?;
        if forcing != ForcingPolicy::Always {
            tracing::info!(
                "Teacher forcing '{forcing}': k={}, beta={}",
                cfg.teacher_forcing_k,
                cfg.teacher_forcing_beta
            );
        }

        // ── Step 8: Training loop ────────────────────────────────────────────
        let trainer = Trainer {
            options: TrainerOptions {
                start_epoch:     session.start_epoch,
                num_epochs:      cfg.num_epochs,
                num_batches:     cfg.num_batches,
                batch_size:      cfg.batch_size,
                log_step:        cfg.log_step,
                learning_rate:   session.learning_rate,
                optimizer:       cfg.optimizer_kind()?,
                weight_decay:    cfg.weight_decay,
                grad_clip:       cfg.grad_clip,
                lr_scheduler:    cfg.lr_scheduler,
                validation_step: cfg.validation_step,
                forcing,
                schedule:        cfg.forcing_schedule(),
                regularize_attn,
            },
            params:       session.params.clone(),
            train_loader,
            validation,
            checkpoints:  &session.checkpoints,
            stats:        &mut stats,
            resume_from:  session.loaded.as_ref().map(|l| l.dir.clone()),
        };
        trainer
            .run(model, &mut rng, device)
            .with_context(|| format!("Training '{}' failed", session.checkpoints.dir().display()))?;
        Ok(())
    }
}
