// ============================================================
// Layer 2 — ValidateUseCase
// ============================================================
// Evaluates saved models without training them. For every
// --load-model entry:
//
//   Step 1: Prepare the session from the checkpoint
//   Step 2: Load the validation dataset
//   Step 3: Rebuild the model on the plain (non-autodiff) backend
//   Step 4: One validation pass with teacher_p = 1
//   Step 5: Record the scores in train_stats-<dataset>.json under
//           the checkpoint's epoch

use anyhow::Result;
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, NdArray, Wgpu},
    prelude::*,
};
use rand::{rngs::StdRng, SeedableRng};
use std::path::Path;

use crate::application::config::{DeviceChoice, RunConfig, TrainConfig};
use crate::application::session::{external_shapes, Session};
use crate::data::loader::DatasetRegistry;
use crate::domain::error::CaptionError;
use crate::domain::forcing::ForcingPolicy;
use crate::domain::traits::DatasetProvider;
use crate::infra::scoring::build_scorers;
use crate::infra::stats::StatsStore;
use crate::ml::evaluator::{reference_captions, Evaluation, Evaluator};

pub struct ValidateUseCase {
    config: TrainConfig,
}

impl ValidateUseCase {
    /// `config.validate_only` is forced on.
    pub fn new(config: TrainConfig) -> Self {
        Self { config: TrainConfig { validate_only: true, ..config } }
    }

    pub fn execute(&self) -> Result<Vec<Evaluation>> {
        self.config.validate()?;
        let run = RunConfig::from(&self.config);
        let registry = DatasetRegistry::load(&self.config.dataset_config_file)?;

        let mut results = Vec::new();
        for load in self.config.model_targets() {
            let eval = match run.device {
                DeviceChoice::Cpu => self.evaluate::<NdArray>(&registry, load, &run, &NdArrayDevice::default())?,
                DeviceChoice::Gpu => self.evaluate::<Wgpu>(&registry, load, &run, &WgpuDevice::default())?,
            };
            results.push(eval);
        }
        Ok(results)
    }

    fn evaluate<B: Backend>(
        &self,
        datasets: &dyn DatasetProvider,
        load:     Option<&Path>,
        run:      &RunConfig,
        device:   &B::Device,
    ) -> Result<Evaluation> {
        let cfg = &self.config;
        B::seed(device, run.seed);
        let mut rng = StdRng::seed_from_u64(run.seed);

        // ── Step 1: Session ──────────────────────────────────────────────────
        let session = Session::prepare(cfg, load, datasets)?;
        let Some(loaded) = &session.loaded else {
            return Err(CaptionError::config("validation-only mode needs a model, use --load-model").into());
        };
        let epoch = loaded.state.epoch;

        // ── Step 2: Validation data ──────────────────────────────────────────
        let name = cfg
            .validate
            .as_deref()
            .ok_or_else(|| CaptionError::config("validation-only mode needs a dataset, use --validate"))?;
        let (set, store) = session.load_dataset(datasets, name)?;
        let references = reference_captions(&set, &session.vocab);
        let shapes = external_shapes(&store);
        let loader = session.loader::<B>(cfg, run, set, store, false, device);

        // ── Step 3: Model ────────────────────────────────────────────────────
        let model = session.build_model::<B>(cfg, shapes, device)?;

        // ── Step 4: Validation pass ──────────────────────────────────────────
        let policy = cfg.forcing_policy()?;
        if policy != ForcingPolicy::Always {
            tracing::warn!("Teacher forcing '{policy}' is not used for validation-only runs, teacher_p = 1");
        }
        let scorers = build_scorers(&cfg.scorer_names())?;
        let evaluator = Evaluator {
            vocab:           &session.vocab,
            scorers:         &scorers,
            references:      &references,
            num_batches:     cfg.num_batches,
            regularize_attn: cfg.regularize_attn && session.params.attention.is_attention(),
        };
        let eval = evaluator.run(&model, loader.as_ref(), policy, 1.0, &mut rng)?;

        // ── Step 5: Stats ────────────────────────────────────────────────────
        let mut stats = StatsStore::load(session.stats_path(Some(name)))?;
        stats.record(epoch, "validation_loss", eval.loss);
        println!("Epoch {epoch} validation average loss: {:.4}", eval.loss);
        for (key, score) in &eval.scores {
            stats.record(epoch, key, *score);
            println!("Validation {key}: {score:.4}");
        }
        stats.save()?;
        tracing::info!("Wrote stats to '{}'", stats.path().display());

        Ok(eval)
    }
}
