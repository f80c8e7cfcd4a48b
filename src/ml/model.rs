// ============================================================
// Layer 5 — Caption Model (Encoder + Decoder)
// ============================================================
// Composite model built from ModelParams:
//
//   images / init features ──► Encoder ──► first decoder input
//   images / persist features ─────────► CaptionDecoder
//
// The soft attention variant has no encoder; the plain and
// spatial variants need one, so they need `features`.
//
// Loss:
//   cross_entropy(packed logits, packed targets)
//   + mean((1 - Σ_t alpha_t)^2)     when attention is regularised
//
// Reference: Vinyals et al. (2015) Show and Tell
//            Xu et al. (2015) Show, Attend and Tell §4.2.1

use anyhow::Result;
use burn::{nn::loss::CrossEntropyLossConfig, prelude::*};
use rand::Rng;
use std::path::Path;

use crate::data::batcher::CaptionBatch;
use crate::domain::error::CaptionError;
use crate::domain::feature_spec::FeatureDim;
use crate::domain::forcing::ForcingPolicy;
use crate::domain::model_params::{AttentionKind, ModelParams};
use crate::ml::decoder::{CaptionDecoder, DecoderConfig};
use crate::ml::encoder::{Encoder, EncoderConfig};
use crate::ml::packing;

/// Greedy sampling length used for validation captions.
pub const MAX_SAMPLE_LEN: usize = 20;

/// Shapes of the external features, as found on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExternalShapes {
    pub init:    Option<FeatureDim>,
    pub persist: Option<FeatureDim>,
}

#[derive(Module, Debug)]
pub struct CaptionModel<B: Backend> {
    pub encoder: Option<Encoder<B>>,
    pub decoder: CaptionDecoder<B>,
}

pub struct ModelOutput<B: Backend> {
    /// [sum(lengths), vocab]
    pub logits:  Tensor<B, 2>,
    /// [sum(lengths)]
    pub targets: Tensor<B, 1, Int>,
    /// [batch, seq, locations], attention variants only
    pub alphas:  Option<Tensor<B, 3>>,
}

impl<B: Backend> CaptionModel<B> {
    pub fn new(
        params:      &ModelParams,
        external:    ExternalShapes,
        finetune:    bool,
        weights_dir: Option<&Path>,
        device:      &B::Device,
    ) -> Result<Self> {
        let vocab_size = params
            .vocab
            .as_ref()
            .map(|v| v.len())
            .ok_or_else(|| CaptionError::config("the model needs a vocabulary"))?;

        let encoder = match params.attention {
            AttentionKind::Soft => {
                if !params.features.is_empty() {
                    tracing::warn!("Soft attention has no encoder; features={} are not used", params.features);
                }
                None
            }
            _ => {
                params.check_encoder_features()?;
                let config = EncoderConfig::new(params.features.internal.clone(), params.embed_size)
                    .with_external_dim(external.init.map_or(0, |d| d.flat_len()))
                    .with_dropout(params.encoder_dropout)
                    .with_finetune(finetune);
                Some(config.init(weights_dir, device)?)
            }
        };

        let decoder = DecoderConfig::new(vocab_size, params.embed_size, params.hidden_size)
            .with_num_layers(params.num_layers)
            .with_dropout(params.dropout)
            .with_attention(params.attention)
            .with_persist_internal(params.persist_features.internal.clone())
            .with_persist_external(external.persist)
            .with_finetune(finetune)
            .init(weights_dir, device)?;

        Ok(Self { encoder, decoder })
    }

    fn encode(&self, batch: &CaptionBatch<B>) -> Result<Option<Tensor<B, 2>>> {
        self.encoder
            .as_ref()
            .map(|e| e.forward(batch.images.as_ref(), batch.init_features.clone()))
            .transpose()
    }

    pub fn forward<R: Rng + ?Sized>(
        &self,
        batch:     &CaptionBatch<B>,
        policy:    ForcingPolicy,
        teacher_p: f64,
        rng:       &mut R,
    ) -> Result<ModelOutput<B>> {
        let encoded = self.encode(batch)?;
        let out = self.decoder.forward(encoded, batch, policy, teacher_p, rng)?;
        let targets = packing::pack_ids(batch.captions.clone(), &batch.lengths)?;
        Ok(ModelOutput { logits: out.logits, targets, alphas: out.alphas })
    }

    /// Scalar training loss.
    pub fn loss(&self, output: &ModelOutput<B>, regularize_attn: bool) -> Tensor<B, 1> {
        let ce = CrossEntropyLossConfig::new()
            .init(&output.logits.device())
            .forward(output.logits.clone(), output.targets.clone());
        match (&output.alphas, regularize_attn) {
            (Some(alphas), true) => ce + attention_penalty(alphas.clone()),
            _ => ce,
        }
    }

    /// Greedy token ids, [batch, max_len].
    pub fn sample(&self, batch: &CaptionBatch<B>, max_len: usize) -> Result<Tensor<B, 2, Int>> {
        let encoded = self.encode(batch)?;
        self.decoder.sample(encoded, batch, max_len)
    }
}

/// Doubly stochastic regulariser: every location should receive
/// a total weight of one over the caption.
pub fn attention_penalty<B: Backend>(alphas: Tensor<B, 3>) -> Tensor<B, 1> {
    alphas.sum_dim(1).neg().add_scalar(1.0).powf_scalar(2.0).mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::batcher::PersistFeatures;
    use crate::domain::feature_spec::FeatureSpec;
    use crate::domain::vocabulary::Vocabulary;
    use crate::ml::decoder::tests::{batch, grid};
    use crate::ml::decoder::AttentionStrategy;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;
    use rand::{rngs::StdRng, SeedableRng};

    type TestBackend = NdArray<f32>;

    fn params(attention: AttentionKind, features: &str) -> ModelParams {
        let words: Vec<String> = (0..6).map(|i| format!("w{i}")).collect();
        ModelParams {
            embed_size: 6,
            hidden_size: 8,
            features: FeatureSpec::parse(features),
            attention,
            vocab: Some(Vocabulary::from_words(words)),
            ..Default::default()
        }
    }

    fn with_init<B: Backend>(mut b: CaptionBatch<B>, dim: usize) -> CaptionBatch<B> {
        let device = b.captions.device();
        b.init_features = Some(Tensor::random([b.lengths.len(), dim], Distribution::Default, &device));
        b
    }

    const INIT: ExternalShapes = ExternalShapes { init: Some(FeatureDim::Flat(5)), persist: None };

    #[test]
    fn test_plain_needs_features() {
        let res = CaptionModel::<TestBackend>::new(
            &params(AttentionKind::None, ""),
            ExternalShapes::default(),
            false,
            None,
            &Default::default(),
        );
        let err = res.unwrap_err();
        assert!(matches!(err.downcast_ref::<CaptionError>(), Some(CaptionError::Configuration(_))));
        assert!(err.to_string().starts_with("configuration error: the plain decoder"));
    }

    #[test]
    fn test_soft_model_has_no_encoder() {
        let shapes = ExternalShapes {
            init:    None,
            persist: Some(FeatureDim::Grid { channels: 3, height: 2, width: 2 }),
        };
        let model = CaptionModel::<TestBackend>::new(&params(AttentionKind::Soft, ""), shapes, false, None, &Default::default())
            .unwrap();
        assert!(model.encoder.is_none());
        assert!(matches!(model.decoder.strategy, AttentionStrategy::Soft(_)));
    }

    #[test]
    fn test_packed_targets_line_up_with_logits() {
        let model = CaptionModel::<TestBackend>::new(&params(AttentionKind::None, "f.npy"), INIT, false, None, &Default::default())
            .unwrap();
        let b = with_init(batch(None), 5);
        let mut rng = StdRng::seed_from_u64(0);
        let out = model.forward(&b, ForcingPolicy::Always, 1.0, &mut rng).unwrap();

        assert_eq!(out.logits.dims()[0], out.targets.dims()[0]);
        let targets: Vec<i64> = out.targets.into_data().convert::<i64>().to_vec().unwrap();
        // time-major: [1, 1, 5, 7, 6, 2, 2]
        assert_eq!(targets, vec![1, 1, 5, 7, 6, 2, 2]);
    }

    #[test]
    fn test_regulariser_only_for_attention() {
        let shapes = ExternalShapes {
            init:    Some(FeatureDim::Flat(5)),
            persist: Some(FeatureDim::Grid { channels: 3, height: 2, width: 2 }),
        };
        let model =
            CaptionModel::<TestBackend>::new(&params(AttentionKind::Spatial, "f.npy"), shapes, false, None, &Default::default())
                .unwrap();
        let b = with_init(batch(Some(grid())), 5);
        let mut rng = StdRng::seed_from_u64(0);
        let out = model.forward(&b, ForcingPolicy::Always, 1.0, &mut rng).unwrap();

        let plain: f32 = model.loss(&out, false).into_scalar();
        let regularised: f32 = model.loss(&out, true).into_scalar();
        assert!(plain.is_finite());
        assert!(regularised >= plain);
    }

    #[test]
    fn test_attention_penalty_is_zero_when_every_location_sums_to_one() {
        let device = Default::default();
        // two steps, two locations, each location gets 0.5 + 0.5
        let alphas = Tensor::<TestBackend, 3>::from_floats([[[0.5, 0.5], [0.5, 0.5]]], &device);
        let p: f32 = attention_penalty(alphas).into_scalar();
        assert!(p.abs() < 1e-6);

        let alphas = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0], [1.0, 0.0]]], &device);
        // (1-2)^2 and (1-0)^2 averaged
        let p: f32 = attention_penalty(alphas).into_scalar();
        assert!((p - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_greedy_sampling_is_repeatable() {
        let model = CaptionModel::<TestBackend>::new(&params(AttentionKind::None, "f.npy"), INIT, false, None, &Default::default())
            .unwrap();
        let b = with_init(batch(None), 5);
        let first: Vec<i64> = model.sample(&b, MAX_SAMPLE_LEN).unwrap().into_data().convert::<i64>().to_vec().unwrap();
        let second: Vec<i64> = model.sample(&b, MAX_SAMPLE_LEN).unwrap().into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(first.len(), 2 * MAX_SAMPLE_LEN);
        assert_eq!(first, second);
    }

    #[test]
    fn test_gradients_reach_the_decoder() {
        type AdBackend = Autodiff<TestBackend>;
        let device = Default::default();
        let model = CaptionModel::<AdBackend>::new(&params(AttentionKind::None, "f.npy"), INIT, false, None, &device).unwrap();

        let mut b = CaptionBatch::<AdBackend> {
            images:           None,
            captions:         Tensor::from_ints([[1, 5, 2], [1, 2, 0]], &device),
            lengths:          vec![3, 2],
            image_ids:        vec!["a".into(), "b".into()],
            init_features:    None,
            persist_features: None::<PersistFeatures<AdBackend>>,
        };
        b = with_init(b, 5);
        let mut rng = StdRng::seed_from_u64(0);
        let out = model.forward(&b, ForcingPolicy::Sampled, 0.5, &mut rng).unwrap();
        let grads = model.loss(&out, false).backward();

        let weight = model.decoder.embed.weight.val();
        assert!(weight.grad(&grads).is_some());
    }
}
