use anyhow::Result;
use burn::{
    nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::*,
};
use std::path::Path;

use crate::domain::error::CaptionError;
use crate::domain::feature_spec::FeatureDim;
use crate::ml::extractor::{bank_flat, flat_dim, FeatureExtractor};

#[derive(Config, Debug)]
pub struct EncoderConfig {
    /// Backbone names run inside the model
    pub internal:     Vec<String>,
    /// Width of the external (precomputed) encoder features, 0 if none
    #[config(default = 0)]
    pub external_dim: usize,
    pub embed_size:   usize,
    #[config(default = 0.0)]
    pub dropout:      f64,
    #[config(default = false)]
    pub finetune:     bool,
}

impl EncoderConfig {
    pub fn init<B: Backend>(&self, weights_dir: Option<&Path>, device: &B::Device) -> Result<Encoder<B>> {
        let (extractors, dims) = FeatureExtractor::list(&self.internal, self.finetune, weights_dir, device)?;
        let external = (self.external_dim > 0).then_some(FeatureDim::Flat(self.external_dim));
        let total = flat_dim(&dims, external);
        tracing::info!("Encoder: total feature dim={total}");

        Ok(Encoder {
            extractors,
            linear:  LinearConfig::new(total, self.embed_size).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            bn:      BatchNormConfig::new(self.embed_size).with_momentum(0.01).init(device),
        })
    }
}

/// Projects the flat feature bank into the word-embedding space;
/// its output is the decoder's first input.
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    pub extractors: Vec<FeatureExtractor<B>>,
    pub linear:     Linear<B>,
    pub dropout:    Dropout,
    pub bn:         BatchNorm<B>,
}

impl<B: Backend> Encoder<B> {
    /// → [batch, embed_size]
    pub fn forward(&self, images: Option<&Tensor<B, 4>>, external: Option<Tensor<B, 2>>) -> Result<Tensor<B, 2>> {
        let features = bank_flat(&self.extractors, images, external)?
            .ok_or_else(|| CaptionError::Dataset("encoder received no features".into()))?;
        Ok(self.bn.forward(self.dropout.forward(self.linear.forward(features))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_external_only_encoder() {
        let device = Default::default();
        let enc = EncoderConfig::new(vec![], 8)
            .with_external_dim(5)
            .init::<TestBackend>(None, &device)
            .unwrap();
        assert!(enc.extractors.is_empty());
        let out = enc.forward(None, Some(Tensor::ones([3, 5], &device))).unwrap();
        assert_eq!(out.dims(), [3, 8]);
    }

    #[test]
    fn test_unknown_backbone_fails_construction() {
        let device = Default::default();
        let res = EncoderConfig::new(vec!["resnet9000".into()], 8).init::<TestBackend>(None, &device);
        assert!(res.is_err());
    }

    #[test]
    fn test_missing_features_is_an_error() {
        let device = Default::default();
        let enc = EncoderConfig::new(vec![], 4).with_external_dim(2).init::<TestBackend>(None, &device).unwrap();
        assert!(enc.forward(None, None).is_err());
    }
}
