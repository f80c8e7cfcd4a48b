// ============================================================
// Layer 6 — Checkpoint Format Migration
// ============================================================
// Format 1 encoders held exactly one backbone in a field named
// `resnet`. Format 2 keeps a list of feature extractors, each
// wrapping its backbone in `extractor`, so the same weights now
// live under `extractors.0.extractor`.
//
// The old record is read through a module with the old field
// names and then re-assembled into the current Encoder. This is
// the only place that knows about format 1.

use anyhow::{bail, Context, Result};
use burn::{
    nn::{BatchNorm, Dropout, Linear},
    prelude::*,
    record::{DefaultRecorder, Recorder},
};
use std::path::Path;

use crate::ml::backbone::Backbone;
use crate::ml::encoder::Encoder;
use crate::ml::extractor::FeatureExtractor;

/// Version assumed when state.json carries none.
pub fn oldest_version() -> u32 {
    1
}

/// Encoder layout of format 1.
#[derive(Module, Debug)]
pub struct LegacyEncoder<B: Backend> {
    pub resnet:  Backbone<B>,
    pub linear:  Linear<B>,
    pub dropout: Dropout,
    pub bn:      BatchNorm<B>,
}

impl<B: Backend> LegacyEncoder<B> {
    /// Split a current single-backbone encoder into the old layout.
    fn from_current(encoder: Encoder<B>) -> Result<(Self, FeatureExtractor<B>)> {
        let Encoder { mut extractors, linear, dropout, bn } = encoder;
        if extractors.len() != 1 {
            bail!("format 1 encoders hold exactly one backbone, this model has {}", extractors.len());
        }
        let first = extractors.remove(0);
        Ok((Self { resnet: first.extractor.clone(), linear, dropout, bn }, first))
    }

    fn into_current(self, template: FeatureExtractor<B>) -> Encoder<B> {
        Encoder {
            extractors: vec![FeatureExtractor { extractor: self.resnet, ..template }],
            linear:     self.linear,
            dropout:    self.dropout,
            bn:         self.bn,
        }
    }
}

/// Load an encoder saved in `version` format into `fresh`.
pub fn load_encoder<B: Backend>(version: u32, fresh: Encoder<B>, file: &Path, device: &B::Device) -> Result<Encoder<B>> {
    match version {
        1 => {
            tracing::info!("Migrating format 1 encoder: 'resnet' -> 'extractors.0.extractor'");
            let (legacy, template) = LegacyEncoder::from_current(fresh)?;
            let record = DefaultRecorder::new()
                .load(file.to_path_buf(), device)
                .with_context(|| format!("Cannot load format 1 encoder from '{}'", file.display()))?;
            Ok(legacy.load_record(record).into_current(template))
        }
        other => bail!("unsupported checkpoint format version {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::encoder::EncoderConfig;
    use burn::backend::NdArray;
    use burn::tensor::Tolerance;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_format_1_weights_move_under_extractors() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = EncoderConfig::new(vec!["alexnet".into()], 4);

        // write an encoder in the old layout
        let old = config.init::<TestBackend>(None, &device).unwrap();
        let (legacy, _) = LegacyEncoder::from_current(old).unwrap();
        let file = dir.path().join("encoder");
        DefaultRecorder::new().record(legacy.clone().into_record(), file.clone()).unwrap();

        let fresh = config.init::<TestBackend>(None, &device).unwrap();
        let migrated = load_encoder(1, fresh, &file, &device).unwrap();

        legacy
            .linear
            .weight
            .val()
            .into_data()
            .assert_approx_eq::<f32>(&migrated.linear.weight.val().into_data(), Tolerance::absolute(0.0));

        let (Backbone::AlexNet(before), Backbone::AlexNet(after)) = (&legacy.resnet, &migrated.extractors[0].extractor) else {
            panic!("backbone kind changed during migration");
        };
        before.convs[0]
            .weight
            .val()
            .into_data()
            .assert_approx_eq::<f32>(&after.convs[0].weight.val().into_data(), Tolerance::absolute(0.0));
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let device = Default::default();
        let fresh = EncoderConfig::new(vec![], 4).with_external_dim(2).init::<TestBackend>(None, &device).unwrap();
        assert!(load_encoder(7, fresh, Path::new("nowhere"), &device).is_err());
    }
}
