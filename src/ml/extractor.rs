// ============================================================
// Layer 5 — Feature Extractor and Feature Bank
// ============================================================
// A FeatureExtractor wraps one backbone. Frozen (the default)
// means the output is detached, so no gradient reaches the
// backbone and the optimiser never touches it; with finetune
// gradients flow normally. Backbones always run with frozen
// batch-norm statistics and without dropout.
//
// The feature bank puts the outputs of several extractors and
// an externally supplied tensor side by side:
//
//   flat mode — [B, D1] ++ [B, D2] ++ .. ++ external [B, De]
//   grid mode — [B, L, C1] ++ .. ++ external [B, L, Ce]
//               (channel-wise; all parts need the same L)
//
// Reference: Burn Book §3 (Modules)

use anyhow::Result;
use burn::prelude::*;
use std::path::Path;

use crate::data::images::{IMAGENET_MEAN, IMAGENET_STD};
use crate::domain::error::CaptionError;
use crate::domain::feature_spec::FeatureDim;
use crate::ml::backbone::{self, Backbone, InputConvention};

/// Caffe channel means, BGR order, 0..255 scale
const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];

#[derive(Module, Debug)]
pub struct FeatureExtractor<B: Backend> {
    pub extractor: Backbone<B>,
    pub finetune:  bool,
    /// false for convolutional-map heads
    pub flatten:   bool,
    pub caffe_bgr: bool,
}

impl<B: Backend> FeatureExtractor<B> {
    pub fn new(name: &str, finetune: bool, weights_dir: Option<&Path>, device: &B::Device) -> Result<(Self, FeatureDim)> {
        let info = backbone::lookup(name)?;
        let extractor = Backbone::build(&info, device).with_pretrained(name, weights_dir, device);
        let extractor = if finetune { extractor } else { extractor.no_grad() };
        tracing::info!("Feature extractor '{name}': output {:?}{}", info.dim, if finetune { ", finetuned" } else { "" });

        Ok((
            Self {
                extractor,
                finetune,
                flatten: !info.dim.is_grid(),
                caffe_bgr: info.input == InputConvention::CaffeBgr,
            },
            info.dim,
        ))
    }

    /// Build one extractor per name; returns them with their output dims.
    pub fn list(
        names:       &[String],
        finetune:    bool,
        weights_dir: Option<&Path>,
        device:      &B::Device,
    ) -> Result<(Vec<Self>, Vec<FeatureDim>)> {
        let mut extractors = Vec::with_capacity(names.len());
        let mut dims = Vec::with_capacity(names.len());
        for name in names {
            let (e, d) = Self::new(name, finetune, weights_dir, device)?;
            extractors.push(e);
            dims.push(d);
        }
        Ok((extractors, dims))
    }

    /// images: ImageNet-normalised RGB [B, 3, H, W] → [B, C, h, w]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let images = if self.caffe_bgr { to_caffe_bgr(images) } else { images };
        let out = self.extractor.forward(images);
        if self.finetune { out } else { out.detach() }
    }

    pub fn forward_flat(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images).flatten::<2>(1, 3)
    }

    /// [B, C, h, w] → [B, h*w, C]
    pub fn forward_grid(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        self.forward(images).flatten::<3>(2, 3).swap_dims(1, 2)
    }
}

/// Undo ImageNet normalisation and re-encode as Caffe expects.
fn to_caffe_bgr<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = images.device();
    let per_channel = |v: [f32; 3]| Tensor::<B, 1>::from_floats(v, &device).reshape([1, 3, 1, 1]);

    let rgb_255 = (images * per_channel(IMAGENET_STD) + per_channel(IMAGENET_MEAN)).mul_scalar(255.0);
    let bgr = rgb_255.select(1, Tensor::<B, 1, Int>::from_ints([2, 1, 0], &device));
    bgr - per_channel(CAFFE_MEAN_BGR)
}

// ─── Feature bank ─────────────────────────────────────────────────────────────
/// Total flat width of internal dims plus an optional external width.
pub fn flat_dim(internal: &[FeatureDim], external: Option<FeatureDim>) -> usize {
    internal.iter().chain(external.iter()).map(FeatureDim::flat_len).sum()
}

/// (channels, locations) of a grid bank; every part must be a grid
/// with the same spatial size.
pub fn grid_dim(internal: &[FeatureDim], external: Option<FeatureDim>) -> Result<(usize, usize), CaptionError> {
    let mut channels = 0;
    let mut size: Option<(usize, usize)> = None;
    for dim in internal.iter().chain(external.iter()) {
        let FeatureDim::Grid { channels: c, height, width } = *dim else {
            return Err(CaptionError::InvalidFeatureShape(format!(
                "attention needs channel x height x width features, got {dim:?}"
            )));
        };
        if size.is_some_and(|s| s != (height, width)) {
            return Err(CaptionError::InvalidFeatureShape(format!(
                "attention features disagree on grid size: {size:?} vs {:?}",
                (height, width)
            )));
        }
        size = Some((height, width));
        channels += c;
    }
    match size {
        Some((h, w)) => Ok((channels, h * w)),
        None => Err(CaptionError::InvalidFeatureShape(
            "attention needs a convolutional feature grid, none configured".into(),
        )),
    }
}

/// Flat concatenation of extractor outputs and the external tensor.
pub fn bank_flat<B: Backend>(
    extractors: &[FeatureExtractor<B>],
    images:     Option<&Tensor<B, 4>>,
    external:   Option<Tensor<B, 2>>,
) -> Result<Option<Tensor<B, 2>>> {
    let mut parts = internal_parts(extractors, images, FeatureExtractor::forward_flat)?;
    parts.extend(external);
    Ok((!parts.is_empty()).then(|| Tensor::cat(parts, 1)))
}

/// Channel-wise concatenation of grid outputs and the external grid.
pub fn bank_grid<B: Backend>(
    extractors: &[FeatureExtractor<B>],
    images:     Option<&Tensor<B, 4>>,
    external:   Option<Tensor<B, 3>>,
) -> Result<Tensor<B, 3>> {
    let mut parts = internal_parts(extractors, images, FeatureExtractor::forward_grid)?;
    parts.extend(external);
    if parts.is_empty() {
        return Err(CaptionError::InvalidFeatureShape("no attention features in batch".into()).into());
    }
    Ok(Tensor::cat(parts, 2))
}

fn internal_parts<B: Backend, T>(
    extractors: &[FeatureExtractor<B>],
    images:     Option<&Tensor<B, 4>>,
    run:        fn(&FeatureExtractor<B>, Tensor<B, 4>) -> T,
) -> Result<Vec<T>> {
    if extractors.is_empty() {
        return Ok(Vec::new());
    }
    let Some(images) = images else {
        return Err(CaptionError::Dataset("internal feature extractors need images in the batch".into()).into());
    };
    Ok(extractors.iter().map(|e| run(e, images.clone())).collect())
}
