// ============================================================
// Layer 4 — Caption Batcher
// ============================================================
// Implements Burn's Batcher trait to turn a Vec<CaptionSample>
// into one CaptionBatch.
//
// Captions have different lengths, so batching here does
// dynamic padding:
//
//   1. sort the samples by caption length, longest first
//   2. pad every caption with <pad> (id 0) to the longest
//   3. remember the real lengths for packing the targets
//
// The descending order is what lets the decoder treat step t
// as "the first batch_sizes[t] rows are still active".
//
// Alongside the captions a batch carries whatever image data
// the model needs:
//   images           — only when an internal backbone runs
//   init_features    — external encoder input  [B, D]
//   persist_features — external per-step input [B, D] or [B, L, C]
//
// Reference: Burn Book §4 (Batcher)
//            Rust Book §8 (Vectors)

use burn::{data::dataloader::batcher::Batcher, prelude::*};
use std::marker::PhantomData;

use crate::data::dataset::CaptionSample;
use crate::data::features::{FeatureStore, FeatureTable};
use crate::data::images::ImageLoader;
use crate::domain::feature_spec::FeatureDim;

// ─── CaptionBatch ─────────────────────────────────────────────────────────────
/// Persistent features in the shape the decoder consumes them.
#[derive(Debug, Clone)]
pub enum PersistFeatures<B: Backend> {
    /// [batch, dim]
    Flat(Tensor<B, 2>),
    /// [batch, locations, channels]
    Grid(Tensor<B, 3>),
}

impl<B: Backend> PersistFeatures<B> {
    pub fn batch_size(&self) -> usize {
        match self {
            PersistFeatures::Flat(t) => t.dims()[0],
            PersistFeatures::Grid(t) => t.dims()[0],
        }
    }
}

/// A batch of captioned images, sorted by caption length (descending).
#[derive(Debug, Clone)]
pub struct CaptionBatch<B: Backend> {
    /// Normalised RGB images — shape: [batch, 3, crop, crop]
    pub images: Option<Tensor<B, 4>>,

    /// Padded caption ids — shape: [batch, max_len]
    pub captions: Tensor<B, 2, Int>,

    /// Real caption lengths, non-increasing
    pub lengths: Vec<usize>,

    pub image_ids: Vec<String>,

    pub init_features: Option<Tensor<B, 2>>,

    pub persist_features: Option<PersistFeatures<B>>,
}

// ─── CaptionBatcher ───────────────────────────────────────────────────────────
#[derive(Clone, Debug)]
pub struct CaptionBatcher<B: Backend> {
    features: FeatureStore,
    /// None when no internal backbone needs pixels
    images:   Option<ImageLoader>,
    pad_id:   usize,
    _backend: PhantomData<B>,
}

impl<B: Backend> CaptionBatcher<B> {
    pub fn new(features: FeatureStore, images: Option<ImageLoader>, pad_id: usize) -> Self {
        Self { features, images, pad_id, _backend: PhantomData }
    }

    fn image_tensor(&self, loader: &ImageLoader, items: &[CaptionSample], device: &B::Device) -> Tensor<B, 4> {
        let size = loader.crop_size;
        let pixels: Vec<f32> = items
            .iter()
            .flat_map(|s| {
                // paths were checked when the dataset was built
                loader.load(&s.image_path).unwrap_or_else(|e| {
                    tracing::error!("{e:#}; using a blank image instead");
                    loader.blank()
                })
            })
            .collect();
        Tensor::from_data(TensorData::new(pixels, [items.len(), 3, size, size]), device)
    }
}

fn gather_rows(table: &FeatureTable, items: &[CaptionSample]) -> Vec<f32> {
    let width = table.dim().flat_len();
    items
        .iter()
        .flat_map(|s| match table.row(s.feature_row) {
            Some(row) => row.to_vec(),
            None => {
                tracing::warn!(
                    "Image '{}' has no feature row {}; using zeros",
                    s.image_id,
                    s.feature_row
                );
                vec![0.0; width]
            }
        })
        .collect()
}

// ─── Burn Batcher Trait Implementation ────────────────────────────────────────
impl<B: Backend> Batcher<B, CaptionSample, CaptionBatch<B>> for CaptionBatcher<B> {
    fn batch(&self, mut items: Vec<CaptionSample>, device: &B::Device) -> CaptionBatch<B> {
        // ── Step 1: longest caption first ─────────────────────────────────────
        items.sort_by(|a, b| b.caption.len().cmp(&a.caption.len()));

        let batch_size = items.len();
        let lengths: Vec<usize> = items.iter().map(|s| s.caption.len()).collect();
        let max_len = lengths.first().copied().unwrap_or(0);

        // ── Step 2: pad captions into one [batch, max_len] tensor ─────────────
        let padded: Vec<i64> = items
            .iter()
            .flat_map(|s| {
                s.caption
                    .iter()
                    .map(|&id| id as i64)
                    .chain(std::iter::repeat(self.pad_id as i64))
                    .take(max_len)
            })
            .collect();
        let captions = Tensor::<B, 2, Int>::from_data(
            TensorData::new(padded, [batch_size, max_len]),
            device,
        );

        // ── Step 3: image pixels and external features ────────────────────────
        let images = self.images.as_ref().map(|l| self.image_tensor(l, &items, device));

        let init_features = self.features.init.as_ref().map(|t| {
            let d = t.dim().flat_len();
            Tensor::<B, 2>::from_data(TensorData::new(gather_rows(t, &items), [batch_size, d]), device)
        });

        let persist_features = self.features.persist.as_ref().map(|t| {
            let data = gather_rows(t, &items);
            match t.dim() {
                FeatureDim::Flat(d) => {
                    PersistFeatures::Flat(Tensor::from_data(TensorData::new(data, [batch_size, d]), device))
                }
                FeatureDim::Grid { channels, height, width } => PersistFeatures::Grid(Tensor::from_data(
                    TensorData::new(data, [batch_size, height * width, channels]),
                    device,
                )),
            }
        });

        CaptionBatch {
            images,
            captions,
            lengths,
            image_ids: items.iter().map(|s| s.image_id.clone()).collect(),
            init_features,
            persist_features,
        }
    }
}
