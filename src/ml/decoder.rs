// ============================================================
// Layer 5 — Caption Decoder
// ============================================================
// One recurrent decoder, three attention strategies:
//
//   Plain   — stacked LSTM over [word embedding ++ persist features]
//   Spatial — LSTM cell on the embedding; attention over the
//             feature grid *after* the step; logits from
//             [dropout(h) ++ context]
//   Soft    — "show, attend and tell": state from the mean grid
//             location, gated attention context fed *into* the
//             step together with the embedding
//
// All three share the same step loop:
//
//   step 0 input   : encoder output (plain, spatial)
//                    embed(<start>) (soft)
//   step t         : run the strategy on the first
//                    batch_sizes[t] rows only
//   step t+1 input : ground truth, own prediction, or a blend,
//                    as the teacher forcing policy decides
//
// Logits of step t land in output slot t (slot t+1 for soft,
// whose slot 0 is the one-hot <start> token). Only slots that
// belong to the packed sequence are kept, in time-major order,
// so the result lines up with packing::pack_ids(captions).
//
// Reference: Xu et al. (2015) Show, Attend and Tell
//            Lu et al. (2017) Knowing When to Look
//            Burn Book §3 (Building Blocks)

use anyhow::{bail, Result};
use burn::{
    module::{Initializer, Param},
    nn::{Dropout, DropoutConfig, Embedding, EmbeddingConfig, Linear, LinearConfig, Lstm, LstmConfig, LstmState},
    prelude::*,
    tensor::activation::sigmoid,
};
use rand::Rng;
use std::path::Path;

use crate::data::batcher::{CaptionBatch, PersistFeatures};
use crate::domain::error::CaptionError;
use crate::domain::feature_spec::FeatureDim;
use crate::domain::forcing::ForcingPolicy;
use crate::domain::model_params::AttentionKind;
use crate::ml::attention::{SpatialAttention, SpatialAttentionConfig};
use crate::ml::extractor::{bank_flat, bank_grid, flat_dim, grid_dim, FeatureExtractor};
use crate::ml::forcing::next_input;
use crate::ml::packing;

// ─── Config ───────────────────────────────────────────────────────────────────
#[derive(Config, Debug)]
pub struct DecoderConfig {
    pub vocab_size:       usize,
    pub embed_size:       usize,
    pub hidden_size:      usize,
    #[config(default = 1)]
    pub num_layers:       usize,
    #[config(default = 0.0)]
    pub dropout:          f64,
    #[config(default = "AttentionKind::None")]
    pub attention:        AttentionKind,
    /// Backbones whose output is available at every step
    #[config(default = "Vec::new()")]
    pub persist_internal: Vec<String>,
    /// Shape of the external persistent features, if any
    pub persist_external: Option<FeatureDim>,
    #[config(default = false)]
    pub finetune:         bool,
}

impl DecoderConfig {
    pub fn init<B: Backend>(&self, weights_dir: Option<&Path>, device: &B::Device) -> Result<CaptionDecoder<B>> {
        let (extractors, dims) =
            FeatureExtractor::list(&self.persist_internal, self.finetune, weights_dir, device)?;

        if self.attention.is_attention() && self.num_layers != 1 {
            tracing::warn!("The {} attention decoder uses a single LSTM layer; num_layers={} ignored", self.attention, self.num_layers);
        }

        let mut embed = EmbeddingConfig::new(self.vocab_size, self.embed_size);
        let strategy = match self.attention {
            AttentionKind::None => {
                // grids are flattened for the plain decoder
                let external = self.persist_external.map(|d| FeatureDim::Flat(d.flat_len()));
                let persist = flat_dim(&dims, external);
                tracing::info!("Decoder: total persistent feature dim={persist}");
                AttentionStrategy::Plain(self.plain_head(persist, device))
            }
            AttentionKind::Spatial => {
                let (channels, locations) = grid_dim(&dims, self.persist_external)?;
                tracing::info!("Spatial attention decoder: {channels} channels over {locations} locations");
                AttentionStrategy::Spatial(SpatialHead {
                    lstm:      LstmConfig::new(self.embed_size, self.hidden_size, true).init(device),
                    attention: SpatialAttentionConfig::new(channels, self.hidden_size).init(device),
                    dropout:   DropoutConfig::new(self.dropout).init(),
                    linear:    LinearConfig::new(self.hidden_size + channels, self.vocab_size).init(device),
                })
            }
            AttentionKind::Soft => {
                let (channels, locations) = grid_dim(&dims, self.persist_external)?;
                tracing::info!("Soft attention decoder: {channels} channels over {locations} locations");
                embed = embed.with_initializer(UNIFORM);
                AttentionStrategy::Soft(self.soft_head(channels, device))
            }
        };

        Ok(CaptionDecoder {
            embed: embed.init(device),
            extractors,
            strategy,
            vocab_size: self.vocab_size,
        })
    }

    fn plain_head<B: Backend>(&self, persist: usize, device: &B::Device) -> PlainHead<B> {
        let layers = self.num_layers.max(1);
        let lstm = (0..layers)
            .map(|i| {
                let d_in = if i == 0 { self.embed_size + persist } else { self.hidden_size };
                LstmConfig::new(d_in, self.hidden_size, true).init(device)
            })
            .collect();
        PlainHead {
            lstm,
            layer_dropout: DropoutConfig::new(self.dropout).init(),
            linear:        LinearConfig::new(self.hidden_size, self.vocab_size).init(device),
        }
    }

    fn soft_head<B: Backend>(&self, channels: usize, device: &B::Device) -> SoftHead<B> {
        let mut linear = LinearConfig::new(self.hidden_size, self.vocab_size)
            .with_initializer(UNIFORM)
            .init(device);
        linear.bias = Some(Param::from_tensor(Tensor::zeros([self.vocab_size], device)));

        SoftHead {
            attention: SpatialAttentionConfig::new(channels, self.hidden_size).init(device),
            init_h:    LinearConfig::new(channels, self.hidden_size).init(device),
            init_c:    LinearConfig::new(channels, self.hidden_size).init(device),
            f_beta:    LinearConfig::new(self.hidden_size, channels).init(device),
            lstm:      LstmConfig::new(self.embed_size + channels, self.hidden_size, true).init(device),
            dropout:   DropoutConfig::new(self.dropout).init(),
            linear,
        }
    }
}

const UNIFORM: Initializer = Initializer::Uniform { min: -0.1, max: 0.1 };

// ─── Strategies ───────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct PlainHead<B: Backend> {
    pub lstm:          Vec<Lstm<B>>,
    /// Between stacked layers
    pub layer_dropout: Dropout,
    pub linear:        Linear<B>,
}

#[derive(Module, Debug)]
pub struct SpatialHead<B: Backend> {
    pub lstm:      Lstm<B>,
    pub attention: SpatialAttention<B>,
    pub dropout:   Dropout,
    pub linear:    Linear<B>,
}

#[derive(Module, Debug)]
pub struct SoftHead<B: Backend> {
    pub attention: SpatialAttention<B>,
    pub init_h:    Linear<B>,
    pub init_c:    Linear<B>,
    /// Gate on the attention context
    pub f_beta:    Linear<B>,
    pub lstm:      Lstm<B>,
    pub dropout:   Dropout,
    pub linear:    Linear<B>,
}

#[derive(Module, Debug)]
pub enum AttentionStrategy<B: Backend> {
    Plain(PlainHead<B>),
    Spatial(SpatialHead<B>),
    Soft(SoftHead<B>),
}

/// Keep the first `rows` rows of a recurrent state.
fn shrink<B: Backend>(state: LstmState<B, 2>, rows: usize) -> LstmState<B, 2> {
    if state.hidden.dims()[0] == rows {
        return state;
    }
    LstmState::new(state.cell.narrow(0, 0, rows), state.hidden.narrow(0, 0, rows))
}

impl<B: Backend> PlainHead<B> {
    /// x: [bt, E] → logits [bt, V]
    fn step(&self, x: Tensor<B, 2>, persist: Option<&Tensor<B, 2>>, states: &mut [Option<LstmState<B, 2>>]) -> Tensor<B, 2> {
        let bt = x.dims()[0];
        let x = match persist {
            Some(p) => Tensor::cat(vec![x, p.clone().narrow(0, 0, bt)], 1),
            None => x,
        };
        let mut h = x.unsqueeze_dim::<3>(1);
        let last = self.lstm.len() - 1;
        for (i, (lstm, state)) in self.lstm.iter().zip(states.iter_mut()).enumerate() {
            let (out, next) = lstm.forward(h, state.take().map(|s| shrink(s, bt)));
            *state = Some(next);
            h = if i < last { self.layer_dropout.forward(out) } else { out };
        }
        self.linear.forward(h.squeeze_dim::<2>(1))
    }

    /// Whole sequence in one pass: [B, T, E+P] → [B, T, V]
    fn sequence(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let last = self.lstm.len() - 1;
        let mut h = x;
        for (i, lstm) in self.lstm.iter().enumerate() {
            let (out, _) = lstm.forward(h, None);
            h = if i < last { self.layer_dropout.forward(out) } else { out };
        }
        self.linear.forward(h)
    }
}

impl<B: Backend> SpatialHead<B> {
    fn step(&self, x: Tensor<B, 2>, grid: &Tensor<B, 3>, state: &mut Option<LstmState<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let bt = x.dims()[0];
        let (_, next) = self.lstm.forward(x.unsqueeze_dim(1), state.take().map(|s| shrink(s, bt)));
        let h = next.hidden.clone();
        *state = Some(next);

        let (context, alpha) = self.attention.forward(grid.clone().narrow(0, 0, bt), h.clone());
        let logits = self.linear.forward(Tensor::cat(vec![self.dropout.forward(h), context], 1));
        (logits, alpha)
    }
}

impl<B: Backend> SoftHead<B> {
    fn init_state(&self, grid: &Tensor<B, 3>) -> LstmState<B, 2> {
        let mean = grid.clone().mean_dim(1).squeeze_dim::<2>(1);
        LstmState::new(self.init_c.forward(mean.clone()), self.init_h.forward(mean))
    }

    fn step(&self, x: Tensor<B, 2>, grid: &Tensor<B, 3>, state: &mut Option<LstmState<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let bt = x.dims()[0];
        let prev = match state.take() {
            Some(s) => shrink(s, bt),
            None => shrink(self.init_state(grid), bt),
        };
        let h = prev.hidden.clone();

        let (context, alpha) = self.attention.forward(grid.clone().narrow(0, 0, bt), h.clone());
        let gate = sigmoid(self.f_beta.forward(h));
        let input = Tensor::cat(vec![x, gate * context], 1);

        let (_, next) = self.lstm.forward(input.unsqueeze_dim(1), Some(prev));
        let logits = self.linear.forward(self.dropout.forward(next.hidden.clone()));
        *state = Some(next);
        (logits, alpha)
    }
}

// ─── Decoder ──────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct CaptionDecoder<B: Backend> {
    pub embed:      Embedding<B>,
    /// Internal persistent-feature extractors
    pub extractors: Vec<FeatureExtractor<B>>,
    pub strategy:   AttentionStrategy<B>,
    pub vocab_size: usize,
}

pub struct DecoderOutput<B: Backend> {
    /// Packed logits — shape: [sum(lengths), vocab]
    pub logits: Tensor<B, 2>,
    /// Attention weights — shape: [batch, seq, locations], zero where unwritten
    pub alphas: Option<Tensor<B, 3>>,
}

/// How the shared loop walks one strategy.
struct Plan<B: Backend> {
    first:       Tensor<B, 2>,
    steps:       usize,
    /// Output slot of step t is t + slot_offset
    slot_offset: usize,
    /// Ground truth for step t is embeddings[:, t - gt_shift]
    gt_shift:    usize,
}

impl<B: Backend> CaptionDecoder<B> {
    /// ids: [n, 1] → [n, E]
    fn embed_ids(&self, ids: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        self.embed.forward(ids).squeeze_dim::<2>(1)
    }

    fn persist_flat(&self, batch: &CaptionBatch<B>) -> Result<Option<Tensor<B, 2>>> {
        let external = batch.persist_features.as_ref().map(|p| match p {
            PersistFeatures::Flat(t) => t.clone(),
            PersistFeatures::Grid(t) => t.clone().flatten::<2>(1, 2),
        });
        bank_flat(&self.extractors, batch.images.as_ref(), external)
    }

    fn persist_grid(&self, batch: &CaptionBatch<B>) -> Result<Tensor<B, 3>> {
        let external = match &batch.persist_features {
            Some(PersistFeatures::Grid(t)) => Some(t.clone()),
            Some(PersistFeatures::Flat(_)) => {
                return Err(CaptionError::InvalidFeatureShape(
                    "attention needs grid-shaped persistent features, got flat ones".into(),
                )
                .into())
            }
            None => None,
        };
        bank_grid(&self.extractors, batch.images.as_ref(), external)
    }

    /// Teacher-forced (or scheduled-sampling) decode of a whole batch.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        encoded:   Option<Tensor<B, 2>>,
        batch:     &CaptionBatch<B>,
        policy:    ForcingPolicy,
        teacher_p: f64,
        rng:       &mut R,
    ) -> Result<DecoderOutput<B>> {
        let lengths = &batch.lengths;
        let sizes = packing::batch_sizes(lengths)?;
        let [_, seq] = batch.captions.dims();
        if sizes.is_empty() || seq == 0 {
            bail!("cannot decode an empty batch");
        }
        let embeddings = self.embed.forward(batch.captions.clone()); // [B, T, E]

        match &self.strategy {
            AttentionStrategy::Plain(head) => {
                let encoded = require_encoded(encoded)?;
                let persist = self.persist_flat(batch)?;

                if policy == ForcingPolicy::Always {
                    // inputs: encoder output then captions[0..T-1]
                    let mut x = encoded.unsqueeze_dim::<3>(1);
                    if seq > 1 {
                        x = Tensor::cat(vec![x, embeddings.narrow(1, 0, seq - 1)], 1);
                    }
                    if let Some(p) = persist {
                        x = Tensor::cat(vec![x, p.unsqueeze_dim::<3>(1).repeat_dim(1, seq)], 2);
                    }
                    let logits = packing::pack(head.sequence(x), lengths)?;
                    return Ok(DecoderOutput { logits, alphas: None });
                }

                let mut states: Vec<_> = head.lstm.iter().map(|_| None).collect();
                let plan = Plan { first: encoded, steps: seq, slot_offset: 0, gt_shift: 1 };
                let (logits, _) = self.decode_loop(plan, &sizes, &embeddings, policy, teacher_p, rng, None, |x| {
                    (head.step(x, persist.as_ref(), &mut states), None)
                })?;
                Ok(DecoderOutput { logits, alphas: None })
            }
            AttentionStrategy::Spatial(head) => {
                let encoded = require_encoded(encoded)?;
                let grid = self.persist_grid(batch)?;
                let mut state = None;
                let plan = Plan { first: encoded, steps: seq, slot_offset: 0, gt_shift: 1 };
                let locations = grid.dims()[1];
                let (logits, alphas) =
                    self.decode_loop(plan, &sizes, &embeddings, policy, teacher_p, rng, Some(locations), |x| {
                        let (l, a) = head.step(x, &grid, &mut state);
                        (l, Some(a))
                    })?;
                Ok(DecoderOutput { logits, alphas })
            }
            AttentionStrategy::Soft(head) => {
                let grid = self.persist_grid(batch)?;
                let mut state = Some(head.init_state(&grid));
                let first = embeddings.clone().narrow(1, 0, 1).squeeze_dim::<2>(1);
                let plan = Plan { first, steps: seq - 1, slot_offset: 1, gt_shift: 0 };
                let locations = grid.dims()[1];
                let (stepped, alphas) =
                    self.decode_loop(plan, &sizes, &embeddings, policy, teacher_p, rng, Some(locations), |x| {
                        let (l, a) = head.step(x, &grid, &mut state);
                        (l, Some(a))
                    })?;

                // slot 0: one-hot of the first (start) token
                let start = batch
                    .captions
                    .clone()
                    .narrow(1, 0, 1)
                    .squeeze_dim::<1>(1)
                    .one_hot::<2>(self.vocab_size)
                    .float()
                    .narrow(0, 0, sizes[0]);
                let logits = if seq > 1 { Tensor::cat(vec![start, stepped], 0) } else { start };
                Ok(DecoderOutput { logits, alphas })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_loop<R, F>(
        &self,
        plan:       Plan<B>,
        sizes:      &[usize],
        embeddings: &Tensor<B, 3>,
        policy:     ForcingPolicy,
        teacher_p:  f64,
        rng:        &mut R,
        locations:  Option<usize>,
        mut step:   F,
    ) -> Result<(Tensor<B, 2>, Option<Tensor<B, 3>>)>
    where
        R: Rng + ?Sized,
        F: FnMut(Tensor<B, 2>) -> (Tensor<B, 2>, Option<Tensor<B, 2>>),
    {
        let [batch, seq, _] = embeddings.dims();
        let device = embeddings.device();
        let mut input = plan.first;
        let mut packed = Vec::with_capacity(plan.steps);
        let mut alpha_slots: Vec<Option<Tensor<B, 2>>> = vec![None; seq];

        for t in 0..plan.steps {
            let bt = sizes.get(t).copied().unwrap_or(0);
            if bt == 0 {
                break;
            }
            let (logits, alpha) = step(input.clone().narrow(0, 0, bt));

            let slot = t + plan.slot_offset;
            let keep = sizes.get(slot).copied().unwrap_or(0);
            if keep > 0 {
                packed.push(logits.clone().narrow(0, 0, keep));
            }
            if let (Some(a), true) = (alpha, slot < seq) {
                alpha_slots[slot] = Some(pad_rows(a, batch));
            }

            if t + 1 < plan.steps {
                let ground_truth = embeddings
                    .clone()
                    .narrow(1, t + 1 - plan.gt_shift, 1)
                    .squeeze_dim::<2>(1)
                    .narrow(0, 0, bt);
                let choice = policy.select(teacher_p, rng);
                input = next_input(choice, ground_truth, || self.embed_ids(logits.argmax(1)));
            }
        }

        if packed.is_empty() {
            bail!("decoder produced no outputs");
        }
        let alphas = locations.map(|l| {
            let slots = alpha_slots
                .into_iter()
                .map(|a| a.unwrap_or_else(|| Tensor::zeros([batch, l], &device)))
                .collect();
            Tensor::stack::<3>(slots, 1)
        });
        Ok((Tensor::cat(packed, 0), alphas))
    }

    /// Greedy decoding: `max_len` argmax tokens per image, no early stop.
    pub fn sample(&self, encoded: Option<Tensor<B, 2>>, batch: &CaptionBatch<B>, max_len: usize) -> Result<Tensor<B, 2, Int>> {
        let mut ids = Vec::with_capacity(max_len);
        match &self.strategy {
            AttentionStrategy::Soft(_) => {
                return Err(CaptionError::SamplingUnsupported("soft attention".into()).into());
            }
            AttentionStrategy::Plain(head) => {
                let persist = self.persist_flat(batch)?;
                let mut states: Vec<_> = head.lstm.iter().map(|_| None).collect();
                let mut input = require_encoded(encoded)?;
                for _ in 0..max_len {
                    let predicted = head.step(input, persist.as_ref(), &mut states).argmax(1);
                    input = self.embed_ids(predicted.clone());
                    ids.push(predicted);
                }
            }
            AttentionStrategy::Spatial(head) => {
                let grid = self.persist_grid(batch)?;
                let mut state = None;
                let mut input = require_encoded(encoded)?;
                for _ in 0..max_len {
                    let (logits, _) = head.step(input, &grid, &mut state);
                    let predicted = logits.argmax(1);
                    input = self.embed_ids(predicted.clone());
                    ids.push(predicted);
                }
            }
        }
        if ids.is_empty() {
            bail!("max_len must be at least 1");
        }
        Ok(Tensor::cat(ids, 1))
    }
}

fn require_encoded<B: Backend>(encoded: Option<Tensor<B, 2>>) -> Result<Tensor<B, 2>> {
    encoded.ok_or_else(|| CaptionError::config("this decoder needs encoder features as its first input").into())
}

/// [rows, L] → [batch, L], zero rows appended.
fn pad_rows<B: Backend>(x: Tensor<B, 2>, batch: usize) -> Tensor<B, 2> {
    let [rows, cols] = x.dims();
    if rows == batch {
        return x;
    }
    let zeros = Tensor::zeros([batch - rows, cols], &x.device());
    Tensor::cat(vec![x, zeros], 0)
}
