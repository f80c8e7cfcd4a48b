// ============================================================
// Layer 5 — Validation
// ============================================================
// One pass over the validation loader with the model in
// evaluation mode (inner backend, no autodiff, no dropout):
//
//   1. loss   — same forward path and loss terms as training
//   2. sample — greedy captions, one per image (first occurrence)
//   3. score  — every configured scorer against all references
//
// Reference: Burn Book §5 (Training, model.valid())

use anyhow::Result;
use burn::{data::dataloader::DataLoader, prelude::*};
use rand::Rng;
use std::collections::HashSet;

use crate::data::batcher::CaptionBatch;
use crate::data::dataset::CaptionDataset;
use crate::domain::forcing::ForcingPolicy;
use crate::domain::traits::{CaptionScorer, CaptionsById};
use crate::domain::vocabulary::Vocabulary;
use crate::infra::scoring::stats_key;
use crate::ml::model::{CaptionModel, MAX_SAMPLE_LEN};

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub loss:   f64,
    /// (stats key, score), e.g. ("validation_cider", 0.53)
    pub scores: Vec<(String, f64)>,
}

pub struct Evaluator<'a> {
    pub vocab:           &'a Vocabulary,
    pub scorers:         &'a [Box<dyn CaptionScorer>],
    pub references:      &'a CaptionsById,
    /// 0 = the whole loader
    pub num_batches:     usize,
    /// Add the attention penalty, as in training
    pub regularize_attn: bool,
}

impl Evaluator<'_> {
    pub fn run<B: Backend, R: Rng + ?Sized>(
        &self,
        model:     &CaptionModel<B>,
        loader:    &dyn DataLoader<B, CaptionBatch<B>>,
        policy:    ForcingPolicy,
        teacher_p: f64,
        rng:       &mut R,
    ) -> Result<Evaluation> {
        let mut loss_sum = 0.0f64;
        let mut batches = 0usize;
        let mut generated = CaptionsById::new();
        let mut seen: HashSet<String> = HashSet::new();

        for (i, batch) in loader.iter().enumerate() {
            if self.num_batches > 0 && i >= self.num_batches {
                break;
            }
            let output = model.forward(&batch, policy, teacher_p, rng)?;
            loss_sum += model.loss(&output, self.regularize_attn).into_scalar().elem::<f64>();
            batches += 1;

            if !self.scorers.is_empty() {
                self.collect_captions(model, &batch, &mut generated, &mut seen)?;
            }
        }

        let loss = if batches > 0 { loss_sum / batches as f64 } else { f64::NAN };

        let mut scores = Vec::with_capacity(self.scorers.len());
        for scorer in self.scorers {
            let score = scorer.score(self.references, &generated)?;
            scores.push((stats_key(scorer.as_ref()), score));
        }
        Ok(Evaluation { loss, scores })
    }

    fn collect_captions<B: Backend>(
        &self,
        model:     &CaptionModel<B>,
        batch:     &CaptionBatch<B>,
        generated: &mut CaptionsById,
        seen:      &mut HashSet<String>,
    ) -> Result<()> {
        let ids: Vec<i64> = model
            .sample(batch, MAX_SAMPLE_LEN)?
            .into_data()
            .convert::<i64>()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("cannot read sampled ids: {e:?}"))?;

        for (row, image_id) in ids.chunks(MAX_SAMPLE_LEN).zip(&batch.image_ids) {
            if !seen.insert(image_id.clone()) {
                continue;
            }
            let tokens: Vec<usize> = row.iter().map(|&t| t.max(0) as usize).collect();
            let caption = self.vocab.ids_to_caption(&tokens);
            tracing::debug!("{image_id}: {caption}");
            generated.insert(image_id.clone(), vec![caption]);
        }
        Ok(())
    }
}

/// Ground-truth captions of every image in `dataset`, as text.
pub fn reference_captions(dataset: &CaptionDataset, vocab: &Vocabulary) -> CaptionsById {
    let mut refs = CaptionsById::new();
    for sample in dataset.samples() {
        refs.entry(sample.image_id.clone())
            .or_default()
            .push(vocab.ids_to_caption(&sample.caption));
    }
    refs
}
