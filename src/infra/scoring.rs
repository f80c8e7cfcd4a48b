// ============================================================
// Layer 6 — Caption Scoring (CIDEr)
// ============================================================
// Consensus-based image description evaluation, Vedantam et al.
// (2015). For every n = 1..4:
//
//   g_n(s)   = tf(ngram, s) * ln(N / df(ngram))   per n-gram
//   sim_n    = mean over references of cos(g_n(candidate), g_n(ref))
//
//   CIDEr(image) = 10 * mean_n(sim_n)
//
// df counts the images whose references contain the n-gram and
// N is the number of images. The corpus score is the mean over
// images.
//
// Reference: Vedantam et al. (2015) CIDEr

use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};

use crate::domain::error::CaptionError;
use crate::domain::traits::{CaptionScorer, CaptionsById};

const MAX_N: usize = 4;

type NgramCounts = HashMap<Vec<String>, f64>;

pub struct Cider;

fn ngrams(caption: &str) -> Vec<NgramCounts> {
    let words: Vec<String> = caption.split_whitespace().map(str::to_lowercase).collect();
    (1..=MAX_N)
        .map(|n| {
            let mut counts = NgramCounts::new();
            for gram in words.windows(n) {
                *counts.entry(gram.to_vec()).or_insert(0.0) += 1.0;
            }
            counts
        })
        .collect()
}

/// tf-idf vectors, one per n, and their norms.
fn weigh(counts: &[NgramCounts], df: &HashMap<Vec<String>, f64>, log_n: f64) -> (Vec<NgramCounts>, Vec<f64>) {
    let mut vectors = Vec::with_capacity(MAX_N);
    let mut norms = Vec::with_capacity(MAX_N);
    for grams in counts {
        let vec: NgramCounts = grams
            .iter()
            .map(|(g, tf)| {
                let d = df.get(g).copied().unwrap_or(0.0).max(1.0);
                (g.clone(), tf * (log_n - d.ln()))
            })
            .collect();
        norms.push(vec.values().map(|v| v * v).sum::<f64>().sqrt());
        vectors.push(vec);
    }
    (vectors, norms)
}

fn cosine(a: &NgramCounts, na: f64, b: &NgramCounts, nb: f64) -> f64 {
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    let dot: f64 = a.iter().filter_map(|(g, v)| b.get(g).map(|w| v * w)).sum();
    dot / (na * nb)
}

impl CaptionScorer for Cider {
    fn name(&self) -> &str {
        "CIDEr"
    }

    fn score(&self, gts: &CaptionsById, res: &CaptionsById) -> Result<f64> {
        let mut ids: Vec<&String> = res.keys().collect();
        ids.sort();
        if ids.is_empty() {
            bail!("no generated captions to score");
        }

        // ── Step 1: document frequencies over the references ──
        let mut refs: HashMap<&String, Vec<Vec<NgramCounts>>> = HashMap::new();
        let mut df: HashMap<Vec<String>, f64> = HashMap::new();
        for id in &ids {
            let Some(references) = gts.get(*id) else {
                bail!("no reference captions for image '{id}'");
            };
            let counted: Vec<Vec<NgramCounts>> = references.iter().map(|r| ngrams(r)).collect();
            let unique: HashSet<&Vec<String>> = counted.iter().flatten().flat_map(|c| c.keys()).collect();
            for gram in unique {
                *df.entry(gram.clone()).or_insert(0.0) += 1.0;
            }
            refs.insert(*id, counted);
        }
        let log_n = (ids.len() as f64).ln();

        // ── Step 2: per-image similarity ──
        let mut total = 0.0;
        for id in &ids {
            let candidate = res[*id].first().map(String::as_str).unwrap_or("");
            let (cand_vec, cand_norm) = weigh(&ngrams(candidate), &df, log_n);

            let references = &refs[*id];
            let mut per_n = [0.0f64; MAX_N];
            for r in references {
                let (ref_vec, ref_norm) = weigh(r, &df, log_n);
                for n in 0..MAX_N {
                    per_n[n] += cosine(&cand_vec[n], cand_norm[n], &ref_vec[n], ref_norm[n]);
                }
            }
            let refs_count = references.len().max(1) as f64;
            let mean: f64 = per_n.iter().map(|s| s / refs_count).sum::<f64>() / MAX_N as f64;
            total += mean * 10.0;
        }
        Ok(total / ids.len() as f64)
    }
}

/// Scorers for the requested names; unknown names fail fast.
pub fn build_scorers(names: &[String]) -> Result<Vec<Box<dyn CaptionScorer>>, CaptionError> {
    names
        .iter()
        .map(|name| match name.to_lowercase().as_str() {
            "cider" => Ok(Box::new(Cider) as Box<dyn CaptionScorer>),
            _ => Err(CaptionError::UnknownScorer(name.clone())),
        })
        .collect()
}

/// Stats key of a scorer, e.g. "validation_cider".
pub fn stats_key(scorer: &dyn CaptionScorer) -> String {
    format!("validation_{}", scorer.name().to_lowercase())
}
