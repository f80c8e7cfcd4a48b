// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// Seams between the training core and its collaborators.
//
//   DatasetProvider — resolves a dataset name to its parameters
//                     (JSON registry file in practice)
//   CaptionSource   — yields the caption records of a dataset
//   CaptionScorer   — a named caption metric such as CIDEr
//
// The application layer only sees these traits, so a test can
// hand in an in-memory provider or a constant scorer.
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use anyhow::Result;
use std::collections::HashMap;

use crate::domain::caption::{CaptionRecord, DatasetParams};

/// Ground-truth or generated captions, keyed by image id.
pub type CaptionsById = HashMap<String, Vec<String>>;

// ─── DatasetProvider ──────────────────────────────────────────────────────────
pub trait DatasetProvider {
    /// Parameters for `name`. A '+'-joined name yields several
    /// datasets that are used together.
    fn get_params(&self, name: &str) -> Result<Vec<DatasetParams>>;

    /// Names of all configured datasets, for error messages.
    fn names(&self) -> Vec<String>;
}

// ─── CaptionSource ────────────────────────────────────────────────────────────
pub trait CaptionSource {
    fn load_records(&self) -> Result<Vec<CaptionRecord>>;
}

// ─── CaptionScorer ────────────────────────────────────────────────────────────
pub trait CaptionScorer {
    /// Display name, e.g. "CIDEr". Stats keys use the lowercase form.
    fn name(&self) -> &str;

    /// Corpus-level score of `res` against the references in `gts`.
    fn score(&self, gts: &CaptionsById, res: &CaptionsById) -> Result<f64>;
}
