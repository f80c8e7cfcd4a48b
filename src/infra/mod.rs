// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Everything that touches disk outside the data pipeline:
//
//   checkpoint.rs  — per-epoch model/optimiser records and
//                    state.json (params, epoch, learning rate)
//   migration.rs   — reading older checkpoint formats
//   stats.rs       — per-epoch statistics JSON
//   vocab_store.rs — build, cache and load vocabularies
//   scoring.rs     — caption metrics (CIDEr)
//
// Reference: Rust Book §9 (Error Handling with anyhow)
//            Burn Book §5 (Checkpointing)

/// Model checkpoint saving and loading
pub mod checkpoint;

pub mod migration;

/// Per-epoch training statistics
pub mod stats;

pub mod vocab_store;

/// Caption scorers
pub mod scoring;
