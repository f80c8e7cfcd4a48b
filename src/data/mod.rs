// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything from a dataset name to tensor batches.
//
//   DatasetRegistry   → name ("coco:train2014+coco:val2014") to locations
//       │
//       ▼
//   ManifestSource    → caption records {image_id, file, caption}
//       │
//       ▼
//   Preprocessor      → words to vocabulary ids, <start>/<end> added
//       │
//       ▼
//   CaptionDataset    → Burn Dataset of CaptionSamples
//       │             + FeatureStore (external .npy features)
//       ▼
//   CaptionBatcher    → sorted, padded CaptionBatch (images read here)
//       │
//       ▼
//   DataLoader        → feeds batches to the training loop
//
// Reference: Burn Book §4 (Datasets and Dataloaders)
//            Rust Book §13 (Iterators and Closures)

/// Dataset registry and caption manifests
pub mod loader;

/// Caption text normalisation and encoding
pub mod preprocessor;

/// Precomputed .npy feature tables
pub mod features;

/// Image decoding and normalisation
pub mod images;

/// Burn Dataset of encoded captions
pub mod dataset;

/// Burn Batcher producing padded, length-sorted batches
pub mod batcher;
