// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// All network code and the training loop.
//
//   backbone/    — CNN feature extractors (alexnet, densenet,
//                  resnet, vgg) with frozen batch norm
//   extractor.rs — one backbone + its pre-trained weights
//   encoder.rs   — concatenated features → linear → bn
//   attention.rs — additive attention over grid locations
//   decoder.rs   — LSTM decoder: plain, spatial and soft
//   packing.rs   — length-sorted packed logits/targets
//   forcing.rs   — per-step input selection (teacher forcing)
//   model.rs     — encoder + decoder, loss, greedy sampling
//   scheduler.rs — reduce-on-plateau learning rate
//   trainer.rs   — epoch loop, optimiser step, checkpoints
//   evaluator.rs — validation loss and caption scoring
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)
//            Xu et al. (2015) Show, Attend and Tell

pub mod backbone;

pub mod extractor;

pub mod encoder;

/// Additive attention over spatial feature grids
pub mod attention;

pub mod decoder;

pub mod packing;

pub mod forcing;

/// Encoder + decoder as a single trainable module
pub mod model;

pub mod scheduler;

/// Epoch loop with validation and checkpointing
pub mod trainer;

/// Validation loss and caption scoring
pub mod evaluator;
