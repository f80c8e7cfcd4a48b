// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// Workflow coordination only: which dataset, which checkpoint,
// which backend. No ML math and no argument parsing here.
//
// Rules for this layer:
//   - Configuration is validated before anything is written
//   - The backend (NdArray or Wgpu) is chosen once per run and
//     everything below is generic over it
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// TrainConfig, RunConfig, model naming
pub mod config;

// Resume, checkpoint parameters, vocabulary, loaders
pub mod session;

// The training workflow
pub mod train_use_case;

// Evaluating saved models
pub mod validate_use_case;
