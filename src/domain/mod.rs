// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Pure Rust structs, enums and traits that define the core
// concepts of the captioning system.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O
//   - Only plain Rust structs, enums, and traits
//
// Reference: Rust Book §5 (Structs), §10 (Traits)

// Caption annotations and dataset locations
pub mod caption;

// Typed error taxonomy
pub mod error;

// "resnet152,feats.npy" style feature specifications
pub mod feature_spec;

// Teacher forcing policies and the scheduled sampling curve
pub mod forcing;

// Architecture parameters persisted with every checkpoint
pub mod model_params;

// Core abstractions (traits) that other layers implement
pub mod traits;

// Token <-> id mapping
pub mod vocabulary;
