//! # laminart
//!
//! A laminar cortical ART circuit: shunting feature dynamics feeding a Fuzzy-ART
//! style category search, with a batched front end that processes many input
//! patterns at once.
//!
//! ## Quick Start
//!
//! ```
//! use laminart::prelude::*;
//!
//! let cfg = CircuitConfig::with_size(4, 8)
//!     .with_vigilance(0.8)
//!     .with_feature_layer(LayerUpdate::shunting(ShuntingParams::default(), 0.1, 2));
//! let mut circuit = Circuit::with_options(cfg, BatchOptions::balanced()).unwrap();
//!
//! let batch = vec![
//!     Pattern::from(vec![0.9, 0.1, 0.0, 0.2]),
//!     Pattern::from(vec![0.1, 0.8, 0.7, 0.0]),
//! ];
//! let result = circuit.process_batch(&batch).unwrap();
//! assert_eq!(result.results.len(), 2);
//! assert!(result.results[0].resonated);
//! ```
//!
//! ## Feature Flags
//!
//! - `std` (default): wall-clock stage timings in [`circuit::BatchStats`]
//! - `serde` (default): JSON configs, presets and serializable results
//! - `parallel`: Enable multi-threaded batch steps via rayon
//! - `simd`: Enable `f64x4` row kernels via the `wide` crate
//!
//! ## Modules
//!
//! - [`pattern`] and [`layout`]: input vectors and the dimension-major batch layout
//! - [`shunting`]: single-pattern shunting dynamics
//! - [`batch`]: the same dynamics over a whole batch
//! - [`resonance`]: category search, resonance and learning
//! - [`circuit`]: configuration, presets and `process_batch`
//! - [`observer`]: Read-only observation adapters

#[path = "core/error.rs"]
pub mod error;

#[path = "core/pattern.rs"]
pub mod pattern;

#[path = "core/layout.rs"]
pub mod layout;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/shunting.rs"]
pub mod shunting;

#[path = "core/batch.rs"]
pub mod batch;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/resonance.rs"]
pub mod resonance;

#[path = "core/circuit.rs"]
pub mod circuit;

pub mod observer;

/// Prelude module for convenient imports.
///
/// ```
/// use laminart::prelude::*;
/// ```
pub mod prelude {
    pub use crate::batch::{BatchDynamics, ExecutionTier, StepReport};
    pub use crate::circuit::{
        BatchOptions, BatchPolicy, BatchResult, BatchStats, Circuit, CircuitConfig, PatternResult,
    };
    pub use crate::error::{ArtError, ErrorKind, Result};
    pub use crate::layout::{
        is_batching_beneficial, projected_speedup, to_dimension_major, to_pattern_major,
        DimMajorBatch,
    };
    pub use crate::observer::{CircuitAdapter, CircuitSnapshot};
    pub use crate::pattern::{Activation, Pattern};
    pub use crate::resonance::{
        match_score, CategoryId, ExhaustionPolicy, ResonanceSearch, SearchConfig, SearchOutcome,
        SearchState,
    };
    pub use crate::shunting::{step_pattern, LayerUpdate, ShuntingParams};
}
