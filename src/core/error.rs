//! Error types for circuit construction and batch processing.
//!
//! Every public entry point validates its arguments up front and returns one of
//! these before touching any state, so a failed call never leaves partial output.

use thiserror::Error;

/// Coarse classification of an [`ArtError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input: empty or ragged batch, wrong dimension, out-of-range configuration.
    InvalidArgument,
    /// The call is valid in isolation but not in the circuit's current state.
    IllegalState,
}

#[derive(Error, Debug)]
pub enum ArtError {
    /// Empty batch, empty pattern, or empty row set.
    #[error("empty input: {0}")]
    EmptyInput(&'static str),

    /// A pattern or row does not share the expected dimension.
    #[error("dimension mismatch at index {index}: expected {expected}, got {got}")]
    DimensionMismatch {
        expected: usize,
        got: usize,
        index: usize,
    },

    /// Two dimension-major batches that should line up hold different numbers
    /// of patterns (rows of unequal length).
    #[error("ragged batch: row {row} has {got} entries, expected {expected}")]
    RaggedBatch {
        row: usize,
        expected: usize,
        got: usize,
    },

    /// NaN or infinity inside a pattern.
    #[error("non-finite value in pattern {pattern} at position {position}")]
    NonFinite { pattern: usize, position: usize },

    /// A configuration field is outside its valid range.
    #[error("invalid config `{field}`: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },

    /// No batch-option preset with this name.
    #[error("unknown preset `{0}` (expected balanced, throughput or profiling)")]
    UnknownPreset(String),

    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// Malformed JSON configuration.
    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),
}

impl ArtError {
    pub(crate) fn config(field: &'static str, reason: &'static str) -> Self {
        ArtError::InvalidConfig { field, reason }
    }

    /// Map the error onto the invalid-argument / illegal-state taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArtError::IllegalState(_) => ErrorKind::IllegalState,
            _ => ErrorKind::InvalidArgument,
        }
    }
}

/// Result type alias for circuit operations.
pub type Result<T> = core::result::Result<T, ArtError>;
