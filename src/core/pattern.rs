//! Immutable input vectors and batch validation.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ArtError, Result};

/// Type alias for one activation or input value (conventionally in [0, 1]).
pub type Activation = f64;

/// A fixed-length input vector.
///
/// Patterns are immutable once built; every layer update produces a new pattern
/// rather than editing one in place.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Pattern {
    values: Box<[Activation]>,
}

impl Pattern {
    pub fn new(values: Vec<Activation>) -> Self {
        Self {
            values: values.into_boxed_slice(),
        }
    }

    /// A pattern with every entry set to `value`.
    pub fn filled(dimension: usize, value: Activation) -> Self {
        Self::new(vec![value; dimension])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Activation] {
        &self.values
    }

    /// L1 norm. Inputs are expected to be non-negative, so this is a plain sum.
    pub fn norm(&self) -> Activation {
        self.values.iter().sum()
    }

    pub fn into_vec(self) -> Vec<Activation> {
        self.values.into_vec()
    }
}

impl From<Vec<Activation>> for Pattern {
    fn from(values: Vec<Activation>) -> Self {
        Self::new(values)
    }
}

impl From<&[Activation]> for Pattern {
    fn from(values: &[Activation]) -> Self {
        Self::new(values.to_vec())
    }
}

impl AsRef<[Activation]> for Pattern {
    fn as_ref(&self) -> &[Activation] {
        &self.values
    }
}

/// Check a batch before any of it is processed.
///
/// Returns the shared dimension. When `expected` is given, every pattern must
/// have exactly that many entries. All values must be finite.
pub fn validate_batch(patterns: &[Pattern], expected: Option<usize>) -> Result<usize> {
    let first = patterns.first().ok_or(ArtError::EmptyInput("batch"))?;
    let dimension = expected.unwrap_or(first.len());
    if dimension == 0 {
        return Err(ArtError::EmptyInput("pattern"));
    }

    for (index, p) in patterns.iter().enumerate() {
        if p.len() != dimension {
            return Err(ArtError::DimensionMismatch {
                expected: dimension,
                got: p.len(),
                index,
            });
        }
        if let Some(position) = p.as_slice().iter().position(|v| !v.is_finite()) {
            return Err(ArtError::NonFinite {
                pattern: index,
                position,
            });
        }
    }
    Ok(dimension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_reports_first_bad_pattern() {
        let batch = vec![
            Pattern::from(vec![0.1, 0.2]),
            Pattern::from(vec![0.3, 0.4]),
            Pattern::from(vec![0.5]),
        ];
        match validate_batch(&batch, None) {
            Err(ArtError::DimensionMismatch {
                expected: 2,
                got: 1,
                index: 2,
            }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_empty_and_non_finite() {
        assert!(matches!(
            validate_batch(&[], None),
            Err(ArtError::EmptyInput(_))
        ));
        let batch = vec![Pattern::from(vec![0.0, f64::NAN])];
        assert!(matches!(
            validate_batch(&batch, None),
            Err(ArtError::NonFinite {
                pattern: 0,
                position: 1
            })
        ));
    }

    #[test]
    fn validate_against_expected_dimension() {
        let batch = vec![Pattern::filled(3, 0.5)];
        assert_eq!(validate_batch(&batch, Some(3)).unwrap(), 3);
        assert!(validate_batch(&batch, Some(4)).is_err());
    }
}
