//! Pattern-major <-> dimension-major layout transforms.
//!
//! A batch of `B` patterns of dimension `D` is normally held pattern-major: one
//! contiguous vector per pattern. Elementwise layer updates want the dual layout,
//! one contiguous row per feature across every pattern, so the same scalar formula
//! can run down a row on SIMD lanes or worker threads.
//!
//! Both transforms are pure data movement. `to_pattern_major(to_dimension_major(p))`
//! returns `p` bit for bit.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::batch::LANE_WIDTH;
use crate::error::{ArtError, Result};
use crate::pattern::{validate_batch, Activation, Pattern};

/// Minimum batch size before batching can pay for the transpose.
pub const MIN_BENEFICIAL_BATCH: usize = 32;
/// Minimum pattern dimension before batching can pay for the transpose.
pub const MIN_BENEFICIAL_DIMENSION: usize = 64;
/// Minimum arithmetic work per feature before batching can pay for the transpose.
pub const MIN_BENEFICIAL_OPS: usize = 5;
/// Projected speedup a batched path must clear to be worth taking.
pub const SPEEDUP_THRESHOLD: f64 = 1.5;

/// Square tile edge for the blocked transpose.
const TILE: usize = 16;

/// Relative cost of moving one element through a transpose, in scalar-op units.
const TRANSPOSE_COST_PER_ELEMENT: f64 = 1.0;

/// A batch stored one row per feature.
///
/// Row `d` holds feature `d` of every pattern; position `p` in that row belongs to
/// pattern `p`. Rows are packed into one flat buffer, so the batch is rectangular
/// by construction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DimMajorBatch {
    dimension: usize,
    batch_size: usize,
    /// Row `d` lives at `data[d * batch_size..(d + 1) * batch_size]`.
    data: Vec<Activation>,
}

impl DimMajorBatch {
    /// An all-zero batch.
    pub fn zeros(dimension: usize, batch_size: usize) -> Result<Self> {
        if dimension == 0 || batch_size == 0 {
            return Err(ArtError::EmptyInput("dimension-major batch"));
        }
        Ok(Self {
            dimension,
            batch_size,
            data: vec![0.0; dimension * batch_size],
        })
    }

    /// Build from explicit rows, checking that they are rectangular.
    ///
    /// A row of the wrong length is a dimension mismatch; `index` names the row.
    pub fn from_rows(rows: &[Vec<Activation>]) -> Result<Self> {
        let first = rows.first().ok_or(ArtError::EmptyInput("rows"))?;
        let batch_size = first.len();
        if batch_size == 0 {
            return Err(ArtError::EmptyInput("row"));
        }

        let mut data = Vec::with_capacity(rows.len() * batch_size);
        for (row, values) in rows.iter().enumerate() {
            if values.len() != batch_size {
                return Err(ArtError::DimensionMismatch {
                    expected: batch_size,
                    got: values.len(),
                    index: row,
                });
            }
            data.extend_from_slice(values);
        }

        Ok(Self {
            dimension: rows.len(),
            batch_size,
            data,
        })
    }

    /// Number of rows (the shared pattern dimension).
    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of patterns (the shared row length).
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[inline]
    pub fn row(&self, d: usize) -> &[Activation] {
        let start = d * self.batch_size;
        &self.data[start..start + self.batch_size]
    }

    #[inline]
    pub fn row_mut(&mut self, d: usize) -> &mut [Activation] {
        let start = d * self.batch_size;
        &mut self.data[start..start + self.batch_size]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Activation]> + '_ {
        self.data.chunks_exact(self.batch_size)
    }

    pub fn rows_mut(&mut self) -> impl Iterator<Item = &mut [Activation]> + '_ {
        self.data.chunks_exact_mut(self.batch_size)
    }

    #[inline]
    pub fn get(&self, d: usize, p: usize) -> Activation {
        self.data[d * self.batch_size + p]
    }

    pub fn as_slice(&self) -> &[Activation] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [Activation] {
        &mut self.data
    }

    /// True when `other` has the same `D x B` shape.
    pub fn same_shape(&self, other: &DimMajorBatch) -> bool {
        self.dimension == other.dimension && self.batch_size == other.batch_size
    }

    /// Copy pattern `p` out of its column into `out` (length `D`).
    pub fn gather_pattern(&self, p: usize, out: &mut [Activation]) {
        debug_assert_eq!(out.len(), self.dimension);
        for (d, slot) in out.iter_mut().enumerate() {
            *slot = self.data[d * self.batch_size + p];
        }
    }

    /// Write `values` (length `D`) back into column `p`.
    pub fn scatter_pattern(&mut self, p: usize, values: &[Activation]) {
        debug_assert_eq!(values.len(), self.dimension);
        for (d, v) in values.iter().enumerate() {
            self.data[d * self.batch_size + p] = *v;
        }
    }

    /// The nested-row form, mostly for tests and display.
    pub fn to_rows(&self) -> Vec<Vec<Activation>> {
        self.rows().map(|r| r.to_vec()).collect()
    }
}

/// Transpose pattern-major patterns into one row per feature.
///
/// Fails on an empty batch or on patterns of unequal dimension.
pub fn to_dimension_major(patterns: &[Pattern]) -> Result<DimMajorBatch> {
    let dimension = validate_batch(patterns, None)?;
    let batch_size = patterns.len();
    let mut data = vec![0.0; dimension * batch_size];

    // Blocked so both the read and the write side stay within a few cache lines.
    for p0 in (0..batch_size).step_by(TILE) {
        let p1 = (p0 + TILE).min(batch_size);
        for d0 in (0..dimension).step_by(TILE) {
            let d1 = (d0 + TILE).min(dimension);
            for (p, pattern) in patterns.iter().enumerate().take(p1).skip(p0) {
                let src = pattern.as_slice();
                for d in d0..d1 {
                    data[d * batch_size + p] = src[d];
                }
            }
        }
    }

    Ok(DimMajorBatch {
        dimension,
        batch_size,
        data,
    })
}

/// Transpose a dimension-major batch back into one pattern per column.
pub fn to_pattern_major(batch: &DimMajorBatch) -> Vec<Pattern> {
    let mut out = vec![vec![0.0; batch.dimension]; batch.batch_size];

    for d0 in (0..batch.dimension).step_by(TILE) {
        let d1 = (d0 + TILE).min(batch.dimension);
        for p0 in (0..batch.batch_size).step_by(TILE) {
            let p1 = (p0 + TILE).min(batch.batch_size);
            for d in d0..d1 {
                let row = batch.row(d);
                for p in p0..p1 {
                    out[p][d] = row[p];
                }
            }
        }
    }

    out.into_iter().map(Pattern::new).collect()
}

/// [`to_pattern_major`] for the raw nested-row form.
///
/// Fails on an empty row set or on rows of unequal length.
pub fn rows_to_pattern_major(rows: &[Vec<Activation>]) -> Result<Vec<Pattern>> {
    let batch = DimMajorBatch::from_rows(rows)?;
    Ok(to_pattern_major(&batch))
}

/// Projected speedup of running `ops_per_dimension` scalar ops per feature on
/// the lane-parallel path, transposes included, over the per-pattern path.
pub fn projected_speedup(batch_size: usize, dimension: usize, ops_per_dimension: usize) -> f64 {
    if batch_size == 0 || dimension == 0 || ops_per_dimension == 0 {
        return 0.0;
    }
    let b = batch_size as f64;
    let d = dimension as f64;
    let ops = ops_per_dimension as f64;

    let scalar = b * d * ops;
    let lane_groups = batch_size.div_ceil(LANE_WIDTH) as f64;
    let vector = lane_groups * d * ops;
    let transpose = 2.0 * b * d * TRANSPOSE_COST_PER_ELEMENT;
    scalar / (vector + transpose)
}

/// Whether transposing a batch is amortized by the vectorized work that follows.
///
/// Advisory only: both code paths give the same results.
pub fn is_batching_beneficial(
    batch_size: usize,
    dimension: usize,
    ops_per_dimension: usize,
) -> bool {
    if batch_size < MIN_BENEFICIAL_BATCH
        || dimension < MIN_BENEFICIAL_DIMENSION
        || ops_per_dimension < MIN_BENEFICIAL_OPS
    {
        return false;
    }
    projected_speedup(batch_size, dimension, ops_per_dimension) > SPEEDUP_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::Prng;

    fn grid(rows: &[&[f64]]) -> Vec<Pattern> {
        rows.iter().map(|r| Pattern::from(*r)).collect()
    }

    #[test]
    fn transposes_square_example() {
        let patterns = grid(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0], &[7.0, 8.0, 9.0]]);
        let batch = to_dimension_major(&patterns).unwrap();
        assert_eq!(
            batch.to_rows(),
            vec![
                vec![1.0, 4.0, 7.0],
                vec![2.0, 5.0, 8.0],
                vec![3.0, 6.0, 9.0]
            ]
        );
        assert_eq!(to_pattern_major(&batch), patterns);
    }

    #[test]
    fn roundtrip_is_exact_across_tile_edges() {
        let mut rng = Prng::new(11);
        for &(b, d) in &[(1, 1), (3, 17), (16, 16), (33, 5), (40, 70)] {
            let patterns = rng.batch(b, d);
            let batch = to_dimension_major(&patterns).unwrap();
            assert_eq!(batch.dimension(), d);
            assert_eq!(batch.batch_size(), b);
            for (p, pattern) in patterns.iter().enumerate() {
                for (dd, v) in pattern.as_slice().iter().enumerate() {
                    assert_eq!(batch.get(dd, p).to_bits(), v.to_bits());
                }
            }
            assert_eq!(to_pattern_major(&batch), patterns);
        }
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let patterns = grid(&[&[1.0, 2.0], &[3.0]]);
        assert!(matches!(
            to_dimension_major(&patterns),
            Err(ArtError::DimensionMismatch { index: 1, .. })
        ));
        assert!(matches!(
            to_dimension_major(&[]),
            Err(ArtError::EmptyInput(_))
        ));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let rows = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(matches!(
            rows_to_pattern_major(&rows),
            Err(ArtError::DimensionMismatch {
                expected: 2,
                got: 1,
                index: 1
            })
        ));
        assert!(rows_to_pattern_major(&[]).is_err());
    }

    #[test]
    fn zeros_has_the_requested_shape() {
        let batch = DimMajorBatch::zeros(3, 5).unwrap();
        assert_eq!(batch.dimension(), 3);
        assert_eq!(batch.batch_size(), 5);
        assert!(batch.as_slice().iter().all(|v| *v == 0.0));
        assert_eq!(to_pattern_major(&batch), vec![Pattern::filled(3, 0.0); 5]);
        assert!(matches!(
            DimMajorBatch::zeros(0, 5),
            Err(ArtError::EmptyInput(_))
        ));
        assert!(DimMajorBatch::zeros(3, 0).is_err());
    }

    #[test]
    fn gather_and_scatter_touch_one_column() {
        let patterns = grid(&[&[1.0, 2.0], &[3.0, 4.0], &[5.0, 6.0]]);
        let mut batch = to_dimension_major(&patterns).unwrap();
        let mut buf = [0.0; 2];
        batch.gather_pattern(1, &mut buf);
        assert_eq!(buf, [3.0, 4.0]);

        batch.scatter_pattern(1, &[9.0, 8.0]);
        let back = to_pattern_major(&batch);
        assert_eq!(back[0].as_slice(), &[1.0, 2.0]);
        assert_eq!(back[1].as_slice(), &[9.0, 8.0]);
        assert_eq!(back[2].as_slice(), &[5.0, 6.0]);
    }

    #[test]
    fn batching_heuristic_thresholds() {
        assert!(!is_batching_beneficial(16, 32, 10));
        assert!(is_batching_beneficial(64, 128, 10));
        assert!(!is_batching_beneficial(64, 128, 4));
        assert!(!is_batching_beneficial(31, 128, 50));
        assert!(!is_batching_beneficial(64, 63, 50));
        assert!(projected_speedup(64, 128, 10) > SPEEDUP_THRESHOLD);
    }
}
