//! Batched shunting dynamics over dimension-major batches.
//!
//! [`BatchDynamics::step`] advances every pattern of a batch by one Euler step and
//! must give the same result as calling [`crate::shunting::step_pattern`] once per
//! pattern. Two paths get there:
//!
//! - **Elementwise** (both lateral strengths zero): a unit's update reads only its
//!   own activation and input, so each dimension-major row is updated with one
//!   scalar formula applied down the row. Rows are disjoint, which is what lets
//!   them go to SIMD lanes or rayon workers.
//! - **Per-pattern** (any lateral strength nonzero): a unit's update reads other
//!   units of the same pattern, and those live in other rows. Each pattern is
//!   gathered out of its column, stepped exactly as the single-pattern engine
//!   does, and scattered back.
//!
//! Only numeric sub-steps of one tick are batched here. Nothing in this module
//! touches category templates.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "simd")]
use wide::f64x4;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tracing::debug;

use crate::error::{ArtError, Result};
use crate::layout::DimMajorBatch;
use crate::pattern::Activation;
use crate::shunting::{
    step_pattern_into, update_unit, validate_dt, LateralKernel, LayerUpdate, ShuntingParams,
};

/// Number of `f64` lanes processed together by the vectorized row kernel.
///
/// Fixed at build time to match `wide::f64x4`.
pub const LANE_WIDTH: usize = 4;

/// Execution tier for batched layer updates.
///
/// - `Scalar`: Single-threaded, no SIMD (baseline, deterministic timing)
/// - `Simd`: Single-threaded with `f64x4` lanes down each row
/// - `Parallel`: Rows (or patterns) split across rayon workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ExecutionTier {
    /// Single-threaded scalar execution (default, works everywhere).
    #[default]
    Scalar,
    /// Single-threaded with SIMD vectorization (requires `simd` feature).
    Simd,
    /// Multi-threaded parallel execution (requires `parallel` feature).
    Parallel,
}

impl ExecutionTier {
    /// The tier that will actually run, given the compiled features.
    pub fn effective(self) -> ExecutionTier {
        match self {
            ExecutionTier::Scalar => ExecutionTier::Scalar,
            ExecutionTier::Simd => {
                #[cfg(feature = "simd")]
                {
                    ExecutionTier::Simd
                }
                #[cfg(not(feature = "simd"))]
                {
                    ExecutionTier::Scalar
                }
            }
            ExecutionTier::Parallel => {
                #[cfg(feature = "parallel")]
                {
                    ExecutionTier::Parallel
                }
                #[cfg(not(feature = "parallel"))]
                {
                    ExecutionTier::Scalar
                }
            }
        }
    }

    /// Best tier the build supports.
    pub fn auto_select() -> ExecutionTier {
        #[cfg(feature = "parallel")]
        {
            ExecutionTier::Parallel
        }

        #[cfg(all(not(feature = "parallel"), feature = "simd"))]
        {
            ExecutionTier::Simd
        }

        #[cfg(all(not(feature = "parallel"), not(feature = "simd")))]
        {
            ExecutionTier::Scalar
        }
    }
}

/// Which algorithm a step used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StepPath {
    /// Independent scalar updates down each dimension-major row.
    Elementwise,
    /// Gather, single-pattern step, scatter.
    PerPattern,
}

/// What one or more batched steps did. Informational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepReport {
    /// Steps taken.
    pub steps: u64,
    /// Unit updates done on the elementwise (lane-parallel) path.
    pub lane_operations: u64,
    /// `f64x4` vector updates issued (zero unless the SIMD kernel ran).
    pub vector_operations: u64,
    /// Unit updates done on the per-pattern path.
    pub per_pattern_operations: u64,
    /// Elements moved by gather/scatter on the per-pattern path.
    pub gathered_elements: u64,
}

impl StepReport {
    pub fn merge(&mut self, other: &StepReport) {
        self.steps += other.steps;
        self.lane_operations += other.lane_operations;
        self.vector_operations += other.vector_operations;
        self.per_pattern_operations += other.per_pattern_operations;
        self.gathered_elements += other.gathered_elements;
    }

    /// Fraction of unit updates that went through full vector lanes.
    pub fn lane_utilization(&self) -> f64 {
        let total = self.lane_operations + self.per_pattern_operations;
        if total == 0 {
            return 0.0;
        }
        (self.vector_operations * LANE_WIDTH as u64) as f64 / total as f64
    }
}

/// Batch dynamics engine.
///
/// Owns no state beyond its dispatch settings; every step allocates a fresh
/// output batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchDynamics {
    tier: ExecutionTier,
    /// Below this many rows (elementwise) or patterns (per-pattern) the parallel
    /// tier runs inline instead of spawning work.
    parallel_min_items: usize,
}

impl Default for BatchDynamics {
    fn default() -> Self {
        Self::new(ExecutionTier::Scalar)
    }
}

impl BatchDynamics {
    pub const DEFAULT_PARALLEL_MIN_ITEMS: usize = 8;

    pub fn new(tier: ExecutionTier) -> Self {
        Self {
            tier,
            parallel_min_items: Self::DEFAULT_PARALLEL_MIN_ITEMS,
        }
    }

    pub fn with_parallel_min_items(mut self, items: usize) -> Self {
        self.parallel_min_items = items.max(1);
        self
    }

    pub fn parallel_min_items(&self) -> usize {
        self.parallel_min_items
    }

    /// Requested tier.
    pub fn execution_tier(&self) -> ExecutionTier {
        self.tier
    }

    /// Tier that will run once compile-time features are accounted for.
    pub fn effective_execution_tier(&self) -> ExecutionTier {
        self.tier.effective()
    }

    /// Advance every pattern of `state` by one step.
    ///
    /// `input`, when given, is the external drive with the same shape as `state`.
    pub fn step(
        &self,
        state: &DimMajorBatch,
        input: Option<&DimMajorBatch>,
        params: &ShuntingParams,
        dt: f64,
    ) -> Result<DimMajorBatch> {
        self.step_reported(state, input, params, dt)
            .map(|(next, _)| next)
    }

    /// [`BatchDynamics::step`] plus a report of the work done.
    pub fn step_reported(
        &self,
        state: &DimMajorBatch,
        input: Option<&DimMajorBatch>,
        params: &ShuntingParams,
        dt: f64,
    ) -> Result<(DimMajorBatch, StepReport)> {
        if let Some(inp) = input {
            if inp.dimension() != state.dimension() {
                return Err(ArtError::DimensionMismatch {
                    expected: state.dimension(),
                    got: inp.dimension(),
                    index: 0,
                });
            }
            if !state.same_shape(inp) {
                return Err(ArtError::RaggedBatch {
                    row: 0,
                    expected: state.batch_size(),
                    got: inp.batch_size(),
                });
            }
        }
        params.validate()?;
        validate_dt(dt)?;

        let kernel = if params.is_separable() {
            None
        } else {
            Some(LateralKernel::new(params, state.dimension()))
        };
        Ok(self.step_unchecked(state, input, params, kernel.as_ref(), dt))
    }

    fn step_unchecked(
        &self,
        state: &DimMajorBatch,
        input: Option<&DimMajorBatch>,
        params: &ShuntingParams,
        kernel: Option<&LateralKernel>,
        dt: f64,
    ) -> (DimMajorBatch, StepReport) {
        let mut out = state.clone();
        let tier = self.effective_execution_tier();
        let path = if kernel.is_some() {
            StepPath::PerPattern
        } else {
            StepPath::Elementwise
        };
        debug!(
            ?tier,
            ?path,
            dimension = state.dimension(),
            batch = state.batch_size(),
            "batch step"
        );

        let mut report = match kernel {
            None => self.step_elementwise(tier, state, input, params, dt, &mut out),
            Some(k) => self.step_per_pattern(tier, state, input, params, k, dt, &mut out),
        };
        report.steps = 1;
        (out, report)
    }

    fn step_elementwise(
        &self,
        tier: ExecutionTier,
        state: &DimMajorBatch,
        input: Option<&DimMajorBatch>,
        params: &ShuntingParams,
        dt: f64,
        out: &mut DimMajorBatch,
    ) -> StepReport {
        let b = state.batch_size();
        let units = (state.dimension() * b) as u64;
        let lanes = matches!(tier, ExecutionTier::Simd | ExecutionTier::Parallel);

        let vector_operations = match tier {
            #[cfg(feature = "parallel")]
            ExecutionTier::Parallel if state.dimension() >= self.parallel_min_items => {
                let input_rows = input.map(DimMajorBatch::as_slice);
                out.as_mut_slice()
                    .par_chunks_mut(b)
                    .enumerate()
                    .map(|(d, row_out)| {
                        let row_in = input_rows.map(|all| &all[d * b..(d + 1) * b]);
                        elementwise_row(state.row(d), row_in, params, dt, row_out, lanes)
                    })
                    .sum::<u64>()
            }
            _ => {
                let mut vector_operations = 0;
                for (d, row_out) in out.rows_mut().enumerate() {
                    let row_in = input.map(|inp| inp.row(d));
                    vector_operations +=
                        elementwise_row(state.row(d), row_in, params, dt, row_out, lanes);
                }
                vector_operations
            }
        };

        StepReport {
            lane_operations: units,
            vector_operations,
            ..Default::default()
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step_per_pattern(
        &self,
        tier: ExecutionTier,
        state: &DimMajorBatch,
        input: Option<&DimMajorBatch>,
        params: &ShuntingParams,
        kernel: &LateralKernel,
        dt: f64,
        out: &mut DimMajorBatch,
    ) -> StepReport {
        let dim = state.dimension();
        let batch = state.batch_size();

        let step_one = |p: usize, x: &mut Vec<Activation>, j: &mut Vec<Activation>| {
            let mut next = vec![0.0; dim];
            state.gather_pattern(p, x);
            let drive = match input {
                Some(inp) => {
                    inp.gather_pattern(p, j);
                    Some(j.as_slice())
                }
                None => None,
            };
            step_pattern_into(kernel, x, drive, params, dt, &mut next);
            next
        };

        match tier {
            #[cfg(feature = "parallel")]
            ExecutionTier::Parallel if batch >= self.parallel_min_items => {
                // Each worker owns one pattern index; results are scattered after the join.
                let results: Vec<Vec<Activation>> = (0..batch)
                    .into_par_iter()
                    .map_init(
                        || (vec![0.0; dim], vec![0.0; dim]),
                        |(x, j), p| step_one(p, x, j),
                    )
                    .collect();
                for (p, next) in results.iter().enumerate() {
                    out.scatter_pattern(p, next);
                }
            }
            _ => {
                let mut x = vec![0.0; dim];
                let mut j = vec![0.0; dim];
                for p in 0..batch {
                    let next = step_one(p, &mut x, &mut j);
                    out.scatter_pattern(p, &next);
                }
            }
        }

        let units = (dim * batch) as u64;
        let gathered = if input.is_some() { 3 * units } else { 2 * units };
        StepReport {
            per_pattern_operations: units,
            gathered_elements: gathered,
            ..Default::default()
        }
    }

    /// Run a layer update on a whole dimension-major batch.
    ///
    /// Agrees with [`LayerUpdate::apply`] on every column.
    pub fn apply_layer(
        &self,
        layer: &LayerUpdate,
        input: &DimMajorBatch,
    ) -> Result<(DimMajorBatch, StepReport)> {
        layer.validate()?;
        match layer {
            LayerUpdate::Passthrough => Ok((input.clone(), StepReport::default())),
            LayerUpdate::Shunting { params, dt, steps } => {
                let kernel = if params.is_separable() {
                    None
                } else {
                    Some(LateralKernel::new(params, input.dimension()))
                };

                let mut state = input.clone();
                for v in state.as_mut_slice() {
                    *v = v.clamp(params.floor, params.ceiling);
                }

                let mut report = StepReport::default();
                for _ in 0..*steps {
                    let (next, r) =
                        self.step_unchecked(&state, Some(input), params, kernel.as_ref(), *dt);
                    report.merge(&r);
                    state = next;
                }
                Ok((state, report))
            }
        }
    }
}

/// Update one dimension-major row. Returns the number of vector updates issued.
#[inline]
fn elementwise_row(
    state: &[Activation],
    input: Option<&[Activation]>,
    params: &ShuntingParams,
    dt: f64,
    out: &mut [Activation],
    lanes: bool,
) -> u64 {
    #[cfg(feature = "simd")]
    {
        if lanes {
            return elementwise_row_lanes(state, input, params, dt, out);
        }
    }
    #[cfg(not(feature = "simd"))]
    let _ = lanes;

    elementwise_row_scalar(state, input, params, dt, out, 0);
    0
}

/// Scalar row update starting at `start`. Also serves as the SIMD tail.
#[inline]
fn elementwise_row_scalar(
    state: &[Activation],
    input: Option<&[Activation]>,
    params: &ShuntingParams,
    dt: f64,
    out: &mut [Activation],
    start: usize,
) {
    for p in start..state.len() {
        let external = input.map_or(0.0, |inp| inp[p]);
        out[p] = update_unit(state[p], 0.0, 0.0, external, params, dt);
    }
}

/// `f64x4` row update.
///
/// Mirrors [`update_unit`] operation for operation (no fused multiply-add), so
/// every lane matches the scalar path exactly.
#[cfg(feature = "simd")]
fn elementwise_row_lanes(
    state: &[Activation],
    input: Option<&[Activation]>,
    params: &ShuntingParams,
    dt: f64,
    out: &mut [Activation],
) -> u64 {
    let n = state.len();
    let simd_end = n - (n % LANE_WIDTH);

    let zero = f64x4::splat(0.0);
    let neg_decay = f64x4::splat(-params.decay);
    let ceiling = f64x4::splat(params.ceiling);
    let floor = f64x4::splat(params.floor);
    let gain = f64x4::splat(params.self_excitation);
    let dt_v = f64x4::splat(dt);

    let mut issued = 0;
    for i in (0..simd_end).step_by(LANE_WIDTH) {
        let x = f64x4::from([state[i], state[i + 1], state[i + 2], state[i + 3]]);
        let external = match input {
            Some(inp) => f64x4::from([inp[i], inp[i + 1], inp[i + 2], inp[i + 3]]),
            None => zero,
        };

        let excite = (gain * x + zero + external).max(zero);
        let inhibit = zero.max(zero);
        let dx = neg_decay * x + (ceiling - x) * excite - (x - floor) * inhibit;
        let next = (x + dt_v * dx).max(floor).min(ceiling);

        out[i..(i + LANE_WIDTH)].copy_from_slice(&next.to_array());
        issued += 1;
    }

    // Handle remainder (tail elements).
    elementwise_row_scalar(state, input, params, dt, out, simd_end);
    issued
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{to_dimension_major, to_pattern_major};
    use crate::pattern::Pattern;
    use crate::prng::Prng;
    use crate::shunting::step_pattern;

    const TIERS: [ExecutionTier; 3] = [
        ExecutionTier::Scalar,
        ExecutionTier::Simd,
        ExecutionTier::Parallel,
    ];

    fn reference(
        patterns: &[Pattern],
        inputs: &[Pattern],
        params: &ShuntingParams,
        dt: f64,
    ) -> Vec<Vec<f64>> {
        patterns
            .iter()
            .zip(inputs)
            .map(|(x, j)| step_pattern(x.as_slice(), Some(j.as_slice()), params, dt).unwrap())
            .collect()
    }

    fn columns(batch: &DimMajorBatch) -> Vec<Vec<f64>> {
        to_pattern_major(batch)
            .into_iter()
            .map(Pattern::into_vec)
            .collect()
    }

    #[test]
    fn elementwise_matches_single_pattern_engine() {
        let params = ShuntingParams {
            decay: 0.3,
            self_excitation: 0.7,
            ..Default::default()
        };
        let mut rng = Prng::new(21);
        for &(b, d) in &[(1, 1), (5, 3), (9, 13), (64, 7)] {
            let patterns = rng.batch(b, d);
            let inputs = rng.batch(b, d);
            let state = to_dimension_major(&patterns).unwrap();
            let drive = to_dimension_major(&inputs).unwrap();
            let expected = reference(&patterns, &inputs, &params, 0.05);

            for tier in TIERS {
                let engine = BatchDynamics::new(tier).with_parallel_min_items(1);
                let (next, report) = engine
                    .step_reported(&state, Some(&drive), &params, 0.05)
                    .unwrap();
                let got = columns(&next);
                for (g, e) in got.iter().flatten().zip(expected.iter().flatten()) {
                    assert!((g - e).abs() < 1e-9, "{tier:?}: {g} vs {e}");
                    assert!(g == e, "{tier:?}: not exact: {g} vs {e}");
                }
                assert_eq!(report.lane_operations, (b * d) as u64);
                assert_eq!(report.per_pattern_operations, 0);
            }
        }
    }

    #[test]
    fn lateral_path_matches_single_pattern_engine() {
        let params = ShuntingParams {
            decay: 0.2,
            self_excitation: 0.4,
            ..Default::default()
        }
        .with_lateral(0.6, 1.5, 1.1, 3.0);
        let mut rng = Prng::new(99);
        let patterns = rng.batch(17, 11);
        let inputs = rng.batch(17, 11);
        let state = to_dimension_major(&patterns).unwrap();
        let drive = to_dimension_major(&inputs).unwrap();
        let expected = reference(&patterns, &inputs, &params, 0.1);

        for tier in TIERS {
            let engine = BatchDynamics::new(tier).with_parallel_min_items(2);
            let (next, report) = engine
                .step_reported(&state, Some(&drive), &params, 0.1)
                .unwrap();
            assert_eq!(columns(&next), expected, "{tier:?}");
            assert_eq!(report.lane_operations, 0);
            assert_eq!(report.per_pattern_operations, 17 * 11);
        }
    }

    #[cfg(feature = "simd")]
    #[test]
    fn lane_kernel_agrees_with_scalar_tail() {
        // Rows of every length around the lane width exercise both the vector
        // body and the scalar remainder.
        let params = ShuntingParams {
            decay: 0.9,
            self_excitation: 1.3,
            ..Default::default()
        }
        .with_bounds(-0.5, 1.0);
        let mut rng = Prng::new(4);
        for n in 1..=(3 * LANE_WIDTH + 1) {
            let state: Vec<f64> = (0..n).map(|_| rng.gen_range_f64(-1.0, 2.0)).collect();
            let input: Vec<f64> = (0..n).map(|_| rng.gen_range_f64(0.0, 1.0)).collect();
            let mut scalar = vec![0.0; n];
            let mut laned = vec![0.0; n];
            elementwise_row_scalar(&state, Some(&input), &params, 0.2, &mut scalar, 0);
            let issued = elementwise_row_lanes(&state, Some(&input), &params, 0.2, &mut laned);
            assert_eq!(scalar, laned, "row length {n}");
            assert_eq!(issued as usize, n / LANE_WIDTH);
        }
    }

    #[cfg(not(feature = "simd"))]
    #[test]
    fn lane_request_without_simd_runs_scalar() {
        let params = ShuntingParams::default().with_self_excitation(0.5);
        let state = [0.1, 0.4, 0.9, 0.3, 0.7];
        let mut out = [0.0; 5];
        assert_eq!(elementwise_row(&state, None, &params, 0.1, &mut out, true), 0);
        for (o, x) in out.iter().zip(&state) {
            assert_eq!(*o, update_unit(*x, 0.0, 0.0, 0.0, &params, 0.1));
        }
    }

    #[test]
    fn without_input_matches_undriven_single_step() {
        let params = ShuntingParams::default().with_self_excitation(0.5);
        let patterns = Prng::new(8).batch(6, 5);
        let state = to_dimension_major(&patterns).unwrap();
        let next = BatchDynamics::default()
            .step(&state, None, &params, 0.1)
            .unwrap();
        for (p, pattern) in patterns.iter().enumerate() {
            let single = step_pattern(pattern.as_slice(), None, &params, 0.1).unwrap();
            assert_eq!(columns(&next)[p], single);
        }
    }

    #[test]
    fn rejects_mismatched_drive_and_bad_params() {
        let state = to_dimension_major(&Prng::new(1).batch(4, 3)).unwrap();
        let drive = to_dimension_major(&Prng::new(2).batch(4, 2)).unwrap();
        let engine = BatchDynamics::default();
        let params = ShuntingParams::default();
        assert!(matches!(
            engine.step(&state, Some(&drive), &params, 0.1),
            Err(ArtError::DimensionMismatch { expected: 3, got: 2, .. })
        ));
        let short = to_dimension_major(&Prng::new(3).batch(2, 3)).unwrap();
        assert!(matches!(
            engine.step(&state, Some(&short), &params, 0.1),
            Err(ArtError::RaggedBatch { expected: 4, got: 2, .. })
        ));
        assert!(engine.step(&state, None, &params, -1.0).is_err());
        let bad = params.with_bounds(2.0, 1.0);
        assert!(engine.step(&state, None, &bad, 0.1).is_err());
    }

    #[test]
    fn batched_layer_matches_per_pattern_layer() {
        let mut rng = Prng::new(31);
        let patterns = rng.batch(10, 9);
        let batch = to_dimension_major(&patterns).unwrap();
        let layers = [
            LayerUpdate::Passthrough,
            LayerUpdate::shunting(ShuntingParams::default().with_decay(0.4), 0.1, 4),
            LayerUpdate::shunting(
                ShuntingParams::default().with_lateral(0.3, 1.0, 0.8, 2.0),
                0.05,
                3,
            ),
        ];
        for layer in layers {
            for tier in TIERS {
                let (out, report) = BatchDynamics::new(tier)
                    .apply_layer(&layer, &batch)
                    .unwrap();
                for (p, pattern) in patterns.iter().enumerate() {
                    let single = layer.apply(pattern.as_slice()).unwrap();
                    assert_eq!(columns(&out)[p], single, "{layer:?} {tier:?}");
                }
                let expected_steps = match layer {
                    LayerUpdate::Passthrough => 0,
                    LayerUpdate::Shunting { steps, .. } => steps as u64,
                };
                assert_eq!(report.steps, expected_steps);
            }
        }
    }

    #[test]
    fn tier_fallback_follows_features() {
        assert_eq!(ExecutionTier::Scalar.effective(), ExecutionTier::Scalar);
        let simd = ExecutionTier::Simd.effective();
        if cfg!(feature = "simd") {
            assert_eq!(simd, ExecutionTier::Simd);
        } else {
            assert_eq!(simd, ExecutionTier::Scalar);
        }
        let par = ExecutionTier::Parallel.effective();
        if cfg!(feature = "parallel") {
            assert_eq!(par, ExecutionTier::Parallel);
        } else {
            assert_eq!(par, ExecutionTier::Scalar);
        }
        assert_eq!(ExecutionTier::auto_select().effective(), ExecutionTier::auto_select());
    }
}
