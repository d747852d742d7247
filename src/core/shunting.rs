//! Single-pattern shunting dynamics.
//!
//! One explicit-Euler step of
//!
//! ```text
//! dx_i/dt = -A x_i + (B - x_i) E_i - (x_i - C) I_i
//!
//! E_i = max(0, s x_i + sum_{j != i} We(|i-j|) x_j + J_i)
//! I_i = max(0,         sum_{j != i} Wi(|i-j|) x_j)
//! W(d) = strength * exp(-d^2 / (2 range^2))
//! ```
//!
//! with decay `A`, ceiling `B`, floor `C`, self-excitation `s` and external drive `J`,
//! followed by a clamp into `[C, B]`.
//!
//! With both lateral strengths at zero the sums vanish and each unit only sees
//! its own activation and input. The batch engine relies on that: it is the only
//! case where a step may be computed down a dimension-major row instead of per
//! pattern. Any new lateral term has to be checked against that split.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ArtError, Result};
use crate::pattern::Activation;

/// Per-layer shunting parameters. Read-only for the duration of a step.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ShuntingParams {
    /// Passive decay rate (A).
    pub decay: f64,
    /// Upper activation bound (B).
    pub ceiling: f64,
    /// Lower activation bound (C).
    pub floor: f64,
    /// Gain of a unit's own activation in its excitatory drive.
    pub self_excitation: f64,
    /// On-surround excitation strength. Zero disables lateral excitation.
    pub excitatory_strength: f64,
    /// Gaussian sigma of lateral excitation, in unit indices.
    pub excitatory_range: f64,
    /// Off-surround inhibition strength. Zero disables lateral inhibition.
    pub inhibitory_strength: f64,
    /// Gaussian sigma of lateral inhibition, in unit indices.
    pub inhibitory_range: f64,
}

impl Default for ShuntingParams {
    fn default() -> Self {
        Self {
            decay: 1.0,
            ceiling: 1.0,
            floor: 0.0,
            self_excitation: 0.0,
            excitatory_strength: 0.0,
            excitatory_range: 1.0,
            inhibitory_strength: 0.0,
            inhibitory_range: 1.0,
        }
    }
}

impl ShuntingParams {
    /// Add on-center/off-surround lateral interactions.
    pub fn with_lateral(
        mut self,
        excitatory_strength: f64,
        excitatory_range: f64,
        inhibitory_strength: f64,
        inhibitory_range: f64,
    ) -> Self {
        self.excitatory_strength = excitatory_strength;
        self.excitatory_range = excitatory_range;
        self.inhibitory_strength = inhibitory_strength;
        self.inhibitory_range = inhibitory_range;
        self
    }

    pub fn with_bounds(mut self, floor: f64, ceiling: f64) -> Self {
        self.floor = floor;
        self.ceiling = ceiling;
        self
    }

    pub fn with_decay(mut self, decay: f64) -> Self {
        self.decay = decay;
        self
    }

    pub fn with_self_excitation(mut self, gain: f64) -> Self {
        self.self_excitation = gain;
        self
    }

    /// True when no unit's update reads another unit of the same pattern.
    #[inline]
    pub fn is_separable(&self) -> bool {
        self.excitatory_strength == 0.0 && self.inhibitory_strength == 0.0
    }

    pub fn validate(&self) -> Result<()> {
        let all = [
            self.decay,
            self.ceiling,
            self.floor,
            self.self_excitation,
            self.excitatory_strength,
            self.excitatory_range,
            self.inhibitory_strength,
            self.inhibitory_range,
        ];
        if all.iter().any(|v| !v.is_finite()) {
            return Err(ArtError::config("shunting", "parameters must be finite"));
        }
        if self.floor >= self.ceiling {
            return Err(ArtError::config("floor", "must be below ceiling"));
        }
        if self.decay < 0.0 {
            return Err(ArtError::config("decay", "must be >= 0"));
        }
        if self.excitatory_strength < 0.0 {
            return Err(ArtError::config("excitatory_strength", "must be >= 0"));
        }
        if self.inhibitory_strength < 0.0 {
            return Err(ArtError::config("inhibitory_strength", "must be >= 0"));
        }
        if self.excitatory_strength > 0.0 && self.excitatory_range <= 0.0 {
            return Err(ArtError::config("excitatory_range", "must be > 0"));
        }
        if self.inhibitory_strength > 0.0 && self.inhibitory_range <= 0.0 {
            return Err(ArtError::config("inhibitory_range", "must be > 0"));
        }
        Ok(())
    }
}

pub(crate) fn validate_dt(dt: f64) -> Result<()> {
    if !dt.is_finite() || dt <= 0.0 {
        return Err(ArtError::config("dt", "must be finite and > 0"));
    }
    Ok(())
}

/// Gaussian lateral weights indexed by distance, for one pattern dimension.
///
/// `excite[d]` and `inhibit[d]` hold the weight between two units `d` apart.
/// Index 0 is never read (a unit is not its own neighbour). Empty when the
/// matching strength is zero.
#[derive(Debug, Clone)]
pub struct LateralKernel {
    excite: Vec<f64>,
    inhibit: Vec<f64>,
}

impl LateralKernel {
    pub fn new(params: &ShuntingParams, dimension: usize) -> Self {
        Self {
            excite: gaussian_falloff(
                params.excitatory_strength,
                params.excitatory_range,
                dimension,
            ),
            inhibit: gaussian_falloff(
                params.inhibitory_strength,
                params.inhibitory_range,
                dimension,
            ),
        }
    }

    /// Weight between two units `distance` apart.
    pub fn excitatory_weight(&self, distance: usize) -> f64 {
        self.excite.get(distance).copied().unwrap_or(0.0)
    }

    pub fn inhibitory_weight(&self, distance: usize) -> f64 {
        self.inhibit.get(distance).copied().unwrap_or(0.0)
    }

    #[inline]
    fn surround(weights: &[f64], state: &[Activation], i: usize) -> f64 {
        if weights.is_empty() {
            return 0.0;
        }
        let mut sum = 0.0;
        for (j, x) in state.iter().enumerate() {
            if j != i {
                sum += weights[i.abs_diff(j)] * x;
            }
        }
        sum
    }
}

fn gaussian_falloff(strength: f64, sigma: f64, dimension: usize) -> Vec<f64> {
    if strength == 0.0 {
        return Vec::new();
    }
    let two_sigma_sq = 2.0 * sigma * sigma;
    (0..dimension)
        .map(|d| {
            let d = d as f64;
            strength * (-(d * d) / two_sigma_sq).exp()
        })
        .collect()
}

/// One unit's Euler step. Every engine path funnels through this expression,
/// so the per-pattern and per-row paths produce identical bits.
#[inline]
pub(crate) fn update_unit(
    x: f64,
    lateral_excite: f64,
    lateral_inhibit: f64,
    external: f64,
    p: &ShuntingParams,
    dt: f64,
) -> f64 {
    let excite = (p.self_excitation * x + lateral_excite + external).max(0.0);
    let inhibit = lateral_inhibit.max(0.0);
    let dx = -p.decay * x + (p.ceiling - x) * excite - (x - p.floor) * inhibit;
    (x + dt * dx).clamp(p.floor, p.ceiling)
}

/// Unchecked single-pattern step into `out`. Lengths must already agree.
pub(crate) fn step_pattern_into(
    kernel: &LateralKernel,
    state: &[Activation],
    input: Option<&[Activation]>,
    params: &ShuntingParams,
    dt: f64,
    out: &mut [Activation],
) {
    for (i, slot) in out.iter_mut().enumerate() {
        let x = state[i];
        let external = input.map_or(0.0, |inp| inp[i]);
        let lat_e = LateralKernel::surround(&kernel.excite, state, i);
        let lat_i = LateralKernel::surround(&kernel.inhibit, state, i);
        *slot = update_unit(x, lat_e, lat_i, external, params, dt);
    }
}

/// Advance one activation vector by one step of size `dt`.
///
/// `input` is the external drive (`J`); `None` means no drive.
pub fn step_pattern(
    state: &[Activation],
    input: Option<&[Activation]>,
    params: &ShuntingParams,
    dt: f64,
) -> Result<Vec<Activation>> {
    if state.is_empty() {
        return Err(ArtError::EmptyInput("activation state"));
    }
    if let Some(inp) = input {
        if inp.len() != state.len() {
            return Err(ArtError::DimensionMismatch {
                expected: state.len(),
                got: inp.len(),
                index: 0,
            });
        }
    }
    params.validate()?;
    validate_dt(dt)?;

    let kernel = LateralKernel::new(params, state.len());
    let mut out = vec![0.0; state.len()];
    step_pattern_into(&kernel, state, input, params, dt, &mut out);
    Ok(out)
}

/// The closed set of per-layer update rules.
///
/// Each variant is a pure `(input) -> activation` map; the batched form lives in
/// [`crate::batch::BatchDynamics::apply_layer`] and must agree with [`LayerUpdate::apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum LayerUpdate {
    /// Activation equals input.
    #[default]
    Passthrough,
    /// Start at the input (clamped to the bounds) and integrate `steps` Euler
    /// steps with the input held as external drive.
    Shunting {
        params: ShuntingParams,
        dt: f64,
        steps: usize,
    },
}

impl LayerUpdate {
    pub fn shunting(params: ShuntingParams, dt: f64, steps: usize) -> Self {
        LayerUpdate::Shunting { params, dt, steps }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            LayerUpdate::Passthrough => Ok(()),
            LayerUpdate::Shunting { params, dt, steps } => {
                params.validate()?;
                validate_dt(*dt)?;
                if *steps == 0 {
                    return Err(ArtError::config("steps", "must be >= 1"));
                }
                Ok(())
            }
        }
    }

    /// Scalar ops per feature per step, fed to the batching heuristic.
    pub fn ops_per_dimension(&self, dimension: usize) -> usize {
        match self {
            LayerUpdate::Passthrough => 0,
            LayerUpdate::Shunting { params, steps, .. } => {
                let per_step = if params.is_separable() {
                    12
                } else {
                    12 + 4 * dimension
                };
                per_step * steps
            }
        }
    }

    /// Run the layer on one pattern.
    pub fn apply(&self, input: &[Activation]) -> Result<Vec<Activation>> {
        match self {
            LayerUpdate::Passthrough => Ok(input.to_vec()),
            LayerUpdate::Shunting { params, dt, steps } => {
                self.validate()?;
                if input.is_empty() {
                    return Err(ArtError::EmptyInput("activation state"));
                }
                let kernel = LateralKernel::new(params, input.len());
                let mut state: Vec<Activation> = input
                    .iter()
                    .map(|v| v.clamp(params.floor, params.ceiling))
                    .collect();
                let mut next = vec![0.0; input.len()];
                for _ in 0..*steps {
                    step_pattern_into(&kernel, &state, Some(input), params, *dt, &mut next);
                    core::mem::swap(&mut state, &mut next);
                }
                Ok(state)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::Prng;

    #[test]
    fn isolated_unit_follows_closed_form() {
        let p = ShuntingParams {
            decay: 0.5,
            self_excitation: 0.2,
            ..Default::default()
        };
        let x = 0.4;
        let j = 0.3;
        let out = step_pattern(&[x], Some(&[j]), &p, 0.1).unwrap();
        let e = 0.2 * x + j;
        let expected = x + 0.1 * (-0.5 * x + (1.0 - x) * e);
        assert!((out[0] - expected).abs() < 1e-15);
    }

    #[test]
    fn lateral_inhibition_suppresses_neighbours() {
        let p = ShuntingParams::default().with_lateral(0.0, 1.0, 2.0, 1.0);
        let state = [0.5, 0.5, 0.5];
        let alone = step_pattern(&[0.5], None, &p, 0.1).unwrap();
        let crowd = step_pattern(&state, None, &p, 0.1).unwrap();
        // The middle unit sees two inhibitory neighbours, the edges one each.
        assert!(crowd[1] < crowd[0]);
        assert!(crowd[0] < alone[0]);
    }

    #[test]
    fn lateral_excitation_uses_gaussian_falloff() {
        let p = ShuntingParams::default().with_lateral(2.0, 1.5, 0.0, 1.0);
        let k = LateralKernel::new(&p, 5);
        let w1 = 2.0 * (-1.0f64 / (2.0 * 1.5 * 1.5)).exp();
        let w3 = 2.0 * (-9.0f64 / (2.0 * 1.5 * 1.5)).exp();
        assert!((k.excitatory_weight(1) - w1).abs() < 1e-15);
        assert!((k.excitatory_weight(3) - w3).abs() < 1e-15);
        assert_eq!(k.inhibitory_weight(1), 0.0);
        assert_eq!(k.excitatory_weight(9), 0.0);
    }

    #[test]
    fn activations_stay_within_bounds() {
        let p = ShuntingParams {
            decay: 0.1,
            self_excitation: 5.0,
            ..Default::default()
        }
        .with_bounds(-0.2, 0.8)
        .with_lateral(3.0, 2.0, 4.0, 1.0);
        let mut rng = Prng::new(5);
        for _ in 0..20 {
            let state: Vec<f64> = (0..12).map(|_| rng.gen_range_f64(-3.0, 3.0)).collect();
            let input: Vec<f64> = (0..12).map(|_| rng.gen_range_f64(0.0, 10.0)).collect();
            let out = step_pattern(&state, Some(&input), &p, 2.0).unwrap();
            assert!(out.iter().all(|v| (-0.2..=0.8).contains(v)));
        }
    }

    #[test]
    fn rejects_bad_arguments() {
        let p = ShuntingParams::default();
        assert!(step_pattern(&[], None, &p, 0.1).is_err());
        assert!(step_pattern(&[0.1, 0.2], Some(&[0.1]), &p, 0.1).is_err());
        assert!(step_pattern(&[0.1], None, &p, 0.0).is_err());
        let bad = p.with_bounds(1.0, 1.0);
        assert!(step_pattern(&[0.1], None, &bad, 0.1).is_err());
        let bad = p.with_lateral(1.0, 0.0, 0.0, 1.0);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn layer_update_integrates_requested_steps() {
        let params = ShuntingParams::default();
        let layer = LayerUpdate::shunting(params, 0.1, 3);
        let input = [0.2, 0.9];
        let mut expected = input.to_vec();
        for _ in 0..3 {
            expected = step_pattern(&expected, Some(&input), &params, 0.1).unwrap();
        }
        assert_eq!(layer.apply(&input).unwrap(), expected);
        assert_eq!(LayerUpdate::Passthrough.apply(&input).unwrap(), input.to_vec());
        assert!(LayerUpdate::shunting(params, 0.1, 0).validate().is_err());
    }
}
