//! The circuit: feature layer + category search, and the batch entry point.
//!
//! [`Circuit::process_batch`] runs in three stages:
//!
//! 1. **Features.** Every pattern goes through the configured feature-layer
//!    update. Patterns are independent here, so the batch is transposed to
//!    dimension-major, advanced by [`BatchDynamics`], and transposed back when the
//!    options ask for it (or the cost heuristic says it pays).
//! 2. **Search.** Each feature vector is presented to the [`ResonanceSearch`]
//!    controller, strictly in batch order: presentation `n + 1` reads templates
//!    that presentation `n` may have changed.
//! 3. **Output.** The category's expectation when it resonated, otherwise the raw
//!    input.
//!
//! The whole batch is validated before stage 1, so a bad batch changes nothing.

use core::time::Duration;
#[cfg(feature = "std")]
use std::time::Instant;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tracing::debug;

use crate::batch::{BatchDynamics, ExecutionTier, StepReport};
use crate::error::{ArtError, Result};
use crate::layout::{is_batching_beneficial, to_dimension_major, to_pattern_major};
use crate::pattern::{validate_batch, Pattern};
use crate::resonance::{CategoryId, ExhaustionPolicy, ResonanceSearch, SearchConfig, SearchState};
use crate::shunting::LayerUpdate;

/// Circuit configuration, validated once by [`Circuit::new`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CircuitConfig {
    /// Pattern dimension, fixed for the circuit's lifetime.
    pub input_size: usize,
    /// Number of category slots.
    pub category_capacity: usize,
    pub vigilance: f64,
    pub learning_rate: f64,
    pub max_search_iterations: usize,
    pub exhaustion: ExhaustionPolicy,
    /// Update applied to every input before category search.
    pub feature_layer: LayerUpdate,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        let search = SearchConfig::default();
        Self {
            input_size: 16,
            category_capacity: 32,
            vigilance: search.vigilance,
            learning_rate: search.learning_rate,
            max_search_iterations: search.max_search_iterations,
            exhaustion: search.exhaustion,
            feature_layer: LayerUpdate::Passthrough,
        }
    }
}

impl CircuitConfig {
    /// Upper bound on `input_size`.
    pub const MAX_INPUT_SIZE: usize = ResonanceSearch::MAX_DIMENSION;
    /// Upper bound on `category_capacity`.
    pub const MAX_CATEGORIES: usize = ResonanceSearch::MAX_CAPACITY;

    pub fn with_size(input_size: usize, category_capacity: usize) -> Self {
        Self {
            input_size,
            category_capacity,
            ..Default::default()
        }
    }

    pub fn with_vigilance(mut self, vigilance: f64) -> Self {
        self.vigilance = vigilance;
        self
    }

    pub fn with_learning_rate(mut self, rate: f64) -> Self {
        self.learning_rate = rate;
        self
    }

    pub fn with_max_search_iterations(mut self, n: usize) -> Self {
        self.max_search_iterations = n;
        self
    }

    pub fn with_exhaustion(mut self, policy: ExhaustionPolicy) -> Self {
        self.exhaustion = policy;
        self
    }

    pub fn with_feature_layer(mut self, layer: LayerUpdate) -> Self {
        self.feature_layer = layer;
        self
    }

    pub fn search_config(&self) -> SearchConfig {
        SearchConfig {
            vigilance: self.vigilance,
            learning_rate: self.learning_rate,
            max_search_iterations: self.max_search_iterations,
            exhaustion: self.exhaustion,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.input_size > Self::MAX_INPUT_SIZE {
            return Err(ArtError::config("input_size", "out of range"));
        }
        if self.category_capacity == 0 || self.category_capacity > Self::MAX_CATEGORIES {
            return Err(ArtError::config("category_capacity", "out of range"));
        }
        self.search_config().validate()?;
        self.feature_layer.validate()
    }

    /// Parse and validate a JSON config. Missing fields take their defaults.
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: CircuitConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[cfg(feature = "serde")]
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// When the feature stage transposes the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BatchPolicy {
    /// Ask [`is_batching_beneficial`].
    #[default]
    Auto,
    Always,
    Never,
}

/// Batch execution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BatchOptions {
    /// Split row/pattern work across rayon workers.
    pub parallel: bool,
    /// Use `f64x4` lanes down each row.
    pub simd: bool,
    /// Time each stage.
    pub collect_stats: bool,
    pub batching: BatchPolicy,
    /// Smallest row or pattern count worth handing to workers.
    pub parallel_min_items: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::balanced()
    }
}

impl BatchOptions {
    pub const PRESETS: [&'static str; 3] = ["balanced", "throughput", "profiling"];

    /// Parallel and SIMD on, batching decided per call, no timing.
    pub fn balanced() -> Self {
        Self {
            parallel: true,
            simd: true,
            collect_stats: false,
            batching: BatchPolicy::Auto,
            parallel_min_items: BatchDynamics::DEFAULT_PARALLEL_MIN_ITEMS,
        }
    }

    /// Tuned for large batches: always transpose, bigger parallel grain.
    pub fn throughput() -> Self {
        Self {
            parallel: true,
            simd: true,
            collect_stats: false,
            batching: BatchPolicy::Always,
            parallel_min_items: 64,
        }
    }

    /// Single-threaded scalar execution with stage timings.
    pub fn profiling() -> Self {
        Self {
            parallel: false,
            simd: false,
            collect_stats: true,
            batching: BatchPolicy::Always,
            parallel_min_items: BatchDynamics::DEFAULT_PARALLEL_MIN_ITEMS,
        }
    }

    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "balanced" => Ok(Self::balanced()),
            "throughput" => Ok(Self::throughput()),
            "profiling" => Ok(Self::profiling()),
            other => Err(ArtError::UnknownPreset(other.to_string())),
        }
    }

    pub fn with_stats(mut self, on: bool) -> Self {
        self.collect_stats = on;
        self
    }

    pub fn with_batching(mut self, policy: BatchPolicy) -> Self {
        self.batching = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallel_min_items == 0 {
            return Err(ArtError::config("parallel_min_items", "must be >= 1"));
        }
        Ok(())
    }

    /// Requested execution tier.
    pub fn tier(&self) -> ExecutionTier {
        match (self.parallel, self.simd) {
            (true, _) => ExecutionTier::Parallel,
            (false, true) => ExecutionTier::Simd,
            (false, false) => ExecutionTier::Scalar,
        }
    }

    pub fn engine(&self) -> BatchDynamics {
        BatchDynamics::new(self.tier()).with_parallel_min_items(self.parallel_min_items)
    }

    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self> {
        let opts: BatchOptions = serde_json::from_str(json)?;
        opts.validate()?;
        Ok(opts)
    }
}

/// Aggregate statistics for one [`Circuit::process_batch`] call. Informational only.
///
/// Counters are always filled; durations stay zero unless
/// [`BatchOptions::collect_stats`] is on.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatchStats {
    pub patterns: usize,
    /// Whether the feature stage ran on the dimension-major layout.
    pub batched: bool,
    pub tier: ExecutionTier,
    pub timed: bool,

    pub layout_time: Duration,
    pub dynamics_time: Duration,
    pub reshape_time: Duration,
    pub search_time: Duration,
    pub total_time: Duration,

    pub lane_operations: u64,
    pub vector_operations: u64,
    pub per_pattern_operations: u64,
    pub categories_created: usize,
    pub templates_overwritten: usize,
    /// Committed candidates evaluated across all presentations.
    pub search_count: usize,
    pub resonance_count: usize,
    pub rejected_count: usize,

    /// Share of feature-stage element traffic that was contiguous.
    pub cache_efficiency: f64,
    /// Share of available lanes (SIMD) or workers (parallel) kept busy.
    pub parallel_efficiency: f64,
}

impl BatchStats {
    fn absorb_steps(&mut self, report: &StepReport) {
        self.lane_operations += report.lane_operations;
        self.vector_operations += report.vector_operations;
        self.per_pattern_operations += report.per_pattern_operations;

        let traffic = report.lane_operations + report.gathered_elements;
        self.cache_efficiency = if traffic == 0 {
            1.0
        } else {
            report.lane_operations as f64 / traffic as f64
        };
    }

    fn estimate_parallel_efficiency(&mut self, report: &StepReport, dimension: usize) {
        self.parallel_efficiency = match self.tier {
            ExecutionTier::Scalar => 1.0,
            ExecutionTier::Simd => report.lane_utilization(),
            ExecutionTier::Parallel => {
                let items = if report.lane_operations > 0 {
                    dimension
                } else {
                    self.patterns
                };
                let workers = worker_count();
                items.min(workers) as f64 / workers as f64
            }
        };
    }
}

#[cfg(feature = "parallel")]
fn worker_count() -> usize {
    rayon::current_num_threads().max(1)
}

#[cfg(not(feature = "parallel"))]
fn worker_count() -> usize {
    1
}

/// Per-pattern result of a presentation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PatternResult {
    /// Category expectation after learning when resonant, the raw input otherwise.
    pub output: Pattern,
    pub category: Option<CategoryId>,
    pub match_score: f64,
    pub resonated: bool,
    pub state: SearchState,
    pub iterations: usize,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatchResult {
    pub results: Vec<PatternResult>,
    pub stats: BatchStats,
}

/// Stage stopwatch; a no-op unless stats are on.
struct Stopwatch {
    #[cfg(feature = "std")]
    start: Option<Instant>,
}

impl Stopwatch {
    fn start(on: bool) -> Self {
        #[cfg(feature = "std")]
        {
            Self {
                start: on.then(Instant::now),
            }
        }
        #[cfg(not(feature = "std"))]
        {
            let _ = on;
            Self {}
        }
    }

    fn lap(&mut self) -> Duration {
        #[cfg(feature = "std")]
        {
            match self.start.as_mut() {
                Some(t) => {
                    let now = Instant::now();
                    let d = now - *t;
                    *t = now;
                    d
                }
                None => Duration::ZERO,
            }
        }
        #[cfg(not(feature = "std"))]
        {
            Duration::ZERO
        }
    }
}

/// A configured ART circuit.
#[derive(Debug, Clone)]
pub struct Circuit {
    cfg: CircuitConfig,
    options: BatchOptions,
    engine: BatchDynamics,
    search: ResonanceSearch,
    /// Resonance count per category slot.
    category_hits: Vec<u64>,
    presentations: u64,
    last_stats: Option<BatchStats>,
}

impl Circuit {
    pub fn new(cfg: CircuitConfig) -> Result<Self> {
        Self::with_options(cfg, BatchOptions::default())
    }

    pub fn with_options(cfg: CircuitConfig, options: BatchOptions) -> Result<Self> {
        cfg.validate()?;
        options.validate()?;
        let search =
            ResonanceSearch::new(cfg.input_size, cfg.category_capacity, cfg.search_config())?;
        Ok(Self {
            cfg,
            options,
            engine: options.engine(),
            search,
            category_hits: vec![0; cfg.category_capacity],
            presentations: 0,
            last_stats: None,
        })
    }

    /// Rebuild a circuit around templates restored from an image.
    pub fn from_search(
        cfg: CircuitConfig,
        options: BatchOptions,
        search: ResonanceSearch,
    ) -> Result<Self> {
        let mut circuit = Self::with_options(cfg, options)?;
        if search.dimension() != cfg.input_size {
            return Err(ArtError::DimensionMismatch {
                expected: cfg.input_size,
                got: search.dimension(),
                index: 0,
            });
        }
        let mut search = search;
        search.set_capacity(cfg.category_capacity)?;
        search.set_config(cfg.search_config())?;
        circuit.search = search;
        Ok(circuit)
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.cfg
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    pub fn search(&self) -> &ResonanceSearch {
        &self.search
    }

    pub fn presentations(&self) -> u64 {
        self.presentations
    }

    pub fn category_hits(&self) -> &[u64] {
        &self.category_hits
    }

    pub fn last_stats(&self) -> Option<&BatchStats> {
        self.last_stats.as_ref()
    }

    /// Tier the feature stage will actually run on.
    pub fn effective_execution_tier(&self) -> ExecutionTier {
        self.engine.effective_execution_tier()
    }

    pub fn set_options(&mut self, options: BatchOptions) -> Result<()> {
        options.validate()?;
        self.options = options;
        self.engine = options.engine();
        Ok(())
    }

    /// Swap in a new configuration, keeping learned templates.
    ///
    /// The input size is fixed once any category is committed, and capacity may
    /// not drop below the committed count.
    pub fn reconfigure(&mut self, cfg: CircuitConfig) -> Result<()> {
        cfg.validate()?;
        let committed = self.search.committed();
        if committed > 0 && cfg.input_size != self.cfg.input_size {
            return Err(ArtError::IllegalState(
                "input size is fixed while categories are committed",
            ));
        }
        if cfg.category_capacity < committed {
            return Err(ArtError::IllegalState(
                "capacity below committed category count",
            ));
        }

        if cfg.input_size != self.cfg.input_size {
            self.search =
                ResonanceSearch::new(cfg.input_size, cfg.category_capacity, cfg.search_config())?;
        } else {
            self.search.set_capacity(cfg.category_capacity)?;
            self.search.set_config(cfg.search_config())?;
        }
        self.category_hits.resize(cfg.category_capacity, 0);
        self.cfg = cfg;
        Ok(())
    }

    /// Forget all categories and counters.
    pub fn reset(&mut self) {
        self.search.clear();
        self.category_hits.fill(0);
        self.presentations = 0;
        self.last_stats = None;
    }

    /// Present one pattern: feature layer, then search.
    pub fn present(&mut self, pattern: &Pattern) -> Result<PatternResult> {
        validate_batch(core::slice::from_ref(pattern), Some(self.cfg.input_size))?;
        let features = Pattern::new(self.cfg.feature_layer.apply(pattern.as_slice())?);
        self.present_features(pattern, &features)
    }

    /// Run a batch of patterns through the circuit.
    ///
    /// All-or-nothing: an empty batch, a pattern of the wrong dimension or a
    /// non-finite value fails the call before any pattern is processed.
    pub fn process_batch(&mut self, patterns: &[Pattern]) -> Result<BatchResult> {
        let dimension = validate_batch(patterns, Some(self.cfg.input_size))?;
        let timed = self.options.collect_stats;
        let mut total = Stopwatch::start(timed);
        let mut lap = Stopwatch::start(timed);

        let mut stats = BatchStats {
            patterns: patterns.len(),
            tier: self.engine.effective_execution_tier(),
            timed,
            ..Default::default()
        };

        // Stage 1: feature layer, batched across patterns when it pays.
        let layer = self.cfg.feature_layer;
        let batched = !matches!(layer, LayerUpdate::Passthrough)
            && match self.options.batching {
                BatchPolicy::Always => true,
                BatchPolicy::Never => false,
                BatchPolicy::Auto => is_batching_beneficial(
                    patterns.len(),
                    dimension,
                    layer.ops_per_dimension(dimension),
                ),
            };
        stats.batched = batched;

        let features: Vec<Pattern> = if batched {
            let dim_major = to_dimension_major(patterns)?;
            stats.layout_time = lap.lap();

            let (advanced, report) = self.engine.apply_layer(&layer, &dim_major)?;
            stats.dynamics_time = lap.lap();
            stats.absorb_steps(&report);
            stats.estimate_parallel_efficiency(&report, dimension);

            let features = to_pattern_major(&advanced);
            stats.reshape_time = lap.lap();
            features
        } else {
            let features = patterns
                .iter()
                .map(|p| layer.apply(p.as_slice()).map(Pattern::new))
                .collect::<Result<Vec<_>>>()?;
            stats.dynamics_time = lap.lap();
            stats.cache_efficiency = 1.0;
            stats.parallel_efficiency = 1.0;
            features
        };
        debug!(
            patterns = patterns.len(),
            batched,
            tier = ?stats.tier,
            "feature stage done"
        );

        // Stage 2 + 3: sequential search, one presentation at a time.
        let mut results = Vec::with_capacity(patterns.len());
        for (raw, feat) in patterns.iter().zip(&features) {
            let (result, created, overwrote) = self.present_features_counted(raw, feat)?;
            stats.search_count += result.iterations;
            stats.categories_created += created as usize;
            stats.templates_overwritten += overwrote as usize;
            if result.resonated {
                stats.resonance_count += 1;
            }
            if result.state == SearchState::Rejected {
                stats.rejected_count += 1;
            }
            results.push(result);
        }
        stats.search_time = lap.lap();
        stats.total_time = total.lap();

        self.last_stats = Some(stats.clone());
        Ok(BatchResult { results, stats })
    }

    fn present_features(&mut self, raw: &Pattern, features: &Pattern) -> Result<PatternResult> {
        Ok(self.present_features_counted(raw, features)?.0)
    }

    /// Search on already-validated features. Returns the result plus the
    /// created/overwrote flags for batch accounting.
    fn present_features_counted(
        &mut self,
        raw: &Pattern,
        features: &Pattern,
    ) -> Result<(PatternResult, bool, bool)> {
        let outcome = self.search.present(features.as_slice())?;
        self.presentations += 1;

        let output = match outcome.category {
            Some(id) if outcome.resonated => {
                self.category_hits[id] += 1;
                self.search
                    .template(id)
                    .map(Pattern::from)
                    .unwrap_or_else(|| raw.clone())
            }
            _ => raw.clone(),
        };

        let result = PatternResult {
            output,
            category: outcome.category,
            match_score: outcome.match_score,
            resonated: outcome.resonated,
            state: outcome.state,
            iterations: outcome.iterations(),
        };
        Ok((result, outcome.created, outcome.overwrote))
    }
}
