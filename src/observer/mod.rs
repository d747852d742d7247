use crate::batch::ExecutionTier;
use crate::circuit::{BatchStats, Circuit};
use crate::resonance::{CategoryId, ExhaustionPolicy};
use crate::shunting::LayerUpdate;

#[cfg(feature = "serde")]
use serde::Serialize;

/// A read-only snapshot of what the circuit is doing.
///
/// Design intent:
/// - Observers cannot mutate or steer the circuit.
/// - Snapshotting is *on-demand* and can allocate; `process_batch` stays unchanged.
/// - Stage timings are only present when the last batch ran with
///   `BatchOptions::collect_stats`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct CircuitSnapshot {
    pub presentations: u64,
    pub input_size: usize,
    pub category_capacity: usize,
    pub committed: usize,

    pub vigilance: f64,
    pub learning_rate: f64,
    pub exhaustion: ExhaustionPolicy,
    pub feature_layer: LayerUpdate,

    pub requested_tier: ExecutionTier,
    pub effective_tier: ExecutionTier,

    pub categories: Vec<CategorySnapshot>,
    pub last_batch: Option<BatchStats>,
}

/// One committed category.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct CategorySnapshot {
    pub id: CategoryId,
    /// Presentations that ended on this category.
    pub hits: u64,
    /// Sum of template entries. Shrinks as the category generalizes.
    pub template_norm: f64,
}

pub struct CircuitAdapter<'a> {
    circuit: &'a Circuit,
}

impl<'a> CircuitAdapter<'a> {
    pub fn new(circuit: &'a Circuit) -> Self {
        Self { circuit }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let cfg = self.circuit.config();
        let search = self.circuit.search();

        CircuitSnapshot {
            presentations: self.circuit.presentations(),
            input_size: cfg.input_size,
            category_capacity: search.capacity(),
            committed: search.committed(),

            vigilance: cfg.vigilance,
            learning_rate: cfg.learning_rate,
            exhaustion: cfg.exhaustion,
            feature_layer: cfg.feature_layer,

            requested_tier: self.circuit.options().tier(),
            effective_tier: self.circuit.effective_execution_tier(),

            categories: self.categories(),
            last_batch: self.circuit.last_stats().cloned(),
        }
    }

    pub fn categories(&self) -> Vec<CategorySnapshot> {
        let hits = self.circuit.category_hits();
        self.circuit
            .search()
            .templates()
            .enumerate()
            .map(|(id, t)| CategorySnapshot {
                id,
                hits: hits.get(id).copied().unwrap_or(0),
                template_norm: t.iter().sum(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{BatchOptions, CircuitConfig};
    use crate::pattern::Pattern;

    #[test]
    fn snapshot_reflects_committed_categories() {
        let cfg = CircuitConfig::with_size(2, 4).with_vigilance(0.9);
        let mut circuit = Circuit::with_options(cfg, BatchOptions::profiling()).unwrap();
        let empty = CircuitAdapter::new(&circuit).snapshot();
        assert_eq!(empty.committed, 0);
        assert!(empty.categories.is_empty());
        assert!(empty.last_batch.is_none());

        let batch = vec![
            Pattern::from(vec![1.0, 0.0]),
            Pattern::from(vec![0.0, 1.0]),
            Pattern::from(vec![1.0, 0.0]),
        ];
        circuit.process_batch(&batch).unwrap();

        let snap = CircuitAdapter::new(&circuit).snapshot();
        assert_eq!(snap.presentations, 3);
        assert_eq!(snap.committed, 2);
        assert_eq!(snap.requested_tier, ExecutionTier::Scalar);
        assert_eq!(snap.effective_tier, ExecutionTier::Scalar);
        assert_eq!(snap.categories[0].hits, 2);
        assert_eq!(snap.categories[1].hits, 1);
        // All ones, then two half-rate steps toward [1, 0]: [1, 0.25].
        assert_eq!(snap.categories[0].template_norm, 1.25);
        assert_eq!(snap.last_batch.as_ref().map(|s| s.patterns), Some(3));
    }
}
