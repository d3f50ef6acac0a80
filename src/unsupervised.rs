//! Unsupervised-evaluation scoring (spec §1 "the plaintext weight-aggregation
//! formula ... treated as a pure function"; §6 summary metrics
//! `unsupervisedEval`). The real scoring algorithm (e.g. Laplace-noised
//! clustering metrics) is an external collaborator; this crate only defines the
//! interface the per-iteration summary (§4.H/§9) calls through.

use crate::model::Model;

/// Black-box unsupervised-evaluation scorer.
pub trait UnsupervisedEval: Clone + Send + Sync + 'static {
    /// Scores the aggregated model for this iteration, or `None` if
    /// unsupervised evaluation is disabled for this job.
    fn score(&self, model: &Model) -> Option<f64>;
}

/// No-op scorer: every job that doesn't configure a real evaluator gets `None`
/// for `unsupervisedEval`, matching the summary schema's optional field (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUnsupervisedEval;

impl UnsupervisedEval for NoUnsupervisedEval {
    fn score(&self, _model: &Model) -> Option<f64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{f32_vec_to_bytes, WeightItem};
    use std::collections::BTreeMap;

    #[test]
    fn noop_scorer_always_returns_none() {
        let mut items = BTreeMap::new();
        items.insert(
            "w".to_string(),
            WeightItem {
                offset: 0,
                size: 4,
                shape: vec![1],
                dtype: "f32".to_string(),
                require_aggr: true,
            },
        );
        let model = Model::new(f32_vec_to_bytes(&[1.0]), items);
        assert_eq!(NoUnsupervisedEval.score(&model), None);
    }
}
