//! Comparable scores and the pluggable transform that produces them.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A totally ordered score. Larger is better.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score(pub f64);

impl Score {
    pub fn value(self) -> f64 {
        self.0
    }

    /// Strict improvement over `best`; anything improves on "no score yet".
    pub fn improves_on(self, best: Option<Score>) -> bool {
        best.is_none_or(|b| self > b)
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Weighting parameters handed to the transform untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ScoreWeights {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w_simg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w_simng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w_sp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w_gap: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w_ml: Option<f64>,
}

/// Maps a raw tool-reported likelihood to a score comparable across tools
/// and iterations. Implementations must be pure.
pub trait ScoreTransform: Send + Sync {
    fn transform(&self, raw: f64, weights: &ScoreWeights) -> Score;
}

/// Uses the raw likelihood as the score.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl ScoreTransform for IdentityTransform {
    fn transform(&self, raw: f64, _weights: &ScoreWeights) -> Score {
        Score(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_total() {
        assert!(Score(-10.0) > Score(-20.0));
        assert!(Score(f64::NAN) > Score(f64::INFINITY));
        assert_eq!(Score(1.5), Score(1.5));
    }

    #[test]
    fn improvement_is_strict() {
        assert!(Score(-1.0).improves_on(None));
        assert!(Score(-1.0).improves_on(Some(Score(-2.0))));
        assert!(!Score(-2.0).improves_on(Some(Score(-2.0))));
    }

    #[test]
    fn identity_ignores_weights() {
        let weights = ScoreWeights {
            w_ml: Some(0.5),
            ..ScoreWeights::default()
        };
        assert_eq!(IdentityTransform.transform(-123.4, &weights), Score(-123.4));
    }
}
