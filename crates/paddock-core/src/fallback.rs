//! Pre-qualifying fallback.
//!
//! Two modes, chosen afresh on every request from data availability alone:
//! `QualifyingKnown` whenever qualifying results exist, `PreQualifying`
//! otherwise. In pre-qualifying mode practice pace stands in for qualifying
//! at a pinned low weight and every confidence range is widened by a fixed
//! margin.

use crate::error::ScoreError;
use crate::model::{ConfidenceRange, SignalSet, WeightVariant};
use crate::scoring::{self, Assessment};
use crate::weights::{rebalance, rebalance_pre_qualifying, WeightVector, Weights, DEFAULT_PRACTICE_WEIGHT};

/// Default widening applied to each bound in pre-qualifying mode.
pub const DEFAULT_PRE_QUALIFYING_MARGIN: u8 = 15;

/// Pick the mode for a request.
pub fn select_mode(qualifying_available: bool) -> WeightVariant {
    if qualifying_available {
        WeightVariant::QualifyingKnown
    } else {
        WeightVariant::PreQualifying
    }
}

/// Widen a range by `margin` on both sides, clamped to `[0, 100]`.
pub fn widen(range: ConfidenceRange, margin: u8) -> ConfidenceRange {
    ConfidenceRange {
        low: range.low.saturating_sub(margin),
        high: range.high.saturating_add(margin).min(100),
    }
}

/// Weighting and confidence policy for both modes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringPolicy {
    pub base: Weights,
    pub practice_weight: f64,
    pub pre_qualifying_margin: u8,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            base: Weights::default(),
            practice_weight: DEFAULT_PRACTICE_WEIGHT,
            pre_qualifying_margin: DEFAULT_PRE_QUALIFYING_MARGIN,
        }
    }
}

impl ScoringPolicy {
    /// Final weights for one competitor's present signals.
    pub fn weights(&self, mode: WeightVariant, signals: &SignalSet) -> Result<WeightVector, ScoreError> {
        let present = signals.present_kinds();
        match mode {
            WeightVariant::QualifyingKnown => rebalance(&self.base, &present),
            WeightVariant::PreQualifying => {
                rebalance_pre_qualifying(&self.base, self.practice_weight, &present)
            }
        }
    }

    /// Rebalance, score, and apply the mode's confidence adjustment.
    pub fn assess(&self, mode: WeightVariant, signals: &SignalSet) -> Result<Assessment, ScoreError> {
        let weights = self.weights(mode, signals)?;
        let mut assessment = scoring::score(signals, &weights)?;
        if mode == WeightVariant::PreQualifying {
            assessment.confidence = widen(assessment.confidence, self.pre_qualifying_margin);
        }
        Ok(assessment)
    }
}
