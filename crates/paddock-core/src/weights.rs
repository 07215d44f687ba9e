//! Canonical signal weights and proportional rebalancing.
//!
//! Missing signals are excluded from scoring entirely rather than scored as
//! zero: the base weights of the present signals are rescaled so they still
//! sum to 1.0.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ScoreError;
use crate::model::{SignalKind, WeightVariant};

/// Tolerance for "sums to 1.0".
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Fixed post-rebalance weight of practice pace in pre-qualifying mode.
pub const DEFAULT_PRACTICE_WEIGHT: f64 = 0.10;

/// The five canonical base weights. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    #[serde(default = "default_qualifying")]
    pub qualifying: f64,
    #[serde(default = "default_recent_form")]
    pub recent_form: f64,
    #[serde(default = "default_circuit_history")]
    pub circuit_history: f64,
    #[serde(default = "default_team_strength")]
    pub team_strength: f64,
    #[serde(default = "default_grid_delta")]
    pub grid_delta: f64,
}

fn default_qualifying() -> f64 {
    0.35
}
fn default_recent_form() -> f64 {
    0.25
}
fn default_circuit_history() -> f64 {
    0.15
}
fn default_team_strength() -> f64 {
    0.15
}
fn default_grid_delta() -> f64 {
    0.10
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            qualifying: default_qualifying(),
            recent_form: default_recent_form(),
            circuit_history: default_circuit_history(),
            team_strength: default_team_strength(),
            grid_delta: default_grid_delta(),
        }
    }
}

impl Weights {
    /// Base weight of a canonical signal; practice pace has none.
    pub fn get(&self, kind: SignalKind) -> f64 {
        match kind {
            SignalKind::Qualifying => self.qualifying,
            SignalKind::RecentForm => self.recent_form,
            SignalKind::CircuitHistory => self.circuit_history,
            SignalKind::TeamStrength => self.team_strength,
            SignalKind::GridDelta => self.grid_delta,
            SignalKind::PracticePace => 0.0,
        }
    }

    pub fn sum(&self) -> f64 {
        SignalKind::CANONICAL.iter().map(|&k| self.get(k)).sum()
    }

    /// Check that every weight is in `[0, 1]` and the total is 1.0.
    pub fn validate(&self) -> Result<(), String> {
        for kind in SignalKind::CANONICAL {
            let w = self.get(kind);
            if !(0.0..=1.0).contains(&w) {
                return Err(format!("{kind} weight {w} is outside [0, 1]"));
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(format!("weights sum to {sum}, expected 1.0"));
        }
        Ok(())
    }
}

/// Final per-signal weights for one competitor.
///
/// Only present signals appear; their weights sum to 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightVector {
    pub variant: WeightVariant,
    weights: BTreeMap<SignalKind, f64>,
}

impl WeightVector {
    pub fn get(&self, kind: SignalKind) -> f64 {
        self.weights.get(&kind).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SignalKind, f64)> + '_ {
        self.weights.iter().map(|(k, w)| (*k, *w))
    }

    pub fn sum(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// Rescale the base weights of the present canonical signals to sum to 1.0.
///
/// Practice pace is ignored here; see [`rebalance_pre_qualifying`].
pub fn rebalance(
    base: &Weights,
    present: &BTreeSet<SignalKind>,
) -> Result<WeightVector, ScoreError> {
    let weights = proportional(base, present, 1.0)?;
    Ok(WeightVector {
        variant: WeightVariant::QualifyingKnown,
        weights,
    })
}

/// Rebalance with practice pace pinned at `practice_weight`.
///
/// The remaining present signals share `1 - practice_weight` in proportion to
/// their base weights. Qualifying is never combined with practice. When
/// practice pace is the only signal it carries the whole score.
pub fn rebalance_pre_qualifying(
    base: &Weights,
    practice_weight: f64,
    present: &BTreeSet<SignalKind>,
) -> Result<WeightVector, ScoreError> {
    let others: BTreeSet<SignalKind> = present
        .iter()
        .copied()
        .filter(|k| !matches!(k, SignalKind::Qualifying | SignalKind::PracticePace))
        .collect();

    let weights = if present.contains(&SignalKind::PracticePace) {
        match proportional(base, &others, 1.0 - practice_weight) {
            Ok(mut weights) => {
                weights.insert(SignalKind::PracticePace, practice_weight);
                weights
            }
            Err(ScoreError::InsufficientData) => {
                BTreeMap::from([(SignalKind::PracticePace, 1.0)])
            }
        }
    } else {
        proportional(base, &others, 1.0)?
    };

    Ok(WeightVector {
        variant: WeightVariant::PreQualifying,
        weights,
    })
}

fn proportional(
    base: &Weights,
    present: &BTreeSet<SignalKind>,
    total: f64,
) -> Result<BTreeMap<SignalKind, f64>, ScoreError> {
    let kinds: Vec<SignalKind> = present
        .iter()
        .copied()
        .filter(|k| *k != SignalKind::PracticePace)
        .collect();
    let present_sum: f64 = kinds.iter().map(|&k| base.get(k)).sum();
    if kinds.is_empty() || present_sum <= 0.0 {
        return Err(ScoreError::InsufficientData);
    }
    Ok(kinds
        .into_iter()
        .map(|k| (k, base.get(k) / present_sum * total))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn kinds(list: &[SignalKind]) -> BTreeSet<SignalKind> {
        list.iter().copied().collect()
    }

    #[test]
    fn default_weights_are_valid() {
        let w = Weights::default();
        assert!(w.validate().is_ok());
        assert!((w.sum() - 1.0).abs() < WEIGHT_TOLERANCE);
    }

    #[test]
    fn validate_rejects_bad_totals() {
        let w = Weights {
            qualifying: 0.5,
            ..Weights::default()
        };
        assert!(w.validate().unwrap_err().contains("sum"));

        let w = Weights {
            qualifying: -0.1,
            recent_form: 0.7,
            ..Weights::default()
        };
        assert!(w.validate().unwrap_err().contains("outside"));
    }

    #[test]
    fn all_present_keeps_base_weights() {
        let base = Weights::default();
        let v = rebalance(&base, &kinds(&SignalKind::CANONICAL)).unwrap();
        for kind in SignalKind::CANONICAL {
            assert!((v.get(kind) - base.get(kind)).abs() < 1e-12);
        }
    }

    #[test]
    fn missing_circuit_history_scales_the_rest() {
        let base = Weights::default();
        let present = kinds(&[
            SignalKind::Qualifying,
            SignalKind::RecentForm,
            SignalKind::TeamStrength,
            SignalKind::GridDelta,
        ]);
        let v = rebalance(&base, &present).unwrap();
        let scale = 1.0 / (1.0 - base.circuit_history);
        assert!((v.get(SignalKind::Qualifying) - base.qualifying * scale).abs() < 1e-12);
        assert!((v.get(SignalKind::GridDelta) - base.grid_delta * scale).abs() < 1e-12);
        assert_eq!(v.get(SignalKind::CircuitHistory), 0.0);
        assert_eq!(v.len(), 4);
        assert!((v.sum() - 1.0).abs() < WEIGHT_TOLERANCE);
    }

    #[test]
    fn no_signals_is_insufficient_data() {
        let base = Weights::default();
        assert_eq!(
            rebalance(&base, &BTreeSet::new()),
            Err(ScoreError::InsufficientData)
        );
        assert_eq!(
            rebalance_pre_qualifying(&base, DEFAULT_PRACTICE_WEIGHT, &BTreeSet::new()),
            Err(ScoreError::InsufficientData)
        );
    }

    #[test]
    fn practice_pinned_at_fixed_weight() {
        let base = Weights::default();
        let present = kinds(&[
            SignalKind::PracticePace,
            SignalKind::RecentForm,
            SignalKind::CircuitHistory,
            SignalKind::TeamStrength,
            SignalKind::GridDelta,
        ]);
        let v = rebalance_pre_qualifying(&base, DEFAULT_PRACTICE_WEIGHT, &present).unwrap();
        assert_eq!(v.variant, WeightVariant::PreQualifying);
        assert!((v.get(SignalKind::PracticePace) - 0.10).abs() < 1e-12);
        assert_eq!(v.get(SignalKind::Qualifying), 0.0);
        assert!((v.sum() - 1.0).abs() < WEIGHT_TOLERANCE);

        // Others keep their relative proportions.
        let ratio = v.get(SignalKind::RecentForm) / v.get(SignalKind::TeamStrength);
        assert!((ratio - base.recent_form / base.team_strength).abs() < 1e-9);
    }

    #[test]
    fn practice_alone_carries_full_weight() {
        let v = rebalance_pre_qualifying(
            &Weights::default(),
            DEFAULT_PRACTICE_WEIGHT,
            &kinds(&[SignalKind::PracticePace]),
        )
        .unwrap();
        assert_eq!(v.get(SignalKind::PracticePace), 1.0);
    }

    fn subset_strategy() -> impl Strategy<Value = BTreeSet<SignalKind>> {
        prop::collection::btree_set(prop::sample::select(SignalKind::CANONICAL.to_vec()), 1..=5)
    }

    proptest! {
        #[test]
        fn rebalanced_weights_sum_to_one(present in subset_strategy()) {
            let v = rebalance(&Weights::default(), &present).unwrap();
            prop_assert!((v.sum() - 1.0).abs() < WEIGHT_TOLERANCE);
            prop_assert_eq!(v.len(), present.len());
        }

        #[test]
        fn pre_qualifying_weights_sum_to_one(
            present in subset_strategy(),
            practice in any::<bool>(),
        ) {
            let mut present = present;
            if practice {
                present.insert(SignalKind::PracticePace);
            }
            let usable = present
                .iter()
                .any(|k| *k != SignalKind::Qualifying);
            match rebalance_pre_qualifying(&Weights::default(), DEFAULT_PRACTICE_WEIGHT, &present) {
                Ok(v) => {
                    prop_assert!(usable);
                    prop_assert!((v.sum() - 1.0).abs() < WEIGHT_TOLERANCE);
                    if practice && v.len() > 1 {
                        prop_assert!((v.get(SignalKind::PracticePace) - DEFAULT_PRACTICE_WEIGHT).abs() < 1e-12);
                    }
                }
                Err(e) => {
                    prop_assert!(!usable);
                    prop_assert_eq!(e, ScoreError::InsufficientData);
                }
            }
        }
    }
}
