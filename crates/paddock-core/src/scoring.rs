//! Weighted scoring, confidence ranges, reasoning factors, and ranking.
//!
//! Scores are weighted linear combinations of normalized signals (1.0 best).
//! Confidence is derived from how much the contributing signals disagree:
//!
//! ```text
//! sigma = population std-dev of the normalized values
//! t     = clamp(sigma / 0.35, 0, 1)        (t = 1 with fewer than two signals)
//! low   = round(80 - 45 t)                 80 .. 35
//! high  = low + round(15 + 5 t)            95 .. 55
//! ```
//!
//! The width is rounded on its own so it never shrinks as dispersion grows.

use std::cmp::Ordering;

use crate::error::ScoreError;
use crate::model::{Competitor, ConfidenceRange, Evidence, Prediction, Signal, SignalKind, SignalSet};
use crate::weights::WeightVector;

/// Dispersion at or above which confidence bottoms out.
pub const SIGMA_CEILING: f64 = 0.35;

const LOW_AGREE: f64 = 80.0;
const LOW_DISAGREE: f64 = 35.0;
const HIGH_AGREE: f64 = 95.0;
const HIGH_DISAGREE: f64 = 55.0;

/// Number of reasoning factors reported per competitor.
pub const TOP_FACTORS: usize = 3;

/// Outcome of scoring one competitor.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub score: f64,
    pub confidence: ConfidenceRange,
    pub factors: Vec<String>,
}

/// Score a competitor's signals under the given weights.
///
/// Only signals that are both present and weighted contribute; a competitor
/// with none of them yields [`ScoreError::InsufficientData`].
pub fn score(signals: &SignalSet, weights: &WeightVector) -> Result<Assessment, ScoreError> {
    let contributing: Vec<(SignalKind, &Signal, f64)> = weights
        .iter()
        .filter_map(|(kind, w)| signals.get(kind).map(|s| (kind, s, w)))
        .collect();
    if contributing.is_empty() {
        return Err(ScoreError::InsufficientData);
    }

    let score = contributing.iter().map(|(_, s, w)| s.value * w).sum::<f64>();
    let values: Vec<f64> = contributing.iter().map(|(_, s, _)| s.value).collect();
    let confidence = confidence_range(dispersion(&values));
    let factors = top_factors(&contributing);

    Ok(Assessment {
        score,
        confidence,
        factors,
    })
}

/// Population standard deviation; `None` with fewer than two values.
pub fn dispersion(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt())
}

/// Map signal dispersion to a confidence range.
pub fn confidence_range(sigma: Option<f64>) -> ConfidenceRange {
    let t = match sigma {
        Some(s) if s.is_finite() => (s / SIGMA_CEILING).clamp(0.0, 1.0),
        _ => 1.0,
    };
    let low = (LOW_AGREE + (LOW_DISAGREE - LOW_AGREE) * t).round();
    let width_agree = HIGH_AGREE - LOW_AGREE;
    let width_disagree = HIGH_DISAGREE - LOW_DISAGREE;
    let width = (width_agree + (width_disagree - width_agree) * t).round();
    ConfidenceRange {
        low: low as u8,
        high: (low + width) as u8,
    }
}

fn top_factors(contributing: &[(SignalKind, &Signal, f64)]) -> Vec<String> {
    let mut ranked: Vec<(SignalKind, &Signal, f64)> = contributing
        .iter()
        .map(|(kind, signal, w)| (*kind, *signal, w * signal.value))
        .collect();
    ranked.sort_by(|a, b| b.2.total_cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(TOP_FACTORS)
        .map(|(kind, signal, _)| describe(kind, signal))
        .collect()
}

/// Render a signal as a reasoning statement.
pub fn describe(kind: SignalKind, signal: &Signal) -> String {
    match (&signal.evidence, kind) {
        (Some(Evidence::Position { position: p }), SignalKind::PracticePace) => match *p {
            p if p <= 3 => format!("Strong practice pace (P{p} in sessions)"),
            p if p <= 10 => format!("Midfield practice pace (P{p})"),
            p => format!("Practice pace P{p}"),
        },
        (Some(Evidence::Position { position: p }), _) => match *p {
            1 => "Pole position (qualifying P1)".to_string(),
            p if p <= 3 => format!("Front row start (qualifying P{p})"),
            p if p <= 5 => format!("Strong qualifying (P{p})"),
            p => format!("Qualifying P{p}"),
        },
        (Some(Evidence::RecentFinishes { positions }), _) if !positions.is_empty() => {
            let n = positions.len();
            let wins = positions.iter().filter(|&&p| p == 1).count();
            let podiums = positions.iter().filter(|&&p| p <= 3).count();
            let avg = mean(positions);
            if wins >= 2 {
                format!("Won {wins} of last {n} races")
            } else if podiums >= 2 {
                format!("{podiums} podiums in last {n} races")
            } else if avg <= 5.0 {
                format!("Strong recent form (avg P{avg:.0})")
            } else if avg <= 10.0 {
                format!("Consistent points finisher (avg P{avg:.0})")
            } else {
                format!("Recent average P{avg:.0}")
            }
        }
        (Some(Evidence::CircuitFinishes { positions }), _) if !positions.is_empty() => {
            let n = positions.len();
            let best = positions.iter().copied().min().unwrap_or(u32::MAX);
            let avg = mean(positions);
            if best == 1 {
                format!("Previous winner at this circuit (best P1 in last {n} editions)")
            } else if best <= 3 {
                format!("Podium history here (best P{best} in last {n} editions)")
            } else if avg <= 6.0 {
                format!("Good circuit record (avg P{avg:.0} over {n} editions)")
            } else {
                format!("Circuit history avg P{avg:.0}")
            }
        }
        (Some(Evidence::ConstructorPosition { position: p }), _) => match *p {
            p if p <= 2 => format!("Top team (constructor P{p})"),
            p if p <= 5 => format!("Midfield team (constructor P{p})"),
            p => format!("Constructor standing P{p}"),
        },
        (Some(Evidence::AverageDelta { delta }), _) => {
            if *delta > 1.5 {
                format!("Historically gains ~{delta:.0} positions at this track")
            } else if *delta < -1.5 {
                format!("Tends to lose ~{:.0} positions here", delta.abs())
            } else {
                "Usually holds grid position here".to_string()
            }
        }
        _ => describe_band(kind, signal.value),
    }
}

fn describe_band(kind: SignalKind, value: f64) -> String {
    let band = if value >= 0.75 {
        0
    } else if value >= 0.4 {
        1
    } else {
        2
    };
    let phrases: [&str; 3] = match kind {
        SignalKind::Qualifying => [
            "strong qualifying position",
            "midfield qualifying position",
            "starting toward the back",
        ],
        SignalKind::PracticePace => [
            "strong practice pace",
            "midfield practice pace",
            "off the pace in practice",
        ],
        SignalKind::RecentForm => ["strong recent form", "steady recent form", "poor recent form"],
        SignalKind::CircuitHistory => [
            "historically strong at this circuit",
            "mixed record at this circuit",
            "historically weak at this circuit",
        ],
        SignalKind::TeamStrength => ["strong car", "midfield car", "uncompetitive car"],
        SignalKind::GridDelta => [
            "tends to gain places in the race",
            "usually holds position in the race",
            "tends to lose places in the race",
        ],
    };
    phrases[band].to_string()
}

fn mean(values: &[u32]) -> f64 {
    values.iter().map(|&v| f64::from(v)).sum::<f64>() / values.len().max(1) as f64
}

/// A scored competitor waiting to be ranked.
#[derive(Debug, Clone)]
pub struct ScoredCompetitor {
    pub competitor: Competitor,
    pub assessment: Assessment,
    /// Qualifying position, used to break score ties.
    pub qualifying_position: Option<u32>,
}

/// Sort by score (descending), then qualifying position, then driver code,
/// and assign ranks from 1.
pub fn rank(mut scored: Vec<ScoredCompetitor>) -> Vec<Prediction> {
    scored.sort_by(|a, b| {
        b.assessment
            .score
            .total_cmp(&a.assessment.score)
            .then_with(|| cmp_grid(a.qualifying_position, b.qualifying_position))
            .then_with(|| a.competitor.code.cmp(&b.competitor.code))
    });

    scored
        .into_iter()
        .enumerate()
        .map(|(i, s)| Prediction {
            rank: i as u32 + 1,
            competitor: s.competitor,
            score: s.assessment.score,
            confidence: s.assessment.confidence,
            factors: s.assessment.factors,
        })
        .collect()
}

fn cmp_grid(a: Option<u32>, b: Option<u32>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
