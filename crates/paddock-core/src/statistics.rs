//! Rolling accuracy statistics over graded prediction records.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::accuracy::AccuracyRecord;
use crate::model::EventKey;

/// How one graded event turned out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventAccuracy {
    pub event: EventKey,
    /// Predicted winner actually won.
    pub winner_hit: bool,
    /// Drivers in both the predicted and actual top 3.
    pub top3_overlap: usize,
    /// Drivers in both the predicted and actual top 10.
    pub top10_overlap: usize,
    /// Mean absolute rank error over drivers present in both orders.
    pub mean_rank_error: Option<f64>,
    pub graded_competitors: usize,
}

/// Aggregate accuracy over a window of records.
///
/// Rates are fractions of graded events in `[0, 1]`, and are 0.0 when
/// nothing in the window has been graded yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyStats {
    /// Graded events in the window.
    pub races_evaluated: usize,
    /// Events in the window still waiting for a result.
    pub races_pending: usize,
    pub winner_hit_rate: f64,
    /// Fraction of events where the predicted and actual top 3 share a driver.
    pub top3_hit_rate: f64,
    /// Fraction of events where the predicted and actual top 10 share a driver.
    pub top10_hit_rate: f64,
    /// Average number of drivers shared by the predicted and actual top 3.
    pub mean_top3_overlap: f64,
    /// Mean absolute difference between predicted and actual rank, over all
    /// graded competitors.
    pub mean_rank_error: f64,
    pub graded_competitors: usize,
    /// Per-event breakdown, in event order.
    pub events: Vec<EventAccuracy>,
}

fn overlap(predicted: &[&str], actual: &[String], n: usize) -> usize {
    let actual: HashSet<&str> = actual.iter().take(n).map(String::as_str).collect();
    predicted.iter().take(n).filter(|c| actual.contains(*c)).count()
}

/// Grade one record; `None` while the race has no recorded result.
pub fn evaluate(record: &AccuracyRecord) -> Option<EventAccuracy> {
    let actual = record.actual.as_ref()?;
    let predicted = record.prediction.predicted_order();

    let actual_rank: HashMap<&str, usize> = actual
        .iter()
        .enumerate()
        .map(|(i, code)| (code.as_str(), i + 1))
        .collect();
    let errors: Vec<f64> = predicted
        .iter()
        .enumerate()
        .filter_map(|(i, code)| {
            actual_rank
                .get(code)
                .map(|&rank| (rank as f64 - (i + 1) as f64).abs())
        })
        .collect();

    Some(EventAccuracy {
        event: record.event,
        winner_hit: matches!((predicted.first(), actual.first()), (Some(p), Some(a)) if *p == a.as_str()),
        top3_overlap: overlap(&predicted, actual, 3),
        top10_overlap: overlap(&predicted, actual, 10),
        mean_rank_error: (!errors.is_empty()).then(|| errors.iter().sum::<f64>() / errors.len() as f64),
        graded_competitors: errors.len(),
    })
}

/// Aggregate a window of records. Ungraded records only count as pending.
pub fn compute_accuracy_stats(records: &[AccuracyRecord]) -> AccuracyStats {
    let events: Vec<EventAccuracy> = records.iter().filter_map(evaluate).collect();
    let evaluated = events.len();
    if evaluated == 0 {
        return AccuracyStats {
            races_pending: records.len(),
            ..AccuracyStats::default()
        };
    }

    let n = evaluated as f64;
    let rate = |hit: fn(&EventAccuracy) -> bool| events.iter().filter(|e| hit(e)).count() as f64 / n;

    let graded_competitors: usize = events.iter().map(|e| e.graded_competitors).sum();
    let total_error: f64 = events
        .iter()
        .filter_map(|e| e.mean_rank_error.map(|m| m * e.graded_competitors as f64))
        .sum();

    AccuracyStats {
        races_evaluated: evaluated,
        races_pending: records.len() - evaluated,
        winner_hit_rate: rate(|e| e.winner_hit),
        top3_hit_rate: rate(|e| e.top3_overlap > 0),
        top10_hit_rate: rate(|e| e.top10_overlap > 0),
        mean_top3_overlap: events.iter().map(|e| e.top3_overlap as f64).sum::<f64>() / n,
        mean_rank_error: if graded_competitors == 0 {
            0.0
        } else {
            total_error / graded_competitors as f64
        },
        graded_competitors,
        events,
    }
}
