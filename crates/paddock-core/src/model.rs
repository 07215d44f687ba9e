//! Core data model types for paddock.
//!
//! Event identities, competitors, session classifications, signals, and the
//! prediction snapshots that flow from the scoring engine into the accuracy
//! store.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CompetitorError;

/// Identity of a single race weekend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    /// Championship season (e.g. 2025).
    pub season: u16,
    /// Round number within the season calendar.
    pub round: u8,
}

impl EventKey {
    pub fn new(season: u16, round: u8) -> Self {
        Self { season, round }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-R{:02}", self.season, self.round)
    }
}

impl FromStr for EventKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (season, round) = s
            .split_once("-R")
            .ok_or_else(|| format!("invalid event key: {s}"))?;
        let season = season
            .parse::<u16>()
            .map_err(|_| format!("invalid season in event key: {s}"))?;
        let round = round
            .parse::<u8>()
            .map_err(|_| format!("invalid round in event key: {s}"))?;
        Ok(Self { season, round })
    }
}

/// Sessions of a race weekend, ordered by when they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Practice1,
    Practice2,
    Practice3,
    Qualifying,
    Race,
}

impl SessionKind {
    /// Practice sessions in the order they should be tried as a qualifying proxy.
    pub const PRACTICE_FALLBACK: [SessionKind; 3] = [
        SessionKind::Practice3,
        SessionKind::Practice2,
        SessionKind::Practice1,
    ];
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Practice1 => write!(f, "FP1"),
            SessionKind::Practice2 => write!(f, "FP2"),
            SessionKind::Practice3 => write!(f, "FP3"),
            SessionKind::Qualifying => write!(f, "Q"),
            SessionKind::Race => write!(f, "R"),
        }
    }
}

/// A specific session of a specific event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionRef {
    pub event: EventKey,
    pub kind: SessionKind,
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.event, self.kind)
    }
}

/// Identity of the freshest session with data known for an event.
///
/// Cached entries are only valid while their stored key equals the current
/// one; any newer session makes them stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FreshnessKey(pub Option<SessionRef>);

impl FreshnessKey {
    /// Key for historical data that can no longer change.
    pub const SETTLED: FreshnessKey = FreshnessKey(None);
}

impl fmt::Display for FreshnessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(session) => write!(f, "{session}"),
            None => write!(f, "none"),
        }
    }
}

/// A driver entered in an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Competitor {
    /// Three-letter driver code (e.g. "VER").
    pub code: String,
    /// Full driver name.
    #[serde(default)]
    pub name: String,
    /// Team name as reported by the data provider.
    #[serde(default)]
    pub team: String,
}

impl Competitor {
    pub fn new(code: &str, name: &str, team: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            team: team.to_string(),
        }
    }
}

/// One row of a session result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub competitor: Competitor,
    /// Classified position; `None` when the driver was not classified.
    pub position: Option<u32>,
    /// Starting grid slot for races; `None` or `Some(0)` for pit-lane starts.
    #[serde(default)]
    pub grid: Option<u32>,
}

/// Schedule entry for an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfo {
    pub key: EventKey,
    /// Grand Prix name (e.g. "Italian Grand Prix").
    pub name: String,
    /// Circuit identity, stable across seasons (e.g. "monza").
    pub circuit: String,
}

/// A constructor championship position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructorStanding {
    pub team: String,
    pub position: u32,
}

/// Classified race result for one round of a season.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceResult {
    pub event: EventKey,
    pub classification: Vec<Classification>,
}

/// The inputs the scoring model understands.
///
/// The first five are the canonical signals; `PracticePace` only appears in
/// pre-qualifying mode as a stand-in for qualifying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Qualifying,
    RecentForm,
    CircuitHistory,
    TeamStrength,
    GridDelta,
    PracticePace,
}

impl SignalKind {
    pub const CANONICAL: [SignalKind; 5] = [
        SignalKind::Qualifying,
        SignalKind::RecentForm,
        SignalKind::CircuitHistory,
        SignalKind::TeamStrength,
        SignalKind::GridDelta,
    ];
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Qualifying => write!(f, "qualifying"),
            SignalKind::RecentForm => write!(f, "recent_form"),
            SignalKind::CircuitHistory => write!(f, "circuit_history"),
            SignalKind::TeamStrength => write!(f, "team_strength"),
            SignalKind::GridDelta => write!(f, "grid_delta"),
            SignalKind::PracticePace => write!(f, "practice_pace"),
        }
    }
}

/// Raw facts behind a normalized signal, kept so reasoning factors can quote them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Evidence {
    /// A single session position (qualifying or practice).
    Position { position: u32 },
    /// Recent race finishes, oldest first.
    RecentFinishes { positions: Vec<u32> },
    /// Finishes at this circuit in previous editions.
    CircuitFinishes { positions: Vec<u32> },
    /// Constructor championship position.
    ConstructorPosition { position: u32 },
    /// Average places gained (positive) or lost (negative) from grid to flag.
    AverageDelta { delta: f64 },
}

/// One normalized input. `value` is in `[0, 1]`, 1.0 being best.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub value: f64,
    #[serde(default)]
    pub evidence: Option<Evidence>,
}

impl Signal {
    pub fn new(value: f64) -> Self {
        Self {
            value: value.clamp(0.0, 1.0),
            evidence: None,
        }
    }

    pub fn with_evidence(value: f64, evidence: Evidence) -> Self {
        Self {
            value: value.clamp(0.0, 1.0),
            evidence: Some(evidence),
        }
    }
}

/// Per-competitor signals for one prediction run. Absent keys and `None`
/// values both mean "missing".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalSet {
    signals: BTreeMap<SignalKind, Option<Signal>>,
}

impl SignalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, kind: SignalKind, signal: Signal) {
        self.signals.insert(kind, Some(signal));
    }

    pub fn mark_missing(&mut self, kind: SignalKind) {
        self.signals.insert(kind, None);
    }

    /// Builder-style helper, mostly for tests and benches.
    pub fn with(mut self, kind: SignalKind, value: Option<f64>) -> Self {
        match value {
            Some(v) => self.set(kind, Signal::new(v)),
            None => self.mark_missing(kind),
        }
        self
    }

    pub fn get(&self, kind: SignalKind) -> Option<&Signal> {
        self.signals.get(&kind).and_then(|s| s.as_ref())
    }

    /// Present signals in canonical order.
    pub fn present(&self) -> impl Iterator<Item = (SignalKind, &Signal)> {
        self.signals
            .iter()
            .filter_map(|(kind, signal)| signal.as_ref().map(|s| (*kind, s)))
    }

    pub fn present_kinds(&self) -> BTreeSet<SignalKind> {
        self.present().map(|(kind, _)| kind).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.present().next().is_none()
    }
}

/// Which weighting scheme produced a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightVariant {
    QualifyingKnown,
    PreQualifying,
}

impl fmt::Display for WeightVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightVariant::QualifyingKnown => write!(f, "qualifying-known"),
            WeightVariant::PreQualifying => write!(f, "pre-qualifying"),
        }
    }
}

/// Data sources that actually contributed to a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Qualifying,
    Practice,
    RecentRaces,
    CircuitHistory,
    ConstructorStandings,
    GridDelta,
    EntryList,
}

/// Model certainty in a predicted rank, as whole percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceRange {
    pub low: u8,
    pub high: u8,
}

impl ConfidenceRange {
    pub fn width(&self) -> u8 {
        self.high.saturating_sub(self.low)
    }
}

impl fmt::Display for ConfidenceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}%", self.low, self.high)
    }
}

/// A ranked competitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Predicted finishing position, starting at 1.
    pub rank: u32,
    pub competitor: Competitor,
    /// Weighted score in `[0, 1]`; higher is better.
    pub score: f64,
    pub confidence: ConfidenceRange,
    /// Up to three human-readable reasoning factors, strongest first.
    pub factors: Vec<String>,
}

/// Full prediction for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSet {
    pub id: Uuid,
    pub event: EventKey,
    /// Grand Prix name, or "Round N" when the schedule was unavailable.
    pub grand_prix: String,
    pub generated_at: DateTime<Utc>,
    pub variant: WeightVariant,
    pub data_sources: BTreeSet<DataSource>,
    /// Ranked competitors, best first.
    pub predictions: Vec<Prediction>,
    /// Competitors that could not be scored.
    #[serde(default)]
    pub excluded: Vec<CompetitorError>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl PredictionSet {
    /// Driver codes in predicted finishing order.
    pub fn predicted_order(&self) -> Vec<&str> {
        self.predictions
            .iter()
            .map(|p| p.competitor.code.as_str())
            .collect()
    }

    pub fn get(&self, code: &str) -> Option<&Prediction> {
        self.predictions.iter().find(|p| p.competitor.code == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_key_display_and_parse() {
        let key = EventKey::new(2024, 5);
        assert_eq!(key.to_string(), "2024-R05");
        assert_eq!("2024-R05".parse::<EventKey>().unwrap(), key);
        assert_eq!("2023-R21".parse::<EventKey>().unwrap(), EventKey::new(2023, 21));
        assert!("2024".parse::<EventKey>().is_err());
        assert!("abcd-R01".parse::<EventKey>().is_err());
    }

    #[test]
    fn session_refs_order_by_event_then_session() {
        let fp1 = SessionRef {
            event: EventKey::new(2024, 6),
            kind: SessionKind::Practice1,
        };
        let prev_race = SessionRef {
            event: EventKey::new(2024, 5),
            kind: SessionKind::Race,
        };
        let quali = SessionRef {
            event: EventKey::new(2024, 6),
            kind: SessionKind::Qualifying,
        };
        assert!(prev_race < fp1);
        assert!(fp1 < quali);
    }

    #[test]
    fn signal_values_are_clamped() {
        assert_eq!(Signal::new(1.7).value, 1.0);
        assert_eq!(Signal::new(-0.2).value, 0.0);
    }

    #[test]
    fn signal_set_tracks_missing() {
        let set = SignalSet::new()
            .with(SignalKind::Qualifying, Some(0.9))
            .with(SignalKind::CircuitHistory, None)
            .with(SignalKind::TeamStrength, Some(0.5));

        assert!(set.get(SignalKind::CircuitHistory).is_none());
        assert!(set.get(SignalKind::GridDelta).is_none());
        let kinds: Vec<_> = set.present().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![SignalKind::Qualifying, SignalKind::TeamStrength]);
        assert!(!set.is_empty());
        assert!(SignalSet::new().with(SignalKind::RecentForm, None).is_empty());
    }
}
