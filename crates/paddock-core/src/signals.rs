//! Signal extraction.
//!
//! Extraction runs in two steps. [`gather`] performs every provider read a
//! request needs (once per event, not once per competitor) through the gate
//! and the read caches, absorbing failures per data source. Then
//! [`EventData::signals_for`] turns the gathered data into one normalized
//! [`SignalSet`] per competitor without touching the provider again.
//!
//! A failed or unavailable source marks only its own signal missing; it
//! never substitutes a default value.

use std::collections::{BTreeSet, HashSet};
use std::hash::Hash;

use futures::future::BoxFuture;

use crate::cache::{Caches, FreshCache};
use crate::error::PredictionError;
use crate::fallback::select_mode;
use crate::gate::ProviderGate;
use crate::model::{
    Classification, Competitor, ConstructorStanding, DataSource, EventInfo, EventKey, Evidence,
    FreshnessKey, RaceResult, SessionKind, Signal, SignalKind, SignalSet, WeightVariant,
};
use crate::traits::{DataProvider, ProviderResult};

/// Number of recent finishes feeding recent form.
pub const DEFAULT_RECENT_FORM_RACES: usize = 5;

/// Number of previous editions of the event searched for circuit history.
pub const DEFAULT_CIRCUIT_EDITIONS: usize = 3;

/// Field size used to normalize averaged finishing positions.
pub const AVERAGED_FIELD: u32 = 20;

/// Below this many current-season finishes, recent form reaches back a season.
const MIN_CURRENT_FINISHES: usize = 2;

/// Average delta (in places) mapped to the ends of the `[0, 1]` scale.
const DELTA_SPAN: f64 = 20.0;

/// How much history extraction looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionSettings {
    pub recent_form_races: usize,
    pub circuit_editions: usize,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            recent_form_races: DEFAULT_RECENT_FORM_RACES,
            circuit_editions: DEFAULT_CIRCUIT_EDITIONS,
        }
    }
}

/// Map a finishing or session position to `[0, 1]`, P1 being 1.0.
pub fn normalize_position(position: f64, field: u32) -> f64 {
    if field <= 1 {
        return 1.0;
    }
    (1.0 - (position - 1.0) / f64::from(field - 1)).clamp(0.0, 1.0)
}

/// Map an average grid-to-finish delta to `[0, 1]`; holding position is 0.5.
pub fn normalize_delta(delta: f64) -> f64 {
    (0.5 + delta / DELTA_SPAN).clamp(0.0, 1.0)
}

/// Case-insensitive substring match in either direction
/// ("Red Bull Racing" matches "Red Bull").
pub fn teams_match(a: &str, b: &str) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a))
}

/// Constructor championship position of `team`, if it can be matched.
pub fn team_position(team: &str, standings: &[ConstructorStanding]) -> Option<u32> {
    standings
        .iter()
        .find(|s| teams_match(team, &s.team))
        .map(|s| s.position)
}

fn classified_field(rows: &[Classification]) -> u32 {
    let classified = rows.iter().filter(|r| r.position.is_some()).count() as u32;
    let deepest = rows.iter().filter_map(|r| r.position).max().unwrap_or(0);
    classified.max(deepest)
}

fn position_of(rows: &[Classification], code: &str) -> Option<u32> {
    rows.iter()
        .find(|r| r.competitor.code == code)
        .and_then(|r| r.position)
}

fn finishes(races: &[RaceResult], code: &str) -> Vec<u32> {
    races
        .iter()
        .filter_map(|race| position_of(&race.classification, code))
        .collect()
}

fn mean(values: &[u32]) -> f64 {
    values.iter().map(|&v| f64::from(v)).sum::<f64>() / values.len() as f64
}

/// Everything the provider told us about one event, shared by all competitors.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub event: EventKey,
    pub grand_prix: String,
    /// Circuit identity from the schedule; `None` when the schedule was unavailable.
    pub circuit: Option<String>,
    pub qualifying: Option<Vec<Classification>>,
    /// The practice session standing in for qualifying, if one was used.
    pub practice: Option<(SessionKind, Vec<Classification>)>,
    pub roster: Vec<Competitor>,
    /// Current-season races run before this event, in round order.
    pub recent_races: Option<Vec<RaceResult>>,
    /// Previous-season races, only fetched when someone lacks current finishes.
    pub previous_races: Option<Vec<RaceResult>>,
    /// Race classifications of previous editions at this circuit, newest first.
    pub circuit_races: Option<Vec<Vec<Classification>>>,
    pub standings: Option<Vec<ConstructorStanding>>,
    pub sources: BTreeSet<DataSource>,
    pub warnings: Vec<String>,
    /// Provider reads that failed (as opposed to data not existing yet).
    pub provider_errors: usize,
}

impl EventData {
    pub fn new(event: EventKey) -> Self {
        Self {
            event,
            grand_prix: format!("Round {}", event.round),
            circuit: None,
            qualifying: None,
            practice: None,
            roster: Vec::new(),
            recent_races: None,
            previous_races: None,
            circuit_races: None,
            standings: None,
            sources: BTreeSet::new(),
            warnings: Vec::new(),
            provider_errors: 0,
        }
    }

    pub fn mode(&self) -> WeightVariant {
        select_mode(self.qualifying.is_some())
    }

    pub fn qualifying_position(&self, code: &str) -> Option<u32> {
        self.qualifying
            .as_deref()
            .and_then(|rows| position_of(rows, code))
    }

    /// Build one competitor's signals. Every signal the current mode uses is
    /// recorded, either present or explicitly missing.
    pub fn signals_for(&self, competitor: &Competitor, settings: &ExtractionSettings) -> SignalSet {
        let code = competitor.code.as_str();
        let mut set = SignalSet::new();

        match self.mode() {
            WeightVariant::QualifyingKnown => {
                put(&mut set, SignalKind::Qualifying, self.qualifying_signal(code));
            }
            WeightVariant::PreQualifying => {
                set.mark_missing(SignalKind::Qualifying);
                put(&mut set, SignalKind::PracticePace, self.practice_signal(code));
            }
        }
        put(&mut set, SignalKind::RecentForm, self.recent_form_signal(code, settings));
        put(&mut set, SignalKind::CircuitHistory, self.circuit_signal(code));
        put(&mut set, SignalKind::TeamStrength, self.team_signal(&competitor.team));
        put(&mut set, SignalKind::GridDelta, self.grid_delta_signal(code));

        let missing: Vec<String> = SignalKind::CANONICAL
            .iter()
            .filter(|k| set.get(**k).is_none())
            .map(|k| k.to_string())
            .collect();
        if !missing.is_empty() {
            tracing::debug!(driver = code, missing = ?missing, "signals missing");
        }
        set
    }

    fn qualifying_signal(&self, code: &str) -> Option<Signal> {
        let rows = self.qualifying.as_deref()?;
        session_signal(rows, code)
    }

    fn practice_signal(&self, code: &str) -> Option<Signal> {
        let (_, rows) = self.practice.as_ref()?;
        session_signal(rows, code)
    }

    fn recent_form_signal(&self, code: &str, settings: &ExtractionSettings) -> Option<Signal> {
        let n = settings.recent_form_races;
        let mut positions = self
            .recent_races
            .as_deref()
            .map(|races| finishes(races, code))
            .unwrap_or_default();
        if positions.len() < MIN_CURRENT_FINISHES {
            if let Some(previous) = self.previous_races.as_deref() {
                let earlier = finishes(previous, code);
                let skip = earlier.len().saturating_sub(n);
                let mut combined: Vec<u32> = earlier[skip..].to_vec();
                combined.extend(positions);
                positions = combined;
            }
        }
        let skip = positions.len().saturating_sub(n);
        let positions: Vec<u32> = positions[skip..].to_vec();
        if positions.is_empty() {
            return None;
        }
        let value = normalize_position(mean(&positions), AVERAGED_FIELD);
        Some(Signal::with_evidence(value, Evidence::RecentFinishes { positions }))
    }

    fn circuit_signal(&self, code: &str) -> Option<Signal> {
        let editions = self.circuit_races.as_deref()?;
        let positions: Vec<u32> = editions
            .iter()
            .filter_map(|rows| position_of(rows, code))
            .collect();
        if positions.is_empty() {
            return None;
        }
        let value = normalize_position(mean(&positions), AVERAGED_FIELD);
        Some(Signal::with_evidence(value, Evidence::CircuitFinishes { positions }))
    }

    fn team_signal(&self, team: &str) -> Option<Signal> {
        let standings = self.standings.as_deref()?;
        let position = team_position(team, standings)?;
        let field = standings.len() as u32;
        let value = normalize_position(f64::from(position), field.max(position));
        Some(Signal::with_evidence(value, Evidence::ConstructorPosition { position }))
    }

    fn grid_delta_signal(&self, code: &str) -> Option<Signal> {
        let editions = self.circuit_races.as_deref()?;
        let deltas: Vec<f64> = editions
            .iter()
            .filter_map(|rows| rows.iter().find(|r| r.competitor.code == code))
            .filter_map(|row| match (row.grid, row.position) {
                // Grid 0 is a pit-lane start.
                (Some(grid), Some(finish)) if grid > 0 => Some(f64::from(grid) - f64::from(finish)),
                _ => None,
            })
            .collect();
        if deltas.is_empty() {
            return None;
        }
        let delta = deltas.iter().sum::<f64>() / deltas.len() as f64;
        Some(Signal::with_evidence(normalize_delta(delta), Evidence::AverageDelta { delta }))
    }
}

fn put(set: &mut SignalSet, kind: SignalKind, signal: Option<Signal>) {
    match signal {
        Some(signal) => set.set(kind, signal),
        None => set.mark_missing(kind),
    }
}

fn session_signal(rows: &[Classification], code: &str) -> Option<Signal> {
    let position = position_of(rows, code)?;
    let value = normalize_position(f64::from(position), classified_field(rows));
    Some(Signal::with_evidence(value, Evidence::Position { position }))
}

/// Provider reads for one request, routed through the gate and the caches.
///
/// `fresh` is the request's freshness key; `None` means it could not be
/// determined, and current-season reads then bypass the caches.
/// Previous seasons are settled and always cached.
pub struct Reader<'a> {
    gate: &'a ProviderGate,
    caches: &'a Caches,
    season: u16,
    fresh: Option<FreshnessKey>,
}

impl<'a> Reader<'a> {
    pub fn new(gate: &'a ProviderGate, caches: &'a Caches, season: u16, fresh: Option<FreshnessKey>) -> Self {
        Self {
            gate,
            caches,
            season,
            fresh,
        }
    }

    fn key_for(&self, season: u16) -> Option<FreshnessKey> {
        if season < self.season {
            Some(FreshnessKey::SETTLED)
        } else {
            self.fresh
        }
    }

    async fn read<K, T>(
        &self,
        cache: &FreshCache<K, Option<T>>,
        key: K,
        fresh: Option<FreshnessKey>,
        op: &'static str,
        read: impl FnOnce(&'a dyn DataProvider) -> BoxFuture<'a, ProviderResult<T>>,
    ) -> ProviderResult<T>
    where
        K: Eq + Hash,
        T: Clone,
    {
        match fresh {
            Some(fresh) => self.gate.read_through(cache, key, fresh, op, read).await,
            None => self.gate.call(op, read).await,
        }
    }

    pub async fn schedule(&self, season: u16) -> ProviderResult<Vec<EventInfo>> {
        self.read(&self.caches.schedules, season, self.key_for(season), "schedule", move |p| {
            p.schedule(season)
        })
        .await
    }

    pub async fn session(&self, event: EventKey, kind: SessionKind) -> ProviderResult<Vec<Classification>> {
        self.read(
            &self.caches.sessions,
            (event, kind),
            self.key_for(event.season),
            "session_results",
            move |p| p.session_results(event, kind),
        )
        .await
    }

    pub async fn season_results(&self, season: u16) -> ProviderResult<Vec<RaceResult>> {
        self.read(
            &self.caches.season_results,
            season,
            self.key_for(season),
            "season_results",
            move |p| p.season_results(season),
        )
        .await
    }

    pub async fn standings(&self, season: u16) -> ProviderResult<Vec<ConstructorStanding>> {
        self.read(
            &self.caches.standings,
            season,
            self.key_for(season),
            "constructor_standings",
            move |p| p.constructor_standings(season),
        )
        .await
    }

    pub async fn entry_list(&self, event: EventKey) -> ProviderResult<Vec<Competitor>> {
        self.read(
            &self.caches.entry_lists,
            event,
            self.key_for(event.season),
            "entry_list",
            move |p| p.entry_list(event),
        )
        .await
    }
}

/// Collapse a provider read into "usable data or not", recording errors as warnings.
fn usable<T>(
    result: ProviderResult<Vec<T>>,
    what: &str,
    warnings: &mut Vec<String>,
    errors: &mut usize,
) -> Option<Vec<T>> {
    match result {
        Ok(Some(rows)) if !rows.is_empty() => Some(rows),
        Ok(_) => None,
        Err(e) => {
            warnings.push(format!("{what} unavailable: {e}"));
            *errors += 1;
            None
        }
    }
}

/// Perform every provider read needed to predict `event`.
///
/// Only a missing roster fails the request; every other gap becomes missing
/// signals plus a warning.
pub async fn gather(
    reader: &Reader<'_>,
    event: EventKey,
    settings: &ExtractionSettings,
) -> Result<EventData, PredictionError> {
    let mut data = EventData::new(event);
    let season = event.season;

    match reader.schedule(season).await {
        Ok(Some(schedule)) => {
            if let Some(info) = schedule.into_iter().find(|e| e.key == event) {
                data.grand_prix = info.name;
                data.circuit = Some(info.circuit);
            }
        }
        Ok(None) => {}
        Err(e) => {
            data.provider_errors += 1;
            data.warnings.push(format!("Could not load event schedule: {e}"));
        }
    }

    // Qualifying, else the latest practice session that has run.
    data.qualifying = usable(
        reader.session(event, SessionKind::Qualifying).await,
        "Qualifying",
        &mut data.warnings,
        &mut data.provider_errors,
    );
    if let Some(rows) = &data.qualifying {
        tracing::info!(%event, drivers = rows.len(), "qualifying loaded");
        data.sources.insert(DataSource::Qualifying);
    } else {
        for kind in SessionKind::PRACTICE_FALLBACK {
            let practice = usable(
                reader.session(event, kind).await,
                "Practice",
                &mut data.warnings,
                &mut data.provider_errors,
            );
            if let Some(rows) = practice {
                tracing::info!(%event, session = %kind, drivers = rows.len(), "practice fallback engaged");
                data.practice = Some((kind, rows));
                break;
            }
        }
        if data.practice.is_some() {
            data.sources.insert(DataSource::Practice);
            data.warnings
                .push("Qualifying data unavailable; using practice session pace as proxy".to_string());
        } else {
            data.warnings
                .push("No qualifying or practice data available; using historical data only".to_string());
        }
    }

    data.roster = roster(&data);
    if data.roster.is_empty() {
        let entrants = usable(
            reader.entry_list(event).await,
            "Entry list",
            &mut data.warnings,
            &mut data.provider_errors,
        );
        if let Some(entrants) = entrants {
            data.sources.insert(DataSource::EntryList);
            data.roster = dedupe(entrants);
        }
    }
    if data.roster.is_empty() {
        tracing::error!(%event, "no driver data");
        return Err(PredictionError::NoEntrants(event));
    }

    gather_recent_races(reader, &mut data).await;
    gather_standings(reader, &mut data).await;
    gather_circuit_history(reader, &mut data, settings).await;

    Ok(data)
}

fn roster(data: &EventData) -> Vec<Competitor> {
    let rows = data
        .qualifying
        .as_deref()
        .or_else(|| data.practice.as_ref().map(|(_, rows)| rows.as_slice()))
        .unwrap_or_default();
    dedupe(rows.iter().map(|r| r.competitor.clone()).collect())
}

fn dedupe(competitors: Vec<Competitor>) -> Vec<Competitor> {
    let mut seen = HashSet::new();
    competitors
        .into_iter()
        .filter(|c| !c.code.is_empty() && seen.insert(c.code.clone()))
        .collect()
}

async fn gather_recent_races(reader: &Reader<'_>, data: &mut EventData) {
    let event = data.event;
    let current = usable(
        reader.season_results(event.season).await,
        "Recent race results",
        &mut data.warnings,
        &mut data.provider_errors,
    )
    .map(|races| {
        races
            .into_iter()
            .filter(|r| r.event.season == event.season && r.event.round < event.round)
            .collect::<Vec<_>>()
    });

    let needs_previous = data.roster.iter().any(|c| {
        current
            .as_deref()
            .map(|races| finishes(races, &c.code).len())
            .unwrap_or(0)
            < MIN_CURRENT_FINISHES
    });
    if needs_previous {
        if let Some(previous_season) = event.season.checked_sub(1) {
            data.previous_races = usable(
                reader.season_results(previous_season).await,
                "Previous season results",
                &mut data.warnings,
                &mut data.provider_errors,
            );
        }
    }

    let any_finish = |races: &Option<Vec<RaceResult>>| {
        races
            .as_deref()
            .is_some_and(|races| races.iter().any(|r| !r.classification.is_empty()))
    };
    if any_finish(&current) || any_finish(&data.previous_races) {
        data.sources.insert(DataSource::RecentRaces);
    }
    data.recent_races = current;
}

async fn gather_standings(reader: &Reader<'_>, data: &mut EventData) {
    let season = data.event.season;
    let mut errors = Vec::new();
    let mut standings = usable(
        reader.standings(season).await,
        "Constructor standings",
        &mut errors,
        &mut data.provider_errors,
    );
    if standings.is_none() {
        if let Some(previous) = season.checked_sub(1) {
            standings = usable(
                reader.standings(previous).await,
                "Previous constructor standings",
                &mut errors,
                &mut data.provider_errors,
            );
            if standings.is_some() {
                tracing::info!(season, "using previous season constructor standings");
            }
        }
    }
    match standings {
        Some(rows) => {
            data.sources.insert(DataSource::ConstructorStandings);
            data.standings = Some(rows);
        }
        None => {
            data.warnings.extend(errors);
            data.warnings.push("Constructor standings unavailable".to_string());
        }
    }
}

async fn gather_circuit_history(reader: &Reader<'_>, data: &mut EventData, settings: &ExtractionSettings) {
    let Some(circuit) = data.circuit.clone() else {
        return;
    };
    let mut editions = Vec::new();
    let mut failures = 0usize;

    for back in 1..=settings.circuit_editions {
        let Some(season) = u16::try_from(back).ok().and_then(|b| data.event.season.checked_sub(b)) else {
            break;
        };
        let edition = match reader.schedule(season).await {
            Ok(Some(schedule)) => schedule.into_iter().find(|e| e.circuit == circuit),
            Ok(None) => None,
            Err(_) => {
                failures += 1;
                None
            }
        };
        let Some(edition) = edition else {
            tracing::debug!(%circuit, season, "no edition at circuit");
            continue;
        };
        match reader.session(edition.key, SessionKind::Race).await {
            Ok(Some(rows)) if !rows.is_empty() => editions.push(rows),
            Ok(_) => {}
            Err(_) => failures += 1,
        }
    }

    if failures > 0 {
        data.provider_errors += failures;
        data.warnings
            .push(format!("Circuit history incomplete: {failures} previous edition(s) could not be loaded"));
    }
    if editions.is_empty() {
        return;
    }
    tracing::info!(%circuit, editions = editions.len(), "circuit history loaded");
    data.sources.insert(DataSource::CircuitHistory);
    let has_grid = editions
        .iter()
        .flatten()
        .any(|r| r.grid.is_some_and(|g| g > 0) && r.position.is_some());
    if has_grid {
        data.sources.insert(DataSource::GridDelta);
    }
    data.circuit_races = Some(editions);
}
