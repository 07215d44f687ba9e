//! Ergast-compatible results API provider (Jolpica mirror by default).
//!
//! The API serves schedules, qualifying and race classifications, and
//! championship standings. It has no practice timing, so practice sessions
//! always read as "not yet available".

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use paddock_core::error::ProviderError;
use paddock_core::model::{
    Classification, Competitor, ConstructorStanding, EventInfo, EventKey, RaceResult, SessionKind,
    SessionRef,
};
use paddock_core::traits::{DataProvider, ProviderResult};

pub const DEFAULT_BASE_URL: &str = "https://api.jolpi.ca/ergast/f1";
/// Largest page the API hands out.
const PAGE_SIZE: u32 = 100;
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// HTTP client for an Ergast-compatible API.
pub struct ErgastProvider {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl ErgastProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let base = if base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            base_url
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NetworkError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base.trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch one page of `path` (relative to the base URL, e.g. `2024/5/results/`).
    async fn fetch(&self, path: &str, limit: u32, offset: u32) -> Result<MrData, ProviderError> {
        let start = Instant::now();
        let url = format!("{}/{path}?limit={limit}&offset={offset}", self.base_url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.timeout)
            } else if e.is_connect() {
                ProviderError::NetworkError(format!("results API not reachable at {}: {e}", self.base_url))
            } else {
                ProviderError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
                * 1000;
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry_after,
            });
        }
        if status == 401 || status == 403 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::AuthenticationFailed(body));
        }
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status,
                message: body,
            });
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(format!("failed to parse response: {e}")))?;

        tracing::debug!(
            path,
            offset,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "results API page fetched"
        );
        Ok(envelope.data)
    }

    async fn races(&self, path: &str, limit: u32) -> Result<Vec<Race>, ProviderError> {
        Ok(self.fetch(path, limit, 0).await?.races())
    }

    /// Every page of a race-table endpoint. A race split across two pages
    /// comes back as two partial entries.
    async fn all_races(&self, path: &str) -> Result<Vec<Race>, ProviderError> {
        let mut races = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.fetch(path, PAGE_SIZE, offset).await?;
            let total = page.total()?;
            races.extend(page.races());
            offset += PAGE_SIZE;
            if offset >= total {
                return Ok(races);
            }
        }
    }

    async fn race_classification(&self, event: EventKey) -> ProviderResult<Vec<Classification>> {
        let path = format!("{}/{}/results/", event.season, event.round);
        let races = self.races(&path, PAGE_SIZE).await?;
        let rows = match races.into_iter().next() {
            Some(race) => race.results.into_iter().map(ResultRow::into_classification).collect(),
            None => Vec::new(),
        };
        Ok(non_empty(rows))
    }

    async fn qualifying_classification(&self, event: EventKey) -> ProviderResult<Vec<Classification>> {
        let path = format!("{}/{}/qualifying/", event.season, event.round);
        let races = self.races(&path, PAGE_SIZE).await?;
        let rows = match races.into_iter().next() {
            Some(race) => race
                .qualifying
                .into_iter()
                .map(QualifyingRow::into_classification)
                .collect(),
            None => Vec::new(),
        };
        Ok(non_empty(rows))
    }

    async fn has_rows(&self, path: String) -> Result<bool, ProviderError> {
        Ok(!self.races(&path, 1).await?.is_empty())
    }

    async fn driver_standings(&self, season: u16) -> Result<Vec<Competitor>, ProviderError> {
        let data = self.fetch(&format!("{season}/driverstandings/"), PAGE_SIZE, 0).await?;
        Ok(data
            .standings_lists()
            .into_iter()
            .flat_map(|list| list.driver_standings)
            .map(|row| {
                let team = row
                    .constructors
                    .last()
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                row.driver.into_competitor(team)
            })
            .collect())
    }
}

fn non_empty<T>(rows: Vec<T>) -> Option<Vec<T>> {
    (!rows.is_empty()).then_some(rows)
}

fn parse_num<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, ProviderError> {
    value
        .trim()
        .parse()
        .map_err(|_| ProviderError::Malformed(format!("invalid {what}: {value:?}")))
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "MRData")]
    data: MrData,
}

#[derive(Deserialize, Default)]
struct MrData {
    #[serde(default)]
    total: Option<String>,
    #[serde(rename = "RaceTable", default)]
    race_table: Option<RaceTable>,
    #[serde(rename = "StandingsTable", default)]
    standings_table: Option<StandingsTable>,
}

impl MrData {
    fn total(&self) -> Result<u32, ProviderError> {
        match &self.total {
            Some(total) => parse_num(total, "total"),
            None => Ok(0),
        }
    }

    fn races(self) -> Vec<Race> {
        self.race_table.map(|t| t.races).unwrap_or_default()
    }

    fn standings_lists(self) -> Vec<StandingsList> {
        self.standings_table.map(|t| t.lists).unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct RaceTable {
    #[serde(rename = "Races", default)]
    races: Vec<Race>,
}

#[derive(Deserialize)]
struct Race {
    season: String,
    round: String,
    #[serde(rename = "raceName", default)]
    race_name: String,
    #[serde(rename = "Circuit")]
    circuit: Option<Circuit>,
    #[serde(rename = "Results", default)]
    results: Vec<ResultRow>,
    #[serde(rename = "QualifyingResults", default)]
    qualifying: Vec<QualifyingRow>,
}

impl Race {
    fn key(&self) -> Result<EventKey, ProviderError> {
        Ok(EventKey::new(
            parse_num(&self.season, "season")?,
            parse_num(&self.round, "round")?,
        ))
    }
}

#[derive(Deserialize)]
struct Circuit {
    #[serde(rename = "circuitId")]
    circuit_id: String,
}

#[derive(Deserialize)]
struct Driver {
    #[serde(rename = "driverId")]
    driver_id: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(rename = "givenName", default)]
    given_name: String,
    #[serde(rename = "familyName", default)]
    family_name: String,
}

impl Driver {
    fn into_competitor(self, team: String) -> Competitor {
        // Drivers from before three-letter codes existed only carry an id.
        let code = self.code.unwrap_or_else(|| {
            self.driver_id
                .chars()
                .filter(|c| c.is_ascii_alphabetic())
                .take(3)
                .collect::<String>()
                .to_uppercase()
        });
        Competitor {
            code,
            name: format!("{} {}", self.given_name, self.family_name).trim().to_string(),
            team,
        }
    }
}

#[derive(Deserialize)]
struct Constructor {
    name: String,
}

#[derive(Deserialize)]
struct ResultRow {
    #[serde(rename = "positionText", default)]
    position_text: String,
    #[serde(default)]
    grid: Option<String>,
    #[serde(rename = "Driver")]
    driver: Driver,
    #[serde(rename = "Constructor")]
    constructor: Constructor,
}

impl ResultRow {
    fn into_classification(self) -> Classification {
        // positionText is "R", "D", "W", ... for unclassified finishers.
        Classification {
            position: self.position_text.parse().ok(),
            grid: self.grid.and_then(|g| g.parse().ok()),
            competitor: self.driver.into_competitor(self.constructor.name),
        }
    }
}

#[derive(Deserialize)]
struct QualifyingRow {
    #[serde(default)]
    position: Option<String>,
    #[serde(rename = "Driver")]
    driver: Driver,
    #[serde(rename = "Constructor")]
    constructor: Constructor,
}

impl QualifyingRow {
    fn into_classification(self) -> Classification {
        Classification {
            position: self.position.and_then(|p| p.parse().ok()),
            grid: None,
            competitor: self.driver.into_competitor(self.constructor.name),
        }
    }
}

#[derive(Deserialize)]
struct StandingsTable {
    #[serde(rename = "StandingsLists", default)]
    lists: Vec<StandingsList>,
}

#[derive(Deserialize)]
struct StandingsList {
    #[serde(rename = "ConstructorStandings", default)]
    constructor_standings: Vec<ConstructorStandingRow>,
    #[serde(rename = "DriverStandings", default)]
    driver_standings: Vec<DriverStandingRow>,
}

#[derive(Deserialize)]
struct ConstructorStandingRow {
    #[serde(default)]
    position: Option<String>,
    #[serde(rename = "Constructor")]
    constructor: Constructor,
}

#[derive(Deserialize)]
struct DriverStandingRow {
    #[serde(rename = "Driver")]
    driver: Driver,
    #[serde(rename = "Constructors", default)]
    constructors: Vec<Constructor>,
}

#[async_trait]
impl DataProvider for ErgastProvider {
    fn name(&self) -> &str {
        "ergast"
    }

    #[instrument(skip(self))]
    async fn latest_session(&self, event: EventKey) -> ProviderResult<SessionRef> {
        let (season, round) = (event.season, event.round);
        if self.has_rows(format!("{season}/{round}/results/")).await? {
            return Ok(Some(SessionRef { event, kind: SessionKind::Race }));
        }
        if self.has_rows(format!("{season}/{round}/qualifying/")).await? {
            return Ok(Some(SessionRef { event, kind: SessionKind::Qualifying }));
        }
        let last = self.races(&format!("{season}/last/results/"), 1).await?;
        match last.first() {
            Some(race) => {
                let key = race.key()?;
                Ok((key <= event).then_some(SessionRef { event: key, kind: SessionKind::Race }))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn schedule(&self, season: u16) -> ProviderResult<Vec<EventInfo>> {
        let races = self.races(&format!("{season}/"), PAGE_SIZE).await?;
        let mut events = Vec::with_capacity(races.len());
        for race in races {
            events.push(EventInfo {
                key: race.key()?,
                circuit: race.circuit.map(|c| c.circuit_id).unwrap_or_default(),
                name: race.race_name,
            });
        }
        Ok(non_empty(events))
    }

    #[instrument(skip(self))]
    async fn session_results(
        &self,
        event: EventKey,
        session: SessionKind,
    ) -> ProviderResult<Vec<Classification>> {
        match session {
            SessionKind::Race => self.race_classification(event).await,
            SessionKind::Qualifying => self.qualifying_classification(event).await,
            SessionKind::Practice1 | SessionKind::Practice2 | SessionKind::Practice3 => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn season_results(&self, season: u16) -> ProviderResult<Vec<RaceResult>> {
        let mut merged: BTreeMap<EventKey, Vec<Classification>> = BTreeMap::new();
        for race in self.all_races(&format!("{season}/results/")).await? {
            let key = race.key()?;
            merged
                .entry(key)
                .or_default()
                .extend(race.results.into_iter().map(ResultRow::into_classification));
        }
        let results: Vec<RaceResult> = merged
            .into_iter()
            .map(|(event, classification)| RaceResult {
                event,
                classification,
            })
            .collect();
        Ok(non_empty(results))
    }

    #[instrument(skip(self))]
    async fn constructor_standings(&self, season: u16) -> ProviderResult<Vec<ConstructorStanding>> {
        let data = self
            .fetch(&format!("{season}/constructorstandings/"), PAGE_SIZE, 0)
            .await?;
        let standings: Vec<ConstructorStanding> = data
            .standings_lists()
            .into_iter()
            .flat_map(|list| list.constructor_standings)
            .filter_map(|row| {
                let position = row.position.and_then(|p| p.parse().ok())?;
                Some(ConstructorStanding {
                    team: row.constructor.name,
                    position,
                })
            })
            .collect();
        Ok(non_empty(standings))
    }

    /// Drivers in the current championship standings, or the previous
    /// season's before the first race has been run.
    #[instrument(skip(self))]
    async fn entry_list(&self, event: EventKey) -> ProviderResult<Vec<Competitor>> {
        let current = self.driver_standings(event.season).await?;
        if !current.is_empty() {
            return Ok(Some(current));
        }
        let Some(previous) = event.season.checked_sub(1) else {
            return Ok(None);
        };
        tracing::debug!(season = previous, "entry list from previous season standings");
        Ok(non_empty(self.driver_standings(previous).await?))
    }
}
