//! In-memory data provider for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use paddock_core::error::ProviderError;
use paddock_core::model::{
    Classification, Competitor, ConstructorStanding, EventInfo, EventKey, RaceResult, SessionKind,
    SessionRef,
};
use paddock_core::traits::{DataProvider, ProviderResult};

/// The provider operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    LatestSession,
    Schedule,
    SessionResults,
    SeasonResults,
    ConstructorStandings,
    EntryList,
}

#[derive(Debug, Default)]
struct MockData {
    schedules: HashMap<u16, Vec<EventInfo>>,
    sessions: HashMap<(EventKey, SessionKind), Vec<Classification>>,
    standings: HashMap<u16, Vec<ConstructorStanding>>,
    entry_lists: HashMap<EventKey, Vec<Competitor>>,
}

/// A mock data provider for exercising the engine without a network.
///
/// Seeded with builder methods; data can also be added after construction
/// to simulate a new session finishing. Season results and the latest
/// session are derived from the seeded sessions.
#[derive(Debug, Default)]
pub struct MockProvider {
    data: Mutex<MockData>,
    failures: Mutex<HashMap<MockOp, ProviderError>>,
    latency: Mutex<HashMap<MockOp, Duration>>,
    calls: Mutex<HashMap<MockOp, u32>>,
    call_count: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

/// Tracks overlapping reads; decrements on drop so
/// cancelled (timed out) reads are accounted for.
struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event to its season's schedule.
    pub fn with_event(self, key: EventKey, name: &str, circuit: &str) -> Self {
        self.add_event(key, name, circuit);
        self
    }

    pub fn with_session(self, event: EventKey, kind: SessionKind, rows: Vec<Classification>) -> Self {
        self.add_session(event, kind, rows);
        self
    }

    pub fn with_standings(self, season: u16, standings: Vec<ConstructorStanding>) -> Self {
        lock(&self.data).standings.insert(season, standings);
        self
    }

    pub fn with_entry_list(self, event: EventKey, competitors: Vec<Competitor>) -> Self {
        lock(&self.data).entry_lists.insert(event, competitors);
        self
    }

    /// Delay every read by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        {
            let mut map = lock(&self.latency);
            for op in [
                MockOp::LatestSession,
                MockOp::Schedule,
                MockOp::SessionResults,
                MockOp::SeasonResults,
                MockOp::ConstructorStandings,
                MockOp::EntryList,
            ] {
                map.insert(op, latency);
            }
        }
        self
    }

    pub fn with_op_latency(self, op: MockOp, latency: Duration) -> Self {
        lock(&self.latency).insert(op, latency);
        self
    }

    /// Make every call of `op` fail with `error`.
    pub fn failing(self, op: MockOp, error: ProviderError) -> Self {
        self.set_failure(op, Some(error));
        self
    }

    pub fn add_event(&self, key: EventKey, name: &str, circuit: &str) {
        let mut data = lock(&self.data);
        let schedule = data.schedules.entry(key.season).or_default();
        schedule.retain(|e| e.key != key);
        schedule.push(EventInfo {
            key,
            name: name.to_string(),
            circuit: circuit.to_string(),
        });
        schedule.sort_by_key(|e| e.key);
    }

    /// Publish a session's classification, as if it had just finished.
    pub fn add_session(&self, event: EventKey, kind: SessionKind, rows: Vec<Classification>) {
        lock(&self.data).sessions.insert((event, kind), rows);
    }

    pub fn set_failure(&self, op: MockOp, error: Option<ProviderError>) {
        let mut failures = lock(&self.failures);
        match error {
            Some(error) => failures.insert(op, error),
            None => failures.remove(&op),
        };
    }

    /// Total calls across all operations.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn calls(&self, op: MockOp) -> u32 {
        lock(&self.calls).get(&op).copied().unwrap_or(0)
    }

    /// Largest number of reads that ever overlapped.
    pub fn max_concurrency(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn count(&self, op: MockOp) {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        *lock(&self.calls).entry(op).or_default() += 1;
    }

    fn injected(&self, op: MockOp) -> Result<(), ProviderError> {
        match lock(&self.failures).get(&op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Count, delay, and fail a read as configured. Calls
    /// are counted on entry so reads cancelled by a timeout still show up.
    async fn enter(&self, op: MockOp) -> Result<InFlight<'_>, ProviderError> {
        self.count(op);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let latency = lock(&self.latency).get(&op).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.injected(op)?;
        Ok(guard)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl DataProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn latest_session(&self, event: EventKey) -> ProviderResult<SessionRef> {
        let _guard = self.enter(MockOp::LatestSession).await?;
        let data = lock(&self.data);
        let latest = data
            .sessions
            .keys()
            .filter(|(key, _)| *key <= event)
            .map(|&(event, kind)| SessionRef { event, kind })
            .max();
        Ok(latest)
    }

    async fn schedule(&self, season: u16) -> ProviderResult<Vec<EventInfo>> {
        let _guard = self.enter(MockOp::Schedule).await?;
        Ok(lock(&self.data).schedules.get(&season).cloned())
    }

    async fn session_results(
        &self,
        event: EventKey,
        session: SessionKind,
    ) -> ProviderResult<Vec<Classification>> {
        let _guard = self.enter(MockOp::SessionResults).await?;
        Ok(lock(&self.data).sessions.get(&(event, session)).cloned())
    }

    async fn season_results(&self, season: u16) -> ProviderResult<Vec<RaceResult>> {
        let _guard = self.enter(MockOp::SeasonResults).await?;
        let data = lock(&self.data);
        let mut races: Vec<RaceResult> = data
            .sessions
            .iter()
            .filter(|((event, kind), _)| event.season == season && *kind == SessionKind::Race)
            .map(|((event, _), rows)| RaceResult {
                event: *event,
                classification: rows.clone(),
            })
            .collect();
        if races.is_empty() {
            return Ok(None);
        }
        races.sort_by_key(|r| r.event);
        Ok(Some(races))
    }

    async fn constructor_standings(&self, season: u16) -> ProviderResult<Vec<ConstructorStanding>> {
        let _guard = self.enter(MockOp::ConstructorStandings).await?;
        Ok(lock(&self.data).standings.get(&season).cloned())
    }

    async fn entry_list(&self, event: EventKey) -> ProviderResult<Vec<Competitor>> {
        let _guard = self.enter(MockOp::EntryList).await?;
        Ok(lock(&self.data).entry_lists.get(&event).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(code: &str, position: u32) -> Classification {
        Classification {
            competitor: Competitor::new(code, code, "Team"),
            position: Some(position),
            grid: Some(position),
        }
    }

    #[tokio::test]
    async fn derives_season_results_and_latest_session() {
        let r1 = EventKey::new(2024, 1);
        let r2 = EventKey::new(2024, 2);
        let provider = MockProvider::new()
            .with_session(r2, SessionKind::Race, vec![row("NOR", 1)])
            .with_session(r1, SessionKind::Race, vec![row("VER", 1)])
            .with_session(r2, SessionKind::Practice1, vec![row("LEC", 1)]);

        let races = provider.season_results(2024).await.unwrap().unwrap();
        assert_eq!(races.iter().map(|r| r.event).collect::<Vec<_>>(), vec![r1, r2]);
        assert!(provider.season_results(2023).await.unwrap().is_none());

        let latest = provider.latest_session(r1).await.unwrap().unwrap();
        assert_eq!(latest, SessionRef { event: r1, kind: SessionKind::Race });
        let latest = provider.latest_session(r2).await.unwrap().unwrap();
        assert_eq!(latest.kind, SessionKind::Race);
        assert!(provider.latest_session(EventKey::new(2023, 5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_injection_and_counters() {
        let provider = MockProvider::new().failing(
            MockOp::ConstructorStandings,
            ProviderError::NetworkError("connection reset".into()),
        );
        assert!(provider.constructor_standings(2024).await.is_err());
        assert!(provider.schedule(2024).await.unwrap().is_none());

        provider.set_failure(MockOp::ConstructorStandings, None);
        assert!(provider.constructor_standings(2024).await.unwrap().is_none());

        assert_eq!(provider.calls(MockOp::ConstructorStandings), 2);
        assert_eq!(provider.call_count(), 3);
        assert_eq!(provider.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn overlapping_reads_are_tracked() {
        let provider = MockProvider::new().with_latency(Duration::from_millis(30));
        let (a, b) = tokio::join!(provider.schedule(2024), provider.latest_session(EventKey::new(2024, 1)));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(provider.max_concurrency(), 2);
        assert_eq!(provider.calls(MockOp::LatestSession), 1);
    }
}
