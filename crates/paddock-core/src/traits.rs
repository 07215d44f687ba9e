//! The data provider seam.
//!
//! Implemented by the `paddock-providers` crate. All reads are keyed by
//! season, round, and session; "not yet available" is a normal `Ok(None)`
//! response, never an error.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::model::{
    Classification, Competitor, ConstructorStanding, EventInfo, EventKey, RaceResult, SessionKind,
    SessionRef,
};

/// Result of a provider read: `Ok(None)` means the data does not exist yet.
pub type ProviderResult<T> = Result<Option<T>, ProviderError>;

/// Read-only access to timing and results data.
///
/// Implementations are not required to tolerate concurrent session loads;
/// the engine funnels every session-scoped read through a single gate.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Human-readable provider name (e.g. "ergast").
    fn name(&self) -> &str;

    /// The most recent session with data at or before `event`.
    ///
    /// This is a schedule-level lookup used to derive cache freshness and
    /// must not trigger a session load, so the engine calls it outside the
    /// provider gate.
    async fn latest_session(&self, event: EventKey) -> ProviderResult<SessionRef>;

    /// The season calendar.
    async fn schedule(&self, season: u16) -> ProviderResult<Vec<EventInfo>>;

    /// Classified results of one session, ordered by position.
    async fn session_results(
        &self,
        event: EventKey,
        session: SessionKind,
    ) -> ProviderResult<Vec<Classification>>;

    /// Race results for every completed round of a season, in round order.
    async fn season_results(&self, season: u16) -> ProviderResult<Vec<RaceResult>>;

    /// Constructor championship standings.
    async fn constructor_standings(&self, season: u16) -> ProviderResult<Vec<ConstructorStanding>>;

    /// Drivers entered in an event, used when no session has run yet.
    async fn entry_list(&self, event: EventKey) -> ProviderResult<Vec<Competitor>>;
}
