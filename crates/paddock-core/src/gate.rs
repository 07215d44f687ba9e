//! Serialized access to the data provider.
//!
//! The upstream provider cannot load sessions concurrently, so every
//! provider read, including the freshness probe, goes through one
//! `tokio::sync::Mutex` and concurrent prediction requests queue here. Both
//! the read-through path and the probe re-check after acquiring the gate, so
//! a request that waited behind an identical read reuses its result instead
//! of loading it again.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::cache::FreshCache;
use crate::error::ProviderError;
use crate::model::{EventKey, FreshnessKey, SessionRef};
use crate::traits::{DataProvider, ProviderResult};

/// Last successful freshness check per event, with the instant it completed.
type FreshnessLog = HashMap<EventKey, (Instant, FreshnessKey)>;

pub struct ProviderGate {
    provider: Arc<dyn DataProvider>,
    lock: Mutex<FreshnessLog>,
    timeout: Duration,
}

impl ProviderGate {
    pub fn new(provider: Arc<dyn DataProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            lock: Mutex::new(FreshnessLog::new()),
            timeout,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Freshness probe for `event`, under the gate.
    ///
    /// A check that completed after this call started waiting is reused:
    /// its answer is at least as recent as anything this call could see.
    pub async fn freshness(&self, event: EventKey) -> Result<FreshnessKey, ProviderError> {
        let waited = Instant::now();
        let mut log = self.lock.lock().await;

        if let Some(&(completed, fresh)) = log.get(&event) {
            if completed > waited {
                tracing::debug!(%event, %fresh, "freshness served by a check that completed while waiting");
                return Ok(fresh);
            }
        }

        let latest: Option<SessionRef> =
            bounded(self.timeout, self.provider.latest_session(event)).await?;
        let fresh = FreshnessKey(latest);
        log.insert(event, (Instant::now(), fresh));
        Ok(fresh)
    }

    /// Run one provider read under the gate, bounded by the timeout.
    pub async fn call<'a, T>(
        &'a self,
        op: &'static str,
        read: impl FnOnce(&'a dyn DataProvider) -> BoxFuture<'a, ProviderResult<T>>,
    ) -> ProviderResult<T> {
        let waited = Instant::now();
        let _guard = self.lock.lock().await;
        tracing::trace!(op, waited_ms = waited.elapsed().as_millis() as u64, "provider gate acquired");
        self.invoke(op, read).await
    }

    /// Serve from `cache` when fresh, otherwise read under the gate and store
    /// the result (including "not yet available").
    pub async fn read_through<'a, K, T>(
        &'a self,
        cache: &FreshCache<K, Option<T>>,
        key: K,
        fresh: FreshnessKey,
        op: &'static str,
        read: impl FnOnce(&'a dyn DataProvider) -> BoxFuture<'a, ProviderResult<T>>,
    ) -> ProviderResult<T>
    where
        K: Eq + Hash,
        T: Clone,
    {
        if let Some(hit) = cache.get(&key, &fresh) {
            return Ok(hit);
        }

        let waited = Instant::now();
        let _guard = self.lock.lock().await;
        tracing::trace!(op, waited_ms = waited.elapsed().as_millis() as u64, "provider gate acquired");

        if let Some(hit) = cache.peek(&key, &fresh) {
            tracing::debug!(op, "served by a read that completed while waiting");
            return Ok(hit);
        }

        let value = self.invoke(op, read).await?;
        cache.insert(key, fresh, value.clone());
        Ok(value)
    }

    async fn invoke<'a, T>(
        &'a self,
        op: &'static str,
        read: impl FnOnce(&'a dyn DataProvider) -> BoxFuture<'a, ProviderResult<T>>,
    ) -> ProviderResult<T> {
        let started = Instant::now();
        let result = bounded(self.timeout, read(self.provider.as_ref())).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(Some(_)) => tracing::debug!(op, elapsed_ms, "provider read complete"),
            Ok(None) => tracing::debug!(op, elapsed_ms, "provider data not yet available"),
            Err(e) => tracing::warn!(op, elapsed_ms, error = %e, "provider read failed"),
        }
        result
    }
}

async fn bounded<T>(
    timeout: Duration,
    read: BoxFuture<'_, Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    match tokio::time::timeout(timeout, read).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::model::{
        Classification, Competitor, ConstructorStanding, EventInfo, RaceResult, SessionKind,
    };

    struct SlowSchedule {
        calls: AtomicU32,
        latest_calls: AtomicU32,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
        delay: Duration,
    }

    #[async_trait]
    impl DataProvider for SlowSchedule {
        fn name(&self) -> &str {
            "slow"
        }

        async fn latest_session(&self, event: EventKey) -> ProviderResult<SessionRef> {
            self.latest_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(SessionRef {
                event,
                kind: SessionKind::Qualifying,
            }))
        }

        async fn schedule(&self, season: u16) -> ProviderResult<Vec<EventInfo>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Some(vec![EventInfo {
                key: EventKey::new(season, 1),
                name: "Bahrain Grand Prix".into(),
                circuit: "bahrain".into(),
            }]))
        }

        async fn session_results(&self, _: EventKey, _: SessionKind) -> ProviderResult<Vec<Classification>> {
            Ok(None)
        }

        async fn season_results(&self, _: u16) -> ProviderResult<Vec<RaceResult>> {
            Ok(None)
        }

        async fn constructor_standings(&self, _: u16) -> ProviderResult<Vec<ConstructorStanding>> {
            Ok(None)
        }

        async fn entry_list(&self, _: EventKey) -> ProviderResult<Vec<Competitor>> {
            Ok(None)
        }
    }

    fn gate(delay: Duration, timeout: Duration) -> (Arc<SlowSchedule>, ProviderGate) {
        let provider = Arc::new(SlowSchedule {
            calls: AtomicU32::new(0),
            latest_calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            delay,
        });
        let gate = ProviderGate::new(provider.clone(), timeout);
        (provider, gate)
    }

    #[tokio::test]
    async fn waiting_reader_is_served_from_cache() {
        let (provider, gate) = gate(Duration::from_millis(50), Duration::from_secs(5));
        let cache: FreshCache<u16, Option<Vec<EventInfo>>> = FreshCache::new();

        let read = || gate.read_through(&cache, 2024, FreshnessKey::SETTLED, "schedule", |p| p.schedule(2024));
        let (a, b) = tokio::join!(read(), read());

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let (_, gate) = gate(Duration::from_millis(200), Duration::from_millis(20));
        let result = gate.call("schedule", |p| p.schedule(2024)).await;
        assert!(matches!(result, Err(ProviderError::Timeout(d)) if d == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let (provider, gate) = gate(Duration::from_millis(100), Duration::from_millis(10));
        let cache: FreshCache<u16, Option<Vec<EventInfo>>> = FreshCache::new();
        for _ in 0..2 {
            let result = gate
                .read_through(&cache, 2024, FreshnessKey::SETTLED, "schedule", |p| p.schedule(2024))
                .await;
            assert!(result.is_err());
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(gate.provider_name(), "slow");
    }

    #[tokio::test]
    async fn concurrent_freshness_checks_do_not_overlap() {
        let (provider, gate) = gate(Duration::from_millis(30), Duration::from_secs(5));
        let event = EventKey::new(2024, 6);

        let (a, b, c, d) = tokio::join!(
            gate.freshness(event),
            gate.freshness(event),
            gate.freshness(event),
            gate.freshness(event),
        );

        let expected = FreshnessKey(Some(SessionRef {
            event,
            kind: SessionKind::Qualifying,
        }));
        for fresh in [a, b, c, d] {
            assert_eq!(fresh.unwrap(), expected);
        }
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(provider.latest_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_freshness_checks_are_not_reused() {
        let (provider, gate) = gate(Duration::from_millis(1), Duration::from_secs(5));
        let event = EventKey::new(2024, 6);
        gate.freshness(event).await.unwrap();
        gate.freshness(event).await.unwrap();
        assert_eq!(provider.latest_calls.load(Ordering::SeqCst), 2);
    }
}
