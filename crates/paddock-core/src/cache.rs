//! Freshness-keyed in-memory caches.
//!
//! Every entry remembers the [`FreshnessKey`] it was computed under and is
//! only served while the caller's current key matches. A newer session
//! showing up changes the key, so stale entries are simply never returned
//! and get replaced on the next insert.
//!
//! Lookups take a short `std::sync::Mutex` and never touch the provider gate,
//! so a cache hit cannot block behind a slow provider read.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::model::{
    Classification, Competitor, ConstructorStanding, EventInfo, EventKey, FreshnessKey,
    PredictionSet, RaceResult, SessionKind,
};

/// Hit/miss counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// A map whose entries are valid only under the freshness key they were stored with.
#[derive(Debug)]
pub struct FreshCache<K, V> {
    entries: Mutex<HashMap<K, (FreshnessKey, V)>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> Default for FreshCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

impl<K, V> FreshCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `key` if it was stored under `fresh`.
    pub fn get(&self, key: &K, fresh: &FreshnessKey) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((stored, value)) if stored == fresh => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Like [`get`](Self::get) but without touching the counters.
    pub fn peek(&self, key: &K, fresh: &FreshnessKey) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|(stored, _)| stored == fresh)
            .map(|(_, value)| value.clone())
    }

    pub fn insert(&self, key: K, fresh: FreshnessKey, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, (fresh, value));
    }

    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: entries.len(),
        }
    }
}

/// All caches owned by one engine: one per provider read plus final predictions.
///
/// Provider reads store `None` ("not yet available") too; the freshness key
/// changes as soon as new data appears, which retires those entries.
#[derive(Debug, Default)]
pub struct Caches {
    pub schedules: FreshCache<u16, Option<Vec<EventInfo>>>,
    pub sessions: FreshCache<(EventKey, SessionKind), Option<Vec<Classification>>>,
    pub season_results: FreshCache<u16, Option<Vec<RaceResult>>>,
    pub standings: FreshCache<u16, Option<Vec<ConstructorStanding>>>,
    pub entry_lists: FreshCache<EventKey, Option<Vec<Competitor>>>,
    pub predictions: FreshCache<EventKey, Arc<PredictionSet>>,
}

impl Caches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything cached about `event`.
    pub fn invalidate_event(&self, event: EventKey) {
        self.predictions.invalidate(&event);
        self.entry_lists.invalidate(&event);
        for kind in [
            SessionKind::Practice1,
            SessionKind::Practice2,
            SessionKind::Practice3,
            SessionKind::Qualifying,
            SessionKind::Race,
        ] {
            self.sessions.invalidate(&(event, kind));
        }
    }

    pub fn clear(&self) {
        self.schedules.clear();
        self.sessions.clear();
        self.season_results.clear();
        self.standings.clear();
        self.entry_lists.clear();
        self.predictions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionRef;

    fn fresh(kind: SessionKind) -> FreshnessKey {
        FreshnessKey(Some(SessionRef {
            event: EventKey::new(2024, 5),
            kind,
        }))
    }

    #[test]
    fn entries_expire_when_freshness_changes() {
        let cache: FreshCache<u16, u32> = FreshCache::new();
        cache.insert(2024, fresh(SessionKind::Practice3), 7);

        assert_eq!(cache.get(&2024, &fresh(SessionKind::Practice3)), Some(7));
        assert_eq!(cache.get(&2024, &fresh(SessionKind::Qualifying)), None);

        cache.insert(2024, fresh(SessionKind::Qualifying), 9);
        assert_eq!(cache.get(&2024, &fresh(SessionKind::Qualifying)), Some(9));
        assert_eq!(cache.get(&2024, &fresh(SessionKind::Practice3)), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn settled_key_matches_itself() {
        let cache: FreshCache<&str, bool> = FreshCache::new();
        cache.insert("monza", FreshnessKey::SETTLED, true);
        assert_eq!(cache.get(&"monza", &FreshnessKey::SETTLED), Some(true));
        cache.invalidate(&"monza");
        assert_eq!(cache.peek(&"monza", &FreshnessKey::SETTLED), None);
    }

    #[test]
    fn invalidating_an_event_keeps_other_events() {
        let caches = Caches::new();
        let r5 = EventKey::new(2024, 5);
        let r6 = EventKey::new(2024, 6);
        for event in [r5, r6] {
            caches
                .sessions
                .insert((event, SessionKind::Qualifying), fresh(SessionKind::Qualifying), None);
            caches.entry_lists.insert(event, FreshnessKey::SETTLED, Some(vec![]));
        }
        caches.standings.insert(2024, FreshnessKey::SETTLED, None);

        caches.invalidate_event(r5);

        let q = fresh(SessionKind::Qualifying);
        assert!(caches.sessions.peek(&(r5, SessionKind::Qualifying), &q).is_none());
        assert!(caches.sessions.peek(&(r6, SessionKind::Qualifying), &q).is_some());
        assert!(caches.entry_lists.peek(&r5, &FreshnessKey::SETTLED).is_none());
        assert!(caches.entry_lists.peek(&r6, &FreshnessKey::SETTLED).is_some());
        assert!(caches.standings.peek(&2024, &FreshnessKey::SETTLED).is_some());
    }
}
