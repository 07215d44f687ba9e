//! End-to-end prediction tests driving the engine through the mock provider.
//!
//! The base scenario is round 6 of 2024 at a circuit with no earlier
//! editions, so circuit history and grid delta are missing for everyone.

use std::sync::Arc;
use std::time::Duration;

use paddock_core::accuracy::AccuracyStore;
use paddock_core::engine::{EngineConfig, PredictionEngine};
use paddock_core::error::{ExclusionReason, PredictionError};
use paddock_core::model::{
    Classification, Competitor, ConstructorStanding, DataSource, EventKey, SessionKind, WeightVariant,
};
use paddock_providers::{MockOp, MockProvider};

const EVENT: EventKey = EventKey {
    season: 2024,
    round: 6,
};

/// (code, team, race finish in every earlier round)
const FIELD: [(&str, &str, u32); 5] = [
    ("VER", "Red Bull", 1),
    ("NOR", "McLaren", 2),
    ("LEC", "Ferrari", 10),
    ("PIA", "McLaren", 12),
    ("SAI", "Williams", 16),
];

fn competitor(code: &str, team: &str) -> Competitor {
    Competitor::new(code, code, team)
}

/// A session classified in `FIELD` order.
fn session_rows() -> Vec<Classification> {
    FIELD
        .iter()
        .enumerate()
        .map(|(i, (code, team, _))| Classification {
            competitor: competitor(code, team),
            position: Some(i as u32 + 1),
            grid: None,
        })
        .collect()
}

/// A 20-car race with the field at its fixed finishing spots.
fn race_rows() -> Vec<Classification> {
    (1..=20u32)
        .map(|position| {
            let competitor = match FIELD.iter().find(|(_, _, p)| *p == position) {
                Some((code, team, _)) => competitor(code, team),
                None => competitor(&format!("F{position:02}"), "Backmarker"),
            };
            Classification {
                competitor,
                position: Some(position),
                grid: Some(position),
            }
        })
        .collect()
}

fn standings() -> Vec<ConstructorStanding> {
    ["Red Bull", "McLaren", "Ferrari", "Mercedes", "Williams"]
        .iter()
        .enumerate()
        .map(|(i, team)| ConstructorStanding {
            team: team.to_string(),
            position: i as u32 + 1,
        })
        .collect()
}

/// Everything up to (not including) the sessions of round 6.
fn season_so_far() -> MockProvider {
    let mut provider = MockProvider::new()
        .with_event(EVENT, "Emilia Romagna Grand Prix", "imola")
        .with_standings(2024, standings());
    for round in 1..EVENT.round {
        let key = EventKey::new(2024, round);
        provider = provider
            .with_event(key, &format!("Grand Prix {round}"), &format!("circuit-{round}"))
            .with_session(key, SessionKind::Race, race_rows());
    }
    provider
}

fn engine_with(provider: Arc<MockProvider>, dir: &tempfile::TempDir, config: EngineConfig) -> PredictionEngine {
    let store = AccuracyStore::new(dir.path().join("history.json"));
    PredictionEngine::new(provider, store, config).unwrap()
}

fn engine(provider: Arc<MockProvider>, dir: &tempfile::TempDir) -> PredictionEngine {
    engine_with(provider, dir, EngineConfig::default())
}

#[tokio::test]
async fn qualifying_known_prediction() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(season_so_far().with_session(EVENT, SessionKind::Qualifying, session_rows()));
    let engine = engine(provider, &dir);

    let set = engine.compute_prediction(EVENT).await.unwrap();

    assert_eq!(set.variant, WeightVariant::QualifyingKnown);
    assert_eq!(set.grand_prix, "Emilia Romagna Grand Prix");
    assert_eq!(set.predicted_order(), vec!["VER", "NOR", "LEC", "PIA", "SAI"]);
    assert!(set.excluded.is_empty());
    assert!(set.warnings.is_empty(), "unexpected warnings: {:?}", set.warnings);
    assert_eq!(
        set.data_sources.iter().copied().collect::<Vec<_>>(),
        vec![
            DataSource::Qualifying,
            DataSource::RecentRaces,
            DataSource::ConstructorStandings
        ]
    );

    // Circuit history and grid delta are missing: the other three base
    // weights (0.35, 0.25, 0.15) are scaled up to fill the whole.
    let nor = set.get("NOR").unwrap();
    let expected = (0.35 * 0.75 + 0.25 * (18.0 / 19.0) + 0.15 * 0.75) / 0.75;
    assert!((nor.score - expected).abs() < 1e-9, "score {} != {expected}", nor.score);

    // Signals in full agreement give the narrowest, highest range.
    let ver = set.get("VER").unwrap();
    assert_eq!((ver.confidence.low, ver.confidence.high), (80, 95));
    assert_eq!(ver.factors.len(), 3);
    assert_eq!(ver.factors[0], "Pole position (qualifying P1)");
    for p in &set.predictions[1..] {
        assert!(p.confidence.low < ver.confidence.low, "{}: {}", p.competitor.code, p.confidence);
        assert!(p.confidence.width() >= ver.confidence.width());
    }

    // The snapshot is kept for grading.
    let record = engine.store().get(EVENT).unwrap();
    assert_eq!(record.prediction.id, set.id);
    assert!(!record.is_graded());
}

#[tokio::test]
async fn practice_stands_in_before_qualifying() {
    let dir = tempfile::tempdir().unwrap();
    let known = engine(
        Arc::new(season_so_far().with_session(EVENT, SessionKind::Qualifying, session_rows())),
        &dir,
    )
    .compute_prediction(EVENT)
    .await
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(
        season_so_far().with_session(EVENT, SessionKind::Practice2, session_rows()),
    );
    let pre = engine(provider, &dir).compute_prediction(EVENT).await.unwrap();

    assert_eq!(pre.variant, WeightVariant::PreQualifying);
    assert!(pre.data_sources.contains(&DataSource::Practice));
    assert!(!pre.data_sources.contains(&DataSource::Qualifying));
    assert!(pre
        .warnings
        .contains(&"Qualifying data unavailable; using practice session pace as proxy".to_string()));
    assert_eq!(pre.predicted_order()[..2], known.predicted_order()[..2]);

    // Practice pace is pinned at 0.10; recent form and team strength share the rest.
    let nor = pre.get("NOR").unwrap();
    let expected = 0.10 * 0.75 + 0.90 * (0.25 / 0.40) * (18.0 / 19.0) + 0.90 * (0.15 / 0.40) * 0.75;
    assert!((nor.score - expected).abs() < 1e-9, "score {} != {expected}", nor.score);

    // Same value spread as with qualifying, so each bound moves by exactly 15.
    for p in &pre.predictions {
        let k = known.get(&p.competitor.code).unwrap().confidence;
        assert_eq!(p.confidence.low, k.low.saturating_sub(15), "{}", p.competitor.code);
        assert_eq!(p.confidence.high, (k.high + 15).min(100), "{}", p.competitor.code);
        assert!(p.confidence.width() >= k.width());
    }
    let sai = pre.get("SAI").unwrap();
    assert!(sai.factors.iter().any(|f| f.contains("practice")), "{:?}", sai.factors);
}

#[tokio::test]
async fn entry_list_roster_and_excluded_rookie() {
    let dir = tempfile::tempdir().unwrap();
    let mut entrants: Vec<Competitor> = FIELD.iter().map(|(c, t, _)| competitor(c, t)).collect();
    entrants.push(competitor("BEA", "Haas F1 Team"));
    let provider = Arc::new(season_so_far().with_entry_list(EVENT, entrants));
    let engine = engine(Arc::clone(&provider), &dir);

    let set = engine.compute_prediction(EVENT).await.unwrap();

    assert_eq!(set.variant, WeightVariant::PreQualifying);
    assert!(set.data_sources.contains(&DataSource::EntryList));
    assert!(set
        .warnings
        .contains(&"No qualifying or practice data available; using historical data only".to_string()));
    assert_eq!(set.predictions.len(), 5);
    assert_eq!(set.predictions[0].competitor.code, "VER");

    // No history and an unranked team: excluded, not scored as zero.
    assert_eq!(set.excluded.len(), 1);
    assert_eq!(set.excluded[0].competitor.code, "BEA");
    assert_eq!(set.excluded[0].reason, ExclusionReason::InsufficientData);
    assert!(set.get("BEA").is_none());

    // The rookie's missing finishes pulled in the previous season.
    assert_eq!(provider.calls(MockOp::SeasonResults), 2);
}

#[tokio::test]
async fn no_entrants_is_a_batch_error() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new().with_event(EVENT, "Emilia Romagna Grand Prix", "imola"));
    let engine = engine(provider, &dir);

    let err = engine.compute_prediction(EVENT).await.unwrap_err();
    assert!(matches!(err, PredictionError::NoEntrants(e) if e == EVENT));
    assert!(engine.store().is_empty());
}

#[tokio::test]
async fn timed_out_source_is_treated_as_missing() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(
        season_so_far()
            .with_session(EVENT, SessionKind::Qualifying, session_rows())
            .with_op_latency(MockOp::ConstructorStandings, Duration::from_millis(500)),
    );
    let config = EngineConfig {
        provider_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let engine = engine_with(Arc::clone(&provider), &dir, config);

    let set = engine.compute_prediction(EVENT).await.unwrap();

    assert_eq!(set.predictions.len(), 5);
    assert!(!set.data_sources.contains(&DataSource::ConstructorStandings));
    assert!(set.warnings.contains(&"Constructor standings unavailable".to_string()));
    assert!(set.warnings.iter().any(|w| w.contains("timed out")), "{:?}", set.warnings);
    // Both this season's and last season's standings were tried.
    assert_eq!(provider.calls(MockOp::ConstructorStandings), 2);

    // A degraded prediction is not cached: the next request retries.
    engine.compute_prediction(EVENT).await.unwrap();
    assert_eq!(provider.calls(MockOp::ConstructorStandings), 4);
    // Reads that succeeded were cached.
    assert_eq!(provider.calls(MockOp::SeasonResults), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_gate() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(
        season_so_far()
            .with_session(EVENT, SessionKind::Qualifying, session_rows())
            .with_latency(Duration::from_millis(20)),
    );
    let engine = Arc::new(engine(Arc::clone(&provider), &dir));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.compute_prediction(EVENT).await })
        })
        .collect();
    for handle in handles {
        let set = handle.await.unwrap().unwrap();
        assert_eq!(set.predicted_order()[0], "VER");
    }

    // Freshness checks queue on the gate with every other read.
    assert_eq!(provider.max_concurrency(), 1);
    assert_eq!(provider.calls(MockOp::LatestSession), 1);
    // Waiters were served from the cache filled by the first reader.
    assert_eq!(provider.calls(MockOp::SessionResults), 1);
    assert_eq!(provider.calls(MockOp::SeasonResults), 1);
    assert_eq!(provider.calls(MockOp::ConstructorStandings), 1);
}

#[tokio::test]
async fn new_session_invalidates_cached_prediction() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(season_so_far().with_session(EVENT, SessionKind::Practice1, session_rows()));
    let engine = engine(Arc::clone(&provider), &dir);

    let first = engine.compute_prediction(EVENT).await.unwrap();
    let again = engine.compute_prediction(EVENT).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(first.variant, WeightVariant::PreQualifying);
    assert_eq!(engine.cache_stats().predictions.hits, 1);

    // Qualifying finishes: the freshness key moves on and the cache is stale.
    let mut reversed = session_rows();
    reversed.reverse();
    for (i, row) in reversed.iter_mut().enumerate() {
        row.position = Some(i as u32 + 1);
    }
    provider.add_session(EVENT, SessionKind::Qualifying, reversed);

    let updated = engine.compute_prediction(EVENT).await.unwrap();
    assert_eq!(updated.variant, WeightVariant::QualifyingKnown);
    assert_ne!(updated.id, first.id);
    // Q, FP3, FP2, FP1 the first time; only the new qualifying read after.
    assert_eq!(provider.calls(MockOp::SessionResults), 5);

    // Explicit invalidation forces a recompute with the same data.
    engine.invalidate(EVENT);
    let recomputed = engine.compute_prediction(EVENT).await.unwrap();
    assert_ne!(recomputed.id, updated.id);
    assert_eq!(recomputed.predicted_order(), updated.predicted_order());

    // The store keeps one record per event, holding the latest snapshot.
    assert_eq!(engine.store().len(), 1);
    assert_eq!(engine.store().get(EVENT).unwrap().prediction.id, recomputed.id);
}

#[tokio::test]
async fn failed_freshness_probe_bypasses_caches() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(
        season_so_far()
            .with_session(EVENT, SessionKind::Qualifying, session_rows())
            .failing(
                MockOp::LatestSession,
                paddock_core::error::ProviderError::NetworkError("unreachable".into()),
            ),
    );
    let engine = engine(Arc::clone(&provider), &dir);

    let a = engine.compute_prediction(EVENT).await.unwrap();
    let b = engine.compute_prediction(EVENT).await.unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(provider.calls(MockOp::SeasonResults), 2);
    assert_eq!(a.predicted_order(), b.predicted_order());
}
