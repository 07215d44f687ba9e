//! Prediction engine.
//!
//! Ties the pieces together for the two inbound operations:
//! [`PredictionEngine::compute_prediction`] and
//! [`PredictionEngine::get_accuracy_stats`], plus
//! [`PredictionEngine::predict_with_accuracy`] which serves both in one
//! response. The engine owns the provider gate, the caches, and the accuracy
//! store; it is meant to be shared behind an `Arc` by concurrent request
//! handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::accuracy::AccuracyStore;
use crate::cache::{CacheStats, Caches};
use crate::error::{CompetitorError, PredictionError, ScoreError, StoreError};
use crate::fallback::ScoringPolicy;
use crate::gate::ProviderGate;
use crate::model::{Classification, EventKey, PredictionSet, SessionKind};
use crate::scoring::{self, ScoredCompetitor};
use crate::signals::{self, EventData, ExtractionSettings, Reader};
use crate::statistics::{compute_accuracy_stats, AccuracyStats};
use crate::traits::DataProvider;

/// Default bound on a single provider call.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of most recent events aggregated into accuracy stats.
pub const DEFAULT_ACCURACY_WINDOW: usize = 5;

/// Configuration for the prediction engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Weights and pre-qualifying adjustments.
    pub policy: ScoringPolicy,
    /// How much history feeds the signals.
    pub extraction: ExtractionSettings,
    /// Bound on each provider call; a timeout counts as missing data.
    pub provider_timeout: Duration,
    /// Window used when callers do not pass one.
    pub accuracy_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: ScoringPolicy::default(),
            extraction: ExtractionSettings::default(),
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            accuracy_window: DEFAULT_ACCURACY_WINDOW,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), PredictionError> {
        self.policy
            .base
            .validate()
            .map_err(PredictionError::InvalidWeights)?;
        let practice = self.policy.practice_weight;
        if !(practice > 0.0 && practice < 1.0) {
            return Err(PredictionError::InvalidWeights(format!(
                "practice weight {practice} must be strictly between 0 and 1"
            )));
        }
        if self.policy.pre_qualifying_margin > 100 {
            return Err(PredictionError::InvalidWeights(format!(
                "pre-qualifying margin {} exceeds 100 points",
                self.policy.pre_qualifying_margin
            )));
        }
        Ok(())
    }
}

/// Snapshot of cache counters, one entry per cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineCacheStats {
    pub predictions: CacheStats,
    pub sessions: CacheStats,
    pub schedules: CacheStats,
    pub season_results: CacheStats,
    pub standings: CacheStats,
    pub entry_lists: CacheStats,
}

/// A prediction together with the engine's track record, as served to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionReport {
    #[serde(flatten)]
    pub prediction: PredictionSet,
    /// Accuracy over the configured window, including this event if ungraded.
    pub accuracy: AccuracyStats,
}

/// The race prediction engine.
pub struct PredictionEngine {
    gate: ProviderGate,
    caches: Caches,
    store: Arc<AccuracyStore>,
    config: EngineConfig,
}

impl PredictionEngine {
    pub fn new(
        provider: Arc<dyn DataProvider>,
        store: AccuracyStore,
        config: EngineConfig,
    ) -> Result<Self, PredictionError> {
        config.validate()?;
        Ok(Self {
            gate: ProviderGate::new(provider, config.provider_timeout),
            caches: Caches::new(),
            store: Arc::new(store),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &AccuracyStore {
        &self.store
    }

    /// Predict the finishing order of `event`.
    ///
    /// Served from the prediction cache while no newer session has data.
    /// Otherwise every signal is extracted, scored, and ranked, and the
    /// snapshot is saved for accuracy tracking. A failed save is logged and
    /// does not fail the request.
    pub async fn compute_prediction(&self, event: EventKey) -> Result<Arc<PredictionSet>, PredictionError> {
        let fresh = match self.gate.freshness(event).await {
            Ok(fresh) => Some(fresh),
            Err(e) => {
                tracing::warn!(%event, error = %e, "freshness probe failed; bypassing caches");
                None
            }
        };
        if let Some(fresh) = fresh {
            if let Some(cached) = self.caches.predictions.get(&event, &fresh) {
                tracing::debug!(%event, %fresh, "prediction served from cache");
                return Ok(cached);
            }
        }

        let started = Instant::now();
        let reader = Reader::new(&self.gate, &self.caches, event.season, fresh);
        let data = signals::gather(&reader, event, &self.config.extraction).await?;
        let degraded = data.provider_errors > 0;
        let prediction = Arc::new(self.assemble(data));

        let snapshot = Arc::clone(&prediction);
        if let Err(e) = self.with_store(move |store| store.save_prediction(&snapshot)).await {
            tracing::warn!(%event, error = %e, "failed to save prediction");
        }
        // A prediction built around failed reads is recomputed on the next request.
        if let Some(fresh) = fresh.filter(|_| !degraded) {
            self.caches
                .predictions
                .insert(event, fresh, Arc::clone(&prediction));
        }

        tracing::info!(
            %event,
            drivers = prediction.predictions.len(),
            excluded = prediction.excluded.len(),
            variant = %prediction.variant,
            data_sources = ?prediction.data_sources,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "predictions computed"
        );
        Ok(prediction)
    }

    fn assemble(&self, data: EventData) -> PredictionSet {
        let mode = data.mode();
        let mut scored = Vec::with_capacity(data.roster.len());
        let mut excluded = Vec::new();

        for competitor in &data.roster {
            let signals = data.signals_for(competitor, &self.config.extraction);
            match self.config.policy.assess(mode, &signals) {
                Ok(assessment) => scored.push(ScoredCompetitor {
                    competitor: competitor.clone(),
                    assessment,
                    qualifying_position: data.qualifying_position(&competitor.code),
                }),
                Err(ScoreError::InsufficientData) => {
                    tracing::warn!(event = %data.event, driver = %competitor.code, "insufficient data; excluded");
                    excluded.push(CompetitorError::insufficient_data(competitor.clone()));
                }
            }
        }

        PredictionSet {
            id: Uuid::new_v4(),
            event: data.event,
            grand_prix: data.grand_prix,
            generated_at: Utc::now(),
            variant: mode,
            data_sources: data.sources,
            predictions: scoring::rank(scored),
            excluded,
            warnings: data.warnings,
        }
    }

    /// Predict `event` and attach accuracy over the configured window.
    pub async fn predict_with_accuracy(&self, event: EventKey) -> Result<PredictionReport, PredictionError> {
        let prediction = self.compute_prediction(event).await?;
        let accuracy = self.accuracy_stats().await?;
        Ok(PredictionReport {
            prediction: PredictionSet::clone(&prediction),
            accuracy,
        })
    }

    /// Accuracy over the last `window` predicted events.
    ///
    /// Ungraded records in the window are first graded from the provider's
    /// race results where those exist now. Records that stay ungraded are
    /// reported as pending and left out of every rate.
    pub async fn get_accuracy_stats(&self, window: usize) -> Result<AccuracyStats, PredictionError> {
        let pending: Vec<EventKey> = self
            .with_store(move |store| Ok(store.window(window)))
            .await?
            .into_iter()
            .filter(|r| !r.is_graded())
            .map(|r| r.event)
            .collect();

        for event in pending {
            match self.grade_from_provider(event).await {
                Ok(true) => tracing::info!(%event, "backfilled actual result"),
                Ok(false) => tracing::debug!(%event, "race result not yet available"),
                Err(e) => tracing::warn!(%event, error = %e, "backfill failed"),
            }
        }

        let records = self.with_store(move |store| Ok(store.window(window))).await?;
        let stats = compute_accuracy_stats(&records);
        tracing::debug!(
            window,
            evaluated = stats.races_evaluated,
            pending = stats.races_pending,
            "accuracy stats computed"
        );
        Ok(stats)
    }

    /// Accuracy over the configured default window.
    pub async fn accuracy_stats(&self) -> Result<AccuracyStats, PredictionError> {
        self.get_accuracy_stats(self.config.accuracy_window).await
    }

    /// Record the actual finishing order of a predicted event.
    ///
    /// Returns `Ok(false)` when the event was never predicted. Blocking;
    /// async callers use [`grade_from_provider`](Self::grade_from_provider).
    pub fn record_actual_result(&self, event: EventKey, order: &[String]) -> Result<bool, PredictionError> {
        Ok(self.store.record_actual_result(event, order)?)
    }

    /// Fetch the race classification and record it. `Ok(false)` when the
    /// race has no result yet or the event was never predicted.
    pub async fn grade_from_provider(&self, event: EventKey) -> Result<bool, PredictionError> {
        let result = self
            .gate
            .call("race_results", move |p| p.session_results(event, SessionKind::Race))
            .await;
        let rows = match result {
            Ok(Some(rows)) if !rows.is_empty() => rows,
            Ok(_) => return Ok(false),
            Err(e) => {
                tracing::warn!(%event, error = %e, "race results unavailable");
                return Ok(false);
            }
        };
        let order = finishing_order(&rows);
        self.with_store(move |store| store.record_actual_result(event, &order))
            .await
    }

    /// Run a store operation on the blocking pool.
    async fn with_store<T, F>(&self, op: F) -> Result<T, PredictionError>
    where
        F: FnOnce(&AccuracyStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?;
        Ok(result?)
    }

    /// Drop everything cached for `event`.
    pub fn invalidate(&self, event: EventKey) {
        self.caches.invalidate_event(event);
        tracing::debug!(%event, "cache invalidated");
    }

    pub fn clear_caches(&self) {
        self.caches.clear();
    }

    pub fn cache_stats(&self) -> EngineCacheStats {
        EngineCacheStats {
            predictions: self.caches.predictions.stats(),
            sessions: self.caches.sessions.stats(),
            schedules: self.caches.schedules.stats(),
            season_results: self.caches.season_results.stats(),
            standings: self.caches.standings.stats(),
            entry_lists: self.caches.entry_lists.stats(),
        }
    }
}

/// Driver codes by classified position; unclassified drivers follow in
/// their reported order.
pub fn finishing_order(rows: &[Classification]) -> Vec<String> {
    let mut rows: Vec<&Classification> = rows.iter().collect();
    rows.sort_by_key(|r| r.position.unwrap_or(u32::MAX));
    rows.into_iter().map(|r| r.competitor.code.clone()).collect()
}
