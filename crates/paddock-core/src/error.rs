//! Error types for the prediction engine.
//!
//! Signal-level failures are absorbed as low as possible: a provider failure
//! for one data source only marks the affected signals missing, and a
//! competitor without any usable signal becomes a [`CompetitorError`] inside
//! an otherwise successful [`PredictionSet`](crate::model::PredictionSet).
//! Only batch-level and storage-level failures reach the caller.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Competitor, EventKey};

/// Errors that can occur when reading from the external data provider.
///
/// "Not yet available" is not an error; providers report it as `Ok(None)`.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The provider asked us to back off.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The provider returned an error response.
    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    /// The call exceeded the caller-supplied timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A transport error occurred.
    #[error("network error: {0}")]
    NetworkError(String),

    /// The response could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Returns `true` if retrying the same call cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ProviderError::AuthenticationFailed(_) | ProviderError::Malformed(_)
        )
    }

    /// Returns the retry-after delay in milliseconds, if applicable.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Why a competitor was left out of the ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// No signal at all was available for the competitor.
    InsufficientData,
}

/// A per-competitor scoring failure, reported alongside ranked competitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{} excluded: {reason:?}", competitor.code)]
pub struct CompetitorError {
    pub competitor: Competitor,
    pub reason: ExclusionReason,
}

impl CompetitorError {
    pub fn insufficient_data(competitor: Competitor) -> Self {
        Self {
            competitor,
            reason: ExclusionReason::InsufficientData,
        }
    }
}

/// Scoring failed for a single competitor's signal set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScoreError {
    /// Zero signals were present, so no score can be produced.
    #[error("insufficient data: no signals present")]
    InsufficientData,
}

/// Errors from the durable accuracy store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize accuracy history: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The history document itself could not be parsed; writers refuse to
    /// overwrite it.
    #[error("accuracy history at {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    /// A result with no finishers would grade the event as a total miss.
    #[error("empty finishing order for {0}")]
    EmptyResult(EventKey),

    /// The blocking task running a store operation panicked or was cancelled.
    #[error("accuracy store task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Batch-level failures surfaced by the engine.
#[derive(Debug, Error)]
pub enum PredictionError {
    /// Neither qualifying, practice, nor an entry list named any competitor.
    #[error("no entrants known for {0}")]
    NoEntrants(EventKey),

    #[error("weights are invalid: {0}")]
    InvalidWeights(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
