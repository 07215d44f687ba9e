//! Engine configuration and provider factory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use paddock_core::accuracy::AccuracyStore;
use paddock_core::engine::{EngineConfig, PredictionEngine};
use paddock_core::fallback::ScoringPolicy;
use paddock_core::signals::ExtractionSettings;
use paddock_core::traits::DataProvider;
use paddock_core::weights::Weights;

use crate::ergast::{ErgastProvider, DEFAULT_BASE_URL};
use crate::logging::LogFormat;
use crate::mock::MockProvider;

/// Which data provider backs the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Empty in-memory provider, for dry runs.
    Mock,
    Ergast {
        #[serde(default = "default_ergast_url")]
        base_url: String,
    },
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Ergast {
            base_url: default_ergast_url(),
        }
    }
}

fn default_ergast_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

/// Top-level paddock configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaddockConfig {
    /// Base weights of the five canonical signals; must sum to 1.0.
    #[serde(default)]
    pub weights: Weights,
    /// Weight of practice pace before qualifying has run.
    #[serde(default = "default_practice_weight")]
    pub practice_weight: f64,
    /// Confidence widening, in points, before qualifying has run.
    #[serde(default = "default_pre_qualifying_margin")]
    pub pre_qualifying_margin: u8,
    /// Bound on each provider call.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    /// Where prediction snapshots and results are kept.
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
    /// Events aggregated into accuracy stats by default.
    #[serde(default = "default_accuracy_window")]
    pub accuracy_window: usize,
    #[serde(default = "default_recent_form_races")]
    pub recent_form_races: usize,
    #[serde(default = "default_circuit_editions")]
    pub circuit_editions: usize,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub provider: ProviderConfig,
}

fn default_practice_weight() -> f64 {
    paddock_core::weights::DEFAULT_PRACTICE_WEIGHT
}
fn default_pre_qualifying_margin() -> u8 {
    paddock_core::fallback::DEFAULT_PRE_QUALIFYING_MARGIN
}
fn default_provider_timeout_secs() -> u64 {
    paddock_core::engine::DEFAULT_PROVIDER_TIMEOUT.as_secs()
}
fn default_history_path() -> PathBuf {
    PathBuf::from("data/prediction_history.json")
}
fn default_accuracy_window() -> usize {
    paddock_core::engine::DEFAULT_ACCURACY_WINDOW
}
fn default_recent_form_races() -> usize {
    paddock_core::signals::DEFAULT_RECENT_FORM_RACES
}
fn default_circuit_editions() -> usize {
    paddock_core::signals::DEFAULT_CIRCUIT_EDITIONS
}

impl Default for PaddockConfig {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            practice_weight: default_practice_weight(),
            pre_qualifying_margin: default_pre_qualifying_margin(),
            provider_timeout_secs: default_provider_timeout_secs(),
            history_path: default_history_path(),
            accuracy_window: default_accuracy_window(),
            recent_form_races: default_recent_form_races(),
            circuit_editions: default_circuit_editions(),
            log_format: LogFormat::default(),
            provider: ProviderConfig::default(),
        }
    }
}

impl PaddockConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    /// The engine settings, rejecting weights that do not sum to 1.0.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let config = EngineConfig {
            policy: ScoringPolicy {
                base: self.weights,
                practice_weight: self.practice_weight,
                pre_qualifying_margin: self.pre_qualifying_margin,
            },
            extraction: ExtractionSettings {
                recent_form_races: self.recent_form_races,
                circuit_editions: self.circuit_editions,
            },
            provider_timeout: self.provider_timeout(),
            accuracy_window: self.accuracy_window,
        };
        config.validate().context("invalid scoring configuration")?;
        Ok(config)
    }

    /// Build an engine wired to the configured provider and history file.
    pub fn build_engine(&self) -> Result<PredictionEngine> {
        let provider = create_provider(&self.provider, self.provider_timeout())?;
        let store = AccuracyStore::new(&self.history_path);
        let engine = PredictionEngine::new(provider, store, self.engine_config()?)
            .context("failed to build prediction engine")?;
        Ok(engine)
    }
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
fn resolve_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    while let Some(start) = result.find("${") {
        let Some(end) = result[start..].find('}') else {
            break;
        };
        let var_name = &result[start + 2..start + end];
        let value = std::env::var(var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
    }
    result
}

fn resolve_provider_config(config: &ProviderConfig) -> ProviderConfig {
    match config {
        ProviderConfig::Mock => ProviderConfig::Mock,
        ProviderConfig::Ergast { base_url } => ProviderConfig::Ergast {
            base_url: resolve_env_vars(base_url),
        },
    }
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `paddock.toml` in the current directory
/// 2. `~/.config/paddock/config.toml`
///
/// Environment variable overrides: `PADDOCK_ERGAST_URL`, `PADDOCK_HISTORY_PATH`.
pub fn load_config() -> Result<PaddockConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<PaddockConfig> {
    let config_path = match path {
        Some(p) if p.exists() => Some(p.to_path_buf()),
        Some(p) => anyhow::bail!("config file not found: {}", p.display()),
        None => {
            let local = PathBuf::from("paddock.toml");
            if local.exists() {
                Some(local)
            } else {
                dirs_path()
                    .map(|home| home.join("config.toml"))
                    .filter(|global| global.exists())
            }
        }
    };

    let mut config = match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            let config = parse_config(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?;
            tracing::debug!(path = %path.display(), "config loaded");
            config
        }
        None => PaddockConfig::default(),
    };

    // Apply env var overrides
    if let Ok(url) = std::env::var("PADDOCK_ERGAST_URL") {
        config.provider = ProviderConfig::Ergast { base_url: url };
    }
    if let Ok(path) = std::env::var("PADDOCK_HISTORY_PATH") {
        config.history_path = PathBuf::from(path);
    }

    Ok(config)
}

/// Parse a TOML document and resolve `${VAR}` references in it.
pub fn parse_config(content: &str) -> Result<PaddockConfig> {
    let mut config: PaddockConfig = toml::from_str(content)?;
    config.provider = resolve_provider_config(&config.provider);
    let history = config.history_path.to_string_lossy();
    if history.contains("${") {
        config.history_path = PathBuf::from(resolve_env_vars(&history));
    }
    Ok(config)
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("paddock"))
}

/// Create a provider instance from its configuration.
pub fn create_provider(config: &ProviderConfig, timeout: Duration) -> Result<Arc<dyn DataProvider>> {
    match config {
        ProviderConfig::Mock => Ok(Arc::new(MockProvider::new())),
        ProviderConfig::Ergast { base_url } => {
            let provider = ErgastProvider::new(base_url, timeout)
                .with_context(|| format!("failed to create ergast provider for {base_url}"))?;
            Ok(Arc::new(provider))
        }
    }
}
