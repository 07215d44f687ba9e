//! paddock-providers: Data provider integrations.
//!
//! Implements the `DataProvider` trait for the Ergast-compatible HTTP API
//! and an in-memory mock, and hosts configuration loading and logging
//! setup for applications embedding the prediction engine.

pub mod config;
pub mod ergast;
pub mod logging;
pub mod mock;

pub use config::{create_provider, load_config, PaddockConfig, ProviderConfig};
pub use ergast::ErgastProvider;
pub use logging::LogFormat;
pub use mock::{MockOp, MockProvider};
