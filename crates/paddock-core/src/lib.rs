//! paddock-core: Race prediction and accuracy tracking.
//!
//! This crate defines the data model, the data provider seam, and the
//! scoring engine: signal extraction, weight rebalancing, confidence
//! ranges, the pre-qualifying fallback, freshness-keyed caching behind a
//! serialized provider gate, and the durable accuracy history.

pub mod accuracy;
pub mod cache;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod gate;
pub mod model;
pub mod scoring;
pub mod signals;
pub mod statistics;
pub mod traits;
pub mod weights;
