//! Cumulus: analog-ensemble forecasting engine.
//!
//! Retrieves the historical atmospheric states most similar to a query
//! embedding and combines their recorded outcomes into a probabilistic
//! forecast. The crate's core is the similarity-index lifecycle: building,
//! validating, atomically deploying, backing up, and rolling back the
//! per-horizon indices the retrieval path serves from, while tracking
//! per-horizon query health and degrading gracefully when an index goes
//! bad.

pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod index;
pub mod lifecycle;
pub mod metrics;
pub mod registry;
pub mod retriever;
pub mod store;
pub mod types;

pub use engine::ForecastEngine;
pub use error::{CumulusError, Result};
