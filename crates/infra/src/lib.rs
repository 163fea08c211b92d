//! Infrastructure layer: stores, query engines, the priority registry, the
//! executor and the sweep that ties them together.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod registry;
pub mod store;
pub mod sweep;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, DeferConfig, SweepMode};
pub use error::{DeferError, DeferResult};
pub use executor::{DeferredExecutor, ExecuteDeferred};
pub use registry::{CachedResult, Demotion, PriorityRegistry, RegistryConfig};
pub use sweep::{BatchDriver, Sweep, timeout_for_score};
pub use worker::{SweepStats, SweepWorker, SweepWorkerConfig, SweepWorkerHandle};
