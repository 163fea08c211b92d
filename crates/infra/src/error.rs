//! Errors surfaced by the registry, executor and batch driver.
//!
//! Only infrastructure faults appear here. Business outcomes (a failed or
//! skipped query, a malformed payload, an unrecognized status) are handled
//! where they occur and never become an `Err`.

use crate::engine::EngineError;
use crate::store::StoreError;

pub type DeferResult<T> = Result<T, DeferError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeferError {
    /// The cache or priority set could not be reached.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The engine's timeout could not be set or reset.
    #[error("query engine unavailable: {0}")]
    Engine(#[from] EngineError),
}
