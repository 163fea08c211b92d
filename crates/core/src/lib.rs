//! `deferq-core`: data model for deferred query execution.
//!
//! This crate contains **pure data** (descriptors, statuses, summaries) and no
//! store or engine concerns; those live in `deferq-infra`.

pub mod error;
pub mod id;
pub mod query;
pub mod status;

pub use error::{DescriptorError, DescriptorResult};
pub use id::SweepId;
pub use query::{CachedDeferredQuery, DeferredQuery, EntityRef, Hints, ParamValue, QueryParameter};
pub use status::{ExecuteResultRow, ExecuteStatus, SweepSummary};
