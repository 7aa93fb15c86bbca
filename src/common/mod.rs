//! Shared types and infrastructure
//!
//! Database-agnostic pieces used across the pipeline, log, and dispatch
//! layers:
//!
//! - [`RiffleError`] / [`Result`] - error taxonomy and classification
//! - [`ChangeEvent`] - decoded logical row change
//! - [`SubjectTemplate`] - event → subject derivation
//! - [`CheckpointStore`] - durable LSN/cursor resume positions
//! - [`RetryConfig`] - backoff policy for reconnects, sinks, restarts
//! - [`HealthTracker`] - per-unit health derivation

mod checkpoint;
mod error;
mod event;
mod health;
mod resilience;
mod route;

pub use checkpoint::{format_lsn, parse_lsn, Checkpoint, CheckpointStore, PositionType};
pub use error::{ErrorCategory, Result, RiffleError};
pub use event::{ChangeEvent, ChangeOp};
pub use health::{Health, HealthConfig, HealthTracker};
pub use resilience::{RetryConfig, RetryConfigBuilder};
pub use route::SubjectTemplate;
