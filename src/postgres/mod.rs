//! PostgreSQL logical replication ingestion
//!
//! - [`SlotWorker`] / [`SlotConfig`] - one slot's streaming pipeline
//! - [`protocol`] - wire client and pgoutput decoding
//! - [`run_backfill`] - one-shot ingestion of pre-existing rows
//!
//! ## Quick start
//!
//! ```rust,no_run
//! # async fn example() -> riffle::common::Result<()> {
//! use riffle::common::CheckpointStore;
//! use riffle::log::MessageLog;
//! use riffle::postgres::{SlotConfig, SlotWorker};
//! use std::sync::Arc;
//!
//! let config = SlotConfig::builder()
//!     .connection_string("postgres://replicator:pw@localhost:5432/mydb")
//!     .slot_name("riffle_slot")
//!     .publication("riffle_pub")
//!     .stream("mydb")
//!     .build()?;
//!
//! let log = MessageLog::new();
//! let checkpoints = Arc::new(CheckpointStore::open("/var/lib/riffle").await?);
//! let worker = SlotWorker::new(config, log, checkpoints);
//!
//! let (_tx, mut shutdown) = tokio::sync::broadcast::channel(1);
//! worker.run(&mut shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod protocol;

mod backfill;
mod source;
mod types;

pub use backfill::{run_backfill, BackfillConfig, BackfillReport};
pub use source::{
    SlotConfig, SlotConfigBuilder, SlotState, SlotStatus, SlotStatusSnapshot, SlotWorker,
    TxnAssembler, TxnBatch,
};
pub use types::{pg_text_to_json, row_identity, tuple_to_json};
