//! # riffle - Postgres changes as a subject-addressed message log
//!
//! Riffle consumes a PostgreSQL logical-replication slot and turns the
//! WAL into a durable, ordered, subject-addressable message log that
//! pull and push consumers drain with at-least-once guarantees.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   pgoutput    ┌──────────────┐   commit batches   ┌─────────────┐
//! │ PostgreSQL │ ────────────▶ │  SlotWorker  │ ─────────────────▶ │ MessageLog  │
//! │  WAL slot  │ ◀──────────── │ (per slot)   │    LSN checkpoint  │ (per stream)│
//! └────────────┘  status acks  └──────────────┘                    └──────┬──────┘
//!                                                                        │ seq > cursor,
//!                                                                        │ subject filter
//!                                                  ┌─────────────────────┴───────┐
//!                                                  ▼                             ▼
//!                                          ┌──────────────┐              ┌──────────────┐
//!                                          │  Dispatcher  │              │  PushRunner  │
//!                                          │ (pull: batch │              │ (per sink)   │
//!                                          │  + ack)      │              └──────┬───────┘
//!                                          └──────────────┘                     ▼
//!                                                                        Sink::deliver
//! ```
//!
//! Every change is addressed by a dot-delimited subject derived from the
//! row (`mydb.public.users.42`), assigned a strictly increasing
//! per-stream `seq` at commit time, and carries a content hash for
//! idempotent re-ingestion. Consumers filter with `*`/`>` wildcard
//! patterns and track their own cursors.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! # async fn example() -> riffle::common::Result<()> {
//! use riffle::common::CheckpointStore;
//! use riffle::consumer::ConsumerConfig;
//! use riffle::log::MessageLog;
//! use riffle::postgres::SlotConfig;
//! use riffle::supervisor::Supervisor;
//! use riffle::subject::SubjectPattern;
//! use std::sync::Arc;
//!
//! let checkpoints = Arc::new(CheckpointStore::open("/var/lib/riffle").await?);
//! let supervisor = Supervisor::new(MessageLog::new(), checkpoints);
//!
//! supervisor
//!     .start_slot(
//!         SlotConfig::builder()
//!             .connection_string("postgres://replicator:pw@localhost:5432/mydb")
//!             .slot_name("riffle_slot")
//!             .publication("riffle_pub")
//!             .stream("mydb")
//!             .build()?,
//!     )
//!     .await?;
//!
//! supervisor
//!     .start_consumer(
//!         ConsumerConfig::builder("billing", "mydb")
//!             .filter(SubjectPattern::parse("mydb.public.orders.>")?)
//!             .build()?,
//!         None,
//!     )
//!     .await?;
//!
//! let batch = supervisor.dispatcher().next_batch("billing", 50).await?;
//! for (delivery, token) in batch {
//!     println!("{} -> {:?}", delivery.subject, delivery.envelope);
//!     supervisor.dispatcher().ack("billing", token).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - Within a stream, WAL commit order is preserved into `seq` order;
//!   transactions apply whole at their commit boundary, never partially.
//! - The slot's confirmed LSN advances only after the transaction's
//!   events are in the log, so a crash re-delivers but never skips.
//! - Delivery is at-least-once; consumers deduplicate by `seq` and
//!   `data_hash`.

pub mod common;
pub mod consumer;
pub mod log;
pub mod postgres;
pub mod subject;
pub mod supervisor;

// Core types, re-exported at the root for the common path.
pub use common::{Result, RiffleError};
pub use consumer::{AckPolicy, ConsumerConfig, Dispatcher, PushRunner, Sink};
pub use log::{Message, MessageEnvelope, MessageLog};
pub use postgres::{SlotConfig, SlotWorker};
pub use subject::{Subject, SubjectPattern};
pub use supervisor::Supervisor;
