//! Consumer dispatch and delivery
//!
//! - [`Dispatcher`] - per-consumer delivery state: batches, acks,
//!   visibility timeouts, cursors, terminal failures
//! - [`PushRunner`] - the loop driving a [`Sink`] for push consumers
//! - [`Sink`] / [`DeliveryOutcome`] - the external delivery contract
//!
//! Pull consumers use the dispatcher directly:
//!
//! ```rust,no_run
//! # async fn example(dispatcher: std::sync::Arc<riffle::consumer::Dispatcher>)
//! #     -> riffle::common::Result<()> {
//! let batch = dispatcher.next_batch("billing", 50).await?;
//! for (delivery, token) in batch {
//!     // process delivery.envelope ...
//!     dispatcher.ack("billing", token).await?;
//! }
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod push;
mod sink;

pub use dispatch::{
    AckOutcome, AckPolicy, AckToken, ConsumerConfig, ConsumerConfigBuilder, ConsumerKind,
    ConsumerStatusSnapshot, Delivery, Dispatcher, TerminalFailure,
};
pub use push::PushRunner;
pub use sink::{DeliveryOutcome, Sink, StdoutSink};
