//! The subject-addressed message log
//!
//! - [`MessageLog`] - per-stream ordered store with atomic upsert and
//!   pattern/cursor queries
//! - [`Message`] / [`MessageEnvelope`] - the stored record and the JSON
//!   envelope consumers see

mod message;
mod store;

pub use message::{data_hash, Message, MessageEnvelope};
pub use store::{MessageLog, StreamStats};
