//! Log-structured stream layer.
//!
//! A stream is an append-only, file-backed log of subject-addressed records
//! with interest-based retention: a record is kept exactly as long as at
//! least one durable consumer has not acknowledged it, and a record matched
//! by no consumer at append time is not stored at all.

pub mod consumer;
pub mod log;

pub use consumer::{ConsumerConfig, DurableConsumer};
pub use log::{StoredMessage, StreamConfig, StreamLog, StreamStore};

/// Prefix of per-message acknowledgement subjects:
/// `$LOG.ack.<stream>.<consumer>.<seq>`.
pub const ACK_PREFIX: &str = "$LOG.ack.";
