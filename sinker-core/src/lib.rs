//! Core of the sinker: a daemon that moves records from partitioned streams
//! into a columnar store in batches, with at-least-once delivery. Offsets are
//! committed back to the stream only after the store has acknowledged the
//! batch covering them.
//!
//! The [`Sinker`] orchestrator owns one task per configured stream. Each task
//! polls its consumer, parses records into typed rows, buffers them until a
//! size or age threshold trips, writes the batch through a retrying store
//! writer, and finally commits the covered offsets.

pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::metrics::{SinkerMetrics, start_metrics_server};
pub use crate::sinker::Sinker;

/// Capped exponential backoff with full jitter for the store writer.
mod backoff;

/// Row and cursor buffering with size and age flush thresholds.
mod batch;

/// Configuration loading and validation.
mod config;

/// Crate-wide error type.
mod error;

/// Counter registry, the `/metrics` endpoint, and liveness.
mod metrics;

/// Records, cursors, and parsed rows.
mod message;

/// Payload to typed-row parsing.
mod parser;

/// Periodic statistics push to a push gateway.
mod pusher;

/// Orchestrator tying tasks, metrics, and the pusher together.
mod sinker;

/// The stream side of a task.
mod source;

/// The store side of a task.
mod store;

/// The per-stream pipeline: poll, parse, batch, flush, commit.
mod task;

/// Store connection tracking and the bounded write retry loop.
mod writer;
