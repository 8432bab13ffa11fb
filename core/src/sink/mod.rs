pub mod delta;
pub mod memory;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::SinkError;
use crate::watermark::Watermark;

/// How a batch lands in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Drop whatever the target holds and recreate it from this batch.
    /// Only used for the first batch of a first-ever population.
    Initialize,
    /// Add rows without touching existing ones.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    pub rows_written: usize,
    /// Table version after the write, for sinks that keep one.
    pub version: Option<i64>,
}

/// The `Sink` trait defines the contract for the append-only destination.
///
/// A completed `write` must be visible to the next `max_watermark` call.
/// Sinks do not deduplicate: every batch is written exactly once by the
/// loader.
#[async_trait]
pub trait Sink: Send + Sync {
    /// `MAX(column)` over everything the target holds.
    ///
    /// Returns `Ok(None)` for an existing but empty target and
    /// `Err(SinkError::TableNotFound)` when the target was never created.
    async fn max_watermark(&self, column: &str) -> Result<Option<Watermark>, SinkError>;

    async fn write(&self, batch: RecordBatch, mode: WriteMode) -> Result<WriteResult, SinkError>;

    /// Human readable identifier used in logs and errors.
    fn name(&self) -> &str;
}
