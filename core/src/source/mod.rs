pub mod memory;
pub mod postgres;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;

use crate::errors::SourceError;
use crate::watermark::Watermark;

/// A relational table that can be read in order of a timestamp column.
///
/// Equivalent to
/// `SELECT TOP limit * FROM table WHERE column > watermark ORDER BY column ASC`.
/// The comparison must be strict so the row that produced the watermark is
/// not read again.
#[async_trait]
pub trait Source: Send + Sync {
    /// Returns at most `limit` rows with `column > watermark`, ascending by
    /// `column`. Fewer than `limit` rows means the source is exhausted
    /// relative to `watermark`.
    async fn fetch_after(
        &self,
        column: &str,
        watermark: Watermark,
        limit: usize,
    ) -> Result<RecordBatch, SourceError>;

    /// Human readable identifier used in logs and errors.
    fn name(&self) -> &str;
}
