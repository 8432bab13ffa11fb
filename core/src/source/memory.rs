use arrow::array::TimestampMicrosecondArray;
use arrow::compute::kernels::cmp::gt;
use arrow::compute::{SortOptions, cast, filter_record_batch, sort_to_indices, take_record_batch};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;

use crate::errors::SourceError;
use crate::source::Source;
use crate::watermark::Watermark;

/// Source over rows already held in memory.
pub struct MemorySource {
    name: String,
    rows: RecordBatch,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, rows: RecordBatch) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.num_rows()
    }

    fn conversion_error(&self, column: &str, e: impl ToString) -> SourceError {
        SourceError::Conversion {
            column: column.to_string(),
            reason: format!("{}: {}", self.name, e.to_string()),
        }
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn fetch_after(
        &self,
        column: &str,
        watermark: Watermark,
        limit: usize,
    ) -> Result<RecordBatch, SourceError> {
        let values = self
            .rows
            .column_by_name(column)
            .ok_or_else(|| SourceError::Query {
                table: self.name.clone(),
                source: format!("column {} does not exist", column).into(),
            })?;

        let micros = cast(
            values.as_ref(),
            &DataType::Timestamp(TimeUnit::Microsecond, None),
        )
        .map_err(|e| self.conversion_error(column, e))?;
        let threshold = TimestampMicrosecondArray::new_scalar(watermark.as_micros());
        let mask = gt(&micros, &threshold).map_err(|e| self.conversion_error(column, e))?;
        let pending =
            filter_record_batch(&self.rows, &mask).map_err(|e| self.conversion_error(column, e))?;

        let sort_column = pending
            .column_by_name(column)
            .ok_or_else(|| self.conversion_error(column, "column lost after filter"))?;
        let order = sort_to_indices(
            sort_column.as_ref(),
            Some(SortOptions {
                descending: false,
                nulls_first: false,
            }),
            Some(limit),
        )
        .map_err(|e| self.conversion_error(column, e))?;

        take_record_batch(&pending, &order).map_err(|e| self.conversion_error(column, e))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
