use arrow::array::{Array, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, TimeUnit, TimestampMicrosecondType};
use arrow::record_batch::RecordBatch;

use crate::errors::SourceError;
use crate::source::Source;
use crate::watermark::Watermark;

/// One bounded, ordered slice of source rows. Lives for a single iteration.
#[derive(Debug, Clone)]
pub struct Batch {
    pub records: RecordBatch,
    /// Largest ordering value in `records`, `None` when empty.
    pub max: Option<Watermark>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.records.num_rows() == 0
    }
}

/// Batch Fetcher: reads the next slice strictly after `watermark` and
/// checks that the source honoured the ordering contract.
pub async fn fetch_batch<S: Source + ?Sized>(
    source: &S,
    column: &str,
    watermark: Watermark,
    limit: usize,
) -> Result<Batch, SourceError> {
    let records = source.fetch_after(column, watermark, limit).await?;
    let max = check_contract(&records, column, watermark, limit)?;
    Ok(Batch { records, max })
}

fn violation(reason: String) -> SourceError {
    SourceError::ContractViolation { reason }
}

fn check_contract(
    records: &RecordBatch,
    column: &str,
    watermark: Watermark,
    limit: usize,
) -> Result<Option<Watermark>, SourceError> {
    if records.num_rows() > limit {
        return Err(violation(format!(
            "{} rows returned for a limit of {}",
            records.num_rows(),
            limit
        )));
    }

    let values = records
        .column_by_name(column)
        .ok_or_else(|| violation(format!("ordering column {} missing from batch", column)))?;
    if values.null_count() > 0 {
        return Err(violation(format!(
            "ordering column {} contains {} nulls",
            column,
            values.null_count()
        )));
    }

    let micros = cast(values.as_ref(), &DataType::Timestamp(TimeUnit::Microsecond, None))
        .map_err(|e| SourceError::Conversion {
            column: column.to_string(),
            reason: e.to_string(),
        })?;
    let micros = micros.as_primitive::<TimestampMicrosecondType>().values();

    if let Some(first) = micros.first() {
        if *first <= watermark.as_micros() {
            return Err(violation(format!(
                "row at {} is not after watermark {}",
                Watermark::from_micros(*first),
                watermark
            )));
        }
    }
    if let Some(pos) = micros.windows(2).position(|w| w[0] > w[1]) {
        return Err(violation(format!(
            "rows are not ascending by {} at position {}",
            column,
            pos + 1
        )));
    }

    Ok(micros.last().map(|m| Watermark::from_micros(*m)))
}
