use std::collections::HashMap;
use std::sync::{Arc, Once};

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use deltalake::datafusion::prelude::SessionContext;
use deltalake::operations::write::SchemaMode;
use deltalake::protocol::SaveMode;
use deltalake::{DeltaOps, DeltaTable, DeltaTableError};
use tracing::{debug, info};

use crate::config::SinkOptions;
use crate::errors::SinkError;
use crate::sink::{Sink, WriteMode, WriteResult};
use crate::watermark::{self, Watermark};

static REGISTER_S3: Once = Once::new();

/// Delta Lake target. Every write is a single commit on the table log.
pub struct DeltaSink {
    table_uri: String,
    table_name: String,
    storage_options: HashMap<String, String>,
    partition_columns: Option<Vec<String>>,
}

impl DeltaSink {
    pub fn new(table_uri: impl Into<String>, table_name: impl Into<String>) -> Self {
        let table_uri = table_uri.into();
        if table_uri.starts_with("s3://") || table_uri.starts_with("s3a://") {
            REGISTER_S3.call_once(|| deltalake::aws::register_handlers(None));
        }

        Self {
            table_uri,
            table_name: table_name.into(),
            storage_options: HashMap::new(),
            partition_columns: None,
        }
    }

    pub fn from_options(options: &SinkOptions) -> Self {
        let mut sink = Self::new(options.table_uri(), options.table_name.clone());
        sink.storage_options = options.storage_options.clone().unwrap_or_default();
        sink.partition_columns = options.partition_columns.clone();
        sink
    }

    pub fn with_storage_options(mut self, storage_options: HashMap<String, String>) -> Self {
        self.storage_options = storage_options;
        self
    }

    pub fn with_partition_columns(mut self, partition_columns: Vec<String>) -> Self {
        self.partition_columns = Some(partition_columns);
        self
    }

    pub fn table_uri(&self) -> &str {
        &self.table_uri
    }

    async fn load_table(&self) -> Result<DeltaTable, SinkError> {
        match deltalake::open_table_with_storage_options(
            &self.table_uri,
            self.storage_options.clone(),
        )
        .await
        {
            Ok(table) => Ok(table),
            Err(DeltaTableError::NotATable(_)) | Err(DeltaTableError::InvalidTableLocation(_)) => {
                Err(SinkError::TableNotFound {
                    table: self.table_uri.clone(),
                })
            }
            Err(e) => Err(SinkError::Query {
                table: self.table_uri.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn query_error(&self, e: impl ToString) -> SinkError {
        SinkError::Query {
            table: self.table_uri.clone(),
            reason: e.to_string(),
        }
    }
}

/// Double-quotes an identifier so DataFusion keeps its case.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl Sink for DeltaSink {
    async fn max_watermark(&self, column: &str) -> Result<Option<Watermark>, SinkError> {
        let table = self.load_table().await?;
        debug!(
            "Querying MAX({}) on {} at version {}",
            column,
            self.table_uri,
            table.version()
        );

        let ctx = SessionContext::new();
        ctx.register_table("sink", Arc::new(table))
            .map_err(|e| self.query_error(e))?;

        let sql = format!("SELECT MAX({}) AS watermark FROM sink", quote_ident(column));
        let batches = ctx
            .sql(&sql)
            .await
            .map_err(|e| self.query_error(e))?
            .collect()
            .await
            .map_err(|e| self.query_error(e))?;

        let mut max = None;
        for batch in &batches {
            if batch.num_columns() == 0 {
                continue;
            }
            let batch_max =
                watermark::max_in_array(batch.column(0).as_ref()).map_err(|e| self.query_error(e))?;
            max = max.max(batch_max);
        }
        Ok(max)
    }

    async fn write(&self, batch: RecordBatch, mode: WriteMode) -> Result<WriteResult, SinkError> {
        let rows_written = batch.num_rows();
        let write_error = |e: DeltaTableError| SinkError::Write {
            table: self.table_uri.clone(),
            reason: e.to_string(),
        };

        let ops = DeltaOps::try_from_uri_with_storage_options(
            &self.table_uri,
            self.storage_options.clone(),
        )
        .await
        .map_err(write_error)?;

        let mut builder = ops
            .write(vec![batch])
            .with_table_name(self.table_name.clone());
        builder = match mode {
            // Replaces the schema along with the rows, so the target is
            // rebuilt from this batch alone.
            WriteMode::Initialize => builder
                .with_save_mode(SaveMode::Overwrite)
                .with_schema_mode(SchemaMode::Overwrite),
            WriteMode::Append => builder.with_save_mode(SaveMode::Append),
        };

        if let Some(partition_cols) = &self.partition_columns {
            builder = builder.with_partition_columns(partition_cols.clone());
        }

        let table = builder.await.map_err(write_error)?;

        info!(
            "Wrote {} rows to Delta table {} ({:?}), version {}",
            rows_written,
            self.table_name,
            mode,
            table.version()
        );

        Ok(WriteResult {
            rows_written,
            version: Some(table.version()),
        })
    }

    fn name(&self) -> &str {
        &self.table_uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray, TimestampMicrosecondArray};
    use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
    use tempfile::TempDir;

    fn batch(ids: Vec<i64>, micros: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new(
                "ModifiedAt",
                DataType::Timestamp(TimeUnit::Microsecond, None),
                false,
            ),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(TimestampMicrosecondArray::from(micros)),
            ],
        )
        .unwrap()
    }

    fn sink_in(dir: &TempDir) -> DeltaSink {
        let uri = dir.path().join("orders");
        std::fs::create_dir_all(&uri).unwrap();
        DeltaSink::new(uri.to_str().unwrap(), "orders")
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("ModifiedAt"), "\"ModifiedAt\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn test_missing_table_is_reported_as_not_found() {
        let dir = TempDir::new().unwrap();
        let sink = sink_in(&dir);

        let err = sink.max_watermark("ModifiedAt").await.unwrap_err();
        assert!(matches!(err, SinkError::TableNotFound { .. }));
    }

    #[tokio::test]
    async fn test_append_creates_table_and_max_reflects_writes() {
        let dir = TempDir::new().unwrap();
        let sink = sink_in(&dir);

        let first = sink
            .write(batch(vec![1, 2], vec![100, 200]), WriteMode::Append)
            .await
            .unwrap();
        assert_eq!(first.rows_written, 2);
        assert_eq!(
            sink.max_watermark("ModifiedAt").await.unwrap(),
            Some(Watermark::from_micros(200))
        );

        sink.write(batch(vec![3], vec![300]), WriteMode::Append)
            .await
            .unwrap();
        assert_eq!(
            sink.max_watermark("ModifiedAt").await.unwrap(),
            Some(Watermark::from_micros(300))
        );
    }

    #[tokio::test]
    async fn test_initialize_overwrites_previous_rows() {
        let dir = TempDir::new().unwrap();
        let sink = sink_in(&dir);

        sink.write(batch(vec![1, 2], vec![100, 900]), WriteMode::Append)
            .await
            .unwrap();
        sink.write(batch(vec![3], vec![50]), WriteMode::Initialize)
            .await
            .unwrap();

        assert_eq!(
            sink.max_watermark("ModifiedAt").await.unwrap(),
            Some(Watermark::from_micros(50))
        );
    }

    #[tokio::test]
    async fn test_initialize_replaces_schema() {
        let dir = TempDir::new().unwrap();
        let sink = sink_in(&dir);
        sink.write(batch(vec![1, 2], vec![100, 900]), WriteMode::Append)
            .await
            .unwrap();

        let widened = |ids: Vec<i64>, micros: Vec<i64>| {
            let schema = Arc::new(Schema::new(vec![
                Field::new("id", DataType::Int64, false),
                Field::new("region", DataType::Utf8, true),
                Field::new(
                    "ModifiedAt",
                    DataType::Timestamp(TimeUnit::Microsecond, None),
                    false,
                ),
            ]));
            let regions: Vec<Option<&str>> = ids.iter().map(|_| Some("eu")).collect();
            RecordBatch::try_new(
                schema,
                vec![
                    Arc::new(Int64Array::from(ids)),
                    Arc::new(StringArray::from(regions)),
                    Arc::new(TimestampMicrosecondArray::from(micros)),
                ],
            )
            .unwrap()
        };

        sink.write(widened(vec![3], vec![50]), WriteMode::Initialize)
            .await
            .unwrap();
        // Appending with the new column set only works if the old schema is gone.
        sink.write(widened(vec![4], vec![60]), WriteMode::Append)
            .await
            .unwrap();

        assert_eq!(
            sink.max_watermark("ModifiedAt").await.unwrap(),
            Some(Watermark::from_micros(60))
        );
    }
}
