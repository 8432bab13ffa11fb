use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::SinkError;
use crate::sink::{Sink, WriteMode, WriteResult};
use crate::watermark::{self, Watermark};

/// In-process sink. The table does not exist until the first write.
pub struct MemorySink {
    name: String,
    batches: Mutex<Option<Vec<RecordBatch>>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batches: Mutex::new(None),
        }
    }

    pub async fn exists(&self) -> bool {
        self.batches.lock().await.is_some()
    }

    pub async fn row_count(&self) -> usize {
        self.batches
            .lock()
            .await
            .as_ref()
            .map(|batches| batches.iter().map(RecordBatch::num_rows).sum())
            .unwrap_or(0)
    }

    /// Copy of everything written so far, in write order.
    pub async fn batches(&self) -> Vec<RecordBatch> {
        self.batches.lock().await.clone().unwrap_or_default()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn max_watermark(&self, column: &str) -> Result<Option<Watermark>, SinkError> {
        let guard = self.batches.lock().await;
        let batches = guard.as_ref().ok_or_else(|| SinkError::TableNotFound {
            table: self.name.clone(),
        })?;

        let mut max = None;
        for batch in batches {
            let array = batch
                .column_by_name(column)
                .ok_or_else(|| SinkError::Query {
                    table: self.name.clone(),
                    reason: format!("column {} not found", column),
                })?;
            let batch_max = watermark::max_in_array(array.as_ref()).map_err(|e| {
                SinkError::Query {
                    table: self.name.clone(),
                    reason: e.to_string(),
                }
            })?;
            max = max.max(batch_max);
        }
        Ok(max)
    }

    async fn write(&self, batch: RecordBatch, mode: WriteMode) -> Result<WriteResult, SinkError> {
        let rows_written = batch.num_rows();
        let mut guard = self.batches.lock().await;
        match mode {
            WriteMode::Initialize => {
                *guard = Some(vec![batch]);
            }
            WriteMode::Append => {
                guard.get_or_insert_with(Vec::new).push(batch);
            }
        }
        let version = guard.as_ref().map(|b| b.len() as i64 - 1);
        debug!("{:?} {} rows into {}", mode, rows_written, self.name);

        Ok(WriteResult {
            rows_written,
            version,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
