use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "load_core=info,runner_container=info,bootstrap=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Counters for a single run.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct LoadMetrics {
    pub rows_fetched: u64,
    pub rows_written: u64,
    pub batches_fetched: usize,
    pub sink_writes: usize,
    pub watermark_queries: usize,
    pub avg_batch_size: f64,
}

impl LoadMetrics {
    pub fn record_fetch(&mut self, rows: usize) {
        self.batches_fetched += 1;
        self.rows_fetched += rows as u64;
    }

    pub fn record_write(&mut self, rows: usize) {
        self.sink_writes += 1;
        self.rows_written += rows as u64;
        self.avg_batch_size = self.rows_written as f64 / self.sink_writes as f64;
    }

    pub fn record_watermark_query(&mut self) {
        self.watermark_queries += 1;
    }
}
