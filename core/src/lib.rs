pub mod batch;
pub mod config;
pub mod errors;
pub mod loader;
pub mod schema;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod watermark;

pub use config::{LoadConfig, LoadSettings, load_config};
pub use errors::{LoadError, Result};
pub use loader::{
    IncrementalLoader, Plan, RunOutcome, StopReason, plan_incremental_load, run_incremental_load,
};
pub use watermark::Watermark;
