use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::{ConfigError, LoadError, Result};
use crate::schema::{SchemaField, build_arrow_schema};

pub const DEFAULT_BATCH_SIZE: usize = 1_000_000;
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub load: LoadSettings,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: String,
    pub options: PostgresOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresOptions {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    /// Name of the environment variable holding the password.
    pub password_env: Option<String>,
    pub dbname: String,
    /// Source table, optionally schema-qualified (`sales.orders`).
    pub table: String,
    pub columns: Vec<SchemaField>,
    pub connect_timeout_ms: Option<u64>,
    pub statement_timeout_ms: Option<u64>,
    pub application_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub target_type: String,
    pub options: SinkOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkOptions {
    /// Staging location the target table lives under, e.g. `s3://lake/raw`.
    pub path: String,
    pub table_name: String,
    pub storage_options: Option<HashMap<String, String>>,
    pub partition_columns: Option<Vec<String>>,
}

impl SinkOptions {
    pub fn table_uri(&self) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), self.table_name)
    }
}

/// Knobs of the batch loop itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadSettings {
    /// Ordering column the watermark is taken from.
    #[serde(default)]
    pub timestamp_column: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Recreate the target on the first batch of a first-ever population.
    /// Ignored once the target holds rows.
    #[serde(default)]
    pub recreate_target: bool,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

impl LoadSettings {
    pub fn new(timestamp_column: impl Into<String>) -> Self {
        Self {
            timestamp_column: timestamp_column.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            recreate_target: false,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.timestamp_column.is_empty() {
            return Err(ConfigError::MissingField {
                field: "load.timestamp_column".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "batch_size must be greater than zero".to_string(),
            });
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "max_iterations must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

pub async fn load_config(config_path: Option<&str>) -> Result<LoadConfig> {
    match config_path {
        Some(path) => LoadConfig::from_file(path),
        None => LoadConfig::from_env(),
    }
}

impl LoadConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        let config: LoadConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let config_str = std::env::var("LOAD_CONFIG").map_err(|_| ConfigError::MissingField {
            field: "LOAD_CONFIG environment variable".to_string(),
        })?;
        let config: LoadConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.load.validate()?;

        if self.source.source_type != "postgres" {
            return Err(ConfigError::Invalid {
                message: format!("Unsupported source type: {}", self.source.source_type),
            });
        }
        if self.sink.target_type != "delta" {
            return Err(ConfigError::Invalid {
                message: format!("Unsupported sink type: {}", self.sink.target_type),
            });
        }

        let source = &self.source.options;
        for (field, value) in [
            ("source.options.host", &source.host),
            ("source.options.user", &source.user),
            ("source.options.dbname", &source.dbname),
            ("source.options.table", &source.table),
            ("sink.options.path", &self.sink.options.path),
            ("sink.options.table_name", &self.sink.options.table_name),
        ] {
            if value.is_empty() {
                return Err(ConfigError::MissingField {
                    field: field.to_string(),
                });
            }
        }

        build_arrow_schema(&source.columns)?;

        let ordering = source
            .columns
            .iter()
            .find(|c| c.name == self.load.timestamp_column)
            .ok_or_else(|| ConfigError::ValidationFailed {
                reason: format!(
                    "Timestamp column {} is not part of the source columns",
                    self.load.timestamp_column
                ),
            })?;
        if !ordering.data_type.is_orderable_timestamp() {
            return Err(ConfigError::ValidationFailed {
                reason: format!(
                    "Timestamp column {} must be a timestamp or date, got {:?}",
                    ordering.name, ordering.data_type
                ),
            });
        }

        if let Some(partition_cols) = &self.sink.options.partition_columns {
            for col in partition_cols {
                if !source.columns.iter().any(|c| &c.name == col) {
                    return Err(ConfigError::ValidationFailed {
                        reason: format!("Partition column {} is not part of the source columns", col),
                    });
                }
            }
        }

        Ok(())
    }

    /// Parses and validates in one step.
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: LoadConfig = serde_yaml::from_str(yaml)?;
        config.validate().map_err(LoadError::Config)?;
        Ok(config)
    }
}
