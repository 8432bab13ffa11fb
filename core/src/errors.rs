use thiserror::Error;

use crate::watermark::Watermark;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data source error: {0}")]
    Source(#[from] SourceError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Watermark moved backwards from {previous} to {current}")]
    WatermarkRegression {
        previous: Watermark,
        current: Watermark,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect or communicate with the source")]
    Connection {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Query against {table} failed")]
    Query {
        table: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Failed to convert column {column}: {reason}")]
    Conversion { column: String, reason: String },

    #[error("Source returned a batch that breaks the fetch contract: {reason}")]
    ContractViolation { reason: String },
}

#[derive(Error, Debug)]
pub enum SinkError {
    /// The target has never been written. Callers resolving a watermark
    /// treat this as an empty sink.
    #[error("Target table {table} does not exist")]
    TableNotFound { table: String },

    #[error("Failed to write to {table}: {reason}")]
    Write { table: String, reason: String },

    #[error("Aggregate query against {table} failed: {reason}")]
    Query { table: String, reason: String },

    #[error("Sink {table} is inconsistent with the last write: {reason}")]
    Consistency { table: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },

    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },

    #[error("Arrow serialization failed: {reason}")]
    Arrow { reason: String },
}

pub type Result<T> = std::result::Result<T, LoadError>;

impl From<serde_json::Error> for LoadError {
    fn from(err: serde_json::Error) -> Self {
        LoadError::Serialization(SerializationError::Json {
            reason: err.to_string(),
        })
    }
}

impl From<serde_yaml::Error> for LoadError {
    fn from(err: serde_yaml::Error) -> Self {
        LoadError::Serialization(SerializationError::Yaml {
            reason: err.to_string(),
        })
    }
}

impl From<arrow::error::ArrowError> for LoadError {
    fn from(err: arrow::error::ArrowError) -> Self {
        LoadError::Serialization(SerializationError::Arrow {
            reason: err.to_string(),
        })
    }
}

impl LoadError {
    /// Whether re-invoking the whole load can be expected to make progress.
    /// The controller never retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            LoadError::Config(_) => false,
            LoadError::Serialization(_) => false,
            LoadError::Source(SourceError::Conversion { .. }) => false,
            LoadError::Source(SourceError::ContractViolation { .. }) => false,
            LoadError::WatermarkRegression { .. } => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::Invalid {
            message: "Test message".to_string(),
        };
        assert_eq!(error.to_string(), "Invalid configuration: Test message");
    }

    #[test]
    fn test_sink_error_display() {
        let error = SinkError::TableNotFound {
            table: "s3://lake/orders".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Target table s3://lake/orders does not exist"
        );
    }

    #[test]
    fn test_regression_display_uses_iso_timestamps() {
        let error = LoadError::WatermarkRegression {
            previous: Watermark::from_micros(86_400_000_000),
            current: Watermark::from_micros(0),
        };
        assert_eq!(
            error.to_string(),
            "Watermark moved backwards from 1970-01-02T00:00:00 to 1970-01-01T00:00:00"
        );
    }

    #[test]
    fn test_load_error_from_serde_yaml_error() {
        let yaml_str = r#"
invalid yaml content:
  - missing quotes
  - "improper: structure
"#;
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>(yaml_str).unwrap_err();
        let load_error = LoadError::from(yaml_error);

        match load_error {
            LoadError::Serialization(SerializationError::Yaml { .. }) => {}
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_is_retryable() {
        let retryable_errors = vec![
            LoadError::Source(SourceError::Connection {
                source: "connection refused".into(),
            }),
            LoadError::Sink(SinkError::Write {
                table: "orders".to_string(),
                reason: "throttled".to_string(),
            }),
            LoadError::Sink(SinkError::Query {
                table: "orders".to_string(),
                reason: "timeout".to_string(),
            }),
        ];

        for error in retryable_errors {
            assert!(
                error.is_retryable(),
                "Error should be retryable: {:?}",
                error
            );
        }

        let non_retryable_errors = vec![
            LoadError::Config(ConfigError::MissingField {
                field: "timestamp_column".to_string(),
            }),
            LoadError::Source(SourceError::ContractViolation {
                reason: "unsorted".to_string(),
            }),
            LoadError::WatermarkRegression {
                previous: Watermark::FLOOR,
                current: Watermark::FLOOR,
            },
        ];

        for error in non_retryable_errors {
            assert!(
                !error.is_retryable(),
                "Error should not be retryable: {:?}",
                error
            );
        }
    }

    #[test]
    fn test_error_chain_display() {
        let inner_error = ConfigError::MissingField {
            field: "source.options.table".to_string(),
        };
        let outer_error = LoadError::Config(inner_error);

        let error_string = outer_error.to_string();
        assert!(error_string.contains("Configuration error"));
        assert!(error_string.contains("Missing required field: source.options.table"));
    }
}
