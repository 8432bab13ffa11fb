//! High-water mark of the ordering column.
//!
//! The watermark is never stored on its own. It is derived from the sink at
//! the start of a run ([`resolve`]) and re-derived after every write
//! ([`advance`]), so the sink contents are the only checkpoint.

use std::fmt;
use std::str::FromStr;

use arrow::array::{Array, AsArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType as ArrowDataType, TimeUnit, TimestampMicrosecondType};
use arrow::error::ArrowError;
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info};

use crate::errors::{LoadError, SinkError};
use crate::sink::Sink;

const DISPLAY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Microseconds since the Unix epoch, read as a naive UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(i64);

impl Watermark {
    /// `1900-01-01T00:00:00`, used when the sink holds no rows yet.
    pub const FLOOR: Watermark = Watermark(-2_208_988_800_000_000);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn as_micros(&self) -> i64 {
        self.0
    }

    pub fn from_naive(value: NaiveDateTime) -> Self {
        Self(value.and_utc().timestamp_micros())
    }

    /// `None` only for values outside chrono's representable range.
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        DateTime::from_timestamp_micros(self.0).map(|dt| dt.naive_utc())
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_naive() {
            Some(ts) => write!(f, "{}", ts.format(DISPLAY_FORMAT)),
            None => write!(f, "{}us", self.0),
        }
    }
}

impl FromStr for Watermark {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDateTime::parse_from_str(s, DISPLAY_FORMAT).map(Self::from_naive)
    }
}

impl Serialize for Watermark {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Watermark {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Largest value of a timestamp or date column, ignoring nulls.
pub fn max_in_array(array: &dyn Array) -> Result<Option<Watermark>, ArrowError> {
    let micros = cast(array, &ArrowDataType::Timestamp(TimeUnit::Microsecond, None))?;
    let micros = micros.as_primitive::<TimestampMicrosecondType>();
    Ok(arrow::compute::max(micros).map(Watermark::from_micros))
}

/// Watermark Resolver: where this run starts.
///
/// A missing or empty sink resolves to [`Watermark::FLOOR`]. On the first
/// ever run the target does not exist yet, which is expected and only
/// reported at info level.
pub async fn resolve<K: Sink + ?Sized>(sink: &K, column: &str) -> Result<Watermark, LoadError> {
    match sink.max_watermark(column).await {
        Ok(Some(watermark)) => {
            info!("Resolved watermark {} from {}", watermark, sink.name());
            Ok(watermark)
        }
        Ok(None) => {
            info!(
                "Sink {} is empty, starting from floor {}",
                sink.name(),
                Watermark::FLOOR
            );
            Ok(Watermark::FLOOR)
        }
        Err(SinkError::TableNotFound { table }) => {
            info!(
                "Target {} does not exist yet (first run), starting from floor {}",
                table,
                Watermark::FLOOR
            );
            Ok(Watermark::FLOOR)
        }
        Err(e) => Err(e.into()),
    }
}

/// Watermark Advancer: recompute `MAX(column)` from what the sink durably
/// holds after a write.
///
/// The sink must already contain at least one row and the result may not be
/// lower than `previous`.
pub async fn advance<K: Sink + ?Sized>(
    sink: &K,
    column: &str,
    previous: Watermark,
) -> Result<Watermark, LoadError> {
    let current = match sink.max_watermark(column).await {
        Ok(Some(watermark)) => watermark,
        Ok(None) => {
            return Err(SinkError::Consistency {
                table: sink.name().to_string(),
                reason: "no rows visible after a successful write".to_string(),
            }
            .into());
        }
        Err(SinkError::TableNotFound { table }) => {
            return Err(SinkError::Consistency {
                table,
                reason: "table missing after a successful write".to_string(),
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    };

    if current < previous {
        return Err(LoadError::WatermarkRegression { previous, current });
    }

    debug!("Advanced watermark {} -> {}", previous, current);
    Ok(current)
}
