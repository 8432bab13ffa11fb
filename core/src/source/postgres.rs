use std::sync::Arc;
use std::time::Duration;

use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType as ArrowDataType, Field, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use futures::TryStreamExt;
use tokio_postgres::types::{FromSql, ToSql};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};

use crate::config::PostgresOptions;
use crate::errors::SourceError;
use crate::schema::build_arrow_schema;
use crate::source::Source;
use crate::watermark::{Watermark, max_in_array};

/// Days from 0001-01-01 (CE) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

pub struct PostgresSource {
    client: Client,
    table: String,
    schema: SchemaRef,
}

impl PostgresSource {
    pub async fn connect(options: &PostgresOptions) -> Result<Self, SourceError> {
        let schema = build_arrow_schema(&options.columns).map_err(|e| SourceError::Conversion {
            column: options.table.clone(),
            reason: e.to_string(),
        })?;

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&options.host)
            .port(options.port.unwrap_or(5432))
            .user(&options.user)
            .dbname(&options.dbname)
            .application_name(
                options
                    .application_name
                    .as_deref()
                    .unwrap_or("watermark-load"),
            );

        if let Some(password_env) = &options.password_env {
            let password = std::env::var(password_env).map_err(|_| SourceError::Connection {
                source: format!("password variable {} is not set", password_env).into(),
            })?;
            pg_config.password(password);
        }

        if let Some(timeout) = options.connect_timeout_ms {
            pg_config.connect_timeout(Duration::from_millis(timeout));
        }

        // Timestamps are read and compared in UTC regardless of server settings.
        let mut session = String::from("-c TimeZone=UTC");
        if let Some(timeout) = options.statement_timeout_ms {
            session.push_str(&format!(" -c statement_timeout={}", timeout));
        }
        pg_config.options(&session);

        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .map_err(|e| SourceError::Connection {
                source: Box::new(e),
            })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection closed with error: {}", e);
            }
        });

        info!(
            "Connected to postgres {}:{} for table {}",
            options.host,
            options.port.unwrap_or(5432),
            options.table
        );

        Ok(Self {
            client,
            table: options.table.clone(),
            schema,
        })
    }
}

#[async_trait]
impl Source for PostgresSource {
    async fn fetch_after(
        &self,
        column: &str,
        watermark: Watermark,
        limit: usize,
    ) -> Result<RecordBatch, SourceError> {
        let after = watermark.to_naive().ok_or_else(|| SourceError::Conversion {
            column: column.to_string(),
            reason: format!("watermark {} is out of range", watermark),
        })?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let sql = fetch_query(&self.table, &self.schema, column);
        debug!("Fetching from {}: {} [$1 = {}, $2 = {}]", self.table, sql, after, limit);

        let params: [&(dyn ToSql + Sync); 2] = [&after, &limit];
        let rows: Vec<Row> = self
            .client
            .query_raw(sql.as_str(), params)
            .await
            .map_err(|e| self.query_error(e))?
            .try_collect()
            .await
            .map_err(|e| self.query_error(e))?;

        let batch = rows_to_batch(&rows, &self.schema)?;
        if let Some(column_values) = batch.column_by_name(column) {
            if let Ok(Some(max)) = max_in_array(column_values.as_ref()) {
                debug!("Fetched {} rows from {} up to {}", batch.num_rows(), self.table, max);
            }
        }
        Ok(batch)
    }

    fn name(&self) -> &str {
        &self.table
    }
}

impl PostgresSource {
    fn query_error(&self, e: tokio_postgres::Error) -> SourceError {
        SourceError::Query {
            table: self.table.clone(),
            source: Box::new(e),
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes each part of a possibly schema-qualified table name.
fn quote_table(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

/// PostgreSQL rendering of
/// `SELECT TOP $2 <columns> FROM table WHERE column > $1 ORDER BY column ASC`.
pub fn fetch_query(table: &str, schema: &SchemaRef, column: &str) -> String {
    let select_list = schema
        .fields()
        .iter()
        .map(|field| match field.data_type() {
            ArrowDataType::Timestamp(_, _) => {
                let name = quote_ident(field.name());
                format!("{}::timestamp AS {}", name, name)
            }
            _ => quote_ident(field.name()),
        })
        .collect::<Vec<_>>()
        .join(", ");
    let column = quote_ident(column);

    format!(
        "SELECT {} FROM {} WHERE {} > $1::timestamp ORDER BY {} ASC LIMIT $2",
        select_list,
        quote_table(table),
        column,
        column
    )
}

fn column_values<'a, T: FromSql<'a>>(
    rows: &'a [Row],
    index: usize,
    field: &Field,
) -> Result<Vec<Option<T>>, SourceError> {
    rows.iter()
        .map(|row| {
            row.try_get::<_, Option<T>>(index)
                .map_err(|e| SourceError::Conversion {
                    column: field.name().clone(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

fn create_array(rows: &[Row], index: usize, field: &Field) -> Result<ArrayRef, SourceError> {
    let array: ArrayRef = match field.data_type() {
        ArrowDataType::Boolean => Arc::new(BooleanArray::from(column_values::<bool>(
            rows, index, field,
        )?)),
        ArrowDataType::Int16 => Arc::new(Int16Array::from(column_values::<i16>(
            rows, index, field,
        )?)),
        ArrowDataType::Int32 => Arc::new(Int32Array::from(column_values::<i32>(
            rows, index, field,
        )?)),
        ArrowDataType::Int64 => Arc::new(Int64Array::from(column_values::<i64>(
            rows, index, field,
        )?)),
        ArrowDataType::Float32 => Arc::new(Float32Array::from(column_values::<f32>(
            rows, index, field,
        )?)),
        ArrowDataType::Float64 => Arc::new(Float64Array::from(column_values::<f64>(
            rows, index, field,
        )?)),
        ArrowDataType::Utf8 => Arc::new(StringArray::from(column_values::<String>(
            rows, index, field,
        )?)),
        ArrowDataType::Binary => Arc::new(BinaryArray::from_iter(column_values::<Vec<u8>>(
            rows, index, field,
        )?)),
        ArrowDataType::Date32 => {
            let days: Vec<Option<i32>> = column_values::<NaiveDate>(rows, index, field)?
                .into_iter()
                .map(|d| d.map(|d| d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE))
                .collect();
            Arc::new(Date32Array::from(days))
        }
        ArrowDataType::Timestamp(TimeUnit::Microsecond, None) => {
            let micros: Vec<Option<i64>> = column_values::<NaiveDateTime>(rows, index, field)?
                .into_iter()
                .map(|ts| ts.map(|ts| Watermark::from_naive(ts).as_micros()))
                .collect();
            Arc::new(TimestampMicrosecondArray::from(micros))
        }
        other => {
            return Err(SourceError::Conversion {
                column: field.name().clone(),
                reason: format!("unsupported data type {:?}", other),
            });
        }
    };
    Ok(array)
}

fn rows_to_batch(rows: &[Row], schema: &SchemaRef) -> Result<RecordBatch, SourceError> {
    let columns = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(index, field)| create_array(rows, index, field))
        .collect::<Result<Vec<_>, _>>()?;

    RecordBatch::try_new(schema.clone(), columns).map_err(|e| SourceError::Conversion {
        column: "*".to_string(),
        reason: e.to_string(),
    })
}
