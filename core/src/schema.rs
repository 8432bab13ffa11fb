use std::collections::HashMap;
use std::sync::Arc;

use arrow::datatypes::{DataType as ArrowDataType, Field, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// One column of the table being copied, as declared in the configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaField {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    pub metadata: Option<HashMap<String, String>>,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Boolean,
    Int16,
    #[serde(alias = "int")]
    Int32,
    #[serde(alias = "long")]
    Int64,
    Float32,
    Float64,
    Utf8,
    Binary,
    Date32,
    #[serde(alias = "timestamp")]
    TimestampMicrosecond,
}

impl DataType {
    pub fn to_arrow(self) -> ArrowDataType {
        match self {
            DataType::Boolean => ArrowDataType::Boolean,
            DataType::Int16 => ArrowDataType::Int16,
            DataType::Int32 => ArrowDataType::Int32,
            DataType::Int64 => ArrowDataType::Int64,
            DataType::Float32 => ArrowDataType::Float32,
            DataType::Float64 => ArrowDataType::Float64,
            DataType::Utf8 => ArrowDataType::Utf8,
            DataType::Binary => ArrowDataType::Binary,
            DataType::Date32 => ArrowDataType::Date32,
            DataType::TimestampMicrosecond => ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
        }
    }

    /// Whether a column of this type can carry the watermark.
    pub fn is_orderable_timestamp(self) -> bool {
        matches!(self, DataType::TimestampMicrosecond | DataType::Date32)
    }
}

pub fn build_arrow_schema(schema_fields: &[SchemaField]) -> Result<SchemaRef, ConfigError> {
    if schema_fields.is_empty() {
        return Err(ConfigError::ValidationFailed {
            reason: "Table schema cannot be empty".to_string(),
        });
    }

    let mut fields = Vec::with_capacity(schema_fields.len());
    for schema_field in schema_fields {
        if fields.iter().any(|f: &Field| f.name() == &schema_field.name) {
            return Err(ConfigError::ValidationFailed {
                reason: format!("Duplicate column {} in table schema", schema_field.name),
            });
        }
        let mut field = Field::new(
            &schema_field.name,
            schema_field.data_type.to_arrow(),
            schema_field.nullable,
        );
        if let Some(metadata) = &schema_field.metadata {
            field = field.with_metadata(metadata.clone());
        }
        fields.push(field);
    }

    Ok(Arc::new(Schema::new(fields)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_type_aliases() {
        let yaml = r#"
- name: id
  data_type: long
  nullable: false
- name: qty
  data_type: int
- name: modified_at
  data_type: timestamp
"#;
        let fields: Vec<SchemaField> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(fields[0].data_type, DataType::Int64);
        assert_eq!(fields[1].data_type, DataType::Int32);
        assert!(fields[1].nullable);
        assert_eq!(fields[2].data_type, DataType::TimestampMicrosecond);
    }

    #[test]
    fn test_build_arrow_schema() {
        let fields = vec![
            SchemaField {
                name: "id".to_string(),
                data_type: DataType::Int64,
                nullable: false,
                metadata: None,
            },
            SchemaField {
                name: "modified_at".to_string(),
                data_type: DataType::TimestampMicrosecond,
                nullable: false,
                metadata: Some(HashMap::from([("source".to_string(), "erp".to_string())])),
            },
        ];

        let schema = build_arrow_schema(&fields).unwrap();
        assert_eq!(schema.fields().len(), 2);
        assert_eq!(
            schema.field(1).data_type(),
            &ArrowDataType::Timestamp(TimeUnit::Microsecond, None)
        );
        assert_eq!(schema.field(1).metadata().get("source").unwrap(), "erp");
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let field = SchemaField {
            name: "id".to_string(),
            data_type: DataType::Int64,
            nullable: false,
            metadata: None,
        };
        assert!(build_arrow_schema(&[field.clone(), field]).is_err());
        assert!(build_arrow_schema(&[]).is_err());
    }
}
