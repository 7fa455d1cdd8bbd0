use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::CoreError;

/// Logical type of a column, as declared at table creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Timestamp,
    Int,
    String,
    Boolean,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Timestamp => "timestamp",
            FieldType::Int => "int",
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// Physical encoding of a column. `Dict` is only defined for string columns;
/// `MultiVal` is reserved and has no storage implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldEncoding {
    #[default]
    None,
    Dict,
    #[serde(rename = "multi_val")]
    MultiVal,
}

impl fmt::Display for FieldEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldEncoding::None => "none",
            FieldEncoding::Dict => "dict",
            FieldEncoding::MultiVal => "multi_val",
        };
        f.write_str(name)
    }
}

/// One typed scalar moving between the ingest boundary, column storage, and
/// result rows.
///
/// `BigInt` is the unsigned 64-bit result domain of `count`/`sum`/`avg`; it
/// is never stored in a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Timestamp(i64),
    Int(i32),
    Str(String),
    Bool(bool),
    BigInt(u64),
}

impl Value {
    /// Converts a JSON scalar into the typed value a column of `field_type`
    /// stores. Numbers must be integral; ints must fit the signed 32-bit
    /// range. `field` is only used for error context.
    pub fn from_json(
        field: &str,
        field_type: FieldType,
        raw: &serde_json::Value,
    ) -> Result<Self, CoreError> {
        match field_type {
            FieldType::Timestamp => raw.as_i64().map(Value::Timestamp).ok_or_else(|| {
                CoreError::TypeMismatch(format!(
                    "field '{field}' expects an integer timestamp, got {raw}"
                ))
            }),
            FieldType::Int => {
                let wide = raw.as_i64().ok_or_else(|| {
                    CoreError::TypeMismatch(format!("field '{field}' expects an integer, got {raw}"))
                })?;
                let narrow = i32::try_from(wide).map_err(|_| {
                    CoreError::TypeMismatch(format!(
                        "field '{field}': value {wide} is out of the int range"
                    ))
                })?;
                Ok(Value::Int(narrow))
            }
            FieldType::String => raw
                .as_str()
                .map(|s| Value::Str(s.to_string()))
                .ok_or_else(|| {
                    CoreError::TypeMismatch(format!("field '{field}' expects a string, got {raw}"))
                }),
            FieldType::Boolean => raw.as_bool().map(Value::Bool).ok_or_else(|| {
                CoreError::TypeMismatch(format!("field '{field}' expects a boolean, got {raw}"))
            }),
        }
    }

    /// Name of the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Timestamp(_) => "timestamp",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Bool(_) => "boolean",
            Value::BigInt(_) => "bigint",
        }
    }
}

// Result cells serialize as bare JSON scalars, not tagged objects.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Timestamp(v) => serializer.serialize_i64(*v),
            Value::Int(v) => serializer.serialize_i32(*v),
            Value::Str(v) => serializer.serialize_str(v),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::BigInt(v) => serializer.serialize_u64(*v),
        }
    }
}
