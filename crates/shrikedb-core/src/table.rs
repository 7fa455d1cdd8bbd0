use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::CoreError;
use crate::field::Field;
use crate::value::{FieldEncoding, FieldType, Value};

/// Column declaration as it arrives in a create request.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub encoding: Option<FieldEncoding>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldSpec {
            name: name.into(),
            field_type,
            encoding: None,
        }
    }

    /// A dict-encoded string column.
    pub fn dict(name: impl Into<String>) -> Self {
        FieldSpec {
            name: name.into(),
            field_type: FieldType::String,
            encoding: Some(FieldEncoding::Dict),
        }
    }
}

/// One row of a describe response.
#[derive(Debug, Serialize)]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub encoding: FieldEncoding,
}

/// Per-column slice of a stats response.
#[derive(Debug, Serialize)]
pub struct FieldStats {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub encoding: FieldEncoding,
    pub mem_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct TableStats {
    pub table: String,
    pub size: u32,
    pub fields: Vec<FieldStats>,
    pub total_mem_bytes: u64,
}

/// A named collection of equally sized columns.
///
/// `size` is the row cursor shared by every column: all fields hold exactly
/// `size` values, and the next accepted row lands at position `size + 1` in
/// each of them. Inserts keep that alignment by converting a whole request
/// up front and only then touching storage.
#[derive(Debug)]
pub struct Table {
    name: String,
    fields: BTreeMap<String, Field>,
    size: u32,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Table {
            name: name.into(),
            fields: BTreeMap::new(),
            size: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of fully inserted rows.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Attaches a column. Only valid while the table is empty; callers
    /// enforce that by building tables through the catalog.
    pub fn set_field(&mut self, field: Field) -> Result<(), CoreError> {
        if self.fields.contains_key(field.name()) {
            return Err(CoreError::AlreadyExists(format!(
                "field '{}' in table '{}'",
                field.name(),
                self.name
            )));
        }
        self.fields.insert(field.name().to_string(), field);
        Ok(())
    }

    /// Inserts a batch of rows atomically: every row is converted and
    /// checked against the schema before any column is touched, so a bad
    /// row anywhere in the batch leaves the table unchanged.
    pub fn insert_rows(&mut self, rows: &[JsonMap<String, JsonValue>]) -> Result<(), CoreError> {
        let mut converted: Vec<Vec<Value>> = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(self.fields.len());
            for (name, field) in &self.fields {
                let raw = row.get(name).ok_or_else(|| {
                    CoreError::TypeMismatch(format!(
                        "row is missing a value for field '{name}' of table '{}'",
                        self.name
                    ))
                })?;
                values.push(Value::from_json(name, field.field_type(), raw)?);
            }
            converted.push(values);
        }

        for values in &converted {
            for (field, value) in self.fields.values_mut().zip(values) {
                field.add_value(value)?;
            }
        }
        self.size += converted.len() as u32;
        Ok(())
    }

    pub fn insert_row(&mut self, row: &JsonMap<String, JsonValue>) -> Result<(), CoreError> {
        self.insert_rows(std::slice::from_ref(row))
    }

    pub fn describe(&self) -> Vec<FieldInfo> {
        self.fields
            .values()
            .map(|f| FieldInfo {
                name: f.name().to_string(),
                field_type: f.field_type(),
                encoding: f.encoding(),
            })
            .collect()
    }

    pub fn stats(&self) -> TableStats {
        let fields: Vec<FieldStats> = self
            .fields
            .values()
            .map(|f| FieldStats {
                name: f.name().to_string(),
                field_type: f.field_type(),
                encoding: f.encoding(),
                mem_bytes: f.stat_used_memory(),
            })
            .collect();
        let total_mem_bytes = fields.iter().map(|f| f.mem_bytes).sum();
        TableStats {
            table: self.name.clone(),
            size: self.size,
            fields,
            total_mem_bytes,
        }
    }
}
