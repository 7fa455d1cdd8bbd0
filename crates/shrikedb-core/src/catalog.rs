use std::collections::BTreeMap;

use crate::error::CoreError;
use crate::field::Field;
use crate::table::{FieldSpec, Table};

/// Maximum length for table and field identifiers
const MAX_IDENTIFIER_LEN: usize = 128;

/// Validates a table or field identifier.
/// Returns Ok(()) if valid, Err with reason if invalid.
///
/// Rules:
/// - Must not be empty
/// - Must not exceed MAX_IDENTIFIER_LEN (128) characters
/// - Must start with a letter or underscore
/// - May only contain letters, digits, underscores
pub fn validate_identifier(name: &str, kind: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::InvalidArgument(format!(
            "{kind} name cannot be empty"
        )));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(CoreError::InvalidArgument(format!(
            "{kind} name too long ({} > {})",
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }
    // Check for null bytes and path separators
    if name.contains('\0') || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(CoreError::InvalidArgument(format!(
            "{kind} name contains invalid characters"
        )));
    }
    // Must start with letter or underscore
    let first_char = name.chars().next().unwrap_or('\0');
    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(CoreError::InvalidArgument(format!(
            "{kind} name must start with a letter or underscore"
        )));
    }
    // All chars must be alphanumeric or underscore
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(CoreError::InvalidArgument(format!(
                "{kind} name contains invalid character: '{}'",
                c
            )));
        }
    }
    Ok(())
}

/// Registry of live tables. There is exactly one per process in practice,
/// but nothing here is global; the owner decides how it is shared.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: BTreeMap<String, Table>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    /// Creates a table with the given columns. The schema is fixed from
    /// this point on; a table with no columns is legal but can only ever
    /// hold zero rows.
    pub fn create_table(&mut self, name: &str, fields: Vec<FieldSpec>) -> Result<(), CoreError> {
        validate_identifier(name, "table")?;
        if self.tables.contains_key(name) {
            return Err(CoreError::AlreadyExists(format!("table '{name}'")));
        }
        let mut table = Table::new(name);
        for spec in fields {
            validate_identifier(&spec.name, "field")?;
            let field = Field::new(
                &spec.name,
                spec.field_type,
                spec.encoding.unwrap_or_default(),
            )?;
            table.set_field(field)?;
        }
        self.tables.insert(name.to_string(), table);
        Ok(())
    }

    pub fn drop_table(&mut self, name: &str) -> Result<(), CoreError> {
        match self.tables.remove(name) {
            Some(_) => Ok(()),
            None => Err(CoreError::NotFound(format!("table '{name}'"))),
        }
    }

    pub fn table(&self, name: &str) -> Result<&Table, CoreError> {
        self.tables
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("table '{name}'")))
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut Table, CoreError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| CoreError::NotFound(format!("table '{name}'")))
    }

    /// Table names in sorted order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }
}
