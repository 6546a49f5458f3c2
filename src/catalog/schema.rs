//! Schema definitions
//!
//! Table and index metadata. Column lists are serialized to JSON for the
//! `schema_text` column of the catalog table.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::page::PageId;
use crate::storage::record::Value;

/// SQL column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int,
    Str,
}

impl DataType {
    /// Whether a value is storable in a column of this type (NULLs are
    /// checked separately against the column's nullability).
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null) | (DataType::Int, Value::Int(_)) | (DataType::Str, Value::Str(_))
        )
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Int => write!(f, "INT"),
            DataType::Str => write!(f, "STR"),
        }
    }
}

/// Column definition in a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub primary_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Column {
        Column {
            name: name.into(),
            data_type,
            nullable: true,
            primary_key: false,
        }
    }

    pub fn primary_key(mut self) -> Column {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Column {
        self.nullable = false;
        self
    }
}

/// Table definition: stable id, root page, and ordered columns
#[derive(Debug, Clone)]
pub struct TableDef {
    pub name: String,
    pub id: u32,
    pub root_page: PageId,
    pub columns: Vec<Column>,
}

impl TableDef {
    /// Validate the column list: at least one column, unique names, exactly
    /// one primary key.
    pub fn new(
        name: impl Into<String>,
        id: u32,
        root_page: PageId,
        columns: Vec<Column>,
    ) -> Result<TableDef> {
        let name = name.into();
        if columns.is_empty() {
            return Err(Error::Schema(format!("table '{}' has no columns", name)));
        }
        let mut seen = std::collections::HashSet::new();
        for col in &columns {
            if !seen.insert(col.name.as_str()) {
                return Err(Error::Schema(format!(
                    "duplicate column '{}' in table '{}'",
                    col.name, name
                )));
            }
        }
        match columns.iter().filter(|c| c.primary_key).count() {
            1 => {}
            0 => {
                return Err(Error::Schema(format!(
                    "table '{}' has no PRIMARY KEY",
                    name
                )))
            }
            _ => {
                return Err(Error::Schema(format!(
                    "table '{}' has multiple PRIMARY KEY columns",
                    name
                )))
            }
        }
        Ok(TableDef {
            name,
            id,
            root_page,
            columns,
        })
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Position of the primary-key column.
    pub fn pk_index(&self) -> usize {
        self.columns
            .iter()
            .position(|c| c.primary_key)
            .expect("TableDef::new enforces exactly one primary key")
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Secondary-index definition
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub table_name: String,
    pub column: String,
    pub root_page: PageId,
}
