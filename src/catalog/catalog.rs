//! System catalog
//!
//! The catalog is itself a table: the reserved `__schema__` tree, whose root
//! page is pinned in the meta page. Each row describes one object:
//! `(object_type ∈ {table, index}, name, parent_table, root_page,
//! schema_text)`, keyed by name. Booting the catalog is an ordinary table
//! scan; DDL inserts catalog rows and bumps the schema counter, so it
//! participates in journaled transactions like any other write.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::schema::{Column, IndexDef, TableDef};
use crate::error::{Error, Result};
use crate::storage::btree::BTree;
use crate::storage::pager::Pager;
use crate::storage::record::{decode_row, encode_key, encode_row, Value};

/// Name of the reserved bootstrap table
pub const CATALOG_TABLE: &str = "__schema__";

const OBJECT_TABLE: &str = "table";
const OBJECT_INDEX: &str = "index";

/// schema_text document for a table row
#[derive(Serialize, Deserialize)]
struct TableSchemaText {
    id: u32,
    columns: Vec<Column>,
}

/// In-memory schema dictionary, rebuilt from the catalog tree on open and
/// whenever the schema counter changes.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: HashMap<String, TableDef>,
    indexes: HashMap<String, IndexDef>,
    /// Schema counter observed when this catalog was loaded
    pub loaded_counter: u32,
}

impl Catalog {
    /// Scan the catalog tree into the in-memory dictionary.
    pub fn load(pager: &mut Pager) -> Result<Catalog> {
        let tree = BTree::table(pager.meta().catalog_root);
        let loaded_counter = pager.meta().schema_counter;
        let mut tables = HashMap::new();
        let mut indexes = HashMap::new();

        for (_, payload) in tree.scan_all(pager)? {
            let row = decode_row(&payload)?;
            let (object_type, name, parent, root_page, schema_text) = destructure_row(&row)?;
            match object_type {
                OBJECT_TABLE => {
                    let text: TableSchemaText = serde_json::from_str(schema_text)
                        .map_err(|e| Error::Corrupt(format!("bad table schema_text: {}", e)))?;
                    let def = TableDef::new(name, text.id, root_page, text.columns)?;
                    tables.insert(def.name.clone(), def);
                }
                OBJECT_INDEX => {
                    let parent = parent.ok_or_else(|| {
                        Error::Corrupt(format!("index '{}' has no parent table", name))
                    })?;
                    indexes.insert(
                        name.to_string(),
                        IndexDef {
                            name: name.to_string(),
                            table_name: parent.to_string(),
                            column: schema_text.to_string(),
                            root_page,
                        },
                    );
                }
                other => {
                    return Err(Error::Corrupt(format!(
                        "unknown catalog object type '{}'",
                        other
                    )));
                }
            }
        }

        Ok(Catalog {
            tables,
            indexes,
            loaded_counter,
        })
    }

    pub fn get_table(&self, name: &str) -> Result<&TableDef> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    pub fn get_index(&self, name: &str) -> Result<&IndexDef> {
        self.indexes
            .get(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }

    /// All indexes on a table.
    pub fn indexes_for_table(&self, table_name: &str) -> Vec<&IndexDef> {
        let mut defs: Vec<&IndexDef> = self
            .indexes
            .values()
            .filter(|idx| idx.table_name == table_name)
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// User table names in sorted order.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Create a table: allocate its root, insert the catalog row, bump the
    /// schema counter. The caller must be inside a write transaction.
    pub fn create_table(
        &mut self,
        pager: &mut Pager,
        name: &str,
        columns: Vec<Column>,
    ) -> Result<&TableDef> {
        if name == CATALOG_TABLE {
            return Err(Error::Schema(format!("'{}' is a reserved name", name)));
        }
        if self.tables.contains_key(name) {
            return Err(Error::TableAlreadyExists(name.to_string()));
        }
        if self.indexes.contains_key(name) {
            return Err(Error::Schema(format!(
                "an index named '{}' already exists",
                name
            )));
        }

        let id = self.next_table_id();
        let root_page = BTree::create(pager, false)?;
        let def = TableDef::new(name, id, root_page, columns)?;

        let schema_text = serde_json::to_string(&TableSchemaText {
            id,
            columns: def.columns.clone(),
        })
        .map_err(|e| Error::Internal(format!("schema serialization failed: {}", e)))?;
        self.insert_object_row(pager, OBJECT_TABLE, name, None, root_page, &schema_text)?;

        pager.bump_schema_counter()?;
        self.loaded_counter = pager.meta().schema_counter;
        self.tables.insert(name.to_string(), def);
        log::info!("created table '{}' (root page {})", name, root_page);
        Ok(&self.tables[name])
    }

    /// Create a secondary index on one column. The caller backfills it.
    pub fn create_index(
        &mut self,
        pager: &mut Pager,
        name: &str,
        table_name: &str,
        column: &str,
    ) -> Result<&IndexDef> {
        if self.indexes.contains_key(name) {
            return Err(Error::IndexAlreadyExists(name.to_string()));
        }
        if self.tables.contains_key(name) {
            return Err(Error::Schema(format!(
                "a table named '{}' already exists",
                name
            )));
        }
        let table = self.get_table(table_name)?;
        if table.column_index(column).is_none() {
            return Err(Error::ColumnNotFound(column.to_string()));
        }

        let root_page = BTree::create(pager, true)?;
        self.insert_object_row(
            pager,
            OBJECT_INDEX,
            name,
            Some(table_name),
            root_page,
            column,
        )?;

        pager.bump_schema_counter()?;
        self.loaded_counter = pager.meta().schema_counter;
        self.indexes.insert(
            name.to_string(),
            IndexDef {
                name: name.to_string(),
                table_name: table_name.to_string(),
                column: column.to_string(),
                root_page,
            },
        );
        log::info!(
            "created index '{}' on {}({}) (root page {})",
            name,
            table_name,
            column,
            root_page
        );
        Ok(&self.indexes[name])
    }

    fn insert_object_row(
        &self,
        pager: &mut Pager,
        object_type: &str,
        name: &str,
        parent: Option<&str>,
        root_page: u32,
        schema_text: &str,
    ) -> Result<()> {
        let row = vec![
            Value::Str(object_type.to_string()),
            Value::Str(name.to_string()),
            parent.map(|p| Value::Str(p.to_string())).unwrap_or(Value::Null),
            Value::Int(root_page as i64),
            Value::Str(schema_text.to_string()),
        ];
        let key = encode_key(&[Value::Str(name.to_string())])?;
        let tree = BTree::table(pager.meta().catalog_root);
        tree.insert(pager, &key, &encode_row(&row)?)
            .map_err(|e| match e {
                Error::Constraint(_) => {
                    Error::Schema(format!("object '{}' already exists", name))
                }
                other => other,
            })
    }

    fn next_table_id(&self) -> u32 {
        self.tables.values().map(|t| t.id).max().unwrap_or(0) + 1
    }
}

fn destructure_row(row: &[Value]) -> Result<(&str, &str, Option<&str>, u32, &str)> {
    let bad = || Error::Corrupt("malformed catalog row".to_string());
    if row.len() != 5 {
        return Err(bad());
    }
    let object_type = match &row[0] {
        Value::Str(s) => s.as_str(),
        _ => return Err(bad()),
    };
    let name = match &row[1] {
        Value::Str(s) => s.as_str(),
        _ => return Err(bad()),
    };
    let parent = match &row[2] {
        Value::Str(s) => Some(s.as_str()),
        Value::Null => None,
        _ => return Err(bad()),
    };
    let root_page = match &row[3] {
        Value::Int(i) if *i > 0 => *i as u32,
        _ => return Err(bad()),
    };
    let schema_text = match &row[4] {
        Value::Str(s) => s.as_str(),
        _ => return Err(bad()),
    };
    Ok((object_type, name, parent, root_page, schema_text))
}
