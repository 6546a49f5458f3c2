//! System catalog
//!
//! Metadata about tables, their column schemas, and their indexes, stored as
//! rows of the reserved `__schema__` table.

pub mod catalog;
pub mod schema;

pub use catalog::{Catalog, CATALOG_TABLE};
pub use schema::{Column, DataType, IndexDef, TableDef};
