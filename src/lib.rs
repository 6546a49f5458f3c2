//! pysqlite - a single-file embeddable relational database engine
//!
//! This library provides the core components of the engine:
//! - Paged storage with a rollback journal (pager, journal, free-list)
//! - Advisory file locking (shared / reserved / exclusive)
//! - B-Tree storage for tables and secondary indexes
//! - System catalog and row/key codecs
//! - SQL parsing (lexer, parser, AST)
//! - Query planning and pull-based execution
//! - Connection handling with statement transaction wrapping

pub mod catalog;
pub mod connection;
pub mod error;
pub mod executor;
pub mod locking;
pub mod sql;
pub mod storage;

pub use connection::Connection;
pub use error::{Error, Result};
pub use executor::QueryResult;
pub use storage::{Row, Value};
