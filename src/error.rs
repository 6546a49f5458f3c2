//! Error types for the engine
//!
//! This module defines all error types used throughout the database engine.
//! Errors are returned, not raised: every operator and pager call has an
//! explicit failure channel.

use thiserror::Error;

/// The main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // ========== Lexer Errors ==========
    #[error("Syntax error: unexpected character '{0}' at position {1}")]
    UnexpectedCharacter(char, usize),

    #[error("Syntax error: unterminated string literal starting at position {0}")]
    UnterminatedString(usize),

    #[error("Syntax error: invalid number at position {0}")]
    InvalidNumber(usize),

    // ========== Parser Errors ==========
    #[error("Syntax error: unexpected token '{found}', expected {expected}")]
    UnexpectedToken { expected: String, found: String },

    #[error("Syntax error: {0}")]
    Syntax(String),

    // ========== Schema Errors ==========
    #[error("Schema error: table '{0}' not found")]
    TableNotFound(String),

    #[error("Schema error: table '{0}' already exists")]
    TableAlreadyExists(String),

    #[error("Schema error: column '{0}' not found")]
    ColumnNotFound(String),

    #[error("Schema error: index '{0}' not found")]
    IndexNotFound(String),

    #[error("Schema error: index '{0}' already exists")]
    IndexAlreadyExists(String),

    #[error("Schema error: {0}")]
    Schema(String),

    // ========== Constraint Errors ==========
    #[error("Constraint violation: duplicate primary key in table '{0}'")]
    DuplicateKey(String),

    #[error("Constraint violation: null value in non-nullable column '{0}'")]
    NullViolation(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    // ========== Type Errors ==========
    #[error("Type error: cannot compare {0} with {1}")]
    TypeMismatch(&'static str, &'static str),

    #[error("Type error: {0}")]
    Type(String),

    // ========== Locking Errors ==========
    #[error("Database is busy: lock acquisition timed out")]
    Busy,

    // ========== I/O Errors ==========
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ========== Corruption Errors ==========
    #[error("Corruption detected: {0}")]
    Corrupt(String),

    // ========== Internal Errors ==========
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the failed operation.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy)
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::TableNotFound("users".to_string());
        assert_eq!(err.to_string(), "Schema error: table 'users' not found");

        let err = Error::UnexpectedCharacter('@', 5);
        assert_eq!(
            err.to_string(),
            "Syntax error: unexpected character '@' at position 5"
        );

        assert!(Error::Busy.is_busy());
        assert!(!Error::TableNotFound("t".into()).is_busy());
    }
}
