// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for edgenode-reactor.
//!
//! Store and service errors share [`ReactorError`], which carries a stable
//! machine-readable code for each variant.

use thiserror::Error;

/// Result type using ReactorError
pub type Result<T> = std::result::Result<T, ReactorError>;

/// Errors raised by the instruction store and reactor services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReactorError {
    /// An instruction with the same (id, instructor) key already exists.
    #[error("Instruction {instruction_id} from instructor '{instructor_id}' already exists")]
    DuplicateInstruction {
        /// The instruction ID.
        instruction_id: i64,
        /// The issuing instructor.
        instructor_id: String,
    },

    /// Instruction was not found in the store.
    #[error("Instruction {instruction_id} from instructor '{instructor_id}' not found")]
    InstructionNotFound {
        /// The instruction ID.
        instruction_id: i64,
        /// The issuing instructor.
        instructor_id: String,
    },

    /// A stored or supplied instruction could not be interpreted.
    #[error("Invalid instruction field '{field}': {message}")]
    InvalidInstruction {
        /// The offending field.
        field: String,
        /// What was wrong with it.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReactorError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DuplicateInstruction { .. } => "DUPLICATE_INSTRUCTION",
            Self::InstructionNotFound { .. } => "INSTRUCTION_NOT_FOUND",
            Self::InvalidInstruction { .. } => "INVALID_INSTRUCTION",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Build an [`InvalidInstruction`](Self::InvalidInstruction) error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInstruction {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Map an insert failure, turning a unique-key violation into
    /// [`DuplicateInstruction`](Self::DuplicateInstruction).
    pub(crate) fn from_insert(err: sqlx::Error, instruction_id: i64, instructor_id: &str) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::DuplicateInstruction {
                    instruction_id,
                    instructor_id: instructor_id.to_string(),
                }
            }
            _ => Self::Database(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                ReactorError::DuplicateInstruction {
                    instruction_id: 1,
                    instructor_id: "test".to_string(),
                },
                "DUPLICATE_INSTRUCTION",
            ),
            (
                ReactorError::InstructionNotFound {
                    instruction_id: 1,
                    instructor_id: "test".to_string(),
                },
                "INSTRUCTION_NOT_FOUND",
            ),
            (
                ReactorError::invalid("state", "unknown state 'Foo'"),
                "INVALID_INSTRUCTION",
            ),
            (ReactorError::Database(sqlx::Error::RowNotFound), "DATABASE_ERROR"),
        ];

        for (err, expected_code) in test_cases {
            assert_eq!(err.error_code(), expected_code);
        }
    }

    #[test]
    fn test_error_display() {
        let err = ReactorError::DuplicateInstruction {
            instruction_id: 42,
            instructor_id: "fleet".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Instruction 42 from instructor 'fleet' already exists"
        );

        let err = ReactorError::invalid("state", "unknown state 'Foo'");
        assert_eq!(
            err.to_string(),
            "Invalid instruction field 'state': unknown state 'Foo'"
        );
    }

    #[test]
    fn test_from_insert_passes_through_other_errors() {
        let err = ReactorError::from_insert(sqlx::Error::RowNotFound, 1, "fleet");
        assert!(matches!(err, ReactorError::Database(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: ReactorError = json_err.into();
        assert_eq!(err.error_code(), "JSON_ERROR");
    }
}
