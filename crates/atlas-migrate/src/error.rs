//! Error types for the migration library.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (unusable connection settings, bad flag values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Snapshot file exists but cannot be read or has the wrong shape
    #[error("Snapshot error in {path}: {message}")]
    Snapshot { path: PathBuf, message: String },

    /// A mandatory enumerated value could not be canonicalized
    #[error("Validation error: {0}")]
    Validation(String),

    /// A required table or column is absent from the destination
    #[error("Schema mismatch on {table}: {message}")]
    SchemaMismatch { table: String, message: String },

    /// Database connection or statement error
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (report output)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Create a Snapshot error for a specific input file.
    pub fn snapshot(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        MigrateError::Snapshot {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a SchemaMismatch error for a specific table.
    pub fn schema_mismatch(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::SchemaMismatch {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }

    /// Stable process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) => 2,
            MigrateError::Snapshot { .. } => 3,
            MigrateError::Validation(_) => 4,
            MigrateError::SchemaMismatch { .. } => 5,
            MigrateError::Db(_) => 6,
            MigrateError::Io(_) => 7,
            MigrateError::Json(_) => 1,
        }
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
