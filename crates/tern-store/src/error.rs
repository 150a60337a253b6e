//! Error types for tern-store

use std::io;
use thiserror::Error;

/// Result type for tern-store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on a storage node
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Index (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File not found in the local index
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Invalid request
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
