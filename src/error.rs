//! Error types for AtlasDB
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Unified error type for AtlasDB operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    /// Bad magic, version or geometry on open
    #[error("Format error: {0}")]
    Format(String),

    /// Missing block, key or row
    #[error("Not found: {0}")]
    NotFound(String),

    /// Free-list or continuation pointer inconsistency
    #[error("Corrupt block chain: {0}")]
    CorruptChain(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    // -------------------------------------------------------------------------
    // Table Errors
    // -------------------------------------------------------------------------
    /// Unique-constraint violation on the primary index; carries the existing rowid
    #[error("Duplicate key (existing rowid {0})")]
    DuplicateKey(u64),

    #[error("Transaction error: {0}")]
    Transaction(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for AtlasError {
    fn from(e: bincode::Error) -> Self {
        AtlasError::Serialization(e.to_string())
    }
}

impl AtlasError {
    /// True for the `NotFound` variant
    pub fn is_not_found(&self) -> bool {
        matches!(self, AtlasError::NotFound(_))
    }
}
