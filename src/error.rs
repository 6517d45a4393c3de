//! Error types for mapgres
//!
//! This module defines the error hierarchy used throughout the crate.
//! We use `thiserror` for library-style errors with clear error chains.

use std::io;

/// Main error type for the mapgres crate
#[derive(Debug, thiserror::Error)]
pub enum MapgresError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Database operation errors
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Failed to establish connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected to a database
    #[error("Not connected to database")]
    NotConnected,

    /// Statement preparation failed
    #[error("Statement preparation failed: {0}")]
    PrepareFailed(String),

    /// Query execution failed
    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    /// Bound value count does not match the column list
    #[error("Expected {expected} bound values, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    /// LISTEN subscription on the notification channel failed
    #[error("LISTEN subscription failed: {0}")]
    SubscribeFailed(String),
}

/// Configuration loading/parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Home directory not found
    #[error("Could not determine home directory")]
    NoHomeDir,

    /// Config file not found
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to parse TOML
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Connection profile not found
    #[error("Connection profile '{0}' not found")]
    ProfileNotFound(String),
}

/// Specialized Result type for mapgres operations
pub type Result<T> = std::result::Result<T, MapgresError>;

/// Specialized Result type for database operations
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Specialized Result type for config operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
