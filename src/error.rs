//! Error types for the bootstrap

use thiserror::Error;

/// Result type alias for bootstrap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Bootstrap errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("The bootstrap has been initialized already, you cannot initialize it again")]
    AlreadyInitialized,

    #[error("The bootstrap must be initialized first")]
    NotInitialized,

    #[error("The server name cannot be empty")]
    EmptyServerName,

    #[error("The server name '{0}' has been taken by another server")]
    DuplicateServerName(String),

    #[error("Failed to find input endpoint configuration {0}")]
    MissingEndpoint(String),

    #[error("Unknown server type: {0}")]
    UnknownServerType(String),

    #[error("Failed to setup server instance {0}")]
    SetupFailed(String),

    #[error("Failed to start server instance {0}")]
    StartFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
