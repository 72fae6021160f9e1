//! Error types for the device mesh

use thiserror::Error;

/// Result type alias for mesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the device mesh
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Coordination service operation failed
    #[error("coordination error: {0}")]
    Coordination(String),

    /// Coordination service rejected our credentials
    #[error("coordination authentication failed")]
    AuthFailed,

    /// Operation attempted without a live coordination session
    #[error("not connected to coordination service")]
    NotConnected,

    /// Node does not exist
    #[error("no node: {0}")]
    NoNode(String),

    /// Node already exists
    #[error("node exists: {0}")]
    NodeExists(String),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// No online instance of the named service
    #[error("no online instance of service: {0}")]
    ServiceUnavailable(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Numeric error id used in fleet logs
    #[must_use]
    pub const fn error_id(&self) -> u32 {
        match self {
            Self::AuthFailed | Self::NotConnected => 202_001,
            Self::Coordination(_) | Self::NoNode(_) => 202_002,
            Self::NodeExists(_) => 202_004,
            Self::Transport(_) => 201_002,
            _ => 200_000,
        }
    }
}
