//! Cluster State Error Types

use thiserror::Error;

/// Result type alias for cluster state operations
pub type Result<T> = std::result::Result<T, Error>;

/// Cluster state error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error(
        "Configuration error: the {property} of this node [{local}] does not match the {property} \
         of the cluster [{cluster}]. This node cannot join the cluster, fix its configuration \
         before restarting it"
    )]
    IdentityMismatch {
        property: String,
        local: String,
        cluster: String,
    },

    // State errors
    #[error("State error: {0}")]
    State(String),

    // Substrate errors
    #[error("Substrate error: {0}")]
    Substrate(String),

    #[error("Substrate connection is not active")]
    SubstrateInactive,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is a fatal configuration problem the operator must fix
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ConfigParse(_) | Error::IdentityMismatch { .. }
        )
    }

    /// Check if this error comes from a substrate that went away underneath us
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::SubstrateInactive)
    }
}
