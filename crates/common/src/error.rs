//! Common error types for the VRRP workspace.

use std::fmt;

/// A specialized Result type for VRRP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for VRRP operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Packet error: {0}")]
    Packet(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Netlink error: {0}")]
    Netlink(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new packet error.
    pub fn packet(msg: impl fmt::Display) -> Self {
        Error::Packet(msg.to_string())
    }

    /// Create a new network error.
    pub fn network(msg: impl fmt::Display) -> Self {
        Error::Network(msg.to_string())
    }

    /// Create a new netlink error.
    pub fn netlink(msg: impl fmt::Display) -> Self {
        Error::Netlink(msg.to_string())
    }

    /// Create a new generic error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}
