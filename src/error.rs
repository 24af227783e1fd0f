//! Custom error types for the sensor node.
//!
//! This module defines the primary error type, `NodeError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure categories of an unattended
//! node: bus transport failures, frame integrity failures, filter numeric
//! failures, storage failures and flow-control protocol violations.
//!
//! None of these categories is fatal to the acquisition loop. Transport and
//! integrity failures are absorbed by the bus driver's retry ladder and
//! surface as invalid readings; numeric failures reset the affected filter
//! channel; storage failures fall back to creating a fresh log file; protocol
//! violations are logged and ignored.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type NodeResult<T> = std::result::Result<T, NodeError>;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration serialization error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bus transport failure: {0}")]
    Transport(String),

    #[error("Frame integrity failure: computed CRC {computed:#06x}, frame carried {received:#06x}")]
    Integrity { computed: u16, received: u16 },

    #[error("Device not ready after {0} exchange attempts")]
    NotReady(u32),

    #[error("Filter numeric failure: {0}")]
    Numeric(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Flow-control protocol violation: {0}")]
    Protocol(String),
}

impl NodeError {
    /// Whether the acquisition loop can keep running after this error.
    ///
    /// Configuration errors at startup are the only ones worth stopping for;
    /// everything else degrades to sentinel values.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, NodeError::Config(_) | NodeError::ConfigWrite(_))
    }
}
