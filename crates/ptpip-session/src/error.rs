//! Session Error Types

use ptpip_protocol::PtpIpError;
use thiserror::Error;

/// Errors raised while orchestrating a camera session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Wi-Fi is not connected")]
    WifiUnavailable,

    #[error(transparent)]
    Protocol(#[from] PtpIpError),

    /// A call into the native capture library panicked or could not be scheduled
    #[error("Native capture bridge failed: {0}")]
    NativeBridge(String),

    #[error("Connection attempt cancelled")]
    Cancelled,

    /// The caller dropped its `connect` future before the attempt finished
    #[error("Connection attempt abandoned by caller")]
    Abandoned,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
