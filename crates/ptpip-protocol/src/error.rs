//! PTP/IP Error Types

use thiserror::Error;

/// Errors that can occur during PTP/IP communication
#[derive(Debug, Error)]
pub enum PtpIpError {
    /// Camera port did not accept a TCP connection
    #[error("Camera unreachable at {0}")]
    Unreachable(String),

    /// No acknowledgement arrived before the handshake deadline
    #[error("Handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    /// A packet of an unexpected type arrived
    #[error("Protocol mismatch: expected packet type {expected}, got {actual}")]
    ProtocolMismatch { expected: u32, actual: u32 },

    /// Operation produced no final response before the read deadline
    #[error("No response to operation {0:#06X}")]
    NoResponse(u16),

    /// Camera answered the init request with InitFail
    #[error("Camera rejected connection (reason {0:#010X})")]
    InitRejected(u32),

    /// Operation completed with a non-OK PTP response code
    #[error("Operation {opcode:#06X} failed with response code {code:#06X}")]
    ResponseCode { opcode: u16, code: u16 },

    /// Vendor authentication handshake was rejected
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// No command/event socket pair is open
    #[error("Not connected to a camera")]
    NotConnected,

    /// Frame or payload could not be decoded
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// Underlying socket error
    #[error("Socket error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PtpIpError {
    fn from(err: std::io::Error) -> Self {
        PtpIpError::Io(err.to_string())
    }
}
