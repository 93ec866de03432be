//! PTP/IP Protocol Implementation
//!
//! This crate provides the transport layer for tethering Wi-Fi cameras over
//! PTP/IP: packet encoding, resilient device-info parsing, and a connection
//! manager that owns the command/event socket pair.

mod camera;
mod codec;
mod connection;
mod device_info;
mod error;
mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use camera::{Camera, PTPIP_DEFAULT_PORT};
pub use codec::{
    Frame, InitCommandAck, InitCommandRequest, InitEventRequest, OperationRequest,
    OperationResponse, PacketType, TransactionCounter, PROTOCOL_VERSION,
};
pub use connection::{probe_camera, ConnectionConfig, ConnectionManager};
pub use device_info::{parse_device_info, scan_strings, CameraInfo, ParseOutcome, UNKNOWN};
pub use error::PtpIpError;
pub use transport::{Connector, TcpConnector};

/// Standard PTP operation codes
pub mod opcode {
    /// Get device info (no session required)
    pub const GET_DEVICE_INFO: u16 = 0x1001;
    /// Open session, always sent with transaction id 0
    pub const OPEN_SESSION: u16 = 0x1002;
    /// Close session
    pub const CLOSE_SESSION: u16 = 0x1003;
    /// Initiate capture
    pub const INITIATE_CAPTURE: u16 = 0x100E;
}

/// Nikon vendor operation codes
///
/// Nikon reserves 0x9006..=0x9504; values are kept exactly as the camera expects them.
pub mod nikon {
    pub const OPCODE_FIRST: u16 = 0x9006;
    pub const OPCODE_LAST: u16 = 0x9504;

    pub const GET_PROFILE_ALL_DATA: u16 = 0x9006;
    pub const SEND_PROFILE_DATA: u16 = 0x9007;
    pub const DELETE_PROFILE: u16 = 0x9008;
    pub const SET_PROFILE_DATA: u16 = 0x9009;
    pub const INITIATE_CAPTURE_REC_IN_SDRAM: u16 = 0x90C0;
    pub const AF_DRIVE: u16 = 0x90C1;
    pub const CHANGE_CAMERA_MODE: u16 = 0x90C2;
    pub const GET_EVENT: u16 = 0x90C7;
    /// Polled until the camera reports ready; answers busy while a pairing prompt is shown
    pub const DEVICE_READY: u16 = 0x90C8;
    pub const GET_VENDOR_PROP_CODES: u16 = 0x90CA;
    pub const START_LIVE_VIEW: u16 = 0x9201;
    pub const END_LIVE_VIEW: u16 = 0x9202;

    /// Check if an opcode falls in the Nikon vendor range
    pub fn is_vendor_opcode(opcode: u16) -> bool {
        (OPCODE_FIRST..=OPCODE_LAST).contains(&opcode)
    }
}

/// Standard PTP response codes
pub mod response {
    pub const OK: u16 = 0x2001;
    pub const GENERAL_ERROR: u16 = 0x2002;
    pub const SESSION_NOT_OPEN: u16 = 0x2003;
    pub const OPERATION_NOT_SUPPORTED: u16 = 0x2005;
    pub const ACCESS_DENIED: u16 = 0x200F;
    pub const DEVICE_BUSY: u16 = 0x2019;
    pub const SESSION_ALREADY_OPEN: u16 = 0x201E;
}
