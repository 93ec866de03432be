//! Camera Endpoint

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Default PTP/IP TCP port
pub const PTPIP_DEFAULT_PORT: u16 = 15740;

/// A camera endpoint produced by discovery
///
/// Only IP and port identify a camera; on access-point topologies the IP can
/// change between discovery and connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Camera {
    pub ip_address: IpAddr,
    pub port: u16,
    pub display_name: String,
    pub is_online: bool,
}

impl Camera {
    /// Create an online camera on the default PTP/IP port
    pub fn new(ip_address: IpAddr, display_name: &str) -> Self {
        Self {
            ip_address,
            port: PTPIP_DEFAULT_PORT,
            display_name: display_name.to_string(),
            is_online: true,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_address, self.port)
    }

    /// Same camera at a new address
    pub fn with_ip(&self, ip_address: IpAddr) -> Self {
        Self {
            ip_address,
            ..self.clone()
        }
    }
}

impl fmt::Display for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.socket_addr())
    }
}
