//! Connection and network state types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Public connection state of the session orchestrator
///
/// ```text
/// DISCONNECTED -> CONNECTING -> CONNECTED
///                      |            |
///                      v            v
///                    ERROR     DISCONNECTED (disconnect or Wi-Fi loss)
///                      |
///                      v
///                 CONNECTING (reconnect) / DISCONNECTED (disconnect)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Network topology the camera was reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionMode {
    /// Host joined the camera's own access point
    ApMode,
    /// Camera and host share an infrastructure network
    StaMode,
    #[default]
    Unknown,
}

/// Snapshot published by the network state monitor
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkState {
    pub is_wifi_connected: bool,
    pub is_connected_to_camera_ap: bool,
    pub ssid: Option<String>,
    /// Camera address inferred from the AP gateway
    pub detected_camera_ip: Option<IpAddr>,
}

impl NetworkState {
    /// Wi-Fi up on an ordinary (non-camera) network
    pub fn station(ssid: &str) -> Self {
        Self {
            is_wifi_connected: true,
            is_connected_to_camera_ap: false,
            ssid: Some(ssid.to_string()),
            detected_camera_ip: None,
        }
    }

    /// Wi-Fi up on a camera access point whose gateway is `camera_ip`
    pub fn camera_ap(ssid: &str, camera_ip: IpAddr) -> Self {
        Self {
            is_wifi_connected: true,
            is_connected_to_camera_ap: true,
            ssid: Some(ssid.to_string()),
            detected_camera_ip: Some(camera_ip),
        }
    }
}
