//! Tether configuration
//!
//! Loaded from an optional TOML file layered under `PTPIP_*` environment
//! variables. Every field has a default, so an empty source set is valid.

use crate::error::ConfigError;
use ptpip_protocol::{ConnectionConfig, PTPIP_DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Environment variable prefix, e.g. `PTPIP_PROBE_TIMEOUT_MS=1500`
pub const ENV_PREFIX: &str = "PTPIP";

/// mDNS service type advertised by PTP/IP cameras
pub const PTP_SERVICE_TYPE: &str = "_ptp._tcp.local.";

/// Tether configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// PTP/IP port on the camera
    pub port: u16,

    /// Host name announced in the Init Command Request
    pub host_name: String,

    /// Host GUID announced in the Init Command Request; random per manager when unset
    pub guid: Option<Uuid>,

    /// TCP connect timeout for the probe and both channels (milliseconds)
    pub probe_timeout_ms: u64,

    /// Deadline for each init acknowledgement (milliseconds)
    pub handshake_timeout_ms: u64,

    /// Pause between command and event channel setup (milliseconds)
    pub event_socket_delay_ms: u64,

    /// Per-read deadline while collecting an operation's replies (milliseconds)
    pub response_timeout_ms: u64,

    /// Deadline for the CloseSession response (milliseconds)
    pub close_session_timeout_ms: u64,

    /// Upper bound on an mDNS browse (milliseconds)
    pub discovery_timeout_ms: u64,

    pub mdns_service_type: String,

    /// Addresses probed when on a camera access point, after the detected gateway
    pub ap_probe_addresses: Vec<IpAddr>,

    /// SSID prefixes identifying camera access points
    pub camera_ssid_patterns: Vec<String>,

    /// Gateways treated as camera access points when the SSID is hidden
    pub camera_gateways: Vec<IpAddr>,

    /// Wait after Wi-Fi returns before the first reconnect (milliseconds)
    pub reconnect_settle_ms: u64,

    /// Wait between reconnect attempts while in ERROR (milliseconds)
    pub reconnect_retry_ms: u64,

    pub auto_reconnect: bool,

    /// Nikon DeviceReady polls before pairing is considered failed
    pub device_ready_attempts: u32,

    /// Pause between Nikon DeviceReady polls (milliseconds)
    pub device_ready_interval_ms: u64,

    /// Pause before re-establishing the connection for STA pairing (milliseconds)
    pub sta_retry_delay_ms: u64,

    /// Wi-Fi polling interval for the network monitor (milliseconds)
    pub wifi_poll_interval_ms: u64,
}

impl Default for TetherConfig {
    fn default() -> Self {
        let v4 = |a, b, c, d| IpAddr::V4(Ipv4Addr::new(a, b, c, d));
        Self {
            port: PTPIP_DEFAULT_PORT,
            host_name: "ptpip-tether".to_string(),
            guid: None,
            probe_timeout_ms: 2000,
            handshake_timeout_ms: 5000,
            event_socket_delay_ms: 200,
            response_timeout_ms: 5000,
            close_session_timeout_ms: 2000,
            discovery_timeout_ms: 10_000,
            mdns_service_type: PTP_SERVICE_TYPE.to_string(),
            ap_probe_addresses: vec![
                v4(192, 168, 1, 1),
                v4(192, 168, 0, 1),
                v4(192, 168, 0, 10),
                v4(192, 168, 54, 1),
                v4(10, 0, 0, 1),
            ],
            camera_ssid_patterns: [
                "Nikon_", "NIKON", "Z_", "EOS", "DIRECT-", "FUJIFILM-", "OLYMPUS-", "E-M",
                "LUMIX",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            camera_gateways: vec![v4(192, 168, 1, 1), v4(192, 168, 0, 1), v4(192, 168, 54, 1)],
            reconnect_settle_ms: 3000,
            reconnect_retry_ms: 5000,
            auto_reconnect: true,
            device_ready_attempts: 10,
            device_ready_interval_ms: 500,
            sta_retry_delay_ms: 1000,
            wifi_poll_interval_ms: 2000,
        }
    }
}

impl TetherConfig {
    /// Load from `path` (if given) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every connection attempt fail
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".to_string()));
        }
        if self.device_ready_attempts == 0 {
            return Err(ConfigError::Invalid(
                "device_ready_attempts must be at least 1".to_string(),
            ));
        }
        if self.host_name.is_empty() {
            return Err(ConfigError::Invalid("host_name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Timeouts and identity for the connection manager
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            event_socket_delay: Duration::from_millis(self.event_socket_delay_ms),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            close_session_timeout: Duration::from_millis(self.close_session_timeout_ms),
            host_name: self.host_name.clone(),
            guid: self.guid.map(|guid| *guid.as_bytes()),
        }
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn reconnect_settle(&self) -> Duration {
        Duration::from_millis(self.reconnect_settle_ms)
    }

    pub fn reconnect_retry(&self) -> Duration {
        Duration::from_millis(self.reconnect_retry_ms)
    }

    pub fn wifi_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wifi_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TetherConfig::default();
        assert_eq!(config.port, 15740);
        assert_eq!(config.discovery_timeout(), Duration::from_secs(10));
        assert_eq!(config.reconnect_settle(), Duration::from_secs(3));
        assert_eq!(config.reconnect_retry(), Duration::from_secs(5));
        assert!(config.auto_reconnect);
        assert!(config.camera_ssid_patterns.iter().any(|p| p == "Nikon_"));
    }

    #[test]
    fn test_connection_config_mapping() {
        let config = TetherConfig {
            probe_timeout_ms: 750,
            host_name: "studio".to_string(),
            ..Default::default()
        };
        let connection = config.connection();
        assert_eq!(connection.probe_timeout, Duration::from_millis(750));
        assert_eq!(connection.handshake_timeout, Duration::from_secs(5));
        assert_eq!(connection.host_name, "studio");
        assert!(connection.guid.is_none());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "port = 15741\nauto_reconnect = false\nap_probe_addresses = [\"192.168.4.1\"]"
        )
        .unwrap();

        let config = TetherConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.port, 15741);
        assert!(!config.auto_reconnect);
        assert_eq!(config.ap_probe_addresses, vec!["192.168.4.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.handshake_timeout_ms, 5000);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = TetherConfig::load(Some(Path::new("/nonexistent/ptpip.toml")));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_guid_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "guid = \"6f1c2f0e-8d4a-4b59-9a3e-0c5d7b1e2a44\"").unwrap();

        let config = TetherConfig::load(Some(file.path())).unwrap();
        let guid = config.connection().guid.unwrap();
        assert_eq!(guid[0], 0x6f);
        assert_eq!(guid[15], 0x44);
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = TetherConfig {
            port: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(TetherConfig::default().validate().is_ok());
    }
}
