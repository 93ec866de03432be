//! Network State Monitor
//!
//! Turns raw Wi-Fi observations into [`NetworkState`] and publishes each
//! change on a watch channel. The OS side is behind [`WifiProbe`].

use crate::config::TetherConfig;
use crate::state::NetworkState;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// SSID reported by Android-style APIs when location access is missing
const UNKNOWN_SSID: &str = "<unknown ssid>";

/// Raw Wi-Fi observation from the host OS
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WifiSnapshot {
    pub connected: bool,
    pub ssid: Option<String>,
    pub gateway: Option<IpAddr>,
}

/// Source of Wi-Fi observations
///
/// `snapshot` may block; the polling task calls it on the blocking pool.
pub trait WifiProbe: Send + Sync + 'static {
    fn snapshot(&self) -> io::Result<WifiSnapshot>;
}

/// Publishes normalised network state
pub struct NetworkMonitor {
    tx: watch::Sender<NetworkState>,
    ssid_patterns: Vec<String>,
    camera_gateways: Vec<IpAddr>,
}

impl NetworkMonitor {
    pub fn new(config: &TetherConfig) -> Self {
        let (tx, _rx) = watch::channel(NetworkState::default());
        Self {
            tx,
            ssid_patterns: config
                .camera_ssid_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            camera_gateways: config.camera_gateways.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> NetworkState {
        self.tx.borrow().clone()
    }

    /// Normalise and publish a snapshot; returns whether the state changed
    pub fn update(&self, snapshot: WifiSnapshot) -> bool {
        let next = self.normalize(&snapshot);
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(
                "Network changed: wifi={} camera_ap={} ssid={:?} camera_ip={:?}",
                next.is_wifi_connected,
                next.is_connected_to_camera_ap,
                next.ssid,
                next.detected_camera_ip
            );
            *current = next;
            true
        })
    }

    /// Map a raw snapshot to [`NetworkState`]
    pub fn normalize(&self, snapshot: &WifiSnapshot) -> NetworkState {
        if !snapshot.connected {
            return NetworkState::default();
        }

        let ssid = snapshot.ssid.as_deref().and_then(clean_ssid);
        let on_camera_ap = match &ssid {
            Some(ssid) => self.is_camera_ssid(ssid),
            // hidden SSID: fall back to the gateway address
            None => snapshot
                .gateway
                .is_some_and(|gateway| self.camera_gateways.contains(&gateway)),
        };

        NetworkState {
            is_wifi_connected: true,
            is_connected_to_camera_ap: on_camera_ap,
            detected_camera_ip: if on_camera_ap { snapshot.gateway } else { None },
            ssid,
        }
    }

    /// Case-insensitive prefix match against the configured camera SSID patterns
    pub fn is_camera_ssid(&self, ssid: &str) -> bool {
        let ssid = ssid.to_lowercase();
        self.ssid_patterns
            .iter()
            .any(|pattern| ssid.starts_with(pattern.as_str()))
    }

    /// Poll `probe` every `interval` and publish changes until the task is aborted
    pub fn spawn_polling<P: WifiProbe>(
        self: Arc<Self>,
        probe: P,
        interval: Duration,
    ) -> JoinHandle<()> {
        let probe = Arc::new(probe);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let probe = Arc::clone(&probe);
                match tokio::task::spawn_blocking(move || probe.snapshot()).await {
                    Ok(Ok(snapshot)) => {
                        self.update(snapshot);
                    }
                    Ok(Err(e)) => debug!("Wi-Fi probe failed: {}", e),
                    Err(e) => warn!("Wi-Fi probe task failed: {}", e),
                }
            }
        })
    }
}

/// Strip quoting and discard placeholder SSIDs
fn clean_ssid(raw: &str) -> Option<String> {
    let ssid = raw.trim().trim_matches('"');
    if ssid.is_empty() || ssid.eq_ignore_ascii_case(UNKNOWN_SSID) {
        None
    } else {
        Some(ssid.to_string())
    }
}

/// Wi-Fi probe for Linux hosts
///
/// Reads wireless interfaces from `/proc/net/wireless`, the default gateway
/// from `/proc/net/route` and the SSID from `iwgetid -r`.
#[derive(Debug, Clone)]
pub struct LinuxWifiProbe {
    proc_net: PathBuf,
}

impl Default for LinuxWifiProbe {
    fn default() -> Self {
        Self {
            proc_net: PathBuf::from("/proc/net"),
        }
    }
}

impl LinuxWifiProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_ssid(&self) -> Option<String> {
        let output = Command::new("iwgetid").arg("-r").output().ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl WifiProbe for LinuxWifiProbe {
    fn snapshot(&self) -> io::Result<WifiSnapshot> {
        let wireless = std::fs::read_to_string(self.proc_net.join("wireless"))?;
        let interfaces = parse_wireless_interfaces(&wireless);
        if interfaces.is_empty() {
            return Ok(WifiSnapshot::default());
        }

        let routes = std::fs::read_to_string(self.proc_net.join("route"))?;
        let Some(gateway) = parse_default_gateway(&routes, &interfaces) else {
            return Ok(WifiSnapshot::default());
        };

        Ok(WifiSnapshot {
            connected: true,
            ssid: self.read_ssid(),
            gateway: Some(IpAddr::V4(gateway)),
        })
    }
}

/// Interface names listed in `/proc/net/wireless`
fn parse_wireless_interfaces(contents: &str) -> Vec<String> {
    contents
        .lines()
        .skip(2)
        .filter_map(|line| line.split_once(':'))
        .map(|(name, _)| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Default-route gateway on one of `interfaces`, from `/proc/net/route`
fn parse_default_gateway(contents: &str, interfaces: &[String]) -> Option<Ipv4Addr> {
    contents.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (iface, destination, gateway) = (fields.first()?, fields.get(1)?, fields.get(2)?);
        if *destination != "00000000" || !interfaces.iter().any(|i| i == iface) {
            return None;
        }
        // kernel prints the address in host byte order
        let raw = u32::from_str_radix(gateway, 16).ok()?;
        Some(Ipv4Addr::from(raw.to_le_bytes()))
    })
}
