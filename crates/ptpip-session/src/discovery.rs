//! Discovery Service
//!
//! On a camera access point the camera is the gateway (or one of a few
//! well-known addresses), so candidates are probed directly and only kept if
//! they answer a PTP/IP Init Command Request. On a shared network cameras are
//! found through mDNS.

use crate::config::TetherConfig;
use crate::state::NetworkState;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use ptpip_protocol::{probe_camera, Camera, Connector};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Slack allowed past the browse deadline before the caller stops waiting
const BROWSE_GRACE: Duration = Duration::from_millis(500);

/// Blocking service browser
pub trait ServiceBrowser: Send + Sync + 'static {
    /// Browse `service_type` for at most `timeout`
    fn browse(&self, service_type: &str, timeout: Duration) -> Vec<Camera>;
}

/// DNS-SD browser over multicast DNS
#[derive(Debug, Clone, Copy, Default)]
pub struct MdnsBrowser;

impl ServiceBrowser for MdnsBrowser {
    fn browse(&self, service_type: &str, timeout: Duration) -> Vec<Camera> {
        let daemon = match ServiceDaemon::new() {
            Ok(d) => d,
            Err(e) => {
                warn!("Failed to create mDNS daemon: {}", e);
                return Vec::new();
            }
        };
        let receiver = match daemon.browse(service_type) {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to start mDNS browse: {}", e);
                let _ = daemon.shutdown();
                return Vec::new();
            }
        };

        let deadline = Instant::now() + timeout;
        let mut cameras = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match receiver.recv_timeout(remaining) {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let addresses = info.get_addresses().iter().map(|scoped| scoped.to_ip_addr());
                    let Some(ip) = preferred_address(addresses) else {
                        continue;
                    };
                    let name = instance_name(info.get_fullname());
                    debug!("mDNS resolved {} at {}:{}", name, ip, info.get_port());
                    merge_camera(&mut cameras, Camera::new(ip, &name).with_port(info.get_port()));
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        let _ = daemon.stop_browse(service_type);
        let _ = daemon.shutdown();
        cameras
    }
}

/// First IPv4 address, else the first IPv6 one
fn preferred_address(addresses: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    let mut ipv6_fallback = None;
    for ip in addresses {
        match ip {
            IpAddr::V4(_) => return Some(ip),
            IpAddr::V6(_) if ipv6_fallback.is_none() => ipv6_fallback = Some(ip),
            _ => {}
        }
    }
    ipv6_fallback
}

/// Instance label of a DNS-SD full name, e.g. `Z 6_2._ptp._tcp.local.` -> `Z 6_2`
fn instance_name(fullname: &str) -> String {
    let instance = fullname.split("._").next().unwrap_or(fullname);
    instance.replace("\\.", ".")
}

/// Add `camera` unless an entry with the same address and port exists
fn merge_camera(cameras: &mut Vec<Camera>, camera: Camera) {
    if !cameras.iter().any(|c| c.socket_addr() == camera.socket_addr()) {
        cameras.push(camera);
    }
}

/// Finds reachable cameras for the current network topology
pub struct DiscoveryService<C: Connector> {
    connector: C,
    browser: Arc<dyn ServiceBrowser>,
    guid: [u8; 16],
    host_name: String,
    port: u16,
    probe_timeout: Duration,
    discovery_timeout: Duration,
    service_type: String,
    ap_probe_addresses: Vec<IpAddr>,
}

impl<C: Connector + Clone> DiscoveryService<C> {
    pub fn new(connector: C, browser: Arc<dyn ServiceBrowser>, config: &TetherConfig) -> Self {
        let guid = config.guid.unwrap_or_else(uuid::Uuid::new_v4);
        Self {
            connector,
            browser,
            guid: *guid.as_bytes(),
            host_name: config.host_name.clone(),
            port: config.port,
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            discovery_timeout: config.discovery_timeout(),
            service_type: config.mdns_service_type.clone(),
            ap_probe_addresses: config.ap_probe_addresses.clone(),
        }
    }

    /// Cameras reachable on the current network; empty on any failure
    pub async fn discover(&self, network: &NetworkState) -> Vec<Camera> {
        if !network.is_wifi_connected {
            info!("Wi-Fi not connected, skipping discovery");
            return Vec::new();
        }
        if network.is_connected_to_camera_ap {
            self.probe_access_point(network).await.into_iter().collect()
        } else {
            self.browse_network().await
        }
    }

    /// First AP candidate in priority order that answers the PTP/IP handshake
    ///
    /// Candidates are the detected gateway followed by the configured
    /// addresses. All are probed concurrently; a candidate that accepts TCP
    /// but rejects or ignores the Init Command Request does not count.
    pub async fn probe_access_point(&self, network: &NetworkState) -> Option<Camera> {
        let mut candidates: Vec<IpAddr> = network.detected_camera_ip.into_iter().collect();
        for ip in &self.ap_probe_addresses {
            if !candidates.contains(ip) {
                candidates.push(*ip);
            }
        }

        let mut probes = JoinSet::new();
        for (rank, ip) in candidates.iter().enumerate() {
            let connector = self.connector.clone();
            let addr = SocketAddr::new(*ip, self.port);
            let timeout = self.probe_timeout;
            let guid = self.guid;
            let host_name = self.host_name.clone();
            probes.spawn(async move {
                let answered = match probe_camera(&connector, addr, guid, &host_name, timeout).await {
                    Ok(ack) => {
                        debug!("{} answered as {:?}", addr, ack.camera_name);
                        true
                    }
                    Err(e) => {
                        debug!("{} is not a camera: {}", addr, e);
                        false
                    }
                };
                (rank, answered)
            });
        }

        let mut outcomes: Vec<Option<bool>> = vec![None; candidates.len()];
        while let Some(joined) = probes.join_next().await {
            let Ok((rank, reachable)) = joined else {
                continue;
            };
            outcomes[rank] = Some(reachable);

            // settled once every higher-priority candidate has answered
            for (best, outcome) in outcomes.iter().enumerate() {
                match outcome {
                    None => break,
                    Some(false) => continue,
                    Some(true) => return Some(self.ap_camera(candidates[best], network)),
                }
            }
        }

        // a panicked probe leaves its slot undecided
        if let Some(best) = outcomes.iter().position(|outcome| *outcome == Some(true)) {
            return Some(self.ap_camera(candidates[best], network));
        }
        info!("No camera answered on the access point");
        None
    }

    fn ap_camera(&self, ip: IpAddr, network: &NetworkState) -> Camera {
        let name = network.ssid.as_deref().unwrap_or("Camera AP");
        info!("Camera found on access point at {}", ip);
        Camera::new(ip, name).with_port(self.port)
    }

    /// Browse for PTP/IP services, bounded by the discovery timeout
    pub async fn browse_network(&self) -> Vec<Camera> {
        let browser = Arc::clone(&self.browser);
        let service_type = self.service_type.clone();
        let timeout = self.discovery_timeout;
        let browse = tokio::task::spawn_blocking(move || browser.browse(&service_type, timeout));

        match tokio::time::timeout(timeout + BROWSE_GRACE, browse).await {
            Ok(Ok(cameras)) => {
                info!("mDNS discovery found {} camera(s)", cameras.len());
                cameras
            }
            Ok(Err(e)) => {
                warn!("mDNS browse task failed: {}", e);
                Vec::new()
            }
            Err(_) => {
                warn!("mDNS browse exceeded {:?}", timeout);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptpip_protocol::testing::{FakeCamera, FakeConnector};
    use std::io;
    use tokio::io::DuplexStream;

    /// Reaches a fake camera, but only at the listed addresses
    #[derive(Clone)]
    struct SelectiveConnector {
        reachable: Vec<IpAddr>,
        camera: FakeConnector,
    }

    impl Connector for SelectiveConnector {
        type Stream = DuplexStream;

        async fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<DuplexStream> {
            if self.reachable.contains(&addr.ip()) {
                self.camera.connect(addr, timeout).await
            } else {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            }
        }
    }

    struct StaticBrowser {
        cameras: Vec<Camera>,
        delay: Duration,
    }

    impl ServiceBrowser for StaticBrowser {
        fn browse(&self, _service_type: &str, _timeout: Duration) -> Vec<Camera> {
            std::thread::sleep(self.delay);
            self.cameras.clone()
        }
    }

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    fn service_for(
        camera: FakeCamera,
        reachable: &[&str],
        browser: StaticBrowser,
        config: &TetherConfig,
    ) -> DiscoveryService<SelectiveConnector> {
        let connector = SelectiveConnector {
            reachable: reachable.iter().map(|s| ip(s)).collect(),
            camera: FakeConnector::new(camera),
        };
        DiscoveryService::new(connector, Arc::new(browser), config)
    }

    fn service(
        reachable: &[&str],
        browser: StaticBrowser,
        config: &TetherConfig,
    ) -> DiscoveryService<SelectiveConnector> {
        service_for(FakeCamera::default(), reachable, browser, config)
    }

    fn no_browser() -> StaticBrowser {
        StaticBrowser {
            cameras: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_ap_probe_prefers_detected_gateway() {
        let config = TetherConfig::default();
        let discovery = service(&["192.168.1.1", "192.168.0.10"], no_browser(), &config);
        let network = NetworkState::camera_ap("Nikon_Z6", ip("192.168.0.10"));

        let cameras = discovery.discover(&network).await;
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].ip_address, ip("192.168.0.10"));
        assert_eq!(cameras[0].display_name, "Nikon_Z6");
        assert_eq!(cameras[0].port, 15740);
    }

    #[tokio::test]
    async fn test_ap_probe_falls_back_in_priority_order() {
        let config = TetherConfig::default();
        let discovery = service(&["10.0.0.1", "192.168.0.1"], no_browser(), &config);
        let network = NetworkState::camera_ap("EOS-R6", ip("192.168.77.1"));

        let camera = discovery.probe_access_point(&network).await.unwrap();
        assert_eq!(camera.ip_address, ip("192.168.0.1"));
    }

    #[tokio::test]
    async fn test_ap_probe_nothing_reachable() {
        let config = TetherConfig::default();
        let discovery = service(&[], no_browser(), &config);
        let network = NetworkState::camera_ap("Nikon_Z6", ip("192.168.1.1"));
        assert!(discovery.discover(&network).await.is_empty());
    }

    #[tokio::test]
    async fn test_ap_probe_skips_hosts_rejecting_init() {
        let config = TetherConfig {
            probe_timeout_ms: 200,
            ..Default::default()
        };
        let rejecting = FakeCamera {
            reject_init: true,
            ..Default::default()
        };
        let discovery = service_for(rejecting, &["192.168.1.1"], no_browser(), &config);
        let network = NetworkState::camera_ap("Nikon_Z6", ip("192.168.1.1"));
        assert!(discovery.discover(&network).await.is_empty());

        let silent = FakeCamera {
            answer_init: false,
            ..Default::default()
        };
        let discovery = service_for(silent, &["192.168.1.1"], no_browser(), &config);
        assert!(discovery.discover(&network).await.is_empty());
    }

    #[tokio::test]
    async fn test_station_network_uses_mdns() {
        let config = TetherConfig::default();
        let found = Camera::new(ip("192.168.10.42"), "Z 8");
        let browser = StaticBrowser {
            cameras: vec![found.clone()],
            delay: Duration::ZERO,
        };
        let discovery = service(&["192.168.1.1"], browser, &config);

        let cameras = discovery.discover(&NetworkState::station("HomeNetwork")).await;
        assert_eq!(cameras, vec![found]);
    }

    #[tokio::test]
    async fn test_browse_is_bounded_by_timeout() {
        let config = TetherConfig {
            discovery_timeout_ms: 50,
            ..Default::default()
        };
        let browser = StaticBrowser {
            cameras: vec![Camera::new(ip("192.168.10.42"), "late")],
            delay: Duration::from_secs(2),
        };
        let discovery = service(&[], browser, &config);

        let started = Instant::now();
        assert!(discovery.browse_network().await.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_no_wifi_no_discovery() {
        let config = TetherConfig::default();
        let discovery = service(&["192.168.1.1"], no_browser(), &config);
        assert!(discovery.discover(&NetworkState::default()).await.is_empty());
    }

    #[test]
    fn test_preferred_address() {
        let v6 = ip("fe80::1");
        let v4 = ip("192.168.10.42");
        assert_eq!(preferred_address([v6, v4]), Some(v4));
        assert_eq!(preferred_address([v6]), Some(v6));
        assert_eq!(preferred_address([]), None);
    }

    #[test]
    fn test_instance_name() {
        assert_eq!(instance_name("Z 6_2._ptp._tcp.local."), "Z 6_2");
        assert_eq!(instance_name("EOS R5 v1\\.8._ptp._tcp.local."), "EOS R5 v1.8");
    }

    #[test]
    fn test_merge_deduplicates_by_address() {
        let mut cameras = Vec::new();
        merge_camera(&mut cameras, Camera::new(ip("192.168.10.42"), "Z 8"));
        merge_camera(&mut cameras, Camera::new(ip("192.168.10.42"), "Z 8 (again)"));
        merge_camera(&mut cameras, Camera::new(ip("192.168.10.42"), "other port").with_port(15741));
        assert_eq!(cameras.len(), 2);
    }
}
