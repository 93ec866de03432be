//! Session Orchestrator
//!
//! Drives connect, capture and disconnect for one camera, publishes state on
//! watch channels and reconnects on its own when Wi-Fi comes back.
//!
//! Connection attempts are serialized by the async mutex around the
//! [`ConnectionManager`]; whoever holds it is the only writer on the sockets.
//! Each attempt runs on its own task so that a caller who stops waiting
//! cannot strand it half way: the attempt sees the caller leave, releases the
//! sockets and reports DISCONNECTED.

use crate::auth::NikonAuthenticator;
use crate::config::TetherConfig;
use crate::discovery::{DiscoveryService, ServiceBrowser};
use crate::error::SessionError;
use crate::native::{call_native, NativeCapture};
use crate::state::{ConnectionMode, ConnectionState, NetworkState};
use ptpip_protocol::{Camera, CameraInfo, ConnectionManager, Connector, PtpIpError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct CameraSlots {
    active: Option<Camera>,
    /// Survives Wi-Fi loss so the reconnect loop knows where to go
    last_connected: Option<Camera>,
    mode: ConnectionMode,
}

struct Inner<C: Connector> {
    config: TetherConfig,
    manager: Mutex<ConnectionManager<C>>,
    discovery: DiscoveryService<C>,
    authenticator: NikonAuthenticator,
    native: Arc<dyn NativeCapture>,
    state: watch::Sender<ConnectionState>,
    camera_info: watch::Sender<Option<CameraInfo>>,
    discovered: watch::Sender<Vec<Camera>>,
    network: watch::Sender<NetworkState>,
    slots: std::sync::Mutex<CameraSlots>,
    auto_reconnect: AtomicBool,
    reconnecting: AtomicBool,
    /// Bumped by every disconnect; a reconnect loop from an older epoch stops
    epoch: AtomicU64,
    cancel: Notify,
}

/// Tethering session for a single camera
pub struct TetherSession<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for TetherSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector + Clone> TetherSession<C> {
    pub fn new(
        config: TetherConfig,
        connector: C,
        native: Arc<dyn NativeCapture>,
        browser: Arc<dyn ServiceBrowser>,
    ) -> Self {
        let manager = ConnectionManager::new(connector.clone(), config.connection());
        let discovery = DiscoveryService::new(connector, browser, &config);
        let authenticator = NikonAuthenticator::new(&config);

        Self {
            inner: Arc::new(Inner {
                auto_reconnect: AtomicBool::new(config.auto_reconnect),
                config,
                manager: Mutex::new(manager),
                discovery,
                authenticator,
                native,
                state: watch::Sender::new(ConnectionState::Disconnected),
                camera_info: watch::Sender::new(None),
                discovered: watch::Sender::new(Vec::new()),
                network: watch::Sender::new(NetworkState::default()),
                slots: std::sync::Mutex::new(CameraSlots::default()),
                reconnecting: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                cancel: Notify::new(),
            }),
        }
    }

    /// Find cameras on the current network and publish them
    pub async fn discover_cameras(&self) -> Vec<Camera> {
        let network = self.inner.network.borrow().clone();
        let cameras = self.inner.discovery.discover(&network).await;
        self.inner.discovered.send_replace(cameras.clone());
        cameras
    }

    /// Connect to `camera`, replacing any current connection
    ///
    /// Waits for an in-flight attempt to finish first. Every failure ends in
    /// [`ConnectionState::Error`]; the error detail is only logged. Dropping
    /// the returned future releases whatever the attempt opened and leaves
    /// the state at [`ConnectionState::Disconnected`].
    pub async fn connect(&self, camera: Camera) -> bool {
        self.connect_in_epoch(camera, None).await
    }

    async fn connect_in_epoch(&self, camera: Camera, epoch: Option<u64>) -> bool {
        // dropped together with this future if the caller stops waiting
        let (_waiting, abandoned) = oneshot::channel::<()>();
        let session = self.clone();
        let attempt =
            tokio::spawn(async move { session.run_attempt(camera, epoch, abandoned).await });

        match attempt.await {
            Ok(connected) => connected,
            Err(e) => {
                error!("Connection task failed: {}", e);
                self.set_state(ConnectionState::Error);
                false
            }
        }
    }

    async fn run_attempt(
        &self,
        camera: Camera,
        epoch: Option<u64>,
        mut abandoned: oneshot::Receiver<()>,
    ) -> bool {
        let mut manager = self.inner.manager.lock().await;
        if epoch.is_some_and(|epoch| epoch != self.inner.epoch.load(Ordering::SeqCst)) {
            debug!("Reconnect superseded by disconnect");
            return false;
        }
        if !matches!(abandoned.try_recv(), Err(TryRecvError::Empty)) {
            debug!("Caller left before the attempt to {} started", camera);
            return false;
        }

        let cancelled = self.inner.cancel.notified();
        tokio::pin!(cancelled);

        info!("Connecting to {}", camera);
        self.set_state(ConnectionState::Connecting);

        let attempt = tokio::select! {
            result = self.run_connect(&mut manager, camera) => result,
            _ = &mut cancelled => Err(SessionError::Cancelled),
            _ = &mut abandoned => Err(SessionError::Abandoned),
        };

        match attempt {
            Ok((camera, mode)) => {
                {
                    let mut slots = self.slots();
                    slots.active = Some(camera.clone());
                    slots.last_connected = Some(camera.clone());
                    slots.mode = mode;
                }
                info!("Connected to {} ({:?})", camera, mode);
                self.set_state(ConnectionState::Connected);
                true
            }
            // the disconnect that cancelled us tears down next
            Err(SessionError::Cancelled) => {
                info!("Connection attempt cancelled");
                false
            }
            Err(SessionError::Abandoned) => {
                info!("Caller stopped waiting, releasing the connection");
                manager.close_connections(true).await;
                self.close_native().await;
                self.inner.camera_info.send_replace(None);
                self.set_state(ConnectionState::Disconnected);
                false
            }
            Err(e) => {
                warn!("Connection failed: {}", e);
                manager.close_connections(true).await;
                self.set_state(ConnectionState::Error);
                false
            }
        }
    }

    async fn run_connect(
        &self,
        manager: &mut ConnectionManager<C>,
        camera: Camera,
    ) -> Result<(Camera, ConnectionMode), SessionError> {
        self.release_previous(manager).await;

        let network = self.inner.network.borrow().clone();
        if !network.is_wifi_connected {
            return Err(SessionError::WifiUnavailable);
        }

        let camera = revalidate(camera, &network);
        let on_camera_ap = network.is_connected_to_camera_ap;
        let topology = if on_camera_ap {
            ConnectionMode::ApMode
        } else {
            ConnectionMode::StaMode
        };
        let ip = camera.ip_address.to_string();
        let port = camera.port;

        let fast_ip = ip.clone();
        let fast_path = call_native(&self.inner.native, move |native| {
            if on_camera_ap {
                native.init_for_ap_mode(&fast_ip, port)
            } else {
                native.init_with_ptpip(&fast_ip, port)
            }
        })
        .await?;
        if fast_path {
            info!("Native library connected directly to {}", camera);
            return Ok((camera, topology));
        }

        manager.establish_connection(&camera).await?;
        let info = manager.get_device_info().await.unwrap_or_default();
        if !manager.is_connected() {
            return Err(PtpIpError::NotConnected.into());
        }
        info!(
            "Camera identified: {} {} ({}, serial {})",
            info.manufacturer, info.model, info.version, info.serial_number
        );
        self.inner.camera_info.send_replace(Some(info.clone()));

        let mode = if info.is_nikon() {
            self.inner
                .authenticator
                .authenticate(manager, &camera, &network)
                .await?
        } else {
            topology
        };

        self.attach_native(ip, port).await;
        Ok((camera, mode))
    }

    /// Drop whatever the previous connection left behind
    async fn release_previous(&self, manager: &mut ConnectionManager<C>) {
        let had_camera = {
            let mut slots = self.slots();
            slots.mode = ConnectionMode::Unknown;
            slots.active.take().is_some()
        };
        manager.close_connections(true).await;
        self.inner.camera_info.send_replace(None);
        if had_camera {
            self.close_native().await;
        }
    }

    async fn attach_native(&self, ip: String, port: u16) {
        let attach = call_native(&self.inner.native, move |native| {
            native.init_with_session_maintenance(&ip, port)
        })
        .await;
        match attach {
            Ok(status) if status.is_ok() => info!("Native capture attached to the session"),
            Ok(status) => warn!(
                "Native attach returned {}, PTP/IP session remains usable",
                status
            ),
            Err(e) => warn!("Native attach failed: {}", e),
        }
    }

    async fn close_native(&self) {
        if let Err(e) = call_native(&self.inner.native, |native| native.close_camera()).await {
            warn!("Native close failed: {}", e);
        }
    }

    /// Tear down the connection from any state, cancelling an in-flight connect
    ///
    /// With `keep_session` the PTP session is left open on the camera for the
    /// native library. The remembered camera is forgotten either way, so no
    /// auto-reconnect follows.
    pub async fn disconnect(&self, keep_session: bool) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel.notify_waiters();

        let mut manager = self.inner.manager.lock().await;
        let had_camera = {
            let mut slots = self.slots();
            slots.mode = ConnectionMode::Unknown;
            slots.last_connected = None;
            slots.active.take().is_some()
        };

        manager.close_connections(!keep_session).await;
        if had_camera && !keep_session {
            self.close_native().await;
        }
        self.inner.camera_info.send_replace(None);
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected (keep_session={})", keep_session);
    }

    /// Trigger a capture through the native library
    pub async fn capture_photo(&self) -> bool {
        let _manager = self.inner.manager.lock().await;
        let state = self.state();
        if state != ConnectionState::Connected {
            warn!("Capture requested while {}", state);
            return false;
        }

        // TODO: confirm on hardware whether a failed maintenance call should abort the capture
        let maintenance =
            call_native(&self.inner.native, |native| native.maintain_session_for_sta_mode()).await;
        match maintenance {
            Ok(status) if status.is_ok() => debug!("Session maintenance ok"),
            Ok(status) => warn!(
                "Session maintenance returned {}, attempting capture anyway",
                status
            ),
            Err(e) => warn!("Session maintenance failed ({}), attempting capture anyway", e),
        }

        match call_native(&self.inner.native, |native| native.capture_photo()).await {
            Ok(status) if status.is_ok() => {
                info!("Capture complete");
                true
            }
            Ok(status) => {
                warn!("Capture failed: {}", status);
                false
            }
            Err(e) => {
                error!("Native capture crashed: {}", e);
                self.set_state(ConnectionState::Error);
                false
            }
        }
    }

    /// Apply a network change and run the reconnection policy
    pub async fn on_network_changed(&self, network: NetworkState) {
        self.inner.network.send_replace(network.clone());

        match self.state() {
            ConnectionState::Connected if !network.is_wifi_connected => {
                self.handle_wifi_lost().await
            }
            ConnectionState::Disconnected if network.is_wifi_connected => {
                self.schedule_reconnect()
            }
            _ => {}
        }
    }

    /// Feed network updates from `updates` until its sender is dropped
    pub fn watch_network(&self, mut updates: watch::Receiver<NetworkState>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let initial = updates.borrow_and_update().clone();
            session.on_network_changed(initial).await;
            while updates.changed().await.is_ok() {
                let network = updates.borrow_and_update().clone();
                session.on_network_changed(network).await;
            }
            debug!("Network updates ended");
        })
    }

    async fn handle_wifi_lost(&self) {
        warn!("Wi-Fi lost while connected");
        let had_camera = {
            let mut slots = self.slots();
            slots.mode = ConnectionMode::Unknown;
            slots.active.take().is_some()
        };
        self.set_state(ConnectionState::Disconnected);

        let mut manager = self.inner.manager.lock().await;
        manager.close_connections(false).await;
        if had_camera {
            self.close_native().await;
        }
    }

    fn schedule_reconnect(&self) {
        if !self.auto_reconnect_enabled() || self.slots().last_connected.is_none() {
            return;
        }
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnect loop already running");
            return;
        }

        let session = self.clone();
        tokio::spawn(async move {
            session.reconnect_loop().await;
            session.inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(&self) {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let settle = self.inner.config.reconnect_settle();
        info!("Wi-Fi back, reconnecting in {:?}", settle);
        tokio::time::sleep(settle).await;

        loop {
            if !self.auto_reconnect_enabled() || self.inner.epoch.load(Ordering::SeqCst) != epoch {
                break;
            }
            if matches!(
                self.state(),
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                break;
            }
            let Some(camera) = self.corrected_last_camera() else {
                break;
            };

            info!("Auto-reconnecting to {}", camera);
            if self.connect_in_epoch(camera, Some(epoch)).await {
                break;
            }

            tokio::time::sleep(self.inner.config.reconnect_retry()).await;
            if self.state() != ConnectionState::Error {
                break;
            }
        }
        debug!("Reconnect loop finished");
    }

    /// Remembered camera, moved to the AP's current address if it changed
    fn corrected_last_camera(&self) -> Option<Camera> {
        let network = self.inner.network.borrow().clone();
        let mut slots = self.slots();
        let camera = revalidate(slots.last_connected.clone()?, &network);
        slots.last_connected = Some(camera.clone());
        Some(camera)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn camera_info(&self) -> watch::Receiver<Option<CameraInfo>> {
        self.inner.camera_info.subscribe()
    }

    pub fn discovered_cameras(&self) -> watch::Receiver<Vec<Camera>> {
        self.inner.discovered.subscribe()
    }

    pub fn network_state(&self) -> watch::Receiver<NetworkState> {
        self.inner.network.subscribe()
    }

    pub fn active_camera(&self) -> Option<Camera> {
        self.slots().active.clone()
    }

    pub fn last_connected_camera(&self) -> Option<Camera> {
        self.slots().last_connected.clone()
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        self.slots().mode
    }

    pub fn auto_reconnect_enabled(&self) -> bool {
        self.inner.auto_reconnect.load(Ordering::SeqCst)
    }

    /// Turning this off also stops a running reconnect loop at its next check
    pub fn set_auto_reconnect_enabled(&self, enabled: bool) {
        info!("Auto-reconnect {}", if enabled { "enabled" } else { "disabled" });
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.inner.state.send_replace(next);
        if previous != next {
            info!("Connection state {} -> {}", previous, next);
        }
    }

    fn slots(&self) -> MutexGuard<'_, CameraSlots> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// On a camera AP the gateway is the camera; follow it if it moved
fn revalidate(camera: Camera, network: &NetworkState) -> Camera {
    match network.detected_camera_ip {
        Some(ip) if network.is_connected_to_camera_ap && ip != camera.ip_address => {
            info!("Camera address moved from {} to {}", camera.ip_address, ip);
            camera.with_ip(ip)
        }
        _ => camera,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::RecordingNative;
    use crate::native::NativeStatus;
    use ptpip_protocol::testing::{sample_device_info, FakeCamera, FakeConnector};
    use ptpip_protocol::{nikon, opcode, response, PacketType};
    use std::net::IpAddr;
    use std::time::Duration;

    struct NoBrowser;

    impl ServiceBrowser for NoBrowser {
        fn browse(&self, _service_type: &str, _timeout: Duration) -> Vec<Camera> {
            Vec::new()
        }
    }

    fn test_config() -> TetherConfig {
        TetherConfig {
            probe_timeout_ms: 500,
            handshake_timeout_ms: 500,
            event_socket_delay_ms: 1,
            response_timeout_ms: 300,
            close_session_timeout_ms: 200,
            reconnect_settle_ms: 20,
            reconnect_retry_ms: 50,
            device_ready_interval_ms: 5,
            sta_retry_delay_ms: 5,
            ..Default::default()
        }
    }

    fn session_with(
        config: TetherConfig,
        camera: FakeCamera,
        native: RecordingNative,
    ) -> (TetherSession<FakeConnector>, FakeConnector, Arc<RecordingNative>) {
        let connector = FakeConnector::new(camera);
        let native = Arc::new(native);
        let session = TetherSession::new(
            config,
            connector.clone(),
            native.clone(),
            Arc::new(NoBrowser),
        );
        (session, connector, native)
    }

    fn session(
        camera: FakeCamera,
        native: RecordingNative,
    ) -> (TetherSession<FakeConnector>, FakeConnector, Arc<RecordingNative>) {
        session_with(test_config(), camera, native)
    }

    fn plain_session() -> (TetherSession<FakeConnector>, FakeConnector, Arc<RecordingNative>) {
        session(FakeCamera::default(), RecordingNative::default())
    }

    fn nikon_camera() -> FakeCamera {
        FakeCamera {
            device_info: sample_device_info("Nikon Corporation", "Z 6", "V1.00", "3012345678"),
            ..Default::default()
        }
    }

    fn ap_fast_path() -> RecordingNative {
        RecordingNative {
            ap_fast_path: true,
            ..Default::default()
        }
    }

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    fn home() -> NetworkState {
        NetworkState::station("HomeNetwork")
    }

    fn opcodes(connector: &FakeConnector) -> Vec<u16> {
        connector.operations().iter().map(|r| r.opcode).collect()
    }

    async fn wait_for_state(session: &TetherSession<FakeConnector>, expected: ConnectionState) {
        let mut rx = session.connection_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == expected))
            .await
            .unwrap_or_else(|_| panic!("state never reached {}", expected))
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_connect_ends_in_error() {
        let (session, connector, _native) = session(
            FakeCamera {
                refuse_connections: true,
                ..Default::default()
            },
            RecordingNative::default(),
        );
        session.on_network_changed(home()).await;

        assert!(!session.connect(Camera::new(ip("192.168.10.20"), "R5")).await);
        assert_eq!(session.state(), ConnectionState::Error);
        assert!(session.active_camera().is_none());
        assert!(session.last_connected_camera().is_none());
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_wifi_fails_fast() {
        let (session, connector, native) = session(FakeCamera::default(), ap_fast_path());

        assert!(!session.connect(Camera::new(ip("192.168.1.1"), "R5")).await);
        assert_eq!(session.state(), ConnectionState::Error);
        assert_eq!(connector.connect_count(), 0);
        assert!(native.calls().is_empty());
    }

    #[tokio::test]
    async fn test_connect_through_connection_manager() {
        let (session, connector, native) = plain_session();
        session.on_network_changed(home()).await;

        assert!(session.connect(Camera::new(ip("192.168.10.20"), "R5")).await);
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.connection_mode(), ConnectionMode::StaMode);

        let info = session.camera_info().borrow().clone().unwrap();
        assert_eq!(info.manufacturer, "Canon");
        assert_eq!(info.model, "R5");

        assert_eq!(opcodes(&connector), vec![opcode::GET_DEVICE_INFO]);
        assert_eq!(
            native.calls(),
            vec![
                "init_with_ptpip 192.168.10.20:15740",
                "init_with_session_maintenance 192.168.10.20:15740",
            ]
        );
    }

    #[tokio::test]
    async fn test_native_fast_path_on_camera_ap() {
        let (session, connector, native) = session(FakeCamera::default(), ap_fast_path());
        session
            .on_network_changed(NetworkState::camera_ap("EOS-R5", ip("192.168.1.1")))
            .await;

        assert!(session.connect(Camera::new(ip("192.168.1.1"), "EOS-R5")).await);
        assert_eq!(session.connection_mode(), ConnectionMode::ApMode);
        assert_eq!(connector.connect_count(), 0);
        assert_eq!(native.calls(), vec!["init_for_ap_mode 192.168.1.1:15740"]);
    }

    #[tokio::test]
    async fn test_connect_follows_moved_ap_address() {
        let (session, _connector, _native) = session(FakeCamera::default(), ap_fast_path());
        session
            .on_network_changed(NetworkState::camera_ap("EOS-R5", ip("192.168.1.5")))
            .await;

        assert!(session.connect(Camera::new(ip("192.168.1.1"), "EOS-R5")).await);
        assert_eq!(session.active_camera().unwrap().ip_address, ip("192.168.1.5"));
    }

    #[tokio::test]
    async fn test_nikon_station_pairs_then_attaches() {
        let (session, connector, native) = session(
            FakeCamera {
                device_ready_codes: vec![response::DEVICE_BUSY],
                ..nikon_camera()
            },
            RecordingNative::default(),
        );
        session.on_network_changed(home()).await;

        assert!(session.connect(Camera::new(ip("192.168.10.20"), "Z 6")).await);
        assert_eq!(session.connection_mode(), ConnectionMode::StaMode);
        assert_eq!(
            opcodes(&connector),
            vec![
                opcode::GET_DEVICE_INFO,
                opcode::OPEN_SESSION,
                nikon::DEVICE_READY,
                nikon::DEVICE_READY,
            ]
        );
        assert!(native
            .calls()
            .contains(&"init_with_session_maintenance 192.168.10.20:15740".to_string()));
    }

    #[tokio::test]
    async fn test_nikon_pairing_failure_is_error() {
        let (session, _connector, native) = session(
            FakeCamera {
                device_ready_codes: vec![response::ACCESS_DENIED],
                ..nikon_camera()
            },
            RecordingNative::default(),
        );
        session.on_network_changed(home()).await;

        assert!(!session.connect(Camera::new(ip("192.168.10.20"), "Z 6")).await);
        assert_eq!(session.state(), ConnectionState::Error);
        assert!(!native
            .calls()
            .iter()
            .any(|c| c.starts_with("init_with_session_maintenance")));
    }

    #[tokio::test]
    async fn test_failed_attach_still_connects() {
        let (session, _connector, _native) = session(
            FakeCamera::default(),
            RecordingNative {
                attach: NativeStatus::Io,
                ..Default::default()
            },
        );
        session.on_network_changed(home()).await;

        assert!(session.connect(Camera::new(ip("192.168.10.20"), "R5")).await);
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_wifi_loss_disconnects_but_remembers_camera() {
        let (session, _connector, _native) = plain_session();
        session.on_network_changed(home()).await;
        assert!(session.connect(Camera::new(ip("192.168.10.20"), "R5")).await);

        session.set_auto_reconnect_enabled(false);
        session.on_network_changed(NetworkState::default()).await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.active_camera().is_none());
        assert_eq!(
            session.last_connected_camera().unwrap().ip_address,
            ip("192.168.10.20")
        );
    }

    #[tokio::test]
    async fn test_auto_reconnect_follows_new_ap_address() {
        let (session, _connector, native) = session(FakeCamera::default(), ap_fast_path());
        session
            .on_network_changed(NetworkState::camera_ap("Nikon_Z6", ip("192.168.1.1")))
            .await;
        assert!(session.connect(Camera::new(ip("192.168.1.1"), "Nikon_Z6")).await);

        session.on_network_changed(NetworkState::default()).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);

        session
            .on_network_changed(NetworkState::camera_ap("Nikon_Z6", ip("192.168.1.7")))
            .await;
        wait_for_state(&session, ConnectionState::Connected).await;

        assert_eq!(session.active_camera().unwrap().ip_address, ip("192.168.1.7"));
        assert!(native
            .calls()
            .contains(&"init_for_ap_mode 192.168.1.7:15740".to_string()));
    }

    #[tokio::test]
    async fn test_no_reconnect_when_disabled() {
        let (session, _connector, native) = session(FakeCamera::default(), ap_fast_path());
        let network = NetworkState::camera_ap("Nikon_Z6", ip("192.168.1.1"));
        session.on_network_changed(network.clone()).await;
        assert!(session.connect(Camera::new(ip("192.168.1.1"), "Nikon_Z6")).await);

        session.set_auto_reconnect_enabled(false);
        session.on_network_changed(NetworkState::default()).await;
        session.on_network_changed(network).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        let inits = native
            .calls()
            .iter()
            .filter(|c| c.starts_with("init_for_ap_mode"))
            .count();
        assert_eq!(inits, 1);
    }

    #[tokio::test]
    async fn test_reconnect_retries_while_in_error() {
        let (session, connector, _native) = plain_session();
        session.on_network_changed(home()).await;
        assert!(session.connect(Camera::new(ip("192.168.10.20"), "R5")).await);

        session.on_network_changed(NetworkState::default()).await;
        connector.set_refuse_connections(true);
        session.on_network_changed(home()).await;

        wait_for_state(&session, ConnectionState::Error).await;
        connector.set_refuse_connections(false);
        wait_for_state(&session, ConnectionState::Connected).await;
        assert_eq!(
            session.active_camera().unwrap().ip_address,
            ip("192.168.10.20")
        );
    }

    #[tokio::test]
    async fn test_concurrent_connects_do_not_interleave() {
        let (session, connector, _native) = plain_session();
        session.on_network_changed(home()).await;

        let (first, second) = tokio::join!(
            session.connect(Camera::new(ip("192.168.10.20"), "R5")),
            session.connect(Camera::new(ip("192.168.10.21"), "R5")),
        );
        assert!(first && second);
        assert_eq!(session.state(), ConnectionState::Connected);

        // attribute every frame to the attempt whose command socket it belongs to
        let records = connector.records();
        let attempts: Vec<u32> = records
            .iter()
            .map(|r| match r.packet_type {
                PacketType::InitEventRequest => r.connection_number.unwrap_or(r.connection),
                _ => r.connection,
            })
            .collect();
        assert!(attempts.windows(2).all(|pair| pair[0] <= pair[1]), "{:?}", attempts);

        let handshakes = records
            .iter()
            .filter(|r| r.packet_type == PacketType::InitCommandRequest)
            .count();
        assert_eq!(handshakes, 2);
        assert_eq!(connector.overlapping_requests(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_closes_session() {
        let (session, connector, native) = session(nikon_camera(), RecordingNative::default());
        session.on_network_changed(home()).await;
        assert!(session.connect(Camera::new(ip("192.168.10.20"), "Z 6")).await);

        session.disconnect(false).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.last_connected_camera().is_none());
        assert!(session.camera_info().borrow().is_none());
        assert!(opcodes(&connector).contains(&opcode::CLOSE_SESSION));
        assert!(native.calls().contains(&"close_camera".to_string()));
    }

    #[tokio::test]
    async fn test_disconnect_keeping_session() {
        let (session, connector, native) = session(nikon_camera(), RecordingNative::default());
        session.on_network_changed(home()).await;
        assert!(session.connect(Camera::new(ip("192.168.10.20"), "Z 6")).await);

        session.disconnect(true).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!opcodes(&connector).contains(&opcode::CLOSE_SESSION));
        assert!(!native.calls().contains(&"close_camera".to_string()));
    }

    #[tokio::test]
    async fn test_disconnect_is_safe_when_idle() {
        let (session, connector, _native) = plain_session();
        session.disconnect(false).await;
        session.disconnect(true).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_caller_timeout_releases_connection() {
        let config = TetherConfig {
            response_timeout_ms: 10_000,
            ..test_config()
        };
        let (session, connector, _native) =
            session_with(config, FakeCamera::default(), RecordingNative::default());
        connector.set_mute_operations(true);
        session.on_network_changed(home()).await;

        let camera = Camera::new(ip("192.168.10.20"), "R5");
        let waited =
            tokio::time::timeout(Duration::from_millis(300), session.connect(camera.clone())).await;
        assert!(waited.is_err());

        wait_for_state(&session, ConnectionState::Disconnected).await;
        assert!(session.active_camera().is_none());
        for _ in 0..100 {
            if connector.open_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(connector.open_connections(), 0);

        // the manager is free for the next attempt
        connector.set_mute_operations(false);
        assert!(session.connect(camera).await);
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_inflight_connect() {
        let config = TetherConfig {
            response_timeout_ms: 10_000,
            ..test_config()
        };
        let (session, connector, _native) =
            session_with(config, FakeCamera::default(), RecordingNative::default());
        connector.set_mute_operations(true);
        session.on_network_changed(home()).await;

        let connecting = {
            let session = session.clone();
            let camera = Camera::new(ip("192.168.10.20"), "R5");
            tokio::spawn(async move { session.connect(camera).await })
        };
        wait_for_state(&session, ConnectionState::Connecting).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        session.disconnect(false).await;
        let connected = tokio::time::timeout(Duration::from_secs(2), connecting)
            .await
            .unwrap()
            .unwrap();
        assert!(!connected);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.active_camera().is_none());
    }

    #[tokio::test]
    async fn test_capture_attempted_after_failed_maintenance() {
        let (session, _connector, native) = session(
            FakeCamera::default(),
            RecordingNative {
                ap_fast_path: true,
                maintain: NativeStatus::Error,
                ..Default::default()
            },
        );
        session
            .on_network_changed(NetworkState::camera_ap("EOS-R5", ip("192.168.1.1")))
            .await;
        assert!(session.connect(Camera::new(ip("192.168.1.1"), "EOS-R5")).await);

        assert!(session.capture_photo().await);
        let calls = native.calls();
        assert_eq!(
            &calls[calls.len() - 2..],
            &["maintain_session_for_sta_mode", "capture_photo"]
        );
    }

    #[tokio::test]
    async fn test_capture_requires_connection() {
        let (session, _connector, native) = session(FakeCamera::default(), ap_fast_path());
        assert!(!session.capture_photo().await);
        assert!(native.calls().is_empty());
    }

    #[tokio::test]
    async fn test_capture_crash_becomes_error() {
        let (session, _connector, _native) = session(
            FakeCamera::default(),
            RecordingNative {
                ap_fast_path: true,
                panic_on_capture: true,
                ..Default::default()
            },
        );
        session
            .on_network_changed(NetworkState::camera_ap("EOS-R5", ip("192.168.1.1")))
            .await;
        assert!(session.connect(Camera::new(ip("192.168.1.1"), "EOS-R5")).await);

        assert!(!session.capture_photo().await);
        assert_eq!(session.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_discovery_publishes_cameras() {
        let (session, _connector, _native) = plain_session();
        session
            .on_network_changed(NetworkState::camera_ap("Nikon_Z6", ip("192.168.1.1")))
            .await;

        let cameras = session.discover_cameras().await;
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].ip_address, ip("192.168.1.1"));
        assert_eq!(*session.discovered_cameras().borrow(), cameras);
    }

    #[tokio::test]
    async fn test_watch_network_feeds_session() {
        let (session, _connector, _native) = plain_session();
        let (tx, rx) = watch::channel(NetworkState::default());
        let handle = session.watch_network(rx);

        let mut network = session.network_state();
        tx.send(home()).unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            network.wait_for(|n| n.is_wifi_connected),
        )
        .await
        .unwrap()
        .unwrap();

        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
