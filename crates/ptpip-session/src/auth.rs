//! Nikon Authentication
//!
//! Over a camera-hosted access point Nikon bodies accept standard operations
//! right after the handshake. Over a shared network the body shows a pairing
//! prompt and answers DeviceReady with DeviceBusy until the user accepts.
//! The pairing runs on the connection manager's live session, which stays
//! open afterwards so the native capture library can attach to it.

use crate::config::TetherConfig;
use crate::state::{ConnectionMode, NetworkState};
use ptpip_protocol::{nikon, response, Camera, ConnectionManager, Connector, PtpIpError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Nikon station-mode pairing
#[derive(Debug, Clone)]
pub struct NikonAuthenticator {
    device_ready_attempts: u32,
    device_ready_interval: Duration,
    sta_retry_delay: Duration,
}

impl NikonAuthenticator {
    pub fn new(config: &TetherConfig) -> Self {
        Self {
            device_ready_attempts: config.device_ready_attempts.max(1),
            device_ready_interval: Duration::from_millis(config.device_ready_interval_ms),
            sta_retry_delay: Duration::from_millis(config.sta_retry_delay_ms),
        }
    }

    /// Topology implied by the first connection attempt
    ///
    /// Only an immediate success while joined to a camera access point counts
    /// as AP mode; everything else needs pairing.
    pub fn classify(first_attempt_ok: bool, network: &NetworkState) -> ConnectionMode {
        if first_attempt_ok && network.is_connected_to_camera_ap {
            ConnectionMode::ApMode
        } else {
            ConnectionMode::StaMode
        }
    }

    /// Classify the connection and pair if needed
    ///
    /// Reuses the manager's connection when it already holds device info,
    /// otherwise makes the first attempt itself. On success in STA mode the
    /// PTP session is left open.
    pub async fn authenticate<C: Connector>(
        &self,
        manager: &mut ConnectionManager<C>,
        camera: &Camera,
        network: &NetworkState,
    ) -> Result<ConnectionMode, PtpIpError> {
        let first_attempt_ok = if manager.is_connected() && manager.camera_info().is_some() {
            true
        } else {
            self.first_attempt(manager, camera).await
        };

        let mode = Self::classify(first_attempt_ok, network);
        if mode == ConnectionMode::ApMode {
            info!("Nikon reached over its access point, no pairing needed");
            return Ok(mode);
        }

        info!("Nikon in station mode, starting pairing");
        if !manager.is_connected() {
            tokio::time::sleep(self.sta_retry_delay).await;
            manager
                .establish_connection(camera)
                .await
                .map_err(|e| PtpIpError::AuthenticationFailed(format!("reconnect failed: {e}")))?;
        }

        self.pair(manager).await?;
        info!("Nikon pairing complete, session kept open");
        Ok(mode)
    }

    async fn first_attempt<C: Connector>(
        &self,
        manager: &mut ConnectionManager<C>,
        camera: &Camera,
    ) -> bool {
        if let Err(e) = manager.establish_connection(camera).await {
            debug!("First Nikon attempt failed: {}", e);
            return false;
        }
        manager.get_device_info().await.is_some()
    }

    /// OpenSession, then poll DeviceReady while the camera reports busy
    async fn pair<C: Connector>(
        &self,
        manager: &mut ConnectionManager<C>,
    ) -> Result<(), PtpIpError> {
        manager
            .open_session()
            .await
            .map_err(|e| PtpIpError::AuthenticationFailed(format!("OpenSession: {e}")))?;

        for attempt in 1..=self.device_ready_attempts {
            match manager.execute_for_response(nikon::DEVICE_READY, &[]).await {
                Ok(reply) if reply.is_ok() => return Ok(()),
                Ok(reply) if reply.code == response::DEVICE_BUSY => {
                    debug!(
                        "Camera busy (attempt {}/{}), waiting for pairing confirmation",
                        attempt, self.device_ready_attempts
                    );
                }
                Ok(reply) => {
                    return Err(PtpIpError::AuthenticationFailed(format!(
                        "camera refused pairing ({:#06X})",
                        reply.code
                    )));
                }
                Err(PtpIpError::NoResponse(_)) if manager.is_connected() => {
                    warn!("DeviceReady unanswered (attempt {})", attempt);
                }
                Err(e) => return Err(PtpIpError::AuthenticationFailed(e.to_string())),
            }
            tokio::time::sleep(self.device_ready_interval).await;
        }

        Err(PtpIpError::AuthenticationFailed(format!(
            "camera not ready after {} attempts",
            self.device_ready_attempts
        )))
    }
}
