//! Native Capture Bridge
//!
//! Capture itself is owned by a separate native library (libgphoto2 on
//! desktop hosts). This module wraps it behind [`NativeCapture`] and runs every
//! call on the blocking pool, since the native side performs synchronous
//! socket I/O.

use crate::error::SessionError;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Status codes returned by the native capture library
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeStatus {
    Ok = 0,
    Error = -1,
    BadParameters = -2,
    NoMemory = -3,
    Library = -4,
    UnknownPort = -5,
    NotSupported = -6,
    Io = -7,
    Timeout = -10,
    IoRead = -34,
    IoWrite = -35,
    CorruptedData = -102,
    ModelNotFound = -105,
    CameraBusy = -110,
    Cancelled = -112,
    CameraError = -113,
    Unknown = -999,
}

impl From<i32> for NativeStatus {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            -1 => Self::Error,
            -2 => Self::BadParameters,
            -3 => Self::NoMemory,
            -4 => Self::Library,
            -5 => Self::UnknownPort,
            -6 => Self::NotSupported,
            -7 => Self::Io,
            -10 => Self::Timeout,
            -34 => Self::IoRead,
            -35 => Self::IoWrite,
            -102 => Self::CorruptedData,
            -105 => Self::ModelNotFound,
            -110 => Self::CameraBusy,
            -112 => Self::Cancelled,
            -113 => Self::CameraError,
            _ => Self::Unknown,
        }
    }
}

impl NativeStatus {
    pub fn is_ok(self) -> bool {
        self == NativeStatus::Ok
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}

/// Operations exposed by the native capture library
///
/// Implementations may block. They must not panic, but a panic is contained
/// by [`call_native`] and reported as [`SessionError::NativeBridge`].
pub trait NativeCapture: Send + Sync + 'static {
    /// Fast path for a camera-hosted access point
    fn init_for_ap_mode(&self, ip: &str, port: u16) -> bool;

    /// Fast path over the library's own PTP/IP stack
    fn init_with_ptpip(&self, ip: &str, port: u16) -> bool;

    /// Attach to a session already opened by the connection manager
    fn init_with_session_maintenance(&self, ip: &str, port: u16) -> NativeStatus;

    /// Keep a station-mode session alive before capture
    fn maintain_session_for_sta_mode(&self) -> NativeStatus;

    fn capture_photo(&self) -> NativeStatus;

    fn close_camera(&self);
}

/// Run a native call on the blocking pool
pub async fn call_native<T, F>(native: &Arc<dyn NativeCapture>, call: F) -> Result<T, SessionError>
where
    T: Send + 'static,
    F: FnOnce(&dyn NativeCapture) -> T + Send + 'static,
{
    let native = Arc::clone(native);
    tokio::task::spawn_blocking(move || call(native.as_ref()))
        .await
        .map_err(|e| SessionError::NativeBridge(e.to_string()))
}

/// Bridge for hosts without a native capture library
///
/// Both fast paths decline, so connections always go through the PTP/IP
/// connection manager; capture reports `NotSupported`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNativeCapture;

impl NativeCapture for NoopNativeCapture {
    fn init_for_ap_mode(&self, ip: &str, port: u16) -> bool {
        debug!("No native library: declining AP fast path to {}:{}", ip, port);
        false
    }

    fn init_with_ptpip(&self, ip: &str, port: u16) -> bool {
        debug!("No native library: declining PTP/IP fast path to {}:{}", ip, port);
        false
    }

    fn init_with_session_maintenance(&self, _ip: &str, _port: u16) -> NativeStatus {
        NativeStatus::NotSupported
    }

    fn maintain_session_for_sta_mode(&self) -> NativeStatus {
        NativeStatus::NotSupported
    }

    fn capture_photo(&self) -> NativeStatus {
        NativeStatus::NotSupported
    }

    fn close_camera(&self) {}
}


#[cfg(test)]
mod tests {
    use super::mock::RecordingNative;
    use super::*;

    #[test]
    fn test_status_from_code() {
        assert_eq!(NativeStatus::from(0), NativeStatus::Ok);
        assert_eq!(NativeStatus::from(-110), NativeStatus::CameraBusy);
        assert_eq!(NativeStatus::from(-7), NativeStatus::Io);
        assert_eq!(NativeStatus::from(42), NativeStatus::Unknown);
        assert!(NativeStatus::Ok.is_ok());
        assert!(!NativeStatus::Timeout.is_ok());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(NativeStatus::CameraBusy.to_string(), "CameraBusy (-110)");
    }

    #[tokio::test]
    async fn test_call_native_runs_on_blocking_pool() {
        let recording = Arc::new(RecordingNative::default());
        let native: Arc<dyn NativeCapture> = recording.clone();
        let status = call_native(&native, |n| n.capture_photo()).await.unwrap();
        assert_eq!(status, NativeStatus::Ok);
        assert_eq!(recording.calls(), vec!["capture_photo"]);
    }

    #[tokio::test]
    async fn test_call_native_contains_panics() {
        let native: Arc<dyn NativeCapture> = Arc::new(RecordingNative {
            panic_on_capture: true,
            ..Default::default()
        });
        let result = call_native(&native, |n| n.capture_photo()).await;
        assert!(matches!(result, Err(SessionError::NativeBridge(_))));
    }

    #[tokio::test]
    async fn test_noop_declines_fast_paths() {
        let native: Arc<dyn NativeCapture> = Arc::new(NoopNativeCapture);
        let ap = call_native(&native, |n| n.init_for_ap_mode("192.168.1.1", 15740))
            .await
            .unwrap();
        assert!(!ap);
        let capture = call_native(&native, |n| n.capture_photo()).await.unwrap();
        assert_eq!(capture, NativeStatus::NotSupported);
    }
}
