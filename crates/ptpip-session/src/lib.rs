//! PTP/IP Tethering Session
//!
//! Finds cameras, pairs with Nikon bodies over shared networks, tracks Wi-Fi
//! state and keeps one camera connected, handing capture to a native library.

mod auth;
mod config;
mod discovery;
mod error;
mod native;
mod network;
mod orchestrator;
mod state;

pub use auth::NikonAuthenticator;
pub use config::{TetherConfig, ENV_PREFIX, PTP_SERVICE_TYPE};
pub use discovery::{DiscoveryService, MdnsBrowser, ServiceBrowser};
pub use error::{ConfigError, SessionError};
pub use native::{call_native, NativeCapture, NativeStatus, NoopNativeCapture};
pub use network::{LinuxWifiProbe, NetworkMonitor, WifiProbe, WifiSnapshot};
pub use orchestrator::TetherSession;
pub use state::{ConnectionMode, ConnectionState, NetworkState};
