//! PTP/IP Tether
//!
//! Wires configuration, Wi-Fi polling and the tethering session together for
//! a desktop host.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ptpip_protocol::{Camera, TcpConnector};
use ptpip_session::{
    LinuxWifiProbe, MdnsBrowser, NetworkMonitor, NetworkState, NoopNativeCapture, TetherConfig,
    TetherSession, WifiProbe,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "ptpip=info";

#[derive(Parser, Debug)]
#[command(name = "ptpip-tether", version)]
#[command(about = "Discover and tether PTP/IP cameras over Wi-Fi")]
pub struct Cli {
    /// TOML configuration file; PTPIP_* environment variables override it
    #[arg(long, global = true, env = "PTPIP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Treat the host as joined to a shared network when no Wi-Fi link is found
    #[arg(long, global = true)]
    pub ignore_wifi: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List cameras reachable on the current network
    Discover,

    /// Connect to a camera, print its identity and optionally capture
    Connect {
        #[arg(long)]
        ip: IpAddr,

        /// PTP/IP port, defaults to the configured port
        #[arg(long)]
        port: Option<u16>,

        /// Trigger one capture once connected
        #[arg(long)]
        capture: bool,

        /// Leave the PTP session open on the camera when exiting
        #[arg(long)]
        keep_session: bool,
    },
}

/// Install the fmt subscriber filtered by `RUST_LOG`
pub fn init_logging() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = TetherConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let session = TetherSession::new(
        config.clone(),
        TcpConnector,
        Arc::new(NoopNativeCapture),
        Arc::new(MdnsBrowser),
    );

    let monitor = Arc::new(NetworkMonitor::new(&config));
    let probe = LinuxWifiProbe::new();
    let initial = {
        let probe = probe.clone();
        tokio::task::spawn_blocking(move || probe.snapshot()).await?
    };
    match initial {
        Ok(snapshot) => {
            monitor.update(snapshot);
        }
        Err(e) => warn!("Wi-Fi state unavailable: {}", e),
    }

    let mut background = Vec::new();
    if cli.ignore_wifi && !monitor.current().is_wifi_connected {
        info!("No Wi-Fi link, assuming a shared network");
        session.on_network_changed(NetworkState::station("wired")).await;
    } else {
        session.on_network_changed(monitor.current()).await;
        background.push(session.watch_network(monitor.subscribe()));
        background.push(monitor.spawn_polling(probe, config.wifi_poll_interval()));
    }

    let result = match cli.command {
        Command::Discover => discover(&session).await,
        Command::Connect {
            ip,
            port,
            capture,
            keep_session,
        } => {
            let camera = Camera::new(ip, "camera").with_port(port.unwrap_or(config.port));
            connect(&session, camera, capture, keep_session).await
        }
    };

    for task in background {
        task.abort();
    }
    result
}

async fn discover(session: &TetherSession<TcpConnector>) -> anyhow::Result<()> {
    let cameras = session.discover_cameras().await;
    if cameras.is_empty() {
        println!("No cameras found");
    }
    for camera in cameras {
        println!("{}", camera);
    }
    Ok(())
}

async fn connect(
    session: &TetherSession<TcpConnector>,
    camera: Camera,
    capture: bool,
    keep_session: bool,
) -> anyhow::Result<()> {
    let mut states = session.connection_state();
    let printer = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            println!("state: {}", state);
        }
    });

    if !session.connect(camera.clone()).await {
        printer.abort();
        bail!("could not connect to {}", camera);
    }

    let info = session.camera_info().borrow().clone();
    if let Some(info) = info {
        println!("manufacturer: {}", info.manufacturer);
        println!("model:        {}", info.model);
        println!("version:      {}", info.version);
        println!("serial:       {}", info.serial_number);
    }
    println!("mode: {:?}", session.connection_mode());

    if capture && !session.capture_photo().await {
        warn!("Capture did not complete");
    }

    session.disconnect(keep_session).await;
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        let cli = Cli::try_parse_from([
            "ptpip-tether",
            "--config",
            "tether.toml",
            "connect",
            "--ip",
            "192.168.1.1",
            "--capture",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("tether.toml")));
        match cli.command {
            Command::Connect {
                ip,
                port,
                capture,
                keep_session,
            } => {
                assert_eq!(ip, "192.168.1.1".parse::<IpAddr>().unwrap());
                assert_eq!(port, None);
                assert!(capture);
                assert!(!keep_session);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_discover_with_global_flag_after() {
        let cli = Cli::try_parse_from(["ptpip-tether", "discover", "--ignore-wifi"]).unwrap();
        assert!(matches!(cli.command, Command::Discover));
        assert!(cli.ignore_wifi);
    }

    #[test]
    fn test_connect_requires_ip() {
        assert!(Cli::try_parse_from(["ptpip-tether", "connect"]).is_err());
    }
}
