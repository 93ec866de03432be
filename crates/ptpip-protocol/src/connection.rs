//! PTP/IP Connection Manager
//!
//! Owns the command and event sockets for one camera, performs the two-phase
//! init handshake and runs PTP operations over the command socket. A manager
//! is not internally synchronised; callers that share one must put it behind
//! a single-writer lock.

use crate::camera::Camera;
use crate::codec::{
    expect_init_event_ack, Frame, InitCommandAck, InitCommandRequest, InitEventRequest,
    OperationResponse, PacketType, TransactionCounter,
};
use crate::device_info::{parse_device_info, CameraInfo, ParseOutcome};
use crate::error::PtpIpError;
use crate::transport::{read_frame, write_frame, Connector};
use crate::{opcode, response};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Timeouts and host identity used by the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Reachability probe before allocating sockets
    pub probe_timeout: Duration,
    /// Deadline for each init ACK
    pub handshake_timeout: Duration,
    /// Pause between the command and event socket handshakes
    pub event_socket_delay: Duration,
    /// Per-read deadline while collecting an operation's frames
    pub response_timeout: Duration,
    /// Per-read deadline for CloseSession
    pub close_session_timeout: Duration,
    /// Friendly name sent in the Init Command Request
    pub host_name: String,
    /// Host GUID; a random one is generated when absent
    pub guid: Option<[u8; 16]>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
            // some firmware refuses the event socket if it arrives too quickly
            event_socket_delay: Duration::from_millis(200),
            response_timeout: Duration::from_secs(5),
            close_session_timeout: Duration::from_secs(2),
            host_name: "ptpip-tether".to_string(),
            guid: None,
        }
    }
}

/// Live socket pair and PTP session state
struct Session<S> {
    command: S,
    /// Drains the event socket and owns it for the session's lifetime
    event_pump: JoinHandle<()>,
    /// Cleared by the pump once the camera closes the event socket
    event_open: Arc<AtomicBool>,
    connection_number: u32,
    session_id: Option<u32>,
    transactions: TransactionCounter,
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        self.event_pump.abort();
    }
}

/// Frames collected for one operation
struct ResponseSequence {
    frames: Vec<Frame>,
    socket_lost: bool,
}

/// PTP/IP connection manager for a single camera
pub struct ConnectionManager<C: Connector> {
    connector: C,
    config: ConnectionConfig,
    guid: [u8; 16],
    session: Option<Session<C::Stream>>,
    camera: Option<Camera>,
    camera_info: Option<CameraInfo>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager that opens sockets through `connector`
    pub fn new(connector: C, config: ConnectionConfig) -> Self {
        let guid = config
            .guid
            .unwrap_or_else(|| *uuid::Uuid::new_v4().as_bytes());
        Self {
            connector,
            config,
            guid,
            session: None,
            camera: None,
            camera_info: None,
        }
    }

    /// Probe the camera, then perform the command and event handshakes
    ///
    /// Partial state is dropped on any failure, leaving the manager disconnected.
    pub async fn establish_connection(&mut self, camera: &Camera) -> Result<(), PtpIpError> {
        if self.session.is_some() {
            self.close_connections(true).await;
        }

        let addr = camera.socket_addr();
        info!("Connecting to camera {}", camera);

        // reachability first, so a dead address fails fast
        let probe = self
            .connector
            .connect(addr, self.config.probe_timeout)
            .await
            .map_err(|e| PtpIpError::Unreachable(format!("{addr}: {e}")))?;
        drop(probe);

        let mut command = self
            .connector
            .connect(addr, self.config.handshake_timeout)
            .await
            .map_err(|e| PtpIpError::Unreachable(format!("{addr}: {e}")))?;

        let request = InitCommandRequest::new(self.guid, &self.config.host_name);
        write_frame(&mut command, &request.to_frame()).await?;
        let ack_frame = read_handshake_frame(&mut command, self.config.handshake_timeout).await?;
        let ack = InitCommandAck::from_frame(&ack_frame)?;
        debug!(
            "Init command ack: connection {} from {:?}",
            ack.connection_number, ack.camera_name
        );

        tokio::time::sleep(self.config.event_socket_delay).await;

        let mut event = self
            .connector
            .connect(addr, self.config.handshake_timeout)
            .await
            .map_err(|e| PtpIpError::Unreachable(format!("{addr}: {e}")))?;

        let event_request = InitEventRequest {
            connection_number: ack.connection_number,
        };
        write_frame(&mut event, &event_request.to_frame()).await?;
        let event_ack = read_handshake_frame(&mut event, self.config.handshake_timeout).await?;
        expect_init_event_ack(&event_ack)?;

        let event_open = Arc::new(AtomicBool::new(true));
        self.session = Some(Session {
            command,
            event_pump: spawn_event_pump(event, Arc::clone(&event_open)),
            event_open,
            connection_number: ack.connection_number,
            session_id: None,
            transactions: TransactionCounter::new(),
        });
        self.camera = Some(camera.clone());
        info!(
            "PTP/IP connection established with {} (connection {})",
            camera, ack.connection_number
        );
        Ok(())
    }

    /// Query and parse the camera's device info
    pub async fn get_device_info(&mut self) -> Option<CameraInfo> {
        let frames = match self.execute(opcode::GET_DEVICE_INFO, &[]).await {
            Ok(frames) => frames,
            Err(e) => {
                warn!("GetDeviceInfo failed: {}", e);
                return None;
            }
        };

        let blob = largest_fragment(&frames)?;
        let outcome = parse_device_info(blob);
        match &outcome {
            ParseOutcome::Complete(info) => debug!("Device info parsed: {:?}", info),
            ParseOutcome::Partial(info) => debug!("Device info partially parsed: {:?}", info),
            ParseOutcome::Fallback { reason, .. } => {
                warn!("Device info unreadable ({}), using fallback", reason)
            }
        }

        let info = outcome.into_info();
        self.camera_info = Some(info.clone());
        Some(info)
    }

    /// Open a PTP session with an id derived from the current time
    pub async fn open_session(&mut self) -> Result<u32, PtpIpError> {
        let session_id = derive_session_id();
        let frames = self.execute(opcode::OPEN_SESSION, &[session_id]).await?;
        let reply = final_response(&frames, opcode::OPEN_SESSION)?;

        match reply.code {
            response::OK | response::SESSION_ALREADY_OPEN => {
                if let Some(session) = self.session.as_mut() {
                    session.session_id = Some(session_id);
                }
                info!("PTP session {} open", session_id);
                Ok(session_id)
            }
            code => Err(PtpIpError::ResponseCode {
                opcode: opcode::OPEN_SESSION,
                code,
            }),
        }
    }

    /// Close the PTP session
    ///
    /// A soft close (`force_close == false`) sends nothing and returns true: a
    /// native capture library may be sharing the session. A forced close sends
    /// CloseSession and reports whether the camera acknowledged it; failures are
    /// only logged since the sockets are usually discarded next.
    pub async fn close_session(&mut self, force_close: bool) -> bool {
        if !force_close {
            debug!("Soft close: leaving PTP session open for hand-off");
            return true;
        }

        let close_timeout = self.config.close_session_timeout;
        let Some(session) = self.session.as_mut() else {
            debug!("CloseSession skipped: not connected");
            return false;
        };

        let request = session.transactions.request(opcode::CLOSE_SESSION, &[]);
        session.session_id = None;

        if let Err(e) = write_frame(&mut session.command, &request.to_frame()).await {
            warn!("CloseSession write failed: {}", e);
            return false;
        }

        let sequence = read_response_sequence(&mut session.command, close_timeout).await;
        match final_response(&sequence.frames, opcode::CLOSE_SESSION) {
            Ok(reply) if reply.is_ok() => {
                info!("PTP session closed");
                true
            }
            Ok(reply) => {
                warn!("CloseSession answered with {:#06X}", reply.code);
                false
            }
            Err(e) => {
                warn!("CloseSession failed: {}", e);
                false
            }
        }
    }

    /// Tear down both sockets and reset session state; safe when already disconnected
    pub async fn close_connections(&mut self, close_session: bool) {
        let has_session = self
            .session
            .as_ref()
            .is_some_and(|session| session.session_id.is_some());
        if close_session && has_session {
            self.close_session(true).await;
        }

        if self.session.take().is_some() {
            info!("PTP/IP sockets closed");
        }
        self.camera = None;
        self.camera_info = None;
    }

    /// Send an operation and collect frames until its response arrives
    ///
    /// On a read timeout the frames collected so far are returned, possibly
    /// none. A lost socket tears the connection down.
    pub async fn execute(&mut self, opcode: u16, params: &[u32]) -> Result<Vec<Frame>, PtpIpError> {
        let response_timeout = self.config.response_timeout;
        let session = self.session.as_mut().ok_or(PtpIpError::NotConnected)?;

        let request = session.transactions.request(opcode, params);
        debug!(
            "-> op {:#06X} tx {} params {:?}",
            opcode, request.transaction_id, params
        );

        if let Err(e) = write_frame(&mut session.command, &request.to_frame()).await {
            warn!("Command socket write failed, dropping connection: {}", e);
            self.session = None;
            return Err(e);
        }

        let sequence = read_response_sequence(&mut session.command, response_timeout).await;
        if sequence.socket_lost {
            warn!("Command socket lost during op {:#06X}", opcode);
            self.session = None;
        }
        Ok(sequence.frames)
    }

    /// Run an operation and decode its final response, whatever the code
    pub async fn execute_for_response(
        &mut self,
        opcode: u16,
        params: &[u32],
    ) -> Result<OperationResponse, PtpIpError> {
        let frames = self.execute(opcode, params).await?;
        final_response(&frames, opcode)
    }

    /// True while both sockets of a completed handshake are held and the
    /// camera has not closed the event socket
    ///
    /// The event socket is watched continuously. A dead command socket is
    /// only noticed by the next operation, which then drops the connection.
    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.event_open.load(Ordering::SeqCst))
    }

    pub fn camera(&self) -> Option<&Camera> {
        self.camera.as_ref()
    }

    pub fn camera_info(&self) -> Option<&CameraInfo> {
        self.camera_info.as_ref()
    }

    pub fn session_id(&self) -> Option<u32> {
        self.session.as_ref().and_then(|s| s.session_id)
    }

    pub fn connection_number(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.connection_number)
    }

    pub fn guid(&self) -> [u8; 16] {
        self.guid
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

}

/// Check that `addr` speaks PTP/IP with a bare Init Command exchange
///
/// The probe socket is dropped straight after the ACK, so the camera never
/// sees an event socket for it.
pub async fn probe_camera<C: Connector>(
    connector: &C,
    addr: SocketAddr,
    guid: [u8; 16],
    host_name: &str,
    timeout: Duration,
) -> Result<InitCommandAck, PtpIpError> {
    let mut stream = connector
        .connect(addr, timeout)
        .await
        .map_err(|e| PtpIpError::Unreachable(format!("{addr}: {e}")))?;
    let request = InitCommandRequest::new(guid, host_name);
    write_frame(&mut stream, &request.to_frame()).await?;
    let reply = read_handshake_frame(&mut stream, timeout).await?;
    InitCommandAck::from_frame(&reply)
}

/// Read and log event frames until the socket fails
fn spawn_event_pump<S>(mut event: S, open: Arc<AtomicBool>) -> JoinHandle<()>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match read_frame(&mut event).await {
                Ok(frame) => debug!(
                    "<- event {:?} ({} bytes)",
                    frame.packet_type,
                    frame.payload.len()
                ),
                Err(e) => {
                    warn!("Event socket closed: {}", e);
                    break;
                }
            }
        }
        open.store(false, Ordering::SeqCst);
    })
}

/// Read one handshake reply, failing with `HandshakeTimeout` after `deadline`
async fn read_handshake_frame<S>(stream: &mut S, deadline: Duration) -> Result<Frame, PtpIpError>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(deadline, read_frame(stream))
        .await
        .map_err(|_| PtpIpError::HandshakeTimeout(deadline.as_millis() as u64))?
}

/// Read frames until an OperationResponse, a timeout, or a socket error
async fn read_response_sequence<S>(stream: &mut S, per_read: Duration) -> ResponseSequence
where
    S: AsyncRead + Unpin,
{
    let mut frames = Vec::new();

    loop {
        match tokio::time::timeout(per_read, read_frame(stream)).await {
            Ok(Ok(frame)) => {
                let done = frame.packet_type == PacketType::OperationResponse;
                debug!(
                    "<- {:?} ({} bytes)",
                    frame.packet_type,
                    frame.payload.len()
                );
                frames.push(frame);
                if done {
                    return ResponseSequence {
                        frames,
                        socket_lost: false,
                    };
                }
            }
            Ok(Err(e)) => {
                warn!("Read failed after {} frames: {}", frames.len(), e);
                return ResponseSequence {
                    frames,
                    socket_lost: true,
                };
            }
            Err(_) => {
                warn!(
                    "No frame within {:?}, returning {} collected",
                    per_read,
                    frames.len()
                );
                return ResponseSequence {
                    frames,
                    socket_lost: false,
                };
            }
        }
    }
}

/// Decode the final OperationResponse of a frame sequence
fn final_response(frames: &[Frame], opcode: u16) -> Result<OperationResponse, PtpIpError> {
    let last = frames.last().ok_or(PtpIpError::NoResponse(opcode))?;
    if last.packet_type != PacketType::OperationResponse {
        return Err(PtpIpError::NoResponse(opcode));
    }
    OperationResponse::from_frame(last)
}

/// Largest data payload in a sequence, without the leading transaction id
fn largest_fragment(frames: &[Frame]) -> Option<&[u8]> {
    let data_frames = frames
        .iter()
        .filter(|f| matches!(f.packet_type, PacketType::Data | PacketType::EndData));

    let largest = data_frames
        .max_by_key(|f| f.payload.len())
        .or_else(|| frames.iter().max_by_key(|f| f.payload.len()))?;

    match largest.packet_type {
        PacketType::Data | PacketType::EndData if largest.payload.len() >= 4 => {
            Some(&largest.payload[4..])
        }
        _ => Some(&largest.payload),
    }
}

fn derive_session_id() -> u32 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    ((millis % 0x7FFF_FFFF) as u32).max(1)
}
