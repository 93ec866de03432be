//! In-Memory PTP/IP Camera
//!
//! A scripted camera reachable through [`FakeConnector`]. Every connect call
//! yields one side of a `tokio::io::duplex` pipe while a spawned task plays the
//! camera on the other side and records each frame it receives.
//!
//! The camera also notices requests that arrive on one connection while a
//! request on another connection is still unanswered, which only happens
//! when two callers drive it at once.

use crate::codec::{
    Frame, InitCommandAck, InitEventRequest, OperationRequest, OperationResponse, PacketType,
    PROTOCOL_VERSION,
};
use crate::transport::{read_frame, write_frame, Connector};
use crate::{nikon, opcode, response};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::watch;

/// Scripted camera behaviour
#[derive(Debug, Clone)]
pub struct FakeCamera {
    /// Blob returned for GetDeviceInfo
    pub device_info: Vec<u8>,
    /// Refuse every TCP connection
    pub refuse_connections: bool,
    /// Answer Init Command Requests at all
    pub answer_init: bool,
    /// Answer Init Command Requests with InitFail
    pub reject_init: bool,
    /// Response code for OpenSession
    pub open_session_code: u16,
    /// Response codes for successive Nikon DeviceReady polls; OK once exhausted
    pub device_ready_codes: Vec<u16>,
}

impl Default for FakeCamera {
    fn default() -> Self {
        Self {
            device_info: sample_device_info("Canon Inc.", "R5", "V1.8.1", "0123456789"),
            refuse_connections: false,
            answer_init: true,
            reject_init: false,
            open_session_code: response::OK,
            device_ready_codes: Vec::new(),
        }
    }
}

/// One frame received by the fake camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    /// Id of the connection the frame arrived on, starting at 1
    pub connection: u32,
    pub packet_type: PacketType,
    /// Connection number carried by an Init Event Request
    pub connection_number: Option<u32>,
    pub opcode: u16,
    pub transaction_id: u32,
    pub params: Vec<u32>,
}

struct FakeState {
    camera: FakeCamera,
    device_ready: Mutex<VecDeque<u16>>,
    records: Mutex<Vec<WireRecord>>,
    next_connection: AtomicU32,
    connects: AtomicUsize,
    open: AtomicUsize,
    refuse: AtomicBool,
    mute_operations: AtomicBool,
    /// Connection whose request is still waiting for a reply
    in_flight: Mutex<Option<u32>>,
    overlaps: AtomicUsize,
    /// Bumped by `hang_up`; connections opened earlier close
    hangup: watch::Sender<u64>,
}

/// Connector that reaches a [`FakeCamera`] at any address
#[derive(Clone)]
pub struct FakeConnector {
    state: Arc<FakeState>,
}

impl FakeConnector {
    pub fn new(camera: FakeCamera) -> Self {
        Self {
            state: Arc::new(FakeState {
                device_ready: Mutex::new(camera.device_ready_codes.iter().copied().collect()),
                refuse: AtomicBool::new(camera.refuse_connections),
                camera,
                records: Mutex::new(Vec::new()),
                next_connection: AtomicU32::new(1),
                connects: AtomicUsize::new(0),
                open: AtomicUsize::new(0),
                mute_operations: AtomicBool::new(false),
                in_flight: Mutex::new(None),
                overlaps: AtomicUsize::new(0),
                hangup: watch::Sender::new(0),
            }),
        }
    }

    /// Every frame received so far, in arrival order
    pub fn records(&self) -> Vec<WireRecord> {
        self.state
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Only the operation requests
    pub fn operations(&self) -> Vec<WireRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.packet_type == PacketType::OperationRequest)
            .collect()
    }

    /// Number of connect attempts, refused ones included
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Stop answering operation requests
    pub fn set_mute_operations(&self, mute: bool) {
        self.state.mute_operations.store(mute, Ordering::SeqCst);
    }

    /// Connections the camera side still holds open
    pub fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Requests that arrived while another connection's request was unanswered
    pub fn overlapping_requests(&self) -> usize {
        self.state.overlaps.load(Ordering::SeqCst)
    }

    /// Close every connection opened so far from the camera side
    pub fn hang_up(&self) {
        self.state.hangup.send_modify(|generation| *generation += 1);
    }
}

impl Connector for FakeConnector {
    type Stream = DuplexStream;

    async fn connect(&self, _addr: SocketAddr, _timeout: Duration) -> io::Result<DuplexStream> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "fake camera refused",
            ));
        }

        let (client, server) = tokio::io::duplex(256 * 1024);
        let id = self.state.next_connection.fetch_add(1, Ordering::SeqCst);
        let generation = *self.state.hangup.borrow();
        self.state.open.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(server, id, generation, self.state.clone()));
        Ok(client)
    }
}

async fn serve(mut stream: DuplexStream, connection: u32, generation: u64, state: Arc<FakeState>) {
    let mut hangup = state.hangup.subscribe();

    loop {
        let frame = tokio::select! {
            read = read_frame(&mut stream) => match read {
                Ok(frame) => frame,
                Err(_) => break,
            },
            _ = hung_up(&mut hangup, generation) => break,
        };

        let request = OperationRequest::from_frame(&frame).ok();
        let event_request = InitEventRequest::from_frame(&frame).ok();
        record(&state, connection, &frame, request.as_ref(), event_request);
        claim(&state, connection);

        let replies = match frame.packet_type {
            PacketType::InitCommandRequest => init_command_reply(&state, connection),
            PacketType::InitEventRequest => vec![Frame::new(PacketType::InitEventAck, Vec::new())],
            PacketType::OperationRequest => match request {
                Some(_) if state.mute_operations.load(Ordering::SeqCst) => Vec::new(),
                Some(request) => operation_reply(&state, &request),
                None => Vec::new(),
            },
            _ => Vec::new(),
        };

        // released before replying so the next request can never race it
        if !replies.is_empty() {
            release(&state, connection);
        }
        let mut lost = false;
        for reply in replies {
            if write_frame(&mut stream, &reply).await.is_err() {
                lost = true;
                break;
            }
        }
        if lost {
            break;
        }
    }

    release(&state, connection);
    state.open.fetch_sub(1, Ordering::SeqCst);
}

async fn hung_up(hangup: &mut watch::Receiver<u64>, generation: u64) {
    loop {
        let current = *hangup.borrow_and_update();
        if current != generation {
            return;
        }
        if hangup.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn claim(state: &FakeState, connection: u32) {
    let mut in_flight = state.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    if in_flight.is_some_and(|owner| owner != connection) {
        state.overlaps.fetch_add(1, Ordering::SeqCst);
    }
    *in_flight = Some(connection);
}

fn release(state: &FakeState, connection: u32) {
    let mut in_flight = state.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    if *in_flight == Some(connection) {
        *in_flight = None;
    }
}

fn record(
    state: &FakeState,
    connection: u32,
    frame: &Frame,
    request: Option<&OperationRequest>,
    event_request: Option<InitEventRequest>,
) {
    let record = WireRecord {
        connection,
        packet_type: frame.packet_type,
        connection_number: event_request.map(|r| r.connection_number),
        opcode: request.map(|r| r.opcode).unwrap_or(0),
        transaction_id: request.map(|r| r.transaction_id).unwrap_or(0),
        params: request.map(|r| r.params.clone()).unwrap_or_default(),
    };
    state
        .records
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(record);
}

fn init_command_reply(state: &FakeState, connection: u32) -> Vec<Frame> {
    if !state.camera.answer_init {
        return Vec::new();
    }
    if state.camera.reject_init {
        return vec![Frame::new(
            PacketType::InitFail,
            1u32.to_le_bytes().to_vec(),
        )];
    }
    let ack = InitCommandAck {
        connection_number: connection,
        guid: [0x5A; 16],
        camera_name: "fake-camera".to_string(),
        protocol_version: PROTOCOL_VERSION,
    };
    vec![ack.to_frame()]
}

fn operation_reply(state: &FakeState, request: &OperationRequest) -> Vec<Frame> {
    let tid = request.transaction_id;
    let reply = |code: u16| OperationResponse {
        code,
        transaction_id: tid,
        params: Vec::new(),
    };

    match request.opcode {
        opcode::GET_DEVICE_INFO => {
            let blob = &state.camera.device_info;
            let mut start = tid.to_le_bytes().to_vec();
            start.extend_from_slice(&(blob.len() as u64).to_le_bytes());
            let mut end = tid.to_le_bytes().to_vec();
            end.extend_from_slice(blob);
            vec![
                Frame::new(PacketType::StartData, start),
                Frame::new(PacketType::EndData, end),
                reply(response::OK).to_frame(),
            ]
        }
        opcode::OPEN_SESSION => vec![reply(state.camera.open_session_code).to_frame()],
        nikon::DEVICE_READY => {
            let code = state
                .device_ready
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or(response::OK);
            vec![reply(code).to_frame()]
        }
        _ => vec![reply(response::OK).to_frame()],
    }
}

/// Build a device-info blob holding the given identity strings
pub fn sample_device_info(manufacturer: &str, model: &str, version: &str, serial: &str) -> Vec<u8> {
    // standard version, vendor extension id and version, functional mode
    let mut blob = vec![0x64, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x64, 0x00];
    for text in [manufacturer, model, version, serial] {
        blob.push((text.encode_utf16().count() + 1) as u8);
        for unit in text.encode_utf16() {
            blob.extend_from_slice(&unit.to_le_bytes());
        }
        blob.extend_from_slice(&[0, 0]);
    }
    blob
}
