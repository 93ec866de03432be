//! PTP/IP Packet Definitions
//!
//! Every packet on the wire is `[u32 length][u32 type][payload]`, little-endian,
//! where `length` includes the 8-byte header. All functions here are pure.

use crate::error::PtpIpError;
use crate::opcode;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of the length + type header
pub const HEADER_LEN: usize = 8;

/// Largest frame the reader accepts
pub const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

/// PTP/IP protocol version 1.0
pub const PROTOCOL_VERSION: u32 = 0x0001_0000;

/// Data phase value sent with every operation request
pub const DATA_PHASE_NONE: u32 = 1;

/// PTP/IP packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    InitCommandRequest,
    InitCommandAck,
    InitEventRequest,
    InitEventAck,
    InitFail,
    OperationRequest,
    OperationResponse,
    Event,
    StartData,
    Data,
    Cancel,
    EndData,
    ProbeRequest,
    ProbeResponse,
    /// Anything outside the table, kept so the reader can skip it
    Unknown(u32),
}

impl PacketType {
    /// Get the wire value for this packet type
    pub fn code(&self) -> u32 {
        match self {
            PacketType::InitCommandRequest => 1,
            PacketType::InitCommandAck => 2,
            PacketType::InitEventRequest => 3,
            PacketType::InitEventAck => 4,
            PacketType::InitFail => 5,
            PacketType::OperationRequest => 6,
            PacketType::OperationResponse => 7,
            PacketType::Event => 8,
            PacketType::StartData => 9,
            PacketType::Data => 10,
            PacketType::Cancel => 11,
            PacketType::EndData => 12,
            PacketType::ProbeRequest => 13,
            PacketType::ProbeResponse => 14,
            PacketType::Unknown(code) => *code,
        }
    }

    /// Check if this packet carries part of a data phase
    pub fn is_data_phase(&self) -> bool {
        matches!(
            self,
            PacketType::StartData | PacketType::Data | PacketType::EndData
        )
    }
}

impl From<u32> for PacketType {
    fn from(code: u32) -> Self {
        match code {
            1 => PacketType::InitCommandRequest,
            2 => PacketType::InitCommandAck,
            3 => PacketType::InitEventRequest,
            4 => PacketType::InitEventAck,
            5 => PacketType::InitFail,
            6 => PacketType::OperationRequest,
            7 => PacketType::OperationResponse,
            8 => PacketType::Event,
            9 => PacketType::StartData,
            10 => PacketType::Data,
            11 => PacketType::Cancel,
            12 => PacketType::EndData,
            13 => PacketType::ProbeRequest,
            14 => PacketType::ProbeResponse,
            other => PacketType::Unknown(other),
        }
    }
}

/// A single length-prefixed PTP/IP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Packet type from the header
    pub packet_type: PacketType,
    /// Bytes following the header
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame from a type and payload
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            payload,
        }
    }

    /// Total encoded length including the header
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encode header and payload into a single buffer
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u32_le(self.wire_len() as u32);
        buf.put_u32_le(self.packet_type.code());
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Parse an 8-byte header into the packet type and the payload length still to read
    pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(PacketType, usize), PtpIpError> {
        let mut buf = &header[..];
        let length = buf.get_u32_le() as usize;
        let packet_type = PacketType::from(buf.get_u32_le());

        if length < HEADER_LEN {
            return Err(PtpIpError::Malformed(format!(
                "declared length {length} shorter than header"
            )));
        }
        if length > MAX_PACKET_LEN {
            return Err(PtpIpError::Malformed(format!(
                "declared length {length} exceeds {MAX_PACKET_LEN}"
            )));
        }

        Ok((packet_type, length - HEADER_LEN))
    }

    /// Decode one complete frame from the start of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, PtpIpError> {
        let header: &[u8; HEADER_LEN] = bytes
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| PtpIpError::Malformed("frame shorter than header".to_string()))?;
        let (packet_type, payload_len) = Self::parse_header(header)?;

        let payload = bytes
            .get(HEADER_LEN..HEADER_LEN + payload_len)
            .ok_or_else(|| PtpIpError::Malformed("truncated payload".to_string()))?;

        Ok(Self::new(packet_type, payload.to_vec()))
    }

    fn expect(&self, expected: PacketType) -> Result<(), PtpIpError> {
        if self.packet_type != expected {
            return Err(PtpIpError::ProtocolMismatch {
                expected: expected.code(),
                actual: self.packet_type.code(),
            });
        }
        Ok(())
    }
}

/// Init Command Request, sent first on the command socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCommandRequest {
    /// Host GUID the camera uses to recognise paired clients
    pub guid: [u8; 16],
    /// Friendly host name shown on the camera
    pub host_name: String,
    /// Protocol version, normally [`PROTOCOL_VERSION`]
    pub protocol_version: u32,
}

impl InitCommandRequest {
    pub fn new(guid: [u8; 16], host_name: &str) -> Self {
        Self {
            guid,
            host_name: host_name.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_slice(&self.guid);
        put_utf16z(&mut buf, &self.host_name);
        buf.put_u32_le(self.protocol_version);
        Frame::new(PacketType::InitCommandRequest, buf.to_vec())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, PtpIpError> {
        frame.expect(PacketType::InitCommandRequest)?;
        let mut buf = &frame.payload[..];
        let guid = take_guid(&mut buf)?;
        let host_name = take_utf16z(&mut buf)?;
        let protocol_version = take_u32(&mut buf)?;
        Ok(Self {
            guid,
            host_name,
            protocol_version,
        })
    }
}

/// Init Command Ack, the camera's answer on the command socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCommandAck {
    /// Connection number that correlates the event socket
    pub connection_number: u32,
    pub guid: [u8; 16],
    pub camera_name: String,
    pub protocol_version: u32,
}

impl InitCommandAck {
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.connection_number);
        buf.put_slice(&self.guid);
        put_utf16z(&mut buf, &self.camera_name);
        buf.put_u32_le(self.protocol_version);
        Frame::new(PacketType::InitCommandAck, buf.to_vec())
    }

    /// Decode an ack. Only the connection number is required; some firmware
    /// truncates the trailing identity fields.
    pub fn from_frame(frame: &Frame) -> Result<Self, PtpIpError> {
        if frame.packet_type == PacketType::InitFail {
            return Err(PtpIpError::InitRejected(init_fail_reason(frame)));
        }
        frame.expect(PacketType::InitCommandAck)?;

        let mut buf = &frame.payload[..];
        let connection_number = take_u32(&mut buf)?;
        let guid = take_guid(&mut buf).unwrap_or_default();
        let camera_name = take_utf16z(&mut buf).unwrap_or_default();
        let protocol_version = take_u32(&mut buf).unwrap_or(PROTOCOL_VERSION);

        Ok(Self {
            connection_number,
            guid,
            camera_name,
            protocol_version,
        })
    }
}

/// Init Event Request, sent on the event socket with the command connection number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitEventRequest {
    pub connection_number: u32,
}

impl InitEventRequest {
    pub fn to_frame(&self) -> Frame {
        Frame::new(
            PacketType::InitEventRequest,
            self.connection_number.to_le_bytes().to_vec(),
        )
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, PtpIpError> {
        frame.expect(PacketType::InitEventRequest)?;
        let mut buf = &frame.payload[..];
        Ok(Self {
            connection_number: take_u32(&mut buf)?,
        })
    }
}

/// Check that a frame is an Init Event Ack
pub fn expect_init_event_ack(frame: &Frame) -> Result<(), PtpIpError> {
    if frame.packet_type == PacketType::InitFail {
        return Err(PtpIpError::InitRejected(init_fail_reason(frame)));
    }
    frame.expect(PacketType::InitEventAck)
}

/// Reason code carried by an InitFail packet, zero when absent
pub fn init_fail_reason(frame: &Frame) -> u32 {
    let mut buf = &frame.payload[..];
    take_u32(&mut buf).unwrap_or(0)
}

/// PTP operation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub data_phase: u32,
    pub opcode: u16,
    pub transaction_id: u32,
    pub params: Vec<u32>,
}

impl OperationRequest {
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(10 + self.params.len() * 4);
        buf.put_u32_le(self.data_phase);
        buf.put_u16_le(self.opcode);
        buf.put_u32_le(self.transaction_id);
        for param in &self.params {
            buf.put_u32_le(*param);
        }
        Frame::new(PacketType::OperationRequest, buf.to_vec())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, PtpIpError> {
        frame.expect(PacketType::OperationRequest)?;
        let mut buf = &frame.payload[..];
        let data_phase = take_u32(&mut buf)?;
        let opcode = take_u16(&mut buf)?;
        let transaction_id = take_u32(&mut buf)?;
        Ok(Self {
            data_phase,
            opcode,
            transaction_id,
            params: take_params(&mut buf),
        })
    }
}

/// PTP operation response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResponse {
    pub code: u16,
    pub transaction_id: u32,
    pub params: Vec<u32>,
}

impl OperationResponse {
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(6 + self.params.len() * 4);
        buf.put_u16_le(self.code);
        buf.put_u32_le(self.transaction_id);
        for param in &self.params {
            buf.put_u32_le(*param);
        }
        Frame::new(PacketType::OperationResponse, buf.to_vec())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, PtpIpError> {
        frame.expect(PacketType::OperationResponse)?;
        let mut buf = &frame.payload[..];
        let code = take_u16(&mut buf)?;
        let transaction_id = take_u32(&mut buf)?;
        Ok(Self {
            code,
            transaction_id,
            params: take_params(&mut buf),
        })
    }

    /// Check if the camera reported success
    pub fn is_ok(&self) -> bool {
        self.code == crate::response::OK
    }
}

/// Per-session transaction id allocator
///
/// OpenSession always travels with id 0 and leaves the sequence alone; every
/// other operation takes the next id, so no id repeats before the counter
/// wraps. 0xFFFFFFFF is reserved, so the counter wraps to 1.
#[derive(Debug, Clone, Default)]
pub struct TransactionCounter {
    current: u32,
}

impl TransactionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the transaction id for `opcode`
    pub fn next_for(&mut self, opcode: u16) -> u32 {
        if opcode == opcode::OPEN_SESSION {
            return 0;
        }
        self.current = match self.current.wrapping_add(1) {
            0 | u32::MAX => 1,
            id => id,
        };
        self.current
    }

    /// Build an operation request with a freshly allocated id
    pub fn request(&mut self, opcode: u16, params: &[u32]) -> OperationRequest {
        OperationRequest {
            data_phase: DATA_PHASE_NONE,
            opcode,
            transaction_id: self.next_for(opcode),
            params: params.to_vec(),
        }
    }

    /// Last id handed out
    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }
}

fn put_utf16z(buf: &mut BytesMut, text: &str) {
    for unit in text.encode_utf16() {
        buf.put_u16_le(unit);
    }
    buf.put_u16_le(0);
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, PtpIpError> {
    if buf.remaining() < 2 {
        return Err(PtpIpError::Malformed("expected u16".to_string()));
    }
    Ok(buf.get_u16_le())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, PtpIpError> {
    if buf.remaining() < 4 {
        return Err(PtpIpError::Malformed("expected u32".to_string()));
    }
    Ok(buf.get_u32_le())
}

fn take_guid(buf: &mut &[u8]) -> Result<[u8; 16], PtpIpError> {
    if buf.remaining() < 16 {
        return Err(PtpIpError::Malformed("expected 16-byte GUID".to_string()));
    }
    let mut guid = [0u8; 16];
    buf.copy_to_slice(&mut guid);
    Ok(guid)
}

fn take_utf16z(buf: &mut &[u8]) -> Result<String, PtpIpError> {
    let mut units = Vec::new();
    loop {
        let unit = take_u16(buf)
            .map_err(|_| PtpIpError::Malformed("unterminated UTF-16 string".to_string()))?;
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    Ok(String::from_utf16_lossy(&units))
}

fn take_params(buf: &mut &[u8]) -> Vec<u32> {
    let mut params = Vec::with_capacity(buf.remaining() / 4);
    while buf.remaining() >= 4 {
        params.push(buf.get_u32_le());
    }
    params
}
