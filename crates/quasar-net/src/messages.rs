//! Wire message framing.
//!
//! Every UDP datagram carries exactly one message:
//!
//! ```text
//! +--------------+---------------------------------------------+
//! | type (8 bits)| type-specific bit-packed payload            |
//! +--------------+---------------------------------------------+
//! ```
//!
//! Link-channeled types additionally carry a channel header between the type
//! byte and the payload: channel kind (2 bits), sequence number (32 bits),
//! receipt flag (1 bit), and the 32-bit receipt id when flagged.
//!
//! Payload layouts for the handshake, discovery, and registry messages are
//! defined here as plain structs with `write`/`read` pairs; everything above
//! this layer treats payloads as opaque [`BitStream`]s.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use quasar_bitstream::{BitStream, BitStreamError};

/// Errors decoding a datagram into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// The datagram was empty.
    #[error("empty datagram")]
    EmptyDatagram,

    /// The leading type byte named no known message type.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// The payload ended early or held invalid data.
    #[error(transparent)]
    Stream(#[from] BitStreamError),
}

/// Message type discriminant, the first byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport-internal.
    ConnectRequest = 0,
    ConnectResponse = 1,
    DisconnectNotice = 2,
    Ack = 3,
    Heartbeat = 4,

    // Host discovery and registry.
    NetHostPing = 5,
    NetHostPong = 6,
    NetHostPublish = 7,
    NetHostRecordList = 8,

    // Game protocol.
    NetEvent = 9,
    NetUserAddRequest = 10,
    NetUserAddResponse = 11,
    NetUserRemoveRequest = 12,
    NetLevelLoadStarted = 13,
    NetLevelLoadFinished = 14,
    NetGameLoadStarted = 15,
    NetGameLoadFinished = 16,

    // Replication.
    ReplicaSpawn = 17,
    ReplicaClone = 18,
    ReplicaForget = 19,
    ReplicaDestroy = 20,
    ReplicaChange = 21,
    ReplicaInterrupt = 22,
}

impl MessageType {
    /// Decodes the wire discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::ConnectRequest,
            1 => Self::ConnectResponse,
            2 => Self::DisconnectNotice,
            3 => Self::Ack,
            4 => Self::Heartbeat,
            5 => Self::NetHostPing,
            6 => Self::NetHostPong,
            7 => Self::NetHostPublish,
            8 => Self::NetHostRecordList,
            9 => Self::NetEvent,
            10 => Self::NetUserAddRequest,
            11 => Self::NetUserAddResponse,
            12 => Self::NetUserRemoveRequest,
            13 => Self::NetLevelLoadStarted,
            14 => Self::NetLevelLoadFinished,
            15 => Self::NetGameLoadStarted,
            16 => Self::NetGameLoadFinished,
            17 => Self::ReplicaSpawn,
            18 => Self::ReplicaClone,
            19 => Self::ReplicaForget,
            20 => Self::ReplicaDestroy,
            21 => Self::ReplicaChange,
            22 => Self::ReplicaInterrupt,
            _ => return None,
        })
    }

    /// True for types that ride a link channel (and so carry the channel
    /// header). Handshake, ack, heartbeat, and the connectionless discovery
    /// messages do not.
    pub fn is_channeled(self) -> bool {
        !matches!(
            self,
            Self::ConnectRequest
                | Self::ConnectResponse
                | Self::DisconnectNotice
                | Self::Ack
                | Self::Heartbeat
                | Self::NetHostPing
                | Self::NetHostPong
                | Self::NetHostPublish
        )
    }
}

/// One wire message: a type and its payload bits.
#[derive(Debug, Clone)]
pub struct Message {
    /// The type discriminant.
    pub ty: MessageType,
    /// Payload, read cursor at the start of the type-specific body.
    pub payload: BitStream,
}

impl Message {
    /// Builds a message from a type and payload.
    pub fn new(ty: MessageType, payload: BitStream) -> Self {
        Self { ty, payload }
    }

    /// Builds a message with an empty payload.
    pub fn empty(ty: MessageType) -> Self {
        Self {
            ty,
            payload: BitStream::new(),
        }
    }
}

/// Disconnect reason carried by a [`MessageType::DisconnectNotice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Graceful, application-requested disconnect.
    Request = 0,
    /// Protocol or deserialization failure.
    Error = 1,
    /// The link went idle past the timeout.
    Timeout = 2,
}

impl DisconnectReason {
    /// Decodes the wire discriminant, defaulting unknown values to `Error`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Request,
            2 => Self::Timeout,
            _ => Self::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake payloads
// ---------------------------------------------------------------------------

/// Body of a [`MessageType::ConnectRequest`].
#[derive(Debug, Clone)]
pub struct ConnectRequestData {
    /// The initiator's peer GUID.
    pub peer_guid: u64,
    /// How many user-add requests will immediately follow this connect.
    pub pending_user_adds: u32,
    /// Application payload bundle.
    pub payload: BitStream,
}

impl ConnectRequestData {
    pub fn write(&self, stream: &mut BitStream) {
        stream.write_u64(self.peer_guid);
        stream.write_u32(self.pending_user_adds);
        stream.write_stream(&self.payload);
    }

    pub fn read(stream: &mut BitStream) -> Result<Self, BitStreamError> {
        Ok(Self {
            peer_guid: stream.read_u64()?,
            pending_user_adds: stream.read_u32()?,
            payload: stream.read_remaining(),
        })
    }
}

/// Body of a [`MessageType::ConnectResponse`].
#[derive(Debug, Clone)]
pub struct ConnectResponseData {
    /// The responder's peer GUID.
    pub peer_guid: u64,
    /// Whether the connection was accepted.
    pub accepted: bool,
    /// The net-peer id the responder assigned to the initiator (servers
    /// assign these; meaningless on deny).
    pub assigned_peer_id: u32,
    /// Application payload bundle.
    pub payload: BitStream,
}

impl ConnectResponseData {
    pub fn write(&self, stream: &mut BitStream) {
        stream.write_u64(self.peer_guid);
        stream.write_bool(self.accepted);
        stream.write_u32(self.assigned_peer_id);
        stream.write_stream(&self.payload);
    }

    pub fn read(stream: &mut BitStream) -> Result<Self, BitStreamError> {
        Ok(Self {
            peer_guid: stream.read_u64()?,
            accepted: stream.read_bool()?,
            assigned_peer_id: stream.read_u32()?,
            payload: stream.read_remaining(),
        })
    }
}

/// Body of a [`MessageType::DisconnectNotice`].
#[derive(Debug, Clone)]
pub struct DisconnectNoticeData {
    /// Why the link is going down.
    pub reason: DisconnectReason,
    /// Application payload bundle.
    pub payload: BitStream,
}

impl DisconnectNoticeData {
    pub fn write(&self, stream: &mut BitStream) {
        stream.write_u8(self.reason as u8);
        stream.write_stream(&self.payload);
    }

    pub fn read(stream: &mut BitStream) -> Result<Self, BitStreamError> {
        Ok(Self {
            reason: DisconnectReason::from_u8(stream.read_u8()?),
            payload: stream.read_remaining(),
        })
    }
}

// ---------------------------------------------------------------------------
// Discovery payloads
// ---------------------------------------------------------------------------

/// Body of [`MessageType::NetHostPing`].
#[derive(Debug, Clone)]
pub struct HostPingData {
    /// The pinger's project GUID.
    pub project_guid: u64,
    /// Pending-ping id this probe belongs to.
    pub ping_id: u32,
    /// Send-attempt id, new for every resend.
    pub send_attempt_id: u32,
    /// Id of the ping manager that sent the probe.
    pub manager_id: u32,
    /// Opaque request bundle.
    pub payload: BitStream,
}

impl HostPingData {
    pub fn write(&self, stream: &mut BitStream) {
        stream.write_u64(self.project_guid);
        stream.write_u32(self.ping_id);
        stream.write_u32(self.send_attempt_id);
        stream.write_u32(self.manager_id);
        stream.write_stream(&self.payload);
    }

    pub fn read(stream: &mut BitStream) -> Result<Self, BitStreamError> {
        Ok(Self {
            project_guid: stream.read_u64()?,
            ping_id: stream.read_u32()?,
            send_attempt_id: stream.read_u32()?,
            manager_id: stream.read_u32()?,
            payload: stream.read_remaining(),
        })
    }
}

/// Body of [`MessageType::NetHostPong`]: the ping echo plus the responder's
/// payload.
pub type HostPongData = HostPingData;

/// Body of [`MessageType::NetHostPublish`].
#[derive(Debug, Clone)]
pub struct HostPublishData {
    /// The publisher's project GUID.
    pub project_guid: u64,
    /// Serialized basic host info.
    pub basic_host_info: BitStream,
}

impl HostPublishData {
    pub fn write(&self, stream: &mut BitStream) {
        stream.write_u64(self.project_guid);
        stream.write_stream(&self.basic_host_info);
    }

    pub fn read(stream: &mut BitStream) -> Result<Self, BitStreamError> {
        Ok(Self {
            project_guid: stream.read_u64()?,
            basic_host_info: stream.read_remaining(),
        })
    }
}

/// One record inside a [`MessageType::NetHostRecordList`].
#[derive(Debug, Clone)]
pub struct HostRecordEntry {
    /// The recorded host's address.
    pub address: SocketAddr,
    /// The host's last published basic info.
    pub basic_host_info: BitStream,
}

/// Body of [`MessageType::NetHostRecordList`].
#[derive(Debug, Clone, Default)]
pub struct HostRecordListData {
    /// Every record the master server holds for the requesting project.
    pub records: Vec<HostRecordEntry>,
}

impl HostRecordListData {
    pub fn write(&self, stream: &mut BitStream) {
        stream.write_u32(self.records.len() as u32);
        for record in &self.records {
            write_socket_addr(stream, record.address);
            let bytes = record.basic_host_info.as_bytes();
            stream.write_u32(bytes.len() as u32);
            stream.write_bytes(bytes);
        }
    }

    pub fn read(stream: &mut BitStream) -> Result<Self, BitStreamError> {
        let count = stream.read_u32()?;
        let mut records = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let address = read_socket_addr(stream)?;
            let len = stream.read_u32()? as usize;
            let bytes = stream.read_bytes(len)?;
            records.push(HostRecordEntry {
                address,
                basic_host_info: BitStream::from_bytes(&bytes),
            });
        }
        Ok(Self { records })
    }
}

// ---------------------------------------------------------------------------
// Address codec
// ---------------------------------------------------------------------------

/// Writes a socket address: one v6 flag bit, the raw octets, then the port.
pub fn write_socket_addr(stream: &mut BitStream, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            stream.write_bool(false);
            stream.write_bytes(&ip.octets());
        }
        IpAddr::V6(ip) => {
            stream.write_bool(true);
            stream.write_bytes(&ip.octets());
        }
    }
    stream.write_u16(addr.port());
}

/// Reads a socket address written by [`write_socket_addr`].
pub fn read_socket_addr(stream: &mut BitStream) -> Result<SocketAddr, BitStreamError> {
    let is_v6 = stream.read_bool()?;
    let ip = if is_v6 {
        let bytes = stream.read_bytes(16)?;
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&bytes);
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        let bytes = stream.read_bytes(4)?;
        let mut octets = [0u8; 4];
        octets.copy_from_slice(&bytes);
        IpAddr::V4(Ipv4Addr::from(octets))
    };
    let port = stream.read_u16()?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for raw in 0u8..=22 {
            let ty = MessageType::from_u8(raw).unwrap();
            assert_eq!(ty as u8, raw);
        }
        assert!(MessageType::from_u8(200).is_none());
    }

    #[test]
    fn test_channeled_split() {
        assert!(!MessageType::ConnectRequest.is_channeled());
        assert!(!MessageType::NetHostPong.is_channeled());
        assert!(MessageType::NetHostRecordList.is_channeled());
        assert!(MessageType::ReplicaSpawn.is_channeled());
        assert!(MessageType::NetEvent.is_channeled());
    }

    #[test]
    fn test_connect_request_roundtrip() {
        let mut payload = BitStream::new();
        payload.write_string("hello");
        let data = ConnectRequestData {
            peer_guid: 0xABCDEF,
            pending_user_adds: 3,
            payload,
        };
        let mut stream = BitStream::new();
        data.write(&mut stream);
        let back = ConnectRequestData::read(&mut stream).unwrap();
        assert_eq!(back.peer_guid, 0xABCDEF);
        assert_eq!(back.pending_user_adds, 3);
        let mut p = back.payload;
        assert_eq!(p.read_string().unwrap(), "hello");
    }

    #[test]
    fn test_host_ping_roundtrip() {
        let data = HostPingData {
            project_guid: 42,
            ping_id: 7,
            send_attempt_id: 8,
            manager_id: 9,
            payload: BitStream::new(),
        };
        let mut stream = BitStream::new();
        data.write(&mut stream);
        let back = HostPingData::read(&mut stream).unwrap();
        assert_eq!(back.project_guid, 42);
        assert_eq!(back.ping_id, 7);
        assert_eq!(back.send_attempt_id, 8);
        assert_eq!(back.manager_id, 9);
        assert!(back.payload.is_empty());
    }

    #[test]
    fn test_socket_addr_roundtrip() {
        let addrs: Vec<SocketAddr> = vec![
            "127.0.0.1:4000".parse().unwrap(),
            "255.255.255.255:0".parse().unwrap(),
            "[::1]:60000".parse().unwrap(),
        ];
        for addr in addrs {
            let mut stream = BitStream::new();
            write_socket_addr(&mut stream, addr);
            assert_eq!(read_socket_addr(&mut stream).unwrap(), addr);
        }
    }

    #[test]
    fn test_record_list_roundtrip() {
        let mut info = BitStream::new();
        info.write_string("HELLO");
        let data = HostRecordListData {
            records: vec![
                HostRecordEntry {
                    address: "10.0.0.1:7000".parse().unwrap(),
                    basic_host_info: info.clone(),
                },
                HostRecordEntry {
                    address: "10.0.0.2:7001".parse().unwrap(),
                    basic_host_info: BitStream::new(),
                },
            ],
        };
        let mut stream = BitStream::new();
        data.write(&mut stream);
        let back = HostRecordListData::read(&mut stream).unwrap();
        assert_eq!(back.records.len(), 2);
        assert_eq!(back.records[0].address, data.records[0].address);
        let mut first = back.records[0].basic_host_info.clone();
        assert_eq!(first.read_string().unwrap(), "HELLO");
        assert!(back.records[1].basic_host_info.is_empty());
    }

    #[test]
    fn test_truncated_body_errors() {
        let mut stream = BitStream::new();
        stream.write_u32(5); // claims a guid but holds half of one
        assert!(HostPingData::read(&mut stream).is_err());
    }
}
