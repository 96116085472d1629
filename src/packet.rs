//! uTP packet encoding and decoding (BEP 29)
//!
//! uTP uses a 20-byte big-endian header followed by an optional extension
//! chain and the payload. Extensions are carried opaquely: the codec
//! preserves them byte for byte but the engine ignores their contents.

use bytes::Bytes;

use crate::error::{Result, UtpError};

/// uTP packet header size
pub const HEADER_SIZE: usize = 20;

/// uTP protocol version
pub const UTP_VERSION: u8 = 1;

/// Packet type values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Regular data packet
    Data = 0,
    /// Connection teardown
    Fin = 1,
    /// Acknowledgment (no payload)
    State = 2,
    /// Connection reset
    Reset = 3,
    /// Connection initiation
    Syn = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = UtpError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Fin),
            2 => Ok(Self::State),
            3 => Ok(Self::Reset),
            4 => Ok(Self::Syn),
            _ => Err(UtpError::invalid_packet(format!(
                "unknown packet type: {}",
                value
            ))),
        }
    }
}

/// One link of the extension chain, carried opaquely.
///
/// `kind` 0 terminates the chain on the wire and never appears here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub kind: u8,
    pub data: Vec<u8>,
}

/// uTP packet header and data
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Packet type (high nibble of byte 0)
    pub packet_type: PacketType,

    /// Connection ID
    pub connection_id: u16,

    /// Microsecond timestamp at send time
    pub timestamp_us: u32,

    /// Difference between the peer's timestamp and ours, microseconds
    pub timestamp_diff_us: u32,

    /// Advertised receive window in bytes
    pub wnd_size: u32,

    /// Sequence number
    pub seq_no: u16,

    /// Acknowledgment number (last received sequence)
    pub ack_no: u16,

    /// Extension chain, preserved but not interpreted
    pub extensions: Vec<Extension>,

    /// Packet payload
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet with zeroed timestamps and window
    pub fn new(packet_type: PacketType, connection_id: u16, seq_no: u16, ack_no: u16) -> Self {
        Self {
            packet_type,
            connection_id,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: 0,
            seq_no,
            ack_no,
            extensions: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// Create a SYN packet to initiate a connection
    pub fn syn(connection_id: u16, seq_no: u16) -> Self {
        Self::new(PacketType::Syn, connection_id, seq_no, 0)
    }

    /// Create a STATE packet (pure acknowledgment)
    pub fn state(connection_id: u16, seq_no: u16, ack_no: u16) -> Self {
        Self::new(PacketType::State, connection_id, seq_no, ack_no)
    }

    /// Create a DATA packet
    pub fn data(connection_id: u16, seq_no: u16, ack_no: u16, payload: Bytes) -> Self {
        let mut pkt = Self::new(PacketType::Data, connection_id, seq_no, ack_no);
        pkt.payload = payload;
        pkt
    }

    /// Create a FIN packet
    pub fn fin(connection_id: u16, seq_no: u16, ack_no: u16) -> Self {
        Self::new(PacketType::Fin, connection_id, seq_no, ack_no)
    }

    /// Create a RESET packet
    pub fn reset(connection_id: u16, seq_no: u16, ack_no: u16) -> Self {
        Self::new(PacketType::Reset, connection_id, seq_no, ack_no)
    }

    /// Set window size
    pub fn with_window(mut self, wnd_size: u32) -> Self {
        self.wnd_size = wnd_size;
        self
    }

    /// Set timestamps
    pub fn with_timestamps(mut self, timestamp_us: u32, timestamp_diff_us: u32) -> Self {
        self.timestamp_us = timestamp_us;
        self.timestamp_diff_us = timestamp_diff_us;
        self
    }

    /// Encode the packet to bytes
    pub fn encode(&self) -> Vec<u8> {
        let ext_len: usize = self.extensions.iter().map(|e| 2 + e.data.len()).sum();
        let mut buf = Vec::with_capacity(HEADER_SIZE + ext_len + self.payload.len());

        // Byte 0: type (4 bits) | version (4 bits)
        buf.push((self.packet_type as u8) << 4 | UTP_VERSION);

        // Byte 1: kind of the first extension, 0 when none
        buf.push(self.extensions.first().map_or(0, |e| e.kind));

        buf.extend_from_slice(&self.connection_id.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_us.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_diff_us.to_be_bytes());
        buf.extend_from_slice(&self.wnd_size.to_be_bytes());
        buf.extend_from_slice(&self.seq_no.to_be_bytes());
        buf.extend_from_slice(&self.ack_no.to_be_bytes());

        // Extension chain: each record names the kind of the next one
        for (i, ext) in self.extensions.iter().enumerate() {
            let next_kind = self.extensions.get(i + 1).map_or(0, |e| e.kind);
            buf.push(next_kind);
            buf.push(ext.data.len() as u8);
            buf.extend_from_slice(&ext.data);
        }

        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a packet from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(UtpError::invalid_packet(format!(
                "packet too short: {} bytes",
                data.len()
            )));
        }

        let type_ver = data[0];
        let packet_type = PacketType::try_from(type_ver >> 4)?;
        let version = type_ver & 0x0F;
        if version != UTP_VERSION {
            return Err(UtpError::invalid_packet(format!(
                "unsupported uTP version: {}",
                version
            )));
        }

        let connection_id = u16::from_be_bytes([data[2], data[3]]);
        let timestamp_us = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let timestamp_diff_us = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let wnd_size = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
        let seq_no = u16::from_be_bytes([data[16], data[17]]);
        let ack_no = u16::from_be_bytes([data[18], data[19]]);

        // Walk the extension chain; kinds we do not know are kept as-is
        let mut extensions = Vec::new();
        let mut kind = data[1];
        let mut offset = HEADER_SIZE;
        while kind != 0 {
            if offset + 2 > data.len() {
                return Err(UtpError::invalid_packet("extension header truncated"));
            }
            let next_kind = data[offset];
            let len = data[offset + 1] as usize;
            offset += 2;
            if offset + len > data.len() {
                return Err(UtpError::invalid_packet("extension data truncated"));
            }
            extensions.push(Extension {
                kind,
                data: data[offset..offset + len].to_vec(),
            });
            offset += len;
            kind = next_kind;
        }

        let payload = Bytes::copy_from_slice(&data[offset..]);

        Ok(Self {
            packet_type,
            connection_id,
            timestamp_us,
            timestamp_diff_us,
            wnd_size,
            seq_no,
            ack_no,
            extensions,
            payload,
        })
    }

    /// Check if this is a SYN packet
    pub fn is_syn(&self) -> bool {
        self.packet_type == PacketType::Syn
    }

    /// Check if this is a FIN packet
    pub fn is_fin(&self) -> bool {
        self.packet_type == PacketType::Fin
    }

    /// Check if this is a RESET packet
    pub fn is_reset(&self) -> bool {
        self.packet_type == PacketType::Reset
    }

    /// Check if this is a STATE (ACK) packet
    pub fn is_state(&self) -> bool {
        self.packet_type == PacketType::State
    }

    /// Check if this is a DATA packet
    pub fn is_data(&self) -> bool {
        self.packet_type == PacketType::Data
    }
}

/// Get the current wall-clock timestamp in microseconds, truncated to 32 bits
pub fn timestamp_micros() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (duration.as_micros() & 0xFFFF_FFFF) as u32
}
