use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Packet header size (stream_id + flag + length)
pub const HEADER_SIZE: usize = 13;

/// Stream ID carried by packets that address the link rather than a stream
pub const LINK_STREAM_ID: u64 = 0;

/// Packet flag. Flags are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    /// Payload for `stream_id`
    None = 0,
    /// Link keepalive
    Ping = 1,
    /// Peer closed `stream_id`
    Close = 2,
}

impl TryFrom<u8> for Flag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Flag::None),
            1 => Ok(Flag::Ping),
            2 => Ok(Flag::Close),
            other => Err(Error::Protocol(format!("Unknown packet flag {:#04x}", other))),
        }
    }
}

/// Protocol packet
///
/// Wire format:
/// ```text
/// [stream_id: u64][flag: u8][length: u32][payload: bytes]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Stream identifier
    pub stream_id: u64,

    /// Packet flag
    pub flag: Flag,

    /// Data payload, empty for ping and close
    pub payload: Bytes,
}

impl Packet {
    /// Create a data packet
    pub fn data(stream_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            flag: Flag::None,
            payload: payload.into(),
        }
    }

    /// Create a keepalive packet
    pub fn ping() -> Self {
        Self {
            stream_id: LINK_STREAM_ID,
            flag: Flag::Ping,
            payload: Bytes::new(),
        }
    }

    /// Create a packet telling the peer `stream_id` is gone
    pub fn close(stream_id: u64) -> Self {
        Self {
            stream_id,
            flag: Flag::Close,
            payload: Bytes::new(),
        }
    }

    pub fn is_ping(&self) -> bool {
        self.flag == Flag::Ping
    }

    pub fn is_close(&self) -> bool {
        self.flag == Flag::Close
    }
}

/// Frames [`Packet`]s over a byte stream.
///
/// Any decode error is fatal to the link: after one, the byte stream is no
/// longer aligned to packet boundaries.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_payload_size: usize,
}

impl PacketCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(crate::Config::default().max_payload_size)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        let len = packet.payload.len();
        if len > self.max_payload_size {
            return Err(Error::PacketTooLarge(len, self.max_payload_size));
        }
        if packet.flag != Flag::None && len != 0 {
            return Err(Error::Protocol(format!(
                "{:?} packet must not carry a payload",
                packet.flag
            )));
        }

        dst.reserve(HEADER_SIZE + len);
        dst.put_u64(packet.stream_id);
        dst.put_u8(packet.flag as u8);
        dst.put_u32(len as u32);
        dst.put_slice(&packet.payload);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek the header without consuming, the payload may not be here yet
        let mut header = &src[..HEADER_SIZE];
        let stream_id = header.get_u64();
        let flag = Flag::try_from(header.get_u8())?;
        let len = header.get_u32() as usize;

        if len > self.max_payload_size {
            return Err(Error::PacketTooLarge(len, self.max_payload_size));
        }
        if flag != Flag::None && len != 0 {
            return Err(Error::Protocol(format!(
                "{:?} packet carries {} payload bytes",
                flag, len
            )));
        }

        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Ok(Some(Packet {
            stream_id,
            flag,
            payload,
        }))
    }
}
