//! RCON packet framing.
//!
//! Every packet on the wire is little-endian:
//!
//! ```text
//! [i32 size][i32 request id][i32 type][body bytes][0x00][0x00]
//! ```
//!
//! `size` counts everything after itself, so the smallest legal packet (empty
//! body) declares a size of 10. Decoding never consumes bytes from the buffer
//! until a whole frame is present, which makes it safe to call again after
//! every socket read regardless of how the stream was fragmented.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Request id + type fields.
pub const HEADER_LEN: usize = 8;
/// Body NUL plus the trailing empty-string NUL.
pub const TERMINATOR_LEN: usize = 2;
/// Smallest declared size: a packet with an empty body.
pub const MIN_PACKET_SIZE: usize = HEADER_LEN + TERMINATOR_LEN;
/// Safety ceiling for a declared size. Anything above this means the stream
/// is desynchronized.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;
/// Largest body a game server places in a single response frame before it
/// splits the output across several frames.
pub const MAX_SERVER_BODY: usize = 4096 - MIN_PACKET_SIZE;

/// Which side produced the bytes being decoded.
///
/// Type value 2 means `ExecCommand` when sent to a server and `AuthResponse`
/// when sent by one, so the decoder has to know the direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToServer,
    FromServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Auth,
    AuthResponse,
    ExecCommand,
    ResponseValue,
    Unknown(i32),
}

impl PacketType {
    pub fn to_wire(self) -> i32 {
        match self {
            PacketType::Auth => 3,
            PacketType::AuthResponse | PacketType::ExecCommand => 2,
            PacketType::ResponseValue => 0,
            PacketType::Unknown(raw) => raw,
        }
    }

    pub fn from_wire(raw: i32, direction: Direction) -> Self {
        match (raw, direction) {
            (3, _) => PacketType::Auth,
            (2, Direction::ToServer) => PacketType::ExecCommand,
            (2, Direction::FromServer) => PacketType::AuthResponse,
            (0, _) => PacketType::ResponseValue,
            (other, _) => PacketType::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: PacketType,
    pub body: String,
}

impl Packet {
    pub fn new(id: i32, kind: PacketType, body: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
        }
    }

    pub fn auth(id: i32, password: &str) -> Self {
        Self::new(id, PacketType::Auth, password)
    }

    pub fn command(id: i32, text: &str) -> Self {
        Self::new(id, PacketType::ExecCommand, text)
    }

    pub fn response(id: i32, body: impl Into<String>) -> Self {
        Self::new(id, PacketType::ResponseValue, body)
    }

    /// Value of the leading size field for this packet.
    pub fn declared_size(&self) -> usize {
        HEADER_LEN + self.body.len() + TERMINATOR_LEN
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("declared frame size {declared} outside {min}..={max}")]
    FrameSize {
        declared: i64,
        min: usize,
        max: usize,
    },

    #[error("frame {id} is missing its NUL terminators")]
    MissingTerminator { id: i32 },

    #[error("body of {len} bytes does not fit in a {max} byte frame")]
    BodyTooLarge { len: usize, max: usize },
}

/// Appends the wire form of `packet` to `dst`.
pub fn encode(packet: &Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
    let size = packet.declared_size();
    if size > MAX_PACKET_SIZE {
        return Err(CodecError::BodyTooLarge {
            len: packet.body.len(),
            max: MAX_PACKET_SIZE - MIN_PACKET_SIZE,
        });
    }

    dst.reserve(4 + size);
    dst.put_i32_le(size as i32);
    dst.put_i32_le(packet.id);
    dst.put_i32_le(packet.kind.to_wire());
    dst.put_slice(packet.body.as_bytes());
    dst.put_u8(0);
    dst.put_u8(0);
    Ok(())
}

pub fn encode_to_vec(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::with_capacity(4 + packet.declared_size());
    encode(packet, &mut buf)?;
    Ok(buf.to_vec())
}

/// Decodes one frame from the front of `src`.
///
/// Returns `Ok(None)` when more bytes are needed; in that case `src` is left
/// untouched. A declared size outside the legal range is an error and the
/// caller is expected to drop the connection.
pub fn decode(
    src: &mut BytesMut,
    direction: Direction,
    max_size: usize,
) -> Result<Option<Packet>, CodecError> {
    if src.len() < 4 {
        return Ok(None);
    }

    let declared = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    if declared < MIN_PACKET_SIZE as i32 || declared as usize > max_size {
        return Err(CodecError::FrameSize {
            declared: declared as i64,
            min: MIN_PACKET_SIZE,
            max: max_size,
        });
    }

    let size = declared as usize;
    if src.len() < 4 + size {
        return Ok(None);
    }

    src.advance(4);
    let mut frame = src.split_to(size);
    let id = frame.get_i32_le();
    let raw_type = frame.get_i32_le();

    let body_len = size - MIN_PACKET_SIZE;
    if frame[body_len] != 0 || frame[body_len + 1] != 0 {
        return Err(CodecError::MissingTerminator { id });
    }
    let body = String::from_utf8_lossy(&frame[..body_len]).into_owned();

    Ok(Some(Packet {
        id,
        kind: PacketType::from_wire(raw_type, direction),
        body,
    }))
}

/// Accumulates socket reads and yields complete packets.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    direction: Direction,
    max_size: usize,
}

impl FrameDecoder {
    pub fn new(direction: Direction) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            direction,
            max_size: MAX_PACKET_SIZE,
        }
    }

    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = max.max(MIN_PACKET_SIZE);
        self
    }

    /// Buffer to read socket bytes into (`AsyncReadExt::read_buf`).
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_packet(&mut self) -> Result<Option<Packet>, CodecError> {
        decode(&mut self.buf, self.direction, self.max_size)
    }

    /// Bytes of an incomplete frame still waiting for the rest.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
