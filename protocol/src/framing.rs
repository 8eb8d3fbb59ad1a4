//! Wire framing.
//!
//! Every frame is a tag byte followed by a tag-specific body. On TCP the
//! frame is preceded by a 4-byte big-endian length prefix; on UDP one
//! datagram carries exactly one frame and needs no prefix.

use crate::error::ProtocolError;
use crate::packets::ControlPacket;
use crate::stream::{StreamChunk, StreamHead};
use crate::types::ConnectionId;

/// Maximum size of a single wire frame. Anything larger must go through
/// the stream layer, which carries a logical frame as many small ones.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const TAG_RAW: u8 = 0x00;
const TAG_CONTROL: u8 = 0x01;
const TAG_STREAM_HEAD: u8 = 0x02;
const TAG_STREAM_CHUNK: u8 = 0x03;
const TAG_TEXT: u8 = 0x04;
const TAG_UDP_REGISTER: u8 = 0x05;
const TAG_DISCOVERY: u8 = 0x06;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Opaque game payload.
    Raw(Vec<u8>),
    /// Typed relay packet.
    Control(ControlPacket),
    StreamHead(StreamHead),
    StreamChunk(StreamChunk),
    /// Unstructured text. Only pre-protocol clients send this.
    Text(String),
    /// Binds the sender's UDP address to its connection.
    UdpRegister { con_id: ConnectionId },
    /// Discovery ping; answered with the fixed discovery response.
    Discovery,
}

impl Frame {
    /// The tag byte this frame is encoded with.
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Raw(_) => TAG_RAW,
            Frame::Control(_) => TAG_CONTROL,
            Frame::StreamHead(_) => TAG_STREAM_HEAD,
            Frame::StreamChunk(_) => TAG_STREAM_CHUNK,
            Frame::Text(_) => TAG_TEXT,
            Frame::UdpRegister { .. } => TAG_UDP_REGISTER,
            Frame::Discovery => TAG_DISCOVERY,
        }
    }
}

/// Encode a frame into tag + body bytes (no length prefix).
///
/// The [`MAX_FRAME_LEN`] cap is not applied here: the stream layer encodes
/// oversized logical frames through this function before splitting them.
/// Senders putting a frame on the wire directly enforce the cap
/// themselves; receivers enforce it in [`FrameBuffer`].
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let mut out = vec![frame.tag()];
    match frame {
        Frame::Raw(data) => out.extend_from_slice(data),
        Frame::Control(packet) => out.append(&mut bincode::serialize(packet)?),
        Frame::StreamHead(head) => out.append(&mut bincode::serialize(head)?),
        Frame::StreamChunk(chunk) => out.append(&mut bincode::serialize(chunk)?),
        Frame::Text(text) => out.extend_from_slice(text.as_bytes()),
        Frame::UdpRegister { con_id } => out.extend_from_slice(&con_id.0.to_be_bytes()),
        Frame::Discovery => {}
    }
    Ok(out)
}

/// Decode tag + body bytes into a frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    let (&tag, body) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
    match tag {
        TAG_RAW => Ok(Frame::Raw(body.to_vec())),
        TAG_CONTROL => Ok(Frame::Control(bincode::deserialize(body)?)),
        TAG_STREAM_HEAD => Ok(Frame::StreamHead(bincode::deserialize(body)?)),
        TAG_STREAM_CHUNK => Ok(Frame::StreamChunk(bincode::deserialize(body)?)),
        TAG_TEXT => Ok(Frame::Text(
            String::from_utf8(body.to_vec()).map_err(|_| ProtocolError::InvalidText)?,
        )),
        TAG_UDP_REGISTER => {
            let id: [u8; 4] = body
                .try_into()
                .map_err(|_| ProtocolError::InvalidFrame(body.len()))?;
            Ok(Frame::UdpRegister {
                con_id: ConnectionId(u32::from_be_bytes(id)),
            })
        }
        TAG_DISCOVERY => Ok(Frame::Discovery),
        other => Err(ProtocolError::UnknownTag(other)),
    }
}

/// Prefix encoded frame bytes with the 4-byte big-endian length, for TCP.
pub fn length_prefix(frame_bytes: &[u8]) -> Vec<u8> {
    let len = (frame_bytes.len() as u32).to_be_bytes();
    let mut out = Vec::with_capacity(4 + frame_bytes.len());
    out.extend_from_slice(&len);
    out.extend_from_slice(frame_bytes);
    out
}

/// Buffer for accumulating TCP bytes and extracting complete frames.
///
/// Handles data arriving in arbitrary chunks.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push bytes into the buffer and return an iterator over complete
    /// frames. Frames are removed from the buffer as you iterate.
    pub fn push<'a>(&'a mut self, data: &[u8]) -> FrameIterator<'a> {
        self.buffer.extend_from_slice(data);
        FrameIterator { buffer: self }
    }

    fn try_extract(&mut self) -> Option<Result<Vec<u8>, ProtocolError>> {
        if self.buffer.len() < 4 {
            return None;
        }

        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len > MAX_FRAME_LEN {
            // Clear to recover from corruption; the caller disconnects anyway.
            self.buffer.clear();
            return Some(Err(ProtocolError::InvalidFrame(len)));
        }

        if self.buffer.len() < 4 + len {
            return None;
        }

        let frame = self.buffer[4..4 + len].to_vec();
        self.buffer.drain(..4 + len);
        Some(Ok(frame))
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }
}

/// Iterator over complete frames in a [`FrameBuffer`].
pub struct FrameIterator<'a> {
    buffer: &'a mut FrameBuffer,
}

impl Iterator for FrameIterator<'_> {
    type Item = Result<Vec<u8>, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buffer.try_extract()
    }
}
