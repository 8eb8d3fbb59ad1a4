//! Stream layer: carries one logical frame split across multiple wire
//! frames when it would not fit (or fit comfortably) in a single one.
//!
//! The sender emits a [`StreamHead`] followed by ordered [`StreamChunk`]s,
//! the last one flagged. The receiver keeps one [`StreamAssembler`] per
//! (peer, stream id); peers own their assembler maps so ids only collide
//! within a single peer, and a peer's map is dropped wholesale when it
//! disconnects.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::framing::{decode_frame, encode_frame, Frame};

/// Default chunk size. Peers do not need to agree on it; the head's
/// declared total is authoritative.
pub const DEFAULT_CHUNK_LEN: usize = 2 * 1024;

/// Cap on a stream's declared total, so a hostile head cannot make the
/// receiver buffer without bound.
pub const MAX_STREAM_LEN: u32 = 4 * 1024 * 1024;

static NEXT_STREAM_ID: AtomicU32 = AtomicU32::new(1);

/// Announces an incoming stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHead {
    pub id: u32,
    /// Total payload length in wire bytes (after compression, if any).
    pub total: u32,
    /// Frame tag of the carried payload.
    pub tag: u8,
    pub compressed: bool,
}

/// One slice of a stream's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: u32,
    pub data: Vec<u8>,
    pub last: bool,
}

/// A frame split into head and chunks, ready to send.
///
/// Preparing once and sending to many peers avoids re-encoding the payload
/// per receiver.
#[derive(Debug, Clone)]
pub struct PreparedStream {
    pub head: StreamHead,
    pub chunks: Vec<StreamChunk>,
}

impl PreparedStream {
    /// Split `frame` into a stream with the default chunk size and
    /// compression enabled.
    pub fn new(frame: &Frame) -> Result<Self, ProtocolError> {
        Self::with_options(frame, DEFAULT_CHUNK_LEN, true)
    }

    pub fn with_options(
        frame: &Frame,
        chunk_len: usize,
        compress: bool,
    ) -> Result<Self, ProtocolError> {
        let encoded = encode_frame(frame)?;
        let tag = encoded[0];
        let body = &encoded[1..];

        let payload = if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()?
        } else {
            body.to_vec()
        };

        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let head = StreamHead {
            id,
            total: payload.len() as u32,
            tag,
            compressed: compress,
        };

        let mut chunks: Vec<StreamChunk> = payload
            .chunks(chunk_len.max(1))
            .map(|data| StreamChunk {
                id,
                data: data.to_vec(),
                last: false,
            })
            .collect();
        // An empty payload still needs one (empty) terminating chunk.
        if chunks.is_empty() {
            chunks.push(StreamChunk {
                id,
                data: Vec::new(),
                last: true,
            });
        } else if let Some(tail) = chunks.last_mut() {
            tail.last = true;
        }

        Ok(Self { head, chunks })
    }

    /// The head and chunks as sendable frames, in transmission order.
    pub fn frames(&self) -> impl Iterator<Item = Frame> + '_ {
        std::iter::once(Frame::StreamHead(self.head))
            .chain(self.chunks.iter().cloned().map(Frame::StreamChunk))
    }
}

enum Sink {
    Plain(Vec<u8>),
    Inflate(ZlibDecoder<Vec<u8>>),
}

/// Reassembles one stream.
pub struct StreamAssembler {
    head: StreamHead,
    sink: Sink,
    /// Wire bytes received so far, compared against `head.total`.
    received: u32,
    finished: bool,
}

impl StreamAssembler {
    pub fn new(head: StreamHead) -> Self {
        let sink = if head.compressed {
            Sink::Inflate(ZlibDecoder::new(Vec::new()))
        } else {
            Sink::Plain(Vec::new())
        };
        Self {
            head,
            sink,
            received: 0,
            finished: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.finished || self.received >= self.head.total
    }

    /// Append one chunk.
    pub fn add(&mut self, chunk: &StreamChunk) -> Result<(), ProtocolError> {
        self.received += chunk.data.len() as u32;
        if self.received > self.head.total {
            return Err(ProtocolError::StreamOverflow(self.head.id, self.head.total));
        }
        match &mut self.sink {
            Sink::Plain(buf) => buf.extend_from_slice(&chunk.data),
            Sink::Inflate(decoder) => decoder.write_all(&chunk.data)?,
        }
        if chunk.last {
            self.finished = true;
        }
        Ok(())
    }

    /// Materialize the carried frame. Call once [`Self::is_done`] holds.
    pub fn finish(self) -> Result<Frame, ProtocolError> {
        let body = match self.sink {
            Sink::Plain(buf) => buf,
            Sink::Inflate(decoder) => decoder.finish()?,
        };
        let mut bytes = Vec::with_capacity(1 + body.len());
        bytes.push(self.head.tag);
        bytes.extend_from_slice(&body);
        let frame = decode_frame(&bytes)?;
        // Raw payloads and nested streams never travel streamed.
        match frame {
            Frame::Control(_) => Ok(frame),
            other => Err(ProtocolError::BadStreamPayload(other.tag())),
        }
    }
}

/// All in-flight streams of one peer.
#[derive(Default)]
pub struct AssemblerMap {
    assemblers: HashMap<u32, StreamAssembler>,
}

impl AssemblerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new stream. A head reusing a live id replaces the old
    /// assembler, mirroring sender-side id reuse after wraparound.
    pub fn head(&mut self, head: StreamHead) -> Result<(), ProtocolError> {
        if head.total > MAX_STREAM_LEN {
            return Err(ProtocolError::StreamTooLarge(head.id, head.total));
        }
        self.assemblers.insert(head.id, StreamAssembler::new(head));
        Ok(())
    }

    /// Feed a chunk; returns the completed frame once the stream is done.
    pub fn chunk(&mut self, chunk: &StreamChunk) -> Result<Option<Frame>, ProtocolError> {
        let assembler = self
            .assemblers
            .get_mut(&chunk.id)
            .ok_or(ProtocolError::ChunkWithoutHead(chunk.id))?;
        if let Err(err) = assembler.add(chunk) {
            self.assemblers.remove(&chunk.id);
            return Err(err);
        }
        if assembler.is_done() {
            let assembler = self
                .assemblers
                .remove(&chunk.id)
                .expect("assembler present");
            return assembler.finish().map(Some);
        }
        Ok(None)
    }

    pub fn len(&self) -> usize {
        self.assemblers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assemblers.is_empty()
    }
}
