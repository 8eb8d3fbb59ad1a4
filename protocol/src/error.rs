use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0} bytes")]
    InvalidFrame(usize),

    #[error("empty frame")]
    EmptyFrame,

    #[error("unknown frame tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("packet codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("stream chunk {0} received without a preceding head")]
    ChunkWithoutHead(u32),

    #[error("stream {0} declares {1} bytes (max {max})", max = crate::stream::MAX_STREAM_LEN)]
    StreamTooLarge(u32, u32),

    #[error("stream {0} exceeds declared total of {1} bytes")]
    StreamOverflow(u32, u32),

    #[error("stream payload carries an unexpected frame tag: {0:#04x}")]
    BadStreamPayload(u8),

    #[error("decompression error: {0}")]
    Decompress(#[from] std::io::Error),

    #[error("invalid room id: {0:?}")]
    InvalidRoomId(String),

    #[error("invalid game type label: {0:?}")]
    InvalidGameType(String),

    #[error("invalid share link: {0:?}")]
    InvalidLink(String),

    #[error("invalid text frame: not utf-8")]
    InvalidText,
}
