//! Wire protocol shared by the roomlink relay and its clients.
//!
//! A relay forwards opaque game traffic between a room's host and its
//! clients; everything the relay itself understands travels as the typed
//! [`ControlPacket`]s defined here, framed per [`framing`] and optionally
//! split across wire frames by [`stream`].

pub mod error;
pub mod framing;
pub mod link;
pub mod packets;
pub mod stream;
pub mod types;

pub use error::ProtocolError;
pub use framing::{decode_frame, encode_frame, length_prefix, Frame, FrameBuffer, MAX_FRAME_LEN};
pub use link::ShareLink;
pub use packets::{
    discovery_response, ControlPacket, RoomListEntry, MAX_STATE_LEN, NET_MAGIC, PROTOCOL_VERSION,
    SPLIT_STATE_LEN,
};
pub use stream::{
    AssemblerMap, PreparedStream, StreamChunk, StreamHead, DEFAULT_CHUNK_LEN, MAX_STREAM_LEN,
};
pub use types::{
    CloseReason, ConnectionId, DisconnectReason, GameType, Notice, RejectReason, RoomId,
};
