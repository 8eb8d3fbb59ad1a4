//! Typed control packets exchanged between the relay, room hosts and
//! joining clients.
//!
//! Game traffic is never represented here: it crosses the relay as opaque
//! `Raw` frames and is enveloped in [`ControlPacket::ConnectionPacketWrap`]
//! on the host leg.

use serde::{Deserialize, Serialize};

use crate::types::{
    CloseReason, ConnectionId, DisconnectReason, GameType, Notice, RejectReason, RoomId,
};

/// Protocol major version. Room creation is gated on an exact match.
pub const PROTOCOL_VERSION: i32 = 2;

/// First byte of the discovery response, identifying a roomlink relay.
pub const NET_MAGIC: u8 = 0xC9;

/// Hard cap on a room's raw state snapshot.
pub const MAX_STATE_LEN: usize = 32 * 1024;

/// State snapshots above this are sent through the stream layer instead of
/// a single frame.
pub const SPLIT_STATE_LEN: usize = 4 * 1024;

/// Builds the fixed 5-byte discovery response: magic byte followed by the
/// protocol major version as a big-endian i32.
pub fn discovery_response() -> [u8; 5] {
    let mut buf = [0u8; 5];
    buf[0] = NET_MAGIC;
    buf[1..].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    buf
}

/// One entry of a [`ControlPacket::RoomList`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomListEntry {
    pub room_id: RoomId,
    pub state: Option<Vec<u8>>,
}

/// Every typed message of the relay protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlPacket {
    /// Relay version advertisement, the typed twin of the discovery blob.
    ServerInfo { version: i32 },

    /// Host asks the relay to open a room.
    RoomCreationRequest {
        version: i32,
        game_type: Option<GameType>,
    },
    /// Relay answers a successful creation with the room id to share.
    RoomLink { room_id: RoomId },
    /// Host asks the relay to close its own room.
    RoomClosureRequest,
    /// The room is gone; also used to refuse creation.
    RoomClosed { reason: CloseReason },

    /// Commit join: the sender becomes a client of the room.
    RoomJoin {
        room_id: RoomId,
        game_type: Option<GameType>,
        with_password: bool,
        password: u16,
    },
    /// Probe join: same checks as [`ControlPacket::RoomJoin`] but the sender
    /// only wants a verdict, not membership.
    RoomJoinRequest {
        room_id: RoomId,
        game_type: Option<GameType>,
        with_password: bool,
        password: u16,
    },
    RoomJoinAccepted {
        room_id: RoomId,
    },
    RoomJoinDenied {
        room_id: RoomId,
        reason: RejectReason,
    },

    /// Host reconfigures its room.
    RoomConfig {
        is_public: bool,
        is_protected: bool,
        password: u16,
        request_state: bool,
    },
    /// Host publishes a fresh state snapshot (or clears it).
    RoomState { state: Option<Vec<u8>> },
    /// Relay asks the host for a fresh state snapshot.
    RoomStateRequest,

    RoomInfoRequest {
        room_id: RoomId,
    },
    RoomInfo {
        room_id: RoomId,
        is_protected: bool,
        game_type: Option<GameType>,
        state: Option<Vec<u8>>,
    },
    RoomInfoDenied,

    RoomListRequest {
        game_type: Option<GameType>,
    },
    RoomList {
        states: Vec<RoomListEntry>,
        protected_rooms: Vec<RoomId>,
    },

    /// Relay tells the host a client has arrived.
    ConnectionJoin {
        con_id: ConnectionId,
        address_hash: u64,
    },
    /// A client is gone, or (host to relay) a request to kick one.
    ConnectionClosed {
        con_id: ConnectionId,
        reason: DisconnectReason,
    },
    /// A client has gone quiet.
    ConnectionIdling { con_id: ConnectionId },
    /// Envelope for game traffic on the host leg.
    ConnectionPacketWrap {
        con_id: ConnectionId,
        is_tcp: bool,
        raw: Vec<u8>,
    },

    /// Free text relayed to the host, which redistributes it in-game.
    TextMessage { text: String },
    /// Popup shown by the host only.
    Popup { text: String },
    /// Host-bound toast, see [`Notice`].
    Message { notice: Notice },
}
