//! Identifiers and status enums shared by the relay and its clients.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Unique identifier for a room.
///
/// Minted randomly by the relay; `0` is reserved for "uncreated" and never
/// assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub u64);

impl RoomId {
    /// Url-safe short form of the id, as it appears in share links.
    pub fn short(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.to_be_bytes())
    }

    /// Parse the short form back into an id.
    pub fn from_short(s: &str) -> Result<Self, ProtocolError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| ProtocolError::InvalidRoomId(s.to_string()))?;
        let bytes: [u8; 8] = bytes
            .try_into()
            .map_err(|_| ProtocolError::InvalidRoomId(s.to_string()))?;
        Ok(RoomId(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

/// Unique identifier for a connection, stable for the relay's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Hex short form used in logs and operator output.
    pub fn short(&self) -> String {
        format!("{:08x}", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Maximum length of a [`GameType`] label in bytes.
pub const GAME_TYPE_LEN: usize = 8;

/// Compact label identifying the game implementation carried inside a room.
///
/// At most [`GAME_TYPE_LEN`] bytes of printable ASCII. Rooms without a type
/// are ungated but never listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameType {
    bytes: [u8; GAME_TYPE_LEN],
    len: u8,
}

impl GameType {
    pub fn new(label: &str) -> Result<Self, ProtocolError> {
        let raw = label.as_bytes();
        if raw.is_empty() || raw.len() > GAME_TYPE_LEN {
            return Err(ProtocolError::InvalidGameType(label.to_string()));
        }
        if !raw.iter().all(|b| b.is_ascii_graphic()) {
            return Err(ProtocolError::InvalidGameType(label.to_string()));
        }
        let mut bytes = [0u8; GAME_TYPE_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self {
            bytes,
            len: raw.len() as u8,
        })
    }

    pub fn as_str(&self) -> &str {
        // Constructor only accepts ASCII, so this cannot fail.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Why a room was closed, carried in `RoomClosed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Closed,
    Error,
    ServerClosed,
    OutdatedClient,
    OutdatedServer,
    ObsoleteClient,
    Blacklisted,
}

/// Transport-level disconnect reason, carried in `ConnectionClosed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    Closed,
    Error,
    Timeout,
}

impl From<DisconnectReason> for CloseReason {
    fn from(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::Error => CloseReason::Error,
            DisconnectReason::Closed | DisconnectReason::Timeout => CloseReason::Closed,
        }
    }
}

/// Why a join was refused, carried in `RoomJoinDenied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    RoomNotFound,
    ServerClosing,
    Incompatible,
    PasswordRequired,
    InvalidPassword,
}

/// Short host-bound notices, translated to player-visible text by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notice {
    AlreadyHosting,
    RoomClosureDenied,
    ConfigureDenied,
    StatingDenied,
    ConClosureDenied,
    PacketSpamming,
    ServerClosing,
}
