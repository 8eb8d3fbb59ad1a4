//! Share-link format: `roomlink://host:port/<room>`.
//!
//! The room part is the url-safe short form of the room id, exactly as the
//! relay hands it back in `RoomLink`.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::types::RoomId;

pub const LINK_SCHEME: &str = "roomlink";

/// A parsed share link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareLink {
    pub host: String,
    pub port: u16,
    pub room_id: RoomId,
}

impl ShareLink {
    pub fn new(host: impl Into<String>, port: u16, room_id: RoomId) -> Self {
        Self {
            host: host.into(),
            port,
            room_id,
        }
    }
}

impl fmt::Display for ShareLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}/{}",
            LINK_SCHEME,
            self.host,
            self.port,
            self.room_id.short()
        )
    }
}

impl FromStr for ShareLink {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidLink(s.to_string());

        let rest = s
            .strip_prefix(LINK_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(invalid)?;
        let (authority, room) = rest.split_once('/').ok_or_else(invalid)?;
        let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        let room_id = RoomId::from_short(room).map_err(|_| invalid())?;
        Ok(Self {
            host: host.to_string(),
            port,
            room_id,
        })
    }
}
