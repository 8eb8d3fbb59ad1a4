//! Relay lifecycle events, broadcast to embedders.
//!
//! Sent best-effort: if nobody subscribed (or a subscriber lags) the event
//! is simply dropped.

use std::net::SocketAddr;

use roomlink_protocol::{
    CloseReason, ConnectionId, DisconnectReason, GameType, Notice, RejectReason, RoomId,
};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum RelayEvent {
    ClientConnected {
        con: ConnectionId,
        addr: SocketAddr,
    },
    ClientDisconnected {
        con: ConnectionId,
        reason: DisconnectReason,
    },
    /// A client was kicked for packet spamming.
    ClientKicked {
        con: ConnectionId,
    },
    RoomCreated {
        room: RoomId,
        game_type: Option<GameType>,
    },
    RoomClosed {
        room: RoomId,
        reason: CloseReason,
    },
    /// A host-only (or otherwise privileged) action was refused.
    ActionDenied {
        con: ConnectionId,
        room: RoomId,
        notice: Notice,
    },
    CreationRejected {
        con: ConnectionId,
        reason: CloseReason,
    },
    JoinRejected {
        con: ConnectionId,
        room: RoomId,
        reason: RejectReason,
    },
    /// The relay began shutting down; `notified` tells whether rooms got a
    /// closing notice first.
    Stopping {
        notified: bool,
    },
}

/// Cloneable event sink.
#[derive(Debug, Clone)]
pub struct Events {
    tx: broadcast::Sender<RelayEvent>,
}

impl Events {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}
