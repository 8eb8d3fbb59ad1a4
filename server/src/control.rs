//! Programmatic operator surface.
//!
//! Everything the console (or an embedding process) can do goes through
//! [`RelayHandle`]: commands are posted onto the same queue as network
//! events, so they run on the dispatcher with full access to its state and
//! never race it.

use std::net::{IpAddr, SocketAddr};

use roomlink_protocol::{GameType, RoomId};
use tokio::sync::{mpsc, oneshot};

use crate::relay::RelayMessage;

/// Outcome of a refresh command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A request went out to the host(s).
    Requested,
    /// A request is already in flight; nothing new was sent.
    AlreadyPending,
    /// No such room or type.
    NotFound,
    /// The room's configuration forbids state requests (override with
    /// `force`).
    NotAllowed,
}

/// Point-in-time view of one room, for the status commands.
#[derive(Debug, Clone)]
pub struct RoomStatus {
    pub id: RoomId,
    pub game_type: Option<GameType>,
    pub is_public: bool,
    pub is_protected: bool,
    pub host_addr: SocketAddr,
    pub host_con: String,
    /// Client short ids and addresses.
    pub clients: Vec<(String, SocketAddr)>,
    /// Packets forwarded client→host since creation.
    pub to_host: u64,
    /// Packets forwarded host→client since creation.
    pub to_clients: u64,
    pub uptime_secs: u64,
}

/// Point-in-time view of the whole relay.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub rooms: Vec<RoomStatus>,
    /// Connections currently attached to a room.
    pub clients: usize,
    /// All live connections, attached or not.
    pub connections: usize,
}

#[derive(Debug)]
pub(crate) enum Command {
    Status(oneshot::Sender<StatusSnapshot>),
    CloseRoom {
        room: RoomId,
        reply: oneshot::Sender<bool>,
    },
    /// Text to one room (or all) for in-game redistribution.
    Say {
        target: Option<RoomId>,
        text: String,
        reply: oneshot::Sender<bool>,
    },
    /// Popup to one room's host (or all hosts).
    Alert {
        target: Option<RoomId>,
        text: String,
        reply: oneshot::Sender<bool>,
    },
    BlacklistAdd {
        addr: IpAddr,
        reply: oneshot::Sender<bool>,
    },
    BlacklistRemove {
        addr: IpAddr,
        reply: oneshot::Sender<bool>,
    },
    BlacklistList(oneshot::Sender<Vec<IpAddr>>),
    SetSpamLimit(u32),
    SetJoinLimit(u32),
    RefreshRoom {
        room: RoomId,
        force: bool,
        reply: oneshot::Sender<RefreshOutcome>,
    },
    RefreshList {
        game_type: Option<GameType>,
        force: bool,
        reply: oneshot::Sender<RefreshOutcome>,
    },
    Stop {
        done: Option<oneshot::Sender<()>>,
    },
}

/// Cloneable handle for driving a running relay.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayMessage>,
}

impl RelayHandle {
    pub(crate) fn new(tx: mpsc::Sender<RelayMessage>) -> Self {
        Self { tx }
    }

    async fn command<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Option<R> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RelayMessage::Command(build(reply_tx)))
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    /// Read counts and per-room traffic counters.
    pub async fn status(&self) -> Option<StatusSnapshot> {
        self.command(Command::Status).await
    }

    /// Close a room by id; returns whether it existed.
    pub async fn close_room(&self, room: RoomId) -> bool {
        self.command(|reply| Command::CloseRoom { room, reply })
            .await
            .unwrap_or(false)
    }

    /// Send text to one room, or to every room when `target` is `None`.
    pub async fn say(&self, target: Option<RoomId>, text: impl Into<String>) -> bool {
        let text = text.into();
        self.command(|reply| Command::Say {
            target,
            text,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Popup one room's host, or every host when `target` is `None`.
    pub async fn alert(&self, target: Option<RoomId>, text: impl Into<String>) -> bool {
        let text = text.into();
        self.command(|reply| Command::Alert {
            target,
            text,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Returns false when the address was already blacklisted.
    pub async fn blacklist_add(&self, addr: IpAddr) -> bool {
        self.command(|reply| Command::BlacklistAdd { addr, reply })
            .await
            .unwrap_or(false)
    }

    /// Returns false when the address was not blacklisted.
    pub async fn blacklist_remove(&self, addr: IpAddr) -> bool {
        self.command(|reply| Command::BlacklistRemove { addr, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn blacklist(&self) -> Vec<IpAddr> {
        self.command(Command::BlacklistList).await.unwrap_or_default()
    }

    /// Packets per connection per 3 s; 0 disables.
    pub async fn set_spam_limit(&self, limit: u32) {
        let _ = self
            .tx
            .send(RelayMessage::Command(Command::SetSpamLimit(limit)))
            .await;
    }

    /// Joins per address per minute; 0 disables.
    pub async fn set_join_limit(&self, limit: u32) {
        let _ = self
            .tx
            .send(RelayMessage::Command(Command::SetJoinLimit(limit)))
            .await;
    }

    /// Ask one room's host for a fresh state snapshot.
    pub async fn refresh_room(&self, room: RoomId, force: bool) -> RefreshOutcome {
        self.command(|reply| Command::RefreshRoom { room, force, reply })
            .await
            .unwrap_or(RefreshOutcome::NotFound)
    }

    /// Refresh one type's list, or every list when `game_type` is `None`.
    pub async fn refresh_list(&self, game_type: Option<GameType>, force: bool) -> RefreshOutcome {
        self.command(|reply| Command::RefreshList {
            game_type,
            force,
            reply,
        })
        .await
        .unwrap_or(RefreshOutcome::NotFound)
    }

    /// Begin shutdown and wait for it to finish (including the grace
    /// period when rooms get a closing notice). A second call skips the
    /// grace period.
    pub async fn stop(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send(RelayMessage::Command(Command::Stop {
                done: Some(done_tx),
            }))
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}
