//! Relay server for peer game sessions.
//!
//! A host registers a room, shares the link, and remote clients connect
//! here; the relay forwards each client's opaque game traffic to the host
//! as if the client were directly attached. See `roomlink-protocol` for
//! the wire format.
//!
//! Module overview:
//! - [`relay`]: the dispatcher owning all rooms, indices and caches.
//! - [`room`]: the per-room state machine (membership, forwarding,
//!   closure cascade).
//! - [`listing`]: per-type room lists with coalesced refresh.
//! - [`net`]: TCP+UDP transport tasks feeding the dispatcher.
//! - [`control`]: the operator/embedder surface.

pub mod config;
pub mod connection;
pub mod console;
pub mod control;
pub mod error;
pub mod events;
pub mod listing;
pub mod net;
pub mod rate;
pub mod relay;
pub mod room;
pub mod scheduler;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use config::RelayConfig;
pub use control::{RefreshOutcome, RelayHandle, RoomStatus, StatusSnapshot};
pub use error::ServerError;
pub use events::{Events, RelayEvent};

use config::Gate;
use relay::{Relay, RelayMessage, MESSAGE_BUFFER};

/// A started relay.
pub struct Running {
    pub handle: RelayHandle,
    /// The actual bound address (relevant when configured with port 0).
    pub local_addr: SocketAddr,
    pub events: Events,
    /// The dispatcher task; completes once shutdown finishes.
    pub task: JoinHandle<()>,
}

/// Bind the transport and start the dispatcher.
pub async fn start(config: RelayConfig) -> Result<Running, ServerError> {
    let events = Events::new();
    let gate = Arc::new(Gate::new(&config));
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<RelayMessage>(MESSAGE_BUFFER);

    let local_addr = net::bind(config.port, Arc::clone(&gate), tx.clone(), cancel.clone()).await?;
    tracing::info!(addr = %local_addr, "relay listening (tcp+udp)");

    let relay = Relay::new(config, gate, events.clone(), cancel);
    let task = tokio::spawn(relay.run(rx));

    Ok(Running {
        handle: RelayHandle::new(tx),
        local_addr,
        events,
        task,
    })
}
