//! A room: one host, its clients, and the forwarding rules between them.
//!
//! The room never interprets game traffic. Client payloads are enveloped
//! and passed to the host; host envelopes are opened and passed to the
//! addressed client. Everything else here is lifecycle: membership
//! notifications, state snapshots, deterministic closure.

use std::collections::HashMap;

use roomlink_protocol::{
    CloseReason, ConnectionId, ControlPacket, DisconnectReason, Frame, GameType, Notice,
    PreparedStream, RoomId, MAX_STATE_LEN, SPLIT_STATE_LEN,
};
use thiserror::Error;
use tokio::time::Instant;

use crate::connection::ConnectionHandle;
use crate::events::{Events, RelayEvent};

#[derive(Debug, Error)]
#[error("state of {0} bytes exceeds the {MAX_STATE_LEN}-byte cap")]
pub struct StateTooLarge(pub usize);

pub struct Room {
    closed: bool,
    pub id: RoomId,
    pub host: ConnectionHandle,
    pub clients: HashMap<ConnectionId, ConnectionHandle>,
    /// Implementation type carried inside; `None` is ungated but unlisted.
    pub game_type: Option<GameType>,

    pub is_public: bool,
    pub is_protected: bool,
    pub password: u16,
    /// Whether the host allows the relay to ask it for state snapshots.
    pub can_request_state: bool,
    /// Latest host-provided snapshot, opaque to the relay.
    pub raw_state: Option<Vec<u8>>,
    pub requesting_state: bool,

    created_at: Option<Instant>,
    last_received_state: Option<Instant>,
    last_requested_state: Option<Instant>,

    /// Packets forwarded client→host and host→client, for the status view.
    pub to_host: u64,
    pub to_clients: u64,

    events: Events,
}

impl Room {
    pub fn new(
        id: RoomId,
        host: ConnectionHandle,
        game_type: Option<GameType>,
        events: Events,
    ) -> Self {
        debug_assert!(id.0 != 0, "room id 0 is reserved for uncreated rooms");
        Self {
            closed: false,
            id,
            host,
            clients: HashMap::new(),
            game_type,
            is_public: false,
            is_protected: false,
            password: 0,
            can_request_state: false,
            raw_state: None,
            requesting_state: false,
            created_at: None,
            last_received_state: None,
            last_requested_state: None,
            to_host: 0,
            to_clients: 0,
            events,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_host(&self, id: ConnectionId) -> bool {
        self.host.id == id
    }

    /// Whether `id` is the host or one of the clients.
    pub fn contains(&self, id: ConnectionId) -> bool {
        !self.closed && (self.is_host(id) || self.clients.contains_key(&id))
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// When [`Self::create`] ran, for uptime reporting.
    pub fn created_at(&self) -> Option<Instant> {
        self.created_at
    }

    /// Announce the freshly minted room to its host. Call once.
    pub fn create(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        self.created_at = Some(now);
        self.host.send(&ControlPacket::RoomLink { room_id: self.id });
        self.events.emit(RelayEvent::RoomCreated {
            room: self.id,
            game_type: self.game_type,
        });
    }

    /// Announce a new client to the host and admit it.
    pub fn connected(&mut self, con: ConnectionHandle, address_hash: u64) {
        if self.closed {
            return;
        }
        self.host.send(&ControlPacket::ConnectionJoin {
            con_id: con.id,
            address_hash,
        });
        self.clients.insert(con.id, con);
    }

    /// A member dropped. Closes the room when it was the host, otherwise
    /// notifies the host. Does not close the member's transport.
    pub fn disconnected(&mut self, con: &ConnectionHandle, reason: DisconnectReason) {
        if self.closed {
            return;
        }
        if self.is_host(con.id) {
            self.close(reason.into());
            return;
        }
        if self.host.is_connected() {
            self.host.send(&ControlPacket::ConnectionClosed {
                con_id: con.id,
                reason,
            });
        }
        self.clients.remove(&con.id);
    }

    /// Same as [`Self::disconnected`] without the host notification; used
    /// when the host itself asked for the removal.
    pub fn disconnected_quietly(&mut self, con: &ConnectionHandle, reason: DisconnectReason) {
        if self.closed {
            return;
        }
        if self.is_host(con.id) {
            self.close(reason.into());
        } else {
            self.clients.remove(&con.id);
        }
    }

    /// Envelope a client payload for the host.
    pub fn received_raw(&mut self, sender: ConnectionId, raw: Vec<u8>, reliable: bool) {
        if self.closed || !self.host.is_connected() || !self.clients.contains_key(&sender) {
            return;
        }
        self.host.send_with(
            &ControlPacket::ConnectionPacketWrap {
                con_id: sender,
                is_tcp: reliable,
                raw,
            },
            reliable,
        );
        self.to_host += 1;
    }

    /// Open a host envelope and deliver it to the addressed client.
    ///
    /// A phantom connection id is answered with a `ConnectionClosed` so the
    /// host can drop its stale bookkeeping; this is the only place such ids
    /// are reported.
    pub fn received_wrap(&mut self, con_id: ConnectionId, is_tcp: bool, raw: Vec<u8>) {
        if self.closed {
            return;
        }
        match self.clients.get(&con_id) {
            Some(client) if client.is_connected() => {
                client.send_raw(raw, is_tcp);
                self.to_clients += 1;
            }
            _ => {
                if self.host.is_connected() {
                    self.host.send(&ControlPacket::ConnectionClosed {
                        con_id,
                        reason: DisconnectReason::Error,
                    });
                }
            }
        }
    }

    /// Tell the host a client has gone quiet. The caller gates repeats.
    pub fn idle(&mut self, con_id: ConnectionId) {
        if self.closed || self.is_host(con_id) {
            return;
        }
        if self.host.is_connected() && self.clients.contains_key(&con_id) {
            self.host.send(&ControlPacket::ConnectionIdling { con_id });
        }
    }

    pub fn set_configuration(
        &mut self,
        is_public: bool,
        is_protected: bool,
        password: u16,
        request_state: bool,
    ) {
        if self.closed {
            return;
        }
        self.is_public = is_public;
        self.is_protected = is_protected;
        self.password = password;
        self.can_request_state = request_state;
    }

    pub fn set_state(&mut self, state: Option<Vec<u8>>, now: Instant) -> Result<(), StateTooLarge> {
        if self.closed {
            return Ok(());
        }
        if let Some(bytes) = &state {
            if bytes.len() > MAX_STATE_LEN {
                return Err(StateTooLarge(bytes.len()));
            }
        }
        self.last_received_state = Some(now);
        self.raw_state = state;
        self.requesting_state = false;
        Ok(())
    }

    /// Ask the host for a fresh snapshot unless one is already in flight.
    /// Returns whether a request actually went out.
    pub fn request_state(&mut self, now: Instant, state_timeout: std::time::Duration) -> bool {
        if self.closed || !self.is_state_request_timed_out(now, state_timeout) {
            return false;
        }
        self.last_requested_state = Some(now);
        self.requesting_state = true;
        self.host.send(&ControlPacket::RoomStateRequest);
        true
    }

    pub fn is_state_request_timed_out(
        &self,
        now: Instant,
        state_timeout: std::time::Duration,
    ) -> bool {
        if !self.requesting_state {
            return true;
        }
        match self.last_requested_state {
            Some(at) => now.saturating_duration_since(at) >= state_timeout,
            None => true,
        }
    }

    pub fn is_state_outdated(&self, now: Instant, state_lifetime: std::time::Duration) -> bool {
        match self.last_received_state {
            Some(at) => now.saturating_duration_since(at) >= state_lifetime,
            None => true,
        }
    }

    /// Whether the relay may ask this room's host for state at all.
    pub fn should_request_state(&self) -> bool {
        !self.closed && self.is_public && self.can_request_state
    }

    pub fn needs_state_request(
        &self,
        now: Instant,
        state_timeout: std::time::Duration,
        state_lifetime: std::time::Duration,
    ) -> bool {
        self.should_request_state()
            && self.is_state_outdated(now, state_lifetime)
            && self.is_state_request_timed_out(now, state_timeout)
    }

    /// Send this room's info to `con`. The state is withheld from private
    /// rooms and streamed when it would not fit a comfortable single frame.
    pub fn send_room_state(&self, con: &ConnectionHandle) {
        if self.closed {
            return;
        }
        let state = if self.is_public {
            self.raw_state.clone()
        } else {
            None
        };
        let oversized = state.as_ref().is_some_and(|s| s.len() > SPLIT_STATE_LEN);
        let packet = ControlPacket::RoomInfo {
            room_id: self.id,
            is_protected: self.is_protected,
            game_type: self.game_type,
            state,
        };
        if oversized {
            match PreparedStream::new(&Frame::Control(packet)) {
                Ok(stream) => con.send_stream(&stream),
                Err(err) => tracing::warn!(room = %self.id, %err, "failed to stream room info"),
            }
        } else {
            con.send(&packet);
        }
    }

    /// Free text for the host to redistribute in-game.
    pub fn message(&self, text: &str) {
        if self.closed {
            return;
        }
        self.host.send(&ControlPacket::TextMessage {
            text: text.to_string(),
        });
    }

    /// Host-bound toast.
    pub fn notice(&self, notice: Notice) {
        if self.closed {
            return;
        }
        self.host.send(&ControlPacket::Message { notice });
    }

    /// Popup shown by the host only.
    pub fn popup(&self, text: &str) {
        if self.closed {
            return;
        }
        self.host.send(&ControlPacket::Popup {
            text: text.to_string(),
        });
    }

    /// Close the room and disconnect everyone. Idempotent; the closed flag
    /// is set before any peer is touched so re-entrant events are no-ops.
    pub fn close(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.host.send(&ControlPacket::RoomClosed { reason });
        let transport_reason = match reason {
            CloseReason::Error => DisconnectReason::Error,
            _ => DisconnectReason::Closed,
        };
        self.host.close(transport_reason);
        for client in self.clients.values() {
            client.close(transport_reason);
        }
        self.clients.clear();

        self.events.emit(RelayEvent::RoomClosed {
            room: self.id,
            reason,
        });
    }
}
