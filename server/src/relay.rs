//! The dispatcher: owns every room, connection index and cache, and
//! handles every control packet.
//!
//! All state in here belongs to one task. The transport tasks and the
//! operator handle post [`RelayMessage`]s onto a bounded queue; the
//! dispatcher drains it and runs its keyed timers in between. Nothing
//! below ever blocks or awaits.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use roomlink_protocol::{
    AssemblerMap, CloseReason, ConnectionId, ControlPacket, DisconnectReason, Frame, GameType,
    Notice, ProtocolError, RejectReason, RoomId, PROTOCOL_VERSION,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{Gate, RelayConfig};
use crate::connection::ConnectionHandle;
use crate::control::{Command, RefreshOutcome, RoomStatus, StatusSnapshot};
use crate::events::{Events, RelayEvent};
use crate::listing::CachedRoomList;
use crate::rate::{AddressRater, SPAM_WINDOW};
use crate::room::Room;
use crate::scheduler::{TimerKey, TimerQueue};

/// Capacity of the queue feeding the dispatcher.
pub(crate) const MESSAGE_BUFFER: usize = 1024;

/// Payloads buffered per connection until its join lands.
const EARLY_QUEUE_LEN: usize = 3;

/// Cap on how many connections may hold an early-packet queue at once.
const MAX_EARLY_QUEUES: usize = 1024;

/// Work posted to the dispatcher.
#[derive(Debug)]
pub(crate) enum RelayMessage {
    Connected {
        handle: ConnectionHandle,
    },
    Disconnected {
        id: ConnectionId,
        reason: DisconnectReason,
    },
    Frame {
        id: ConnectionId,
        frame: Frame,
        reliable: bool,
    },
    /// The transport noticed the connection going quiet (first time since
    /// its last packet).
    Idle {
        id: ConnectionId,
    },
    /// The reader saw the connection exceed the spam limit.
    RateLimited {
        id: ConnectionId,
    },
    UdpRegister {
        id: ConnectionId,
        addr: SocketAddr,
    },
    UdpDatagram {
        addr: SocketAddr,
        frame: Frame,
    },
    Command(Command),
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    /// In-flight streams from this peer; dropped wholesale on disconnect.
    assemblers: AssemblerMap,
    udp_addr: Option<SocketAddr>,
}

/// Keyed hash over remote addresses, stable for the process lifetime and
/// not reversible without the key.
struct AddressHasher {
    key: u64,
}

impl AddressHasher {
    fn new() -> Self {
        Self {
            key: rand::thread_rng().gen(),
        }
    }

    fn hash(&self, ip: IpAddr) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.key.hash(&mut hasher);
        ip.hash(&mut hasher);
        hasher.finish()
    }
}

pub(crate) struct Relay {
    config: RelayConfig,
    gate: Arc<Gate>,
    events: Events,
    cancel: CancellationToken,

    rooms: HashMap<RoomId, Room>,
    /// Back-reference per member connection; lookup only, never ownership.
    con_to_room: HashMap<ConnectionId, RoomId>,
    types: HashMap<GameType, HashSet<RoomId>>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    udp_peers: HashMap<SocketAddr, ConnectionId>,

    // TODO: evict raters for addresses with no live connection.
    rates: HashMap<IpAddr, AddressRater>,
    packet_queue: HashMap<ConnectionId, Vec<(Vec<u8>, bool)>>,
    pending_info: HashMap<RoomId, Vec<ConnectionHandle>>,
    list_cache: HashMap<GameType, CachedRoomList>,
    timers: TimerQueue,

    hasher: AddressHasher,
    empty_list: ControlPacket,

    closed: bool,
    stopped: bool,
    stop_waiters: Vec<tokio::sync::oneshot::Sender<()>>,
}

impl Relay {
    pub(crate) fn new(
        config: RelayConfig,
        gate: Arc<Gate>,
        events: Events,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            gate,
            events,
            cancel,
            rooms: HashMap::new(),
            con_to_room: HashMap::new(),
            types: HashMap::new(),
            connections: HashMap::new(),
            udp_peers: HashMap::new(),
            rates: HashMap::new(),
            packet_queue: HashMap::new(),
            pending_info: HashMap::new(),
            list_cache: HashMap::new(),
            timers: TimerQueue::new(),
            hasher: AddressHasher::new(),
            empty_list: ControlPacket::RoomList {
                states: Vec::new(),
                protected_rooms: Vec::new(),
            },
            closed: false,
            stopped: false,
            stop_waiters: Vec::new(),
        }
    }

    /// Drain messages and run timers until shutdown completes.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<RelayMessage>) {
        loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => {
                        self.finish_stop();
                        break;
                    }
                },
                _ = tokio::time::sleep_until(
                    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
                ), if deadline.is_some() => {
                    let now = Instant::now();
                    while let Some(key) = self.timers.pop_due(now) {
                        self.fire_timer(key);
                    }
                }
            }
            if self.stopped {
                break;
            }
        }
        tracing::info!("relay dispatcher stopped");
    }

    pub(crate) fn handle_message(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::Connected { handle } => self.on_connected(handle),
            RelayMessage::Disconnected { id, reason } => self.on_disconnected(id, reason),
            RelayMessage::Frame {
                id,
                frame,
                reliable,
            } => self.on_frame(id, frame, reliable),
            RelayMessage::Idle { id } => self.on_idle(id),
            RelayMessage::RateLimited { id } => self.on_rate_limited(id),
            RelayMessage::UdpRegister { id, addr } => self.on_udp_register(id, addr),
            RelayMessage::UdpDatagram { addr, frame } => self.on_udp_datagram(addr, frame),
            RelayMessage::Command(command) => self.handle_command(command),
        }
    }

    pub(crate) fn fire_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::StateWatchdog(room_id) => {
                // Flush whatever state exists; the host missed its window.
                self.flush_pending_state(room_id);
            }
            TimerKey::ListRefresh(game_type) => self.flush_list(game_type),
            TimerKey::ShutdownGrace => self.finish_stop(),
        }
    }

    // region connection lifecycle

    fn on_connected(&mut self, handle: ConnectionHandle) {
        tracing::debug!(con = %handle.id, addr = %handle.addr, "connection received");
        self.events.emit(RelayEvent::ClientConnected {
            con: handle.id,
            addr: handle.addr,
        });
        self.connections.insert(
            handle.id,
            ConnectionEntry {
                handle,
                assemblers: AssemblerMap::new(),
                udp_addr: None,
            },
        );
    }

    fn on_disconnected(&mut self, id: ConnectionId, reason: DisconnectReason) {
        let Some(entry) = self.connections.remove(&id) else {
            return;
        };
        tracing::debug!(con = %id, ?reason, "connection lost");
        self.packet_queue.remove(&id);
        if let Some(addr) = entry.udp_addr {
            self.udp_peers.remove(&addr);
        }
        self.events
            .emit(RelayEvent::ClientDisconnected { con: id, reason });

        let Some(room_id) = self.con_to_room.remove(&id) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        if room.is_host(id) {
            self.close_room(room_id, reason.into());
            tracing::info!(room = %room_id, con = %id, "room closed: its host disconnected");
        } else {
            room.disconnected(&entry.handle, reason);
            tracing::info!(room = %room_id, con = %id, "connection left the room");
        }
    }

    fn on_idle(&mut self, id: ConnectionId) {
        if let Some(&room_id) = self.con_to_room.get(&id) {
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.idle(id);
            }
        }
    }

    fn on_rate_limited(&mut self, id: ConnectionId) {
        let Some(entry) = self.connections.get(&id) else {
            return;
        };
        let handle = entry.handle.clone();
        if handle.shared().is_host() {
            return;
        }
        if let Some(room_id) = self.con_to_room.remove(&id) {
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.notice(Notice::PacketSpamming);
                room.disconnected(&handle, DisconnectReason::Closed);
            }
        }
        self.packet_queue.remove(&id);
        handle.close(DisconnectReason::Closed);
        tracing::warn!(con = %id, addr = %handle.addr, "disconnected for packet spamming");
        self.events.emit(RelayEvent::ClientKicked { con: id });
    }

    fn on_udp_register(&mut self, id: ConnectionId, addr: SocketAddr) {
        let Some(entry) = self.connections.get_mut(&id) else {
            return;
        };
        // The datagram must come from the same host as the TCP side, or
        // anyone knowing an id could capture that peer's unreliable path.
        if entry.handle.addr.ip() != addr.ip() {
            tracing::warn!(con = %id, %addr, "udp registration from a foreign address");
            return;
        }
        if let Some(old) = entry.udp_addr.replace(addr) {
            self.udp_peers.remove(&old);
        }
        entry.handle.bind_udp(addr);
        self.udp_peers.insert(addr, id);
        tracing::debug!(con = %id, %addr, "udp address bound");
    }

    fn on_udp_datagram(&mut self, addr: SocketAddr, frame: Frame) {
        let Some(&id) = self.udp_peers.get(&addr) else {
            tracing::debug!(%addr, "datagram from an unregistered address");
            return;
        };
        let Some(entry) = self.connections.get(&id) else {
            return;
        };
        let shared = entry.handle.shared().clone();
        let limit = self.gate.spam_limit();
        if limit > 0 && !shared.is_host() && !shared.packet_rate.allow(SPAM_WINDOW, limit) {
            self.on_rate_limited(id);
            return;
        }
        self.on_frame(id, frame, false);
    }

    // end region
    // region frame dispatch

    fn on_frame(&mut self, id: ConnectionId, frame: Frame, reliable: bool) {
        {
            let Some(entry) = self.connections.get(&id) else {
                return;
            };
            entry.handle.shared().clear_idle_notified();
        }
        match frame {
            Frame::Raw(data) => self.on_raw(id, data, reliable),
            Frame::Control(packet) => self.on_control(id, packet),
            Frame::StreamHead(head) => {
                let result = match self.connections.get_mut(&id) {
                    Some(entry) => entry.assemblers.head(head),
                    None => return,
                };
                if let Err(err) = result {
                    self.protocol_error(id, &err);
                }
            }
            Frame::StreamChunk(chunk) => {
                let result = match self.connections.get_mut(&id) {
                    Some(entry) => entry.assemblers.chunk(&chunk),
                    None => return,
                };
                match result {
                    Ok(Some(Frame::Control(packet))) => self.on_control(id, packet),
                    Ok(_) => {}
                    Err(err) => self.protocol_error(id, &err),
                }
            }
            Frame::Text(_) => self.on_obsolete(id),
            Frame::UdpRegister { .. } => {
                tracing::debug!(con = %id, "ignoring udp registration on the wrong transport");
            }
            Frame::Discovery => {
                if let Some(entry) = self.connections.get(&id) {
                    entry.handle.send(&ControlPacket::ServerInfo {
                        version: PROTOCOL_VERSION,
                    });
                }
            }
        }
    }

    fn on_raw(&mut self, id: ConnectionId, data: Vec<u8>, reliable: bool) {
        if let Some(&room_id) = self.con_to_room.get(&id) {
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.received_raw(id, data, reliable);
            }
            return;
        }
        // Not in a room yet: the join packet may simply not have landed.
        // Hold a few payloads; overflow is dropped silently and left to
        // application-level retransmission.
        if !self.packet_queue.contains_key(&id) && self.packet_queue.len() >= MAX_EARLY_QUEUES {
            return;
        }
        let queue = self.packet_queue.entry(id).or_default();
        if queue.len() < EARLY_QUEUE_LEN {
            queue.push((data, reliable));
        }
    }

    fn on_control(&mut self, id: ConnectionId, packet: ControlPacket) {
        match packet {
            ControlPacket::RoomCreationRequest { version, game_type } => {
                self.on_room_create(id, version, game_type)
            }
            ControlPacket::RoomClosureRequest => self.on_room_closure(id),
            ControlPacket::RoomJoin {
                room_id,
                game_type,
                with_password,
                password,
            } => self.on_room_join(id, false, room_id, game_type, with_password, password),
            ControlPacket::RoomJoinRequest {
                room_id,
                game_type,
                with_password,
                password,
            } => self.on_room_join(id, true, room_id, game_type, with_password, password),
            ControlPacket::RoomConfig {
                is_public,
                is_protected,
                password,
                request_state,
            } => self.on_room_config(id, is_public, is_protected, password, request_state),
            ControlPacket::RoomState { state } => self.on_room_state(id, state),
            ControlPacket::RoomInfoRequest { room_id } => self.on_info_request(id, room_id),
            ControlPacket::RoomListRequest { game_type } => self.on_list_request(id, game_type),
            ControlPacket::ConnectionClosed { con_id, reason } => {
                self.on_con_close(id, con_id, reason)
            }
            ControlPacket::ConnectionPacketWrap {
                con_id,
                is_tcp,
                raw,
            } => self.on_host_wrap(id, con_id, is_tcp, raw),
            other => {
                tracing::debug!(con = %id, ?other, "ignoring unexpected inbound packet");
            }
        }
    }

    fn on_obsolete(&mut self, id: ConnectionId) {
        let Some(handle) = self.connection(id) else {
            return;
        };
        if self.config.warn_deprecated {
            handle.send(&ControlPacket::TextMessage {
                text: "[roomlink] Your client speaks an obsolete protocol; please update."
                    .to_string(),
            });
        }
        handle.close(DisconnectReason::Error);
        tracing::warn!(con = %id, "kicked pre-protocol client");
        self.events.emit(RelayEvent::CreationRejected {
            con: id,
            reason: CloseReason::ObsoleteClient,
        });
    }

    fn protocol_error(&mut self, id: ConnectionId, err: &ProtocolError) {
        tracing::warn!(con = %id, %err, "protocol error, disconnecting");
        if let Some(handle) = self.connection(id) {
            handle.close(DisconnectReason::Error);
        }
    }

    // end region
    // region control handlers

    fn on_room_create(&mut self, id: ConnectionId, version: i32, game_type: Option<GameType>) {
        let Some(handle) = self.connection(id) else {
            return;
        };
        if self.closed {
            self.reject_creation(&handle, CloseReason::ServerClosed);
            tracing::warn!(con = %id, "tried to create a room but the server is closing");
            return;
        }
        if version != PROTOCOL_VERSION {
            let newer = version > PROTOCOL_VERSION;
            let reason = if newer {
                CloseReason::OutdatedServer
            } else {
                CloseReason::OutdatedClient
            };
            self.reject_creation(&handle, reason);
            tracing::warn!(con = %id, version, "tried to create a room with a mismatched version");
            return;
        }
        if let Some(t) = game_type {
            if self.config.blacklisted_types.contains(&t) {
                self.reject_creation(&handle, CloseReason::Blacklisted);
                tracing::warn!(con = %id, game_type = %t, "tried to create a room with a blacklisted type");
                return;
            }
        }
        if let Some(&current) = self.con_to_room.get(&id) {
            self.deny_action(id, current, Notice::AlreadyHosting);
            tracing::warn!(con = %id, room = %current, "tried to create a room while already in one");
            return;
        }

        let room_id = self.new_room_id();
        let mut room = Room::new(room_id, handle.clone(), game_type, self.events.clone());
        handle.shared().set_host(true);
        self.con_to_room.insert(id, room_id);
        if let Some(t) = game_type {
            self.types.entry(t).or_default().insert(room_id);
        }
        room.create(Instant::now());
        self.rooms.insert(room_id, room);
        tracing::info!(room = %room_id, con = %id, "room created");
    }

    fn on_room_closure(&mut self, id: ConnectionId) {
        let Some(room_id) = self.check_room_host(id, Notice::RoomClosureDenied, "close the room")
        else {
            return;
        };
        self.close_room(room_id, CloseReason::Closed);
        tracing::info!(room = %room_id, con = %id, "room closed by its host");
    }

    #[allow(clippy::too_many_arguments)]
    fn on_room_join(
        &mut self,
        id: ConnectionId,
        is_request: bool,
        room_id: RoomId,
        game_type: Option<GameType>,
        with_password: bool,
        password: u16,
    ) {
        let Some(handle) = self.connection(id) else {
            return;
        };
        if let Some(&current) = self.con_to_room.get(&id) {
            let is_host = self
                .rooms
                .get(&current)
                .is_some_and(|room| room.is_host(id));
            if is_host {
                self.deny_action(id, current, Notice::AlreadyHosting);
                tracing::warn!(con = %id, room = %room_id, hosting = %current, "tried to join a room while hosting another");
                return;
            }
        }
        if self.closed {
            self.reject_join(&handle, room_id, RejectReason::ServerClosing, is_request);
            tracing::warn!(con = %id, room = %room_id, "tried to join a room but the server is closing");
            return;
        }
        if !self.rooms.contains_key(&room_id) {
            self.reject_join(&handle, room_id, RejectReason::RoomNotFound, is_request);
            tracing::warn!(con = %id, room = %room_id, "tried to join an unknown room");
            return;
        }
        let join_limit = self.config.join_limit;
        if !self.rater(handle.addr.ip()).allow_join(join_limit) {
            // Same visible effect as an unknown room, to frustrate
            // room-id enumeration.
            self.reject_join(&handle, room_id, RejectReason::RoomNotFound, is_request);
            tracing::warn!(con = %id, room = %room_id, "join rate limited");
            return;
        }
        {
            let room = &self.rooms[&room_id];
            let incompatible = match room.game_type {
                Some(room_type) => match game_type {
                    Some(t) => t != room_type,
                    None => !self.config.accept_no_type,
                },
                None => false,
            };
            if incompatible {
                self.reject_join(&handle, room_id, RejectReason::Incompatible, is_request);
                tracing::warn!(con = %id, room = %room_id, ?game_type, "tried to join a room of an incompatible type");
                return;
            }
            if room.is_protected && !with_password {
                self.reject_join(&handle, room_id, RejectReason::PasswordRequired, is_request);
                tracing::warn!(con = %id, room = %room_id, "tried to join a protected room without a password");
                return;
            }
            if room.is_protected && room.password != password {
                self.reject_join(&handle, room_id, RejectReason::InvalidPassword, is_request);
                tracing::warn!(con = %id, room = %room_id, "tried to join a protected room with the wrong password");
                return;
            }
        }

        if is_request {
            handle.send(&ControlPacket::RoomJoinAccepted { room_id });
            tracing::debug!(con = %id, room = %room_id, "join request validated");
            return;
        }

        // Commit: unhook any previous (client) membership first.
        if let Some(old_id) = self.con_to_room.remove(&id) {
            if let Some(old_room) = self.rooms.get_mut(&old_id) {
                old_room.disconnected(&handle, DisconnectReason::Closed);
            }
        }
        let address_hash = self.hasher.hash(handle.addr.ip());
        self.con_to_room.insert(id, room_id);
        let queued = self.packet_queue.remove(&id);
        let room = self
            .rooms
            .get_mut(&room_id)
            .expect("room checked above");
        room.connected(handle.clone(), address_hash);
        tracing::info!(con = %id, room = %room_id, ?game_type, "connection joined the room");
        if let Some(queued) = queued {
            tracing::debug!(con = %id, count = queued.len(), "forwarding queued early payloads");
            for (data, reliable) in queued {
                room.received_raw(id, data, reliable);
            }
        }
    }

    fn on_room_config(
        &mut self,
        id: ConnectionId,
        is_public: bool,
        is_protected: bool,
        password: u16,
        request_state: bool,
    ) {
        let Some(room_id) = self.check_room_host(id, Notice::ConfigureDenied, "configure the room")
        else {
            return;
        };
        let room = self.rooms.get_mut(&room_id).expect("host check found it");
        room.set_configuration(is_public, is_protected, password, request_state);
        let game_type = room.game_type;
        tracing::info!(room = %room_id, con = %id, "room reconfigured by its host");

        if let Some(t) = game_type {
            if let Some(cache) = self.list_cache.get_mut(&t) {
                let room = &self.rooms[&room_id];
                cache.apply(room, false);
            }
        }
    }

    fn on_room_state(&mut self, id: ConnectionId, state: Option<Vec<u8>>) {
        let Some(room_id) = self.check_room_host(id, Notice::StatingDenied, "set the room state")
        else {
            return;
        };
        let now = Instant::now();
        let room = self.rooms.get_mut(&room_id).expect("host check found it");
        let game_type = room.game_type;
        if let Err(err) = room.set_state(state, now) {
            let host = room.host.clone();
            tracing::warn!(room = %room_id, con = %id, %err, "oversized room state");
            host.close(DisconnectReason::Error);
            return;
        }
        tracing::info!(room = %room_id, con = %id, "room state updated by its host");

        self.flush_pending_state(room_id);

        if let Some(t) = game_type {
            if let Some(cache) = self.list_cache.get_mut(&t) {
                let room = &self.rooms[&room_id];
                cache.apply(room, true);
                if !cache.is_updating() {
                    self.flush_list(t);
                }
            }
        }
    }

    fn on_info_request(&mut self, id: ConnectionId, room_id: RoomId) {
        let Some(handle) = self.connection(id) else {
            return;
        };
        if !self.rater(handle.addr.ip()).allow_info() {
            handle.send(&ControlPacket::RoomInfoDenied);
            tracing::warn!(con = %id, room = %room_id, "info request rate limited");
            return;
        }
        let now = Instant::now();
        let state_timeout = self.config.state_timeout();
        let state_lifetime = self.config.state_lifetime();
        let Some(room) = self.rooms.get_mut(&room_id) else {
            handle.send(&ControlPacket::RoomInfoDenied);
            tracing::warn!(con = %id, room = %room_id, "info requested for an unknown room");
            return;
        };
        if room.should_request_state() && room.is_state_outdated(now, state_lifetime) {
            let in_progress = room.requesting_state;
            let requested = room.request_state(now, state_timeout);
            self.pending_info.entry(room_id).or_default().push(handle);
            if requested {
                self.timers
                    .schedule(TimerKey::StateWatchdog(room_id), now + state_timeout);
            }
            tracing::info!(con = %id, room = %room_id, in_progress, "info requested, awaiting fresh state");
        } else {
            room.send_room_state(&handle);
            tracing::info!(con = %id, room = %room_id, "info request answered from cache");
        }
    }

    fn on_list_request(&mut self, id: ConnectionId, game_type: Option<GameType>) {
        let Some(handle) = self.connection(id) else {
            return;
        };
        if !self.rater(handle.addr.ip()).allow_list() {
            handle.send(&self.empty_list);
            if let Some(t) = game_type {
                tracing::warn!(con = %id, game_type = %t, "list request rate limited");
            }
            return;
        }
        let Some(t) = game_type else {
            handle.send(&self.empty_list);
            return;
        };
        if !self.types.contains_key(&t) {
            handle.send(&self.empty_list);
            tracing::warn!(con = %id, game_type = %t, "list requested for an unknown type");
            return;
        }
        self.ensure_list_cache(t);
        let now = Instant::now();
        let list_lifetime = self.config.list_lifetime();
        let cache = self.list_cache.get_mut(&t).expect("just ensured");
        if cache.is_updating() {
            cache.pending.push(handle);
            tracing::info!(con = %id, game_type = %t, "list requested, refresh already running");
        } else if !cache.is_outdated(now, list_lifetime) {
            let packet = cache.build_packet();
            Self::send_list(&handle, &packet);
            tracing::info!(con = %id, game_type = %t, "list request answered from cache");
        } else {
            cache.pending.push(handle);
            self.refresh_list(t);
            tracing::info!(con = %id, game_type = %t, "list requested, refreshing");
        }
    }

    fn on_con_close(&mut self, id: ConnectionId, target_id: ConnectionId, reason: DisconnectReason) {
        let Some(room_id) = self.check_room_host(id, Notice::ConClosureDenied, "close a connection")
        else {
            return;
        };
        let target = self.connections.get(&target_id).map(|e| e.handle.clone());
        let valid = target.as_ref().is_some_and(|t| {
            t.id != id
                && self
                    .rooms
                    .get(&room_id)
                    .is_some_and(|room| room.contains(target_id))
        });
        let Some(target) = target.filter(|_| valid) else {
            self.deny_action(id, room_id, Notice::ConClosureDenied);
            tracing::warn!(con = %id, room = %room_id, target = %target_id, "refused to close a connection outside the room");
            return;
        };
        if let Some(room) = self.rooms.get_mut(&room_id) {
            room.disconnected_quietly(&target, reason);
        }
        self.con_to_room.remove(&target_id);
        self.packet_queue.remove(&target_id);
        target.close(reason);
        tracing::info!(con = %id, room = %room_id, target = %target_id, "host closed a client connection");
    }

    fn on_host_wrap(&mut self, id: ConnectionId, con_id: ConnectionId, is_tcp: bool, raw: Vec<u8>) {
        let Some(&room_id) = self.con_to_room.get(&id) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        if !room.is_host(id) {
            return;
        }
        // Traffic toward the client proves the host still cares about it;
        // let the next idle period be reported again.
        if let Some(entry) = self.connections.get(&con_id) {
            entry.handle.shared().clear_idle_notified();
        }
        room.received_wrap(con_id, is_tcp, raw);
    }

    // end region
    // region rooms & caches

    fn new_room_id(&self) -> RoomId {
        let mut rng = rand::thread_rng();
        loop {
            let id: u64 = rng.gen();
            // 0 is reserved for "uncreated".
            if id != 0 && !self.rooms.contains_key(&RoomId(id)) {
                return RoomId(id);
            }
        }
    }

    /// Close a room and every cache entry keyed by it, within this turn.
    fn close_room(&mut self, room_id: RoomId, reason: CloseReason) {
        let Some(mut room) = self.rooms.remove(&room_id) else {
            return;
        };
        if let Some(pending) = self.pending_info.remove(&room_id) {
            for con in pending {
                con.send(&ControlPacket::RoomInfoDenied);
            }
        }
        self.timers.cancel(&TimerKey::StateWatchdog(room_id));
        for client_id in room.clients.keys() {
            self.con_to_room.remove(client_id);
            self.packet_queue.remove(client_id);
        }
        self.con_to_room.remove(&room.host.id);
        room.host.shared().set_host(false);

        if let Some(t) = room.game_type {
            let mut type_emptied = false;
            if let Some(set) = self.types.get_mut(&t) {
                set.remove(&room_id);
                if set.is_empty() {
                    self.types.remove(&t);
                    type_emptied = true;
                }
            }
            if let Some(cache) = self.list_cache.get_mut(&t) {
                cache.remove(room_id);
                if type_emptied {
                    // Answer anyone still waiting before the cache goes.
                    self.flush_list(t);
                    self.list_cache.remove(&t);
                }
            }
        }

        room.close(reason);
    }

    fn ensure_list_cache(&mut self, game_type: GameType) {
        if self.list_cache.contains_key(&game_type) {
            return;
        }
        let rooms = match self.types.get(&game_type) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.rooms.get(id))
                .collect::<Vec<_>>(),
            None => Vec::new(),
        };
        let cache = CachedRoomList::new(game_type, rooms.into_iter());
        self.list_cache.insert(game_type, cache);
    }

    /// Run one coalesced refresh round for a type's list.
    fn refresh_list(&mut self, game_type: GameType) {
        let Some(ids) = self.types.get(&game_type) else {
            return;
        };
        let ids: Vec<RoomId> = ids.iter().copied().collect();
        let now = Instant::now();
        let state_timeout = self.config.state_timeout();
        let state_lifetime = self.config.state_lifetime();

        let mut requested = Vec::new();
        for room_id in ids {
            if let Some(room) = self.rooms.get_mut(&room_id) {
                if room.should_request_state()
                    && room.is_state_outdated(now, state_lifetime)
                    && room.request_state(now, state_timeout)
                {
                    requested.push(room_id);
                }
            }
        }

        let Some(cache) = self.list_cache.get_mut(&game_type) else {
            return;
        };
        cache.begin_refresh(now);
        for room_id in requested {
            cache.mark_requesting(room_id);
        }
        if cache.is_updating() {
            self.timers.schedule(
                TimerKey::ListRefresh(game_type),
                now + self.config.list_timeout(),
            );
        } else {
            self.flush_list(game_type);
        }
    }

    /// Answer every pending list requester with the current cache content.
    fn flush_list(&mut self, game_type: GameType) {
        self.timers.cancel(&TimerKey::ListRefresh(game_type));
        let Some(cache) = self.list_cache.get_mut(&game_type) else {
            return;
        };
        let targets = cache.flush();
        if targets.is_empty() {
            return;
        }
        let packet = cache.build_packet();
        tracing::debug!(game_type = %game_type, requesters = targets.len(), "sending room list");
        for con in &targets {
            Self::send_list(con, &packet);
        }
    }

    /// Lists ride the stream layer: they outgrow single frames quickly and
    /// preparing once serves every requester.
    fn send_list(con: &ConnectionHandle, packet: &ControlPacket) {
        match roomlink_protocol::PreparedStream::new(&Frame::Control(packet.clone())) {
            Ok(stream) => con.send_stream(&stream),
            Err(err) => tracing::warn!(con = %con.id, %err, "failed to prepare room list"),
        }
    }

    /// Send the room's state to everyone awaiting it. Returns whether
    /// anyone was.
    fn flush_pending_state(&mut self, room_id: RoomId) -> bool {
        let Some(pending) = self.pending_info.remove(&room_id) else {
            return false;
        };
        self.timers.cancel(&TimerKey::StateWatchdog(room_id));
        let Some(room) = self.rooms.get(&room_id) else {
            for con in pending {
                con.send(&ControlPacket::RoomInfoDenied);
            }
            return true;
        };
        tracing::debug!(room = %room_id, requesters = pending.len(), "sending room state to pending requests");
        for con in pending {
            room.send_room_state(&con);
        }
        true
    }

    // end region
    // region helpers

    fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.get(&id).map(|entry| entry.handle.clone())
    }

    fn rater(&mut self, ip: IpAddr) -> &AddressRater {
        self.rates.entry(ip).or_default()
    }

    fn deny_action(&mut self, con: ConnectionId, room_id: RoomId, notice: Notice) {
        if let Some(room) = self.rooms.get(&room_id) {
            room.notice(notice);
        }
        self.events.emit(RelayEvent::ActionDenied {
            con,
            room: room_id,
            notice,
        });
    }

    /// Returns the sender's room when it is that room's host; otherwise
    /// sends the denial notice and returns `None`.
    fn check_room_host(
        &mut self,
        id: ConnectionId,
        notice: Notice,
        action: &'static str,
    ) -> Option<RoomId> {
        let room_id = *self.con_to_room.get(&id)?;
        let room = self.rooms.get(&room_id)?;
        if room.is_host(id) {
            return Some(room_id);
        }
        self.deny_action(id, room_id, notice);
        tracing::warn!(con = %id, room = %room_id, action, "refused host-only action");
        None
    }

    fn reject_creation(&mut self, handle: &ConnectionHandle, reason: CloseReason) {
        handle.send(&ControlPacket::RoomClosed { reason });
        self.events.emit(RelayEvent::CreationRejected {
            con: handle.id,
            reason,
        });
        handle.close(DisconnectReason::Closed);
    }

    fn reject_join(
        &mut self,
        handle: &ConnectionHandle,
        room_id: RoomId,
        reason: RejectReason,
        is_request: bool,
    ) {
        if is_request {
            handle.send(&ControlPacket::RoomJoinDenied { room_id, reason });
            self.events.emit(RelayEvent::JoinRejected {
                con: handle.id,
                room: room_id,
                reason,
            });
            handle.close(DisconnectReason::Closed);
        } else {
            // A blind join that fails gets nothing it could distinguish.
            handle.close(DisconnectReason::Error);
        }
    }

    // end region
    // region operator commands & shutdown

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::CloseRoom { room, reply } => {
                let existed = self.rooms.contains_key(&room);
                if existed {
                    self.close_room(room, CloseReason::Closed);
                    tracing::info!(room = %room, "room closed by operator");
                }
                let _ = reply.send(existed);
            }
            Command::Say {
                target,
                text,
                reply,
            } => {
                let _ = reply.send(self.for_rooms(target, |room| room.message(&text)));
            }
            Command::Alert {
                target,
                text,
                reply,
            } => {
                let _ = reply.send(self.for_rooms(target, |room| room.popup(&text)));
            }
            Command::BlacklistAdd { addr, reply } => {
                let _ = reply.send(self.gate.blacklist_add(addr));
            }
            Command::BlacklistRemove { addr, reply } => {
                let _ = reply.send(self.gate.blacklist_remove(&addr));
            }
            Command::BlacklistList(reply) => {
                let _ = reply.send(self.gate.blacklist_snapshot());
            }
            Command::SetSpamLimit(limit) => {
                self.config.spam_limit = limit;
                self.gate.set_spam_limit(limit);
                tracing::info!(limit, "packet spam limit updated");
            }
            Command::SetJoinLimit(limit) => {
                self.config.join_limit = limit;
                tracing::info!(limit, "join limit updated");
            }
            Command::RefreshRoom { room, force, reply } => {
                let _ = reply.send(self.refresh_room_command(room, force));
            }
            Command::RefreshList {
                game_type,
                force,
                reply,
            } => {
                let _ = reply.send(self.refresh_list_command(game_type, force));
            }
            Command::Stop { done } => self.stop(done),
        }
    }

    fn for_rooms(&self, target: Option<RoomId>, f: impl Fn(&Room)) -> bool {
        match target {
            None => {
                for room in self.rooms.values() {
                    f(room);
                }
                true
            }
            Some(room_id) => match self.rooms.get(&room_id) {
                Some(room) => {
                    f(room);
                    true
                }
                None => false,
            },
        }
    }

    fn refresh_room_command(&mut self, room_id: RoomId, force: bool) -> RefreshOutcome {
        let now = Instant::now();
        let state_timeout = self.config.state_timeout();
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return RefreshOutcome::NotFound;
        };
        if !force && (!room.is_public || !room.can_request_state) {
            return RefreshOutcome::NotAllowed;
        }
        if room.request_state(now, state_timeout) {
            RefreshOutcome::Requested
        } else {
            RefreshOutcome::AlreadyPending
        }
    }

    fn refresh_list_command(
        &mut self,
        game_type: Option<GameType>,
        force: bool,
    ) -> RefreshOutcome {
        match game_type {
            None => {
                if self.types.is_empty() {
                    return RefreshOutcome::NotFound;
                }
                let all: Vec<GameType> = self.types.keys().copied().collect();
                for t in all {
                    self.ensure_list_cache(t);
                    self.refresh_list(t);
                }
                RefreshOutcome::Requested
            }
            Some(t) => {
                if !self.types.contains_key(&t) {
                    return RefreshOutcome::NotFound;
                }
                self.ensure_list_cache(t);
                let updating = self
                    .list_cache
                    .get(&t)
                    .is_some_and(CachedRoomList::is_updating);
                if !force && updating {
                    return RefreshOutcome::AlreadyPending;
                }
                self.refresh_list(t);
                RefreshOutcome::Requested
            }
        }
    }

    fn status(&self) -> StatusSnapshot {
        let now = Instant::now();
        let mut rooms: Vec<RoomStatus> = self
            .rooms
            .values()
            .map(|room| RoomStatus {
                id: room.id,
                game_type: room.game_type,
                is_public: room.is_public,
                is_protected: room.is_protected,
                host_addr: room.host.addr,
                host_con: room.host.id.short(),
                clients: room
                    .clients
                    .values()
                    .map(|c| (c.id.short(), c.addr))
                    .collect(),
                to_host: room.to_host,
                to_clients: room.to_clients,
                uptime_secs: room
                    .created_at()
                    .map(|at| now.saturating_duration_since(at).as_secs())
                    .unwrap_or(0),
            })
            .collect();
        rooms.sort_by_key(|status| status.id.0);
        StatusSnapshot {
            rooms,
            clients: self.con_to_room.len(),
            connections: self.connections.len(),
        }
    }

    fn stop(&mut self, done: Option<tokio::sync::oneshot::Sender<()>>) {
        if let Some(done) = done {
            self.stop_waiters.push(done);
        }
        if self.closed {
            // Second request forces the shutdown through.
            self.finish_stop();
            return;
        }
        self.closed = true;
        self.gate.close();

        let notify = self.config.warn_closing && !self.rooms.is_empty();
        self.events.emit(RelayEvent::Stopping { notified: notify });
        if notify {
            tracing::info!(
                wait_secs = self.config.close_wait_secs,
                "notifying rooms of the shutdown"
            );
            for room in self.rooms.values() {
                room.notice(Notice::ServerClosing);
            }
            self.timers.schedule(
                TimerKey::ShutdownGrace,
                Instant::now() + self.config.close_wait(),
            );
        } else {
            self.finish_stop();
        }
    }

    fn finish_stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.closed = true;
        self.gate.close();

        let room_ids: Vec<RoomId> = self.rooms.keys().copied().collect();
        for room_id in room_ids {
            self.close_room(room_id, CloseReason::ServerClosed);
        }

        self.packet_queue.clear();
        for (_, pending) in self.pending_info.drain() {
            for con in pending {
                con.send(&ControlPacket::RoomInfoDenied);
            }
        }
        let cached_types: Vec<GameType> = self.list_cache.keys().copied().collect();
        for t in cached_types {
            self.flush_list(t);
        }
        self.list_cache.clear();
        self.timers.clear();

        for entry in self.connections.values() {
            entry.handle.close(DisconnectReason::Closed);
        }
        self.cancel.cancel();

        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
        tracing::info!("relay shut down");
    }

    // end region
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use roomlink_protocol::decode_frame;
    use tokio::sync::mpsc::Receiver;

    fn test_config() -> RelayConfig {
        RelayConfig {
            join_limit: 0,
            ..RelayConfig::default()
        }
    }

    fn test_relay(config: RelayConfig) -> Relay {
        let gate = Arc::new(Gate::new(&config));
        Relay::new(config, gate, Events::new(), CancellationToken::new())
    }

    /// Register a connection; distinct `ip_octet`s get distinct addresses
    /// (and therefore independent address raters).
    fn connect(
        relay: &mut Relay,
        id: u32,
        ip_octet: u8,
    ) -> (ConnectionHandle, Receiver<Outbound>) {
        let addr = format!("127.0.0.{ip_octet}:{}", 40000 + id)
            .parse()
            .unwrap();
        let (handle, rx) = ConnectionHandle::for_tests(id, addr);
        relay.handle_message(RelayMessage::Connected {
            handle: handle.clone(),
        });
        (handle, rx)
    }

    /// Drain a connection's outbound queue into decoded control packets,
    /// raw payloads and transport closes, reassembling streams.
    struct Drained {
        controls: Vec<ControlPacket>,
        raws: Vec<(Vec<u8>, bool)>,
        closes: Vec<DisconnectReason>,
    }

    fn drain(rx: &mut Receiver<Outbound>) -> Drained {
        let mut out = Drained {
            controls: Vec::new(),
            raws: Vec::new(),
            closes: Vec::new(),
        };
        let mut assemblers = AssemblerMap::new();
        while let Ok(item) = rx.try_recv() {
            match item {
                Outbound::Frame { bytes, reliable } => match decode_frame(&bytes).unwrap() {
                    Frame::Control(packet) => out.controls.push(packet),
                    Frame::Raw(data) => out.raws.push((data, reliable)),
                    Frame::StreamHead(head) => assemblers.head(head).unwrap(),
                    Frame::StreamChunk(chunk) => {
                        if let Some(Frame::Control(packet)) = assemblers.chunk(&chunk).unwrap() {
                            out.controls.push(packet);
                        }
                    }
                    other => panic!("unexpected frame {other:?}"),
                },
                Outbound::Close(reason) => out.closes.push(reason),
                Outbound::BindUdp(_) => {}
            }
        }
        out
    }

    fn game_type() -> GameType {
        "game".parse().unwrap()
    }

    /// Create a room for `host` and return its id from the RoomLink reply.
    fn create_room(
        relay: &mut Relay,
        host: &ConnectionHandle,
        rx: &mut Receiver<Outbound>,
    ) -> RoomId {
        relay.handle_message(RelayMessage::Frame {
            id: host.id,
            frame: Frame::Control(ControlPacket::RoomCreationRequest {
                version: PROTOCOL_VERSION,
                game_type: Some(game_type()),
            }),
            reliable: true,
        });
        let drained = drain(rx);
        match drained.controls.as_slice() {
            [ControlPacket::RoomLink { room_id }] => *room_id,
            other => panic!("expected a room link, got {other:?}"),
        }
    }

    fn join(relay: &mut Relay, con: &ConnectionHandle, room_id: RoomId) {
        relay.handle_message(RelayMessage::Frame {
            id: con.id,
            frame: Frame::Control(ControlPacket::RoomJoin {
                room_id,
                game_type: Some(game_type()),
                with_password: false,
                password: 0,
            }),
            reliable: true,
        });
    }

    fn control(relay: &mut Relay, con: &ConnectionHandle, packet: ControlPacket) {
        relay.handle_message(RelayMessage::Frame {
            id: con.id,
            frame: Frame::Control(packet),
            reliable: true,
        });
    }

    fn raw(relay: &mut Relay, con: &ConnectionHandle, data: &[u8], reliable: bool) {
        relay.handle_message(RelayMessage::Frame {
            id: con.id,
            frame: Frame::Raw(data.to_vec()),
            reliable,
        });
    }

    fn fire_due_timers(relay: &mut Relay) {
        let now = Instant::now();
        while let Some(key) = relay.timers.pop_due(now) {
            relay.fire_timer(key);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forwarding_round_trip() {
        let mut relay = test_relay(test_config());
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let (client, mut client_rx) = connect(&mut relay, 2, 2);
        let room_id = create_room(&mut relay, &host, &mut host_rx);

        join(&mut relay, &client, room_id);
        let joined = drain(&mut host_rx);
        assert!(matches!(
            joined.controls.as_slice(),
            [ControlPacket::ConnectionJoin { con_id, .. }] if *con_id == client.id
        ));

        // Client → host, reliable.
        raw(&mut relay, &client, &[0xDE, 0xAD, 0xBE, 0xEF], true);
        let wrapped = drain(&mut host_rx);
        match wrapped.controls.as_slice() {
            [ControlPacket::ConnectionPacketWrap { con_id, is_tcp, raw }] => {
                assert_eq!(*con_id, client.id);
                assert!(*is_tcp);
                assert_eq!(raw, &[0xDE, 0xAD, 0xBE, 0xEF]);
            }
            other => panic!("expected one wrap, got {other:?}"),
        }

        // Host → client, unreliable.
        control(
            &mut relay,
            &host,
            ControlPacket::ConnectionPacketWrap {
                con_id: client.id,
                is_tcp: false,
                raw: vec![0xFE, 0xED],
            },
        );
        let unwrapped = drain(&mut client_rx);
        assert_eq!(unwrapped.raws, vec![(vec![0xFE, 0xED], false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn early_payloads_are_queued_and_replayed_in_order() {
        let mut relay = test_relay(test_config());
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let (client, _client_rx) = connect(&mut relay, 2, 2);
        let room_id = create_room(&mut relay, &host, &mut host_rx);

        // Payloads land before the join packet; one more than fits.
        raw(&mut relay, &client, b"A", true);
        raw(&mut relay, &client, b"B", true);
        raw(&mut relay, &client, b"C", true);
        raw(&mut relay, &client, b"overflow", true);
        assert!(drain(&mut host_rx).controls.is_empty());

        join(&mut relay, &client, room_id);
        let drained = drain(&mut host_rx);
        let raws: Vec<&[u8]> = drained
            .controls
            .iter()
            .filter_map(|p| match p {
                ControlPacket::ConnectionPacketWrap { raw, .. } => Some(raw.as_slice()),
                _ => None,
            })
            .collect();
        assert_eq!(raws, vec![b"A".as_slice(), b"B".as_slice(), b"C".as_slice()]);
        assert!(relay.packet_queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn host_death_cascades_in_one_turn() {
        let mut relay = test_relay(test_config());
        let mut events = relay.events.subscribe();
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let (client, mut client_rx) = connect(&mut relay, 2, 2);
        let room_id = create_room(&mut relay, &host, &mut host_rx);
        join(&mut relay, &client, room_id);

        relay.handle_message(RelayMessage::Disconnected {
            id: host.id,
            reason: DisconnectReason::Error,
        });

        // Client transport closed with the same reason.
        let client_drained = drain(&mut client_rx);
        assert_eq!(client_drained.closes, vec![DisconnectReason::Error]);

        // All indices are clean within the same turn.
        assert!(relay.rooms.is_empty());
        assert!(relay.con_to_room.is_empty());
        assert!(relay.types.is_empty());
        assert!(relay.packet_queue.is_empty());

        // Exactly one closed event, carrying the mapped reason.
        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            if let RelayEvent::RoomClosed { room, reason } = event {
                assert_eq!(room, room_id);
                assert_eq!(reason, CloseReason::Error);
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn create_then_close_restores_every_map() {
        let mut relay = test_relay(test_config());
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let (client, _client_rx) = connect(&mut relay, 2, 2);
        let room_id = create_room(&mut relay, &host, &mut host_rx);
        join(&mut relay, &client, room_id);

        control(&mut relay, &host, ControlPacket::RoomClosureRequest);

        assert!(relay.rooms.is_empty());
        assert!(relay.con_to_room.is_empty());
        assert!(relay.types.is_empty());
        assert!(relay.list_cache.is_empty());
        assert!(relay.pending_info.is_empty());
        assert!(!relay.timers.is_armed(&TimerKey::StateWatchdog(room_id)));
        let drained = drain(&mut host_rx);
        assert!(matches!(
            drained.controls.last(),
            Some(ControlPacket::RoomClosed {
                reason: CloseReason::Closed
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn list_requests_coalesce_into_one_refresh() {
        let mut relay = test_relay(test_config());
        let mut hosts = Vec::new();
        for i in 0..5u32 {
            let (host, mut host_rx) = connect(&mut relay, 10 + i, (10 + i) as u8);
            let room_id = create_room(&mut relay, &host, &mut host_rx);
            control(
                &mut relay,
                &host,
                ControlPacket::RoomConfig {
                    is_public: true,
                    is_protected: false,
                    password: 0,
                    request_state: true,
                },
            );
            hosts.push((host, host_rx, room_id));
        }

        let (c1, mut c1_rx) = connect(&mut relay, 20, 20);
        let (c2, mut c2_rx) = connect(&mut relay, 21, 21);

        control(
            &mut relay,
            &c1,
            ControlPacket::RoomListRequest {
                game_type: Some(game_type()),
            },
        );
        control(
            &mut relay,
            &c2,
            ControlPacket::RoomListRequest {
                game_type: Some(game_type()),
            },
        );

        // Exactly one refresh: every host saw exactly one state request.
        for (_, host_rx, _) in &mut hosts {
            let drained = drain(host_rx);
            let requests = drained
                .controls
                .iter()
                .filter(|p| matches!(p, ControlPacket::RoomStateRequest))
                .count();
            assert_eq!(requests, 1);
        }
        // Nobody has been answered yet.
        assert!(drain(&mut c1_rx).controls.is_empty());
        assert!(drain(&mut c2_rx).controls.is_empty());

        // All hosts reply; the flush happens on the last one.
        for (host, _, _) in &hosts {
            control(
                &mut relay,
                host,
                ControlPacket::RoomState {
                    state: Some(vec![0xAB]),
                },
            );
        }

        let l1 = drain(&mut c1_rx);
        let l2 = drain(&mut c2_rx);
        match (l1.controls.as_slice(), l2.controls.as_slice()) {
            (
                [ControlPacket::RoomList { states: s1, .. }],
                [ControlPacket::RoomList { states: s2, .. }],
            ) => {
                assert_eq!(s1.len(), 5);
                assert_eq!(s1, s2);
            }
            other => panic!("expected one list each, got {other:?}"),
        }
        assert!(!relay.timers.is_armed(&TimerKey::ListRefresh(game_type())));
    }

    #[tokio::test(start_paused = true)]
    async fn list_watchdog_flushes_despite_silent_hosts() {
        let mut relay = test_relay(test_config());
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let room_id = create_room(&mut relay, &host, &mut host_rx);
        control(
            &mut relay,
            &host,
            ControlPacket::RoomConfig {
                is_public: true,
                is_protected: false,
                password: 0,
                request_state: true,
            },
        );

        let (client, mut client_rx) = connect(&mut relay, 2, 2);
        control(
            &mut relay,
            &client,
            ControlPacket::RoomListRequest {
                game_type: Some(game_type()),
            },
        );
        assert!(relay.timers.is_armed(&TimerKey::ListRefresh(game_type())));
        assert!(drain(&mut client_rx).controls.is_empty());

        // The host never answers; the watchdog flushes what exists.
        tokio::time::advance(relay.config.list_timeout()).await;
        fire_due_timers(&mut relay);

        let drained = drain(&mut client_rx);
        match drained.controls.as_slice() {
            [ControlPacket::RoomList { states, .. }] => {
                assert_eq!(states.len(), 1);
                assert_eq!(states[0].room_id, room_id);
                assert_eq!(states[0].state, None);
            }
            other => panic!("expected a list, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn password_gate() {
        let mut relay = test_relay(test_config());
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let room_id = create_room(&mut relay, &host, &mut host_rx);
        control(
            &mut relay,
            &host,
            ControlPacket::RoomConfig {
                is_public: false,
                is_protected: true,
                password: 0x1234,
                request_state: false,
            },
        );

        let request = |with_password: bool, password: u16| ControlPacket::RoomJoinRequest {
            room_id,
            game_type: Some(game_type()),
            with_password,
            password,
        };

        let (c1, mut c1_rx) = connect(&mut relay, 2, 2);
        control(&mut relay, &c1, request(false, 0));
        assert!(matches!(
            drain(&mut c1_rx).controls.as_slice(),
            [ControlPacket::RoomJoinDenied {
                reason: RejectReason::PasswordRequired,
                ..
            }]
        ));

        let (c2, mut c2_rx) = connect(&mut relay, 3, 3);
        control(&mut relay, &c2, request(true, 0x0000));
        assert!(matches!(
            drain(&mut c2_rx).controls.as_slice(),
            [ControlPacket::RoomJoinDenied {
                reason: RejectReason::InvalidPassword,
                ..
            }]
        ));

        let (c3, mut c3_rx) = connect(&mut relay, 4, 4);
        control(&mut relay, &c3, request(true, 0x1234));
        assert!(matches!(
            drain(&mut c3_rx).controls.as_slice(),
            [ControlPacket::RoomJoinAccepted { room_id: accepted }] if *accepted == room_id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn type_gate_honors_accept_no_type() {
        let mut relay = test_relay(RelayConfig {
            accept_no_type: true,
            ..test_config()
        });
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let room_id = create_room(&mut relay, &host, &mut host_rx);

        // Wrong label is incompatible.
        let (c1, mut c1_rx) = connect(&mut relay, 2, 2);
        control(
            &mut relay,
            &c1,
            ControlPacket::RoomJoinRequest {
                room_id,
                game_type: Some("other".parse().unwrap()),
                with_password: false,
                password: 0,
            },
        );
        assert!(matches!(
            drain(&mut c1_rx).controls.as_slice(),
            [ControlPacket::RoomJoinDenied {
                reason: RejectReason::Incompatible,
                ..
            }]
        ));

        // No label is allowed through by configuration.
        let (c2, mut c2_rx) = connect(&mut relay, 3, 3);
        control(
            &mut relay,
            &c2,
            ControlPacket::RoomJoinRequest {
                room_id,
                game_type: None,
                with_password: false,
                password: 0,
            },
        );
        assert!(matches!(
            drain(&mut c2_rx).controls.as_slice(),
            [ControlPacket::RoomJoinAccepted { .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn join_rate_limit_masquerades_as_not_found() {
        let mut relay = test_relay(RelayConfig {
            join_limit: 2,
            ..RelayConfig::default()
        });
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let room_id = create_room(&mut relay, &host, &mut host_rx);

        // Three probes from the same address.
        for i in 0..3u32 {
            let (con, mut con_rx) = connect(&mut relay, 10 + i, 2);
            control(
                &mut relay,
                &con,
                ControlPacket::RoomJoinRequest {
                    room_id,
                    game_type: Some(game_type()),
                    with_password: false,
                    password: 0,
                },
            );
            let drained = drain(&mut con_rx);
            if i < 2 {
                assert!(matches!(
                    drained.controls.as_slice(),
                    [ControlPacket::RoomJoinAccepted { .. }]
                ));
            } else {
                assert!(matches!(
                    drained.controls.as_slice(),
                    [ControlPacket::RoomJoinDenied {
                        reason: RejectReason::RoomNotFound,
                        ..
                    }]
                ));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn info_requests_are_rate_limited_per_address() {
        let mut relay = test_relay(test_config());
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let room_id = create_room(&mut relay, &host, &mut host_rx);
        // Public but not requestable: every request answers immediately.
        control(
            &mut relay,
            &host,
            ControlPacket::RoomConfig {
                is_public: true,
                is_protected: false,
                password: 0,
                request_state: false,
            },
        );

        let (client, mut client_rx) = connect(&mut relay, 2, 2);
        for _ in 0..11 {
            control(&mut relay, &client, ControlPacket::RoomInfoRequest { room_id });
        }
        let drained = drain(&mut client_rx);
        let infos = drained
            .controls
            .iter()
            .filter(|p| matches!(p, ControlPacket::RoomInfo { .. }))
            .count();
        let denied = drained
            .controls
            .iter()
            .filter(|p| matches!(p, ControlPacket::RoomInfoDenied))
            .count();
        assert_eq!(infos, 10);
        assert_eq!(denied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn info_request_waits_for_state_then_watchdog_flushes() {
        let mut relay = test_relay(test_config());
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let room_id = create_room(&mut relay, &host, &mut host_rx);
        control(
            &mut relay,
            &host,
            ControlPacket::RoomConfig {
                is_public: true,
                is_protected: false,
                password: 0,
                request_state: true,
            },
        );

        let (client, mut client_rx) = connect(&mut relay, 2, 2);
        control(&mut relay, &client, ControlPacket::RoomInfoRequest { room_id });

        // The host got a state request, the client nothing yet.
        assert!(drain(&mut host_rx)
            .controls
            .iter()
            .any(|p| matches!(p, ControlPacket::RoomStateRequest)));
        assert!(drain(&mut client_rx).controls.is_empty());
        assert!(relay.timers.is_armed(&TimerKey::StateWatchdog(room_id)));

        // A second requester piggybacks without a second state request.
        let (other, mut other_rx) = connect(&mut relay, 3, 3);
        control(&mut relay, &other, ControlPacket::RoomInfoRequest { room_id });
        assert!(drain(&mut host_rx).controls.is_empty());

        // Host stays silent; the watchdog flushes what exists.
        tokio::time::advance(relay.config.state_timeout()).await;
        fire_due_timers(&mut relay);

        for rx in [&mut client_rx, &mut other_rx] {
            assert!(matches!(
                drain(rx).controls.as_slice(),
                [ControlPacket::RoomInfo { state: None, .. }]
            ));
        }
        assert!(relay.pending_info.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn info_flushes_as_soon_as_state_arrives() {
        let mut relay = test_relay(test_config());
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let room_id = create_room(&mut relay, &host, &mut host_rx);
        control(
            &mut relay,
            &host,
            ControlPacket::RoomConfig {
                is_public: true,
                is_protected: false,
                password: 0,
                request_state: true,
            },
        );
        let (client, mut client_rx) = connect(&mut relay, 2, 2);
        control(&mut relay, &client, ControlPacket::RoomInfoRequest { room_id });

        control(
            &mut relay,
            &host,
            ControlPacket::RoomState {
                state: Some(vec![1, 2, 3]),
            },
        );
        match drain(&mut client_rx).controls.as_slice() {
            [ControlPacket::RoomInfo { state, .. }] => {
                assert_eq!(state.as_deref(), Some(&[1u8, 2, 3][..]));
            }
            other => panic!("expected info, got {other:?}"),
        }
        assert!(!relay.timers.is_armed(&TimerKey::StateWatchdog(room_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn host_only_operations_refuse_clients() {
        let mut relay = test_relay(test_config());
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let (client, _client_rx) = connect(&mut relay, 2, 2);
        let room_id = create_room(&mut relay, &host, &mut host_rx);
        join(&mut relay, &client, room_id);
        drain(&mut host_rx);

        control(
            &mut relay,
            &client,
            ControlPacket::RoomConfig {
                is_public: true,
                is_protected: false,
                password: 0,
                request_state: true,
            },
        );
        // The host hears a toast; the room is untouched.
        assert!(matches!(
            drain(&mut host_rx).controls.as_slice(),
            [ControlPacket::Message {
                notice: Notice::ConfigureDenied
            }]
        ));
        assert!(!relay.rooms[&room_id].is_public);

        control(&mut relay, &client, ControlPacket::RoomClosureRequest);
        assert!(matches!(
            drain(&mut host_rx).controls.as_slice(),
            [ControlPacket::Message {
                notice: Notice::RoomClosureDenied
            }]
        ));
        assert!(relay.rooms.contains_key(&room_id));
    }

    #[tokio::test(start_paused = true)]
    async fn host_can_kick_a_client_quietly() {
        let mut relay = test_relay(test_config());
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let (client, mut client_rx) = connect(&mut relay, 2, 2);
        let room_id = create_room(&mut relay, &host, &mut host_rx);
        join(&mut relay, &client, room_id);
        drain(&mut host_rx);

        control(
            &mut relay,
            &host,
            ControlPacket::ConnectionClosed {
                con_id: client.id,
                reason: DisconnectReason::Closed,
            },
        );
        // No echo back to the host, and the client is closed.
        assert!(drain(&mut host_rx).controls.is_empty());
        assert_eq!(drain(&mut client_rx).closes, vec![DisconnectReason::Closed]);
        assert!(!relay.con_to_room.contains_key(&client.id));

        // Kicking a connection outside the room is refused.
        let (outsider, _outsider_rx) = connect(&mut relay, 3, 3);
        control(
            &mut relay,
            &host,
            ControlPacket::ConnectionClosed {
                con_id: outsider.id,
                reason: DisconnectReason::Closed,
            },
        );
        assert!(matches!(
            drain(&mut host_rx).controls.as_slice(),
            [ControlPacket::Message {
                notice: Notice::ConClosureDenied
            }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn spamming_client_is_kicked_and_room_warned() {
        let mut relay = test_relay(test_config());
        let mut events = relay.events.subscribe();
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let (client, mut client_rx) = connect(&mut relay, 2, 2);
        let room_id = create_room(&mut relay, &host, &mut host_rx);
        join(&mut relay, &client, room_id);
        drain(&mut host_rx);

        relay.handle_message(RelayMessage::RateLimited { id: client.id });

        let host_drained = drain(&mut host_rx);
        assert!(host_drained.controls.iter().any(|p| matches!(
            p,
            ControlPacket::Message {
                notice: Notice::PacketSpamming
            }
        )));
        assert!(host_drained.controls.iter().any(|p| matches!(
            p,
            ControlPacket::ConnectionClosed { con_id, .. } if *con_id == client.id
        )));
        assert_eq!(drain(&mut client_rx).closes, vec![DisconnectReason::Closed]);
        assert!(!relay.con_to_room.contains_key(&client.id));
        assert!(events
            .try_recv()
            .into_iter()
            .chain(std::iter::from_fn(|| events.try_recv().ok()))
            .any(|e| matches!(e, RelayEvent::ClientKicked { con } if con == client.id)));

        // Hosts are exempt even if the reader misfires.
        relay.handle_message(RelayMessage::RateLimited { id: host.id });
        assert!(relay.rooms.contains_key(&room_id));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_is_forwarded_and_cleared_by_host_traffic() {
        let mut relay = test_relay(test_config());
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let (client, _client_rx) = connect(&mut relay, 2, 2);
        let room_id = create_room(&mut relay, &host, &mut host_rx);
        join(&mut relay, &client, room_id);
        drain(&mut host_rx);

        // The transport gates repeats through the shared flag.
        assert!(client.shared().mark_idle_notified());
        relay.handle_message(RelayMessage::Idle { id: client.id });
        assert!(matches!(
            drain(&mut host_rx).controls.as_slice(),
            [ControlPacket::ConnectionIdling { con_id }] if *con_id == client.id
        ));
        assert!(!client.shared().mark_idle_notified());

        // Host traffic toward the client re-arms the notification.
        control(
            &mut relay,
            &host,
            ControlPacket::ConnectionPacketWrap {
                con_id: client.id,
                is_tcp: true,
                raw: vec![1],
            },
        );
        assert!(client.shared().mark_idle_notified());
    }

    #[tokio::test(start_paused = true)]
    async fn version_and_type_gate_room_creation() {
        let mut relay = test_relay(RelayConfig {
            blacklisted_types: ["evil".parse().unwrap()].into_iter().collect(),
            ..test_config()
        });

        let (old, mut old_rx) = connect(&mut relay, 1, 1);
        control(
            &mut relay,
            &old,
            ControlPacket::RoomCreationRequest {
                version: PROTOCOL_VERSION - 1,
                game_type: Some(game_type()),
            },
        );
        assert!(matches!(
            drain(&mut old_rx).controls.as_slice(),
            [ControlPacket::RoomClosed {
                reason: CloseReason::OutdatedClient
            }]
        ));

        let (new, mut new_rx) = connect(&mut relay, 2, 2);
        control(
            &mut relay,
            &new,
            ControlPacket::RoomCreationRequest {
                version: PROTOCOL_VERSION + 1,
                game_type: Some(game_type()),
            },
        );
        assert!(matches!(
            drain(&mut new_rx).controls.as_slice(),
            [ControlPacket::RoomClosed {
                reason: CloseReason::OutdatedServer
            }]
        ));

        let (evil, mut evil_rx) = connect(&mut relay, 3, 3);
        control(
            &mut relay,
            &evil,
            ControlPacket::RoomCreationRequest {
                version: PROTOCOL_VERSION,
                game_type: Some("evil".parse().unwrap()),
            },
        );
        assert!(matches!(
            drain(&mut evil_rx).controls.as_slice(),
            [ControlPacket::RoomClosed {
                reason: CloseReason::Blacklisted
            }]
        ));
        assert!(relay.rooms.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn udp_registration_routes_datagrams_to_the_room() {
        let mut relay = test_relay(test_config());
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let (client, _client_rx) = connect(&mut relay, 2, 2);
        let room_id = create_room(&mut relay, &host, &mut host_rx);
        join(&mut relay, &client, room_id);
        drain(&mut host_rx);

        // Registration from a foreign address is refused.
        let foreign: SocketAddr = "10.1.1.1:9999".parse().unwrap();
        relay.handle_message(RelayMessage::UdpRegister {
            id: client.id,
            addr: foreign,
        });
        assert!(relay.udp_peers.is_empty());

        let udp_addr: SocketAddr = format!("{}:45555", client.addr.ip()).parse().unwrap();
        relay.handle_message(RelayMessage::UdpRegister {
            id: client.id,
            addr: udp_addr,
        });
        relay.handle_message(RelayMessage::UdpDatagram {
            addr: udp_addr,
            frame: Frame::Raw(vec![0x11]),
        });
        match drain(&mut host_rx).controls.as_slice() {
            [ControlPacket::ConnectionPacketWrap { con_id, is_tcp, raw }] => {
                assert_eq!(*con_id, client.id);
                assert!(!*is_tcp);
                assert_eq!(raw, &[0x11]);
            }
            other => panic!("expected one wrap, got {other:?}"),
        }

        // An unregistered source is ignored entirely.
        relay.handle_message(RelayMessage::UdpDatagram {
            addr: "10.9.9.9:1000".parse().unwrap(),
            frame: Frame::Raw(vec![0x22]),
        });
        assert!(drain(&mut host_rx).controls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_chunk_without_head_disconnects_the_sender() {
        let mut relay = test_relay(test_config());
        let (con, mut con_rx) = connect(&mut relay, 1, 1);
        relay.handle_message(RelayMessage::Frame {
            id: con.id,
            frame: Frame::StreamChunk(roomlink_protocol::StreamChunk {
                id: 7,
                data: vec![1, 2, 3],
                last: true,
            }),
            reliable: true,
        });
        assert_eq!(drain(&mut con_rx).closes, vec![DisconnectReason::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_warns_rooms_then_cascades() {
        let mut relay = test_relay(RelayConfig {
            close_wait_secs: 5,
            ..test_config()
        });
        let (host, mut host_rx) = connect(&mut relay, 1, 1);
        let _room_id = create_room(&mut relay, &host, &mut host_rx);

        relay.handle_message(RelayMessage::Command(Command::Stop { done: None }));

        // Closing notice first, room still alive through the grace period.
        assert!(matches!(
            drain(&mut host_rx).controls.as_slice(),
            [ControlPacket::Message {
                notice: Notice::ServerClosing
            }]
        ));
        assert!(!relay.rooms.is_empty());
        assert!(relay.gate.is_closed());

        // New work is refused while draining.
        let (late, mut late_rx) = connect(&mut relay, 2, 2);
        control(
            &mut relay,
            &late,
            ControlPacket::RoomCreationRequest {
                version: PROTOCOL_VERSION,
                game_type: Some(game_type()),
            },
        );
        assert!(matches!(
            drain(&mut late_rx).controls.as_slice(),
            [ControlPacket::RoomClosed {
                reason: CloseReason::ServerClosed
            }]
        ));

        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        fire_due_timers(&mut relay);

        assert!(relay.stopped);
        assert!(relay.rooms.is_empty());
        let drained = drain(&mut host_rx);
        assert!(drained.controls.iter().any(|p| matches!(
            p,
            ControlPacket::RoomClosed {
                reason: CloseReason::ServerClosed
            }
        )));
        assert!(relay.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn joining_a_second_room_unhooks_the_first() {
        let mut relay = test_relay(test_config());
        let (host_a, mut host_a_rx) = connect(&mut relay, 1, 1);
        let (host_b, mut host_b_rx) = connect(&mut relay, 2, 2);
        let (client, _client_rx) = connect(&mut relay, 3, 3);
        let room_a = create_room(&mut relay, &host_a, &mut host_a_rx);
        let room_b = create_room(&mut relay, &host_b, &mut host_b_rx);

        join(&mut relay, &client, room_a);
        drain(&mut host_a_rx);

        join(&mut relay, &client, room_b);
        // Old host learns the client left; new host learns it arrived.
        assert!(matches!(
            drain(&mut host_a_rx).controls.as_slice(),
            [ControlPacket::ConnectionClosed { con_id, .. }] if *con_id == client.id
        ));
        assert!(matches!(
            drain(&mut host_b_rx).controls.as_slice(),
            [ControlPacket::ConnectionJoin { con_id, .. }] if *con_id == client.id
        ));
        assert_eq!(relay.con_to_room[&client.id], room_b);
        assert!(!relay.rooms[&room_a].contains(client.id));

        // A host cannot join someone else's room.
        join(&mut relay, &host_a, room_b);
        assert!(matches!(
            drain(&mut host_a_rx).controls.as_slice(),
            [ControlPacket::Message {
                notice: Notice::AlreadyHosting
            }]
        ));
        assert!(relay.rooms.contains_key(&room_a));
    }

    #[tokio::test(start_paused = true)]
    async fn obsolete_text_clients_are_turned_away() {
        let mut relay = test_relay(test_config());
        let (con, mut con_rx) = connect(&mut relay, 1, 1);
        relay.handle_message(RelayMessage::Frame {
            id: con.id,
            frame: Frame::Text("join please".to_string()),
            reliable: true,
        });
        let drained = drain(&mut con_rx);
        assert!(matches!(
            drained.controls.as_slice(),
            [ControlPacket::TextMessage { .. }]
        ));
        assert_eq!(drained.closes, vec![DisconnectReason::Error]);
    }
}
