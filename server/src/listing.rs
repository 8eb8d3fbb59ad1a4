//! Per-type room-list cache.
//!
//! Keeps a ready-to-send view of every listable room of one game type so a
//! burst of list requests costs the hosts at most one state-refresh round.
//! Requesters that arrive while a refresh is running pile into `pending`
//! and are all answered by the same flush; the dispatcher arms a watchdog
//! so a host that never answers cannot strand them.

use std::collections::{HashMap, HashSet};

use roomlink_protocol::{ControlPacket, GameType, RoomId, RoomListEntry};
use tokio::time::Instant;

use crate::connection::ConnectionHandle;
use crate::room::Room;

#[derive(Debug, Clone)]
struct ListEntry {
    state: Option<Vec<u8>>,
    protected: bool,
}

pub struct CachedRoomList {
    pub game_type: GameType,
    entries: HashMap<RoomId, ListEntry>,
    /// Requesters awaiting the next flush.
    pub pending: Vec<ConnectionHandle>,
    /// Rooms whose state reply is still outstanding in the current refresh.
    pub requesting: HashSet<RoomId>,
    last_update: Option<Instant>,
}

impl CachedRoomList {
    /// Seed the cache from the current rooms of this type.
    pub fn new<'a>(game_type: GameType, rooms: impl Iterator<Item = &'a Room>) -> Self {
        let mut entries = HashMap::new();
        for room in rooms {
            if !room.should_request_state() {
                continue;
            }
            entries.insert(
                room.id,
                ListEntry {
                    state: room.raw_state.clone(),
                    protected: room.is_protected,
                },
            );
        }
        Self {
            game_type,
            entries,
            pending: Vec::new(),
            requesting: HashSet::new(),
            last_update: None,
        }
    }

    /// Drop a room from the list entirely.
    pub fn remove(&mut self, room_id: RoomId) {
        self.entries.remove(&room_id);
        self.requesting.remove(&room_id);
    }

    /// Reflect a room's current configuration/state. `state_changed` marks
    /// a fresh snapshot, which settles the room's outstanding request.
    pub fn apply(&mut self, room: &Room, state_changed: bool) {
        if !room.is_public {
            self.remove(room.id);
            return;
        }
        self.entries.insert(
            room.id,
            ListEntry {
                state: room.raw_state.clone(),
                protected: room.is_protected,
            },
        );
        if state_changed {
            self.requesting.remove(&room.id);
        }
    }

    /// Start a refresh round. The dispatcher follows up by requesting
    /// state from each room that needs it and marking it requesting.
    pub fn begin_refresh(&mut self, now: Instant) {
        self.last_update = Some(now);
    }

    pub fn mark_requesting(&mut self, room_id: RoomId) {
        self.requesting.insert(room_id);
    }

    /// Whether a refresh round is still waiting on state replies.
    pub fn is_updating(&self) -> bool {
        !self.requesting.is_empty()
    }

    pub fn is_outdated(&self, now: Instant, list_lifetime: std::time::Duration) -> bool {
        match self.last_update {
            Some(at) => now.saturating_duration_since(at) >= list_lifetime,
            None => true,
        }
    }

    /// Build the list packet from the cached entries.
    pub fn build_packet(&self) -> ControlPacket {
        let mut states: Vec<RoomListEntry> = self
            .entries
            .iter()
            .map(|(id, entry)| RoomListEntry {
                room_id: *id,
                state: entry.state.clone(),
            })
            .collect();
        states.sort_by_key(|entry| entry.room_id.0);
        let mut protected_rooms: Vec<RoomId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.protected)
            .map(|(id, _)| *id)
            .collect();
        protected_rooms.sort_by_key(|id| id.0);
        ControlPacket::RoomList {
            states,
            protected_rooms,
        }
    }

    /// End the current refresh round and hand back everyone to answer.
    pub fn flush(&mut self) -> Vec<ConnectionHandle> {
        self.requesting.clear();
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Events;
    use roomlink_protocol::ConnectionId;
    use std::time::Duration;

    fn listed_room(id: u64, port: u16) -> Room {
        let (host, _rx) = ConnectionHandle::for_tests(
            id as u32,
            format!("127.0.0.1:{port}").parse().unwrap(),
        );
        let mut room = Room::new(
            RoomId(id),
            host,
            Some("game".parse().unwrap()),
            Events::new(),
        );
        room.set_configuration(true, false, 0, true);
        room
    }

    #[test]
    fn seeds_only_listable_rooms() {
        let public = listed_room(1, 50010);
        let mut private = listed_room(2, 50011);
        private.set_configuration(false, false, 0, true);
        let mut no_state = listed_room(3, 50012);
        no_state.set_configuration(true, false, 0, false);

        let cache = CachedRoomList::new(
            "game".parse().unwrap(),
            [&public, &private, &no_state].into_iter(),
        );
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn apply_tracks_protection_and_privacy() {
        let mut room = listed_room(5, 50013);
        let mut cache = CachedRoomList::new("game".parse().unwrap(), std::iter::empty());

        room.set_configuration(true, true, 0x1234, true);
        cache.apply(&room, false);
        match cache.build_packet() {
            ControlPacket::RoomList {
                states,
                protected_rooms,
            } => {
                assert_eq!(states.len(), 1);
                assert_eq!(protected_rooms, vec![RoomId(5)]);
            }
            other => panic!("expected list, got {other:?}"),
        }

        // Dropping protection clears the marker, going private delists.
        room.set_configuration(true, false, 0, true);
        cache.apply(&room, false);
        match cache.build_packet() {
            ControlPacket::RoomList {
                protected_rooms, ..
            } => assert!(protected_rooms.is_empty()),
            other => panic!("expected list, got {other:?}"),
        }
        room.set_configuration(false, false, 0, true);
        cache.apply(&room, false);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn state_upsert_settles_outstanding_request() {
        let mut room = listed_room(6, 50014);
        let mut cache = CachedRoomList::new("game".parse().unwrap(), std::iter::empty());
        cache.mark_requesting(room.id);
        assert!(cache.is_updating());

        room.set_state(Some(vec![1, 2, 3]), Instant::now()).unwrap();
        cache.apply(&room, true);
        assert!(!cache.is_updating());
        match cache.build_packet() {
            ControlPacket::RoomList { states, .. } => {
                assert_eq!(states[0].state.as_deref(), Some(&[1u8, 2, 3][..]));
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_follows_last_refresh() {
        let mut cache = CachedRoomList::new("game".parse().unwrap(), std::iter::empty());
        let lifetime = Duration::from_secs(10);
        let now = Instant::now();
        assert!(cache.is_outdated(now, lifetime));

        cache.begin_refresh(now);
        assert!(!cache.is_outdated(now + Duration::from_secs(5), lifetime));
        assert!(cache.is_outdated(now + lifetime, lifetime));
    }

    #[tokio::test]
    async fn flush_drains_pending_and_requesting() {
        let mut cache = CachedRoomList::new("game".parse().unwrap(), std::iter::empty());
        let (peer, _rx) = ConnectionHandle::for_tests(9, "127.0.0.1:50015".parse().unwrap());
        cache.pending.push(peer);
        cache.mark_requesting(RoomId(1));

        let flushed = cache.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].id, ConnectionId(9));
        assert!(!cache.is_updating());
        assert!(cache.pending.is_empty());
    }
}
