//! Room-based fan-out for the relay.
//!
//! Each room owns one tokio broadcast channel carrying decoded
//! [`RoomEvent`]s. Every member connection subscribes once and re-encodes
//! events with the codec it negotiated, so one member's compression choice
//! never affects another's.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::compression::Compression;
use crate::protocol::{PositionReport, ProtocolError, RejectReason, WireMessage};

/// Something that happened in a room, fanned out to every member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Position {
        peer_id: Uuid,
        seq: u64,
        report: PositionReport,
    },
    Left {
        peer_id: Uuid,
    },
}

impl RoomEvent {
    /// The member this event is about.
    pub fn peer_id(&self) -> Uuid {
        match self {
            Self::Position { peer_id, .. } | Self::Left { peer_id } => *peer_id,
        }
    }

    /// Wire form for a receiver that negotiated `compression`.
    pub fn to_wire(&self, compression: Compression) -> Result<WireMessage, ProtocolError> {
        match self {
            Self::Position {
                peer_id,
                seq,
                report,
            } => WireMessage::position(*peer_id, *seq, report, compression),
            Self::Left { peer_id } => Ok(WireMessage::peer_left(*peer_id)),
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

/// A broadcast channel for one room.
///
/// Stats are atomics so `broadcast` never takes a lock.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomEvent>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many events a slow receiver may fall behind
    /// before it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RoomEvent>> {
        self.sender.subscribe()
    }

    /// Send to every subscriber (the sender filters its own events).
    /// Returns the number of receivers.
    pub fn broadcast(&self, event: RoomEvent) -> usize {
        let count = self.sender.send(Arc::new(event)).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for events a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

const MAX_RGB: u32 = 0x00ff_ffff;
const INITIAL_STEP: u32 = 255;
const STEP_SHRINK: u32 = 17;
const MIN_STEP: u32 = 27;

/// Hands out distinct colors within one room.
///
/// Walks the RGB space in fixed steps; each time it runs off the end it
/// restarts with a smaller step, and gives up once the step is too small.
#[derive(Debug)]
pub struct ColorAllocator {
    current: u32,
    step: u32,
    in_use: HashSet<u32>,
}

impl Default for ColorAllocator {
    fn default() -> Self {
        Self {
            current: 0,
            step: INITIAL_STEP,
            in_use: HashSet::new(),
        }
    }
}

impl ColorAllocator {
    /// Keep `requested` if it is set and free, otherwise allocate.
    pub fn claim(&mut self, requested: u32) -> Option<u32> {
        let requested = requested & MAX_RGB;
        if requested != 0 && self.in_use.insert(requested) {
            return Some(requested);
        }
        loop {
            let candidate = self.advance()?;
            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
    }

    pub fn release(&mut self, color: u32) {
        self.in_use.remove(&color);
    }

    fn advance(&mut self) -> Option<u32> {
        self.current += self.step;
        if self.current > MAX_RGB {
            if self.step <= MIN_STEP {
                return None;
            }
            self.step -= STEP_SHRINK;
            self.current = self.step;
        }
        Some(self.current)
    }
}

struct Member {
    /// Distinguishes a re-joined connection from the stale one it replaced
    conn_id: u64,
    color: u32,
    last: Option<(u64, PositionReport)>,
}

struct Room {
    group: Arc<BroadcastGroup>,
    members: HashMap<Uuid, Member>,
    colors: ColorAllocator,
}

/// What a connection gets back from a successful join.
pub struct Membership {
    pub color: u32,
    pub receiver: broadcast::Receiver<Arc<RoomEvent>>,
    pub group: Arc<BroadcastGroup>,
    /// Last known position of every other member (late-joiner catch-up)
    pub catch_up: Vec<RoomEvent>,
}

/// Maps room names to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Room>>,
    default_capacity: usize,
    max_peers_per_room: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize, max_peers_per_room: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
            max_peers_per_room,
        }
    }

    /// Add `peer_id` (on connection `conn_id`) to `room`, creating it if needed.
    ///
    /// A peer already in the room is replaced; this is how a client that
    /// lost its link re-joins before the relay noticed the old one died.
    pub async fn join(
        &self,
        room: &str,
        peer_id: Uuid,
        conn_id: u64,
        requested_color: u32,
    ) -> Result<Membership, RejectReason> {
        let mut rooms = self.rooms.write().await;
        let entry = rooms.entry(room.to_string()).or_insert_with(|| Room {
            group: Arc::new(BroadcastGroup::new(self.default_capacity)),
            members: HashMap::new(),
            colors: ColorAllocator::default(),
        });

        if let Some(stale) = entry.members.remove(&peer_id) {
            entry.colors.release(stale.color);
        } else if entry.members.len() >= self.max_peers_per_room {
            let empty = entry.members.is_empty();
            if empty {
                rooms.remove(room);
            }
            return Err(RejectReason::RoomFull);
        }

        let Some(color) = entry.colors.claim(requested_color) else {
            if entry.members.is_empty() {
                rooms.remove(room);
            }
            return Err(RejectReason::NoColor);
        };

        // Subscribe and collect catch-up under the same lock so nothing
        // published in between is missed or duplicated.
        let receiver = entry.group.subscribe();
        let catch_up = entry
            .members
            .iter()
            .filter_map(|(id, m)| {
                m.last.map(|(seq, report)| RoomEvent::Position {
                    peer_id: *id,
                    seq,
                    report,
                })
            })
            .collect();
        entry.members.insert(
            peer_id,
            Member {
                conn_id,
                color,
                last: None,
            },
        );

        Ok(Membership {
            color,
            receiver,
            group: entry.group.clone(),
            catch_up,
        })
    }

    /// Record and fan out a member's position. The color is forced to the
    /// member's allocated one. Returns the receiver count, or `None` if the
    /// connection is no longer the room's member for `peer_id`.
    pub async fn publish_position(
        &self,
        room: &str,
        peer_id: Uuid,
        conn_id: u64,
        seq: u64,
        report: PositionReport,
    ) -> Option<usize> {
        let mut rooms = self.rooms.write().await;
        let entry = rooms.get_mut(room)?;
        let member = entry.members.get_mut(&peer_id)?;
        if member.conn_id != conn_id {
            return None;
        }
        let report = PositionReport {
            color: member.color,
            ..report
        };
        member.last = Some((seq, report));
        Some(entry.group.broadcast(RoomEvent::Position {
            peer_id,
            seq,
            report,
        }))
    }

    /// Remove a member, release its color and tell the others.
    ///
    /// Returns true if the member was removed. A stale connection that was
    /// replaced by a re-join removes nothing.
    pub async fn leave(&self, room: &str, peer_id: Uuid, conn_id: u64) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(entry) = rooms.get_mut(room) else {
            return false;
        };
        match entry.members.get(&peer_id) {
            Some(member) if member.conn_id == conn_id => {}
            _ => return false,
        }
        if let Some(member) = entry.members.remove(&peer_id) {
            entry.colors.release(member.color);
        }
        entry.group.broadcast(RoomEvent::Left { peer_id });

        if entry.members.is_empty() {
            rooms.remove(room);
            log::info!("Room {room:?} removed (empty)");
        }
        true
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn member_count(&self, room: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room)
            .map_or(0, |r| r.members.len())
    }

    pub async fn room_names(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(x: i32, y: i32) -> PositionReport {
        PositionReport { x, y, color: 0 }
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();

        let peer = Uuid::new_v4();
        assert_eq!(group.broadcast(RoomEvent::Left { peer_id: peer }), 2);

        assert_eq!(rx1.recv().await.unwrap().peer_id(), peer);
        assert_eq!(rx2.recv().await.unwrap().peer_id(), peer);
        assert_eq!(group.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for _ in 0..5 {
            group.broadcast(RoomEvent::Left {
                peer_id: Uuid::new_v4(),
            });
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_lag(n),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().messages_dropped, 3);
    }

    #[test]
    fn test_room_event_wire_form() {
        let peer = Uuid::new_v4();
        let event = RoomEvent::Position {
            peer_id: peer,
            seq: 4,
            report: PositionReport { x: 1, y: 2, color: 3 },
        };
        for codec in [Compression::None, Compression::Lz4] {
            let wire = event.to_wire(codec).unwrap();
            assert_eq!(wire.peer_id, peer);
            assert_eq!(wire.position_report(codec).unwrap().x, 1);
        }
    }

    #[test]
    fn test_color_allocator_keeps_free_request() {
        let mut colors = ColorAllocator::default();
        assert_eq!(colors.claim(0x123456), Some(0x123456));
        let second = colors.claim(0x123456).unwrap();
        assert_ne!(second, 0x123456);
        colors.release(0x123456);
        assert_eq!(colors.claim(0x123456), Some(0x123456));
    }

    #[test]
    fn test_color_allocator_steps() {
        let mut colors = ColorAllocator::default();
        assert_eq!(colors.claim(0), Some(255));
        assert_eq!(colors.claim(0), Some(510));
        // Alpha bits of a requested color are ignored.
        assert_eq!(colors.claim(0xff00_00ff), Some(765));
    }

    #[test]
    fn test_color_allocator_exhausts() {
        let mut colors = ColorAllocator::default();
        let mut seen = HashSet::new();
        while let Some(c) = colors.claim(0) {
            assert!(c <= MAX_RGB && c != 0);
            assert!(seen.insert(c));
        }
        assert!(seen.len() > 100_000);
    }

    #[tokio::test]
    async fn test_join_catch_up_and_leave() {
        let rooms = RoomManager::new(16, 8);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let a = rooms.join("r1", alice, 1, 0).await.unwrap();
        rooms.publish_position("r1", alice, 1, 1, report(5, -3)).await.unwrap();

        let mut b = rooms.join("r1", bob, 2, 0).await.unwrap();
        assert_ne!(a.color, b.color);
        assert_eq!(
            b.catch_up,
            vec![RoomEvent::Position {
                peer_id: alice,
                seq: 1,
                report: PositionReport { x: 5, y: -3, color: a.color },
            }]
        );

        assert!(rooms.leave("r1", alice, 1).await);
        let event = b.receiver.recv().await.unwrap();
        assert_eq!(*event, RoomEvent::Left { peer_id: alice });

        assert!(rooms.leave("r1", bob, 2).await);
        assert_eq!(rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_room_full() {
        let rooms = RoomManager::new(16, 1);
        rooms.join("r", Uuid::new_v4(), 1, 0).await.unwrap();
        assert!(matches!(
            rooms.join("r", Uuid::new_v4(), 2, 0).await,
            Err(RejectReason::RoomFull)
        ));
        assert_eq!(rooms.member_count("r").await, 1);
    }

    #[tokio::test]
    async fn test_rejoin_replaces_stale_connection() {
        let rooms = RoomManager::new(16, 1);
        let peer = Uuid::new_v4();
        let first = rooms.join("r", peer, 1, 0x00ff00).await.unwrap();
        // Same peer on a new connection is not "room full".
        let second = rooms.join("r", peer, 2, 0x00ff00).await.unwrap();
        assert_eq!(first.color, second.color);

        // The stale connection can neither publish nor remove the member.
        assert!(rooms.publish_position("r", peer, 1, 1, report(0, 0)).await.is_none());
        assert!(!rooms.leave("r", peer, 1).await);
        assert_eq!(rooms.member_count("r").await, 1);
        assert!(rooms.leave("r", peer, 2).await);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let rooms = RoomManager::new(16, 8);
        let a = Uuid::new_v4();
        let mut other = rooms.join("other", Uuid::new_v4(), 1, 0).await.unwrap();
        rooms.join("r1", a, 2, 0).await.unwrap();
        rooms.publish_position("r1", a, 2, 1, report(1, 1)).await.unwrap();
        assert!(other.receiver.try_recv().is_err());
        let mut names = rooms.room_names().await;
        names.sort();
        assert_eq!(names, vec!["other".to_string(), "r1".to_string()]);
    }
}
