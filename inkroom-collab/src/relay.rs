//! In-process relay: orders every room's frames and fans them out.
//!
//! Each room gets one tokio broadcast channel. Every frame a member sends
//! is checked, stamped with the sender and the next room sequence number,
//! applied to the relay's replica of the room and broadcast to all
//! members, sender included. Replies meant for one member (welcome,
//! resync snapshot, kick) go over that member's own channel.
//!
//! ```text
//!  LocalTransport ──send──► RelayHub::ingest ──► RelayRoom ──┬─► replica (snapshots)
//!        ▲                                                  │
//!        ├──── broadcast::Receiver ◄── room fan-out ◄───────┤
//!        └──── mpsc::UnboundedReceiver ◄── directed replies ◄┘
//! ```
//!
//! A member whose receiver falls more than `broadcast_capacity` frames
//! behind sees [`TransportEvent::Desynced`] and must resync.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use inkroom_core::{
    EventEntry, EventScope, GlobalStateStore, MemberId, RoomMember, SceneTree, ViewModeArbiter,
    ADMIN_MEMBER_ID,
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::protocol::{Frame, JoinRequest, ProtocolError, RoomEvent, RoomSnapshot};
use crate::transport::{Transport, TransportEvent};

/// Statistics for monitoring relay health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_sequenced: u64,
    pub frames_rejected: u64,
    pub connections: usize,
    pub members: usize,
}

// ─── Room replica ──────────────────────────────────────────────

/// The relay's copy of room state, used to answer joins and resyncs.
struct RoomReplica {
    scenes: SceneTree,
    global: GlobalStateStore,
    members: BTreeMap<MemberId, RoomMember>,
    view: ViewModeArbiter,
}

impl RoomReplica {
    fn new() -> Self {
        Self {
            scenes: SceneTree::new(),
            global: GlobalStateStore::new(),
            members: BTreeMap::new(),
            view: ViewModeArbiter::new(ADMIN_MEMBER_ID),
        }
    }

    fn apply(&mut self, sender: MemberId, event: &RoomEvent) {
        match event {
            RoomEvent::SceneTree { root } => {
                self.scenes.replace_root(root.clone());
            }
            RoomEvent::ScenePointer { path } => {
                if let Err(e) = self.scenes.apply_remote_pointer(path) {
                    log::debug!("Relay ignoring pointer write: {e}");
                }
            }
            RoomEvent::GlobalPatch { patch } => {
                self.global.merge(patch);
            }
            RoomEvent::MemberPatch { patch } => {
                if let Some(member) = self.members.get_mut(&sender) {
                    member.member_state.apply(patch);
                }
            }
            RoomEvent::ViewMode(declaration) => {
                self.view.apply_declaration(declaration);
            }
            RoomEvent::Camera { camera } => {
                self.view.apply_broadcaster_camera(sender, *camera);
            }
            RoomEvent::MemberJoined(member) => {
                self.members.insert(member.member_id, member.clone());
            }
            RoomEvent::MemberLeft { member_id } => {
                self.members.remove(member_id);
                self.view.member_left(*member_id);
            }
            RoomEvent::Writable {
                writable,
                member_state,
                payload,
            } => {
                if *writable {
                    self.members.insert(
                        sender,
                        RoomMember {
                            member_id: sender,
                            member_state: member_state.clone(),
                            payload: payload.clone(),
                        },
                    );
                } else {
                    self.members.remove(&sender);
                }
            }
            _ => {}
        }
    }

    fn snapshot(&self, seq: u64) -> RoomSnapshot {
        RoomSnapshot {
            seq,
            scenes: self.scenes.snapshot(),
            global_state: self.global.state().clone(),
            members: self.members.values().cloned().collect(),
            view: self.view.snapshot(),
        }
    }
}

// ─── Relay room ────────────────────────────────────────────────

struct Connection {
    direct: mpsc::UnboundedSender<Arc<Vec<u8>>>,
    joined: bool,
    writable: bool,
}

struct RelayRoom {
    room_id: Uuid,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    replica: RoomReplica,
    seq: u64,
    connections: HashMap<MemberId, Connection>,
    frames_sequenced: u64,
    frames_rejected: u64,
}

impl RelayRoom {
    fn new(room_id: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            room_id,
            sender,
            replica: RoomReplica::new(),
            seq: 0,
            connections: HashMap::new(),
            frames_sequenced: 0,
            frames_rejected: 0,
        }
    }

    /// Order, apply and fan out one event.
    fn sequence(
        &mut self,
        sender: MemberId,
        clock: u64,
        event: RoomEvent,
    ) -> Result<(), ProtocolError> {
        let seq = self.seq + 1;
        let frame = Frame::new(sender, self.room_id, clock, &event)?.sequenced(sender, seq);
        let encoded = Arc::new(frame.encode()?);
        self.seq = seq;
        self.replica.apply(sender, &event);
        let _ = self.sender.send(encoded);
        self.frames_sequenced += 1;
        Ok(())
    }

    /// Send one event to a single member.
    fn direct(&self, member_id: MemberId, event: &RoomEvent) -> Result<(), ProtocolError> {
        let Some(connection) = self.connections.get(&member_id) else {
            return Ok(());
        };
        let frame = Frame::new(ADMIN_MEMBER_ID, self.room_id, 0, event)?
            .sequenced(ADMIN_MEMBER_ID, self.seq);
        if connection.direct.send(Arc::new(frame.encode()?)).is_err() {
            log::debug!("Member {member_id} stopped listening");
        }
        Ok(())
    }

    fn admit(
        &mut self,
        member_id: MemberId,
        request: JoinRequest,
        max_members: usize,
    ) -> Result<(), ProtocolError> {
        let joined = self.connections.values().filter(|c| c.joined).count();
        if joined >= max_members {
            log::warn!("Room {} is full, refusing member {member_id}", self.room_id);
            self.direct(member_id, &RoomEvent::Kicked { reason: "room is full".into() })?;
            self.connections.remove(&member_id);
            return Ok(());
        }
        if let Some(connection) = self.connections.get_mut(&member_id) {
            connection.joined = true;
            connection.writable = request.writable;
        }
        if request.writable {
            let member = RoomMember {
                member_id,
                member_state: request.member_state,
                payload: request.payload,
            };
            self.sequence(ADMIN_MEMBER_ID, 0, RoomEvent::MemberJoined(member))?;
        }
        log::info!(
            "Member {member_id} joined room {} ({})",
            self.room_id,
            if request.writable { "interactive" } else { "subscriber" }
        );
        let snapshot = self.replica.snapshot(self.seq);
        self.direct(member_id, &RoomEvent::Welcome { member_id, snapshot })
    }

    fn drop_member(&mut self, member_id: MemberId) -> bool {
        let Some(connection) = self.connections.remove(&member_id) else {
            return false;
        };
        if connection.joined {
            log::info!("Member {member_id} left room {}", self.room_id);
            if let Err(e) = self.sequence(ADMIN_MEMBER_ID, 0, RoomEvent::MemberLeft { member_id }) {
                log::error!("Failed to announce departure of {member_id}: {e}");
            }
        }
        true
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            frames_sequenced: self.frames_sequenced,
            frames_rejected: self.frames_rejected,
            connections: self.connections.len(),
            members: self.replica.members.len(),
        }
    }
}

/// Attach provenance the sender cannot forge.
fn stamp(event: RoomEvent, sender: MemberId) -> RoomEvent {
    match event {
        RoomEvent::ViewMode(mut declaration) => {
            declaration.member_id = sender;
            RoomEvent::ViewMode(declaration)
        }
        RoomEvent::CustomEvent(mut entry) => {
            entry.author_id = sender;
            entry.scope = EventScope::Member;
            RoomEvent::CustomEvent(entry)
        }
        other => other,
    }
}

// ─── Relay hub ─────────────────────────────────────────────────

/// Room manager: maps room ids to relay rooms.
pub struct RelayHub {
    config: RelayConfig,
    rooms: Mutex<HashMap<Uuid, RelayRoom>>,
    next_member: AtomicU64,
}

impl RelayHub {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            rooms: Mutex::new(HashMap::new()),
            next_member: AtomicU64::new(ADMIN_MEMBER_ID + 1),
        })
    }

    /// Open a connection to `room_id`, creating the room if needed.
    ///
    /// The connection receives room frames from now on but is not a
    /// member until it sends a join.
    pub fn connect(self: &Arc<Self>, room_id: Uuid) -> Result<LocalTransport, ProtocolError> {
        let member_id = self.next_member.fetch_add(1, Ordering::Relaxed);
        let (direct_tx, direct_rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms()?;
        let capacity = self.config.broadcast_capacity;
        let room = rooms
            .entry(room_id)
            .or_insert_with(|| RelayRoom::new(room_id, capacity));
        let receiver = room.sender.subscribe();
        room.connections.insert(
            member_id,
            Connection {
                direct: direct_tx,
                joined: false,
                writable: false,
            },
        );
        log::debug!("Connection {member_id} opened on room {room_id}");
        Ok(LocalTransport {
            hub: Arc::clone(self),
            room_id,
            member_id,
            direct: direct_rx,
            room: receiver,
            closed: false,
        })
    }

    /// Raise a custom event on the room's own behalf.
    pub fn dispatch_system_event(
        &self,
        room_id: Uuid,
        event_name: impl Into<String>,
        payload: Value,
    ) -> Result<(), ProtocolError> {
        let mut rooms = self.rooms()?;
        let room = rooms.get_mut(&room_id).ok_or(ProtocolError::ConnectionClosed)?;
        let entry = EventEntry::system(event_name, payload);
        room.sequence(ADMIN_MEMBER_ID, 0, RoomEvent::CustomEvent(entry))
    }

    /// Remove a member. Returns false if it was not connected.
    pub fn kick(
        &self,
        room_id: Uuid,
        member_id: MemberId,
        reason: impl Into<String>,
    ) -> Result<bool, ProtocolError> {
        let mut rooms = self.rooms()?;
        let Some(room) = rooms.get_mut(&room_id) else {
            return Ok(false);
        };
        room.direct(member_id, &RoomEvent::Kicked { reason: reason.into() })?;
        Ok(room.drop_member(member_id))
    }

    pub fn snapshot(&self, room_id: Uuid) -> Option<RoomSnapshot> {
        let rooms = self.rooms().ok()?;
        rooms.get(&room_id).map(|room| room.replica.snapshot(room.seq))
    }

    pub fn stats(&self, room_id: Uuid) -> Option<RelayStats> {
        let rooms = self.rooms().ok()?;
        rooms.get(&room_id).map(RelayRoom::stats)
    }

    pub fn room_count(&self) -> usize {
        self.rooms().map(|rooms| rooms.len()).unwrap_or(0)
    }

    /// Drop a room with no connections, discarding its state.
    pub fn remove_if_empty(&self, room_id: Uuid) -> bool {
        let Ok(mut rooms) = self.rooms() else {
            return false;
        };
        if rooms.get(&room_id).is_some_and(|room| room.connections.is_empty()) {
            rooms.remove(&room_id);
            return true;
        }
        false
    }

    fn rooms(&self) -> Result<MutexGuard<'_, HashMap<Uuid, RelayRoom>>, ProtocolError> {
        self.rooms.lock().map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn ingest(
        &self,
        room_id: Uuid,
        member_id: MemberId,
        bytes: &[u8],
    ) -> Result<(), ProtocolError> {
        let frame = Frame::decode(bytes)?;
        if frame.room_id != room_id {
            return Err(ProtocolError::RoomMismatch(frame.room_id));
        }
        let event = frame.event()?;

        let mut rooms = self.rooms()?;
        let room = rooms.get_mut(&room_id).ok_or(ProtocolError::ConnectionClosed)?;
        let (joined, writable) = match room.connections.get(&member_id) {
            Some(connection) => (connection.joined, connection.writable),
            None => return Err(ProtocolError::ConnectionClosed),
        };

        if event.relay_only() {
            log::warn!("Member {member_id} sent relay-only {:?}", event.message_type());
            room.frames_rejected += 1;
            return Err(ProtocolError::InvalidMessageType);
        }
        if !joined && !matches!(event, RoomEvent::Join(_)) {
            log::warn!("Dropping {:?} from member {member_id} before join", event.message_type());
            room.frames_rejected += 1;
            return Ok(());
        }

        match event {
            RoomEvent::Join(request) => {
                if joined {
                    log::warn!("Member {member_id} joined twice");
                    return Ok(());
                }
                room.admit(member_id, request, self.config.max_members_per_room)
            }
            RoomEvent::ResyncRequest => {
                log::info!("Member {member_id} requested resync at seq {}", room.seq);
                let snapshot = room.replica.snapshot(room.seq);
                room.direct(member_id, &RoomEvent::Resync(snapshot))
            }
            RoomEvent::Leave => {
                room.drop_member(member_id);
                Ok(())
            }
            event if event.requires_write() && !writable => {
                log::warn!(
                    "Dropping {:?} from read-only member {member_id}",
                    event.message_type()
                );
                room.frames_rejected += 1;
                Ok(())
            }
            RoomEvent::Writable { writable, member_state, payload } => {
                if let Some(connection) = room.connections.get_mut(&member_id) {
                    connection.writable = writable;
                }
                room.sequence(
                    member_id,
                    frame.clock,
                    RoomEvent::Writable { writable, member_state, payload },
                )
            }
            event => room.sequence(member_id, frame.clock, stamp(event, member_id)),
        }
    }

    fn disconnect(&self, room_id: Uuid, member_id: MemberId) {
        let Ok(mut rooms) = self.rooms() else {
            return;
        };
        if let Some(room) = rooms.get_mut(&room_id) {
            room.drop_member(member_id);
        }
    }
}

// ─── Local transport ───────────────────────────────────────────

/// A connection to a [`RelayHub`] room within the same process.
pub struct LocalTransport {
    hub: Arc<RelayHub>,
    room_id: Uuid,
    member_id: MemberId,
    direct: mpsc::UnboundedReceiver<Arc<Vec<u8>>>,
    room: broadcast::Receiver<Arc<Vec<u8>>>,
    closed: bool,
}

enum Inbound {
    Direct(Option<Arc<Vec<u8>>>),
    Room(Result<Arc<Vec<u8>>, broadcast::error::RecvError>),
}

impl LocalTransport {
    /// Id the relay assigned to this connection.
    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    fn closed_event(&mut self, reason: &str) -> TransportEvent {
        self.closed = true;
        TransportEvent::Closed {
            reason: reason.to_string(),
        }
    }

    fn translate(&mut self, inbound: Inbound) -> TransportEvent {
        match inbound {
            Inbound::Direct(Some(frame)) => TransportEvent::Frame(frame),
            Inbound::Direct(None) => self.closed_event("relay closed the connection"),
            Inbound::Room(Ok(frame)) => TransportEvent::Frame(frame),
            Inbound::Room(Err(broadcast::error::RecvError::Lagged(missed))) => {
                log::warn!("Member {} lagged by {missed} frames", self.member_id);
                TransportEvent::Desynced
            }
            Inbound::Room(Err(broadcast::error::RecvError::Closed)) => {
                self.closed_event("room closed")
            }
        }
    }
}

impl Transport for LocalTransport {
    fn send(&mut self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        if self.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.hub.ingest(self.room_id, self.member_id, &frame)
    }

    fn recv(&mut self) -> impl Future<Output = TransportEvent> + Send {
        async move {
            if self.closed {
                return self.closed_event("connection closed");
            }
            // Directed replies first: a welcome or snapshot must be seen
            // before the room frames that follow it.
            let inbound = tokio::select! {
                biased;
                frame = self.direct.recv() => Inbound::Direct(frame),
                frame = self.room.recv() => Inbound::Room(frame),
            };
            self.translate(inbound)
        }
    }

    fn try_recv(&mut self) -> Option<TransportEvent> {
        if self.closed {
            return None;
        }
        match self.direct.try_recv() {
            Ok(frame) => return Some(TransportEvent::Frame(frame)),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                return Some(self.closed_event("relay closed the connection"))
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
        }
        match self.room.try_recv() {
            Ok(frame) => Some(TransportEvent::Frame(frame)),
            Err(broadcast::error::TryRecvError::Empty) => None,
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                log::warn!("Member {} lagged by {missed} frames", self.member_id);
                Some(TransportEvent::Desynced)
            }
            Err(broadcast::error::TryRecvError::Closed) => Some(self.closed_event("room closed")),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.hub.disconnect(self.room_id, self.member_id);
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.close();
    }
}
