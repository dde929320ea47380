//! A participant's session in one room.
//!
//! Provides:
//! - Join handshake with timeout, snapshot bootstrap and phase tracking
//! - Local mutations applied immediately and published to the relay
//! - Inbound demultiplexing onto the scene tree, stores, arbiter and bus
//! - Snapshot resync after the transport reports lost frames
//!
//! Everything runs on the caller's task. Local calls and inbound frames
//! are applied one at a time, in the order the caller drives them.

use std::time::{Duration, Instant};

use inkroom_core::{
    BroadcastState, CameraInput, CameraState, ContentOperation, ContentOperationKind,
    Declaration, EventBus, EventDelivery, EventEntry, GlobalState, GlobalStateStore, MemberId,
    MemberState, MemberStatePatch, MemberStateStore, MemberView, RoomError, RoomMember, RoomState,
    Scene, ScenePathType, SceneState, SceneTree, SerializationGate, UndoRedoCounts, ViewMode,
    ViewModeArbiter,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::config::RoomConfig;
use crate::pending::{PendingWrites, Register};
use crate::protocol::{Frame, JoinRequest, ProtocolError, RoomEvent, RoomSnapshot};
use crate::transport::{Transport, TransportEvent};

/// Session connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomPhase {
    Connecting,
    Connected,
    /// Frames were lost; waiting for a snapshot
    Reconnecting,
    Disconnecting,
    Disconnected,
}

/// Notifications emitted to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomNotification {
    PhaseChanged(RoomPhase),
    SceneStateChanged(SceneState),
    GlobalStateChanged(GlobalState),
    /// The local participant's own state
    MemberStateChanged(MemberState),
    RoomMembersChanged(Vec<RoomMember>),
    BroadcastStateChanged(BroadcastState),
    CameraChanged(CameraState),
    WritableChanged(bool),
    CanUndoStepsUpdate(u64),
    CanRedoStepsUpdate(u64),
    Event(EventEntry),
    EventBatch {
        event_name: String,
        entries: Vec<EventEntry>,
    },
    /// Opaque message from the render bridge
    BridgeMessage(Value),
    Kicked {
        reason: String,
    },
    Disconnected {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Join timed out after {0:?}")]
    JoinTimeout(Duration),
    #[error("Room is {0:?}, not connected")]
    NotConnected(RoomPhase),
    #[error("Join rejected: {0}")]
    Rejected(String),
}

/// The room session.
pub struct Room<T: Transport> {
    config: RoomConfig,
    transport: T,
    member_id: MemberId,
    phase: RoomPhase,

    /// Last relay sequence number applied
    last_seq: u64,
    /// Lamport clock for outgoing frames
    clock: u64,

    scenes: SceneTree,
    /// Scene tree as the relay ordered it, own writes included. `scenes`
    /// adopts it once no local scene write is outstanding.
    confirmed: SceneTree,
    global: GlobalStateStore,
    members: MemberStateStore,
    view: ViewModeArbiter,
    gate: SerializationGate,
    events: EventBus,
    pending: PendingWrites,

    /// Components selected in the current scene
    selection: u64,
    device_inputs_disabled: bool,

    notify_tx: mpsc::Sender<RoomNotification>,
    notify_rx: Option<mpsc::Receiver<RoomNotification>>,
}

impl<T: Transport> Room<T> {
    /// Join a room over `transport`.
    ///
    /// Fails with [`SessionError::JoinTimeout`] if the relay does not accept
    /// the join within `config.join_timeout`. The transport is closed on
    /// any failure.
    pub async fn join(mut transport: T, config: RoomConfig) -> Result<Self, SessionError> {
        log::info!("Joining room {}", config.room_id);
        let limit = config.join_timeout;
        let outcome = tokio::time::timeout(limit, Self::handshake(&mut transport, &config)).await;
        match outcome {
            Ok(Ok((member_id, snapshot))) => {
                Ok(Self::from_welcome(transport, config, member_id, snapshot))
            }
            Ok(Err(e)) => {
                log::warn!("Join of room {} failed: {e}", config.room_id);
                transport.close();
                Err(e)
            }
            Err(_) => {
                log::warn!("Join of room {} timed out after {limit:?}", config.room_id);
                transport.close();
                Err(SessionError::JoinTimeout(limit))
            }
        }
    }

    async fn handshake(
        transport: &mut T,
        config: &RoomConfig,
    ) -> Result<(MemberId, RoomSnapshot), SessionError> {
        let join = RoomEvent::Join(JoinRequest {
            writable: config.writable,
            member_state: config.member_state.clone(),
            payload: config.payload.clone(),
        });
        transport.send(Frame::new(0, config.room_id, 0, &join)?.encode()?)?;

        loop {
            match transport.recv().await {
                TransportEvent::Frame(bytes) => {
                    let event = Frame::decode(&bytes).and_then(|frame| frame.event());
                    match event {
                        Ok(RoomEvent::Welcome { member_id, snapshot }) => {
                            return Ok((member_id, snapshot))
                        }
                        Ok(RoomEvent::Kicked { reason }) => {
                            return Err(SessionError::Rejected(reason))
                        }
                        // Room traffic ahead of the welcome is covered by its snapshot.
                        Ok(_) => {}
                        Err(e) => log::error!("Dropping undecodable frame during join: {e}"),
                    }
                }
                TransportEvent::Desynced => {}
                TransportEvent::Closed { reason } => return Err(SessionError::Rejected(reason)),
            }
        }
    }

    fn from_welcome(
        transport: T,
        config: RoomConfig,
        member_id: MemberId,
        snapshot: RoomSnapshot,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(config.notification_capacity.max(1));
        let members = MemberStateStore::new(
            member_id,
            config.writable,
            config.member_state.clone(),
            config.payload.clone(),
        );
        let gate = SerializationGate::new(config.serialization_enabled);
        let mut room = Self {
            config,
            transport,
            member_id,
            phase: RoomPhase::Connecting,
            last_seq: 0,
            clock: 0,
            scenes: SceneTree::new(),
            confirmed: SceneTree::new(),
            global: GlobalStateStore::new(),
            members,
            view: ViewModeArbiter::new(member_id),
            gate,
            events: EventBus::new(),
            pending: PendingWrites::new(),
            selection: 0,
            device_inputs_disabled: false,
            notify_tx,
            notify_rx: Some(notify_rx),
        };
        room.apply_snapshot(snapshot);
        room.set_phase(RoomPhase::Connected);
        log::info!("Joined room {} as member {member_id}", room.config.room_id);
        room
    }

    /// Take the notification receiver (can only be called once).
    pub fn take_notifications(&mut self) -> Option<mpsc::Receiver<RoomNotification>> {
        self.notify_rx.take()
    }

    // ─── Accessors ────────────────────────────────────────────

    pub fn room_id(&self) -> Uuid {
        self.config.room_id
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub fn is_writable(&self) -> bool {
        self.members.is_writable()
    }

    pub fn scenes(&self) -> &SceneTree {
        &self.scenes
    }

    pub fn scene_state(&self) -> SceneState {
        SceneState::of(&self.scenes)
    }

    pub fn scene_path_type(&self, path: &str) -> ScenePathType {
        self.scenes.resolve_path_type(path)
    }

    pub fn global_state(&self) -> &GlobalState {
        self.global.state()
    }

    pub fn member_state(&self) -> &MemberState {
        self.members.local_state()
    }

    pub fn member(&self, member_id: MemberId) -> Option<MemberView<'_>> {
        self.members.view(member_id)
    }

    pub fn room_members(&self) -> Vec<RoomMember> {
        self.members.members()
    }

    pub fn broadcast_state(&self) -> BroadcastState {
        let payload = self
            .view
            .broadcaster()
            .and_then(|id| self.members.view(id))
            .and_then(|member| member.payload().cloned());
        self.view.broadcast_state(payload)
    }

    pub fn camera_state(&self) -> CameraState {
        self.view.camera()
    }

    pub fn undo_redo_counts(&self) -> UndoRedoCounts {
        self.gate.counts()
    }

    pub fn room_state(&self) -> RoomState {
        RoomState {
            global_state: self.global.state().clone(),
            member_state: self.members.local_state().clone(),
            broadcast_state: self.broadcast_state(),
            scene_state: self.scene_state(),
            camera_state: self.view.camera(),
            room_members: self.members.members(),
            undo_redo: self.gate.counts(),
        }
    }

    // ─── Scenes ───────────────────────────────────────────────

    pub fn put_scenes(
        &mut self,
        dir: &str,
        scenes: Vec<Scene>,
        index: usize,
    ) -> Result<(), SessionError> {
        self.ensure_writable()?;
        self.scenes.insert(dir, scenes, index)?;
        self.publish_tree();
        self.notify_scene_state();
        Ok(())
    }

    pub fn set_scene_path(&mut self, path: &str) -> Result<(), SessionError> {
        self.ensure_writable()?;
        self.scenes.set_current_path(path)?;
        self.selection = 0;
        self.publish_pointer();
        self.notify_scene_state();
        Ok(())
    }

    pub fn set_scene_index(&mut self, index: usize) -> Result<(), SessionError> {
        self.ensure_writable()?;
        self.scenes.set_current_index(index)?;
        self.selection = 0;
        self.publish_pointer();
        self.notify_scene_state();
        Ok(())
    }

    pub fn move_scene(&mut self, source: &str, target: &str) -> Result<(), SessionError> {
        self.ensure_writable()?;
        let before = self.scenes.current_path().to_string();
        self.scenes.move_scene(source, target)?;
        self.publish_tree();
        if self.scenes.current_path() != before {
            self.publish_pointer();
        }
        self.notify_scene_state();
        Ok(())
    }

    /// Delete a scene or a directory tree.
    pub fn remove_scenes(&mut self, path: &str) -> Result<(), SessionError> {
        self.ensure_writable()?;
        let pointer_moved = self.scenes.remove(path)?;
        self.publish_tree();
        if pointer_moved {
            self.selection = 0;
            self.publish_pointer();
        }
        self.notify_scene_state();
        Ok(())
    }

    /// Clear the current scene's strokes, and its background unless retained.
    pub fn clean_current_scene(&mut self, retain_content: bool) -> Result<(), SessionError> {
        self.ensure_writable()?;
        self.scenes.clean(retain_content)?;
        self.selection = 0;
        self.publish_tree();
        self.notify_scene_state();
        Ok(())
    }

    // ─── Global and member state ──────────────────────────────

    pub fn set_global_state(&mut self, patch: GlobalState) -> Result<(), SessionError> {
        self.ensure_writable()?;
        if patch.is_empty() {
            return Ok(());
        }
        let changed = self.global.merge(&patch);
        for key in patch.keys() {
            self.pending.issue(Register::GlobalField(key.clone()));
        }
        self.publish(RoomEvent::GlobalPatch { patch });
        if !changed.is_empty() {
            self.notify(RoomNotification::GlobalStateChanged(self.global.state().clone()));
        }
        Ok(())
    }

    pub fn set_member_state(&mut self, patch: MemberStatePatch) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let state = self.members.owner()?.apply(&patch).clone();
        self.publish(RoomEvent::MemberPatch { patch });
        self.notify(RoomNotification::MemberStateChanged(state));
        self.notify_members();
        Ok(())
    }

    /// Switch between interactive and subscription mode. A downgrade gates
    /// local writes at once; an upgrade takes effect when the relay confirms.
    pub fn set_writable(&mut self, writable: bool) -> Result<(), SessionError> {
        self.ensure_connected()?;
        if writable == self.members.is_writable() {
            return Ok(());
        }
        self.publish(RoomEvent::Writable {
            writable,
            member_state: self.members.local_state().clone(),
            payload: self.members.local_payload().cloned(),
        });
        if !writable && self.phase == RoomPhase::Connected {
            self.members.set_writable(false);
            self.notify(RoomNotification::WritableChanged(false));
            self.notify_members();
        }
        Ok(())
    }

    // ─── View mode and camera ─────────────────────────────────

    pub fn set_view_mode(&mut self, mode: ViewMode) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let camera_before = self.view.camera();
        let declaration = self.view.declare(mode)?;
        if mode == ViewMode::Broadcaster {
            self.pending.issue(Register::Broadcaster);
        }
        self.publish(RoomEvent::ViewMode(declaration));
        self.notify(RoomNotification::BroadcastStateChanged(self.broadcast_state()));
        self.notify_camera_if_moved(camera_before);
        Ok(())
    }

    /// Local pan/zoom from the render bridge.
    pub fn move_camera(&mut self, camera: CameraState) -> Result<(), SessionError> {
        self.ensure_connected()?;
        match self.view.camera_input(camera) {
            CameraInput::Ignored => return Ok(()),
            CameraInput::Moved => {}
            CameraInput::Detached => {
                log::debug!("Member {} stopped following", self.member_id);
                self.publish(RoomEvent::ViewMode(Declaration {
                    member_id: self.member_id,
                    mode: ViewMode::Freedom,
                    camera: None,
                }));
                self.notify(RoomNotification::BroadcastStateChanged(self.broadcast_state()));
            }
            CameraInput::Broadcast => self.publish(RoomEvent::Camera { camera }),
        }
        self.notify(RoomNotification::CameraChanged(camera));
        Ok(())
    }

    /// Zoom around the current centre.
    pub fn zoom_to(&mut self, scale: f64) -> Result<(), SessionError> {
        let mut camera = self.view.camera();
        camera.scale = scale;
        self.move_camera(camera)
    }

    /// Push the local camera to followers again.
    pub fn broadcast_camera(&mut self) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let camera = self.view.broadcast_camera()?;
        self.publish(RoomEvent::Camera { camera });
        Ok(())
    }

    pub fn disable_camera_transform(&mut self, disabled: bool) {
        self.view.set_camera_locked(disabled);
    }

    pub fn disable_device_inputs(&mut self, disabled: bool) {
        self.device_inputs_disabled = disabled;
    }

    /// Lock both camera and drawing input.
    pub fn disable_operations(&mut self, disabled: bool) {
        self.disable_camera_transform(disabled);
        self.disable_device_inputs(disabled);
    }

    // ─── Content and undo ─────────────────────────────────────

    /// Strokes finished drawing on the current scene.
    pub fn strokes_completed(&mut self, count: u64) -> Result<(), SessionError> {
        if self.device_inputs_disabled || count == 0 {
            return Ok(());
        }
        self.ensure_writable()?;
        self.add_content(ContentOperationKind::Draw, count);
        Ok(())
    }

    /// The render bridge changed the selection.
    pub fn selection_changed(&mut self, count: u64) {
        let available = self
            .scenes
            .current_scene()
            .map(|scene| scene.components_count)
            .unwrap_or(0);
        self.selection = count.min(available);
    }

    /// Opaque message from the render bridge, forwarded to the host.
    pub fn post_message(&mut self, payload: Value) {
        self.notify(RoomNotification::BridgeMessage(payload));
    }

    pub fn disable_serialization(&mut self, disabled: bool) {
        let before = self.gate.counts();
        self.gate.set_enabled(!disabled);
        self.notify_counts(before);
    }

    pub fn copy(&mut self) {
        self.gate.copy(self.selection);
    }

    pub fn paste(&mut self) -> Result<(), SessionError> {
        let Some(components) = self.gate.paste() else {
            return Ok(());
        };
        self.ensure_writable()?;
        self.add_content(ContentOperationKind::Paste, components);
        Ok(())
    }

    pub fn duplicate(&mut self) -> Result<(), SessionError> {
        if !self.gate.is_enabled() || self.selection == 0 {
            return Ok(());
        }
        self.ensure_writable()?;
        self.add_content(ContentOperationKind::Duplicate, self.selection);
        Ok(())
    }

    /// Remove the selected components.
    pub fn delete_operation(&mut self) -> Result<(), SessionError> {
        self.ensure_writable()?;
        if self.selection == 0 {
            return Ok(());
        }
        let path = self.scenes.current_path().to_string();
        let components = std::mem::take(&mut self.selection);
        let before = self.gate.counts();
        self.scenes.remove_components(&path, components);
        self.gate
            .record(ContentOperation::new(ContentOperationKind::Delete, path, components));
        self.publish_tree();
        self.notify_scene_state();
        self.notify_counts(before);
        Ok(())
    }

    pub fn undo(&mut self) -> Result<(), SessionError> {
        if !self.gate.is_enabled() {
            return Ok(());
        }
        self.ensure_writable()?;
        let before = self.gate.counts();
        if let Some(operation) = self.gate.undo() {
            self.replay(&operation, true);
        }
        self.notify_counts(before);
        Ok(())
    }

    pub fn redo(&mut self) -> Result<(), SessionError> {
        if !self.gate.is_enabled() {
            return Ok(());
        }
        self.ensure_writable()?;
        let before = self.gate.counts();
        if let Some(operation) = self.gate.redo() {
            self.replay(&operation, false);
        }
        self.notify_counts(before);
        Ok(())
    }

    fn add_content(&mut self, kind: ContentOperationKind, components: u64) {
        let path = self.scenes.current_path().to_string();
        let before = self.gate.counts();
        self.scenes.add_components(&path, components);
        self.gate.record(ContentOperation::new(kind, path, components));
        self.publish_tree();
        self.notify_scene_state();
        self.notify_counts(before);
    }

    fn replay(&mut self, operation: &ContentOperation, revert: bool) {
        let adds = operation.kind.adds() != revert;
        let applied = if adds {
            self.scenes.add_components(&operation.scene_path, operation.components)
        } else {
            self.scenes.remove_components(&operation.scene_path, operation.components)
        };
        if !applied {
            log::debug!("Scene {} is gone, nothing to replay", operation.scene_path);
            return;
        }
        self.selection = 0;
        self.publish_tree();
        self.notify_scene_state();
    }

    // ─── Custom events ────────────────────────────────────────

    /// Events buffered under a high-frequency subscription to the same name
    /// are delivered as one batch first.
    pub fn subscribe(&mut self, event_name: impl Into<String>) {
        if let Some(flushed) = self.events.subscribe(event_name) {
            self.deliver(flushed);
        }
    }

    pub fn subscribe_high_frequency(
        &mut self,
        event_name: impl Into<String>,
        min_interval: Duration,
    ) {
        self.events.subscribe_high_frequency(event_name, min_interval);
    }

    pub fn unsubscribe(&mut self, event_name: &str) -> bool {
        self.events.unsubscribe(event_name)
    }

    /// Publish to every subscriber in the room, this participant included.
    pub fn dispatch_event(
        &mut self,
        event_name: impl Into<String>,
        payload: Value,
    ) -> Result<(), SessionError> {
        self.ensure_writable()?;
        let entry = EventEntry::member(self.member_id, event_name, payload);
        self.publish(RoomEvent::CustomEvent(entry));
        Ok(())
    }

    /// Flush high-frequency windows that closed by `now`.
    pub fn tick(&mut self, now: Instant) {
        for delivery in self.events.tick(now) {
            self.deliver(delivery);
        }
    }

    // ─── Inbound ──────────────────────────────────────────────

    /// Apply every inbound event already queued. Returns how many were handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while self.phase != RoomPhase::Disconnected {
            let Some(event) = self.transport.try_recv() else {
                break;
            };
            self.handle_transport_event(event);
            handled += 1;
        }
        handled
    }

    /// Wait for and apply one inbound event. Returns false once disconnected.
    pub async fn process_next(&mut self) -> bool {
        if self.phase == RoomPhase::Disconnected {
            return false;
        }
        let event = self.transport.recv().await;
        self.handle_transport_event(event);
        true
    }

    /// Apply inbound events until disconnected, flushing each event window
    /// as it closes.
    pub async fn run(&mut self) {
        while self.phase != RoomPhase::Disconnected {
            let deadline = self.events.next_deadline();
            let window_closed = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let inbound = tokio::select! {
                event = self.transport.recv() => Some(event),
                _ = window_closed => None,
            };
            match inbound {
                Some(event) => self.handle_transport_event(event),
                None => self.tick(Instant::now()),
            }
        }
    }

    /// Leave the room.
    pub fn disconnect(&mut self) {
        if self.phase == RoomPhase::Disconnected {
            return;
        }
        self.set_phase(RoomPhase::Disconnecting);
        self.publish(RoomEvent::Leave);
        self.shut_down("left the room".to_string());
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(bytes) => match Frame::decode(&bytes) {
                Ok(frame) => self.handle_frame(frame),
                Err(e) => log::error!("Dropping undecodable frame: {e}"),
            },
            TransportEvent::Desynced => self.begin_resync(),
            TransportEvent::Closed { reason } => self.shut_down(reason),
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        if frame.room_id != self.config.room_id {
            log::warn!("Dropping frame for room {}", frame.room_id);
            return;
        }
        let event = match frame.event() {
            Ok(event) => event,
            Err(e) => {
                log::error!("Dropping {:?} frame: {e}", frame.msg_type);
                return;
            }
        };

        match event {
            RoomEvent::Resync(snapshot) => {
                log::info!("Resynced room {} at seq {}", self.config.room_id, snapshot.seq);
                self.apply_snapshot(snapshot);
                self.set_phase(RoomPhase::Connected);
                return;
            }
            RoomEvent::Kicked { reason } => {
                log::warn!("Kicked from room {}: {reason}", self.config.room_id);
                self.notify(RoomNotification::Kicked { reason: reason.clone() });
                self.shut_down(reason);
                return;
            }
            RoomEvent::Welcome { .. } => {
                log::debug!("Ignoring late welcome");
                return;
            }
            _ => {}
        }

        // Everything up to `last_seq` is already in the state we hold, and
        // frames ahead of a pending snapshot are contained in it.
        if frame.seq <= self.last_seq || self.phase == RoomPhase::Reconnecting {
            return;
        }
        self.last_seq = frame.seq;
        let own = frame.sender == self.member_id;
        self.apply_event(frame.sender, own, event);
    }

    fn apply_event(&mut self, sender: MemberId, own: bool, event: RoomEvent) {
        match event {
            RoomEvent::SceneTree { root } => {
                self.confirmed.replace_root(root);
                if own {
                    self.pending.retire(&Register::SceneTree);
                }
                self.adopt_confirmed_scenes();
            }
            RoomEvent::ScenePointer { path } => {
                if let Err(e) = self.confirmed.apply_remote_pointer(&path) {
                    log::debug!("Ignoring pointer from {sender}: {e}");
                }
                if own {
                    self.pending.retire(&Register::ScenePointer);
                }
                self.adopt_confirmed_scenes();
            }
            RoomEvent::GlobalPatch { patch } => {
                if own {
                    for key in patch.keys() {
                        self.pending.retire(&Register::GlobalField(key.clone()));
                    }
                    return;
                }
                let accepted: GlobalState = patch
                    .into_iter()
                    .filter(|(key, _)| {
                        !self.pending.is_pending(&Register::GlobalField(key.clone()))
                    })
                    .collect();
                if !self.global.merge(&accepted).is_empty() {
                    self.notify(RoomNotification::GlobalStateChanged(self.global.state().clone()));
                }
            }
            RoomEvent::MemberPatch { patch } => {
                if self.members.apply_remote(sender, &patch) {
                    self.notify_members();
                }
            }
            RoomEvent::ViewMode(declaration) => {
                if own && declaration.mode == ViewMode::Broadcaster {
                    self.pending.retire(&Register::Broadcaster);
                } else if declaration.mode == ViewMode::Broadcaster
                    && self.pending.is_pending(&Register::Broadcaster)
                {
                    log::debug!("Skipping takeover by {sender}, local takeover outstanding");
                    return;
                }
                let camera_before = self.view.camera();
                if self.view.apply_declaration(&declaration) {
                    self.notify(RoomNotification::BroadcastStateChanged(self.broadcast_state()));
                }
                self.notify_camera_if_moved(camera_before);
            }
            RoomEvent::Camera { camera } => {
                if self.view.apply_broadcaster_camera(sender, camera) {
                    self.notify(RoomNotification::CameraChanged(self.view.camera()));
                }
            }
            RoomEvent::CustomEvent(entry) => {
                if let Some(delivery) = self.events.receive(entry, Instant::now()) {
                    self.deliver(delivery);
                }
            }
            RoomEvent::MemberJoined(member) => {
                self.members.member_joined(member);
                self.notify_members();
            }
            RoomEvent::MemberLeft { member_id } => {
                self.members.member_left(member_id);
                if self.view.member_left(member_id) {
                    log::info!("Broadcaster {member_id} left, reverting to freedom");
                    self.notify(RoomNotification::BroadcastStateChanged(self.broadcast_state()));
                }
                self.notify_members();
            }
            RoomEvent::Writable {
                writable,
                member_state,
                payload,
            } => {
                if own {
                    let changed = self.members.is_writable() != writable;
                    self.members.set_writable(writable);
                    if !writable {
                        self.pending.clear();
                        self.adopt_confirmed_scenes();
                    }
                    if changed {
                        self.notify(RoomNotification::WritableChanged(writable));
                    }
                } else if writable {
                    self.members.member_joined(RoomMember {
                        member_id: sender,
                        member_state,
                        payload,
                    });
                } else {
                    self.members.member_left(sender);
                }
                self.notify_members();
            }
            RoomEvent::Join(_)
            | RoomEvent::Welcome { .. }
            | RoomEvent::ResyncRequest
            | RoomEvent::Resync(_)
            | RoomEvent::Leave
            | RoomEvent::Kicked { .. } => {}
        }
    }

    fn begin_resync(&mut self) {
        if self.phase == RoomPhase::Disconnected {
            return;
        }
        log::warn!("Room {} lost frames, requesting snapshot", self.config.room_id);
        self.set_phase(RoomPhase::Reconnecting);
        self.publish(RoomEvent::ResyncRequest);
    }

    fn apply_snapshot(&mut self, snapshot: RoomSnapshot) {
        self.last_seq = snapshot.seq;
        self.pending.clear();
        self.confirmed = SceneTree::from_snapshot(snapshot.scenes);
        self.scenes = self.confirmed.clone();
        self.clamp_selection();
        self.global.replace(snapshot.global_state);
        self.members.replace_members(snapshot.members);
        self.view.restore(snapshot.view);

        self.notify_scene_state();
        self.notify(RoomNotification::GlobalStateChanged(self.global.state().clone()));
        self.notify(RoomNotification::MemberStateChanged(self.members.local_state().clone()));
        self.notify_members();
        self.notify(RoomNotification::BroadcastStateChanged(self.broadcast_state()));
        self.notify(RoomNotification::CameraChanged(self.view.camera()));
    }

    fn shut_down(&mut self, reason: String) {
        if self.phase == RoomPhase::Disconnected {
            return;
        }
        log::info!("Room {} disconnected: {reason}", self.config.room_id);
        self.transport.close();
        self.pending.clear();
        self.global.clear();
        self.members.clear();
        self.view.reset();
        self.set_phase(RoomPhase::Disconnected);
        self.notify(RoomNotification::Disconnected { reason });
    }

    // ─── Helpers ──────────────────────────────────────────────

    fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.phase != RoomPhase::Connected {
            return Err(SessionError::NotConnected(self.phase));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), SessionError> {
        self.ensure_connected()?;
        if !self.members.is_writable() {
            return Err(RoomError::NotWritable.into());
        }
        Ok(())
    }

    fn set_phase(&mut self, phase: RoomPhase) {
        if self.phase == phase {
            return;
        }
        log::info!("Room {} phase {:?} -> {phase:?}", self.config.room_id, self.phase);
        self.phase = phase;
        self.notify(RoomNotification::PhaseChanged(phase));
    }

    /// Send an event to the relay. Transport loss ends the session instead
    /// of failing the caller.
    fn publish(&mut self, event: RoomEvent) {
        self.clock += 1;
        let sent = Frame::new(self.member_id, self.config.room_id, self.clock, &event)
            .and_then(|frame| frame.encode())
            .and_then(|bytes| self.transport.send(bytes));
        match sent {
            Ok(()) => {}
            Err(ProtocolError::ConnectionClosed) => self.shut_down("connection closed".to_string()),
            Err(e) => log::error!("Failed to send {:?}: {e}", event.message_type()),
        }
    }

    fn publish_tree(&mut self) {
        self.pending.issue(Register::SceneTree);
        let root = self.scenes.root().clone();
        self.publish(RoomEvent::SceneTree { root });
    }

    /// Replace the optimistic tree with the relay-ordered one once every
    /// local scene write has been echoed.
    fn adopt_confirmed_scenes(&mut self) {
        if self.pending.is_pending(&Register::SceneTree)
            || self.pending.is_pending(&Register::ScenePointer)
        {
            log::debug!("Holding relay scene state, local write outstanding");
            return;
        }
        if self.scenes == self.confirmed {
            return;
        }
        if self.scenes.current_path() != self.confirmed.current_path() {
            self.selection = 0;
        }
        self.scenes = self.confirmed.clone();
        self.clamp_selection();
        self.notify_scene_state();
    }

    fn publish_pointer(&mut self) {
        self.pending.issue(Register::ScenePointer);
        let path = self.scenes.current_path().to_string();
        self.publish(RoomEvent::ScenePointer { path });
    }

    fn clamp_selection(&mut self) {
        let available = self
            .scenes
            .current_scene()
            .map(|scene| scene.components_count)
            .unwrap_or(0);
        self.selection = self.selection.min(available);
    }

    fn deliver(&mut self, delivery: EventDelivery) {
        let notification = match delivery {
            EventDelivery::Single(entry) => RoomNotification::Event(entry),
            EventDelivery::Batch { event_name, entries } => {
                RoomNotification::EventBatch { event_name, entries }
            }
        };
        self.notify(notification);
    }

    fn notify(&self, notification: RoomNotification) {
        match self.notify_tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                log::warn!("Notification queue full, dropping {dropped:?}");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn notify_scene_state(&self) {
        self.notify(RoomNotification::SceneStateChanged(self.scene_state()));
    }

    fn notify_members(&self) {
        self.notify(RoomNotification::RoomMembersChanged(self.members.members()));
    }

    fn notify_camera_if_moved(&self, before: CameraState) {
        let camera = self.view.camera();
        if camera != before {
            self.notify(RoomNotification::CameraChanged(camera));
        }
    }

    fn notify_counts(&self, before: UndoRedoCounts) {
        let after = self.gate.counts();
        if after.undoable != before.undoable {
            self.notify(RoomNotification::CanUndoStepsUpdate(after.undoable));
        }
        if after.redoable != before.redoable {
            self.notify(RoomNotification::CanRedoStepsUpdate(after.redoable));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::relay::{LocalTransport, RelayHub};
    use inkroom_core::Appliance;
    use serde_json::json;
    use std::sync::Arc;

    async fn join(hub: &Arc<RelayHub>, room_id: Uuid, writable: bool) -> Room<LocalTransport> {
        let mut config = RoomConfig::new(room_id);
        config.writable = writable;
        Room::join(hub.connect(room_id).unwrap(), config).await.unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<RoomNotification>) -> Vec<RoomNotification> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    // ── Join tests ──

    #[tokio::test]
    async fn test_join_connects_with_defaults() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut room = join(&hub, Uuid::new_v4(), true).await;
        assert_eq!(room.phase(), RoomPhase::Connected);
        assert!(room.is_writable());
        assert_eq!(room.scene_state().scene_path, "/init");
        assert_eq!(room.room_members().len(), 1);

        let notifications = drain(&mut room.take_notifications().unwrap());
        assert!(notifications.contains(&RoomNotification::PhaseChanged(RoomPhase::Connected)));
        assert!(room.take_notifications().is_none());
    }

    #[tokio::test]
    async fn test_read_only_rejects_mutations() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut room = join(&hub, Uuid::new_v4(), false).await;
        assert!(!room.is_writable());
        assert_eq!(
            room.set_scene_index(0),
            Err(SessionError::Room(RoomError::NotWritable))
        );
        assert_eq!(
            room.set_member_state(MemberStatePatch::new().tool(Appliance::Text)),
            Err(SessionError::Room(RoomError::NotWritable))
        );
        assert!(room.room_members().is_empty());
    }

    #[tokio::test]
    async fn test_validation_errors_do_not_publish() {
        let hub = RelayHub::new(RelayConfig::default());
        let room_id = Uuid::new_v4();
        let mut room = join(&hub, room_id, true).await;
        let before = hub.stats(room_id).unwrap().frames_sequenced;

        assert!(matches!(
            room.set_scene_path("/missing"),
            Err(SessionError::Room(RoomError::InvalidPath(_)))
        ));
        assert_eq!(
            room.set_view_mode(ViewMode::Follower),
            Err(SessionError::Room(RoomError::NoBroadcaster))
        );
        assert_eq!(hub.stats(room_id).unwrap().frames_sequenced, before);
    }

    // ── Content tests ──

    #[tokio::test]
    async fn test_strokes_and_undo_adjust_components() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut room = join(&hub, Uuid::new_v4(), true).await;
        let mut rx = room.take_notifications().unwrap();
        room.disable_serialization(false);

        room.strokes_completed(3).unwrap();
        room.strokes_completed(2).unwrap();
        assert_eq!(room.scenes().current_scene().unwrap().components_count, 5);
        assert_eq!(room.undo_redo_counts(), UndoRedoCounts { undoable: 2, redoable: 0 });

        room.undo().unwrap();
        assert_eq!(room.scenes().current_scene().unwrap().components_count, 3);
        room.redo().unwrap();
        assert_eq!(room.scenes().current_scene().unwrap().components_count, 5);

        let notifications = drain(&mut rx);
        assert!(notifications.contains(&RoomNotification::CanUndoStepsUpdate(2)));
        assert!(notifications.contains(&RoomNotification::CanRedoStepsUpdate(1)));
    }

    #[tokio::test]
    async fn test_gate_disabled_is_silent() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut room = join(&hub, Uuid::new_v4(), true).await;
        room.strokes_completed(4).unwrap();
        room.selection_changed(4);

        room.copy();
        room.paste().unwrap();
        room.duplicate().unwrap();
        room.undo().unwrap();
        room.redo().unwrap();
        assert_eq!(room.scenes().current_scene().unwrap().components_count, 4);
        assert_eq!(room.undo_redo_counts(), UndoRedoCounts::default());
    }

    #[tokio::test]
    async fn test_disabling_gate_resets_counters() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut room = join(&hub, Uuid::new_v4(), true).await;
        room.disable_serialization(false);
        room.strokes_completed(1).unwrap();
        room.strokes_completed(1).unwrap();
        room.undo().unwrap();

        let mut rx = room.take_notifications().unwrap();
        drain(&mut rx);
        room.disable_serialization(true);
        assert_eq!(room.undo_redo_counts(), UndoRedoCounts::default());
        let notifications = drain(&mut rx);
        assert!(notifications.contains(&RoomNotification::CanUndoStepsUpdate(0)));
        assert!(notifications.contains(&RoomNotification::CanRedoStepsUpdate(0)));
    }

    #[tokio::test]
    async fn test_copy_paste_duplicate_delete() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut room = join(&hub, Uuid::new_v4(), true).await;
        room.disable_serialization(false);
        room.strokes_completed(2).unwrap();
        room.selection_changed(2);

        room.copy();
        room.paste().unwrap();
        room.duplicate().unwrap();
        assert_eq!(room.scenes().current_scene().unwrap().components_count, 6);

        room.selection_changed(1);
        room.delete_operation().unwrap();
        assert_eq!(room.scenes().current_scene().unwrap().components_count, 5);
        room.undo().unwrap();
        assert_eq!(room.scenes().current_scene().unwrap().components_count, 6);
    }

    #[tokio::test]
    async fn test_device_inputs_disabled_ignores_strokes() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut room = join(&hub, Uuid::new_v4(), true).await;
        room.disable_device_inputs(true);
        room.strokes_completed(9).unwrap();
        assert_eq!(room.scenes().current_scene().unwrap().components_count, 0);
    }

    // ── Camera tests ──

    #[tokio::test]
    async fn test_zoom_and_camera_lock() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut room = join(&hub, Uuid::new_v4(), true).await;
        room.zoom_to(2.5).unwrap();
        assert_eq!(room.camera_state().scale, 2.5);

        room.disable_camera_transform(true);
        room.zoom_to(4.0).unwrap();
        assert_eq!(room.camera_state().scale, 2.5);
        assert_eq!(
            room.broadcast_camera(),
            Err(SessionError::Room(RoomError::NotCurrentBroadcaster))
        );
    }

    // ── Lifecycle tests ──

    #[tokio::test]
    async fn test_disconnect_rejects_further_mutations() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut room = join(&hub, Uuid::new_v4(), true).await;
        room.set_global_state(json!({ "k": 1 }).as_object().cloned().unwrap()).unwrap();

        room.disconnect();
        assert_eq!(room.phase(), RoomPhase::Disconnected);
        assert!(room.global_state().is_empty());
        assert_eq!(
            room.set_scene_index(0),
            Err(SessionError::NotConnected(RoomPhase::Disconnected))
        );
        assert!(!room.process_next().await);
    }

    #[tokio::test]
    async fn test_bridge_messages_are_forwarded() {
        let hub = RelayHub::new(RelayConfig::default());
        let mut room = join(&hub, Uuid::new_v4(), true).await;
        let mut rx = room.take_notifications().unwrap();
        drain(&mut rx);
        room.post_message(json!({ "kind": "pageTurn" }));
        assert_eq!(
            drain(&mut rx),
            vec![RoomNotification::BridgeMessage(json!({ "kind": "pageTurn" }))]
        );
    }
}
