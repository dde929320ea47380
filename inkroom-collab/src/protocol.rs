//! Binary protocol for room event relay.
//!
//! Wire format (bincode-encoded [`Frame`]):
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ sender   │ room_id  │ seq      │ clock    │ payload  │
//! │ varint   │ varint   │ 16 bytes │ varint   │ varint   │ JSON     │
//! └──────────┴──────────┴──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The payload is a JSON-encoded [`RoomEvent`]. Room state carries
//! schema-free values that bincode cannot describe, so the envelope stays
//! binary and the body stays self-describing.
//!
//! `seq` is zero on frames a client sends. The relay stamps the sender and
//! a room-wide sequence number before fanning a frame out.

use inkroom_core::{
    CameraState, Declaration, Directory, EventEntry, GlobalState, MemberId, MemberState,
    MemberStatePatch, RoomMember, SceneTreeSnapshot, ViewModeSnapshot,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Message types for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks to enter the room
    Join = 1,
    /// Relay accepts a join with a full snapshot
    Welcome = 2,
    /// Client lost frames and asks for a snapshot
    ResyncRequest = 3,
    /// Snapshot answering a resync request
    Resync = 4,
    /// Whole scene tree write
    SceneTree = 5,
    /// Current-scene pointer write
    ScenePointer = 6,
    /// Global state field writes
    GlobalPatch = 7,
    /// Member state patch from its owner
    MemberPatch = 8,
    /// View-mode declaration
    ViewMode = 9,
    /// Broadcaster camera update
    Camera = 10,
    /// Custom application event
    CustomEvent = 11,
    /// Interactive member entered
    MemberJoined = 12,
    /// Member disconnected
    MemberLeft = 13,
    /// Member switched between interactive and subscription mode
    Writable = 14,
    /// Client leaves gracefully
    Leave = 15,
    /// Relay removed the member
    Kicked = 16,
}

/// Parameters of a join request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub writable: bool,
    pub member_state: MemberState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Everything a client needs to start from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    /// Last sequence number reflected in the snapshot.
    pub seq: u64,
    pub scenes: SceneTreeSnapshot,
    pub global_state: GlobalState,
    pub members: Vec<RoomMember>,
    pub view: ViewModeSnapshot,
}

/// Event bodies carried in [`Frame::payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RoomEvent {
    Join(JoinRequest),
    Welcome {
        member_id: MemberId,
        snapshot: RoomSnapshot,
    },
    ResyncRequest,
    Resync(RoomSnapshot),
    SceneTree {
        root: Directory,
    },
    ScenePointer {
        path: String,
    },
    GlobalPatch {
        patch: GlobalState,
    },
    MemberPatch {
        patch: MemberStatePatch,
    },
    ViewMode(Declaration),
    Camera {
        camera: CameraState,
    },
    CustomEvent(EventEntry),
    MemberJoined(RoomMember),
    MemberLeft {
        member_id: MemberId,
    },
    Writable {
        writable: bool,
        member_state: MemberState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Leave,
    Kicked {
        reason: String,
    },
}

impl RoomEvent {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Join(_) => MessageType::Join,
            Self::Welcome { .. } => MessageType::Welcome,
            Self::ResyncRequest => MessageType::ResyncRequest,
            Self::Resync(_) => MessageType::Resync,
            Self::SceneTree { .. } => MessageType::SceneTree,
            Self::ScenePointer { .. } => MessageType::ScenePointer,
            Self::GlobalPatch { .. } => MessageType::GlobalPatch,
            Self::MemberPatch { .. } => MessageType::MemberPatch,
            Self::ViewMode(_) => MessageType::ViewMode,
            Self::Camera { .. } => MessageType::Camera,
            Self::CustomEvent(_) => MessageType::CustomEvent,
            Self::MemberJoined(_) => MessageType::MemberJoined,
            Self::MemberLeft { .. } => MessageType::MemberLeft,
            Self::Writable { .. } => MessageType::Writable,
            Self::Leave => MessageType::Leave,
            Self::Kicked { .. } => MessageType::Kicked,
        }
    }

    /// Events that mutate shared room content and need write permission.
    pub fn requires_write(&self) -> bool {
        matches!(
            self,
            Self::SceneTree { .. }
                | Self::ScenePointer { .. }
                | Self::GlobalPatch { .. }
                | Self::MemberPatch { .. }
                | Self::CustomEvent(_)
        )
    }

    /// Events only the relay may originate.
    pub fn relay_only(&self) -> bool {
        matches!(
            self,
            Self::Welcome { .. }
                | Self::Resync(_)
                | Self::MemberJoined(_)
                | Self::MemberLeft { .. }
                | Self::Kicked { .. }
        )
    }
}

/// Top-level wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub msg_type: MessageType,
    pub sender: MemberId,
    pub room_id: Uuid,
    /// Relay sequence number, zero until sequenced
    pub seq: u64,
    /// Sender's Lamport clock
    pub clock: u64,
    /// JSON-encoded [`RoomEvent`]
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(
        sender: MemberId,
        room_id: Uuid,
        clock: u64,
        event: &RoomEvent,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: event.message_type(),
            sender,
            room_id,
            seq: 0,
            clock,
            payload,
        })
    }

    /// Stamp relay ordering onto a client frame.
    pub fn sequenced(mut self, sender: MemberId, seq: u64) -> Self {
        self.sender = sender;
        self.seq = seq;
        self
    }

    /// Parse the payload, checking it matches `msg_type`.
    pub fn event(&self) -> Result<RoomEvent, ProtocolError> {
        let event: RoomEvent = serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if event.message_type() != self.msg_type {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(event)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame addressed to room {0}")]
    RoomMismatch(Uuid),
}
