//! # inkroom-core — Room state for a collaborative whiteboard
//!
//! Transport-free state machines that every participant of a room runs
//! locally. The `inkroom-collab` crate wires them to a relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │ SceneTree    │  │ GlobalStateStore │  │ MemberStateStore │
//! │ (LWW tree +  │  │ (LWW per field)  │  │ (single writer)  │
//! │  pointer)    │  └──────────────────┘  └──────────────────┘
//! └──────┬───────┘
//!        │ components_count
//!        ▼
//! ┌──────────────────┐  ┌──────────────────┐  ┌──────────────┐
//! │ SerializationGate│  │ ViewModeArbiter  │  │ EventBus     │
//! │ (undo / redo)    │  │ (broadcaster)    │  │ (coalescing) │
//! └──────────────────┘  └──────────────────┘  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`scene`] — Scene directory, paths and current-scene pointer
//! - [`state`] — Room-wide global state and per-member state
//! - [`view_mode`] — Broadcaster / follower / freedom arbitration
//! - [`serialization`] — Undo/redo gate over content operations
//! - [`events`] — Custom event subscriptions with high-frequency batching
//! - [`snapshot`] — Aggregated read views handed to the host
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Path resolution, 1K scenes | <1µs |
//! | Remote tree apply + pointer recovery | <50µs |
//! | High-frequency flush, 1K events | <100µs |

pub mod error;
pub mod events;
pub mod scene;
pub mod serialization;
pub mod snapshot;
pub mod state;
pub mod view_mode;

/// Relay-assigned participant identifier, unique within a room.
pub type MemberId = u64;

/// Author id stamped on events raised by the room itself.
pub const ADMIN_MEMBER_ID: MemberId = 0;

// Re-exports for convenience
pub use error::RoomError;
pub use events::{EventBus, EventDelivery, EventEntry, EventScope, HIGH_FREQUENCY_FLOOR};
pub use scene::{Directory, PageContent, Scene, ScenePathType, SceneTree, SceneTreeSnapshot};
pub use serialization::{ContentOperation, ContentOperationKind, SerializationGate, UndoRedoCounts};
pub use snapshot::{RoomState, SceneState};
pub use state::{
    Appliance, GlobalState, GlobalStateStore, MemberState, MemberStateOwner, MemberStatePatch,
    MemberStateStore, MemberView, RoomMember,
};
pub use view_mode::{
    BroadcastState, CameraInput, CameraState, Declaration, ViewMode, ViewModeArbiter,
    ViewModeSnapshot,
};
