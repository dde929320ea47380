//! # inkroom-collab — Room sessions and relay for inkroom
//!
//! Connects the `inkroom-core` state machines to a relay that sequences
//! every room event into one total order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   Transport    ┌─────────────┐
//! │ Room        │ ◄────────────► │ RelayHub    │
//! │ (per member)│  Frame (bincode│ (central)   │
//! └──────┬──────┘   + JSON body) └──────┬──────┘
//!        │                              │
//!        ▼                              ▼
//! ┌─────────────┐               ┌─────────────┐
//! │ core stores │               │ RelayRoom   │
//! │ (optimistic)│               │ (seq + fan- │
//! └─────────────┘               │  out + copy)│
//!                               └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Frame envelope and room events
//! - [`transport`] — Seam between a session and its connection
//! - [`relay`] — In-process relay with per-room sequencing
//! - [`room`] — Participant session
//! - [`pending`] — Outstanding optimistic writes
//! - [`config`] — Session and relay settings
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Frame encode + decode | <2µs |
//! | Relay fan-out, 1K frames × 10 members | <10ms |

pub mod config;
pub mod pending;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod transport;

// Re-exports for convenience
pub use config::{RelayConfig, RoomConfig};
pub use protocol::{Frame, JoinRequest, MessageType, ProtocolError, RoomEvent, RoomSnapshot};
pub use relay::{LocalTransport, RelayHub, RelayStats};
pub use room::{Room, RoomNotification, RoomPhase, SessionError};
pub use transport::{Transport, TransportEvent};
