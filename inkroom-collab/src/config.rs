//! Session and relay configuration.

use std::time::Duration;

use inkroom_core::MemberState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Configuration for joining a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub room_id: Uuid,
    /// Interactive (true) or subscription-only (false) participant
    pub writable: bool,
    /// Caller-defined metadata shown to other members
    pub payload: Option<Value>,
    /// Initial tool settings
    pub member_state: MemberState,
    /// How long to wait for the relay to accept the join
    #[serde(with = "millis")]
    pub join_timeout: Duration,
    /// Buffered notifications before the session starts dropping them
    pub notification_capacity: usize,
    /// Initial state of the undo/redo gate
    pub serialization_enabled: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            room_id: Uuid::new_v4(),
            writable: true,
            payload: None,
            member_state: MemberState::default(),
            join_timeout: Duration::from_secs(10),
            notification_capacity: 256,
            serialization_enabled: false,
        }
    }
}

impl RoomConfig {
    pub fn new(room_id: Uuid) -> Self {
        Self {
            room_id,
            ..Self::default()
        }
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Frames buffered per receiver before a slow member desyncs
    pub broadcast_capacity: usize,
    pub max_members_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_members_per_room: 100,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_room_config_defaults() {
        let config = RoomConfig::default();
        assert!(config.writable);
        assert_eq!(config.join_timeout, Duration::from_secs(10));
        assert_eq!(config.notification_capacity, 256);
        assert!(!config.serialization_enabled);
    }

    #[test]
    fn test_room_config_from_partial_json() {
        let room = Uuid::new_v4();
        let config: RoomConfig = serde_json::from_value(json!({
            "room_id": room,
            "writable": false,
            "join_timeout": 2500,
        }))
        .unwrap();
        assert_eq!(config.room_id, room);
        assert!(!config.writable);
        assert_eq!(config.join_timeout, Duration::from_millis(2500));
        assert_eq!(config.notification_capacity, 256);
    }

    #[test]
    fn test_relay_config_json() {
        let json = serde_json::to_value(RelayConfig::default()).unwrap();
        assert_eq!(json, json!({ "broadcast_capacity": 256, "max_members_per_room": 100 }));
    }
}
