//! Room-wide global state and per-participant member state.
//!
//! Global state is a flat key/value object where every top-level key is an
//! independent last-write-wins register. Member state is single-writer:
//! only the owning participant can mutate it, and only while it holds
//! write permission. Everyone else gets a read-only [`MemberView`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RoomError;
use crate::MemberId;

/// Shared application state, one register per top-level key.
pub type GlobalState = Map<String, Value>;

// ─── Global state ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalStateStore {
    state: GlobalState,
}

impl GlobalStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// Merge `patch` field by field. Returns the keys whose value changed.
    pub fn merge(&mut self, patch: &GlobalState) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, value) in patch {
            if self.state.get(key) != Some(value) {
                self.state.insert(key.clone(), value.clone());
                changed.push(key.clone());
            }
        }
        changed
    }

    /// Replace everything, as on join or resync.
    pub fn replace(&mut self, state: GlobalState) {
        self.state = state;
    }

    pub fn clear(&mut self) {
        self.state.clear();
    }
}

// ─── Member state ──────────────────────────────────────────────

/// Drawing tool selected by a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Appliance {
    #[default]
    Pencil,
    Selector,
    Rectangle,
    Ellipse,
    Eraser,
    Text,
    Straight,
    Arrow,
    Hand,
    LaserPointer,
}

/// A participant's tool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberState {
    pub active_tool: Appliance,
    /// RGB
    pub stroke_color: [u8; 3],
    pub stroke_width: f64,
    pub text_size: f64,
    /// Tool-specific fields the core does not interpret.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub tool_fields: Map<String, Value>,
}

impl Default for MemberState {
    fn default() -> Self {
        Self {
            active_tool: Appliance::Pencil,
            stroke_color: [0, 0, 0],
            stroke_width: 4.0,
            text_size: 16.0,
            tool_fields: Map::new(),
        }
    }
}

impl MemberState {
    pub fn apply(&mut self, patch: &MemberStatePatch) {
        if let Some(tool) = patch.active_tool {
            self.active_tool = tool;
        }
        if let Some(color) = patch.stroke_color {
            self.stroke_color = color;
        }
        if let Some(width) = patch.stroke_width {
            self.stroke_width = width;
        }
        if let Some(size) = patch.text_size {
            self.text_size = size;
        }
        for (key, value) in &patch.tool_fields {
            self.tool_fields.insert(key.clone(), value.clone());
        }
    }
}

/// Partial update to a [`MemberState`]. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_tool: Option<Appliance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_color: Option<[u8; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub tool_fields: Map<String, Value>,
}

impl MemberStatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool(mut self, tool: Appliance) -> Self {
        self.active_tool = Some(tool);
        self
    }

    pub fn stroke_color(mut self, color: [u8; 3]) -> Self {
        self.stroke_color = Some(color);
        self
    }

    pub fn stroke_width(mut self, width: f64) -> Self {
        self.stroke_width = Some(width);
        self
    }

    pub fn text_size(mut self, size: f64) -> Self {
        self.text_size = Some(size);
        self
    }

    pub fn tool_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.tool_fields.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.active_tool.is_none()
            && self.stroke_color.is_none()
            && self.stroke_width.is_none()
            && self.text_size.is_none()
            && self.tool_fields.is_empty()
    }
}

/// An interactive participant as seen by the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub member_id: MemberId,
    pub member_state: MemberState,
    /// Caller-defined metadata, opaque to the room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Read-only capability over one participant's state.
#[derive(Debug, Clone, Copy)]
pub struct MemberView<'a> {
    member: &'a RoomMember,
}

impl<'a> MemberView<'a> {
    pub fn member_id(&self) -> MemberId {
        self.member.member_id
    }

    pub fn state(&self) -> &'a MemberState {
        &self.member.member_state
    }

    pub fn payload(&self) -> Option<&'a Value> {
        self.member.payload.as_ref()
    }
}

/// Mutation capability over the local participant's own state.
///
/// Only handed out by [`MemberStateStore::owner`] while writable.
pub struct MemberStateOwner<'a> {
    store: &'a mut MemberStateStore,
}

impl MemberStateOwner<'_> {
    pub fn apply(&mut self, patch: &MemberStatePatch) -> &MemberState {
        let store = &mut *self.store;
        store.local_state.apply(patch);
        if let Some(member) = store.members.get_mut(&store.local_id) {
            member.member_state = store.local_state.clone();
        }
        &store.local_state
    }

    pub fn set_payload(&mut self, payload: Option<Value>) {
        let store = &mut *self.store;
        store.local_payload = payload.clone();
        if let Some(member) = store.members.get_mut(&store.local_id) {
            member.payload = payload;
        }
    }
}

/// Member list plus the local participant's own state.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberStateStore {
    local_id: MemberId,
    writable: bool,
    local_state: MemberState,
    local_payload: Option<Value>,
    members: BTreeMap<MemberId, RoomMember>,
}

impl MemberStateStore {
    pub fn new(
        local_id: MemberId,
        writable: bool,
        state: MemberState,
        payload: Option<Value>,
    ) -> Self {
        let mut store = Self {
            local_id,
            writable: false,
            local_state: state,
            local_payload: payload,
            members: BTreeMap::new(),
        };
        store.set_writable(writable);
        store
    }

    pub fn local_id(&self) -> MemberId {
        self.local_id
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn local_state(&self) -> &MemberState {
        &self.local_state
    }

    pub fn local_payload(&self) -> Option<&Value> {
        self.local_payload.as_ref()
    }

    /// The local participant as a room member.
    pub fn local_member(&self) -> RoomMember {
        RoomMember {
            member_id: self.local_id,
            member_state: self.local_state.clone(),
            payload: self.local_payload.clone(),
        }
    }

    /// Mutation capability for the local state, or `NotWritable`.
    pub fn owner(&mut self) -> Result<MemberStateOwner<'_>, RoomError> {
        if !self.writable {
            return Err(RoomError::NotWritable);
        }
        Ok(MemberStateOwner { store: self })
    }

    pub fn view(&self, member_id: MemberId) -> Option<MemberView<'_>> {
        self.members.get(&member_id).map(|member| MemberView { member })
    }

    /// Interactive members ordered by id.
    pub fn members(&self) -> Vec<RoomMember> {
        self.members.values().cloned().collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Switch between interactive and subscription mode.
    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
        if writable {
            let member = self.local_member();
            self.members.insert(self.local_id, member);
        } else {
            self.members.remove(&self.local_id);
        }
    }

    pub fn member_joined(&mut self, member: RoomMember) {
        if member.member_id == self.local_id {
            return;
        }
        self.members.insert(member.member_id, member);
    }

    pub fn member_left(&mut self, member_id: MemberId) -> Option<RoomMember> {
        if member_id == self.local_id {
            return None;
        }
        self.members.remove(&member_id)
    }

    /// Apply another participant's patch. Own echoes are ignored since the
    /// local state is already ahead of them.
    pub fn apply_remote(&mut self, member_id: MemberId, patch: &MemberStatePatch) -> bool {
        if member_id == self.local_id {
            return false;
        }
        match self.members.get_mut(&member_id) {
            Some(member) => {
                member.member_state.apply(patch);
                true
            }
            None => {
                log::debug!("Member patch from unknown member {member_id}");
                false
            }
        }
    }

    /// Replace the member list from a snapshot. The local entry, if present,
    /// is adopted as the authoritative local state.
    pub fn replace_members(&mut self, members: Vec<RoomMember>) {
        self.members = members
            .into_iter()
            .map(|member| (member.member_id, member))
            .collect();
        if let Some(local) = self.members.get(&self.local_id) {
            self.local_state = local.member_state.clone();
            self.local_payload = local.payload.clone();
        }
        self.writable = self.members.contains_key(&self.local_id);
    }

    /// Drop every other member, as on disconnect.
    pub fn clear(&mut self) {
        let local = self.members.remove(&self.local_id);
        self.members.clear();
        if let Some(local) = local {
            self.members.insert(self.local_id, local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(value: Value) -> GlobalState {
        match value {
            Value::Object(map) => map,
            _ => panic!("patch must be an object"),
        }
    }

    // ── Global state tests ──

    #[test]
    fn test_merge_is_per_field() {
        let mut store = GlobalStateStore::new();
        store.merge(&patch(json!({ "x": 1 })));
        store.merge(&patch(json!({ "y": 2 })));
        assert_eq!(Value::Object(store.state().clone()), json!({ "x": 1, "y": 2 }));
    }

    #[test]
    fn test_merge_last_write_wins_per_field() {
        let mut store = GlobalStateStore::new();
        store.merge(&patch(json!({ "x": 1, "keep": true })));
        let changed = store.merge(&patch(json!({ "x": { "nested": 2 } })));
        assert_eq!(changed, vec!["x".to_string()]);
        assert_eq!(store.get("x"), Some(&json!({ "nested": 2 })));
        assert_eq!(store.get("keep"), Some(&json!(true)));
    }

    #[test]
    fn test_merge_unchanged_reports_nothing() {
        let mut store = GlobalStateStore::new();
        store.merge(&patch(json!({ "x": 1 })));
        assert!(store.merge(&patch(json!({ "x": 1 }))).is_empty());
    }

    // ── Member state tests ──

    #[test]
    fn test_owner_requires_writable() {
        let mut store = MemberStateStore::new(7, false, MemberState::default(), None);
        assert!(matches!(store.owner(), Err(RoomError::NotWritable)));
        assert_eq!(store.member_count(), 0);
    }

    #[test]
    fn test_owner_applies_patch_and_updates_member_entry() {
        let payload = Some(json!({ "nick": "ana" }));
        let mut store = MemberStateStore::new(7, true, MemberState::default(), payload);
        let patch = MemberStatePatch::new()
            .tool(Appliance::Rectangle)
            .stroke_color([255, 0, 0])
            .tool_field("dash", json!(true));
        store.owner().unwrap().apply(&patch);

        assert_eq!(store.local_state().active_tool, Appliance::Rectangle);
        let view = store.view(7).unwrap();
        assert_eq!(view.state().stroke_color, [255, 0, 0]);
        assert_eq!(view.state().tool_fields.get("dash"), Some(&json!(true)));
        assert_eq!(view.payload(), Some(&json!({ "nick": "ana" })));
    }

    #[test]
    fn test_set_writable_toggles_membership() {
        let mut store = MemberStateStore::new(3, true, MemberState::default(), None);
        assert!(store.view(3).is_some());
        store.set_writable(false);
        assert!(store.view(3).is_none());
        assert!(store.owner().is_err());
    }

    #[test]
    fn test_remote_patch_applies_to_other_members_only() {
        let mut store = MemberStateStore::new(1, true, MemberState::default(), None);
        store.member_joined(RoomMember {
            member_id: 2,
            member_state: MemberState::default(),
            payload: None,
        });
        assert!(store.apply_remote(2, &MemberStatePatch::new().stroke_width(9.0)));
        assert_eq!(store.view(2).unwrap().state().stroke_width, 9.0);

        assert!(!store.apply_remote(1, &MemberStatePatch::new().stroke_width(1.0)));
        assert_eq!(store.local_state().stroke_width, 4.0);
        assert!(!store.apply_remote(99, &MemberStatePatch::new().text_size(1.0)));
    }

    #[test]
    fn test_replace_members_adopts_local_entry() {
        let mut store = MemberStateStore::new(1, false, MemberState::default(), None);
        let mut state = MemberState::default();
        state.active_tool = Appliance::Eraser;
        store.replace_members(vec![RoomMember {
            member_id: 1,
            member_state: state,
            payload: None,
        }]);
        assert!(store.is_writable());
        assert_eq!(store.local_state().active_tool, Appliance::Eraser);
    }

    #[test]
    fn test_patch_serde_skips_absent_fields() {
        let patch = MemberStatePatch::new().tool(Appliance::LaserPointer);
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, json!({ "activeTool": "laserPointer" }));
        assert!(MemberStatePatch::new().is_empty());
    }
}
