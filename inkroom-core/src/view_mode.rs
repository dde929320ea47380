//! Broadcaster / follower / freedom arbitration.
//!
//! The room holds one broadcaster slot. Whoever fills it is the
//! Broadcaster; every other participant follows it unless they have
//! detached with camera input or an explicit Freedom declaration. With
//! the slot empty everyone is in Freedom.
//!
//! ```text
//!                declare(Broadcaster)  (takeover, clears detached set)
//!   Freedom ───────────────────────────────────────────► Broadcaster
//!      ▲  ▲                                                   │
//!      │  └────────── declare(Freedom|Follower) / leave ──────┘
//!      │ camera input / declare(Freedom)
//!   Follower ◄──── someone else declares Broadcaster
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RoomError;
use crate::MemberId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewMode {
    #[default]
    Freedom,
    Follower,
    Broadcaster,
}

/// Viewport over the infinite canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraState {
    pub center_x: f64,
    pub center_y: f64,
    pub scale: f64,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            center_x: 0.0,
            center_y: 0.0,
            scale: 1.0,
        }
    }
}

/// The local participant's view of the broadcast arrangement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastState {
    pub view_mode: ViewMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcaster_id: Option<MemberId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcaster_payload: Option<Value>,
}

/// A participant's explicit view-mode declaration, as replicated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Declaration {
    pub member_id: MemberId,
    pub mode: ViewMode,
    /// The declaring broadcaster's camera.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<CameraState>,
}

/// What local camera input did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraInput {
    /// Camera transforms are disabled.
    Ignored,
    Moved,
    /// Moved, and the participant stopped following.
    Detached,
    /// Moved while broadcasting; followers need the new camera.
    Broadcast,
}

/// Replicated part of the arbiter's state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewModeSnapshot {
    #[serde(default)]
    pub broadcaster: Option<MemberId>,
    #[serde(default)]
    pub broadcaster_camera: Option<CameraState>,
    #[serde(default)]
    pub detached: Vec<MemberId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewModeArbiter {
    local_id: MemberId,
    broadcaster: Option<MemberId>,
    broadcaster_camera: Option<CameraState>,
    detached: BTreeSet<MemberId>,
    camera: CameraState,
    camera_locked: bool,
}

impl ViewModeArbiter {
    pub fn new(local_id: MemberId) -> Self {
        Self {
            local_id,
            broadcaster: None,
            broadcaster_camera: None,
            detached: BTreeSet::new(),
            camera: CameraState::default(),
            camera_locked: false,
        }
    }

    // ─── Queries ──────────────────────────────────────────────

    pub fn effective_mode(&self, member_id: MemberId) -> ViewMode {
        match self.broadcaster {
            None => ViewMode::Freedom,
            Some(id) if id == member_id => ViewMode::Broadcaster,
            Some(_) if self.detached.contains(&member_id) => ViewMode::Freedom,
            Some(_) => ViewMode::Follower,
        }
    }

    pub fn local_mode(&self) -> ViewMode {
        self.effective_mode(self.local_id)
    }

    pub fn broadcaster(&self) -> Option<MemberId> {
        self.broadcaster
    }

    pub fn camera(&self) -> CameraState {
        self.camera
    }

    pub fn camera_locked(&self) -> bool {
        self.camera_locked
    }

    /// Broadcast state for the local participant. The broadcaster's payload
    /// lives in the member store, so the caller supplies it.
    pub fn broadcast_state(&self, broadcaster_payload: Option<Value>) -> BroadcastState {
        BroadcastState {
            view_mode: self.local_mode(),
            broadcaster_id: self.broadcaster,
            broadcaster_payload: self.broadcaster.and(broadcaster_payload),
        }
    }

    // ─── Local input ──────────────────────────────────────────

    pub fn set_camera_locked(&mut self, locked: bool) {
        self.camera_locked = locked;
    }

    /// Declare a mode for the local participant. Returns the declaration to
    /// replicate.
    pub fn declare(&mut self, mode: ViewMode) -> Result<Declaration, RoomError> {
        if mode == ViewMode::Follower && self.broadcaster.is_none() {
            return Err(RoomError::NoBroadcaster);
        }
        let declaration = Declaration {
            member_id: self.local_id,
            mode,
            camera: (mode == ViewMode::Broadcaster).then_some(self.camera),
        };
        self.apply_declaration(&declaration);
        Ok(declaration)
    }

    /// Local pan/zoom.
    pub fn camera_input(&mut self, camera: CameraState) -> CameraInput {
        if self.camera_locked {
            return CameraInput::Ignored;
        }
        self.camera = camera;
        match self.local_mode() {
            ViewMode::Broadcaster => {
                self.broadcaster_camera = Some(camera);
                CameraInput::Broadcast
            }
            ViewMode::Follower => {
                self.detached.insert(self.local_id);
                CameraInput::Detached
            }
            ViewMode::Freedom => CameraInput::Moved,
        }
    }

    /// The camera to push to followers, if the local participant broadcasts.
    pub fn broadcast_camera(&self) -> Result<CameraState, RoomError> {
        if self.broadcaster != Some(self.local_id) {
            return Err(RoomError::NotCurrentBroadcaster);
        }
        Ok(self.camera)
    }

    // ─── Replicated input ─────────────────────────────────────

    /// Apply a declaration from any participant, local echoes included.
    /// Returns true if the local mode or the broadcaster changed.
    pub fn apply_declaration(&mut self, declaration: &Declaration) -> bool {
        let before = (self.local_mode(), self.broadcaster);
        let member = declaration.member_id;
        match declaration.mode {
            ViewMode::Broadcaster => {
                self.broadcaster = Some(member);
                self.detached.clear();
                if declaration.camera.is_some() {
                    self.broadcaster_camera = declaration.camera;
                }
                self.follow_broadcaster();
            }
            ViewMode::Freedom | ViewMode::Follower if self.broadcaster == Some(member) => {
                self.clear_slot();
            }
            ViewMode::Freedom => {
                if self.broadcaster.is_some() {
                    self.detached.insert(member);
                }
            }
            ViewMode::Follower => {
                self.detached.remove(&member);
                self.follow_broadcaster();
            }
        }
        before != (self.local_mode(), self.broadcaster)
    }

    /// Camera update from the broadcaster. Returns true if the local camera changed.
    pub fn apply_broadcaster_camera(&mut self, member_id: MemberId, camera: CameraState) -> bool {
        if self.broadcaster != Some(member_id) {
            log::debug!("Ignoring camera from {member_id}, not the broadcaster");
            return false;
        }
        self.broadcaster_camera = Some(camera);
        self.follow_broadcaster()
    }

    /// A participant left. Returns true if it held the broadcaster slot.
    pub fn member_left(&mut self, member_id: MemberId) -> bool {
        self.detached.remove(&member_id);
        if self.broadcaster == Some(member_id) {
            self.clear_slot();
            return true;
        }
        false
    }

    pub fn snapshot(&self) -> ViewModeSnapshot {
        ViewModeSnapshot {
            broadcaster: self.broadcaster,
            broadcaster_camera: self.broadcaster_camera,
            detached: self.detached.iter().copied().collect(),
        }
    }

    pub fn restore(&mut self, snapshot: ViewModeSnapshot) {
        self.broadcaster = snapshot.broadcaster;
        self.broadcaster_camera = snapshot.broadcaster_camera;
        self.detached = snapshot.detached.into_iter().collect();
        self.follow_broadcaster();
    }

    /// Forget the arrangement, as on disconnect.
    pub fn reset(&mut self) {
        self.clear_slot();
    }

    fn clear_slot(&mut self) {
        self.broadcaster = None;
        self.broadcaster_camera = None;
        self.detached.clear();
    }

    fn follow_broadcaster(&mut self) -> bool {
        if self.local_mode() != ViewMode::Follower {
            return false;
        }
        match self.broadcaster_camera {
            Some(camera) if camera != self.camera => {
                self.camera = camera;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(x: f64, y: f64, scale: f64) -> CameraState {
        CameraState {
            center_x: x,
            center_y: y,
            scale,
        }
    }

    fn takeover(member_id: MemberId) -> Declaration {
        Declaration {
            member_id,
            mode: ViewMode::Broadcaster,
            camera: None,
        }
    }

    // ── Declaration tests ──

    #[test]
    fn test_default_is_freedom() {
        let arbiter = ViewModeArbiter::new(1);
        assert_eq!(arbiter.local_mode(), ViewMode::Freedom);
        assert_eq!(arbiter.broadcaster(), None);
    }

    #[test]
    fn test_remote_broadcaster_makes_local_follower() {
        let mut a = ViewModeArbiter::new(1);
        let mut b = ViewModeArbiter::new(2);

        a.camera_input(camera(10.0, 20.0, 2.0));
        let declaration = a.declare(ViewMode::Broadcaster).unwrap();
        assert_eq!(a.local_mode(), ViewMode::Broadcaster);

        assert!(b.apply_declaration(&declaration));
        assert_eq!(b.local_mode(), ViewMode::Follower);
        assert_eq!(b.broadcast_state(None).broadcaster_id, Some(1));
        assert_eq!(b.camera(), camera(10.0, 20.0, 2.0));
    }

    #[test]
    fn test_takeover_demotes_previous_broadcaster() {
        let mut a = ViewModeArbiter::new(1);
        let first = a.declare(ViewMode::Broadcaster).unwrap();
        let second = Declaration {
            member_id: 2,
            mode: ViewMode::Broadcaster,
            camera: Some(camera(1.0, 1.0, 1.0)),
        };
        a.apply_declaration(&first);
        a.apply_declaration(&second);

        assert_eq!(a.local_mode(), ViewMode::Follower);
        assert_eq!(a.broadcaster(), Some(2));
        let broadcasters = [1, 2, 3]
            .into_iter()
            .filter(|id| a.effective_mode(*id) == ViewMode::Broadcaster)
            .count();
        assert_eq!(broadcasters, 1);
    }

    #[test]
    fn test_takeover_clears_detached_members() {
        let mut a = ViewModeArbiter::new(1);
        a.apply_declaration(&takeover(2));
        a.declare(ViewMode::Freedom).unwrap();
        assert_eq!(a.local_mode(), ViewMode::Freedom);

        a.apply_declaration(&takeover(3));
        assert_eq!(a.local_mode(), ViewMode::Follower);
    }

    #[test]
    fn test_follower_without_broadcaster_fails() {
        let mut a = ViewModeArbiter::new(1);
        assert_eq!(a.declare(ViewMode::Follower), Err(RoomError::NoBroadcaster));
        assert_eq!(a.local_mode(), ViewMode::Freedom);
    }

    #[test]
    fn test_detached_member_can_follow_again() {
        let mut a = ViewModeArbiter::new(1);
        a.apply_declaration(&Declaration {
            member_id: 2,
            mode: ViewMode::Broadcaster,
            camera: Some(camera(5.0, 5.0, 1.0)),
        });
        a.camera_input(camera(0.0, 0.0, 3.0));
        assert_eq!(a.local_mode(), ViewMode::Freedom);

        a.declare(ViewMode::Follower).unwrap();
        assert_eq!(a.local_mode(), ViewMode::Follower);
        assert_eq!(a.camera(), camera(5.0, 5.0, 1.0));
    }

    #[test]
    fn test_broadcaster_resigns() {
        let mut a = ViewModeArbiter::new(1);
        a.declare(ViewMode::Broadcaster).unwrap();
        a.declare(ViewMode::Freedom).unwrap();
        assert_eq!(a.broadcaster(), None);
        assert_eq!(a.effective_mode(2), ViewMode::Freedom);
    }

    // ── Camera tests ──

    #[test]
    fn test_follower_camera_input_detaches() {
        let mut b = ViewModeArbiter::new(2);
        b.apply_declaration(&takeover(1));
        assert_eq!(b.camera_input(camera(3.0, 3.0, 1.0)), CameraInput::Detached);
        assert_eq!(b.local_mode(), ViewMode::Freedom);

        assert!(!b.apply_broadcaster_camera(1, camera(9.0, 9.0, 1.0)));
        assert_eq!(b.camera(), camera(3.0, 3.0, 1.0));
    }

    #[test]
    fn test_locked_camera_keeps_following() {
        let mut b = ViewModeArbiter::new(2);
        b.apply_declaration(&takeover(1));
        b.set_camera_locked(true);
        assert_eq!(b.camera_input(camera(3.0, 3.0, 1.0)), CameraInput::Ignored);
        assert_eq!(b.local_mode(), ViewMode::Follower);
    }

    #[test]
    fn test_follower_tracks_broadcaster_camera() {
        let mut b = ViewModeArbiter::new(2);
        b.apply_declaration(&takeover(1));
        assert!(b.apply_broadcaster_camera(1, camera(7.0, -7.0, 0.5)));
        assert_eq!(b.camera(), camera(7.0, -7.0, 0.5));
        assert!(!b.apply_broadcaster_camera(3, camera(0.0, 0.0, 1.0)));
    }

    #[test]
    fn test_broadcaster_camera_input_is_published() {
        let mut a = ViewModeArbiter::new(1);
        assert_eq!(a.broadcast_camera(), Err(RoomError::NotCurrentBroadcaster));
        a.declare(ViewMode::Broadcaster).unwrap();
        assert_eq!(a.camera_input(camera(1.0, 2.0, 3.0)), CameraInput::Broadcast);
        assert_eq!(a.broadcast_camera(), Ok(camera(1.0, 2.0, 3.0)));
    }

    // ── Membership tests ──

    #[test]
    fn test_broadcaster_leaving_reverts_to_freedom() {
        let mut b = ViewModeArbiter::new(2);
        b.apply_declaration(&takeover(1));
        assert!(b.member_left(1));
        assert_eq!(b.local_mode(), ViewMode::Freedom);
        assert!(!b.member_left(3));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut a = ViewModeArbiter::new(1);
        a.apply_declaration(&Declaration {
            member_id: 2,
            mode: ViewMode::Broadcaster,
            camera: Some(camera(4.0, 4.0, 4.0)),
        });
        let mut c = ViewModeArbiter::new(3);
        c.restore(a.snapshot());
        assert_eq!(c.local_mode(), ViewMode::Follower);
        assert_eq!(c.camera(), camera(4.0, 4.0, 4.0));
    }
}
