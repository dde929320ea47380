//! Aggregated read views of a room.

use serde::{Deserialize, Serialize};

use crate::scene::{Scene, SceneTree};
use crate::serialization::UndoRedoCounts;
use crate::state::{GlobalState, MemberState, RoomMember};
use crate::view_mode::{BroadcastState, CameraState};

/// The current directory as the host displays it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneState {
    /// Scenes of the directory holding the current scene.
    pub scenes: Vec<Scene>,
    pub scene_path: String,
    /// Index of the current scene within `scenes`.
    pub index: usize,
}

impl SceneState {
    pub fn of(tree: &SceneTree) -> Self {
        Self {
            scenes: tree.current_scenes().to_vec(),
            scene_path: tree.current_path().to_string(),
            index: tree.current_index(),
        }
    }
}

/// Everything a participant can observe at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub global_state: GlobalState,
    pub member_state: MemberState,
    pub broadcast_state: BroadcastState,
    pub scene_state: SceneState,
    pub camera_state: CameraState,
    pub room_members: Vec<RoomMember>,
    pub undo_redo: UndoRedoCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_state_tracks_current_directory() {
        let mut tree = SceneTree::new();
        tree.insert("/deck", vec![Scene::new("a"), Scene::new("b")], 0).unwrap();
        tree.set_current_path("/deck/b").unwrap();

        let state = SceneState::of(&tree);
        assert_eq!(state.scene_path, "/deck/b");
        assert_eq!(state.index, 1);
        assert_eq!(state.scenes.len(), 2);
        assert_eq!(state.scenes[0].name, "a");
    }
}
