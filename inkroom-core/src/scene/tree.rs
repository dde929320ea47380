//! Hierarchical scene directory with a room-wide current-scene pointer.
//!
//! Directories are implicit: they exist while something lives beneath
//! them. The root always exists and the tree always holds at least one
//! scene; when the last one goes away a fresh `/init` takes its place.
//!
//! Removing the current scene (or a directory above it) moves the pointer
//! with a fixed recovery walk:
//!
//! ```text
//! scene removed from D at i ──► D[i] ──► D[i-1] ──► first scene of D's first subdir
//!                                                        │ (nothing left)
//!                                                        ▼
//! directory removed from P at k ──► first scene of P.dirs[k]   (next sibling)
//!                               ──► P.scenes[0]
//!                               ──► first scene of P.dirs[k-1] (previous sibling)
//!                               ──► prune P, repeat one level up
//!                               ──► at the root: create /init
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{dir_path, scene_path, segments, Scene, ScenePathType};
use crate::error::RoomError;

/// Name of the scene created when a room would otherwise be empty.
pub const INIT_SCENE: &str = "init";

/// A directory node. The root has an empty name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub name: String,
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub directories: Vec<Directory>,
}

impl Directory {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn scene_index(&self, name: &str) -> Option<usize> {
        self.scenes.iter().position(|scene| scene.name == name)
    }

    pub fn child_index(&self, name: &str) -> Option<usize> {
        self.directories.iter().position(|dir| dir.name == name)
    }

    pub fn child(&self, name: &str) -> Option<&Directory> {
        self.directories.iter().find(|dir| dir.name == name)
    }

    /// True when the directory holds neither scenes nor subdirectories.
    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty() && self.directories.is_empty()
    }

    /// Scenes in this directory and every directory beneath it.
    pub fn scene_count(&self) -> usize {
        self.scenes.len()
            + self
                .directories
                .iter()
                .map(Directory::scene_count)
                .sum::<usize>()
    }
}

/// Full tree plus pointer, as exchanged on join and resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneTreeSnapshot {
    pub root: Directory,
    pub current_path: String,
}

/// The room's scene directory.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneTree {
    root: Directory,
    current: String,
}

impl Default for SceneTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Path of the first scene reachable from `dir`, depth-first by index.
fn first_scene_path(dir: &Directory, path: &[String]) -> Option<String> {
    if let Some(scene) = dir.scenes.first() {
        return Some(scene_path(path, &scene.name));
    }
    dir.directories.iter().find_map(|child| {
        let mut child_path = path.to_vec();
        child_path.push(child.name.clone());
        first_scene_path(child, &child_path)
    })
}

fn generated_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("scene-{}", &id[..8])
}

impl SceneTree {
    /// A tree holding only `/init`, which is current.
    pub fn new() -> Self {
        let mut root = Directory::default();
        root.scenes.push(Scene::new(INIT_SCENE));
        Self {
            root,
            current: format!("/{INIT_SCENE}"),
        }
    }

    /// Rebuild from a snapshot, repairing an empty tree or a dangling pointer.
    pub fn from_snapshot(snapshot: SceneTreeSnapshot) -> Self {
        let mut tree = Self {
            root: snapshot.root,
            current: snapshot.current_path,
        };
        tree.root.name.clear();
        if tree.resolve_path_type(&tree.current) != ScenePathType::Page {
            log::debug!("Snapshot pointer {} does not resolve, reselecting", tree.current);
            tree.current = match first_scene_path(&tree.root, &[]) {
                Some(path) => path,
                None => tree.create_init(),
            };
        }
        tree
    }

    pub fn snapshot(&self) -> SceneTreeSnapshot {
        SceneTreeSnapshot {
            root: self.root.clone(),
            current_path: self.current.clone(),
        }
    }

    pub fn root(&self) -> &Directory {
        &self.root
    }

    // ─── Queries ──────────────────────────────────────────────

    pub fn resolve_path_type(&self, path: &str) -> ScenePathType {
        let Some(mut segs) = segments(path) else {
            return ScenePathType::Empty;
        };
        let Some(name) = segs.pop() else {
            return ScenePathType::Dir;
        };
        match self.dir(&segs) {
            Some(dir) if dir.scene_index(&name).is_some() => ScenePathType::Page,
            Some(dir) if dir.child_index(&name).is_some() => ScenePathType::Dir,
            _ => ScenePathType::Empty,
        }
    }

    pub fn current_path(&self) -> &str {
        &self.current
    }

    /// Index of the current scene within its directory.
    pub fn current_index(&self) -> usize {
        self.locate_scene(&self.current)
            .map(|(_, index)| index)
            .unwrap_or(0)
    }

    pub fn current_scene(&self) -> Option<&Scene> {
        self.scene(&self.current)
    }

    /// Scenes of the directory holding the current scene.
    pub fn current_scenes(&self) -> &[Scene] {
        self.locate_scene(&self.current)
            .and_then(|(dir, _)| self.dir(&dir))
            .map(|dir| dir.scenes.as_slice())
            .unwrap_or(&[])
    }

    pub fn scene(&self, path: &str) -> Option<&Scene> {
        let (dir, index) = self.locate_scene(path)?;
        self.dir(&dir)?.scenes.get(index)
    }

    /// Scenes directly inside `path`, or `None` if it is not a directory.
    pub fn scenes_in(&self, path: &str) -> Option<&[Scene]> {
        let segs = segments(path)?;
        self.dir(&segs).map(|dir| dir.scenes.as_slice())
    }

    pub fn scene_count(&self) -> usize {
        self.root.scene_count()
    }

    /// Every scene path in depth-first order.
    pub fn scene_paths(&self) -> Vec<String> {
        fn walk(dir: &Directory, path: &mut Vec<String>, out: &mut Vec<String>) {
            for scene in &dir.scenes {
                out.push(scene_path(path, &scene.name));
            }
            for child in &dir.directories {
                path.push(child.name.clone());
                walk(child, path, out);
                path.pop();
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut Vec::new(), &mut out);
        out
    }

    // ─── Local mutations ──────────────────────────────────────

    /// Splice `scenes` into the directory at `dir`, creating it if needed.
    ///
    /// The index is clamped to the directory length. A scene whose name is
    /// already present replaces the existing one. The pointer does not move.
    pub fn insert(&mut self, dir: &str, scenes: Vec<Scene>, index: usize) -> Result<(), RoomError> {
        let invalid = || RoomError::InvalidPath(dir.to_string());
        let segs = segments(dir).ok_or_else(invalid)?;

        let mut existing = Some(&self.root);
        for name in &segs {
            let Some(node) = existing else { break };
            if node.scene_index(name).is_some() {
                return Err(invalid());
            }
            existing = node.child(name);
        }

        let mut seen = HashSet::new();
        for scene in &scenes {
            if scene.name.contains('/') {
                return Err(RoomError::InvalidPath(scene.name.clone()));
            }
            if !scene.name.is_empty() && !seen.insert(scene.name.as_str()) {
                return Err(RoomError::InvalidPath(scene_path(&segs, &scene.name)));
            }
            if existing.is_some_and(|node| node.child_index(&scene.name).is_some()) {
                return Err(RoomError::InvalidPath(scene_path(&segs, &scene.name)));
            }
        }
        if scenes.is_empty() {
            return Ok(());
        }

        let incoming: Vec<Scene> = scenes
            .into_iter()
            .map(|mut scene| {
                if scene.name.is_empty() {
                    scene.name = generated_name();
                }
                scene
            })
            .collect();
        let target = self.ensure_dir(&segs);
        target
            .scenes
            .retain(|old| !incoming.iter().any(|scene| scene.name == old.name));
        let at = index.min(target.scenes.len());
        target.scenes.splice(at..at, incoming);
        Ok(())
    }

    pub fn set_current_path(&mut self, path: &str) -> Result<(), RoomError> {
        if self.resolve_path_type(path) != ScenePathType::Page {
            return Err(RoomError::InvalidPath(path.to_string()));
        }
        self.current = path.to_string();
        Ok(())
    }

    pub fn set_current_index(&mut self, index: usize) -> Result<(), RoomError> {
        let (dir, _) = self
            .locate_scene(&self.current)
            .ok_or_else(|| RoomError::StaleSnapshot(self.current.clone()))?;
        let len = self.dir(&dir).map(|d| d.scenes.len()).unwrap_or(0);
        let name = self
            .dir(&dir)
            .and_then(|d| d.scenes.get(index))
            .map(|scene| scene.name.clone())
            .ok_or(RoomError::IndexOutOfRange { index, len })?;
        self.current = scene_path(&dir, &name);
        Ok(())
    }

    /// Relocate a scene, keeping its name.
    ///
    /// Onto a directory the scene is appended. Onto a scene it takes that
    /// scene's position and the target shifts back by one.
    pub fn move_scene(&mut self, source: &str, target: &str) -> Result<(), RoomError> {
        match self.resolve_path_type(source) {
            ScenePathType::Page => {}
            ScenePathType::Dir => {
                return Err(RoomError::InvalidMove(format!("{source} is a directory")))
            }
            ScenePathType::Empty => return Err(RoomError::InvalidPath(source.to_string())),
        }
        let (src_dir, src_index) = self
            .locate_scene(source)
            .ok_or_else(|| RoomError::InvalidPath(source.to_string()))?;

        let (dst_dir, dst_index) = match self.resolve_path_type(target) {
            ScenePathType::Empty => return Err(RoomError::InvalidPath(target.to_string())),
            ScenePathType::Dir => {
                let segs = segments(target)
                    .ok_or_else(|| RoomError::InvalidPath(target.to_string()))?;
                (segs, None)
            }
            ScenePathType::Page => {
                if source == target {
                    return Ok(());
                }
                let (segs, index) = self
                    .locate_scene(target)
                    .ok_or_else(|| RoomError::InvalidPath(target.to_string()))?;
                (segs, Some(index))
            }
        };

        let same_dir = src_dir == dst_dir;
        let name = self
            .dir(&src_dir)
            .and_then(|dir| dir.scenes.get(src_index))
            .map(|scene| scene.name.clone())
            .ok_or_else(|| RoomError::InvalidPath(source.to_string()))?;
        if !same_dir {
            let taken = self.dir(&dst_dir).is_some_and(|dir| {
                dir.scene_index(&name).is_some() || dir.child_index(&name).is_some()
            });
            if taken {
                return Err(RoomError::InvalidMove(format!(
                    "{} already exists",
                    scene_path(&dst_dir, &name)
                )));
            }
        }

        let scene = match self.dir_mut(&src_dir) {
            Some(dir) => dir.scenes.remove(src_index),
            None => return Err(RoomError::InvalidPath(source.to_string())),
        };
        let dst = self.ensure_dir(&dst_dir);
        let at = match dst_index {
            Some(index) if same_dir && src_index < index => index - 1,
            Some(index) => index,
            None => dst.scenes.len(),
        };
        dst.scenes.insert(at.min(dst.scenes.len()), scene);

        if self.current == source {
            self.current = scene_path(&dst_dir, &name);
        }
        self.prune(src_dir);
        Ok(())
    }

    /// Delete a scene or a directory with everything beneath it.
    ///
    /// Returns true when the current-scene pointer moved.
    pub fn remove(&mut self, path: &str) -> Result<bool, RoomError> {
        let mut segs = segments(path).ok_or_else(|| RoomError::InvalidPath(path.to_string()))?;
        let kind = self.resolve_path_type(path);
        let Some(name) = segs.pop() else {
            self.root = Directory::default();
            self.current = self.create_init();
            return Ok(true);
        };

        match kind {
            ScenePathType::Empty => Err(RoomError::InvalidPath(path.to_string())),
            ScenePathType::Page => {
                let was_current = self.current == path;
                let index = match self.dir_mut(&segs) {
                    Some(dir) => match dir.scene_index(&name) {
                        Some(index) => {
                            dir.scenes.remove(index);
                            index
                        }
                        None => return Err(RoomError::InvalidPath(path.to_string())),
                    },
                    None => return Err(RoomError::InvalidPath(path.to_string())),
                };
                if was_current {
                    self.current = self.recover_after_scene(segs, index);
                } else {
                    self.prune(segs);
                }
                Ok(was_current)
            }
            ScenePathType::Dir => {
                let holds_current = self.current.starts_with(&format!("{path}/"));
                let index = match self.dir_mut(&segs) {
                    Some(dir) => match dir.child_index(&name) {
                        Some(index) => {
                            dir.directories.remove(index);
                            index
                        }
                        None => return Err(RoomError::InvalidPath(path.to_string())),
                    },
                    None => return Err(RoomError::InvalidPath(path.to_string())),
                };
                if holds_current {
                    self.current = self.recover_after_directory(segs, index);
                } else {
                    self.prune(segs);
                }
                Ok(holds_current)
            }
        }
    }

    /// Drop the current scene's drawn components, and its content unless retained.
    pub fn clean(&mut self, retain_content: bool) -> Result<(), RoomError> {
        let current = self.current.clone();
        let scene = self
            .scene_mut(&current)
            .ok_or(RoomError::StaleSnapshot(current))?;
        scene.components_count = 0;
        if !retain_content {
            scene.content = None;
        }
        Ok(())
    }

    /// Adjust a scene's component count. Returns false if the scene is gone.
    pub fn add_components(&mut self, path: &str, count: u64) -> bool {
        match self.scene_mut(path) {
            Some(scene) => {
                scene.components_count = scene.components_count.saturating_add(count);
                true
            }
            None => false,
        }
    }

    pub fn remove_components(&mut self, path: &str, count: u64) -> bool {
        match self.scene_mut(path) {
            Some(scene) => {
                scene.components_count = scene.components_count.saturating_sub(count);
                true
            }
            None => false,
        }
    }

    // ─── Remote application ───────────────────────────────────

    /// Replace the whole tree with one written by another participant.
    ///
    /// If the current scene no longer exists, the missing node nearest the
    /// root is treated as deleted and the pointer recovers from there.
    /// Returns true when the pointer moved.
    pub fn replace_root(&mut self, mut root: Directory) -> bool {
        root.name.clear();
        let previous = std::mem::replace(&mut self.root, root);
        if self.root.scene_count() == 0 {
            log::debug!("Remote scene tree was empty, recreating /{INIT_SCENE}");
            self.root = Directory::default();
            self.current = self.create_init();
            return true;
        }
        if self.resolve_path_type(&self.current) == ScenePathType::Page {
            return false;
        }

        let Some(mut segs) = segments(&self.current) else {
            self.current = first_scene_path(&self.root, &[]).unwrap_or_else(|| self.create_init());
            return true;
        };
        let Some(name) = segs.pop() else {
            self.current = first_scene_path(&self.root, &[]).unwrap_or_else(|| self.create_init());
            return true;
        };

        let depth = (0..segs.len())
            .find(|&d| self.dir(&segs[..=d]).is_none())
            .unwrap_or(segs.len());

        self.current = if depth == segs.len() {
            // The directory survived; only the scene is gone.
            let old_index = Self::dir_in(&previous, &segs)
                .and_then(|dir| dir.scene_index(&name))
                .unwrap_or(0);
            let len = self.dir(&segs).map(|dir| dir.scenes.len()).unwrap_or(0);
            self.recover_after_scene(segs, old_index.min(len))
        } else {
            let parent = segs[..depth].to_vec();
            let missing = &segs[depth];
            let index = match (Self::dir_in(&previous, &parent), self.dir(&parent)) {
                (Some(old), Some(new)) => {
                    let old_pos = old.child_index(missing).unwrap_or(old.directories.len());
                    old.directories[..old_pos]
                        .iter()
                        .filter(|dir| new.child_index(&dir.name).is_some())
                        .count()
                }
                _ => 0,
            };
            self.recover_after_directory(parent, index)
        };
        log::debug!("Remote scene tree moved pointer to {}", self.current);
        true
    }

    /// Move the pointer on behalf of another participant.
    pub fn apply_remote_pointer(&mut self, path: &str) -> Result<(), RoomError> {
        if self.resolve_path_type(path) != ScenePathType::Page {
            return Err(RoomError::StaleSnapshot(path.to_string()));
        }
        self.current = path.to_string();
        Ok(())
    }

    // ─── Recovery ─────────────────────────────────────────────

    /// Pointer target after the current scene was removed from `dir` at `index`.
    fn recover_after_scene(&mut self, mut dir: Vec<String>, index: usize) -> String {
        if let Some(node) = self.dir(&dir) {
            if let Some(scene) = node.scenes.get(index) {
                return scene_path(&dir, &scene.name);
            }
            if index > 0 {
                if let Some(scene) = node.scenes.get(index - 1) {
                    return scene_path(&dir, &scene.name);
                }
            }
            if let Some(first) = node.directories.first() {
                let mut child = dir.clone();
                child.push(first.name.clone());
                if let Some(path) = first_scene_path(first, &child) {
                    return path;
                }
            }
        }

        let Some(name) = dir.pop() else {
            return self.create_init();
        };
        let index = match self.dir_mut(&dir) {
            Some(parent) => match parent.child_index(&name) {
                Some(index) => {
                    parent.directories.remove(index);
                    index
                }
                None => parent.directories.len(),
            },
            None => 0,
        };
        self.recover_after_directory(dir, index)
    }

    /// Pointer target after the directory at `index` inside `parent` was removed.
    fn recover_after_directory(&mut self, mut parent: Vec<String>, mut index: usize) -> String {
        loop {
            if let Some(node) = self.dir(&parent) {
                let next = node.directories.get(index).and_then(|dir| {
                    let mut path = parent.clone();
                    path.push(dir.name.clone());
                    first_scene_path(dir, &path)
                });
                if let Some(path) = next {
                    return path;
                }
                if let Some(scene) = node.scenes.first() {
                    return scene_path(&parent, &scene.name);
                }
                let previous = index
                    .checked_sub(1)
                    .and_then(|i| node.directories.get(i))
                    .and_then(|dir| {
                        let mut path = parent.clone();
                        path.push(dir.name.clone());
                        first_scene_path(dir, &path)
                    });
                if let Some(path) = previous {
                    return path;
                }
            }

            let Some(name) = parent.pop() else {
                self.root = Directory::default();
                return self.create_init();
            };
            index = match self.dir_mut(&parent) {
                Some(grandparent) => match grandparent.child_index(&name) {
                    Some(i) => {
                        grandparent.directories.remove(i);
                        i
                    }
                    None => grandparent.directories.len(),
                },
                None => 0,
            };
        }
    }

    fn create_init(&mut self) -> String {
        if self.root.scene_index(INIT_SCENE).is_none() {
            self.root.scenes.insert(0, Scene::new(INIT_SCENE));
        }
        format!("/{INIT_SCENE}")
    }

    // ─── Internals ────────────────────────────────────────────

    fn dir_in<'a>(root: &'a Directory, segs: &[String]) -> Option<&'a Directory> {
        segs.iter().try_fold(root, |dir, name| dir.child(name))
    }

    fn dir(&self, segs: &[String]) -> Option<&Directory> {
        Self::dir_in(&self.root, segs)
    }

    fn dir_mut(&mut self, segs: &[String]) -> Option<&mut Directory> {
        let mut dir = &mut self.root;
        for name in segs {
            dir = dir.directories.iter_mut().find(|d| &d.name == name)?;
        }
        Some(dir)
    }

    fn ensure_dir(&mut self, segs: &[String]) -> &mut Directory {
        let mut dir = &mut self.root;
        for name in segs {
            let index = match dir.child_index(name) {
                Some(index) => index,
                None => {
                    dir.directories.push(Directory::named(name.clone()));
                    dir.directories.len() - 1
                }
            };
            dir = &mut dir.directories[index];
        }
        dir
    }

    fn locate_scene(&self, path: &str) -> Option<(Vec<String>, usize)> {
        let mut segs = segments(path)?;
        let name = segs.pop()?;
        let index = self.dir(&segs)?.scene_index(&name)?;
        Some((segs, index))
    }

    fn scene_mut(&mut self, path: &str) -> Option<&mut Scene> {
        let (dir, index) = self.locate_scene(path)?;
        self.dir_mut(&dir)?.scenes.get_mut(index)
    }

    /// Remove empty non-root directories from `segs` upwards.
    fn prune(&mut self, mut segs: Vec<String>) {
        while !segs.is_empty() && self.dir(&segs).is_some_and(Directory::is_empty) {
            let Some(name) = segs.pop() else { break };
            if let Some(parent) = self.dir_mut(&segs) {
                parent.directories.retain(|dir| dir.name != name);
            }
        }
    }
}
