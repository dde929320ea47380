//! Undo/redo gate over local content operations.
//!
//! Disabled by default. While disabled, copy, paste, duplicate, undo and
//! redo do nothing. Enabling assumes every other client in the room uses
//! the same content serialization; nothing checks that at runtime.
//!
//! The gate only keeps the stacks. The session applies what an undo or
//! redo hands back to the scene tree.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentOperationKind {
    Draw,
    Paste,
    Duplicate,
    /// Removal of the selection.
    Delete,
}

impl ContentOperationKind {
    /// True when the operation added components to its scene.
    pub fn adds(self) -> bool {
        !matches!(self, ContentOperationKind::Delete)
    }
}

/// One undoable step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentOperation {
    pub id: Uuid,
    pub kind: ContentOperationKind,
    pub scene_path: String,
    pub components: u64,
}

impl ContentOperation {
    pub fn new(kind: ContentOperationKind, scene_path: impl Into<String>, components: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            scene_path: scene_path.into(),
            components,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoRedoCounts {
    pub undoable: u64,
    pub redoable: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SerializationGate {
    enabled: bool,
    undo: Vec<ContentOperation>,
    redo: Vec<ContentOperation>,
    /// Component count of the last copied selection.
    clipboard: Option<u64>,
}

impl SerializationGate {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn counts(&self) -> UndoRedoCounts {
        UndoRedoCounts {
            undoable: self.undo.len() as u64,
            redoable: self.redo.len() as u64,
        }
    }

    /// Toggle the gate. Disabling drops both stacks and the clipboard.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.undo.clear();
            self.redo.clear();
            self.clipboard = None;
        }
    }

    /// Push a local operation. Clears the redo stack. No-op while disabled.
    pub fn record(&mut self, operation: ContentOperation) {
        if !self.enabled {
            return;
        }
        self.undo.push(operation);
        self.redo.clear();
    }

    /// Pop the last operation for reverting.
    pub fn undo(&mut self) -> Option<ContentOperation> {
        if !self.enabled {
            return None;
        }
        let operation = self.undo.pop()?;
        self.redo.push(operation.clone());
        Some(operation)
    }

    /// Pop the last undone operation for reapplying.
    pub fn redo(&mut self) -> Option<ContentOperation> {
        if !self.enabled {
            return None;
        }
        let operation = self.redo.pop()?;
        self.undo.push(operation.clone());
        Some(operation)
    }

    /// Remember the selection. Returns false if nothing was copied.
    pub fn copy(&mut self, selection: u64) -> bool {
        if !self.enabled || selection == 0 {
            return false;
        }
        self.clipboard = Some(selection);
        true
    }

    /// Components to paste, if any.
    pub fn paste(&self) -> Option<u64> {
        if !self.enabled {
            return None;
        }
        self.clipboard
    }
}
