//! Scene model and path addressing.
//!
//! Paths are slash-delimited and absolute: `/` is the root directory,
//! `/a/b` names either a scene `b` or a directory `b` inside `/a`.
//! Matching is exact. No trailing slashes, no `.` or `..`, no empty
//! segments.

mod tree;

pub use tree::{Directory, SceneTree, SceneTreeSnapshot, INIT_SCENE};

use serde::{Deserialize, Serialize};

/// Background a scene may carry under its drawn strokes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PageContent {
    Image { src: String, width: f64, height: f64 },
    SlideDeck { src: String, width: f64, height: f64 },
}

/// A drawable page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    /// Unique within its directory. Left empty, a name is generated on insert.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<PageContent>,
    /// Number of drawn components on the page.
    #[serde(default)]
    pub components_count: u64,
}

impl Scene {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: None,
            components_count: 0,
        }
    }

    /// Scene whose name is generated when it is inserted.
    pub fn unnamed() -> Self {
        Self::default()
    }

    pub fn with_content(mut self, content: PageContent) -> Self {
        self.content = Some(content);
        self
    }
}

/// What a path currently resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScenePathType {
    #[serde(rename = "none")]
    Empty,
    #[serde(rename = "page")]
    Page,
    #[serde(rename = "dir")]
    Dir,
}

/// Split an absolute path into its segments. `/` yields no segments.
pub(crate) fn segments(path: &str) -> Option<Vec<String>> {
    let rest = path.strip_prefix('/')?;
    if rest.is_empty() {
        return Some(Vec::new());
    }
    rest.split('/')
        .map(|segment| (!segment.is_empty()).then(|| segment.to_string()))
        .collect()
}

pub(crate) fn dir_path(segments: &[String]) -> String {
    format!("/{}", segments.join("/"))
}

pub(crate) fn scene_path(dir: &[String], name: &str) -> String {
    if dir.is_empty() {
        format!("/{name}")
    } else {
        format!("/{}/{name}", dir.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_root() {
        assert_eq!(segments("/"), Some(vec![]));
    }

    #[test]
    fn test_segments_nested() {
        assert_eq!(
            segments("/a/b"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_segments_rejects_malformed() {
        assert_eq!(segments(""), None);
        assert_eq!(segments("a/b"), None);
        assert_eq!(segments("/a/"), None);
        assert_eq!(segments("//a"), None);
    }

    #[test]
    fn test_path_joining() {
        let dir = vec!["a".to_string(), "b".to_string()];
        assert_eq!(scene_path(&dir, "p"), "/a/b/p");
        assert_eq!(scene_path(&[], "p"), "/p");
        assert_eq!(dir_path(&dir), "/a/b");
        assert_eq!(dir_path(&[]), "/");
    }

    #[test]
    fn test_path_type_serde_names() {
        assert_eq!(serde_json::to_string(&ScenePathType::Empty).unwrap(), "\"none\"");
        assert_eq!(serde_json::to_string(&ScenePathType::Dir).unwrap(), "\"dir\"");
    }
}
