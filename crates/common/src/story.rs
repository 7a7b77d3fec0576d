//! Story metadata as exported by the storybook

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::skip::SkipOptions;

/// A renderable UI variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryDescriptor {
    pub id: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub parameters: StoryParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryParameters {
    #[serde(default)]
    pub creevey: Option<CreeveyParameters>,
}

/// Per-story capture parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreeveyParameters {
    /// CSS selector of the element to capture instead of the viewport
    #[serde(default)]
    pub capture_element: Option<String>,

    #[serde(default)]
    pub skip: Option<SkipOptions>,

    /// Ordered map of test name to step list. Kept raw so that a malformed
    /// definition only fails its own story at compile time.
    #[serde(default)]
    pub tests: Option<serde_json::Value>,
}

impl StoryDescriptor {
    pub fn creevey(&self) -> Option<&CreeveyParameters> {
        self.parameters.creevey.as_ref()
    }

    pub fn capture_element(&self) -> Option<&str> {
        self.creevey().and_then(|c| c.capture_element.as_deref())
    }
}

/// One entry of a story file: either a valid story or the reason it could not be read
pub type StoryEntry = std::result::Result<StoryDescriptor, RawStoryError>;

/// A story entry that could not be deserialised
#[derive(Debug, Clone)]
pub struct RawStoryError {
    /// Story id when it could be recovered from the raw entry
    pub id: Option<String>,
    pub reason: String,
}

/// Load stories from a JSON or YAML file holding a list of story objects.
///
/// Entries are decoded one by one so a broken entry does not hide the rest.
pub fn load_stories(path: &Path) -> Result<Vec<StoryEntry>> {
    let content = std::fs::read_to_string(path)?;
    let is_yaml = path
        .extension()
        .map(|ext| ext == "yaml" || ext == "yml")
        .unwrap_or(false);

    let raw: Vec<serde_json::Value> = if is_yaml {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };

    Ok(raw.into_iter().map(decode_entry).collect())
}

/// Decode stories that are already in memory
pub fn parse_stories(json: &str) -> Result<Vec<StoryEntry>> {
    let raw: Vec<serde_json::Value> = serde_json::from_str(json).map_err(Error::from)?;
    Ok(raw.into_iter().map(decode_entry).collect())
}

fn decode_entry(value: serde_json::Value) -> StoryEntry {
    let id = value.get("id").and_then(|v| v.as_str()).map(String::from);
    serde_json::from_value(value).map_err(|e| RawStoryError {
        id,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stories_keeps_broken_entries_separate() {
        let stories = parse_stories(
            r##"[
                {"id": "button--primary", "kind": "Button", "name": "Primary",
                 "parameters": {"creevey": {"captureElement": "#root", "skip": "later"}}},
                {"id": "button--broken", "kind": 42},
                {"id": "input--plain", "kind": "Input", "name": "Plain"}
            ]"##,
        )
        .unwrap();

        assert_eq!(stories.len(), 3);
        let first = stories[0].as_ref().unwrap();
        assert_eq!(first.capture_element(), Some("#root"));
        let broken = stories[1].as_ref().unwrap_err();
        assert_eq!(broken.id.as_deref(), Some("button--broken"));
        assert!(stories[2].as_ref().unwrap().creevey().is_none());
    }

    #[test]
    fn test_load_stories_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stories.yaml");
        std::fs::write(
            &path,
            "- id: button--primary\n  kind: Button\n  name: Primary\n",
        )
        .unwrap();
        let stories = load_stories(&path).unwrap();
        assert_eq!(stories[0].as_ref().unwrap().kind, "Button");
    }
}
