//! Core types for Creevey

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Tests keyed by id
pub type TestsById = BTreeMap<String, Test>;

/// Compute the stable id of a test from its path.
///
/// The id is the SHA-1 of the path components joined by `/`, so it only stays
/// stable while every component of the path keeps the same text.
pub fn test_id(path: &[String]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(path.join("/").as_bytes());
    hex::encode(hasher.finalize())
}

/// Skip marker: `false`, `true` (no stated reason) or a reason string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Skip {
    Flag(bool),
    Reason(String),
}

impl Default for Skip {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl Skip {
    pub fn is_skipped(&self) -> bool {
        match self {
            Skip::Flag(flag) => *flag,
            Skip::Reason(reason) => !reason.is_empty(),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Skip::Reason(reason) if !reason.is_empty() => Some(reason),
            _ => None,
        }
    }
}

impl From<bool> for Skip {
    fn from(flag: bool) -> Self {
        Skip::Flag(flag)
    }
}

impl From<&str> for Skip {
    fn from(reason: &str) -> Self {
        Skip::Reason(reason.to_string())
    }
}

impl From<String> for Skip {
    fn from(reason: String) -> Self {
        Skip::Reason(reason)
    }
}

/// Derived test status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    #[default]
    Pending,
    Running,
    Failed,
    Success,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Pending => write!(f, "pending"),
            TestStatus::Running => write!(f, "running"),
            TestStatus::Failed => write!(f, "failed"),
            TestStatus::Success => write!(f, "success"),
        }
    }
}

/// Outcome of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Failed,
    Success,
}

impl From<ResultStatus> for TestStatus {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Failed => TestStatus::Failed,
            ResultStatus::Success => TestStatus::Success,
        }
    }
}

/// Image files produced by one attempt, relative to the test's report directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Images {
    pub actual: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

/// One attempt's outcome. Created once per attempt and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<BTreeMap<String, Images>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestResult {
    pub fn success(images: BTreeMap<String, Images>) -> Self {
        Self {
            status: ResultStatus::Success,
            images: Some(images),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            images: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// A leaf of the test tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Test {
    pub id: String,
    /// Innermost first: `[browser, test?, story, kind]`
    pub path: Vec<String>,
    #[serde(default)]
    pub skip: Skip,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub status: TestStatus,
    #[serde(default)]
    pub results: Vec<TestResult>,
    #[serde(default)]
    pub approved: BTreeMap<String, u32>,
}

impl Test {
    pub fn new(path: Vec<String>, skip: Skip) -> Self {
        Self {
            id: test_id(&path),
            path,
            skip,
            retries: 0,
            status: TestStatus::Pending,
            results: Vec::new(),
            approved: BTreeMap::new(),
        }
    }

    pub fn browser(&self) -> &str {
        self.path.first().map(String::as_str).unwrap_or_default()
    }

    /// Human readable title, outermost first
    pub fn title(&self) -> String {
        self.path.iter().rev().cloned().collect::<Vec<_>>().join(" / ")
    }

    pub fn latest_result(&self) -> Option<&TestResult> {
        self.results.last()
    }

    /// Directory of this test's images, relative to the screen or report root
    pub fn image_dir(&self) -> PathBuf {
        self.path.iter().rev().collect()
    }

    /// Append an attempt and re-derive `retries` and `status`
    pub fn push_result(&mut self, result: TestResult) {
        self.status = result.status.into();
        self.results.push(result);
        self.retries = (self.results.len() - 1) as u32;
    }
}

/// Full state snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreeveyStatus {
    pub is_running: bool,
    #[serde(default)]
    pub tests_by_id: TestsById,
}

/// Partial test, used inside updates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<Skip>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TestStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<TestResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<BTreeMap<String, u32>>,
}

impl TestUpdate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Full description of a test, used when a test appears for the first time
    pub fn full(test: &Test) -> Self {
        Self {
            id: test.id.clone(),
            path: Some(test.path.clone()),
            skip: Some(test.skip.clone()),
            retries: Some(test.retries),
            status: Some(test.status),
            results: Some(test.results.clone()),
            approved: Some(test.approved.clone()),
        }
    }
}

/// Partial diff of [`CreeveyStatus`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreeveyUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_by_id: Option<BTreeMap<String, TestUpdate>>,
}

impl CreeveyUpdate {
    pub fn running(is_running: bool) -> Self {
        Self {
            is_running: Some(is_running),
            tests_by_id: None,
        }
    }

    pub fn tests(updates: impl IntoIterator<Item = TestUpdate>) -> Self {
        Self {
            is_running: None,
            tests_by_id: Some(updates.into_iter().map(|u| (u.id.clone(), u)).collect()),
        }
    }

    pub fn with_running(mut self, is_running: bool) -> Self {
        self.is_running = Some(is_running);
        self
    }
}

impl CreeveyStatus {
    /// Merge an update: top-level fields overwrite, tests merge by id,
    /// scalar test fields overwrite, `results` replaces and `approved` merges by image.
    pub fn apply(&mut self, update: CreeveyUpdate) {
        if let Some(is_running) = update.is_running {
            self.is_running = is_running;
        }
        let Some(tests) = update.tests_by_id else {
            return;
        };
        for (id, patch) in tests {
            match self.tests_by_id.get_mut(&id) {
                Some(test) => test.merge(patch),
                None => {
                    if let Some(path) = patch.path.clone() {
                        let mut test = Test {
                            id: id.clone(),
                            path,
                            skip: Skip::default(),
                            retries: 0,
                            status: TestStatus::Pending,
                            results: Vec::new(),
                            approved: BTreeMap::new(),
                        };
                        test.merge(patch);
                        self.tests_by_id.insert(id, test);
                    }
                }
            }
        }
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts::from_tests(self.tests_by_id.values())
    }
}

impl Test {
    fn merge(&mut self, patch: TestUpdate) {
        if let Some(path) = patch.path {
            self.path = path;
        }
        if let Some(skip) = patch.skip {
            self.skip = skip;
        }
        if let Some(retries) = patch.retries {
            self.retries = retries;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(results) = patch.results {
            self.results = results;
        }
        if let Some(approved) = patch.approved {
            self.approved.extend(approved);
        }
    }
}

/// Per-status counters for summaries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: usize,
    pub failed: usize,
    pub pending: usize,
    pub running: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn from_tests<'a>(tests: impl IntoIterator<Item = &'a Test>) -> Self {
        let mut counts = Self::default();
        for test in tests {
            if test.skip.is_skipped() {
                counts.skipped += 1;
                continue;
            }
            match test.status {
                TestStatus::Success => counts.success += 1,
                TestStatus::Failed => counts.failed += 1,
                TestStatus::Pending => counts.pending += 1,
                TestStatus::Running => counts.running += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn path(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_id_is_stable_sha1_of_joined_path() {
        let id = test_id(&path(&["chrome", "Primary", "Button"]));
        assert_eq!(id.len(), 40);
        assert_eq!(id, test_id(&path(&["chrome", "Primary", "Button"])));
        assert_ne!(id, test_id(&path(&["firefox", "Primary", "Button"])));
    }

    #[test]
    fn test_ids_do_not_collide_on_synthetic_paths() {
        let mut ids = HashSet::new();
        for browser in ["chrome", "firefox", "ie11"] {
            for kind in 0..40 {
                for story in 0..50 {
                    let p = vec![browser.to_string(), format!("story-{story}"), format!("Kind{kind}")];
                    assert!(ids.insert(test_id(&p)));
                }
            }
        }
        assert_eq!(ids.len(), 3 * 40 * 50);
    }

    #[test]
    fn test_skip_serialization_shapes() {
        assert_eq!(serde_json::to_string(&Skip::Flag(false)).unwrap(), "false");
        assert_eq!(serde_json::to_string(&Skip::from("flaky")).unwrap(), "\"flaky\"");
        let skip: Skip = serde_json::from_str("true").unwrap();
        assert!(skip.is_skipped());
        assert!(!Skip::from("").is_skipped());
    }

    #[test]
    fn test_push_result_tracks_retries() {
        let mut test = Test::new(path(&["chrome", "Primary", "Button"]), Skip::default());
        test.push_result(TestResult::failed("boom"));
        test.push_result(TestResult::failed("boom"));
        test.push_result(TestResult::success(BTreeMap::new()));
        assert_eq!(test.results.len(), 3);
        assert_eq!(test.retries, 2);
        assert_eq!(test.status, TestStatus::Success);
    }

    #[test]
    fn test_image_dir_is_outermost_first() {
        let test = Test::new(path(&["chrome", "click", "Primary", "Button"]), Skip::default());
        assert_eq!(test.image_dir(), PathBuf::from("Button/Primary/click/chrome"));
    }

    #[test]
    fn test_apply_update_merges_by_key() {
        let mut test = Test::new(path(&["chrome", "Primary", "Button"]), Skip::default());
        test.approved.insert("chrome".to_string(), 0);
        let id = test.id.clone();
        let mut status = CreeveyStatus {
            is_running: false,
            tests_by_id: [(id.clone(), test)].into_iter().collect(),
        };

        let mut patch = TestUpdate::new(&id);
        patch.status = Some(TestStatus::Running);
        patch.approved = Some([("hover".to_string(), 1)].into_iter().collect());
        status.apply(CreeveyUpdate::tests([patch]).with_running(true));

        let test = &status.tests_by_id[&id];
        assert!(status.is_running);
        assert_eq!(test.status, TestStatus::Running);
        assert_eq!(test.approved.len(), 2);
        assert_eq!(test.path, path(&["chrome", "Primary", "Button"]));
    }

    #[test]
    fn test_apply_update_inserts_new_tests_with_path() {
        let test = Test::new(path(&["chrome", "Primary", "Button"]), Skip::from("broken"));
        let mut status = CreeveyStatus::default();
        status.apply(CreeveyUpdate::tests([TestUpdate::full(&test)]));
        status.apply(CreeveyUpdate::tests([TestUpdate::new("unknown")]));
        assert_eq!(status.tests_by_id.len(), 1);
        assert_eq!(status.tests_by_id[&test.id], test);
        assert_eq!(status.counts().skipped, 1);
    }
}
