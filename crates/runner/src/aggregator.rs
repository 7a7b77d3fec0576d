//! Result aggregation and approvals
//!
//! The [`Aggregator`] owns the test map. Every mutation happens under one
//! lock and publishes a [`CreeveyUpdate`] while still holding it, so
//! subscribers see updates in the order they were applied.

use creevey_common::{
    CreeveyStatus, CreeveyUpdate, Error, ImageStore, Result, StatusCounts, Test, TestResult,
    TestStatus, TestUpdate, TestsById,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const UPDATE_CAPACITY: usize = 1024;

struct State {
    is_running: bool,
    tests: TestsById,
    revision: u64,
}

/// Test map copied under the state lock, written once the lock is released
struct Staged {
    revision: u64,
    tests: TestsById,
}

pub struct Aggregator {
    state: Mutex<State>,
    updates: broadcast::Sender<CreeveyUpdate>,
    images: ImageStore,
    data_path: Option<PathBuf>,
    // revision of the last data.json written
    written: Mutex<u64>,
}

impl Aggregator {
    pub fn new(tests: TestsById, images: ImageStore) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            state: Mutex::new(State {
                is_running: false,
                tests,
                revision: 0,
            }),
            updates,
            images,
            data_path: None,
            written: Mutex::new(0),
        }
    }

    /// Persist the test map to `path` after every run and approval
    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn snapshot(&self) -> CreeveyStatus {
        let state = self.state.lock();
        CreeveyStatus {
            is_running: state.is_running,
            tests_by_id: state.tests.clone(),
        }
    }

    /// Snapshot plus a receiver positioned right after it
    pub fn subscribe(&self) -> (CreeveyStatus, broadcast::Receiver<CreeveyUpdate>) {
        let state = self.state.lock();
        let receiver = self.updates.subscribe();
        let status = CreeveyStatus {
            is_running: state.is_running,
            tests_by_id: state.tests.clone(),
        };
        (status, receiver)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts::from_tests(self.state.lock().tests.values())
    }

    pub fn test(&self, id: &str) -> Option<Test> {
        self.state.lock().tests.get(id).cloned()
    }

    /// Runnable tests among `ids` (all tests when empty) as `(id, browser)`
    pub fn select(&self, ids: &[String]) -> Vec<(String, String)> {
        let state = self.state.lock();
        let runnable = |test: &Test| !test.skip.is_skipped();
        if ids.is_empty() {
            state
                .tests
                .values()
                .filter(|t| runnable(t))
                .map(|t| (t.id.clone(), t.browser().to_string()))
                .collect()
        } else {
            let mut seen = HashSet::new();
            ids.iter()
                .filter(|id| seen.insert(id.as_str()))
                .filter_map(|id| state.tests.get(id))
                .filter(|t| runnable(t))
                .map(|t| (t.id.clone(), t.browser().to_string()))
                .collect()
        }
    }

    /// Mark the run as started and the given tests as pending
    pub fn begin_run(&self, ids: &[String]) {
        let mut state = self.state.lock();
        state.is_running = true;
        let mut patches = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(test) = state.tests.get_mut(id) {
                test.status = TestStatus::Pending;
                let mut patch = TestUpdate::new(id.clone());
                patch.status = Some(TestStatus::Pending);
                patches.push(patch);
            }
        }
        info!("Run started with {} tests", patches.len());
        self.publish(CreeveyUpdate::tests(patches).with_running(true));
    }

    /// Mark a test as running and return the retry index its result will get
    pub fn begin_attempt(&self, id: &str) -> Option<u32> {
        let mut state = self.state.lock();
        let test = state.tests.get_mut(id)?;
        if test.skip.is_skipped() {
            warn!("Refusing to run skipped test {}", test.title());
            return None;
        }
        if test.status == TestStatus::Running {
            warn!("Test {} is already running", test.title());
            return None;
        }
        test.status = TestStatus::Running;
        let retry = test.results.len() as u32;

        let mut patch = TestUpdate::new(id);
        patch.status = Some(TestStatus::Running);
        self.publish(CreeveyUpdate::tests([patch]));
        Some(retry)
    }

    /// Append the outcome of an attempt
    pub fn apply_result(&self, id: &str, result: TestResult) -> Result<()> {
        let mut state = self.state.lock();
        let test = state
            .tests
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("test {}", id)))?;

        if result.is_success() {
            info!("PASSED: {}", test.title());
        } else {
            warn!(
                "FAILED: {} - {}",
                test.title(),
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        test.push_result(result);

        let mut patch = TestUpdate::new(id);
        patch.status = Some(test.status);
        patch.retries = Some(test.retries);
        patch.results = Some(test.results.clone());
        self.publish(CreeveyUpdate::tests([patch]));
        Ok(())
    }

    /// Approve one image of the latest attempt of a failed test
    pub fn approve(&self, id: &str, retry: u32, image: &str) -> Result<()> {
        let staged = self.approve_locked(id, retry, image)?;
        self.persist(staged);
        Ok(())
    }

    fn approve_locked(&self, id: &str, retry: u32, image: &str) -> Result<Option<Staged>> {
        let mut state = self.state.lock();
        let test = state
            .tests
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("test {}", id)))?;

        let Some(latest) = test.results.len().checked_sub(1) else {
            return Err(Error::ApprovalRejected {
                id: id.to_string(),
                reason: "test has no results".to_string(),
            });
        };
        let latest = latest as u32;
        if retry != latest {
            return Err(Error::StaleApproval {
                id: id.to_string(),
                requested: retry,
                latest,
            });
        }

        let result = &test.results[latest as usize];
        if result.is_success() {
            return Err(Error::ApprovalRejected {
                id: id.to_string(),
                reason: "latest attempt succeeded".to_string(),
            });
        }
        let has_image = result
            .images
            .as_ref()
            .map_or(false, |images| images.contains_key(image));
        if !has_image {
            return Err(Error::ApprovalRejected {
                id: id.to_string(),
                reason: format!("attempt {} has no image '{}'", retry, image),
            });
        }

        self.images.approve(&test.image_dir(), image, retry)?;
        test.approved.insert(image.to_string(), retry);
        info!("Approved {} '{}' at retry {}", test.title(), image, retry);

        let mut patch = TestUpdate::new(id);
        patch.approved = Some(BTreeMap::from([(image.to_string(), retry)]));
        self.publish(CreeveyUpdate::tests([patch]));
        Ok(self.stage(&mut state))
    }

    /// Approve every image of every failed latest attempt. Returns the number approved.
    pub fn approve_all(&self) -> Result<usize> {
        let candidates: Vec<(String, u32, String)> = {
            let state = self.state.lock();
            state
                .tests
                .values()
                .filter_map(|test| {
                    let retry = test.results.len().checked_sub(1)? as u32;
                    let result = test.latest_result()?;
                    if result.is_success() {
                        return None;
                    }
                    let images = result.images.as_ref()?;
                    Some(
                        images
                            .keys()
                            .map(|image| (test.id.clone(), retry, image.clone()))
                            .collect::<Vec<_>>(),
                    )
                })
                .flatten()
                .collect()
        };

        for (id, retry, image) in &candidates {
            self.approve(id, *retry, image)?;
        }
        Ok(candidates.len())
    }

    /// Mark the run as finished and persist the results
    pub fn finish_run(&self) {
        let mut state = self.state.lock();
        state.is_running = false;

        // a test can only be left running if its worker vanished without a report
        let mut patches = Vec::new();
        for test in state.tests.values_mut() {
            if test.status == TestStatus::Running {
                test.status = TestStatus::Pending;
                let mut patch = TestUpdate::new(test.id.clone());
                patch.status = Some(TestStatus::Pending);
                patches.push(patch);
            }
        }

        let counts = StatusCounts::from_tests(state.tests.values());
        info!(
            "Run finished: {} passed, {} failed, {} pending, {} skipped",
            counts.success, counts.failed, counts.pending, counts.skipped
        );
        let update = if patches.is_empty() {
            CreeveyUpdate::running(false)
        } else {
            CreeveyUpdate::tests(patches).with_running(false)
        };
        self.publish(update);
        let staged = self.stage(&mut state);
        drop(state);
        self.persist(staged);
    }

    fn publish(&self, update: CreeveyUpdate) {
        // no subscribers is fine
        let _ = self.updates.send(update);
    }

    fn stage(&self, state: &mut State) -> Option<Staged> {
        self.data_path.as_ref()?;
        state.revision += 1;
        Some(Staged {
            revision: state.revision,
            tests: state.tests.clone(),
        })
    }

    /// Write a staged map unless a newer one already reached disk
    fn persist(&self, staged: Option<Staged>) {
        let (Some(path), Some(staged)) = (&self.data_path, staged) else {
            return;
        };
        let mut written = self.written.lock();
        if *written >= staged.revision {
            debug!("Skipping stale save of revision {}", staged.revision);
            return;
        }
        match save_tests(path, &staged.tests) {
            Ok(()) => *written = staged.revision,
            Err(e) => warn!("Failed to save {}: {}", path.display(), e),
        }
    }
}

/// Write the test map as JSON
pub fn save_tests(path: &Path, tests: &TestsById) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(tests)?;
    std::fs::write(path, json)?;
    debug!("Saved {} tests to {}", tests.len(), path.display());
    Ok(())
}

/// Read a test map written by [`save_tests`]; a missing file is an empty history
pub fn load_tests(path: &Path) -> Result<TestsById> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TestsById::new()),
        Err(e) => Err(e.into()),
    }
}

/// Carry results and approvals of previous tests into a freshly compiled map.
///
/// Tests are matched by path, so renamed stories start without history.
pub fn carry_forward(tests: &mut TestsById, previous: TestsById) {
    let by_path: HashMap<Vec<String>, Test> = previous
        .into_values()
        .map(|test| (test.path.clone(), test))
        .collect();

    for test in tests.values_mut() {
        let Some(old) = by_path.get(&test.path) else {
            continue;
        };
        test.results = old.results.clone();
        test.retries = old.retries;
        test.approved = old.approved.clone();
        test.status = match old.status {
            _ if test.skip.is_skipped() => TestStatus::Pending,
            TestStatus::Running => TestStatus::Pending,
            status => status,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creevey_common::{ImageKind, Images, ResultStatus, Skip};
    use std::collections::BTreeMap;

    fn test(browser: &str, story: &str) -> Test {
        Test::new(
            vec![browser.to_string(), story.to_string(), "Button".to_string()],
            Skip::default(),
        )
    }

    fn failed_with_image(image: &str, retry: u32) -> TestResult {
        TestResult {
            status: ResultStatus::Failed,
            images: Some(BTreeMap::from([(
                image.to_string(),
                Images {
                    actual: ImageStore::file_name(image, ImageKind::Actual, retry),
                    expect: None,
                    diff: None,
                },
            )])),
            error: Some("differs".to_string()),
        }
    }

    fn aggregator(dir: &Path, tests: Vec<Test>) -> Aggregator {
        let tests = tests.into_iter().map(|t| (t.id.clone(), t)).collect();
        Aggregator::new(tests, ImageStore::new(dir.join("images"), dir.join("report")))
    }

    #[test]
    fn test_results_append_and_derive_retries() {
        let dir = tempfile::tempdir().unwrap();
        let t = test("chrome", "Primary");
        let id = t.id.clone();
        let agg = aggregator(dir.path(), vec![t]);

        assert_eq!(agg.begin_attempt(&id), Some(0));
        agg.apply_result(&id, TestResult::failed("boom")).unwrap();
        assert_eq!(agg.begin_attempt(&id), Some(1));
        agg.apply_result(&id, TestResult::success(BTreeMap::new())).unwrap();

        let test = agg.test(&id).unwrap();
        assert_eq!(test.results.len(), 2);
        assert_eq!(test.retries, 1);
        assert_eq!(test.status, TestStatus::Success);
    }

    #[test]
    fn test_updates_are_published_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let t = test("chrome", "Primary");
        let id = t.id.clone();
        let agg = aggregator(dir.path(), vec![t]);
        let (status, mut rx) = agg.subscribe();
        assert!(!status.is_running);

        agg.begin_run(&[id.clone()]);
        agg.begin_attempt(&id);
        agg.apply_result(&id, TestResult::failed("boom")).unwrap();
        agg.finish_run();

        let mut mirror = status;
        let mut seen = Vec::new();
        while let Ok(update) = rx.try_recv() {
            seen.push(update.clone());
            mirror.apply(update);
        }
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].is_running, Some(true));
        assert_eq!(seen[3].is_running, Some(false));
        assert_eq!(mirror, agg.snapshot());
    }

    #[test]
    fn test_skipped_tests_are_not_selected_or_started() {
        let dir = tempfile::tempdir().unwrap();
        let mut skipped = test("chrome", "Skipped");
        skipped.skip = Skip::from("broken in chrome");
        let id = skipped.id.clone();
        let agg = aggregator(dir.path(), vec![skipped, test("chrome", "Primary")]);

        assert_eq!(agg.select(&[]).len(), 1);
        assert!(agg.select(&[id.clone()]).is_empty());
        assert_eq!(agg.begin_attempt(&id), None);
        assert_eq!(agg.test(&id).unwrap().status, TestStatus::Pending);
    }

    #[test]
    fn test_approve_requires_latest_retry() {
        let dir = tempfile::tempdir().unwrap();
        let t = test("chrome", "Primary");
        let id = t.id.clone();
        let image_dir = t.image_dir();
        let agg = aggregator(dir.path(), vec![t]);

        for retry in 0..2 {
            std::fs::create_dir_all(agg.images().report_path(&image_dir, "")).unwrap();
            std::fs::write(
                agg.images().report_path(
                    &image_dir,
                    &ImageStore::file_name("chrome", ImageKind::Actual, retry),
                ),
                format!("png-{}", retry),
            )
            .unwrap();
            agg.begin_attempt(&id);
            agg.apply_result(&id, failed_with_image("chrome", retry)).unwrap();
        }

        let before = agg.snapshot();
        let err = agg.approve(&id, 0, "chrome").unwrap_err();
        assert!(matches!(err, Error::StaleApproval { requested: 0, latest: 1, .. }));
        assert_eq!(agg.snapshot(), before);

        agg.approve(&id, 1, "chrome").unwrap();
        assert_eq!(agg.test(&id).unwrap().approved.get("chrome"), Some(&1));
        let baseline = std::fs::read(agg.images().baseline_path(&image_dir, "chrome")).unwrap();
        assert_eq!(baseline, b"png-1");

        let err = agg.approve(&id, 1, "firefox").unwrap_err();
        assert!(matches!(err, Error::ApprovalRejected { .. }));
    }

    #[test]
    fn test_duplicate_ids_are_selected_once() {
        let dir = tempfile::tempdir().unwrap();
        let primary = test("chrome", "Primary");
        let secondary = test("chrome", "Secondary");
        let (a, b) = (primary.id.clone(), secondary.id.clone());
        let agg = aggregator(dir.path(), vec![primary, secondary]);

        let selected = agg.select(&[b.clone(), a.clone(), b.clone(), a.clone()]);
        let ids: Vec<&str> = selected.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec![b.as_str(), a.as_str()]);
    }

    #[test]
    fn test_running_test_cannot_start_again() {
        let dir = tempfile::tempdir().unwrap();
        let t = test("chrome", "Primary");
        let id = t.id.clone();
        let agg = aggregator(dir.path(), vec![t]);

        assert_eq!(agg.begin_attempt(&id), Some(0));
        assert_eq!(agg.begin_attempt(&id), None);
        agg.apply_result(&id, TestResult::failed("boom")).unwrap();
        assert_eq!(agg.begin_attempt(&id), Some(1));
    }

    #[test]
    fn test_approval_is_saved_to_data_file() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("report/data.json");
        let t = test("chrome", "Primary");
        let id = t.id.clone();
        let image_dir = t.image_dir();
        let agg = aggregator(dir.path(), vec![t]).with_data_path(&data);

        std::fs::create_dir_all(agg.images().report_path(&image_dir, "")).unwrap();
        std::fs::write(
            agg.images().report_path(
                &image_dir,
                &ImageStore::file_name("chrome", ImageKind::Actual, 0),
            ),
            b"png",
        )
        .unwrap();
        agg.begin_run(&[id.clone()]);
        agg.begin_attempt(&id);
        agg.apply_result(&id, failed_with_image("chrome", 0)).unwrap();
        agg.finish_run();
        assert!(load_tests(&data).unwrap()[&id].approved.is_empty());

        agg.approve(&id, 0, "chrome").unwrap();
        let saved = load_tests(&data).unwrap();
        assert_eq!(saved[&id].approved.get("chrome"), Some(&0));
        assert_eq!(saved, agg.snapshot().tests_by_id);

        // an older copy never overwrites a newer one
        let stale = Staged {
            revision: 1,
            tests: TestsById::new(),
        };
        agg.persist(Some(stale));
        assert_eq!(load_tests(&data).unwrap().len(), 1);
    }

    #[test]
    fn test_approve_rejects_successful_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let t = test("chrome", "Primary");
        let id = t.id.clone();
        let agg = aggregator(dir.path(), vec![t]);
        agg.apply_result(&id, TestResult::success(BTreeMap::new())).unwrap();
        assert!(matches!(
            agg.approve(&id, 0, "chrome"),
            Err(Error::ApprovalRejected { .. })
        ));
    }

    #[test]
    fn test_history_is_carried_forward_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("report/data.json");

        let mut old = test("chrome", "Primary");
        old.push_result(TestResult::failed("boom"));
        old.approved.insert("chrome".into(), 0);
        let mut running = test("chrome", "Secondary");
        running.status = TestStatus::Running;
        let previous: TestsById = [old, running].into_iter().map(|t| (t.id.clone(), t)).collect();
        save_tests(&data, &previous).unwrap();

        let mut fresh: TestsById = [test("chrome", "Primary"), test("chrome", "Secondary"), test("chrome", "New")]
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        carry_forward(&mut fresh, load_tests(&data).unwrap());

        let primary = &fresh[&test("chrome", "Primary").id];
        assert_eq!(primary.results.len(), 1);
        assert_eq!(primary.status, TestStatus::Failed);
        assert_eq!(primary.approved.get("chrome"), Some(&0));
        assert_eq!(fresh[&test("chrome", "Secondary").id].status, TestStatus::Pending);
        assert!(fresh[&test("chrome", "New").id].results.is_empty());
    }

    #[test]
    fn test_load_missing_history_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_tests(&dir.path().join("data.json")).unwrap().is_empty());
    }
}
