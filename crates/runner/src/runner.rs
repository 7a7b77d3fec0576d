//! Top-level runner tying compilation, results and worker pools together

use creevey_common::story::{load_stories, StoryEntry};
use creevey_common::{Config, ImageStore, Request, StatusCounts, TestStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::aggregator::{carry_forward, load_tests, Aggregator};
use crate::catalog::compile_all;
use crate::compare::ImageComparator;
use crate::driver::Connector;
use crate::error::{RunnerError, RunnerResult};
use crate::pool::{InProcessSpawner, Orchestrator, WorkerSpawner};
use crate::worker::WorkerContext;

/// A test whose latest attempt failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTest {
    pub id: String,
    pub title: String,
    pub retries: u32,
    pub error: Option<String>,
}

/// Outcome of a complete run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub duration_ms: u64,
    pub failures: Vec<FailedTest>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

pub struct TestRunner {
    config: Arc<Config>,
    aggregator: Arc<Aggregator>,
    orchestrator: Orchestrator,
    compile_errors: Vec<String>,
}

impl TestRunner {
    /// Compile every browser's catalog, restore saved history and prepare the pools
    pub fn new(
        config: Config,
        stories: &[StoryEntry],
        spawner: Arc<dyn WorkerSpawner>,
    ) -> RunnerResult<Self> {
        let config = Arc::new(config);
        let (mut tests, errors) = compile_all(&config, stories);
        for e in &errors {
            error!("{}", e);
        }

        let history = load_tests(&config.data_path())?;
        carry_forward(&mut tests, history);
        info!(
            "Compiled {} tests for {} browser(s)",
            tests.len(),
            config.browsers().len()
        );

        let images = ImageStore::new(&config.screen_dir, &config.report_dir);
        let aggregator =
            Arc::new(Aggregator::new(tests, images).with_data_path(config.data_path()));
        let orchestrator =
            Orchestrator::new(Arc::clone(&config), Arc::clone(&aggregator), spawner);

        Ok(Self {
            config,
            aggregator,
            orchestrator,
            compile_errors: errors.iter().map(ToString::to_string).collect(),
        })
    }

    /// Runner whose workers are tasks of this process
    pub fn in_process(
        config: Config,
        stories: Vec<StoryEntry>,
        connector: Arc<dyn Connector>,
        comparator: Arc<dyn ImageComparator>,
    ) -> RunnerResult<Self> {
        let stories = Arc::new(stories);
        let ctx = WorkerContext::new(Arc::new(config.clone()), connector, comparator);
        let spawner = Arc::new(InProcessSpawner::new(ctx, Arc::clone(&stories)));
        Self::new(config, &stories, spawner)
    }

    /// Load stories from `config.stories_path`
    pub fn load_stories(config: &Config) -> RunnerResult<Vec<StoryEntry>> {
        let stories = load_stories(&config.stories_path)?;
        info!(
            "Loaded {} stories from {}",
            stories.len(),
            config.stories_path.display()
        );
        Ok(stories)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn compile_errors(&self) -> &[String] {
        &self.compile_errors
    }

    pub fn is_running(&self) -> bool {
        self.orchestrator.is_running()
    }

    /// Apply a client request. `status` is answered by the transport.
    pub fn handle(&self, request: Request) -> RunnerResult<()> {
        match request {
            Request::Start(ids) => {
                if self.orchestrator.start(&ids) {
                    Ok(())
                } else {
                    Err(RunnerError::AlreadyRunning)
                }
            }
            Request::Stop => {
                self.orchestrator.stop();
                Ok(())
            }
            Request::Approve(payload) => {
                self.aggregator
                    .approve(&payload.id, payload.retry, &payload.image)?;
                Ok(())
            }
            Request::Status => Ok(()),
        }
    }

    pub fn stop(&self) {
        self.orchestrator.stop();
    }

    pub async fn wait(&self) {
        self.orchestrator.wait().await;
    }

    /// Run every runnable test and wait for the outcome
    pub async fn run_all(&self) -> RunnerResult<RunSummary> {
        let start = Instant::now();
        self.handle(Request::Start(Vec::new()))?;
        self.orchestrator.wait().await;

        let summary = self.summary(start.elapsed());
        info!(
            "Test Results: {} passed, {} failed, {} skipped ({} ms)",
            summary.passed, summary.failed, summary.skipped, summary.duration_ms
        );
        Ok(summary)
    }

    /// Summarise the current state
    pub fn summary(&self, duration: Duration) -> RunSummary {
        let status = self.aggregator.snapshot();
        let StatusCounts {
            success,
            failed,
            pending,
            running,
            skipped,
        } = status.counts();

        let failures = status
            .tests_by_id
            .values()
            .filter(|t| t.status == TestStatus::Failed && !t.skip.is_skipped())
            .map(|t| FailedTest {
                id: t.id.clone(),
                title: t.title(),
                retries: t.retries,
                error: t.latest_result().and_then(|r| r.error.clone()),
            })
            .collect();

        RunSummary {
            total: status.tests_by_id.len(),
            passed: success,
            failed,
            skipped,
            pending: pending + running,
            duration_ms: duration.as_millis() as u64,
            failures,
        }
    }

    /// Approve every image of every failed latest attempt
    pub fn approve_all(&self) -> RunnerResult<usize> {
        if self.is_running() {
            warn!("Approving while a run is in progress");
        }
        let approved = self.aggregator.approve_all()?;
        info!("Approved {} images", approved);
        Ok(approved)
    }

    /// Write a run summary next to the report images
    pub fn write_results(&self, summary: &RunSummary) -> RunnerResult<PathBuf> {
        std::fs::create_dir_all(&self.config.report_dir)?;

        let path = self.config.report_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}
