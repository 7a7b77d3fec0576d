//! Test worker
//!
//! A worker owns at most one browser session and runs one attempt at a time.
//! It speaks the same message protocol whether it runs as a task inside the
//! orchestrator process or as a child process over stdio.

use creevey_common::protocol::{ReadyPayload, RunPayload};
use creevey_common::{
    BrowserSettings, Config, ImageKind, ImageStore, Images, ResultStatus, TestResult,
    WorkerCommand, WorkerMessage,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CompiledTest};
use crate::compare::ImageComparator;
use crate::driver::Connector;
use crate::error::{RunnerError, RunnerResult};
use crate::session::BrowserSession;
use crate::steps::StepRunner;

/// Shared services a worker runs with
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub connector: Arc<dyn Connector>,
    pub comparator: Arc<dyn ImageComparator>,
    pub images: ImageStore,
}

impl WorkerContext {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn Connector>,
        comparator: Arc<dyn ImageComparator>,
    ) -> Self {
        let images = ImageStore::new(&config.screen_dir, &config.report_dir);
        Self {
            config,
            connector,
            comparator,
            images,
        }
    }
}

pub struct Worker {
    browser: BrowserSettings,
    catalog: Catalog,
    ctx: WorkerContext,
    session: Option<BrowserSession>,
}

impl Worker {
    pub fn new(browser: BrowserSettings, catalog: Catalog, ctx: WorkerContext) -> Self {
        Self {
            browser,
            catalog,
            ctx,
            session: None,
        }
    }

    /// Report readiness, then serve commands until shutdown or until the
    /// command channel closes
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<WorkerCommand>,
        messages: mpsc::Sender<WorkerMessage>,
    ) {
        let ready = WorkerMessage::Ready(ReadyPayload {
            tests: self.catalog.tests.keys().cloned().collect(),
        });
        if messages.send(ready).await.is_err() {
            return;
        }
        debug!("{} worker ready with {} tests", self.browser.name, self.catalog.tests.len());

        while let Some(command) = commands.recv().await {
            match command {
                WorkerCommand::Run(RunPayload { id, retry }) => {
                    let result = self.execute(&id, retry).await;
                    if messages.send(WorkerMessage::Test(result)).await.is_err() {
                        break;
                    }
                }
                WorkerCommand::Shutdown => break,
            }
        }

        self.release().await;
        debug!("{} worker stopped", self.browser.name);
    }

    /// Run one attempt; every failure becomes a failed result
    async fn execute(&mut self, id: &str, retry: u32) -> TestResult {
        let Some(compiled) = self.catalog.tests.get(id).cloned() else {
            return TestResult::failed(format!("unknown test {}", id));
        };
        info!("Running {} (retry {})", compiled.test.title(), retry);

        match self.attempt(&compiled, retry).await {
            Ok(result) => result,
            Err(e) => {
                if e.is_session_fatal() {
                    warn!("Dropping {} session: {}", self.browser.name, e);
                    self.release().await;
                }
                TestResult::failed(e.to_string())
            }
        }
    }

    async fn attempt(&mut self, compiled: &CompiledTest, retry: u32) -> RunnerResult<TestResult> {
        let images = self.ctx.images.clone();
        let comparator = Arc::clone(&self.ctx.comparator);
        let default_image = self.browser.name.clone();
        let capture_element = compiled.capture_element.as_deref();

        let session = self.session().await?;
        session.select_story(&compiled.story).await?;
        let shots = match &compiled.steps {
            Some(steps) => {
                StepRunner::new(session, &default_image, capture_element)
                    .run(steps)
                    .await?
            }
            None => vec![(default_image.clone(), session.capture(capture_element).await?)],
        };

        compare_shots(&images, comparator, &compiled.test.image_dir(), retry, shots).await
    }

    async fn session(&mut self) -> RunnerResult<&BrowserSession> {
        if self.session.is_none() {
            let session = BrowserSession::start(
                self.ctx.connector.as_ref(),
                &self.browser,
                &self.ctx.config.timeouts,
            )
            .await?;
            self.session = Some(session);
        }
        self.session
            .as_ref()
            .ok_or_else(|| RunnerError::Session("session unavailable".to_string()))
    }

    async fn release(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

/// Save actual images, compare them with baselines and build the result
async fn compare_shots(
    images: &ImageStore,
    comparator: Arc<dyn ImageComparator>,
    image_dir: &Path,
    retry: u32,
    shots: Vec<(String, Vec<u8>)>,
) -> RunnerResult<TestResult> {
    let mut entries = BTreeMap::new();
    let mut failures = Vec::new();

    for (name, actual) in shots {
        let actual_file = images
            .write_report(image_dir, &name, ImageKind::Actual, retry, &actual)
            .await?;
        let mut entry = Images {
            actual: actual_file,
            expect: None,
            diff: None,
        };

        match images.read_baseline(image_dir, &name).await? {
            None => failures.push(format!("expected image '{}' does not exist", name)),
            Some(expect) => {
                let comparator = Arc::clone(&comparator);
                let (comparison, expect) = tokio::task::spawn_blocking(move || {
                    comparator.compare(&actual, &expect).map(|c| (c, expect))
                })
                .await
                .map_err(|e| RunnerError::Worker(format!("comparison task failed: {}", e)))??;

                if !comparison.matches {
                    entry.expect = Some(
                        images
                            .write_report(image_dir, &name, ImageKind::Expect, retry, &expect)
                            .await?,
                    );
                    if let Some(diff) = comparison.diff {
                        entry.diff = Some(
                            images
                                .write_report(image_dir, &name, ImageKind::Diff, retry, &diff)
                                .await?,
                        );
                    }
                    failures.push(format!("image '{}' differs from the baseline", name));
                }
            }
        }
        entries.insert(name, entry);
    }

    Ok(if failures.is_empty() {
        TestResult::success(entries)
    } else {
        TestResult {
            status: ResultStatus::Failed,
            images: Some(entries),
            error: Some(failures.join("; ")),
        }
    })
}

/// Serve a worker over stdin/stdout as JSON lines. Logging must go to stderr.
pub async fn serve_stdio(worker: Worker) -> RunnerResult<()> {
    let (command_tx, command_rx) = mpsc::channel(8);
    let (message_tx, mut message_rx) = mpsc::channel::<WorkerMessage>(8);

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match serde_json::from_str::<WorkerCommand>(&line) {
                    Ok(command) => {
                        if command_tx.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed command: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read command: {}", e);
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = message_rx.recv().await {
            write_message(&mut stdout, &message).await?;
        }
        Ok::<_, RunnerError>(())
    });

    worker.run(command_rx, message_tx).await;
    reader.abort();
    writer
        .await
        .map_err(|e| RunnerError::Worker(format!("stdout writer failed: {}", e)))?
}

/// Tell the orchestrator on stdout that this worker cannot serve, e.g.
/// because its setup failed before a [`Worker`] existed
pub async fn report_stdio_error(message: &str) -> RunnerResult<()> {
    let mut stdout = tokio::io::stdout();
    write_message(&mut stdout, &WorkerMessage::Error(message.to_string())).await
}

async fn write_message<W>(out: &mut W, message: &WorkerMessage) -> RunnerResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::PixelComparator;

    #[tokio::test]
    async fn test_missing_baseline_fails_with_actual_saved() {
        let dir = tempfile::tempdir().unwrap();
        let images = ImageStore::new(dir.path().join("images"), dir.path().join("report"));
        let image_dir = Path::new("Button/Primary/chrome");

        let result = compare_shots(
            &images,
            Arc::new(PixelComparator::exact()),
            image_dir,
            0,
            vec![("chrome".to_string(), b"not-a-png".to_vec())],
        )
        .await
        .unwrap();

        assert!(!result.is_success());
        let entry = &result.images.as_ref().unwrap()["chrome"];
        assert_eq!(entry.actual, "chrome-actual-0.png");
        assert!(entry.expect.is_none());
        assert!(images.report_path(image_dir, &entry.actual).exists());
    }

    #[tokio::test]
    async fn test_matching_baseline_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let images = ImageStore::new(dir.path().join("images"), dir.path().join("report"));
        let image_dir = Path::new("Button/Primary/chrome");
        let baseline = images.baseline_path(image_dir, "chrome");
        std::fs::create_dir_all(baseline.parent().unwrap()).unwrap();
        std::fs::write(&baseline, b"same-bytes").unwrap();

        let result = compare_shots(
            &images,
            Arc::new(PixelComparator::exact()),
            image_dir,
            2,
            vec![("chrome".to_string(), b"same-bytes".to_vec())],
        )
        .await
        .unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_error_report_is_one_json_line() {
        let mut out = Vec::new();
        write_message(&mut out, &WorkerMessage::Error("stories.json not found".into()))
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.lines().count(), 1);
        let message: WorkerMessage = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(message, WorkerMessage::Error("stories.json not found".into()));
    }
}
