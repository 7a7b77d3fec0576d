//! Worker pools and run orchestration
//!
//! Each enabled browser gets a pool of `limit` worker slots. A slot moves
//! through these states:
//!
//! ```text
//!   Starting ──ready──▶ Idle ──run──▶ Busy ──test──▶ Idle
//!      │                  │             │
//!      └──── exit ────────┴──── exit ───┴──▶ respawn or Closed
//! ```
//!
//! Any idle slot takes the next queued test. Failed tests go back to the end
//! of the queue until they used up `max_retries`. Stopping only prevents new
//! dispatches; attempts in flight are reported before the workers shut down.

use async_trait::async_trait;
use creevey_common::protocol::RunPayload;
use creevey_common::story::StoryEntry;
use creevey_common::{BrowserSettings, Config, TestResult, WorkerCommand, WorkerMessage};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::catalog::compile;
use crate::error::{RunnerError, RunnerResult};
use crate::worker::{Worker, WorkerContext};

/// Consecutive failed worker starts after which a slot is abandoned
pub const MAX_STARTUP_FAILURES: u32 = 3;

const CHANNEL_CAPACITY: usize = 16;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Both ends of a worker's message protocol, seen from the orchestrator
pub struct WorkerChannel {
    pub commands: mpsc::Sender<WorkerCommand>,
    pub messages: mpsc::Receiver<WorkerMessage>,
}

/// Starts isolated workers for a browser
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, browser: &BrowserSettings) -> RunnerResult<WorkerChannel>;
}

/// Runs workers as tasks of the current process
pub struct InProcessSpawner {
    ctx: WorkerContext,
    stories: Arc<Vec<StoryEntry>>,
}

impl InProcessSpawner {
    pub fn new(ctx: WorkerContext, stories: Arc<Vec<StoryEntry>>) -> Self {
        Self { ctx, stories }
    }
}

#[async_trait]
impl WorkerSpawner for InProcessSpawner {
    async fn spawn(&self, browser: &BrowserSettings) -> RunnerResult<WorkerChannel> {
        let catalog = compile(&browser.name, &self.stories);
        let worker = Worker::new(browser.clone(), catalog, self.ctx.clone());

        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (message_tx, message_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(worker.run(command_rx, message_tx));

        Ok(WorkerChannel {
            commands: command_tx,
            messages: message_rx,
        })
    }
}

/// Runs each worker as `<program> worker --browser <name> --config <path>`,
/// exchanging JSON lines over its stdin and stdout
pub struct ProcessSpawner {
    program: PathBuf,
    config_path: PathBuf,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path: config_path.into(),
        }
    }

    /// Spawn workers from the running executable
    pub fn current_exe(config_path: impl Into<PathBuf>) -> RunnerResult<Self> {
        Ok(Self::new(std::env::current_exe()?, config_path))
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, browser: &BrowserSettings) -> RunnerResult<WorkerChannel> {
        let mut child = Command::new(&self.program)
            .arg("worker")
            .arg("--browser")
            .arg(&browser.name)
            .arg("--config")
            .arg(&self.config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RunnerError::Worker(format!("can't start {} worker: {}", browser.name, e))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::Worker("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Worker("worker stdout unavailable".to_string()))?;

        let (command_tx, mut command_rx) = mpsc::channel::<WorkerCommand>(CHANNEL_CAPACITY);
        let (message_tx, message_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let mut line = match serde_json::to_string(&command) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to encode worker command: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
            // dropping stdin closes the pipe; the worker exits on EOF
        });

        let name = browser.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<WorkerMessage>(&line) {
                    Ok(message) => {
                        if message_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Unreadable message from {} worker: {}", name, e),
                }
            }
            drop(message_tx);
            match child.wait().await {
                Ok(status) => debug!("{} worker exited with {}", name, status),
                Err(e) => warn!("Failed to reap {} worker: {}", name, e),
            }
        });

        Ok(WorkerChannel {
            commands: command_tx,
            messages: message_rx,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Job {
    id: String,
    /// Attempts already made in this run
    attempt: u32,
}

#[derive(Debug)]
enum SlotState {
    Starting,
    Idle,
    Busy(Job),
    Closed,
}

struct Slot {
    generation: u64,
    state: SlotState,
    commands: Option<mpsc::Sender<WorkerCommand>>,
    startup_failures: u32,
}

impl Slot {
    fn new() -> Self {
        Self {
            generation: 0,
            state: SlotState::Closed,
            commands: None,
            startup_failures: 0,
        }
    }

    fn is_busy(&self) -> bool {
        matches!(self.state, SlotState::Busy(_))
    }
}

/// A message from the worker currently in `slot`; `None` when it went away
struct Event {
    slot: usize,
    generation: u64,
    message: Option<WorkerMessage>,
}

struct BrowserPool {
    settings: BrowserSettings,
    spawner: Arc<dyn WorkerSpawner>,
    aggregator: Arc<Aggregator>,
    cancel: CancellationToken,
    max_retries: u32,
}

impl BrowserPool {
    async fn run(self, mut queue: VecDeque<Job>) {
        if queue.is_empty() {
            return;
        }
        let size = self.settings.limit.clamp(1, queue.len());
        info!(
            "Starting {} {} worker(s) for {} tests",
            size,
            self.settings.name,
            queue.len()
        );

        let (events_tx, mut events_rx) = mpsc::channel::<Event>(CHANNEL_CAPACITY * size);
        let mut slots: Vec<Slot> = Vec::with_capacity(size);
        for index in 0..size {
            let mut slot = Slot::new();
            self.spawn_into(index, &mut slot, &events_tx).await;
            slots.push(slot);
        }

        let mut stopping = false;
        loop {
            stopping |= self.cancel.is_cancelled();
            if !stopping {
                self.dispatch(&mut slots, &mut queue);
            }

            let busy = slots.iter().any(Slot::is_busy);
            if !busy && (stopping || queue.is_empty()) {
                break;
            }
            if !busy && slots.iter().all(|s| matches!(s.state, SlotState::Closed)) {
                self.fail_queued(&mut queue);
                break;
            }

            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(event) => self.handle(event, &mut slots, &mut queue, &events_tx).await,
                    None => break,
                },
                _ = self.cancel.cancelled(), if !stopping => {
                    info!("Stopping {} run; waiting for tests in flight", self.settings.name);
                    stopping = true;
                }
            }
        }

        if stopping && !queue.is_empty() {
            info!("{} queued {} tests were not started", queue.len(), self.settings.name);
        }
        self.shutdown(&mut slots, &mut events_rx).await;
    }

    /// Hand queued tests to idle slots
    fn dispatch(&self, slots: &mut [Slot], queue: &mut VecDeque<Job>) {
        for slot in slots.iter_mut() {
            if !matches!(slot.state, SlotState::Idle) {
                continue;
            }
            while let Some(job) = queue.pop_front() {
                let Some(retry) = self.aggregator.begin_attempt(&job.id) else {
                    continue;
                };
                let command = WorkerCommand::Run(RunPayload {
                    id: job.id.clone(),
                    retry,
                });
                if let Some(commands) = &slot.commands {
                    // a closed channel shows up as an exit event and fails the job there
                    if let Err(e) = commands.try_send(command) {
                        debug!("Worker unavailable for {}: {}", job.id, e);
                    }
                }
                slot.state = SlotState::Busy(job);
                break;
            }
            if queue.is_empty() {
                break;
            }
        }
    }

    async fn handle(
        &self,
        event: Event,
        slots: &mut [Slot],
        queue: &mut VecDeque<Job>,
        events: &mpsc::Sender<Event>,
    ) {
        let slot = &mut slots[event.slot];
        if slot.generation != event.generation {
            return;
        }

        match event.message {
            Some(WorkerMessage::Ready(payload)) => {
                if matches!(slot.state, SlotState::Starting) {
                    debug!(
                        "{} worker {} ready with {} tests",
                        self.settings.name,
                        event.slot,
                        payload.tests.len()
                    );
                    slot.state = SlotState::Idle;
                    slot.startup_failures = 0;
                }
            }
            Some(WorkerMessage::Test(result)) => {
                match std::mem::replace(&mut slot.state, SlotState::Idle) {
                    SlotState::Busy(job) => self.complete(job, result, queue),
                    other => {
                        warn!("Unexpected result from {} worker {}", self.settings.name, event.slot);
                        slot.state = other;
                    }
                }
            }
            Some(WorkerMessage::Error(message)) => {
                error!("{} worker {} failed: {}", self.settings.name, event.slot, message);
                self.recycle(event.slot, slot, queue, events, &message).await;
            }
            None => {
                self.recycle(event.slot, slot, queue, events, "worker exited unexpectedly")
                    .await;
            }
        }
    }

    /// Record an attempt and requeue it if it may be retried
    fn complete(&self, job: Job, result: TestResult, queue: &mut VecDeque<Job>) {
        let failed = !result.is_success();
        if let Err(e) = self.aggregator.apply_result(&job.id, result) {
            warn!("Dropping result for {}: {}", job.id, e);
            return;
        }
        if failed && job.attempt < self.max_retries && !self.cancel.is_cancelled() {
            debug!("Retrying {} (attempt {})", job.id, job.attempt + 1);
            queue.push_back(Job {
                id: job.id,
                attempt: job.attempt + 1,
            });
        }
    }

    /// Replace a worker that failed or went away
    async fn recycle(
        &self,
        index: usize,
        slot: &mut Slot,
        queue: &mut VecDeque<Job>,
        events: &mpsc::Sender<Event>,
        reason: &str,
    ) {
        slot.commands = None;
        match std::mem::replace(&mut slot.state, SlotState::Closed) {
            SlotState::Busy(job) => {
                warn!("{} worker {} lost while running {}", self.settings.name, index, job.id);
                self.complete(job, TestResult::failed(reason), queue);
            }
            SlotState::Starting => slot.startup_failures += 1,
            SlotState::Idle => {}
            SlotState::Closed => return,
        }

        if self.cancel.is_cancelled() || queue.is_empty() {
            return;
        }
        if slot.startup_failures >= MAX_STARTUP_FAILURES {
            error!(
                "{} worker {} failed to start {} times in a row; giving up on it",
                self.settings.name, index, slot.startup_failures
            );
            return;
        }
        self.spawn_into(index, slot, events).await;
    }

    /// Start a worker in `slot`, retrying failed spawns
    async fn spawn_into(&self, index: usize, slot: &mut Slot, events: &mpsc::Sender<Event>) {
        loop {
            slot.generation += 1;
            let generation = slot.generation;
            match self.spawner.spawn(&self.settings).await {
                Ok(channel) => {
                    slot.commands = Some(channel.commands);
                    slot.state = SlotState::Starting;

                    let events = events.clone();
                    let mut messages = channel.messages;
                    tokio::spawn(async move {
                        while let Some(message) = messages.recv().await {
                            let event = Event {
                                slot: index,
                                generation,
                                message: Some(message),
                            };
                            if events.send(event).await.is_err() {
                                return;
                            }
                        }
                        let _ = events
                            .send(Event {
                                slot: index,
                                generation,
                                message: None,
                            })
                            .await;
                    });
                    return;
                }
                Err(e) => {
                    slot.startup_failures += 1;
                    error!("Failed to start {} worker {}: {}", self.settings.name, index, e);
                    if slot.startup_failures >= MAX_STARTUP_FAILURES {
                        slot.state = SlotState::Closed;
                        return;
                    }
                }
            }
        }
    }

    fn fail_queued(&self, queue: &mut VecDeque<Job>) {
        let message = format!("no {} workers could be started", self.settings.name);
        error!("{}; failing {} queued tests", message, queue.len());
        for job in queue.drain(..) {
            if self.aggregator.begin_attempt(&job.id).is_some() {
                if let Err(e) = self
                    .aggregator
                    .apply_result(&job.id, TestResult::failed(message.clone()))
                {
                    warn!("Dropping result for {}: {}", job.id, e);
                }
            }
        }
    }

    /// Ask every live worker to exit and wait for them to release their sessions
    async fn shutdown(&self, slots: &mut [Slot], events: &mut mpsc::Receiver<Event>) {
        let mut live = 0usize;
        for slot in slots.iter_mut() {
            if let Some(commands) = slot.commands.take() {
                let _ = commands.try_send(WorkerCommand::Shutdown);
                live += 1;
            }
            slot.state = SlotState::Closed;
        }

        let generations: Vec<u64> = slots.iter().map(|s| s.generation).collect();
        let drain = async {
            while live > 0 {
                match events.recv().await {
                    Some(Event {
                        slot,
                        generation,
                        message: None,
                    }) if generations[slot] == generation => live -= 1,
                    Some(_) => {}
                    None => break,
                }
            }
        };
        if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("{} workers did not exit in time", self.settings.name);
        }
    }
}

struct ActiveRun {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl ActiveRun {
    fn is_running(&self) -> bool {
        !*self.done.borrow()
    }
}

/// Starts and stops runs over the browser pools
pub struct Orchestrator {
    config: Arc<Config>,
    aggregator: Arc<Aggregator>,
    spawner: Arc<dyn WorkerSpawner>,
    active: Mutex<Option<ActiveRun>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        aggregator: Arc<Aggregator>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        Self {
            config,
            aggregator,
            spawner,
            active: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().as_ref().map_or(false, ActiveRun::is_running)
    }

    /// Start a run of `ids` (all runnable tests when empty).
    /// Returns `false` when a run is already in progress.
    pub fn start(&self, ids: &[String]) -> bool {
        let mut active = self.active.lock();
        if active.as_ref().map_or(false, ActiveRun::is_running) {
            warn!("A run is already in progress");
            return false;
        }

        let mut queues: BTreeMap<String, VecDeque<Job>> = BTreeMap::new();
        let mut selected = Vec::new();
        for (id, browser) in self.aggregator.select(ids) {
            if self.config.browser(&browser).is_none() {
                debug!("Not running {}: browser {} is disabled", id, browser);
                continue;
            }
            queues.entry(browser).or_default().push_back(Job {
                id: id.clone(),
                attempt: 0,
            });
            selected.push(id);
        }
        self.aggregator.begin_run(&selected);

        let cancel = CancellationToken::new();
        let pools: Vec<_> = queues
            .into_iter()
            .filter_map(|(browser, queue)| {
                let settings = self.config.browser(&browser)?;
                let pool = BrowserPool {
                    settings,
                    spawner: Arc::clone(&self.spawner),
                    aggregator: Arc::clone(&self.aggregator),
                    cancel: cancel.clone(),
                    max_retries: self.config.max_retries,
                };
                Some(pool.run(queue))
            })
            .collect();

        let (done_tx, done_rx) = watch::channel(false);
        let aggregator = Arc::clone(&self.aggregator);
        tokio::spawn(async move {
            futures::future::join_all(pools).await;
            aggregator.finish_run();
            let _ = done_tx.send(true);
        });

        *active = Some(ActiveRun {
            cancel,
            done: done_rx,
        });
        true
    }

    /// Stop dispatching; tests in flight still report
    pub fn stop(&self) {
        if let Some(run) = self.active.lock().as_ref() {
            if run.is_running() {
                info!("Stop requested");
                run.cancel.cancel();
            }
        }
    }

    /// Wait for the current run, if any, to finish
    pub async fn wait(&self) {
        let done = self.active.lock().as_ref().map(|run| run.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}
