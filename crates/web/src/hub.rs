//! Per-client status stream
//!
//! Every connected client gets its own sequence. The snapshot sent on connect
//! carries `seq` 0 and each update after it increments the sequence by one.
//! When the broadcast subscription lags, the skipped updates still consume
//! sequence numbers so the client notices the gap and asks for a new snapshot.

use creevey_common::protocol::ErrorPayload;
use creevey_common::{CreeveyUpdate, Request, Response};
use creevey_runner::TestRunner;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// Sequence numbers handed to one client
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClientSequence {
    seq: u64,
}

impl ClientSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence of the last message sent
    pub fn current(&self) -> u64 {
        self.seq
    }

    pub fn next(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Consume `count` numbers for updates that were never delivered
    pub fn skip(&mut self, count: u64) {
        self.seq += count;
    }
}

/// One client's view of the runner
pub struct ClientSession {
    runner: Arc<TestRunner>,
    seq: ClientSequence,
    updates: broadcast::Receiver<CreeveyUpdate>,
}

impl ClientSession {
    /// Subscribe to updates; returns the session and the initial snapshot
    pub fn connect(runner: Arc<TestRunner>) -> (Self, Response) {
        let (status, updates) = runner.aggregator().subscribe();
        let session = Self {
            runner,
            seq: ClientSequence::new(),
            updates,
        };
        let response = Response::Status {
            seq: session.seq.current(),
            payload: status,
        };
        (session, response)
    }

    pub fn seq(&self) -> u64 {
        self.seq.current()
    }

    /// Wait for the next update. `None` once the runner is gone.
    pub async fn next_update(&mut self) -> Option<Response> {
        loop {
            match self.updates.recv().await {
                Ok(payload) => {
                    return Some(Response::Update {
                        seq: self.seq.next(),
                        payload,
                    })
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Client fell behind by {} updates", skipped);
                    self.seq.skip(skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Handle one text frame from the client
    pub fn handle_text(&mut self, text: &str) -> Option<Response> {
        match serde_json::from_str::<Request>(text) {
            Ok(request) => self.handle(request),
            Err(e) => Some(error(format!("invalid request: {}", e))),
        }
    }

    pub fn handle(&mut self, request: Request) -> Option<Response> {
        debug!("Client request: {:?}", request);
        if let Request::Status = request {
            // a fresh subscription so nothing older than the snapshot is replayed
            let (status, updates) = self.runner.aggregator().subscribe();
            self.updates = updates;
            return Some(Response::Status {
                seq: self.seq.current(),
                payload: status,
            });
        }
        match self.runner.handle(request) {
            Ok(()) => None,
            Err(e) => Some(error(e.to_string())),
        }
    }
}

fn error(message: String) -> Response {
    Response::Error {
        payload: ErrorPayload { message },
    }
}
