//! Messages exchanged between clients, the server and workers

use serde::{Deserialize, Serialize};

use crate::types::{CreeveyStatus, CreeveyUpdate, TestResult};

/// Approval of one image of one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovePayload {
    pub id: String,
    pub retry: u32,
    pub image: String,
}

/// Client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Request {
    /// Run the given tests, or all of them when the list is empty
    Start(Vec<String>),
    Stop,
    Approve(ApprovePayload),
    /// Ask for a fresh full snapshot after a sequence gap
    Status,
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Status { seq: u64, payload: CreeveyStatus },
    Update { seq: u64, payload: CreeveyUpdate },
    /// Rejection of a single request; not part of the sequence
    Error { payload: ErrorPayload },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Orchestrator to worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WorkerCommand {
    Run(RunPayload),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPayload {
    pub id: String,
    pub retry: u32,
}

/// Worker to orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The worker compiled its catalog and accepts these test ids
    Ready(ReadyPayload),
    /// The worker cannot continue
    Error(String),
    /// Outcome of the attempt that was last assigned
    Test(TestResult),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub tests: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let start: Request = serde_json::from_str(r#"{"type": "start", "payload": ["a", "b"]}"#).unwrap();
        assert_eq!(start, Request::Start(vec!["a".into(), "b".into()]));

        let stop: Request = serde_json::from_str(r#"{"type": "stop"}"#).unwrap();
        assert_eq!(stop, Request::Stop);

        let approve: Request = serde_json::from_str(
            r#"{"type": "approve", "payload": {"id": "x", "retry": 1, "image": "chrome"}}"#,
        )
        .unwrap();
        assert_eq!(
            approve,
            Request::Approve(ApprovePayload {
                id: "x".into(),
                retry: 1,
                image: "chrome".into(),
            })
        );
    }

    #[test]
    fn test_response_carries_sequence() {
        let response = Response::Update {
            seq: 7,
            payload: CreeveyUpdate::running(false),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["payload"]["isRunning"], false);
    }

    #[test]
    fn test_worker_messages_round_trip_as_json_lines() {
        let message = WorkerMessage::Test(TestResult::failed("timeout"));
        let line = serde_json::to_string(&message).unwrap();
        assert!(!line.contains('\n'));
        let back: WorkerMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(back, message);
    }
}
