//! Client side of the sequenced status stream

use crate::error::{Error, Result};
use crate::protocol::Response;
use crate::types::CreeveyStatus;

/// Local copy of the server state, kept in step with `status`/`update` messages.
///
/// Updates must arrive with consecutive sequence numbers. A gap means
/// messages were lost and the mirror must be rebuilt from a fresh `status`.
#[derive(Debug, Clone, Default)]
pub struct StatusMirror {
    status: Option<CreeveyStatus>,
    seq: u64,
}

impl StatusMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<&CreeveyStatus> {
        self.status.as_ref()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Apply one server message. Returns [`Error::SyncGap`] when an update is
    /// out of sequence; the mirror is then cleared until the next snapshot.
    pub fn apply(&mut self, response: Response) -> Result<()> {
        match response {
            Response::Status { seq, payload } => {
                self.status = Some(payload);
                self.seq = seq;
                Ok(())
            }
            Response::Update { seq, payload } => {
                let expected = self.seq + 1;
                match self.status.as_mut() {
                    Some(status) if seq == expected => {
                        status.apply(payload);
                        self.seq = seq;
                        Ok(())
                    }
                    _ => {
                        self.status = None;
                        Err(Error::SyncGap {
                            expected,
                            received: seq,
                        })
                    }
                }
            }
            Response::Error { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CreeveyUpdate;

    #[test]
    fn test_mirror_follows_sequence() {
        let mut mirror = StatusMirror::new();
        mirror
            .apply(Response::Status {
                seq: 0,
                payload: CreeveyStatus::default(),
            })
            .unwrap();
        mirror
            .apply(Response::Update {
                seq: 1,
                payload: CreeveyUpdate::running(true),
            })
            .unwrap();
        assert!(mirror.status().unwrap().is_running);
        assert_eq!(mirror.seq(), 1);
    }

    #[test]
    fn test_mirror_detects_gap() {
        let mut mirror = StatusMirror::new();
        mirror
            .apply(Response::Status {
                seq: 4,
                payload: CreeveyStatus::default(),
            })
            .unwrap();
        let err = mirror
            .apply(Response::Update {
                seq: 6,
                payload: CreeveyUpdate::running(true),
            })
            .unwrap_err();
        assert!(matches!(err, Error::SyncGap { expected: 5, received: 6 }));
        assert!(mirror.status().is_none());

        mirror
            .apply(Response::Status {
                seq: 6,
                payload: CreeveyStatus::default(),
            })
            .unwrap();
        assert!(mirror.status().is_some());
    }

    #[test]
    fn test_update_before_snapshot_is_a_gap() {
        let mut mirror = StatusMirror::new();
        let result = mirror.apply(Response::Update {
            seq: 1,
            payload: CreeveyUpdate::running(true),
        });
        assert!(result.is_err());
    }
}
