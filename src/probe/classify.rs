//! Maps probe outcomes to health status.

use super::ProbeOutcome;
use crate::db::Status;

/// Responses with a status code at or above this are `down`.
pub const DOWN_STATUS_THRESHOLD: u16 = 400;

/// A classified probe result, ready to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub status: Status,
    /// Present only when a response was received.
    pub latency_millis: Option<i64>,
}

pub fn classify(outcome: &ProbeOutcome) -> Classification {
    match outcome {
        ProbeOutcome::Responded {
            status_code,
            elapsed_millis,
        } => Classification {
            status: if *status_code < DOWN_STATUS_THRESHOLD {
                Status::Up
            } else {
                Status::Down
            },
            latency_millis: Some(i64::try_from(*elapsed_millis).unwrap_or(i64::MAX)),
        },
        ProbeOutcome::Failed { .. } => Classification {
            status: Status::Down,
            latency_millis: None,
        },
    }
}
