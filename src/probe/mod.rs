//! Probe module for endpoint monitoring.
//!
//! An HTTP prober performs one bounded GET per call; the classifier turns its
//! raw outcome into a health status.

mod classify;
mod http;

pub use classify::*;
pub use http::*;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Raw result of probing one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// A response arrived before the timeout, whatever its status code.
    Responded { status_code: u16, elapsed_millis: u64 },
    /// No usable response. `reason` is diagnostic only.
    Failed { reason: String },
}

impl From<ProbeError> for ProbeOutcome {
    fn from(err: ProbeError) -> Self {
        ProbeOutcome::Failed {
            reason: err.to_string(),
        }
    }
}

/// Performs a single check against a URL.
///
/// Implementations make at most one outbound call and never retry.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str) -> ProbeOutcome;
}
