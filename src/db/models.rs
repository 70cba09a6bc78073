//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Health status of a monitored target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Down,
    /// Created, not yet probed.
    Pending,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Pending => "pending",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "pending" => Ok(Self::Pending),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// A monitored URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredTarget {
    pub id: i64,
    pub owner_id: String,
    pub url: String,
    pub current_status: Status,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One append-only status sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub target_id: i64,
    pub status: Status,
    /// Absent when no response was received.
    pub latency_millis: Option<i64>,
    pub observed_at: DateTime<Utc>,
}

/// A target together with its most recent history, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct TargetWithHistory {
    #[serde(flatten)]
    pub target: MonitoredTarget,
    pub history: Vec<HistoryEntry>,
}

/// A recorded ping cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets_processed: i64,
    pub targets_failed: i64,
}
