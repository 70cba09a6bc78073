//! Configuration module for pingwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CYCLE_BUDGET_SECS: u64 = 60;
const DEFAULT_MAX_CONCURRENT_PROBES: usize = 50;

/// The knobs consumed by the ping cycle itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleConfig {
    /// Timeout for a single probe.
    pub probe_timeout: Duration,
    /// Wall-clock budget for a whole cycle.
    pub cycle_budget: Duration,
    /// Upper bound on probes in flight at once.
    pub max_concurrent_probes: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            cycle_budget: Duration::from_secs(DEFAULT_CYCLE_BUDGET_SECS),
            max_concurrent_probes: DEFAULT_MAX_CONCURRENT_PROBES,
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "pingwatch.db")
    pub db_path: String,
    /// Period of the built-in timer trigger; `None` disables it (default: 300s)
    pub cycle_interval: Option<Duration>,
    /// Registration limit per owner (default: 20)
    pub max_targets_per_owner: usize,
    pub cycle: CycleConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "pingwatch.db".to_string(),
            cycle_interval: Some(Duration::from_secs(300)),
            max_targets_per_owner: 20,
            cycle: CycleConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PINGWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `PINGWATCH_DB_PATH`: Database file path (default: "pingwatch.db")
    /// - `PINGWATCH_PROBE_TIMEOUT_MS`: per-probe timeout (default: 5000)
    /// - `PINGWATCH_CYCLE_BUDGET_SECS`: whole-cycle budget (default: 60)
    /// - `PINGWATCH_MAX_CONCURRENT_PROBES`: fan-out bound (default: 50)
    /// - `PINGWATCH_CYCLE_INTERVAL_SECS`: timer trigger period, 0 disables (default: 300)
    /// - `PINGWATCH_MAX_TARGETS_PER_OWNER`: registration limit (default: 20)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = parse_var(&lookup, "PINGWATCH_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("PINGWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(ms) = parse_var::<u64, _>(&lookup, "PINGWATCH_PROBE_TIMEOUT_MS").filter(|v| *v > 0) {
            cfg.cycle.probe_timeout = Duration::from_millis(ms);
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "PINGWATCH_CYCLE_BUDGET_SECS").filter(|v| *v > 0) {
            cfg.cycle.cycle_budget = Duration::from_secs(secs);
        }

        if let Some(n) = parse_var::<usize, _>(&lookup, "PINGWATCH_MAX_CONCURRENT_PROBES").filter(|v| *v > 0) {
            cfg.cycle.max_concurrent_probes = n;
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "PINGWATCH_CYCLE_INTERVAL_SECS") {
            cfg.cycle_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(n) = parse_var::<usize, _>(&lookup, "PINGWATCH_MAX_TARGETS_PER_OWNER").filter(|v| *v > 0) {
            cfg.max_targets_per_owner = n;
        }

        cfg
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value {:?} for {}", raw, key);
            None
        }
    }
}
