//! Warden configuration.
//!
//! Everything lives under one tool directory (`$WARDEN_HOME`, else
//! `~/.warden`):
//!
//! ```text
//! config.toml        this file's schema
//! warden.db          registry, dedup ledger, pending checks
//! run/               one control socket per project daemon
//! logs/warden.log
//! ```
//!
//! Every field has a default, so a missing file or section is never an error.
//!
//! ```toml
//! [fleet]
//! max_active = 8
//!
//! [cpu_guard]
//! threshold_percent = 50.0
//! consecutive_samples = 3
//!
//! [languages.python]
//! suppress_empty_updates = true
//!
//! [languages.zig]
//! command = "zls"
//! extensions = ["zig"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs, io};

use serde::Deserialize;
use thiserror::Error;
use warden_types::{LanguageOverride, ProjectHash};

pub const TOOL_DIR_ENV: &str = "WARDEN_HOME";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub daemon: DaemonConfig,
    pub fleet: FleetConfig,
    pub cpu_guard: CpuGuardConfig,
    pub backoff: BackoffConfig,
    pub collect: CollectConfig,
    pub dedup: DedupConfig,
    pub pending: PendingConfig,
    /// Per-language overrides, keyed by language id.
    pub languages: BTreeMap<String, LanguageOverride>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Project daemon and control-plane timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// How long `ensure_running` waits for a spawned daemon to report healthy.
    pub startup_timeout_ms: u64,
    /// Per-request timeout for `/health` probes.
    pub health_timeout_ms: u64,
    /// Poll interval while waiting for a daemon to become healthy.
    pub health_poll_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Budget for a graceful stop before force-killing.
    pub shutdown_timeout_ms: u64,
    /// Budget for the analyzer `initialize` handshake.
    pub handshake_timeout_ms: u64,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 10_000,
            health_timeout_ms: 2_000,
            health_poll_ms: 100,
            heartbeat_interval_ms: 15_000,
            shutdown_timeout_ms: 2_000,
            handshake_timeout_ms: 30_000,
            rate_limit_requests: 120,
            rate_limit_window_secs: 60,
        }
    }
}

impl DaemonConfig {
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    #[must_use]
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    #[must_use]
    pub fn health_poll(&self) -> Duration {
        Duration::from_millis(self.health_poll_ms.max(10))
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(100))
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs.max(1))
    }
}

/// Fleet-wide limits and the liveness sweep.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Ceiling on concurrently active project daemons.
    pub max_active: usize,
    pub liveness_interval_ms: u64,
    /// A row whose last successful probe is older than this is `unhealthy`.
    pub stale_after_ms: u64,
    /// An `unhealthy` daemon older than this is stopped and respawned.
    pub max_unresponsive_ms: u64,
    /// A `starting` claim older than this may be taken over.
    pub start_claim_stale_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_active: 8,
            liveness_interval_ms: 30_000,
            stale_after_ms: 5 * 60_000,
            max_unresponsive_ms: 10 * 60_000,
            start_claim_stale_ms: 30_000,
        }
    }
}

impl FleetConfig {
    #[must_use]
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms.max(100))
    }

    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    #[must_use]
    pub fn max_unresponsive(&self) -> Duration {
        Duration::from_millis(self.max_unresponsive_ms)
    }

    #[must_use]
    pub fn start_claim_stale(&self) -> Duration {
        Duration::from_millis(self.start_claim_stale_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CpuGuardConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Percent of one core.
    pub threshold_percent: f64,
    /// Samples above the threshold in a row before a kill.
    pub consecutive_samples: u32,
}

impl Default for CpuGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
            threshold_percent: 50.0,
            consecutive_samples: 3,
        }
    }
}

impl CpuGuardConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(100))
    }
}

/// Analyzer crash backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Failures after which a language is never restarted (until reset).
    pub max_failures: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
            max_failures: 5,
        }
    }
}

/// Daemon-side diagnostic collection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    /// Wait after opening files for diagnostics to arrive.
    pub settle_window_ms: u64,
    /// Bound on the whole open phase of a collection.
    pub timeout_ms: u64,
    pub open_batch_size: usize,
    pub open_batch_delay_ms: u64,
    /// Cap on files opened by a project-wide collection.
    pub max_files: usize,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            settle_window_ms: 2_000,
            timeout_ms: 30_000,
            open_batch_size: 20,
            open_batch_delay_ms: 50,
            max_files: 500,
        }
    }
}

impl CollectConfig {
    #[must_use]
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn open_batch_delay(&self) -> Duration {
        Duration::from_millis(self.open_batch_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Maximum diagnostics shown per response.
    pub page_size: usize,
    /// Ledger entries older than this are pruned.
    pub ledger_ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            ledger_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl DedupConfig {
    #[must_use]
    pub fn ledger_ttl(&self) -> Duration {
        Duration::from_secs(self.ledger_ttl_secs)
    }
}

/// Deferred file checks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PendingConfig {
    /// Time budget for draining pending checks during one request.
    pub drain_budget_ms: u64,
    /// Entries taken from other projects per drain.
    pub other_project_sample: usize,
    /// Entries older than this are marked checked without being run.
    pub max_age_secs: u64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            drain_budget_ms: 1_500,
            other_project_sample: 3,
            max_age_secs: 10 * 60,
        }
    }
}

impl PendingConfig {
    #[must_use]
    pub fn drain_budget(&self) -> Duration {
        Duration::from_millis(self.drain_budget_ms)
    }

    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl WardenConfig {
    /// Load `<tool dir>/config.toml`. A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match tool_dir() {
            Some(dir) => Self::load_from(&dir.join("config.toml")),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };
        Self::parse(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, source);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

/// `$WARDEN_HOME`, else `~/.warden`.
#[must_use]
pub fn tool_dir() -> Option<PathBuf> {
    match env::var_os(TOOL_DIR_ENV) {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::home_dir().map(|home| home.join(".warden")),
    }
}

/// File layout under one tool directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    root: PathBuf,
}

impl ToolPaths {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Paths under [`tool_dir`], if a home directory can be determined.
    #[must_use]
    pub fn discover() -> Option<Self> {
        tool_dir().map(Self::new)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    #[must_use]
    pub fn database(&self) -> PathBuf {
        self.root.join("warden.db")
    }

    #[must_use]
    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    #[must_use]
    pub fn socket_for(&self, hash: &ProjectHash) -> PathBuf {
        self.run_dir().join(format!("warden-{hash}.sock"))
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join("warden.log")
    }
}
