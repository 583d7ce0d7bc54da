//! Registry rows, health reports and deferred file checks.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{LanguageId, ProjectHash};

/// Lifecycle status of a registered project daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

impl ServerStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopped => "stopped",
        }
    }

    /// Everything except `stopped` counts against the one-per-project rule.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown server status: {0}")]
pub struct UnknownStatusError(String);

impl FromStr for ServerStatus {
    type Err = UnknownStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            "stopped" => Ok(Self::Stopped),
            other => Err(UnknownStatusError(other.to_string())),
        }
    }
}

/// One registry row: a project daemon and the resources it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInstance {
    pub project_hash: ProjectHash,
    pub project_root: PathBuf,
    pub languages: Vec<LanguageId>,
    pub pid: u32,
    pub socket_path: PathBuf,
    pub start_time: SystemTime,
    pub last_heartbeat: SystemTime,
    pub last_response: SystemTime,
    pub status: ServerStatus,
}

impl ServerInstance {
    /// Time since the daemon last answered a health probe.
    #[must_use]
    pub fn unresponsive_for(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_response).unwrap_or_default()
    }
}

/// Per-language line of a health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageHealth {
    pub language: LanguageId,
    pub state: String,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: ServerStatus,
    pub project_hash: ProjectHash,
    /// Seconds since the daemon started.
    pub uptime: u64,
    pub analyzers_ready: bool,
    #[serde(default)]
    pub languages: Vec<LanguageHealth>,
}

/// A file-scoped request that arrived before its analyzer was ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFileCheck {
    pub file_full_path: PathBuf,
    pub file_rel_path: PathBuf,
    pub project_root: PathBuf,
    pub created_at: SystemTime,
    pub checked: bool,
}

/// Milliseconds since the Unix epoch, as stored in the registry.
#[must_use]
pub fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Inverse of [`unix_millis`]; negative values clamp to the epoch.
#[must_use]
pub fn from_unix_millis(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ServerStatus::Starting,
            ServerStatus::Healthy,
            ServerStatus::Unhealthy,
            ServerStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<ServerStatus>().unwrap(), status);
        }
        assert!("zombie".parse::<ServerStatus>().is_err());
    }

    #[test]
    fn only_stopped_is_inactive() {
        assert!(ServerStatus::Starting.is_active());
        assert!(ServerStatus::Unhealthy.is_active());
        assert!(!ServerStatus::Stopped.is_active());
    }

    #[test]
    fn unix_millis_inverse() {
        let t = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(from_unix_millis(unix_millis(t)), t);
        assert_eq!(from_unix_millis(-5), UNIX_EPOCH);
    }

    #[test]
    fn health_report_uses_camel_case() {
        let report = HealthReport {
            status: ServerStatus::Healthy,
            project_hash: ProjectHash::from_raw("abc"),
            uptime: 3,
            analyzers_ready: true,
            languages: Vec::new(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["projectHash"], "abc");
        assert_eq!(json["analyzersReady"], true);
    }
}
