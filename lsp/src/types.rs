//! Connection states, supervisor events and settings.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use warden_types::{DiagnosticRecord, LanguageId};

use crate::backoff::BackoffPolicy;

/// Lifecycle of one analyzer connection.
///
/// `Starting → Initializing → Ready`; `Starting | Initializing → Failed`;
/// anything becomes `Stopped` when the process exits or is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Starting,
    /// Handshake done, waiting for the settle delay or readiness pattern.
    Initializing,
    Ready,
    Failed,
    Stopped,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// `Failed` and `Stopped` never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one spawned or attached connection. A language restarted after
/// a crash gets a new id, so late events from the old process are ignored.
pub type ConnectionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The analyzer closed its output stream.
    Exited,
    Failed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited => f.write_str("exited"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Messages from connection tasks to the supervisor's single consumer.
#[derive(Debug, Clone)]
pub enum LspEvent {
    Diagnostics {
        connection: ConnectionId,
        language: LanguageId,
        path: PathBuf,
        items: Vec<DiagnosticRecord>,
    },
    /// A document was opened or its content changed.
    Touched { path: PathBuf },
    Ready {
        connection: ConnectionId,
        language: LanguageId,
    },
    Stopped {
        connection: ConnectionId,
        language: LanguageId,
        reason: StopReason,
    },
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub handshake_timeout: Duration,
    /// Budget for the `shutdown` request before the process is killed.
    pub shutdown_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Kill orphaned analyzers for this root left by an earlier daemon.
    pub kill_orphans: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
            kill_orphans: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Stopped.is_terminal());
        assert!(!ConnectionState::Initializing.is_terminal());
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
    }

    #[test]
    fn stop_reason_display() {
        assert_eq!(StopReason::Exited.to_string(), "exited");
        assert_eq!(
            StopReason::Failed("broken pipe".into()).to_string(),
            "failed: broken pipe"
        );
    }
}
