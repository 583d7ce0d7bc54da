//! Failure taxonomy shared by every Warden crate.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::LanguageId;

/// Typed failures of the orchestration engine.
///
/// `Clone` so that one in-flight start or collection can hand the same
/// outcome to every joined caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WardenError {
    /// Analyzer binary missing or not executable.
    #[error("failed to spawn {language} analyzer: {reason}")]
    SpawnFailure { language: LanguageId, reason: String },

    /// Analyzer rejected or never answered `initialize`.
    #[error("{language} analyzer failed the initialize handshake: {reason}")]
    HandshakeFailure { language: LanguageId, reason: String },

    #[error("{what} did not start within {}ms", timeout.as_millis())]
    StartupTimeout { what: String, timeout: Duration },

    #[error("diagnostic collection for {project} timed out after {}ms", timeout.as_millis())]
    CollectionTimeout { project: String, timeout: Duration },

    /// Unexpected analyzer exit.
    #[error("{language} analyzer exited unexpectedly: {reason}")]
    ProcessCrashed { language: LanguageId, reason: String },

    #[error("{language} analyzer is backing off after a crash; retry in {}ms", retry_in.as_millis())]
    BackingOff {
        language: LanguageId,
        retry_in: Duration,
    },

    #[error("{language} analyzer failed {failures} times; restarts disabled")]
    RestartRefused { language: LanguageId, failures: u32 },

    /// Registry storage I/O failure.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// Control socket unreachable or returned garbage.
    #[error("control plane request failed: {0}")]
    ControlPlane(String),
}

impl WardenError {
    /// Wrap a storage error. Uses the alternate form so `anyhow` context
    /// chains are kept.
    pub fn registry(err: impl fmt::Display) -> Self {
        Self::RegistryUnavailable(format!("{err:#}"))
    }

    pub fn control_plane(err: impl fmt::Display) -> Self {
        Self::ControlPlane(format!("{err:#}"))
    }

    /// Only registry loss breaks the single-instance guarantee; everything
    /// else degrades to an empty or partial result.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RegistryUnavailable(_))
    }

    /// Failures that count against a language's crash backoff.
    #[must_use]
    pub fn counts_as_crash(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailure { .. } | Self::HandshakeFailure { .. } | Self::ProcessCrashed { .. }
        )
    }
}
