//! The coordinator's view of the machine it runs project daemons on.

use std::future::Future;
use std::path::Path;

use warden_types::{CollectionResult, HealthReport, WardenError};
use warden_utils::ProcessLiveness;

/// Spawn, probe and stop project daemons.
///
/// The production host launches `warden serve` and talks to it over its
/// control socket; tests use an in-memory fleet.
pub trait FleetHost: ProcessLiveness + Send + Sync + 'static {
    /// Start a detached daemon for `root` listening on `socket`. Returns its
    /// pid.
    fn spawn(
        &self,
        root: &Path,
        socket: &Path,
    ) -> impl Future<Output = Result<u32, WardenError>> + Send;

    fn health(&self, socket: &Path) -> impl Future<Output = Result<HealthReport, WardenError>> + Send;

    /// Project-wide collection when `file` is `None`.
    fn collect(
        &self,
        socket: &Path,
        file: Option<&Path>,
    ) -> impl Future<Output = Result<CollectionResult, WardenError>> + Send;

    /// Ask the daemon to stop on its own.
    fn shutdown(&self, socket: &Path) -> impl Future<Output = Result<(), WardenError>> + Send;

    /// Force-kill. Returns whether a process was signalled.
    fn kill(&self, pid: u32) -> bool;
}
