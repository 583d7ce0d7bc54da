//! Orchestration engine for Warden.
//!
//! Daemon side, [`ProjectService`] turns a project's [`Supervisor`] into
//! deduplicated collection results. Client side, [`Coordinator`] keeps one
//! daemon per project alive through a [`FleetHost`], and the [`watchdog`]
//! loops police the fleet as a whole.
//!
//! [`Supervisor`]: warden_lsp::Supervisor

pub mod coordinator;
pub mod dedup;
pub mod discovery;
pub mod host;
pub mod ignore_rules;
pub mod project;
pub mod service;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use coordinator::{Coordinator, CoordinatorConfig, SocketRef};
pub use dedup::{DedupPage, Deduplicator};
pub use discovery::discover_files;
pub use host::FleetHost;
pub use ignore_rules::{DEFAULT_IGNORED_DIRS, IgnoreRules};
pub use project::{detect_languages, find_project_root};
pub use service::{ProjectService, supervisor_config};
pub use watchdog::{CpuGuard, SweepReport, spawn_cpu_guard, spawn_liveness_loop};
