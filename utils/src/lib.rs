//! Shared infrastructure utilities for Warden.
//!
//! This crate provides cross-cutting utilities that multiple Warden crates need
//! but that don't belong in the domain-pure `warden-types` crate:
//!
//! - **`process`**: Liveness probes, process-table scans, CPU sampling, kills
//! - **`inflight`**: Join concurrent identical operations onto one future
//! - **`secure_fs`**: Owner-only directories and files for sockets and databases

pub mod inflight;
pub mod process;
pub mod secure_fs;

pub use inflight::{Aborted, InFlight};
pub use process::{
    ChildCpuSampler, CpuSample, CpuSampler, KillOutcome, OsLiveness, ProcessInfo,
    ProcessLiveness, descendants_of, find_analyzer_processes, force_kill, list_processes,
    terminate,
};
#[cfg(unix)]
pub use process::{detach_session, die_with_parent};
pub use secure_fs::{ensure_secure_dir, ensure_secure_file, restrict_to_owner};
