//! In-memory fleet for coordinator and watchdog tests.
//!
//! "Processes" are pids in a set; a daemon is reachable while its pid is
//! alive and it has not been made unresponsive.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use warden_types::{CollectionResult, HealthReport, ProjectHash, ServerStatus, WardenError};
use warden_utils::ProcessLiveness;

use crate::host::FleetHost;

#[derive(Debug, Clone)]
struct Daemon {
    pid: u32,
    root: PathBuf,
    unresponsive: bool,
}

#[derive(Default)]
struct HostState {
    next_pid: u32,
    alive: HashSet<u32>,
    daemons: HashMap<PathBuf, Daemon>,
    spawned: Vec<PathBuf>,
    spawn_delay: Duration,
    fail_spawns: bool,
    spawn_unresponsive: bool,
    analyzers_ready: bool,
    results: HashMap<Option<PathBuf>, CollectionResult>,
    collects: Vec<(PathBuf, Option<PathBuf>)>,
    shutdowns: Vec<PathBuf>,
}

pub struct MemoryHost {
    state: Mutex<HostState>,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                next_pid: 50_000,
                analyzers_ready: true,
                ..HostState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay every spawn, to widen race windows.
    pub fn set_spawn_delay(&self, delay: Duration) {
        self.state().spawn_delay = delay;
    }

    pub fn set_fail_spawns(&self, fail: bool) {
        self.state().fail_spawns = fail;
    }

    /// Spawned daemons stay alive but never answer on their socket.
    pub fn set_spawn_unresponsive(&self, unresponsive: bool) {
        self.state().spawn_unresponsive = unresponsive;
    }

    pub fn set_analyzers_ready(&self, ready: bool) {
        self.state().analyzers_ready = ready;
    }

    /// Canned answer for a collection of `file` (project-wide for `None`).
    pub fn set_result(&self, file: Option<&Path>, result: CollectionResult) {
        self.state().results.insert(file.map(Path::to_path_buf), result);
    }

    /// A live, reachable daemon not started through `spawn`.
    pub fn add_daemon(&self, root: &Path, socket: &Path) -> u32 {
        let mut state = self.state();
        state.next_pid += 1;
        let pid = state.next_pid;
        state.alive.insert(pid);
        state.daemons.insert(
            socket.to_path_buf(),
            Daemon {
                pid,
                root: root.to_path_buf(),
                unresponsive: false,
            },
        );
        pid
    }

    /// The process dies without the coordinator's involvement (SIGKILL).
    pub fn kill_out_of_band(&self, pid: u32) {
        let mut state = self.state();
        state.alive.remove(&pid);
        state.daemons.retain(|_, d| d.pid != pid);
    }

    /// Keep the process alive but stop answering on its socket.
    pub fn set_unresponsive(&self, socket: &Path, unresponsive: bool) {
        if let Some(daemon) = self.state().daemons.get_mut(socket) {
            daemon.unresponsive = unresponsive;
        }
    }

    /// Roots passed to `spawn`, in call order.
    #[must_use]
    pub fn spawned(&self) -> Vec<PathBuf> {
        self.state().spawned.clone()
    }

    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.state().spawned.len()
    }

    /// Live daemons' pids.
    #[must_use]
    pub fn running_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.state().daemons.values().map(|d| d.pid).collect();
        pids.sort_unstable();
        pids
    }

    #[must_use]
    pub fn collects(&self) -> Vec<(PathBuf, Option<PathBuf>)> {
        self.state().collects.clone()
    }

    #[must_use]
    pub fn shutdowns(&self) -> Vec<PathBuf> {
        self.state().shutdowns.clone()
    }

    fn reachable(&self, socket: &Path) -> Result<Daemon, WardenError> {
        let state = self.state();
        match state.daemons.get(socket) {
            Some(d) if state.alive.contains(&d.pid) && !d.unresponsive => Ok(d.clone()),
            _ => Err(WardenError::control_plane(format!(
                "connection refused: {}",
                socket.display()
            ))),
        }
    }
}

impl ProcessLiveness for MemoryHost {
    fn is_alive(&self, pid: u32) -> bool {
        self.state().alive.contains(&pid)
    }
}

impl FleetHost for MemoryHost {
    async fn spawn(&self, root: &Path, socket: &Path) -> Result<u32, WardenError> {
        let delay = self.state().spawn_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if state.fail_spawns {
            return Err(WardenError::control_plane("spawn refused"));
        }
        state.next_pid += 1;
        let pid = state.next_pid;
        state.alive.insert(pid);
        state.spawned.push(root.to_path_buf());
        let unresponsive = state.spawn_unresponsive;
        state.daemons.insert(
            socket.to_path_buf(),
            Daemon {
                pid,
                root: root.to_path_buf(),
                unresponsive,
            },
        );
        Ok(pid)
    }

    async fn health(&self, socket: &Path) -> Result<HealthReport, WardenError> {
        let daemon = self.reachable(socket)?;
        Ok(HealthReport {
            status: ServerStatus::Healthy,
            project_hash: ProjectHash::of(&daemon.root),
            uptime: 0,
            analyzers_ready: self.state().analyzers_ready,
            languages: Vec::new(),
        })
    }

    async fn collect(
        &self,
        socket: &Path,
        file: Option<&Path>,
    ) -> Result<CollectionResult, WardenError> {
        self.reachable(socket)?;
        let mut state = self.state();
        let key = file.map(Path::to_path_buf);
        state.collects.push((socket.to_path_buf(), key.clone()));
        let mut result = state
            .results
            .get(&key)
            .cloned()
            .unwrap_or_else(|| CollectionResult::page(key, Vec::new(), 0));
        result.analyzers_ready = state.analyzers_ready;
        Ok(result)
    }

    async fn shutdown(&self, socket: &Path) -> Result<(), WardenError> {
        let daemon = self.reachable(socket)?;
        let mut state = self.state();
        state.shutdowns.push(socket.to_path_buf());
        state.daemons.remove(socket);
        state.alive.remove(&daemon.pid);
        Ok(())
    }

    fn kill(&self, pid: u32) -> bool {
        let mut state = self.state();
        state.daemons.retain(|_, d| d.pid != pid);
        state.alive.remove(&pid)
    }
}
