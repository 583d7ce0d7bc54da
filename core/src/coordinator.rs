//! Client-side coordination of project daemons.
//!
//! The [`Coordinator`] is what an editor hook or `warden check` talks to. It
//! makes sure exactly one daemon serves each project (in-process starts are
//! joined, cross-process starts go through the registry's start claim),
//! keeps the fleet under its ceiling, and turns every failure except a lost
//! registry into a best-effort result carrying a note.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use warden_config::{ToolPaths, WardenConfig};
use warden_lsp::LanguageTable;
use warden_registry::Registry;
use warden_types::{
    CollectionResult, HealthReport, LanguageId, ProjectHash, ServerInstance, ServerStatus,
    WardenError, normalize_root,
};
use warden_utils::InFlight;

use crate::dedup::Deduplicator;
use crate::host::FleetHost;
use crate::project::detect_languages;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Fleet ceiling.
    pub max_active: usize,
    pub startup_timeout: Duration,
    pub health_timeout: Duration,
    pub health_poll: Duration,
    pub shutdown_timeout: Duration,
    pub start_claim_stale: Duration,
    pub stale_after: Duration,
    pub max_unresponsive: Duration,
    pub drain_budget: Duration,
    pub other_project_sample: usize,
    pub pending_max_age: Duration,
    pub page_size: usize,
    pub ledger_ttl: Duration,
}

impl CoordinatorConfig {
    #[must_use]
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            max_active: config.fleet.max_active.max(1),
            startup_timeout: config.daemon.startup_timeout(),
            health_timeout: config.daemon.health_timeout(),
            health_poll: config.daemon.health_poll(),
            shutdown_timeout: config.daemon.shutdown_timeout(),
            start_claim_stale: config.fleet.start_claim_stale(),
            stale_after: config.fleet.stale_after(),
            max_unresponsive: config.fleet.max_unresponsive(),
            drain_budget: config.pending.drain_budget(),
            other_project_sample: config.pending.other_project_sample,
            pending_max_age: config.pending.max_age(),
            page_size: config.dedup.page_size.max(1),
            ledger_ttl: config.dedup.ledger_ttl(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_config(&WardenConfig::default())
    }
}

/// Where a running project daemon can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRef {
    pub project_hash: ProjectHash,
    pub root: PathBuf,
    pub socket: PathBuf,
    pub pid: u32,
}

impl From<&ServerInstance> for SocketRef {
    fn from(row: &ServerInstance) -> Self {
        Self {
            project_hash: row.project_hash.clone(),
            root: row.project_root.clone(),
            socket: row.socket_path.clone(),
            pid: row.pid,
        }
    }
}

type StartOutcome = Result<SocketRef, WardenError>;
type CollectOutcome = Result<CollectionResult, WardenError>;

pub(crate) struct Inner<H> {
    pub(crate) host: H,
    pub(crate) registry: Registry,
    pub(crate) paths: ToolPaths,
    pub(crate) table: LanguageTable,
    pub(crate) config: CoordinatorConfig,
    dedup: Deduplicator,
    starts: InFlight<ProjectHash, StartOutcome>,
    collections: InFlight<(ProjectHash, Option<PathBuf>), CollectOutcome>,
}

pub struct Coordinator<H> {
    pub(crate) inner: Arc<Inner<H>>,
}

impl<H> Clone for Coordinator<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: FleetHost> Coordinator<H> {
    #[must_use]
    pub fn new(
        host: H,
        registry: Registry,
        paths: ToolPaths,
        table: LanguageTable,
        config: CoordinatorConfig,
    ) -> Self {
        let dedup = Deduplicator::new(registry.clone(), config.page_size, config.ledger_ttl);
        Self {
            inner: Arc::new(Inner {
                host,
                dedup,
                registry,
                paths,
                table,
                config,
                starts: InFlight::new(),
                collections: InFlight::new(),
            }),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    #[must_use]
    pub fn host(&self) -> &H {
        &self.inner.host
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// A healthy daemon for `root`, starting one if needed.
    pub async fn ensure_running(&self, root: &Path) -> StartOutcome {
        self.inner.ensure_running(&normalize_root(root)).await
    }

    /// Diagnostics for `root`, or for one `file` in it.
    ///
    /// Identical concurrent requests share one collection. Only a lost
    /// registry is an error; everything else yields a (possibly empty)
    /// result whose `notes` say what went wrong.
    pub async fn collect_diagnostics(&self, root: &Path, file: Option<&Path>) -> CollectOutcome {
        let root = normalize_root(root);
        let file = file.map(normalize_root);
        let key = (ProjectHash::of(&root), file.clone());
        let inner = Arc::clone(&self.inner);
        let fallback = file.clone();
        self.inner
            .collections
            .run(key, move || async move { inner.collect(root, file).await })
            .await
            .unwrap_or_else(|aborted| Ok(CollectionResult::soft_failure(fallback, aborted.to_string())))
    }

    /// Probe a daemon's health, updating its registry row on success.
    pub async fn probe(&self, instance: &SocketRef) -> Result<HealthReport, WardenError> {
        self.inner.probe(&instance.project_hash, &instance.socket).await
    }

    /// Gracefully stop the daemon for `root`. Returns whether one was
    /// running.
    pub async fn stop_project(&self, root: &Path, reason: &str) -> Result<bool, WardenError> {
        let root = normalize_root(root);
        match self.inner.registry.get_by_root(&root)? {
            Some(row) if row.status.is_active() => {
                self.inner.stop_instance(&row, reason).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Forget what the project's daemon has already shown.
    pub fn reset_dedup(&self, root: &Path) -> Result<(), WardenError> {
        self.inner
            .registry
            .reset_ledger(&ProjectHash::of(&normalize_root(root)))
    }
}

impl<H: FleetHost> Inner<H> {
    /// The claimant of a `starting` row is the coordinator process itself
    /// until the daemon registers.
    pub(crate) fn pid_alive(&self, pid: u32) -> bool {
        pid == std::process::id() || self.host.is_alive(pid)
    }

    async fn ensure_running(self: &Arc<Self>, root: &Path) -> StartOutcome {
        let hash = ProjectHash::of(root);
        if let Some(row) = self.registry.get_by_hash(&hash)?
            && row.status == ServerStatus::Healthy
            && self.pid_alive(row.pid)
        {
            self.registry.heartbeat(&hash)?;
            return Ok(SocketRef::from(&row));
        }

        let inner = Arc::clone(self);
        let root = root.to_path_buf();
        let what = root.display().to_string();
        self.starts
            .run(hash.clone(), move || async move { inner.start(root, hash).await })
            .await
            .unwrap_or_else(|aborted| {
                Err(WardenError::control_plane(format!("start of {what}: {aborted}")))
            })
    }

    async fn start(self: Arc<Self>, root: PathBuf, hash: ProjectHash) -> StartOutcome {
        if let Some(row) = self.registry.get_by_hash(&hash)?
            && row.status.is_active()
        {
            if !self.pid_alive(row.pid) {
                self.registry.mark_stopped(&hash, "process exited")?;
            } else if row.status != ServerStatus::Starting {
                if self.probe(&hash, &row.socket_path).await.is_ok() {
                    return Ok(SocketRef::from(&row));
                }
                tracing::warn!(project = %hash, pid = row.pid, "Daemon alive but not answering; replacing it");
                self.stop_instance(&row, "unresponsive").await?;
            }
        }

        let languages = {
            let root = root.clone();
            let table = self.table.clone();
            tokio::task::spawn_blocking(move || detect_languages(&root, &table))
                .await
                .unwrap_or_default()
        };
        let socket = self.paths.socket_for(&hash);
        let claimed = self.registry.claim_start(
            &root,
            &languages,
            std::process::id(),
            &socket,
            self.config.start_claim_stale,
        )?;
        if !claimed {
            tracing::debug!(project = %hash, "Another process is starting this daemon; waiting");
            return self.await_healthy(&hash, &root).await;
        }

        self.evict_over(self.config.max_active, Some(&hash)).await?;
        self.spawn_and_register(&root, &hash, &languages, &socket).await
    }

    async fn spawn_and_register(
        &self,
        root: &Path,
        hash: &ProjectHash,
        languages: &[LanguageId],
        socket: &Path,
    ) -> StartOutcome {
        let pid = match self.host.spawn(root, socket).await {
            Ok(pid) => pid,
            Err(e) => {
                tracing::warn!(project = %hash, "Daemon spawn failed: {e}");
                self.registry.mark_stopped(hash, "spawn failed")?;
                return Err(e);
            }
        };
        self.registry.register(root, languages, pid, socket)?;

        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            if self.host.is_alive(pid) && self.probe(hash, socket).await.is_ok() {
                tracing::info!(project = %hash, pid, root = %root.display(), "Daemon healthy");
                return Ok(SocketRef {
                    project_hash: hash.clone(),
                    root: root.to_path_buf(),
                    socket: socket.to_path_buf(),
                    pid,
                });
            }
            if !self.host.is_alive(pid) || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.health_poll).await;
        }

        let err = WardenError::StartupTimeout {
            what: format!("daemon for {}", root.display()),
            timeout: self.config.startup_timeout,
        };
        tracing::warn!(project = %hash, pid, "{err}");
        self.host.kill(pid);
        self.registry.mark_stopped(hash, "startup timeout")?;
        Err(err)
    }

    /// Wait for another process's start to produce a healthy row.
    async fn await_healthy(&self, hash: &ProjectHash, root: &Path) -> StartOutcome {
        let deadline = Instant::now() + self.config.startup_timeout;
        while Instant::now() < deadline {
            match self.registry.get_by_hash(hash)? {
                Some(row) if row.status == ServerStatus::Healthy && self.pid_alive(row.pid) => {
                    return Ok(SocketRef::from(&row));
                }
                Some(row) if row.status == ServerStatus::Stopped => break,
                _ => {}
            }
            tokio::time::sleep(self.config.health_poll).await;
        }
        Err(WardenError::StartupTimeout {
            what: format!("daemon for {} (started elsewhere)", root.display()),
            timeout: self.config.startup_timeout,
        })
    }

    /// One bounded health probe. A successful answer marks the row healthy
    /// and responsive.
    pub(crate) async fn probe(
        &self,
        hash: &ProjectHash,
        socket: &Path,
    ) -> Result<HealthReport, WardenError> {
        let report = tokio::time::timeout(self.config.health_timeout, self.host.health(socket))
            .await
            .map_err(|_| WardenError::control_plane("health probe timed out"))??;
        self.registry.record_response(hash)?;
        self.registry.set_status(hash, ServerStatus::Healthy)?;
        Ok(report)
    }

    /// Graceful shutdown, wait for exit, force-kill if still running, mark
    /// stopped.
    pub(crate) async fn stop_instance(
        &self,
        row: &ServerInstance,
        reason: &str,
    ) -> Result<(), WardenError> {
        let timeout = self.config.shutdown_timeout;
        let own = row.pid == std::process::id();
        if !own && self.host.is_alive(row.pid) {
            match tokio::time::timeout(timeout, self.host.shutdown(&row.socket_path)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(project = %row.project_hash, "Graceful stop failed: {e}"),
                Err(_) => tracing::debug!(project = %row.project_hash, "Graceful stop timed out"),
            }
            let deadline = Instant::now() + timeout;
            while self.host.is_alive(row.pid) && Instant::now() < deadline {
                tokio::time::sleep(self.config.health_poll).await;
            }
            if self.host.is_alive(row.pid) {
                tracing::warn!(project = %row.project_hash, pid = row.pid, "Daemon ignored shutdown; killing");
                self.host.kill(row.pid);
            }
        }
        self.registry.mark_stopped(&row.project_hash, reason)?;
        tracing::info!(project = %row.project_hash, pid = row.pid, reason, "Daemon stopped");
        Ok(())
    }

    async fn collect(self: Arc<Self>, root: PathBuf, file: Option<PathBuf>) -> CollectOutcome {
        let expired = self.registry.expire_pending(self.config.pending_max_age)?;
        if expired > 0 {
            tracing::debug!(expired, "Expired stale pending checks");
        }

        let daemon = match self.ensure_running(&root).await {
            Ok(daemon) => daemon,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(root = %root.display(), "Collection degraded: {e}");
                if let Some(file) = &file {
                    self.registry.enqueue_pending(file, &root)?;
                }
                return Ok(CollectionResult::soft_failure(file, e.to_string()));
            }
        };

        let mut result = match self.host.collect(&daemon.socket, file.as_deref()).await {
            Ok(result) => {
                self.registry.record_response(&daemon.project_hash)?;
                result
            }
            Err(e) => {
                tracing::warn!(project = %daemon.project_hash, "Collection failed: {e}");
                if let Some(file) = &file {
                    self.registry.enqueue_pending(file, &root)?;
                }
                return Ok(CollectionResult::soft_failure(file, e.to_string()));
            }
        };

        if !result.analyzers_ready {
            if let Some(file) = &file {
                self.registry.enqueue_pending(file, &root)?;
                result
                    .notes
                    .push("analyzers still starting; file queued for a later check".to_string());
            }
            return Ok(result);
        }
        self.drain_pending(&daemon, file.as_deref(), &mut result).await?;
        Ok(result)
    }

    /// Check queued files within the drain budget. This project's entries
    /// are merged into `result` (through the ledger when `result` is
    /// project-wide); other projects' are sent to their healthy daemons so
    /// those warm up.
    async fn drain_pending(
        &self,
        daemon: &SocketRef,
        current: Option<&Path>,
        result: &mut CollectionResult,
    ) -> Result<(), WardenError> {
        let budget = self.config.drain_budget;
        let deadline = Instant::now() + budget;
        let drained =
            self.registry
                .drain_pending(&daemon.root, budget, self.config.other_project_sample)?;
        for entry in drained {
            let file = entry.file_full_path.as_path();
            if current == Some(file) {
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let own = entry.project_root == daemon.root;
            if remaining.is_zero() {
                if own {
                    self.registry.enqueue_pending(file, &entry.project_root)?;
                }
                continue;
            }

            let socket = if own {
                Some(daemon.socket.clone())
            } else {
                self.registry
                    .get_by_root(&entry.project_root)?
                    .filter(|row| row.status == ServerStatus::Healthy && self.pid_alive(row.pid))
                    .map(|row| row.socket_path)
            };
            let Some(socket) = socket else {
                tracing::debug!(path = %file.display(), "No healthy daemon for queued file; dropping");
                continue;
            };

            match tokio::time::timeout(remaining, self.host.collect(&socket, Some(file))).await {
                Ok(Ok(page)) if page.analyzers_ready => {
                    if own {
                        self.merge_queued(&daemon.project_hash, result, page)?;
                    }
                }
                outcome => {
                    if let Ok(Err(e)) = &outcome {
                        tracing::debug!(path = %file.display(), "Queued check failed: {e}");
                    }
                    if own {
                        self.registry.enqueue_pending(file, &entry.project_root)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn merge_queued(
        &self,
        project: &ProjectHash,
        result: &mut CollectionResult,
        page: CollectionResult,
    ) -> Result<(), WardenError> {
        let page_size = self.config.page_size;
        if result.file.is_some() {
            result.absorb(page, page_size);
            return Ok(());
        }
        let room = page_size.saturating_sub(result.diagnostics.len());
        let admitted = self.dedup.admit(project, page.diagnostics, room)?;
        let mut merged = CollectionResult::page(None, admitted.shown, admitted.overflow);
        merged.notes = page.notes;
        result.absorb(merged, page_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryHost;
    use warden_utils::ProcessLiveness;
    use warden_types::{DiagnosticRecord, Severity};

    fn coordinator(host: MemoryHost, tool_dir: &Path) -> Coordinator<MemoryHost> {
        let config = CoordinatorConfig {
            startup_timeout: Duration::from_millis(500),
            health_poll: Duration::from_millis(5),
            shutdown_timeout: Duration::from_millis(50),
            ..CoordinatorConfig::default()
        };
        Coordinator::new(
            host,
            Registry::open_in_memory().unwrap(),
            ToolPaths::new(tool_dir),
            LanguageTable::builtin(),
            config,
        )
    }

    fn error_at(file: &Path, line: u32) -> DiagnosticRecord {
        DiagnosticRecord::new(
            file.to_path_buf(),
            line,
            0,
            Severity::Error,
            "boom".to_string(),
            "fake".to_string(),
        )
    }

    #[tokio::test]
    async fn healthy_row_is_reused_without_spawning() {
        let tool = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let coord = coordinator(MemoryHost::new(), tool.path());

        let first = coord.ensure_running(project.path()).await.unwrap();
        let second = coord.ensure_running(project.path()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(coord.host().spawned(), vec![normalize_root(project.path())]);
        let row = coord.registry().get_by_hash(&first.project_hash).unwrap().unwrap();
        assert_eq!(row.status, ServerStatus::Healthy);
        assert_eq!(row.pid, first.pid);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_spawn() {
        let tool = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let host = MemoryHost::new();
        host.set_spawn_delay(Duration::from_millis(30));
        let coord = coordinator(host, tool.path());

        let (a, b, c) = tokio::join!(
            coord.ensure_running(project.path()),
            coord.ensure_running(project.path()),
            coord.ensure_running(project.path()),
        );
        let a = a.unwrap();
        assert_eq!(a, b.unwrap());
        assert_eq!(a, c.unwrap());
        assert_eq!(coord.host().spawn_count(), 1);
    }

    #[tokio::test]
    async fn silent_daemon_is_replaced() {
        let tool = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let root = normalize_root(project.path());
        let host = MemoryHost::new();
        let coord = coordinator(host, tool.path());
        let socket = coord.inner.paths.socket_for(&ProjectHash::of(&root));
        // Alive but silent, and no replacement can be spawned.
        let pid = coord.host().add_daemon(&root, &socket);
        coord.host().set_unresponsive(&socket, true);
        coord.registry().register(&root, &[], pid, &socket).unwrap();
        coord
            .registry()
            .set_status(&ProjectHash::of(&root), ServerStatus::Unhealthy)
            .unwrap();
        coord.host().set_fail_spawns(true);

        let err = coord.ensure_running(&root).await.unwrap_err();
        assert!(!err.is_fatal());
        let row = coord.registry().get_by_root(&root).unwrap().unwrap();
        assert_eq!(row.status, ServerStatus::Stopped);
        assert!(!coord.host().is_alive(pid));
    }

    #[tokio::test]
    async fn daemon_that_never_answers_is_killed_at_the_startup_timeout() {
        let tool = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let root = normalize_root(project.path());
        let host = MemoryHost::new();
        host.set_spawn_unresponsive(true);
        let coord = coordinator(host, tool.path());

        let started = Instant::now();
        let err = coord.ensure_running(&root).await.unwrap_err();
        assert!(matches!(err, WardenError::StartupTimeout { .. }), "{err:?}");
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(coord.host().spawn_count(), 1);
        assert!(coord.host().running_pids().is_empty());
        let row = coord.registry().get_by_root(&root).unwrap().unwrap();
        assert_eq!(row.status, ServerStatus::Stopped);
        assert!(!coord.host().is_alive(row.pid));

        let result = coord.collect_diagnostics(&root, None).await.unwrap();
        assert!(result.notes[0].contains("did not start"), "{:?}", result.notes);
    }

    #[tokio::test]
    async fn start_claimed_elsewhere_times_out_without_spawning() {
        let tool = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let root = normalize_root(project.path());
        let coord = coordinator(MemoryHost::new(), tool.path());
        // A live process in another coordinator holds the start claim.
        let claimant = coord.host().add_daemon(Path::new("/elsewhere"), Path::new("/elsewhere.sock"));
        let socket = coord.inner.paths.socket_for(&ProjectHash::of(&root));
        assert!(
            coord
                .registry()
                .claim_start(&root, &[], claimant, &socket, Duration::from_secs(60))
                .unwrap()
        );

        let err = coord.ensure_running(&root).await.unwrap_err();
        match err {
            WardenError::StartupTimeout { what, .. } => assert!(what.contains("started elsewhere")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(coord.host().spawn_count(), 0);
        let row = coord.registry().get_by_root(&root).unwrap().unwrap();
        assert_eq!(row.status, ServerStatus::Starting);
        assert_eq!(row.pid, claimant);
    }

    #[tokio::test]
    async fn project_wide_results_record_merged_queue_entries() {
        let tool = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let root = normalize_root(project.path());
        let queued = root.join("queued.rs");
        let host = MemoryHost::new();
        host.set_result(
            Some(&queued),
            CollectionResult::page(
                Some(queued.clone()),
                vec![error_at(&queued, 1), error_at(&queued, 2), error_at(&queued, 3)],
                0,
            ),
        );
        let config = CoordinatorConfig {
            page_size: 2,
            health_poll: Duration::from_millis(5),
            ..CoordinatorConfig::default()
        };
        let coord = Coordinator::new(
            host,
            Registry::open_in_memory().unwrap(),
            ToolPaths::new(tool.path()),
            LanguageTable::builtin(),
            config,
        );
        coord.ensure_running(&root).await.unwrap();
        coord.registry().enqueue_pending(&queued, &root).unwrap();

        let first = coord.collect_diagnostics(&root, None).await.unwrap();
        let lines: Vec<u32> = first.diagnostics.iter().map(DiagnosticRecord::line).collect();
        assert_eq!(lines, vec![1, 2]);
        assert_eq!(first.overflow, 1);

        // Shown records are in the ledger; only the overflow is new.
        coord.registry().enqueue_pending(&queued, &root).unwrap();
        let second = coord.collect_diagnostics(&root, None).await.unwrap();
        let lines: Vec<u32> = second.diagnostics.iter().map(DiagnosticRecord::line).collect();
        assert_eq!(lines, vec![3]);
    }

    #[tokio::test]
    async fn soft_failures_become_notes() {
        let tool = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let host = MemoryHost::new();
        host.set_fail_spawns(true);
        let coord = coordinator(host, tool.path());

        let result = coord.collect_diagnostics(project.path(), None).await.unwrap();
        assert!(result.diagnostics.is_empty());
        assert_eq!(result.notes.len(), 1);
    }

    #[tokio::test]
    async fn not_ready_file_is_queued_then_merged_once_ready() {
        let tool = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let root = normalize_root(project.path());
        let early = root.join("early.rs");
        let later = root.join("later.rs");
        let host = MemoryHost::new();
        host.set_analyzers_ready(false);
        host.set_result(
            Some(&early),
            CollectionResult::page(Some(early.clone()), vec![error_at(&early, 3)], 0),
        );
        let coord = coordinator(host, tool.path());

        let first = coord.collect_diagnostics(&root, Some(&early)).await.unwrap();
        assert!(!first.analyzers_ready);
        assert_eq!(coord.registry().pending_for(&root).unwrap().len(), 1);

        coord.host().set_analyzers_ready(true);
        let second = coord.collect_diagnostics(&root, Some(&later)).await.unwrap();
        assert_eq!(second.counts.errors, 1);
        assert_eq!(second.diagnostics[0].file_path(), early.as_path());
        let asked: Vec<Option<PathBuf>> = coord.host().collects().into_iter().map(|(_, f)| f).collect();
        assert_eq!(asked, vec![Some(early.clone()), Some(later.clone()), Some(early.clone())]);
        assert!(coord.registry().pending_for(&root).unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_project_shuts_down_gracefully() {
        let tool = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let coord = coordinator(MemoryHost::new(), tool.path());
        let daemon = coord.ensure_running(project.path()).await.unwrap();

        assert!(coord.stop_project(project.path(), "requested").await.unwrap());
        assert_eq!(coord.host().shutdowns(), vec![daemon.socket.clone()]);
        assert!(!coord.stop_project(project.path(), "requested").await.unwrap());
    }
}
