//! Per-project analyzer supervisor.
//!
//! Owns at most one connection per language for one project root, routes
//! documents to them by extension, and folds their diagnostics into a
//! [`DiagnosticStore`]. Connection tasks never touch supervisor state
//! directly: they send [`LspEvent`]s to a single consumer task, which holds
//! only a weak reference so dropping the supervisor tears everything down.
//!
//! A connection lives in the `connections` map until it stops. Removal is
//! the transition to dead; a `Stopped` event for a connection that is no
//! longer in the map (stopped on purpose, or replaced) is not a crash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use warden_types::{DiagnosticRecord, LanguageHealth, LanguageId, LanguageSpec, WardenError};
use warden_utils::{InFlight, KillOutcome};

use crate::backoff::FailureRecord;
use crate::connection::LanguageConnection;
use crate::diagnostics::DiagnosticStore;
use crate::languages::LanguageTable;
use crate::types::{ConnectionId, ConnectionState, LspEvent, SupervisorConfig};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Executable name of a warden daemon, as the parent of an analyzer.
const OWNER_MARKER: &str = "warden";

type StartResult = Result<Arc<LanguageConnection>, WardenError>;

#[derive(Default)]
struct State {
    connections: HashMap<LanguageId, Arc<LanguageConnection>>,
    failures: HashMap<LanguageId, FailureRecord>,
}

struct Inner {
    root: PathBuf,
    table: LanguageTable,
    config: SupervisorConfig,
    state: Mutex<State>,
    store: Mutex<DiagnosticStore>,
    starts: InFlight<LanguageId, StartResult>,
    event_tx: mpsc::Sender<LspEvent>,
    next_connection: AtomicU64,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheap to clone; clones share the same fleet.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Must be called inside a tokio runtime: spawns the event consumer.
    #[must_use]
    pub fn new(root: &Path, table: LanguageTable, config: SupervisorConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            root: root.to_path_buf(),
            table,
            config,
            state: Mutex::new(State::default()),
            store: Mutex::new(DiagnosticStore::new()),
            starts: InFlight::new(),
            event_tx,
            next_connection: AtomicU64::new(1),
        });
        tokio::spawn(consume_events(Arc::downgrade(&inner), event_rx));
        Self { inner }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    #[must_use]
    pub fn table(&self) -> &LanguageTable {
        &self.inner.table
    }

    #[must_use]
    pub fn language_for(&self, path: &Path) -> Option<LanguageId> {
        self.inner.table.for_path(path).map(|spec| spec.id.clone())
    }

    /// The live connection for `language`, starting the analyzer if needed.
    ///
    /// Concurrent callers for the same language share one start. A language
    /// that is backing off or was refused fails fast without spawning.
    pub async fn start_language(&self, language: &LanguageId) -> StartResult {
        if let Some(connection) = self.inner.connection(language) {
            return Ok(connection);
        }
        let Some(spec) = self.inner.table.get(language).cloned() else {
            return Err(WardenError::SpawnFailure {
                language: language.clone(),
                reason: "no analyzer configured for this language".to_string(),
            });
        };
        self.inner.admit(language)?;

        let inner = Arc::clone(&self.inner);
        self.inner
            .starts
            .run(language.clone(), move || async move { inner.launch(spec).await })
            .await
            .unwrap_or_else(|aborted| {
                Err(WardenError::SpawnFailure {
                    language: language.clone(),
                    reason: aborted.to_string(),
                })
            })
    }

    /// Adopt an analyzer already reachable over `reader`/`writer` instead of
    /// spawning one. Backoff is not consulted; reaching `ready` clears it.
    pub async fn attach_transport<R, W>(
        &self,
        language: &LanguageId,
        reader: R,
        writer: W,
    ) -> StartResult
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(spec) = self.inner.table.get(language).cloned() else {
            return Err(WardenError::SpawnFailure {
                language: language.clone(),
                reason: "no analyzer configured for this language".to_string(),
            });
        };
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        match LanguageConnection::attach(
            id,
            spec,
            &self.inner.root,
            reader,
            writer,
            self.inner.event_tx.clone(),
            self.inner.config.handshake_timeout,
        )
        .await
        {
            Ok(connection) => Ok(self.inner.adopt(connection)),
            Err(e) => {
                self.inner.record_failure_if_crash(language, &e);
                Err(e)
            }
        }
    }

    /// Open `path` in its analyzer, starting the analyzer if needed. Reads
    /// the file from disk.
    ///
    /// Returns `Ok(false)` when nothing was sent: no analyzer handles the
    /// extension, the file is outside the root or unreadable, or the
    /// document was already open.
    pub async fn open(&self, path: &Path) -> Result<bool, WardenError> {
        let Some(language) = self.routable(path) else {
            return Ok(false);
        };
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!(path = %path.display(), "Skipping unreadable file: {e}");
                return Ok(false);
            }
        };
        let connection = self.start_language(&language).await?;
        connection.open(path, &text).await
    }

    /// Push new content for `path`, opening it first if needed.
    pub async fn update(&self, path: &Path, text: &str) -> Result<bool, WardenError> {
        let Some(language) = self.routable(path) else {
            return Ok(false);
        };
        let connection = self.start_language(&language).await?;
        connection.update(path, text).await?;
        Ok(true)
    }

    /// Re-read `path` and send a change only if the analyzer's copy is stale
    /// or the document is not open yet.
    pub async fn refresh(&self, path: &Path) -> Result<bool, WardenError> {
        let Some(language) = self.routable(path) else {
            return Ok(false);
        };
        let Ok(text) = tokio::fs::read_to_string(path).await else {
            return Ok(false);
        };
        let connection = self.start_language(&language).await?;
        if !connection.content_differs(path, &text).await {
            return Ok(false);
        }
        connection.update(path, &text).await?;
        Ok(true)
    }

    /// Close `path` if its analyzer is running and has it open.
    pub async fn close(&self, path: &Path) -> Result<bool, WardenError> {
        let Some(connection) = self
            .language_for(path)
            .and_then(|language| self.inner.connection(&language))
        else {
            return Ok(false);
        };
        connection.close(path).await
    }

    fn routable(&self, path: &Path) -> Option<LanguageId> {
        if !path.starts_with(&self.inner.root) {
            tracing::debug!(path = %path.display(), "Ignoring file outside project root");
            return None;
        }
        self.language_for(path)
    }

    /// Languages with a running connection.
    #[must_use]
    pub fn languages(&self) -> Vec<LanguageId> {
        let mut languages: Vec<LanguageId> =
            locked(&self.inner.state).connections.keys().cloned().collect();
        languages.sort();
        languages
    }

    #[must_use]
    pub fn connection(&self, language: &LanguageId) -> Option<Arc<LanguageConnection>> {
        self.inner.connection(language)
    }

    /// Connection state per language, plus languages currently held back by
    /// crash backoff.
    #[must_use]
    pub fn health(&self) -> Vec<LanguageHealth> {
        let state = locked(&self.inner.state);
        let now = Instant::now();
        let mut out: Vec<LanguageHealth> = state
            .connections
            .iter()
            .map(|(language, connection)| LanguageHealth {
                language: language.clone(),
                state: connection.state().as_str().to_string(),
            })
            .collect();
        for (language, record) in &state.failures {
            if state.connections.contains_key(language) {
                continue;
            }
            let label = match record.admit(&self.inner.config.backoff, language, now) {
                Err(WardenError::RestartRefused { .. }) => "refused",
                Err(_) => "backing-off",
                Ok(()) => "failed",
            };
            out.push(LanguageHealth {
                language: language.clone(),
                state: label.to_string(),
            });
        }
        out.sort_by(|a, b| a.language.cmp(&b.language));
        out
    }

    /// At least one connection, and every connection is ready.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        let state = locked(&self.inner.state);
        !state.connections.is_empty()
            && state
                .connections
                .values()
                .all(|c| c.state() == ConnectionState::Ready)
    }

    /// Wait until every running connection is ready or terminal. Returns
    /// whether all of them ended up ready.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let connections: Vec<Arc<LanguageConnection>> =
            locked(&self.inner.state).connections.values().cloned().collect();
        let waits = connections.iter().map(|connection| {
            let mut rx = connection.subscribe();
            async move {
                loop {
                    let state = *rx.borrow_and_update();
                    if state == ConnectionState::Ready || state.is_terminal() {
                        return state == ConnectionState::Ready;
                    }
                    if rx.changed().await.is_err() {
                        return false;
                    }
                }
            }
        });
        tokio::time::timeout(timeout, join_all(waits))
            .await
            .is_ok_and(|results| results.into_iter().all(|ready| ready))
    }

    /// Reportable diagnostics for one file.
    #[must_use]
    pub fn diagnostics_for(&self, path: &Path) -> Vec<DiagnosticRecord> {
        locked(&self.inner.store).for_file(path)
    }

    /// Reportable diagnostics for every file under the root not excluded by
    /// `is_ignored`, in display order.
    pub fn collect_all(&self, is_ignored: impl Fn(&Path) -> bool) -> Vec<DiagnosticRecord> {
        locked(&self.inner.store).collect_all(&self.inner.root, is_ignored)
    }

    #[must_use]
    pub fn failure_count(&self, language: &LanguageId) -> u32 {
        locked(&self.inner.state)
            .failures
            .get(language)
            .map_or(0, |record| record.failures)
    }

    /// Forget crash history so a refused language may start again.
    pub fn reset_backoff(&self, language: &LanguageId) {
        locked(&self.inner.state).failures.remove(language);
    }

    /// OS pids of spawned analyzers.
    #[must_use]
    pub fn child_pids(&self) -> Vec<(LanguageId, u32)> {
        locked(&self.inner.state)
            .connections
            .iter()
            .filter_map(|(language, c)| c.pid().map(|pid| (language.clone(), pid)))
            .collect()
    }

    /// Stop one analyzer on purpose; not counted as a crash.
    pub async fn stop_language(&self, language: &LanguageId) -> bool {
        let removed = locked(&self.inner.state).connections.remove(language);
        let Some(connection) = removed else {
            return false;
        };
        locked(&self.inner.store).forget_language(language);
        connection.shutdown(self.inner.config.shutdown_timeout).await;
        true
    }

    /// Stop every analyzer and clear all diagnostics. Safe to call with no
    /// connections and more than once.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<LanguageConnection>> = {
            let mut state = locked(&self.inner.state);
            state.failures.clear();
            state.connections.drain().map(|(_, c)| c).collect()
        };
        let timeout = self.inner.config.shutdown_timeout;
        join_all(connections.iter().map(|c| c.shutdown(timeout))).await;
        locked(&self.inner.store).clear();
        if !connections.is_empty() {
            tracing::info!(
                root = %self.inner.root.display(),
                count = connections.len(),
                "Analyzers stopped"
            );
        }
    }
}

impl Inner {
    fn connection(&self, language: &LanguageId) -> Option<Arc<LanguageConnection>> {
        locked(&self.state)
            .connections
            .get(language)
            .filter(|c| !c.state().is_terminal())
            .cloned()
    }

    fn is_current(&self, language: &LanguageId, connection: ConnectionId) -> bool {
        locked(&self.state)
            .connections
            .get(language)
            .is_some_and(|c| c.id() == connection)
    }

    fn admit(&self, language: &LanguageId) -> Result<(), WardenError> {
        let state = locked(&self.state);
        match state.failures.get(language) {
            Some(record) => record.admit(&self.config.backoff, language, Instant::now()),
            None => Ok(()),
        }
    }

    fn record_failure(state: &mut State, language: &LanguageId) {
        let now = Instant::now();
        state
            .failures
            .entry(language.clone())
            .and_modify(|record| record.bump(now))
            .or_insert_with(|| FailureRecord::first(now));
    }

    fn record_failure_if_crash(&self, language: &LanguageId, error: &WardenError) {
        if error.counts_as_crash() {
            Self::record_failure(&mut locked(&self.state), language);
        }
    }

    async fn launch(self: Arc<Self>, spec: LanguageSpec) -> StartResult {
        if let Some(connection) = self.connection(&spec.id) {
            return Ok(connection);
        }
        if self.config.kill_orphans {
            self.kill_orphans(&spec);
        }
        let language = spec.id.clone();
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        match LanguageConnection::spawn(
            id,
            spec,
            &self.root,
            self.event_tx.clone(),
            self.config.handshake_timeout,
        )
        .await
        {
            Ok(connection) => Ok(self.adopt(connection)),
            Err(e) => {
                tracing::warn!(language = %language, "Analyzer failed to start: {e}");
                self.record_failure_if_crash(&language, &e);
                Err(e)
            }
        }
    }

    /// Install `connection` as the live one for its language and start
    /// waiting for readiness in the background.
    fn adopt(self: &Arc<Self>, connection: LanguageConnection) -> Arc<LanguageConnection> {
        let connection = Arc::new(connection);
        let language = connection.language().clone();
        let replaced = locked(&self.state)
            .connections
            .insert(language.clone(), Arc::clone(&connection));
        if let Some(old) = replaced {
            tracing::debug!(language = %language, "Replacing previous connection");
            tokio::spawn(async move { old.kill().await });
        }

        let ready = Arc::clone(&connection);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            match ready.await_readiness().await {
                Ok(()) => {
                    let _ = event_tx
                        .send(LspEvent::Ready {
                            connection: ready.id(),
                            language: ready.language().clone(),
                        })
                        .await;
                }
                Err(e) => tracing::warn!(language = %ready.language(), "{e}"),
            }
        });
        connection
    }

    /// Terminate analyzers for this root left behind by an earlier daemon.
    fn kill_orphans(&self, spec: &LanguageSpec) {
        let orphans =
            warden_utils::find_analyzer_processes(spec.process_signature(), &self.root, OWNER_MARKER);
        for orphan in orphans {
            match warden_utils::terminate(orphan.pid) {
                Ok(KillOutcome::Killed) => tracing::info!(
                    language = %spec.id,
                    pid = orphan.pid,
                    "Terminated orphaned analyzer"
                ),
                Ok(KillOutcome::NotRunning) => {}
                Err(e) => tracing::warn!(
                    language = %spec.id,
                    pid = orphan.pid,
                    "Could not terminate orphaned analyzer: {e}"
                ),
            }
        }
    }

    fn handle_event(&self, event: LspEvent) {
        match event {
            LspEvent::Diagnostics {
                connection,
                language,
                path,
                items,
            } => {
                if !self.is_current(&language, connection) {
                    return;
                }
                let suppress = self
                    .table
                    .get(&language)
                    .is_some_and(|spec| spec.suppress_empty_updates);
                locked(&self.store).apply(&language, path, items, suppress);
            }
            LspEvent::Touched { path } => locked(&self.store).mark_touched(path),
            LspEvent::Ready {
                connection,
                language,
            } => {
                let mut state = locked(&self.state);
                if state
                    .connections
                    .get(&language)
                    .is_some_and(|c| c.id() == connection)
                {
                    state.failures.remove(&language);
                    tracing::info!(language = %language, "Analyzer ready");
                }
            }
            LspEvent::Stopped {
                connection,
                language,
                reason,
            } => {
                {
                    let mut state = locked(&self.state);
                    if !state
                        .connections
                        .get(&language)
                        .is_some_and(|c| c.id() == connection)
                    {
                        return;
                    }
                    state.connections.remove(&language);
                    Self::record_failure(&mut state, &language);
                }
                let crash = WardenError::ProcessCrashed {
                    language: language.clone(),
                    reason: reason.to_string(),
                };
                tracing::warn!(language = %language, "{crash}");
                locked(&self.store).forget_language(&language);
            }
        }
    }
}

async fn consume_events(inner: Weak<Inner>, mut event_rx: mpsc::Receiver<LspEvent>) {
    while let Some(event) = event_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::testing::{FakeAnalyzer, FakeOptions, diagnostic, test_spec};
    use warden_types::Severity;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            handshake_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_millis(200),
            backoff: BackoffPolicy {
                base: Duration::ZERO,
                max_delay: Duration::ZERO,
                max_failures: 3,
            },
            kill_orphans: false,
        }
    }

    fn supervisor(root: &Path, specs: Vec<LanguageSpec>) -> Supervisor {
        Supervisor::new(root, LanguageTable::from_specs(specs), config())
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn attach(sup: &Supervisor, language: &str) -> FakeAnalyzer {
        let (fake, reader, writer) = FakeAnalyzer::start(FakeOptions::default());
        sup.attach_transport(&LanguageId::new(language), reader, writer)
            .await
            .unwrap();
        fake
    }

    #[tokio::test]
    async fn open_routes_by_extension_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.go");
        std::fs::write(&file, "package main\n").unwrap();
        let sup = supervisor(dir.path(), vec![test_spec("go", "go")]);
        let fake = attach(&sup, "go").await;

        assert!(sup.open(&file).await.unwrap());
        assert!(!sup.open(&file).await.unwrap());
        assert!(!sup.open(&dir.path().join("notes.md")).await.unwrap());
        assert!(!sup.open(Path::new("/elsewhere/x.go")).await.unwrap());

        fake.wait_for_count("textDocument/didOpen", 1).await;
        assert_eq!(fake.count("textDocument/didOpen").await, 1);
        let go = sup.connection(&LanguageId::new("go")).unwrap();
        assert_eq!(go.version(&file).await, Some(1));
    }

    #[tokio::test]
    async fn diagnostics_reach_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.go");
        std::fs::write(&file, "package main\n").unwrap();
        let sup = supervisor(dir.path(), vec![test_spec("go", "go")]);
        let fake = attach(&sup, "go").await;
        fake.set_diagnostics(
            &file,
            vec![
                diagnostic(4, Severity::Error, "undefined: x"),
                diagnostic(2, Severity::Hint, "style"),
            ],
        );

        sup.open(&file).await.unwrap();
        assert!(eventually(|| sup.diagnostics_for(&file).len() == 1).await);
        let all = sup.collect_all(|_| false);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].message(), "undefined: x");
        assert!(sup.collect_all(|_| true).is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_suppressed_until_document_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.py");
        std::fs::write(&file, "x = 1\n").unwrap();
        let mut spec = test_spec("python", "py");
        spec.suppress_empty_updates = true;
        let sup = supervisor(dir.path(), vec![spec]);
        let fake = attach(&sup, "python").await;

        fake.publish(&file, vec![diagnostic(0, Severity::Error, "bad")])
            .await;
        assert!(eventually(|| sup.diagnostics_for(&file).len() == 1).await);

        fake.publish(&file, Vec::new()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sup.diagnostics_for(&file).len(), 1);

        sup.update(&file, "x = 2\n").await.unwrap();
        fake.wait_for_count("textDocument/didOpen", 1).await;
        fake.publish(&file, Vec::new()).await;
        assert!(eventually(|| sup.diagnostics_for(&file).is_empty()).await);
    }

    #[tokio::test]
    async fn crash_is_recorded_and_clears_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.go");
        let sup = supervisor(dir.path(), vec![test_spec("go", "go")]);
        let fake = attach(&sup, "go").await;
        fake.publish(&file, vec![diagnostic(1, Severity::Warning, "unused")])
            .await;
        assert!(eventually(|| sup.diagnostics_for(&file).len() == 1).await);

        fake.crash();
        let go = LanguageId::new("go");
        assert!(eventually(|| sup.failure_count(&go) == 1).await);
        assert!(sup.languages().is_empty());
        assert!(sup.diagnostics_for(&file).is_empty());
        assert_eq!(sup.health()[0].state, "failed");
    }

    #[tokio::test]
    async fn ready_clears_failure_history() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), vec![test_spec("go", "go")]);
        let go = LanguageId::new("go");
        let first = attach(&sup, "go").await;
        first.crash();
        assert!(eventually(|| sup.failure_count(&go) == 1).await);

        let _second = attach(&sup, "go").await;
        assert!(sup.wait_ready(Duration::from_secs(2)).await);
        assert!(eventually(|| sup.failure_count(&go) == 0).await);
        assert!(sup.all_ready());
    }

    #[tokio::test]
    async fn missing_binary_backs_off_then_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = test_spec("zig", "zig");
        spec.command = "warden-test-no-such-analyzer".to_string();
        let sup = supervisor(dir.path(), vec![spec]);
        let zig = LanguageId::new("zig");

        for attempt in 1..=3 {
            let err = sup.start_language(&zig).await.unwrap_err();
            assert!(matches!(err, WardenError::SpawnFailure { .. }), "{err}");
            assert_eq!(sup.failure_count(&zig), attempt);
        }
        let err = sup.start_language(&zig).await.unwrap_err();
        assert!(matches!(err, WardenError::RestartRefused { failures: 3, .. }));
        assert_eq!(sup.health()[0].state, "refused");

        sup.reset_backoff(&zig);
        let err = sup.start_language(&zig).await.unwrap_err();
        assert!(matches!(err, WardenError::SpawnFailure { .. }));
    }

    #[tokio::test]
    async fn unknown_language_is_a_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), vec![test_spec("go", "go")]);
        let err = sup
            .start_language(&LanguageId::new("cobol"))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::SpawnFailure { .. }));
    }

    #[tokio::test]
    async fn intentional_stop_is_not_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), vec![test_spec("go", "go")]);
        let go = LanguageId::new("go");
        let fake = attach(&sup, "go").await;

        assert!(sup.stop_language(&go).await);
        assert!(!sup.stop_language(&go).await);
        fake.wait_for_count("shutdown", 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sup.failure_count(&go), 0);
    }

    #[tokio::test]
    async fn shutdown_is_safe_without_connections_and_stops_all() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            vec![test_spec("go", "go"), test_spec("python", "py")],
        );
        sup.shutdown().await;

        let go = attach(&sup, "go").await;
        let py = attach(&sup, "python").await;
        assert_eq!(sup.languages().len(), 2);
        sup.shutdown().await;
        sup.shutdown().await;

        assert!(sup.languages().is_empty());
        assert!(go.wait_for_count("shutdown", 1).await.contains(&"shutdown".to_string()));
        assert!(py.wait_for_count("shutdown", 1).await.contains(&"shutdown".to_string()));
    }

    #[tokio::test]
    async fn refresh_sends_change_only_when_content_differs() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lib.go");
        std::fs::write(&file, "package lib\n").unwrap();
        let sup = supervisor(dir.path(), vec![test_spec("go", "go")]);
        let fake = attach(&sup, "go").await;

        assert!(sup.open(&file).await.unwrap());
        assert!(!sup.refresh(&file).await.unwrap());
        std::fs::write(&file, "package lib\n\nvar X = 1\n").unwrap();
        assert!(sup.refresh(&file).await.unwrap());

        fake.wait_for_count("textDocument/didChange", 1).await;
        let go = sup.connection(&LanguageId::new("go")).unwrap();
        assert_eq!(go.version(&file).await, Some(2));
        assert!(sup.close(&file).await.unwrap());
        assert!(!sup.close(&file).await.unwrap());
    }
}
