//! One analyzer connection: a child process (or any byte transport) speaking
//! LSP, with a writer task, a reader task and per-document versions.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use warden_types::{LanguageId, LanguageSpec, WardenError};

use crate::codec::{FrameReader, FrameWriter, Incoming};
use crate::protocol::{self, Notification, PublishDiagnosticsParams, Request};
use crate::types::{ConnectionId, ConnectionState, LspEvent, StopReason};

const WRITER_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
enum WriterCommand {
    Send(Value),
    Shutdown,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

#[derive(Debug)]
struct Document {
    version: i32,
    text: String,
}

/// Lexical normalization: resolves `.` and `..` without touching the disk.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Everything the reader task needs, detached from the connection itself.
struct ReaderContext {
    connection: ConnectionId,
    language: LanguageId,
    root: PathBuf,
    ready_pattern: Option<String>,
    pending: PendingMap,
    event_tx: mpsc::Sender<LspEvent>,
    writer_tx: mpsc::Sender<WriterCommand>,
    pattern_seen: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl ReaderContext {
    fn scan_for_readiness(&self, text: &str) {
        if let Some(pattern) = &self.ready_pattern
            && text.contains(pattern.as_str())
        {
            self.pattern_seen.send_if_modified(|seen| {
                let changed = !*seen;
                *seen = true;
                changed
            });
        }
    }

    async fn dispatch(&self, frame: &Value) {
        let Some(incoming) = Incoming::classify(frame) else {
            tracing::trace!(language = %self.language, "Ignoring malformed JSON-RPC frame");
            return;
        };
        match incoming {
            Incoming::Response { id, body } => {
                let sender = self.pending.lock().await.remove(&id);
                if let Some(tx) = sender {
                    let _ = tx.send(body);
                }
            }
            Incoming::Request { id, method, params } => {
                tracing::debug!(language = %self.language, "Analyzer request: {method}");
                let reply = protocol::reply_to_server_request(&id, &method, params.as_ref());
                let _ = self.writer_tx.send(WriterCommand::Send(reply)).await;
            }
            Incoming::Notification { method, params } => {
                self.notification(&method, params).await;
            }
        }
    }

    async fn notification(&self, method: &str, params: Option<Value>) {
        match method {
            "textDocument/publishDiagnostics" => {
                let Some(params) = params else { return };
                let parsed = match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::debug!(
                            language = %self.language,
                            "Failed to parse publishDiagnostics: {e}"
                        );
                        return;
                    }
                };
                let Some(path) = protocol::file_uri_to_path(&parsed.uri) else {
                    return;
                };
                let path = normalize_path(&path);
                if !path.starts_with(&self.root) {
                    tracing::warn!(
                        language = %self.language,
                        "Analyzer reported diagnostics outside the project: {}",
                        path.display()
                    );
                    return;
                }
                let items = parsed
                    .diagnostics
                    .iter()
                    .filter_map(|d| d.to_record(&path, self.language.as_str()))
                    .collect();
                let _ = self
                    .event_tx
                    .send(LspEvent::Diagnostics {
                        connection: self.connection,
                        language: self.language.clone(),
                        path,
                        items,
                    })
                    .await;
            }
            "window/logMessage" | "window/showMessage" => {
                if let Some(text) = protocol::log_message_text(params.as_ref()) {
                    tracing::trace!(language = %self.language, "{text}");
                    self.scan_for_readiness(text);
                }
            }
            "$/progress" => {
                let value = params.as_ref().and_then(|p| p.get("value"));
                for key in ["title", "message"] {
                    if let Some(text) = value.and_then(|v| v.get(key)).and_then(Value::as_str) {
                        self.scan_for_readiness(text);
                    }
                }
            }
            _ => {
                tracing::trace!(language = %self.language, "Ignoring notification: {method}");
            }
        }
    }

    async fn stopped(&self, reason: StopReason) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = ConnectionState::Stopped;
            true
        });
        let _ = self
            .event_tx
            .send(LspEvent::Stopped {
                connection: self.connection,
                language: self.language.clone(),
                reason,
            })
            .await;
    }
}

/// A live analyzer, shared by the supervisor and its readiness task.
#[derive(Debug)]
pub struct LanguageConnection {
    id: ConnectionId,
    spec: LanguageSpec,
    root: PathBuf,
    writer_tx: mpsc::Sender<WriterCommand>,
    event_tx: mpsc::Sender<LspEvent>,
    next_request_id: AtomicU64,
    pending: PendingMap,
    documents: Mutex<HashMap<PathBuf, Document>>,
    state: Arc<watch::Sender<ConnectionState>>,
    pattern_seen: Arc<watch::Sender<bool>>,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for LanguageConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl LanguageConnection {
    /// Spawn the analyzer in `root` and complete the `initialize` handshake.
    pub async fn spawn(
        id: ConnectionId,
        spec: LanguageSpec,
        root: &Path,
        event_tx: mpsc::Sender<LspEvent>,
        handshake_timeout: Duration,
    ) -> Result<Self, WardenError> {
        let language = spec.id.clone();
        let spawn_failure = |reason: String| WardenError::SpawnFailure {
            language: language.clone(),
            reason,
        };
        let resolved = which::which(&spec.command).map_err(|e| {
            let hint = spec
                .install_hint
                .as_deref()
                .map(|h| format!(" (install with: {h})"))
                .unwrap_or_default();
            spawn_failure(format!("{} not found on PATH: {e}{hint}", spec.command))
        })?;

        let mut cmd = Command::new(&resolved);
        cmd.args(&spec.args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        warden_utils::die_with_parent(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_failure(format!("spawning {}: {e}", resolved.display())))?;
        let pid = child.id();
        let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
            return Err(spawn_failure("analyzer stdio not captured".to_string()));
        };
        let stderr = child.stderr.take();

        tracing::info!(language = %language, pid = ?pid, "Spawned analyzer {}", resolved.display());
        let connection = Self::connect(
            id,
            spec,
            root,
            stdout,
            stdin,
            Some(child),
            pid,
            stderr,
            event_tx,
        );
        if let Err(e) = connection.initialize(handshake_timeout).await {
            connection.kill().await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Adopt an analyzer already reachable over `reader`/`writer`.
    pub async fn attach<R, W>(
        id: ConnectionId,
        spec: LanguageSpec,
        root: &Path,
        reader: R,
        writer: W,
        event_tx: mpsc::Sender<LspEvent>,
        handshake_timeout: Duration,
    ) -> Result<Self, WardenError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Self::connect(id, spec, root, reader, writer, None, None, None, event_tx);
        connection.initialize(handshake_timeout).await?;
        Ok(connection)
    }

    #[allow(clippy::too_many_arguments)]
    fn connect<R, W>(
        id: ConnectionId,
        spec: LanguageSpec,
        root: &Path,
        reader: R,
        writer: W,
        child: Option<Child>,
        pid: Option<u32>,
        stderr: Option<ChildStderr>,
        event_tx: mpsc::Sender<LspEvent>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let root = normalize_path(root);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(watch::Sender::new(ConnectionState::Starting));
        let pattern_seen = Arc::new(watch::Sender::new(false));
        let mut tasks = Vec::with_capacity(3);

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_language = spec.id.clone();
        tasks.push(tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(command) = writer_rx.recv().await {
                match command {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(language = %writer_language, "Analyzer write error: {e:#}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        }));

        let context = Arc::new(ReaderContext {
            connection: id,
            language: spec.id.clone(),
            root: root.clone(),
            ready_pattern: spec.ready_pattern.clone(),
            pending: Arc::clone(&pending),
            event_tx: event_tx.clone(),
            writer_tx: writer_tx.clone(),
            pattern_seen: Arc::clone(&pattern_seen),
            state: Arc::clone(&state),
        });

        let reader_context = Arc::clone(&context);
        tasks.push(tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => reader_context.dispatch(&frame).await,
                    Ok(None) => {
                        tracing::info!(language = %reader_context.language, "Analyzer closed its output");
                        reader_context.stopped(StopReason::Exited).await;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(language = %reader_context.language, "Analyzer read error: {e:#}");
                        reader_context.stopped(StopReason::Failed(format!("{e:#}"))).await;
                        break;
                    }
                }
            }
        }));

        if let Some(stderr) = stderr {
            let stderr_context = context;
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!(language = %stderr_context.language, "stderr: {line}");
                    stderr_context.scan_for_readiness(&line);
                }
            }));
        }

        Self {
            id,
            spec,
            root,
            writer_tx,
            event_tx,
            next_request_id: AtomicU64::new(1),
            pending,
            documents: Mutex::new(HashMap::new()),
            state,
            pattern_seen,
            child: Mutex::new(child),
            pid,
            tasks,
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn language(&self) -> &LanguageId {
        &self.spec.id
    }

    #[must_use]
    pub fn spec(&self) -> &LanguageSpec {
        &self.spec
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn closed(&self) -> WardenError {
        WardenError::ProcessCrashed {
            language: self.spec.id.clone(),
            reason: "connection closed".to_string(),
        }
    }

    async fn initialize(&self, timeout: Duration) -> Result<(), WardenError> {
        let handshake = |reason: String| WardenError::HandshakeFailure {
            language: self.spec.id.clone(),
            reason,
        };
        let root_uri = protocol::path_to_file_uri(&self.root).map_err(|e| handshake(e.to_string()))?;
        let root_name = self
            .root
            .file_name()
            .map_or_else(|| "workspace".to_string(), |n| n.to_string_lossy().into_owned());
        let params = protocol::initialize_params(root_uri.as_str(), &root_name);
        let response = self
            .send_request("initialize", Some(params), timeout)
            .await
            .map_err(|e| handshake(format!("{e:#}")))?;
        if let Some(error) = response.get("error") {
            return Err(handshake(
                error["message"].as_str().unwrap_or("unknown error").to_string(),
            ));
        }
        self.send_notification("initialized", Some(json!({})))
            .await
            .map_err(|e| handshake(format!("{e:#}")))?;
        self.state.send_if_modified(|state| {
            if *state != ConnectionState::Starting {
                return false;
            }
            *state = ConnectionState::Initializing;
            true
        });
        tracing::debug!(language = %self.spec.id, "Handshake complete");
        Ok(())
    }

    /// Wait for the settle delay, or for the readiness pattern within the
    /// ready timeout, then move to `Ready`.
    ///
    /// A pattern-gated analyzer that misses its deadline is marked `Failed`
    /// and killed.
    pub async fn await_readiness(&self) -> Result<(), WardenError> {
        if self.state() != ConnectionState::Initializing {
            return match self.state() {
                ConnectionState::Ready => Ok(()),
                _ => Err(self.closed()),
            };
        }
        if self.spec.ready_pattern.is_some() {
            let timeout = self.spec.ready_timeout();
            let mut seen = self.pattern_seen.subscribe();
            let matched = tokio::time::timeout(timeout, async {
                loop {
                    if *seen.borrow_and_update() {
                        return true;
                    }
                    if seen.changed().await.is_err() {
                        return false;
                    }
                }
            })
            .await
            .unwrap_or(false);
            if !matched {
                self.state.send_if_modified(|state| {
                    if state.is_terminal() {
                        return false;
                    }
                    *state = ConnectionState::Failed;
                    true
                });
                self.kill().await;
                return Err(WardenError::StartupTimeout {
                    what: format!("{} analyzer", self.spec.id),
                    timeout,
                });
            }
        } else {
            tokio::time::sleep(self.spec.settle_delay()).await;
        }
        let promoted = self.state.send_if_modified(|state| {
            if *state != ConnectionState::Initializing {
                return false;
            }
            *state = ConnectionState::Ready;
            true
        });
        if promoted || self.state() == ConnectionState::Ready {
            tracing::info!(language = %self.spec.id, "Analyzer ready");
            Ok(())
        } else {
            Err(self.closed())
        }
    }

    async fn send_request(
        &self,
        method: &'static str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_value(Request::new(id, method, params))
            .context("serializing request")?;
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            bail!("writer channel closed");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                bail!("analyzer exited before answering {method}");
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("{method} timed out after {}ms", timeout.as_millis());
            }
        }
    }

    async fn send_notification(&self, method: &'static str, params: Option<Value>) -> Result<()> {
        let frame = serde_json::to_value(Notification::new(method, params))
            .context("serializing notification")?;
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            bail!("writer channel closed");
        }
        Ok(())
    }

    async fn touched(&self, path: &Path) {
        let _ = self
            .event_tx
            .send(LspEvent::Touched {
                path: path.to_path_buf(),
            })
            .await;
    }

    fn uri_for(&self, path: &Path) -> Result<String, WardenError> {
        protocol::path_to_file_uri(path)
            .map(String::from)
            .map_err(|e| WardenError::ProcessCrashed {
                language: self.spec.id.clone(),
                reason: e.to_string(),
            })
    }

    /// `didOpen` with version 1. Opening an open document is a no-op that
    /// returns `false`.
    pub async fn open(&self, path: &Path, text: &str) -> Result<bool, WardenError> {
        let mut documents = self.documents.lock().await;
        if documents.contains_key(path) {
            return Ok(false);
        }
        let uri = self.uri_for(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let params = protocol::did_open_params(&uri, self.spec.document_language_id(ext), 1, text);
        self.touched(path).await;
        self.send_notification("textDocument/didOpen", Some(params))
            .await
            .map_err(|_| self.closed())?;
        documents.insert(
            path.to_path_buf(),
            Document {
                version: 1,
                text: text.to_string(),
            },
        );
        Ok(true)
    }

    /// Full-content `didChange`, opening the document first if needed.
    pub async fn update(&self, path: &Path, text: &str) -> Result<(), WardenError> {
        let mut documents = self.documents.lock().await;
        if !documents.contains_key(path) {
            drop(documents);
            self.open(path, text).await?;
            return Ok(());
        }
        let uri = self.uri_for(path)?;
        let Some(document) = documents.get_mut(path) else {
            return Ok(());
        };
        let version = document.version + 1;
        self.touched(path).await;
        self.send_notification(
            "textDocument/didChange",
            Some(protocol::did_change_params(&uri, version, text)),
        )
        .await
        .map_err(|_| self.closed())?;
        document.version = version;
        document.text = text.to_string();
        Ok(())
    }

    /// `didClose`; returns `false` if the document was not open.
    pub async fn close(&self, path: &Path) -> Result<bool, WardenError> {
        if self.documents.lock().await.remove(path).is_none() {
            return Ok(false);
        }
        let uri = self.uri_for(path)?;
        self.send_notification(
            "textDocument/didClose",
            Some(protocol::did_close_params(&uri)),
        )
        .await
        .map_err(|_| self.closed())?;
        Ok(true)
    }

    /// Whether `text` differs from what was last sent for `path`.
    pub async fn content_differs(&self, path: &Path, text: &str) -> bool {
        self.documents
            .lock()
            .await
            .get(path)
            .is_none_or(|d| d.text != text)
    }

    pub async fn version(&self, path: &Path) -> Option<i32> {
        self.documents.lock().await.get(path).map(|d| d.version)
    }

    pub async fn open_document_count(&self) -> usize {
        self.documents.lock().await.len()
    }

    /// `shutdown` request, `exit` notification, then wait for the process
    /// and kill it if it lingers.
    pub async fn shutdown(&self, timeout: Duration) {
        self.state.send_replace(ConnectionState::Stopped);
        if let Ok(response) = self.send_request("shutdown", None, timeout).await
            && response.get("error").is_none()
        {
            let _ = self.send_notification("exit", None).await;
        }
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

        let mut child = self.child.lock().await;
        if let Some(process) = child.as_mut()
            && tokio::time::timeout(timeout, process.wait()).await.is_err()
        {
            tracing::debug!(language = %self.spec.id, "Analyzer didn't exit in time, killing");
            let _ = process.kill().await;
        }
        *child = None;
    }

    /// Kill the process immediately.
    pub async fn kill(&self) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = ConnectionState::Stopped;
            true
        });
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
        if let Some(mut process) = self.child.lock().await.take() {
            let _ = process.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAnalyzer, FakeOptions, diagnostic, test_spec};
    use warden_types::Severity;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn root() -> PathBuf {
        PathBuf::from("/proj")
    }

    async fn attached(
        options: FakeOptions,
        spec: LanguageSpec,
    ) -> (
        Result<LanguageConnection, WardenError>,
        FakeAnalyzer,
        mpsc::Receiver<LspEvent>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (fake, reader, writer) = FakeAnalyzer::start(options);
        let conn = LanguageConnection::attach(1, spec, &root(), reader, writer, event_tx, TIMEOUT).await;
        (conn, fake, event_rx)
    }

    async fn next_diagnostics(events: &mut mpsc::Receiver<LspEvent>) -> (PathBuf, usize) {
        loop {
            match tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap().unwrap() {
                LspEvent::Diagnostics { path, items, .. } => return (path, items.len()),
                _ => continue,
            }
        }
    }

    #[test]
    fn normalize_removes_dot_segments() {
        assert_eq!(
            normalize_path(Path::new("/proj/src/../../etc/passwd")),
            PathBuf::from("/etc/passwd")
        );
        assert_eq!(normalize_path(Path::new("/proj/./a.ts")), PathBuf::from("/proj/a.ts"));
    }

    #[tokio::test]
    async fn handshake_moves_to_initializing() {
        let (conn, fake, _events) = attached(FakeOptions::default(), test_spec("go", "go")).await;
        let conn = conn.unwrap();
        assert_eq!(conn.state(), ConnectionState::Initializing);
        let methods = fake.wait_for_count("initialized", 1).await;
        assert_eq!(methods[..2], ["initialize".to_string(), "initialized".to_string()]);
    }

    #[tokio::test]
    async fn rejected_initialize_is_handshake_failure() {
        let options = FakeOptions {
            reject_initialize: true,
            ..FakeOptions::default()
        };
        let (conn, _fake, _events) = attached(options, test_spec("go", "go")).await;
        assert!(matches!(conn, Err(WardenError::HandshakeFailure { .. })));
    }

    #[tokio::test]
    async fn silent_analyzer_times_out_handshake() {
        let options = FakeOptions {
            ignore_initialize: true,
            ..FakeOptions::default()
        };
        let (event_tx, _event_rx) = mpsc::channel(8);
        let (_fake, reader, writer) = FakeAnalyzer::start(options);
        let conn = LanguageConnection::attach(
            1,
            test_spec("go", "go"),
            &root(),
            reader,
            writer,
            event_tx,
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(conn, Err(WardenError::HandshakeFailure { .. })));
    }

    #[tokio::test]
    async fn open_is_idempotent_and_versions_increase() {
        let (conn, fake, _events) = attached(FakeOptions::default(), test_spec("go", "go")).await;
        let conn = conn.unwrap();
        let path = Path::new("/proj/main.go");

        assert!(conn.open(path, "package main").await.unwrap());
        assert!(!conn.open(path, "package main").await.unwrap());
        assert_eq!(conn.version(path).await, Some(1));
        assert_eq!(conn.open_document_count().await, 1);

        conn.update(path, "package main\n").await.unwrap();
        conn.update(path, "package main\n\n").await.unwrap();
        assert_eq!(conn.version(path).await, Some(3));
        assert!(!conn.content_differs(path, "package main\n\n").await);

        assert!(conn.close(path).await.unwrap());
        assert!(!conn.close(path).await.unwrap());

        let methods = fake.wait_for_count("textDocument/didClose", 1).await;
        assert_eq!(
            methods
                .iter()
                .filter(|m| *m == "textDocument/didOpen")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn diagnostics_flow_to_events() {
        let (conn, fake, mut events) = attached(FakeOptions::default(), test_spec("go", "go")).await;
        let _conn = conn.unwrap();
        fake.publish(
            Path::new("/proj/main.go"),
            vec![diagnostic(2, Severity::Error, "undefined: x")],
        )
        .await;
        let (path, count) = next_diagnostics(&mut events).await;
        assert_eq!(path, PathBuf::from("/proj/main.go"));
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn diagnostics_outside_root_are_rejected() {
        let (conn, fake, mut events) = attached(FakeOptions::default(), test_spec("go", "go")).await;
        let _conn = conn.unwrap();
        fake.publish(Path::new("/etc/passwd"), vec![diagnostic(0, Severity::Error, "x")])
            .await;
        fake.publish(
            Path::new("/proj/../etc/shadow"),
            vec![diagnostic(0, Severity::Error, "y")],
        )
        .await;
        fake.publish(Path::new("/proj/ok.go"), vec![]).await;
        let (path, _) = next_diagnostics(&mut events).await;
        assert_eq!(path, PathBuf::from("/proj/ok.go"));
    }

    #[tokio::test]
    async fn server_requests_are_answered() {
        let (conn, fake, _events) = attached(FakeOptions::default(), test_spec("python", "py")).await;
        let _conn = conn.unwrap();
        let reply = fake
            .request(
                "workspace/configuration",
                json!({"items": [{"section": "python"}]}),
            )
            .await;
        assert_eq!(reply["result"], json!([null]));
        let reply = fake.request("workspace/applyEdit", json!({})).await;
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn settle_delay_promotes_to_ready() {
        let mut spec = test_spec("go", "go");
        spec.settle_delay_ms = 10;
        let (conn, _fake, _events) = attached(FakeOptions::default(), spec).await;
        let conn = conn.unwrap();
        conn.await_readiness().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn ready_pattern_gates_readiness() {
        let mut spec = test_spec("java", "java");
        spec.ready_pattern = Some("Workspace loaded".to_string());
        spec.ready_timeout_ms = 5_000;
        let (conn, fake, _events) = attached(FakeOptions::default(), spec).await;
        let conn = Arc::new(conn.unwrap());

        let waiting = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.await_readiness().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.state(), ConnectionState::Initializing);
        fake.log("Workspace loaded in 1.2s").await;
        waiting.await.unwrap().unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn missed_ready_pattern_fails_connection() {
        let spec = LanguageSpec {
            ready_pattern: Some("never printed".to_string()),
            ready_timeout_ms: 30,
            ..test_spec("java", "java")
        };
        let (conn, _fake, _events) = attached(FakeOptions::default(), spec).await;
        let conn = conn.unwrap();
        let err = conn.await_readiness().await.unwrap_err();
        assert!(matches!(err, WardenError::StartupTimeout { .. }));
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn crash_emits_stopped_event() {
        let (conn, fake, mut events) = attached(FakeOptions::default(), test_spec("go", "go")).await;
        let conn = conn.unwrap();
        fake.crash();
        let event = loop {
            match tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap().unwrap() {
                LspEvent::Stopped { reason, .. } => break reason,
                _ => continue,
            }
        };
        assert_eq!(event, StopReason::Exited);
        assert_eq!(conn.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_sends_shutdown_and_exit() {
        let (conn, fake, _events) = attached(FakeOptions::default(), test_spec("go", "go")).await;
        let conn = conn.unwrap();
        conn.shutdown(Duration::from_secs(1)).await;
        let methods = fake.wait_for_count("exit", 1).await;
        assert!(methods.contains(&"shutdown".to_string()));
        assert_eq!(conn.state(), ConnectionState::Stopped);
    }
}
