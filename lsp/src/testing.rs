//! In-process fake analyzer for tests.
//!
//! Speaks the real framing over an in-memory duplex pipe: answers the
//! handshake, records everything it receives, publishes canned diagnostics
//! when a matching document is opened or changed, and can be crashed.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;
use warden_types::{LanguageId, LanguageSpec, Severity};

use crate::codec::{FrameReader, FrameWriter, Incoming};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct FakeOptions {
    /// Answer `initialize` with an error.
    pub reject_initialize: bool,
    /// Never answer `initialize`.
    pub ignore_initialize: bool,
}

type Shared<T> = Arc<Mutex<T>>;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FakeAnalyzer {
    outgoing: mpsc::UnboundedSender<Option<Value>>,
    received: Shared<Vec<Value>>,
    canned: Shared<HashMap<String, Vec<Value>>>,
    replies: Shared<HashMap<u64, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn uri_of(path: &Path) -> String {
    Url::from_file_path(path).map_or_else(|()| format!("file://{}", path.display()), String::from)
}

impl FakeAnalyzer {
    /// Returns the fake and the client's ends of the pipe.
    #[must_use]
    pub fn start(
        options: FakeOptions,
    ) -> (Self, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Option<Value>>();
        let received: Shared<Vec<Value>> = Arc::default();
        let canned: Shared<HashMap<String, Vec<Value>>> = Arc::default();
        let replies: Shared<HashMap<u64, oneshot::Sender<Value>>> = Arc::default();

        let writer = tokio::spawn(async move {
            let mut writer = FrameWriter::new(server_write);
            while let Some(Some(frame)) = outgoing_rx.recv().await {
                if writer.write_frame(&frame).await.is_err() {
                    break;
                }
            }
        });

        let reader = tokio::spawn({
            let outgoing = outgoing.clone();
            let received = Arc::clone(&received);
            let canned = Arc::clone(&canned);
            let replies = Arc::clone(&replies);
            async move {
                let mut reader = FrameReader::new(server_read);
                while let Ok(Some(frame)) = reader.read_frame().await {
                    locked(&received).push(frame.clone());
                    match Incoming::classify(&frame) {
                        Some(Incoming::Request { id, method, .. }) => {
                            let reply = match method.as_str() {
                                "initialize" if options.ignore_initialize => continue,
                                "initialize" if options.reject_initialize => json!({
                                    "jsonrpc": "2.0", "id": id,
                                    "error": { "code": -32603, "message": "workspace not supported" }
                                }),
                                "initialize" => json!({
                                    "jsonrpc": "2.0", "id": id,
                                    "result": { "capabilities": { "textDocumentSync": 1 } }
                                }),
                                _ => json!({ "jsonrpc": "2.0", "id": id, "result": null }),
                            };
                            let _ = outgoing.send(Some(reply));
                        }
                        Some(Incoming::Response { id, body }) => {
                            if let Some(tx) = locked(&replies).remove(&id) {
                                let _ = tx.send(body);
                            }
                        }
                        Some(Incoming::Notification { method, params }) => match method.as_str() {
                            "textDocument/didOpen" | "textDocument/didChange" => {
                                let uri = params
                                    .as_ref()
                                    .and_then(|p| p["textDocument"]["uri"].as_str())
                                    .unwrap_or_default()
                                    .to_string();
                                let diagnostics = locked(&canned).get(&uri).cloned();
                                if let Some(diagnostics) = diagnostics {
                                    let _ = outgoing.send(Some(publish_frame(&uri, diagnostics)));
                                }
                            }
                            "exit" => break,
                            _ => {}
                        },
                        None => {}
                    }
                }
                let _ = outgoing.send(None);
            }
        });

        let fake = Self {
            outgoing,
            received,
            canned,
            replies,
            next_id: AtomicU64::new(10_000),
            tasks: Mutex::new(vec![reader, writer]),
        };
        (fake, client_read, client_write)
    }

    /// Diagnostics to publish whenever `path` is opened or changed.
    pub fn set_diagnostics(&self, path: &Path, diagnostics: Vec<Value>) {
        locked(&self.canned).insert(uri_of(path), diagnostics);
    }

    /// Publish diagnostics for `path` right now.
    pub async fn publish(&self, path: &Path, diagnostics: Vec<Value>) {
        let _ = self
            .outgoing
            .send(Some(publish_frame(&uri_of(path), diagnostics)));
        tokio::task::yield_now().await;
    }

    pub async fn log(&self, message: &str) {
        let _ = self.outgoing.send(Some(json!({
            "jsonrpc": "2.0",
            "method": "window/logMessage",
            "params": { "type": 3, "message": message }
        })));
        tokio::task::yield_now().await;
    }

    /// Send a server-initiated request and wait for the client's reply.
    /// `Value::Null` if no reply arrives.
    pub async fn request(&self, method: &str, params: Value) -> Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        locked(&self.replies).insert(id, tx);
        let _ = self.outgoing.send(Some(json!({
            "jsonrpc": "2.0", "id": id, "method": method, "params": params
        })));
        tokio::time::timeout(WAIT, rx)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or(Value::Null)
    }

    /// Methods of every request and notification received so far.
    pub async fn methods(&self) -> Vec<String> {
        tokio::task::yield_now().await;
        locked(&self.received)
            .iter()
            .filter_map(|f| f["method"].as_str().map(ToString::to_string))
            .collect()
    }

    pub async fn count(&self, method: &str) -> usize {
        self.methods().await.iter().filter(|m| *m == method).count()
    }

    /// Wait until `method` was received at least `n` times; returns all
    /// methods seen.
    pub async fn wait_for_count(&self, method: &str, n: usize) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let methods = self.methods().await;
            let seen = methods.iter().filter(|m| *m == method).count();
            if seen >= n || tokio::time::Instant::now() >= deadline {
                return methods;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Drop the pipe without a clean shutdown.
    pub fn crash(&self) {
        for task in locked(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Drop for FakeAnalyzer {
    fn drop(&mut self) {
        self.crash();
    }
}

fn publish_frame(uri: &str, diagnostics: Vec<Value>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "textDocument/publishDiagnostics",
        "params": { "uri": uri, "diagnostics": diagnostics }
    })
}

/// An LSP diagnostic at `line`, column 0.
#[must_use]
pub fn diagnostic(line: u32, severity: Severity, message: &str) -> Value {
    json!({
        "range": {
            "start": { "line": line, "character": 0 },
            "end": { "line": line, "character": 1 }
        },
        "severity": severity as u8,
        "source": "fake",
        "message": message
    })
}

/// A spec for a language handled by a fake analyzer: no settle delay.
#[must_use]
pub fn test_spec(id: &str, extension: &str) -> LanguageSpec {
    LanguageSpec {
        id: LanguageId::new(id),
        command: format!("fake-{id}-analyzer"),
        args: Vec::new(),
        extensions: vec![extension.to_string()],
        document_language_ids: BTreeMap::new(),
        root_markers: Vec::new(),
        settle_delay_ms: 0,
        ready_pattern: None,
        ready_timeout_ms: 1_000,
        suppress_empty_updates: false,
        process_signature: None,
        install_hint: None,
    }
}
