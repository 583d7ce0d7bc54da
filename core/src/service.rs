//! Daemon-side collection for one project.
//!
//! A [`ProjectService`] wraps the project's [`Supervisor`] with everything a
//! control-plane request needs: language detection at startup, opening files
//! in bounded batches, the settle window, ignore rules and the deduplicator.
//! Identical concurrent collections share one run.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use warden_config::{CollectConfig, WardenConfig};
use warden_lsp::{BackoffPolicy, LanguageTable, Supervisor, SupervisorConfig};
use warden_registry::Registry;
use warden_types::{
    CollectionResult, HealthReport, LanguageId, ProjectHash, ServerStatus, WardenError,
};
use warden_utils::InFlight;

use crate::dedup::Deduplicator;
use crate::discovery::discover_files;
use crate::ignore_rules::IgnoreRules;
use crate::project::detect_languages;

type ProjectOutcome = Result<CollectionResult, WardenError>;

/// Supervisor settings derived from the configuration file.
#[must_use]
pub fn supervisor_config(config: &WardenConfig) -> SupervisorConfig {
    SupervisorConfig {
        handshake_timeout: config.daemon.handshake_timeout(),
        shutdown_timeout: config.daemon.shutdown_timeout(),
        backoff: BackoffPolicy {
            base: Duration::from_millis(config.backoff.base_ms),
            max_delay: Duration::from_millis(config.backoff.max_ms),
            max_failures: config.backoff.max_failures,
        },
        kill_orphans: true,
    }
}

struct Inner {
    root: PathBuf,
    hash: ProjectHash,
    supervisor: Supervisor,
    dedup: Deduplicator,
    collect: CollectConfig,
    started_at: Instant,
    languages: Mutex<Vec<LanguageId>>,
    file_collections: InFlight<PathBuf, CollectionResult>,
    project_collections: InFlight<ProjectHash, ProjectOutcome>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct ProjectService {
    inner: Arc<Inner>,
}

impl ProjectService {
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(root: &Path, table: LanguageTable, registry: Registry, config: &WardenConfig) -> Self {
        let supervisor = Supervisor::new(root, table, supervisor_config(config));
        Self::with_supervisor(supervisor, registry, config)
    }

    /// Wrap an existing supervisor, e.g. one with attached transports.
    #[must_use]
    pub fn with_supervisor(supervisor: Supervisor, registry: Registry, config: &WardenConfig) -> Self {
        let root = supervisor.root().to_path_buf();
        let dedup = Deduplicator::new(registry, config.dedup.page_size, config.dedup.ledger_ttl());
        Self {
            inner: Arc::new(Inner {
                hash: ProjectHash::of(&root),
                root,
                supervisor,
                dedup,
                collect: config.collect.clone(),
                started_at: Instant::now(),
                languages: Mutex::new(Vec::new()),
                file_collections: InFlight::new(),
                project_collections: InFlight::new(),
            }),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    #[must_use]
    pub fn project_hash(&self) -> &ProjectHash {
        &self.inner.hash
    }

    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    /// Languages this project is served in.
    #[must_use]
    pub fn languages(&self) -> Vec<LanguageId> {
        let mut languages: BTreeSet<LanguageId> = locked(&self.inner.languages).iter().cloned().collect();
        languages.extend(self.inner.supervisor.languages());
        languages.into_iter().collect()
    }

    /// Detect the project's languages and start an analyzer for each.
    /// Failures are logged and left to the supervisor's backoff; returns
    /// the languages that started.
    pub async fn start(&self) -> Vec<LanguageId> {
        let root = self.inner.root.clone();
        let table = self.inner.supervisor.table().clone();
        let detected = tokio::task::spawn_blocking(move || detect_languages(&root, &table))
            .await
            .unwrap_or_default();
        locked(&self.inner.languages).clone_from(&detected);

        let mut started = Vec::new();
        for language in detected {
            match self.inner.supervisor.start_language(&language).await {
                Ok(_) => started.push(language),
                Err(e) => {
                    tracing::warn!(project = %self.inner.hash, language = %language, "Analyzer not started: {e}");
                }
            }
        }
        tracing::info!(
            project = %self.inner.hash,
            root = %self.inner.root.display(),
            languages = ?started,
            "Project analyzers started"
        );
        started
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: ServerStatus::Healthy,
            project_hash: self.inner.hash.clone(),
            uptime: self.inner.started_at.elapsed().as_secs(),
            analyzers_ready: self.inner.supervisor.all_ready(),
            languages: self.inner.supervisor.health(),
        }
    }

    /// Diagnostics for one file. Not deduplicated.
    pub async fn collect_file(&self, path: &Path) -> CollectionResult {
        let inner = Arc::clone(&self.inner);
        let file = path.to_path_buf();
        self.inner
            .file_collections
            .run(file.clone(), move || async move { inner.collect_file(file).await })
            .await
            .unwrap_or_else(|aborted| CollectionResult::soft_failure(Some(path.to_path_buf()), aborted.to_string()))
    }

    /// New diagnostics across the project, through the dedup ledger.
    pub async fn collect_all(&self) -> ProjectOutcome {
        let inner = Arc::clone(&self.inner);
        self.inner
            .project_collections
            .run(self.inner.hash.clone(), move || async move { inner.collect_all().await })
            .await
            .unwrap_or_else(|aborted| Ok(CollectionResult::soft_failure(None, aborted.to_string())))
    }

    pub fn reset_dedup(&self) -> Result<(), WardenError> {
        self.inner.dedup.reset(&self.inner.hash)
    }

    pub async fn shutdown(&self) {
        self.inner.supervisor.shutdown().await;
    }
}

impl Inner {
    async fn collect_file(self: Arc<Self>, file: PathBuf) -> CollectionResult {
        if self.supervisor.language_for(&file).is_none() {
            let mut result = self.dedup.file_result(file, Vec::new());
            result.analyzers_ready = self.supervisor.all_ready();
            result.notes.push("no analyzer handles this file type".to_string());
            return result;
        }
        let mut notes = Vec::new();
        match self.supervisor.refresh(&file).await {
            Ok(true) => tokio::time::sleep(self.collect.settle_window()).await,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(project = %self.hash, path = %file.display(), "File check degraded: {e}");
                notes.push(e.to_string());
            }
        }
        let records = self.supervisor.diagnostics_for(&file);
        let mut result = self.dedup.file_result(file, records);
        result.analyzers_ready = self.supervisor.all_ready();
        result.notes = notes;
        result
    }

    async fn collect_all(self: Arc<Self>) -> ProjectOutcome {
        let deadline = Instant::now() + self.collect.timeout();
        let languages = {
            let mut languages: BTreeSet<LanguageId> = locked(&self.languages).iter().cloned().collect();
            languages.extend(self.supervisor.languages());
            languages.into_iter().collect::<Vec<_>>()
        };
        let files = {
            let root = self.root.clone();
            let table = self.supervisor.table().clone();
            let max_files = self.collect.max_files;
            tokio::task::spawn_blocking(move || discover_files(&root, &table, &languages, max_files))
                .await
                .unwrap_or_default()
        };

        let mut notes = BTreeSet::new();
        let mut sent = 0usize;
        let open_phase = async {
            for batch in files.chunks(self.collect.open_batch_size.max(1)) {
                for file in batch {
                    match self.supervisor.refresh(file).await {
                        Ok(true) => sent += 1,
                        Ok(false) => {}
                        Err(e) => {
                            notes.insert(e.to_string());
                        }
                    }
                }
                tokio::time::sleep(self.collect.open_batch_delay()).await;
            }
        };
        if tokio::time::timeout(self.collect.timeout(), open_phase).await.is_err() {
            let err = WardenError::CollectionTimeout {
                project: self.hash.to_string(),
                timeout: self.collect.timeout(),
            };
            tracing::warn!(project = %self.hash, opened = sent, total = files.len(), "{err}");
            notes.insert(err.to_string());
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let ready = self.supervisor.wait_ready(remaining.max(Duration::from_millis(1))).await;
        if sent > 0 {
            tokio::time::sleep(self.collect.settle_window()).await;
        }

        let ignore = IgnoreRules::load(&self.root);
        let records = self.supervisor.collect_all(|path| ignore.is_ignored(path));
        tracing::debug!(project = %self.hash, files = files.len(), sent, records = records.len(), "Project snapshot taken");
        let mut result = self.dedup.project_result(&self.hash, records)?;
        result.analyzers_ready = ready;
        result.notes.extend(notes);
        Ok(result)
    }
}
