//! `warden serve`: the long-lived daemon for one project.
//!
//! The daemon owns the project's analyzers and answers the control plane on
//! its socket. It registers itself healthy once the socket is bound, keeps
//! its registry row fresh, and exits when asked to, when signalled, or when
//! its row is taken over by another daemon.

use std::fs;
use std::future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use warden_config::{ToolPaths, WardenConfig};
use warden_core::{
    Coordinator, CoordinatorConfig, CpuGuard, ProjectService, detect_languages, spawn_cpu_guard,
    spawn_liveness_loop,
};
use warden_lsp::LanguageTable;
use warden_registry::Registry;
use warden_types::{ProjectHash, ServerStatus, normalize_root};
use warden_utils::ChildCpuSampler;

use crate::control::{self, ControlState};
use crate::host::DaemonHost;
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub root: PathBuf,
    /// Defaults to the tool directory's socket for the project.
    pub socket: Option<PathBuf>,
}

/// Run the daemon until shutdown.
pub async fn serve(options: ServeOptions, paths: &ToolPaths, config: &WardenConfig) -> Result<()> {
    let root = normalize_root(&options.root);
    let hash = ProjectHash::of(&root);
    let socket = options.socket.unwrap_or_else(|| paths.socket_for(&hash));
    let pid = std::process::id();

    warden_utils::ensure_secure_dir(paths.root())?;
    let registry = Registry::open(&paths.database())?;
    let table = LanguageTable::with_overrides(&config.languages);
    let service = ProjectService::new(&root, table.clone(), registry.clone(), config);

    let listener = control::bind_socket(&socket)?;
    let languages = detect_languages(&root, &table);
    registry.register(&root, &languages, pid, &socket)?;
    registry.set_status(&hash, ServerStatus::Healthy)?;
    registry.record_response(&hash)?;
    tracing::info!(
        project = %hash,
        root = %root.display(),
        socket = %socket.display(),
        pid,
        "Daemon listening"
    );

    let shutdown = Arc::new(Notify::new());
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    tasks.push(tokio::spawn({
        let service = service.clone();
        async move {
            service.start().await;
        }
    }));
    tasks.push(spawn_heartbeat(
        registry.clone(),
        hash.clone(),
        pid,
        config.daemon.heartbeat_interval(),
        Arc::clone(&shutdown),
    ));
    if config.cpu_guard.enabled {
        tasks.push(spawn_cpu_guard(
            ChildCpuSampler::for_current_process(),
            CpuGuard::from_config(&config.cpu_guard),
            config.cpu_guard.interval(),
            |child| {
                if let Err(e) = warden_utils::force_kill(child) {
                    tracing::warn!(pid = child, "Failed to kill runaway analyzer: {e}");
                }
            },
        ));
    }
    let host = DaemonHost::current(paths, config).context("Failed to locate the warden executable")?;
    let coordinator = Coordinator::new(
        host,
        registry.clone(),
        paths.clone(),
        table,
        CoordinatorConfig::from_config(config),
    );
    tasks.push(spawn_liveness_loop(coordinator, config.fleet.liveness_interval()));

    let limiter = RateLimiter::new(
        config.daemon.rate_limit_requests,
        config.daemon.rate_limit_window(),
    );
    let app = control::router(ControlState::new(
        service.clone(),
        limiter,
        Arc::clone(&shutdown),
    ));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("Control plane failed");

    for task in &tasks {
        task.abort();
    }
    service.shutdown().await;
    release(&registry, &hash, pid, &socket);
    tracing::info!(project = %hash, "Daemon stopped");
    served
}

/// Mark our row stopped and remove the socket, unless another daemon has
/// already taken both over.
fn release(registry: &Registry, hash: &ProjectHash, pid: u32, socket: &Path) {
    let ours = match registry.get_by_hash(hash) {
        Ok(Some(row)) => row.pid == pid,
        Ok(None) => true,
        Err(e) => {
            tracing::warn!(project = %hash, "Could not read registry on exit: {e}");
            true
        }
    };
    if !ours {
        tracing::info!(project = %hash, "Row belongs to a newer daemon; leaving it alone");
        return;
    }
    if let Err(e) = registry.mark_stopped(hash, "shutdown") {
        tracing::warn!(project = %hash, "Failed to mark daemon stopped: {e}");
    }
    match fs::remove_file(socket) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(socket = %socket.display(), "Failed to remove socket: {e}"),
    }
}

/// Stamp the registry row every `every`. Signals shutdown once the row is
/// stopped or owned by another pid.
fn spawn_heartbeat(
    registry: Registry,
    hash: ProjectHash,
    pid: u32,
    every: Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match registry.get_by_hash(&hash) {
                Ok(Some(row)) if row.pid == pid && row.status.is_active() => {
                    if let Err(e) = registry.heartbeat(&hash) {
                        tracing::warn!(project = %hash, "Heartbeat failed: {e}");
                    }
                }
                Ok(_) => {
                    tracing::info!(project = %hash, "Registry row stopped or taken over; exiting");
                    shutdown.notify_one();
                    return;
                }
                Err(e) => tracing::warn!(project = %hash, "Heartbeat failed: {e}"),
            }
        }
    })
}

async fn shutdown_signal(requested: Arc<Notify>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {e}");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {e}");
                future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        () = requested.notified() => tracing::info!("Shutdown requested"),
        () = ctrl_c => tracing::info!("Interrupted"),
        () = terminate => tracing::info!("Terminated"),
    }
}
