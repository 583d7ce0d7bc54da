//! The production [`FleetHost`]: daemons are detached `warden serve`
//! processes reached over their control sockets.

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use warden_config::{TOOL_DIR_ENV, ToolPaths, WardenConfig};
use warden_core::FleetHost;
use warden_types::{CollectionResult, HealthReport, WardenError};
use warden_utils::{KillOutcome, OsLiveness, ProcessLiveness};

use crate::client::ControlClient;

/// Slack on top of the daemon's own collection budget before the client
/// gives up on an answer.
const COLLECT_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DaemonHost {
    exe: PathBuf,
    tool_dir: PathBuf,
    request_timeout: Duration,
    collect_timeout: Duration,
}

impl DaemonHost {
    #[must_use]
    pub fn new(exe: impl Into<PathBuf>, paths: &ToolPaths, config: &WardenConfig) -> Self {
        Self {
            exe: exe.into(),
            tool_dir: paths.root().to_path_buf(),
            request_timeout: config.daemon.health_timeout(),
            collect_timeout: config.collect.timeout() + config.collect.settle_window() + COLLECT_SLACK,
        }
    }

    /// A host that launches the running executable.
    pub fn current(paths: &ToolPaths, config: &WardenConfig) -> io::Result<Self> {
        Ok(Self::new(env::current_exe()?, paths, config))
    }

    fn client(&self, socket: &Path, timeout: Duration) -> ControlClient {
        ControlClient::new(socket, timeout)
    }
}

impl ProcessLiveness for DaemonHost {
    fn is_alive(&self, pid: u32) -> bool {
        OsLiveness.is_alive(pid)
    }
}

impl FleetHost for DaemonHost {
    async fn spawn(&self, root: &Path, socket: &Path) -> Result<u32, WardenError> {
        let mut command = Command::new(&self.exe);
        command
            .arg("serve")
            .arg("--root")
            .arg(root)
            .arg("--socket")
            .arg(socket)
            .env(TOOL_DIR_ENV, &self.tool_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        warden_utils::detach_session(&mut command);

        let mut child = command.spawn().map_err(|e| {
            WardenError::control_plane(format!(
                "failed to launch daemon {}: {e}",
                self.exe.display()
            ))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| WardenError::control_plane("daemon exited before reporting a pid"))?;
        tracing::info!(root = %root.display(), pid, "Launched project daemon");
        // Reap it if it exits while we are still around.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(pid)
    }

    async fn health(&self, socket: &Path) -> Result<HealthReport, WardenError> {
        self.client(socket, self.request_timeout).health().await
    }

    async fn collect(
        &self,
        socket: &Path,
        file: Option<&Path>,
    ) -> Result<CollectionResult, WardenError> {
        self.client(socket, self.collect_timeout)
            .diagnostics(file)
            .await
    }

    async fn shutdown(&self, socket: &Path) -> Result<(), WardenError> {
        self.client(socket, self.request_timeout).shutdown().await
    }

    fn kill(&self, pid: u32) -> bool {
        match warden_utils::force_kill(pid) {
            Ok(KillOutcome::Killed) => true,
            Ok(KillOutcome::NotRunning) => false,
            Err(e) => {
                tracing::warn!(pid, "Failed to kill daemon: {e}");
                false
            }
        }
    }
}
