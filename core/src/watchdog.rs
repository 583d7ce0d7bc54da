//! Fleet liveness, size and CPU enforcement.
//!
//! Each concern runs on its own interval so a slow sweep never delays the
//! CPU guard, and missed ticks are skipped rather than bunched up.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use warden_config::CpuGuardConfig;
use warden_types::{ProjectHash, ServerStatus, WardenError};
use warden_utils::{CpuSample, CpuSampler, ProcessLiveness};

use crate::coordinator::{Coordinator, Inner};
use crate::host::FleetHost;

/// What one liveness sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows whose process was gone.
    pub reaped: Vec<ProjectHash>,
    /// Rows newly marked unhealthy.
    pub demoted: Vec<ProjectHash>,
    /// Unhealthy for too long; stopped and started again.
    pub restarted: Vec<ProjectHash>,
    pub evicted: Vec<ProjectHash>,
}

impl SweepReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty()
            && self.demoted.is_empty()
            && self.restarted.is_empty()
            && self.evicted.is_empty()
    }
}

/// Liveness as the coordinator sees it: its own pid (held by its start
/// claims) is always alive.
struct ClaimAwareLiveness<'a, H>(&'a Inner<H>);

impl<H: FleetHost> ProcessLiveness for ClaimAwareLiveness<'_, H> {
    fn is_alive(&self, pid: u32) -> bool {
        self.0.pid_alive(pid)
    }
}

impl<H: FleetHost> Inner<H> {
    /// Stop least-recently-responsive daemons until at most `limit` are
    /// active. Rows still `starting` and `keep` are never evicted.
    pub(crate) async fn evict_over(
        &self,
        limit: usize,
        keep: Option<&ProjectHash>,
    ) -> Result<Vec<ProjectHash>, WardenError> {
        let active = self.registry.list_active()?;
        let mut excess = active.len().saturating_sub(limit);
        if excess == 0 {
            return Ok(Vec::new());
        }
        let mut evicted = Vec::new();
        for row in &active {
            if excess == 0 {
                break;
            }
            if keep == Some(&row.project_hash) || row.status == ServerStatus::Starting {
                continue;
            }
            self.stop_instance(row, "evicted: fleet ceiling").await?;
            evicted.push(row.project_hash.clone());
            excess -= 1;
        }
        if excess > 0 {
            tracing::warn!(limit, over = excess, "Fleet still over ceiling; remaining daemons are starting");
        }
        tracing::info!(limit, evicted = evicted.len(), "Fleet trimmed");
        Ok(evicted)
    }
}

impl<H: FleetHost> Coordinator<H> {
    /// Evict down to `limit` active daemons, least recently responsive
    /// first.
    pub async fn evict_over(&self, limit: usize) -> Result<Vec<ProjectHash>, WardenError> {
        self.inner.evict_over(limit, None).await
    }

    /// Reap dead daemons, replace ones silent for too long, and enforce the
    /// fleet ceiling.
    pub async fn liveness_sweep(&self) -> Result<SweepReport, WardenError> {
        let inner = &self.inner;
        let reap = inner
            .registry
            .reap_dead(&ClaimAwareLiveness(inner.as_ref()), inner.config.stale_after)?;
        let mut report = SweepReport {
            reaped: reap.stopped,
            demoted: reap.unhealthy,
            ..SweepReport::default()
        };

        let now = SystemTime::now();
        for row in inner.registry.list_active()? {
            if row.status != ServerStatus::Unhealthy
                || row.unresponsive_for(now) <= inner.config.max_unresponsive
            {
                continue;
            }
            // Idle daemons go quiet too; only a failed probe condemns one.
            if inner.probe(&row.project_hash, &row.socket_path).await.is_ok() {
                continue;
            }
            tracing::warn!(
                project = %row.project_hash,
                silent_secs = row.unresponsive_for(now).as_secs(),
                "Restarting unresponsive daemon"
            );
            inner.stop_instance(&row, "unresponsive too long").await?;
            match self.ensure_running(&row.project_root).await {
                Ok(_) => report.restarted.push(row.project_hash.clone()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!(project = %row.project_hash, "Restart failed: {e}"),
            }
        }

        report.evicted = inner.evict_over(inner.config.max_active, None).await?;
        Ok(report)
    }
}

/// Kills processes that stay above a CPU threshold.
///
/// A pid is condemned after `consecutive` samples above the threshold in a
/// row; any sample at or below it starts the count over.
#[derive(Debug, Clone)]
pub struct CpuGuard {
    threshold: f64,
    consecutive: u32,
    strikes: HashMap<u32, u32>,
}

impl CpuGuard {
    #[must_use]
    pub fn new(threshold_percent: f64, consecutive_samples: u32) -> Self {
        Self {
            threshold: threshold_percent,
            consecutive: consecutive_samples.max(1),
            strikes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &CpuGuardConfig) -> Self {
        Self::new(config.threshold_percent, config.consecutive_samples)
    }

    /// Feed one round of samples; returns the pids to kill.
    pub fn observe(&mut self, samples: &[CpuSample]) -> Vec<u32> {
        let seen: HashSet<u32> = samples.iter().map(|s| s.pid).collect();
        self.strikes.retain(|pid, _| seen.contains(pid));

        let mut condemned = Vec::new();
        for sample in samples {
            if sample.cpu_percent <= self.threshold {
                self.strikes.remove(&sample.pid);
                continue;
            }
            let strikes = self.strikes.entry(sample.pid).or_insert(0);
            *strikes += 1;
            if *strikes >= self.consecutive {
                self.strikes.remove(&sample.pid);
                condemned.push(sample.pid);
            }
        }
        condemned
    }

    #[must_use]
    pub fn strikes(&self, pid: u32) -> u32 {
        self.strikes.get(&pid).copied().unwrap_or(0)
    }
}

fn ticker(every: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Run [`Coordinator::liveness_sweep`] every `every` until aborted.
pub fn spawn_liveness_loop<H: FleetHost>(coordinator: Coordinator<H>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            match coordinator.liveness_sweep().await {
                Ok(report) if !report.is_empty() => {
                    tracing::info!(
                        reaped = report.reaped.len(),
                        demoted = report.demoted.len(),
                        restarted = report.restarted.len(),
                        evicted = report.evicted.len(),
                        "Liveness sweep"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Liveness sweep failed: {e}"),
            }
        }
    })
}

/// Sample CPU every `every` and call `kill` for each condemned pid, until
/// aborted.
pub fn spawn_cpu_guard<S, K>(mut sampler: S, mut guard: CpuGuard, every: Duration, mut kill: K) -> JoinHandle<()>
where
    S: CpuSampler + 'static,
    K: FnMut(u32) + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = ticker(every);
        loop {
            interval.tick().await;
            for pid in guard.observe(&sampler.sample()) {
                tracing::warn!(pid, "Process over CPU threshold for too long; killing");
                kill(pid);
            }
        }
    })
}
