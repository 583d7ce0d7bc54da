//! Append-only audit log of registry mutations, and summary counts.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use anyhow::{Result, anyhow};
use rusqlite::{Connection, params};
use warden_types::{ProjectHash, WardenError, from_unix_millis, unix_millis};

use crate::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ServerStarted,
    StatusChanged,
    ServerStopped,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServerStarted => "server_started",
            Self::StatusChanged => "status_changed",
            Self::ServerStopped => "server_stopped",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "server_started" => Ok(Self::ServerStarted),
            "status_changed" => Ok(Self::StatusChanged),
            "server_stopped" => Ok(Self::ServerStopped),
            other => Err(anyhow!("unknown event kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    pub id: i64,
    pub project_hash: ProjectHash,
    pub kind: EventKind,
    pub detail: String,
    pub created_at: SystemTime,
}

/// Row counts for `warden status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: u64,
    pub starting: u64,
    pub healthy: u64,
    pub unhealthy: u64,
    pub stopped: u64,
    pub events: u64,
    pub pending_checks: u64,
    pub displayed_diagnostics: u64,
}

impl RegistryStats {
    #[must_use]
    pub fn active(&self) -> u64 {
        self.starting + self.healthy + self.unhealthy
    }
}

pub(crate) fn log_event(
    db: &Connection,
    project: &ProjectHash,
    kind: EventKind,
    detail: &str,
) -> rusqlite::Result<()> {
    db.execute(
        "INSERT INTO server_events (project_hash, event, detail, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            project.as_str(),
            kind.as_str(),
            detail,
            unix_millis(SystemTime::now())
        ],
    )?;
    Ok(())
}

fn count(db: &Connection, sql: &str) -> Result<u64> {
    let n: i64 = db.query_row(sql, [], |row| row.get(0))?;
    Ok(n.max(0) as u64)
}

impl Registry {
    /// Newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<ServerEvent>, WardenError> {
        self.with_db("recent_events", |db| {
            let mut stmt = db.prepare(
                "SELECT id, project_hash, event, detail, created_at
                 FROM server_events
                 ORDER BY id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(id, project, kind, detail, created_at)| -> Result<ServerEvent> {
                    Ok(ServerEvent {
                        id,
                        project_hash: ProjectHash::from_raw(project),
                        kind: kind.parse()?,
                        detail,
                        created_at: from_unix_millis(created_at),
                    })
                })
                .collect()
        })
    }

    pub fn statistics(&self) -> Result<RegistryStats, WardenError> {
        self.with_db("statistics", |db| {
            let mut stats = RegistryStats::default();
            let mut stmt = db.prepare("SELECT status, COUNT(*) FROM servers GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (status, n) in rows {
                let n = n.max(0) as u64;
                stats.total += n;
                match status.as_str() {
                    "starting" => stats.starting = n,
                    "healthy" => stats.healthy = n,
                    "unhealthy" => stats.unhealthy = n,
                    "stopped" => stats.stopped = n,
                    _ => {}
                }
            }
            stats.events = count(db, "SELECT COUNT(*) FROM server_events")?;
            stats.pending_checks =
                count(db, "SELECT COUNT(*) FROM pending_file_checks WHERE checked = 0")?;
            stats.displayed_diagnostics = count(db, "SELECT COUNT(*) FROM displayed_diagnostics")?;
            Ok(stats)
        })
    }
}
