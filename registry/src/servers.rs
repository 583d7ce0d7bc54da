//! Daemon rows: registration, start claims, heartbeats, status and reaping.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use warden_types::{
    LanguageId, ProjectHash, ServerInstance, ServerStatus, WardenError, from_unix_millis,
    normalize_root, unix_millis,
};
use warden_utils::ProcessLiveness;

use crate::Registry;
use crate::events::{EventKind, log_event};

const SERVER_COLUMNS: &str = "project_hash, project_root, languages, pid, socket_path, \
                              start_time, last_heartbeat, last_response, status";

/// Insert-or-replace of a full row. Callers append a `WHERE` to make the
/// replacement conditional.
const UPSERT: &str = "INSERT INTO servers (project_hash, project_root, languages, pid, socket_path,
                                           start_time, last_heartbeat, last_response, status)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6, 'starting')
     ON CONFLICT(project_hash) DO UPDATE SET
         project_root = excluded.project_root,
         languages = excluded.languages,
         pid = excluded.pid,
         socket_path = excluded.socket_path,
         start_time = excluded.start_time,
         last_heartbeat = excluded.last_heartbeat,
         last_response = excluded.last_response,
         status = excluded.status";

/// What one [`Registry::reap_dead`] pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    /// Rows whose pid was gone, now `stopped`.
    pub stopped: Vec<ProjectHash>,
    /// Healthy rows that stopped answering, now `unhealthy`.
    pub unhealthy: Vec<ProjectHash>,
}

impl ReapOutcome {
    #[must_use]
    pub fn count(&self) -> usize {
        self.stopped.len() + self.unhealthy.len()
    }
}

fn languages_json(languages: &[LanguageId]) -> anyhow::Result<String> {
    serde_json::to_string(languages).context("Failed to encode languages")
}

fn conversion_error(
    index: usize,
    err: impl Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<ServerInstance> {
    let languages: String = row.get(2)?;
    let languages: Vec<LanguageId> =
        serde_json::from_str(&languages).map_err(|e| conversion_error(2, e))?;
    let status: String = row.get(8)?;
    let status: ServerStatus = status.parse().map_err(|e| conversion_error(8, e))?;
    let pid: i64 = row.get(3)?;
    Ok(ServerInstance {
        project_hash: ProjectHash::from_raw(row.get::<_, String>(0)?),
        project_root: PathBuf::from(row.get::<_, String>(1)?),
        languages,
        pid: u32::try_from(pid).unwrap_or_default(),
        socket_path: PathBuf::from(row.get::<_, String>(4)?),
        start_time: from_unix_millis(row.get(5)?),
        last_heartbeat: from_unix_millis(row.get(6)?),
        last_response: from_unix_millis(row.get(7)?),
        status,
    })
}

fn now_millis() -> i64 {
    unix_millis(SystemTime::now())
}

fn select_by_hash(db: &Connection, hash: &ProjectHash) -> anyhow::Result<Option<ServerInstance>> {
    db.query_row(
        &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE project_hash = ?1"),
        params![hash.as_str()],
        server_from_row,
    )
    .optional()
    .context("Failed to read server row")
}

impl Registry {
    /// Record a running daemon for `root`. Replaces any earlier row for the
    /// same project (a restart); never adds a second one.
    pub fn register(
        &self,
        root: &Path,
        languages: &[LanguageId],
        pid: u32,
        socket: &Path,
    ) -> Result<ProjectHash, WardenError> {
        let root = normalize_root(root);
        let hash = ProjectHash::of(&root);
        self.with_db("register", |db| {
            let tx = db.transaction()?;
            tx.execute(
                UPSERT,
                params![
                    hash.as_str(),
                    root.to_string_lossy(),
                    languages_json(languages)?,
                    i64::from(pid),
                    socket.to_string_lossy(),
                    now_millis(),
                ],
            )?;
            let names: Vec<&str> = languages.iter().map(LanguageId::as_str).collect();
            log_event(
                &tx,
                &hash,
                EventKind::ServerStarted,
                &format!("pid {pid} [{}]", names.join(", ")),
            )?;
            tx.commit()?;
            Ok(())
        })?;
        tracing::debug!(project = %hash, pid, "Registered daemon");
        Ok(hash)
    }

    /// Claim the right to start the daemon for `root`.
    ///
    /// One conditional upsert: succeeds only if there is no row, the row is
    /// `stopped`, or it is a `starting` claim whose heartbeat is older than
    /// `stale_after`. Exactly one of several racing processes wins.
    pub fn claim_start(
        &self,
        root: &Path,
        languages: &[LanguageId],
        claimant_pid: u32,
        socket: &Path,
        stale_after: Duration,
    ) -> Result<bool, WardenError> {
        let root = normalize_root(root);
        let hash = ProjectHash::of(&root);
        let now = now_millis();
        let cutoff = now.saturating_sub(stale_after.as_millis() as i64);
        let claimed = self.with_db("claim_start", |db| {
            let tx = db.transaction()?;
            let changed = tx.execute(
                &format!(
                    "{UPSERT}
                     WHERE servers.status = 'stopped'
                        OR (servers.status = 'starting' AND servers.last_heartbeat < ?7)"
                ),
                params![
                    hash.as_str(),
                    root.to_string_lossy(),
                    languages_json(languages)?,
                    i64::from(claimant_pid),
                    socket.to_string_lossy(),
                    now,
                    cutoff,
                ],
            )?;
            if changed == 1 {
                log_event(
                    &tx,
                    &hash,
                    EventKind::StatusChanged,
                    &format!("start claimed by pid {claimant_pid}"),
                )?;
            }
            tx.commit()?;
            Ok(changed == 1)
        })?;
        tracing::debug!(project = %hash, claimant_pid, claimed, "Start claim");
        Ok(claimed)
    }

    pub fn get_by_hash(&self, hash: &ProjectHash) -> Result<Option<ServerInstance>, WardenError> {
        self.with_db("get_by_hash", |db| select_by_hash(db, hash))
    }

    pub fn get_by_root(&self, root: &Path) -> Result<Option<ServerInstance>, WardenError> {
        self.get_by_hash(&ProjectHash::of(root))
    }

    /// Daemon-side liveness stamp. Returns `false` if the row is missing or
    /// stopped.
    pub fn heartbeat(&self, hash: &ProjectHash) -> Result<bool, WardenError> {
        self.with_db("heartbeat", |db| {
            let changed = db.execute(
                "UPDATE servers SET last_heartbeat = ?1
                 WHERE project_hash = ?2 AND status != 'stopped'",
                params![now_millis(), hash.as_str()],
            )?;
            Ok(changed == 1)
        })
    }

    /// The daemon answered a health probe.
    pub fn record_response(&self, hash: &ProjectHash) -> Result<bool, WardenError> {
        self.with_db("record_response", |db| {
            let now = now_millis();
            let changed = db.execute(
                "UPDATE servers SET last_response = ?1, last_heartbeat = ?1
                 WHERE project_hash = ?2 AND status != 'stopped'",
                params![now, hash.as_str()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Returns whether the status changed.
    pub fn set_status(&self, hash: &ProjectHash, status: ServerStatus) -> Result<bool, WardenError> {
        self.with_db("set_status", |db| {
            let tx = db.transaction()?;
            let changed = tx.execute(
                "UPDATE servers SET status = ?1 WHERE project_hash = ?2 AND status != ?1",
                params![status.as_str(), hash.as_str()],
            )?;
            if changed == 1 {
                log_event(&tx, hash, EventKind::StatusChanged, status.as_str())?;
            }
            tx.commit()?;
            Ok(changed == 1)
        })
    }

    /// Transition to `stopped`. Returns `false` if already stopped or absent.
    pub fn mark_stopped(&self, hash: &ProjectHash, reason: &str) -> Result<bool, WardenError> {
        self.with_db("mark_stopped", |db| stop_row(db, hash, None, reason))
    }

    /// Every row not `stopped`, least recently responsive first.
    pub fn list_active(&self) -> Result<Vec<ServerInstance>, WardenError> {
        self.with_db("list_active", |db| {
            let mut stmt = db.prepare(&format!(
                "SELECT {SERVER_COLUMNS} FROM servers
                 WHERE status != 'stopped'
                 ORDER BY last_response ASC, project_hash ASC"
            ))?;
            let rows = stmt
                .query_map([], server_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Stop rows whose process is gone and demote healthy rows that have
    /// not answered for `stale_after`.
    pub fn reap_dead(
        &self,
        liveness: &dyn ProcessLiveness,
        stale_after: Duration,
    ) -> Result<ReapOutcome, WardenError> {
        let now = SystemTime::now();
        let mut outcome = ReapOutcome::default();
        for instance in self.list_active()? {
            let hash = &instance.project_hash;
            if !liveness.is_alive(instance.pid) {
                let stopped = self.with_db("reap_dead", |db| {
                    stop_row(db, hash, Some(instance.pid), "process not alive")
                })?;
                if stopped {
                    tracing::info!(project = %hash, pid = instance.pid, "Reaped dead daemon");
                    outcome.stopped.push(hash.clone());
                }
            } else if instance.status == ServerStatus::Healthy
                && instance.unresponsive_for(now) > stale_after
                && self.set_status(hash, ServerStatus::Unhealthy)?
            {
                tracing::warn!(
                    project = %hash,
                    silent_secs = instance.unresponsive_for(now).as_secs(),
                    "Daemon stopped answering"
                );
                outcome.unhealthy.push(hash.clone());
            }
        }
        Ok(outcome)
    }
}

/// Stop one row, optionally only while it still belongs to `pid` so a
/// concurrent re-registration is not clobbered.
fn stop_row(
    db: &mut Connection,
    hash: &ProjectHash,
    pid: Option<u32>,
    reason: &str,
) -> anyhow::Result<bool> {
    let tx = db.transaction()?;
    let changed = match pid {
        Some(pid) => tx.execute(
            "UPDATE servers SET status = 'stopped'
             WHERE project_hash = ?1 AND pid = ?2 AND status != 'stopped'",
            params![hash.as_str(), i64::from(pid)],
        )?,
        None => tx.execute(
            "UPDATE servers SET status = 'stopped'
             WHERE project_hash = ?1 AND status != 'stopped'",
            params![hash.as_str()],
        )?,
    };
    if changed == 1 {
        log_event(&tx, hash, EventKind::ServerStopped, reason)?;
    }
    tx.commit()?;
    Ok(changed == 1)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    struct FakeLiveness(HashSet<u32>);

    impl ProcessLiveness for FakeLiveness {
        fn is_alive(&self, pid: u32) -> bool {
            self.0.contains(&pid)
        }
    }

    fn langs() -> Vec<LanguageId> {
        vec![LanguageId::new("typescript"), LanguageId::new("python")]
    }

    #[test]
    fn register_twice_keeps_one_row() {
        let registry = Registry::open_in_memory().unwrap();
        let root = Path::new("/work/app");
        let first = registry
            .register(root, &langs(), 100, Path::new("/run/a.sock"))
            .unwrap();
        let second = registry
            .register(root, &langs()[..1], 200, Path::new("/run/b.sock"))
            .unwrap();
        assert_eq!(first, second);

        let active = registry.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].pid, 200);
        assert_eq!(active[0].socket_path, PathBuf::from("/run/b.sock"));
        assert_eq!(active[0].languages, vec![LanguageId::new("typescript")]);
        assert_eq!(active[0].status, ServerStatus::Starting);
        assert_eq!(registry.statistics().unwrap().total, 1);
    }

    #[test]
    fn missing_rows_are_none() {
        let registry = Registry::open_in_memory().unwrap();
        assert!(registry.get_by_root(Path::new("/nowhere")).unwrap().is_none());
        let hash = ProjectHash::from_raw("0000000000000000");
        assert!(!registry.heartbeat(&hash).unwrap());
        assert!(!registry.mark_stopped(&hash, "test").unwrap());
    }

    #[test]
    fn status_transitions_and_stop() {
        let registry = Registry::open_in_memory().unwrap();
        let hash = registry
            .register(Path::new("/w"), &langs(), 1, Path::new("/s"))
            .unwrap();
        assert!(registry.set_status(&hash, ServerStatus::Healthy).unwrap());
        assert!(!registry.set_status(&hash, ServerStatus::Healthy).unwrap());
        assert!(registry.mark_stopped(&hash, "shutdown").unwrap());
        assert!(!registry.mark_stopped(&hash, "shutdown").unwrap());
        assert!(!registry.heartbeat(&hash).unwrap());
        assert!(registry.list_active().unwrap().is_empty());
        // Rows are never deleted.
        assert_eq!(
            registry.get_by_hash(&hash).unwrap().unwrap().status,
            ServerStatus::Stopped
        );
    }

    #[test]
    fn claim_only_succeeds_once_until_stopped() {
        let registry = Registry::open_in_memory().unwrap();
        let root = Path::new("/w/claim");
        let stale = Duration::from_secs(30);
        assert!(registry.claim_start(root, &langs(), 10, Path::new("/s"), stale).unwrap());
        assert!(!registry.claim_start(root, &langs(), 11, Path::new("/s"), stale).unwrap());

        let hash = ProjectHash::of(root);
        registry.set_status(&hash, ServerStatus::Healthy).unwrap();
        assert!(!registry.claim_start(root, &langs(), 12, Path::new("/s"), stale).unwrap());

        registry.mark_stopped(&hash, "gone").unwrap();
        assert!(registry.claim_start(root, &langs(), 13, Path::new("/s"), stale).unwrap());
        assert_eq!(registry.get_by_hash(&hash).unwrap().unwrap().pid, 13);
    }

    #[test]
    fn stale_starting_claim_can_be_taken_over() {
        let registry = Registry::open_in_memory().unwrap();
        let root = Path::new("/w/stale");
        assert!(registry
            .claim_start(root, &langs(), 10, Path::new("/s"), Duration::from_secs(30))
            .unwrap());
        std::thread::sleep(Duration::from_millis(20));
        assert!(registry
            .claim_start(root, &langs(), 11, Path::new("/s"), Duration::from_millis(5))
            .unwrap());
    }

    #[test]
    fn reap_stops_dead_pids_and_demotes_silent_ones() {
        let registry = Registry::open_in_memory().unwrap();
        let dead = registry
            .register(Path::new("/w/dead"), &langs(), 41, Path::new("/s1"))
            .unwrap();
        let silent = registry
            .register(Path::new("/w/silent"), &langs(), 42, Path::new("/s2"))
            .unwrap();
        let fine = registry
            .register(Path::new("/w/fine"), &langs(), 43, Path::new("/s3"))
            .unwrap();
        for hash in [&dead, &silent, &fine] {
            registry.set_status(hash, ServerStatus::Healthy).unwrap();
        }
        std::thread::sleep(Duration::from_millis(30));
        registry.record_response(&fine).unwrap();

        let liveness = FakeLiveness(HashSet::from([42, 43]));
        let outcome = registry
            .reap_dead(&liveness, Duration::from_millis(20))
            .unwrap();
        assert_eq!(outcome.stopped, vec![dead.clone()]);
        assert_eq!(outcome.unhealthy, vec![silent.clone()]);
        assert_eq!(outcome.count(), 2);

        let status = |h: &ProjectHash| registry.get_by_hash(h).unwrap().unwrap().status;
        assert_eq!(status(&dead), ServerStatus::Stopped);
        assert_eq!(status(&silent), ServerStatus::Unhealthy);
        assert_eq!(status(&fine), ServerStatus::Healthy);

        let again = registry
            .reap_dead(&liveness, Duration::from_millis(20))
            .unwrap();
        assert_eq!(again.count(), 0);
    }

    #[test]
    fn list_active_orders_least_responsive_first() {
        let registry = Registry::open_in_memory().unwrap();
        let a = registry
            .register(Path::new("/w/a"), &langs(), 1, Path::new("/a"))
            .unwrap();
        let b = registry
            .register(Path::new("/w/b"), &langs(), 2, Path::new("/b"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        registry.record_response(&a).unwrap();
        let order: Vec<ProjectHash> = registry
            .list_active()
            .unwrap()
            .into_iter()
            .map(|i| i.project_hash)
            .collect();
        assert_eq!(order, vec![b, a]);
    }
}
