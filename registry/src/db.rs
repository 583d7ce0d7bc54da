//! Connection setup and schema for the registry database.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::Connection;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS servers (
        project_hash TEXT PRIMARY KEY,
        project_root TEXT NOT NULL,
        languages TEXT NOT NULL,
        pid INTEGER NOT NULL,
        socket_path TEXT NOT NULL,
        start_time INTEGER NOT NULL,
        last_heartbeat INTEGER NOT NULL,
        last_response INTEGER NOT NULL,
        status TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_servers_status
    ON servers(status);

    -- Audit trail only; nothing reads it for correctness
    CREATE TABLE IF NOT EXISTS server_events (
        id INTEGER PRIMARY KEY,
        project_hash TEXT NOT NULL,
        event TEXT NOT NULL,
        detail TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_server_events_project
    ON server_events(project_hash);

    CREATE TABLE IF NOT EXISTS displayed_diagnostics (
        project_hash TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        first_shown_at INTEGER NOT NULL,
        PRIMARY KEY (project_hash, fingerprint)
    );

    CREATE INDEX IF NOT EXISTS idx_displayed_shown
    ON displayed_diagnostics(first_shown_at);

    CREATE TABLE IF NOT EXISTS clean_reports (
        project_hash TEXT PRIMARY KEY,
        reported_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS pending_file_checks (
        file_full_path TEXT PRIMARY KEY,
        file_rel_path TEXT NOT NULL,
        project_root TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        checked INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_pending_project
    ON pending_file_checks(project_root, checked);
";

/// Open the database at `path`, creating it owner-only if missing.
pub(crate) fn open_file(path: &Path) -> Result<Connection> {
    warden_utils::ensure_secure_file(path)?;
    let db = Connection::open(path)
        .with_context(|| format!("Failed to open registry at {}", path.display()))?;
    initialize(&db)?;
    // WAL sidecars appear on first write; tighten them too.
    warden_utils::ensure_secure_file(path)?;
    Ok(db)
}

pub(crate) fn open_memory() -> Result<Connection> {
    let db = Connection::open_in_memory().context("Failed to open in-memory registry")?;
    initialize(&db)?;
    Ok(db)
}

fn initialize(db: &Connection) -> Result<()> {
    db.busy_timeout(BUSY_TIMEOUT)
        .context("Failed to set registry busy timeout")?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        .context("Failed to set registry pragmas")?;
    db.execute_batch(SCHEMA)
        .context("Failed to create registry schema")?;
    Ok(())
}
