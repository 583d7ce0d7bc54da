//! File checks deferred until a project's analyzers are ready.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use rusqlite::{Connection, Row, TransactionBehavior, params};
use warden_types::{PendingFileCheck, WardenError, from_unix_millis, unix_millis};

use crate::Registry;

const PENDING_COLUMNS: &str = "file_full_path, file_rel_path, project_root, created_at, checked";

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingFileCheck> {
    Ok(PendingFileCheck {
        file_full_path: PathBuf::from(row.get::<_, String>(0)?),
        file_rel_path: PathBuf::from(row.get::<_, String>(1)?),
        project_root: PathBuf::from(row.get::<_, String>(2)?),
        created_at: from_unix_millis(row.get(3)?),
        checked: row.get::<_, i64>(4)? != 0,
    })
}

fn select_unchecked(
    db: &Connection,
    filter: &str,
    root: &str,
    limit: i64,
) -> rusqlite::Result<Vec<PendingFileCheck>> {
    let mut stmt = db.prepare(&format!(
        "SELECT {PENDING_COLUMNS} FROM pending_file_checks
         WHERE checked = 0 AND {filter}
         ORDER BY created_at ASC, file_full_path ASC
         LIMIT ?2"
    ))?;
    stmt.query_map(params![root, limit], pending_from_row)?
        .collect()
}

impl Registry {
    /// Queue `file` for a later check. Re-queuing the same path replaces the
    /// earlier entry.
    pub fn enqueue_pending(&self, file: &Path, project_root: &Path) -> Result<(), WardenError> {
        let rel = file.strip_prefix(project_root).unwrap_or(file);
        self.with_db("enqueue_pending", |db| {
            db.execute(
                "INSERT OR REPLACE INTO pending_file_checks
                     (file_full_path, file_rel_path, project_root, created_at, checked)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![
                    file.to_string_lossy(),
                    rel.to_string_lossy(),
                    project_root.to_string_lossy(),
                    unix_millis(SystemTime::now()),
                ],
            )?;
            Ok(())
        })
    }

    /// Unchecked entries for `project_root`, oldest first.
    pub fn pending_for(&self, project_root: &Path) -> Result<Vec<PendingFileCheck>, WardenError> {
        let root = project_root.to_string_lossy();
        self.with_db("pending_for", |db| {
            Ok(select_unchecked(db, "project_root = ?1", &root, i64::MAX)?)
        })
    }

    /// Take unchecked entries, marking them checked: everything for
    /// `project_root` first, then up to `other_sample` entries from other
    /// projects if time remains. A zero `budget` takes nothing.
    pub fn drain_pending(
        &self,
        project_root: &Path,
        budget: Duration,
        other_sample: usize,
    ) -> Result<Vec<PendingFileCheck>, WardenError> {
        if budget.is_zero() {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + budget;
        let root = project_root.to_string_lossy();
        self.with_db("drain_pending", |db| {
            let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut taken = select_unchecked(&tx, "project_root = ?1", &root, i64::MAX)?;
            if other_sample > 0 && Instant::now() < deadline {
                taken.extend(select_unchecked(
                    &tx,
                    "project_root != ?1",
                    &root,
                    other_sample as i64,
                )?);
            }
            {
                let mut stmt = tx.prepare(
                    "UPDATE pending_file_checks SET checked = 1 WHERE file_full_path = ?1",
                )?;
                for entry in &taken {
                    stmt.execute(params![entry.file_full_path.to_string_lossy()])?;
                }
            }
            tx.commit()?;
            Ok(taken)
        })
    }

    pub fn mark_checked(&self, file: &Path) -> Result<bool, WardenError> {
        self.with_db("mark_checked", |db| {
            let changed = db.execute(
                "UPDATE pending_file_checks SET checked = 1
                 WHERE file_full_path = ?1 AND checked = 0",
                params![file.to_string_lossy()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Mark entries older than `max_age` as checked without checking them.
    pub fn expire_pending(&self, max_age: Duration) -> Result<usize, WardenError> {
        let cutoff = unix_millis(SystemTime::now()).saturating_sub(max_age.as_millis() as i64);
        self.with_db("expire_pending", |db| {
            Ok(db.execute(
                "UPDATE pending_file_checks SET checked = 1
                 WHERE checked = 0 AND created_at < ?1",
                params![cutoff],
            )?)
        })
    }
}
