//! Ledger of diagnostics already shown per project, and the "all clear"
//! marker.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use rusqlite::{OptionalExtension, params};
use warden_types::{ProjectHash, WardenError, unix_millis};

use crate::Registry;

impl Registry {
    pub fn displayed_fingerprints(
        &self,
        project: &ProjectHash,
    ) -> Result<HashSet<String>, WardenError> {
        self.with_db("displayed_fingerprints", |db| {
            let mut stmt = db.prepare(
                "SELECT fingerprint FROM displayed_diagnostics WHERE project_hash = ?1",
            )?;
            let set = stmt
                .query_map(params![project.as_str()], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            Ok(set)
        })
    }

    /// Record fingerprints as shown now. Already-known ones keep their
    /// original timestamp.
    pub fn record_displayed(
        &self,
        project: &ProjectHash,
        fingerprints: &[String],
    ) -> Result<(), WardenError> {
        if fingerprints.is_empty() {
            return Ok(());
        }
        let now = unix_millis(SystemTime::now());
        self.with_db("record_displayed", |db| {
            let tx = db.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO displayed_diagnostics
                         (project_hash, fingerprint, first_shown_at)
                     VALUES (?1, ?2, ?3)",
                )?;
                for fingerprint in fingerprints {
                    stmt.execute(params![project.as_str(), fingerprint, now])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Drop ledger entries whose fingerprint is not in `current`, so a
    /// diagnostic that disappears and comes back is shown again. Returns the
    /// number removed.
    pub fn retain_displayed(
        &self,
        project: &ProjectHash,
        current: &HashSet<String>,
    ) -> Result<usize, WardenError> {
        let known = self.displayed_fingerprints(project)?;
        let gone: Vec<&String> = known.iter().filter(|f| !current.contains(*f)).collect();
        if gone.is_empty() {
            return Ok(0);
        }
        self.with_db("retain_displayed", |db| {
            let tx = db.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare(
                    "DELETE FROM displayed_diagnostics
                     WHERE project_hash = ?1 AND fingerprint = ?2",
                )?;
                for fingerprint in &gone {
                    removed += stmt.execute(params![project.as_str(), fingerprint])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
    }

    /// Remove entries older than `ttl` across all projects.
    pub fn prune_displayed(&self, ttl: Duration) -> Result<usize, WardenError> {
        let cutoff = unix_millis(SystemTime::now()).saturating_sub(ttl.as_millis() as i64);
        self.with_db("prune_displayed", |db| {
            Ok(db.execute(
                "DELETE FROM displayed_diagnostics WHERE first_shown_at < ?1",
                params![cutoff],
            )?)
        })
    }

    /// Forget everything shown for `project`, including the clean marker.
    pub fn reset_ledger(&self, project: &ProjectHash) -> Result<(), WardenError> {
        self.with_db("reset_ledger", |db| {
            let tx = db.transaction()?;
            tx.execute(
                "DELETE FROM displayed_diagnostics WHERE project_hash = ?1",
                params![project.as_str()],
            )?;
            tx.execute(
                "DELETE FROM clean_reports WHERE project_hash = ?1",
                params![project.as_str()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Whether "no warnings or errors" was already reported for `project`.
    pub fn clean_reported(&self, project: &ProjectHash) -> Result<bool, WardenError> {
        self.with_db("clean_reported", |db| {
            let found = db
                .query_row(
                    "SELECT 1 FROM clean_reports WHERE project_hash = ?1",
                    params![project.as_str()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn mark_clean(&self, project: &ProjectHash) -> Result<(), WardenError> {
        self.with_db("mark_clean", |db| {
            db.execute(
                "INSERT OR REPLACE INTO clean_reports (project_hash, reported_at) VALUES (?1, ?2)",
                params![project.as_str(), unix_millis(SystemTime::now())],
            )?;
            Ok(())
        })
    }

    pub fn clear_clean(&self, project: &ProjectHash) -> Result<(), WardenError> {
        self.with_db("clear_clean", |db| {
            db.execute(
                "DELETE FROM clean_reports WHERE project_hash = ?1",
                params![project.as_str()],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fps(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn record_is_idempotent_and_scoped_per_project() {
        let registry = Registry::open_in_memory().unwrap();
        let a = ProjectHash::from_raw("aaaaaaaaaaaaaaaa");
        let b = ProjectHash::from_raw("bbbbbbbbbbbbbbbb");
        registry.record_displayed(&a, &fps(&["x", "y"])).unwrap();
        registry.record_displayed(&a, &fps(&["y"])).unwrap();
        assert_eq!(registry.displayed_fingerprints(&a).unwrap().len(), 2);
        assert!(registry.displayed_fingerprints(&b).unwrap().is_empty());
    }

    #[test]
    fn retain_drops_vanished_fingerprints() {
        let registry = Registry::open_in_memory().unwrap();
        let p = ProjectHash::from_raw("cccccccccccccccc");
        registry.record_displayed(&p, &fps(&["x", "y", "z"])).unwrap();
        let current: HashSet<String> = fps(&["y"]).into_iter().collect();
        assert_eq!(registry.retain_displayed(&p, &current).unwrap(), 2);
        assert_eq!(registry.displayed_fingerprints(&p).unwrap(), current);
    }

    #[test]
    fn prune_by_age() {
        let registry = Registry::open_in_memory().unwrap();
        let p = ProjectHash::from_raw("dddddddddddddddd");
        registry.record_displayed(&p, &fps(&["old"])).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        registry.record_displayed(&p, &fps(&["new"])).unwrap();
        assert_eq!(registry.prune_displayed(Duration::from_millis(10)).unwrap(), 1);
        assert_eq!(
            registry.displayed_fingerprints(&p).unwrap(),
            HashSet::from(["new".to_string()])
        );
    }

    #[test]
    fn clean_marker_lifecycle() {
        let registry = Registry::open_in_memory().unwrap();
        let p = ProjectHash::from_raw("eeeeeeeeeeeeeeee");
        assert!(!registry.clean_reported(&p).unwrap());
        registry.mark_clean(&p).unwrap();
        registry.mark_clean(&p).unwrap();
        assert!(registry.clean_reported(&p).unwrap());
        registry.clear_clean(&p).unwrap();
        assert!(!registry.clean_reported(&p).unwrap());

        registry.mark_clean(&p).unwrap();
        registry.record_displayed(&p, &fps(&["x"])).unwrap();
        registry.reset_ledger(&p).unwrap();
        assert!(!registry.clean_reported(&p).unwrap());
        assert!(registry.displayed_fingerprints(&p).unwrap().is_empty());
    }
}
