//! Host-wide registry of project daemons.
//!
//! One SQLite database under the tool directory records which daemon serves
//! which project root, an audit log of every transition, the per-project
//! ledger of diagnostics already shown, and file checks deferred until a
//! project's analyzers are ready.
//!
//! Every statement touches rows of a single project hash, so concurrent
//! daemons and clients on the same host never contend on more than one row.
//! Storage failures surface as [`WardenError::RegistryUnavailable`]; missing
//! rows are `Ok(None)`.

mod db;
mod events;
mod ledger;
mod pending;
mod servers;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use rusqlite::Connection;
use warden_types::WardenError;

pub use events::{EventKind, RegistryStats, ServerEvent};
pub use servers::ReapOutcome;

/// Handle to the registry database. Clones share one connection.
#[derive(Clone)]
pub struct Registry {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Registry {
    /// Open or create the registry at `path` (owner-only permissions).
    pub fn open(path: &Path) -> Result<Self, WardenError> {
        let db = db::open_file(path).map_err(WardenError::registry)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, WardenError> {
        let db = db::open_memory().map_err(WardenError::registry)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            path: None,
        })
    }

    /// Database file, `None` for in-memory registries.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_db<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut Connection) -> anyhow::Result<T>,
    ) -> Result<T, WardenError> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut db)
            .with_context(|| format!("registry {op}"))
            .map_err(|e| {
                tracing::warn!("{e:#}");
                WardenError::registry(e)
            })
    }
}
