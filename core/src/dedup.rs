//! Suppression of diagnostics a project has already been shown.
//!
//! Project-wide results pass through the ledger: each diagnostic is shown
//! once, ordered and paged, and an all-clear is reported once. File-scoped
//! results bypass it so a caller asking about one file always gets the
//! whole picture.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use warden_registry::Registry;
use warden_types::{
    CollectionResult, DiagnosticRecord, ProjectHash, WardenError, display_order,
};

/// Records not yet shown, in display order and capped to one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupPage {
    pub shown: Vec<DiagnosticRecord>,
    /// New records that did not fit in the page.
    pub overflow: usize,
}

#[derive(Clone)]
pub struct Deduplicator {
    registry: Registry,
    page_size: usize,
    ledger_ttl: Duration,
}

impl Deduplicator {
    #[must_use]
    pub fn new(registry: Registry, page_size: usize, ledger_ttl: Duration) -> Self {
        Self {
            registry,
            page_size: page_size.max(1),
            ledger_ttl,
        }
    }

    /// Filter `records` against the project's ledger and record the page
    /// that will be shown.
    ///
    /// Ledger entries past the TTL, and entries whose diagnostic is no
    /// longer in `records`, are dropped first, so a diagnostic that goes
    /// away and comes back is new again.
    pub fn deduplicate(
        &self,
        project: &ProjectHash,
        mut records: Vec<DiagnosticRecord>,
    ) -> Result<DedupPage, WardenError> {
        self.registry.prune_displayed(self.ledger_ttl)?;
        let current: HashSet<String> = records.iter().map(DiagnosticRecord::fingerprint).collect();
        let dropped = self.registry.retain_displayed(project, &current)?;
        if dropped > 0 {
            tracing::debug!(project = %project, dropped, "Resolved diagnostics left the ledger");
        }

        let known = self.registry.displayed_fingerprints(project)?;
        records.retain(|record| !known.contains(&record.fingerprint()));
        records.sort_by(display_order);
        records.dedup();

        let overflow = records.len().saturating_sub(self.page_size);
        records.truncate(self.page_size);
        let fingerprints: Vec<String> = records.iter().map(DiagnosticRecord::fingerprint).collect();
        self.registry.record_displayed(project, &fingerprints)?;
        Ok(DedupPage {
            shown: records,
            overflow,
        })
    }

    /// Admit extra records into a project-wide page that already shows
    /// some: unseen ones are ordered, cut to `room` and recorded. The
    /// ledger is not pruned, since `records` is not a full snapshot.
    pub fn admit(
        &self,
        project: &ProjectHash,
        mut records: Vec<DiagnosticRecord>,
        room: usize,
    ) -> Result<DedupPage, WardenError> {
        let known = self.registry.displayed_fingerprints(project)?;
        records.retain(|record| !known.contains(&record.fingerprint()));
        records.sort_by(display_order);
        records.dedup();

        let overflow = records.len().saturating_sub(room);
        records.truncate(room);
        if !records.is_empty() {
            let fingerprints: Vec<String> =
                records.iter().map(DiagnosticRecord::fingerprint).collect();
            self.registry.record_displayed(project, &fingerprints)?;
            self.registry.clear_clean(project)?;
        }
        Ok(DedupPage {
            shown: records,
            overflow,
        })
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Project-wide result for a fresh snapshot.
    ///
    /// An empty page is reported as "no warnings or errors" the first time
    /// and as an empty, summary-less result afterwards, until something new
    /// shows up or the ledger is reset.
    pub fn project_result(
        &self,
        project: &ProjectHash,
        records: Vec<DiagnosticRecord>,
    ) -> Result<CollectionResult, WardenError> {
        let page = self.deduplicate(project, records)?;
        if !page.shown.is_empty() || page.overflow > 0 {
            self.registry.clear_clean(project)?;
            return Ok(CollectionResult::page(None, page.shown, page.overflow));
        }
        if self.registry.clean_reported(project)? {
            return Ok(CollectionResult::default());
        }
        self.registry.mark_clean(project)?;
        Ok(CollectionResult::page(None, Vec::new(), 0))
    }

    /// File-scoped result: sorted and paged, never filtered or recorded.
    #[must_use]
    pub fn file_result(&self, file: PathBuf, mut records: Vec<DiagnosticRecord>) -> CollectionResult {
        records.sort_by(display_order);
        let overflow = records.len().saturating_sub(self.page_size);
        records.truncate(self.page_size);
        CollectionResult::page(Some(file), records, overflow)
    }

    /// Forget everything shown for the project.
    pub fn reset(&self, project: &ProjectHash) -> Result<(), WardenError> {
        self.registry.reset_ledger(project)?;
        tracing::info!(project = %project, "Dedup ledger reset");
        Ok(())
    }
}
