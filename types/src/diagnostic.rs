//! Diagnostic records and collection results.
//!
//! [`DiagnosticRecord`] is what the analyzers produce (after conversion at the
//! protocol boundary); [`CollectionResult`] is what a caller receives.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Summary shown when a project has nothing to report.
pub const NO_ISSUES_SUMMARY: &str = "no warnings or errors";

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error = 1,
    Warning = 2,
    Info = 3,
    Hint = 4,
}

impl Severity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    /// Callers (boundary code) decide the fallback policy.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Info),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    /// Errors and warnings are reported; info and hints are noise.
    #[must_use]
    pub fn is_reportable(self) -> bool {
        matches!(self, Self::Error | Self::Warning)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic reported by an analyzer for an absolute file path.
///
/// Fields are private; external consumers read via accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticRecord {
    file_path: PathBuf,
    /// 0-indexed line number.
    line: u32,
    /// 0-indexed column.
    column: u32,
    severity: Severity,
    message: String,
    /// Source of the diagnostic (e.g. "rustc", "pyright").
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rule_id: Option<String>,
}

impl DiagnosticRecord {
    #[must_use]
    pub fn new(
        file_path: PathBuf,
        line: u32,
        column: u32,
        severity: Severity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            file_path,
            line,
            column,
            severity,
            message,
            source,
            rule_id: None,
        }
    }

    #[must_use]
    pub fn with_rule_id(mut self, rule_id: Option<String>) -> Self {
        self.rule_id = rule_id;
        self
    }

    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// 0-indexed line number.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// 0-indexed column.
    #[must_use]
    pub fn column(&self) -> u32 {
        self.column
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn rule_id(&self) -> Option<&str> {
        self.rule_id.as_deref()
    }

    /// Identity used by the dedup ledger: file, position, severity, message.
    ///
    /// Source and rule id are excluded so that the same problem reported by a
    /// restarted analyzer with a different source tag is not re-announced.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.file_path.to_string_lossy().as_bytes());
        hasher.update(b"|");
        hasher.update(self.line.to_le_bytes());
        hasher.update(b"|");
        hasher.update(self.column.to_le_bytes());
        hasher.update(b"|");
        hasher.update(self.severity.label().as_bytes());
        hasher.update(b"|");
        hasher.update(self.message.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Format as `path:line:col: severity: [source] message` (1-indexed).
    #[must_use]
    pub fn display_relative_to(&self, root: &Path) -> String {
        let path = self.file_path.strip_prefix(root).unwrap_or(&self.file_path);
        let rule = self
            .rule_id
            .as_deref()
            .map(|r| format!(" ({r})"))
            .unwrap_or_default();
        format!(
            "{}:{}:{}: {}: [{}] {}{rule}",
            path.display(),
            self.line + 1,
            self.column + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// Presentation order: errors before warnings, then line, column. The file
/// only breaks ties so the order is total.
#[must_use]
pub fn display_order(a: &DiagnosticRecord, b: &DiagnosticRecord) -> Ordering {
    a.severity
        .cmp(&b.severity)
        .then_with(|| a.line.cmp(&b.line))
        .then_with(|| a.column.cmp(&b.column))
        .then_with(|| a.file_path.cmp(&b.file_path))
}

/// Error/warning tally of a result page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticCounts {
    pub errors: usize,
    pub warnings: usize,
}

impl DiagnosticCounts {
    #[must_use]
    pub fn of(records: &[DiagnosticRecord]) -> Self {
        let mut counts = Self::default();
        for record in records {
            match record.severity() {
                Severity::Error => counts.errors += 1,
                Severity::Warning => counts.warnings += 1,
                Severity::Info | Severity::Hint => {}
            }
        }
        counts
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors == 0 && self.warnings == 0
    }
}

/// Human summary like `2 errors, 1 warning (3 more not shown)`.
#[must_use]
pub fn format_summary(counts: DiagnosticCounts, overflow: usize) -> String {
    fn plural(n: usize, word: &str) -> String {
        if n == 1 {
            format!("1 {word}")
        } else {
            format!("{n} {word}s")
        }
    }

    if counts.is_empty() && overflow == 0 {
        return NO_ISSUES_SUMMARY.to_string();
    }
    let mut parts = Vec::new();
    if counts.errors > 0 {
        parts.push(plural(counts.errors, "error"));
    }
    if counts.warnings > 0 {
        parts.push(plural(counts.warnings, "warning"));
    }
    let mut summary = parts.join(", ");
    if overflow > 0 {
        if summary.is_empty() {
            summary = format!("{overflow} more not shown");
        } else {
            summary.push_str(&format!(" ({overflow} more not shown)"));
        }
    }
    summary
}

/// Answer to "what is wrong with this project/file right now".
///
/// An empty `diagnostics` list with `summary == None` is the suppressed
/// "already told you it's clean" response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionResult {
    /// Set for file-scoped queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    pub diagnostics: Vec<DiagnosticRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub counts: DiagnosticCounts,
    /// New diagnostics that did not fit in this page.
    #[serde(default)]
    pub overflow: usize,
    /// Whether every analyzer for the project had reached `ready`.
    #[serde(default)]
    pub analyzers_ready: bool,
    /// Soft failures and other remarks for the caller's log.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl CollectionResult {
    /// A best-effort empty result carrying a note.
    #[must_use]
    pub fn soft_failure(file: Option<PathBuf>, note: impl Into<String>) -> Self {
        Self {
            file,
            notes: vec![note.into()],
            ..Self::default()
        }
    }

    /// Build a result page from already sorted and capped diagnostics.
    #[must_use]
    pub fn page(file: Option<PathBuf>, diagnostics: Vec<DiagnosticRecord>, overflow: usize) -> Self {
        let counts = DiagnosticCounts::of(&diagnostics);
        Self {
            file,
            summary: Some(format_summary(counts, overflow)),
            diagnostics,
            counts,
            overflow,
            analyzers_ready: false,
            notes: Vec::new(),
        }
    }

    /// Merge another page (e.g. a drained pending check) into this one,
    /// keeping at most `page_size` diagnostics; the rest count as overflow.
    pub fn absorb(&mut self, other: CollectionResult, page_size: usize) {
        let known: HashSet<String> =
            self.diagnostics.iter().map(DiagnosticRecord::fingerprint).collect();
        for record in other.diagnostics {
            if !known.contains(&record.fingerprint()) {
                self.diagnostics.push(record);
            }
        }
        self.diagnostics.sort_by(display_order);
        let page_size = page_size.max(1);
        self.overflow += other.overflow + self.diagnostics.len().saturating_sub(page_size);
        self.diagnostics.truncate(page_size);
        self.counts = DiagnosticCounts::of(&self.diagnostics);
        self.notes.extend(other.notes);
        if !self.diagnostics.is_empty() || self.summary.is_some() {
            self.summary = Some(format_summary(self.counts, self.overflow));
        }
    }
}
