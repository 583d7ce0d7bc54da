//! Per-file diagnostic store, fed by the supervisor's event consumer.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use warden_types::{DiagnosticRecord, LanguageId, display_order};

struct FileDiagnostics {
    language: LanguageId,
    records: Vec<DiagnosticRecord>,
}

#[derive(Default)]
pub struct DiagnosticStore {
    files: HashMap<PathBuf, FileDiagnostics>,
    /// Documents opened or changed since their last non-empty batch.
    touched: HashSet<PathBuf>,
}

impl DiagnosticStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_touched(&mut self, path: PathBuf) {
        self.touched.insert(path);
    }

    /// Replace the diagnostics for `path`. Returns whether the batch was
    /// applied.
    ///
    /// With `suppress_empty`, an empty batch that would erase a non-empty
    /// set is ignored unless the document was touched since that set
    /// arrived. Some analyzers publish spurious empty batches while
    /// reindexing.
    pub fn apply(
        &mut self,
        language: &LanguageId,
        path: PathBuf,
        records: Vec<DiagnosticRecord>,
        suppress_empty: bool,
    ) -> bool {
        if records.is_empty() {
            let has_existing = self.files.get(&path).is_some_and(|f| !f.records.is_empty());
            if suppress_empty && has_existing && !self.touched.contains(&path) {
                tracing::debug!(
                    language = %language,
                    path = %path.display(),
                    "Ignoring empty diagnostics batch"
                );
                return false;
            }
            self.files.remove(&path);
            return true;
        }
        self.touched.remove(&path);
        self.files.insert(
            path,
            FileDiagnostics {
                language: language.clone(),
                records,
            },
        );
        true
    }

    /// Drop everything a stopped analyzer reported.
    pub fn forget_language(&mut self, language: &LanguageId) {
        self.files.retain(|_, f| &f.language != language);
    }

    /// Reportable (error/warning) diagnostics for one file.
    #[must_use]
    pub fn for_file(&self, path: &Path) -> Vec<DiagnosticRecord> {
        let mut out: Vec<DiagnosticRecord> = self
            .files
            .get(path)
            .map(|f| {
                f.records
                    .iter()
                    .filter(|r| r.severity().is_reportable())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(display_order);
        out
    }

    /// Reportable diagnostics for every file under `root` not excluded by
    /// `is_ignored`, in display order.
    pub fn collect_all(
        &self,
        root: &Path,
        is_ignored: impl Fn(&Path) -> bool,
    ) -> Vec<DiagnosticRecord> {
        let mut out: Vec<DiagnosticRecord> = self
            .files
            .iter()
            .filter(|(path, _)| path.starts_with(root) && !is_ignored(path))
            .flat_map(|(_, f)| f.records.iter())
            .filter(|r| r.severity().is_reportable())
            .cloned()
            .collect();
        out.sort_by(display_order);
        out
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.touched.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::Severity;

    fn record(path: &str, line: u32, severity: Severity) -> DiagnosticRecord {
        DiagnosticRecord::new(
            PathBuf::from(path),
            line,
            0,
            severity,
            format!("problem on {line}"),
            "test".to_string(),
        )
    }

    fn py() -> LanguageId {
        LanguageId::new("python")
    }

    #[test]
    fn empty_batch_clears_by_default() {
        let mut store = DiagnosticStore::new();
        let path = PathBuf::from("/p/a.go");
        store.apply(&py(), path.clone(), vec![record("/p/a.go", 1, Severity::Error)], false);
        assert!(store.apply(&py(), path.clone(), Vec::new(), false));
        assert!(store.for_file(&path).is_empty());
    }

    #[test]
    fn suppressed_empty_batch_keeps_previous_set() {
        let mut store = DiagnosticStore::new();
        let path = PathBuf::from("/p/a.py");
        store.apply(&py(), path.clone(), vec![record("/p/a.py", 1, Severity::Error)], true);
        assert!(!store.apply(&py(), path.clone(), Vec::new(), true));
        assert_eq!(store.for_file(&path).len(), 1);
    }

    #[test]
    fn touched_document_accepts_empty_batch() {
        let mut store = DiagnosticStore::new();
        let path = PathBuf::from("/p/a.py");
        store.apply(&py(), path.clone(), vec![record("/p/a.py", 1, Severity::Error)], true);
        store.mark_touched(path.clone());
        assert!(store.apply(&py(), path.clone(), Vec::new(), true));
        assert!(store.for_file(&path).is_empty());
    }

    #[test]
    fn non_empty_batch_resets_touch() {
        let mut store = DiagnosticStore::new();
        let path = PathBuf::from("/p/a.py");
        store.mark_touched(path.clone());
        store.apply(&py(), path.clone(), vec![record("/p/a.py", 1, Severity::Error)], true);
        assert!(!store.apply(&py(), path, Vec::new(), true));
    }

    #[test]
    fn collect_all_filters_root_severity_and_ignores() {
        let mut store = DiagnosticStore::new();
        let lang = LanguageId::new("typescript");
        store.apply(
            &lang,
            PathBuf::from("/p/src/b.ts"),
            vec![
                record("/p/src/b.ts", 3, Severity::Warning),
                record("/p/src/b.ts", 9, Severity::Hint),
            ],
            false,
        );
        store.apply(&lang, PathBuf::from("/p/src/a.ts"), vec![record("/p/src/a.ts", 7, Severity::Error)], false);
        store.apply(
            &lang,
            PathBuf::from("/p/node_modules/x/index.ts"),
            vec![record("/p/node_modules/x/index.ts", 1, Severity::Error)],
            false,
        );
        store.apply(&lang, PathBuf::from("/other/c.ts"), vec![record("/other/c.ts", 1, Severity::Error)], false);

        let all = store.collect_all(Path::new("/p"), |p| {
            p.components().any(|c| c.as_os_str() == "node_modules")
        });
        let summary: Vec<(String, Severity)> = all
            .iter()
            .map(|r| (r.file_path().display().to_string(), r.severity()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("/p/src/a.ts".to_string(), Severity::Error),
                ("/p/src/b.ts".to_string(), Severity::Warning),
            ]
        );
    }

    #[test]
    fn forget_language_drops_only_its_files() {
        let mut store = DiagnosticStore::new();
        store.apply(&py(), PathBuf::from("/p/a.py"), vec![record("/p/a.py", 1, Severity::Error)], false);
        let go = LanguageId::new("go");
        store.apply(&go, PathBuf::from("/p/a.go"), vec![record("/p/a.go", 1, Severity::Error)], false);
        store.forget_language(&py());
        assert_eq!(store.file_count(), 1);
        assert_eq!(store.for_file(Path::new("/p/a.go")).len(), 1);
    }
}
