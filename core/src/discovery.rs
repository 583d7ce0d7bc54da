//! Project file discovery for project-wide collections.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use warden_lsp::LanguageTable;
use warden_types::LanguageId;

use crate::ignore_rules::IgnoreRules;

/// Files under `root` handled by one of `languages`, sorted and capped at
/// `max_files`. Honors `.gitignore` (even outside a git checkout) and skips
/// the default build and dependency directories.
#[must_use]
pub fn discover_files(
    root: &Path,
    table: &LanguageTable,
    languages: &[LanguageId],
    max_files: usize,
) -> Vec<PathBuf> {
    let wanted: HashSet<&LanguageId> = languages.iter().collect();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(true)
        .require_git(false)
        .filter_entry(|entry| {
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            !(is_dir && IgnoreRules::is_default_dir(&entry.file_name().to_string_lossy()))
        })
        .build();

    let mut files = Vec::new();
    for entry in walker.flatten() {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        let handled = table
            .for_path(path)
            .is_some_and(|spec| wanted.contains(&spec.id));
        if handled {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    if files.len() > max_files {
        tracing::debug!(
            root = %root.display(),
            found = files.len(),
            max_files,
            "Capping discovered files"
        );
        files.truncate(max_files);
    }
    files
}
