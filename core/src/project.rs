//! Project root resolution and language detection.

use std::collections::BTreeSet;
use std::iter;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use warden_lsp::LanguageTable;
use warden_types::{LanguageId, normalize_root};

use crate::ignore_rules::IgnoreRules;

/// Bound on files inspected when detecting languages by extension.
const DETECT_SCAN_LIMIT: usize = 2_000;

/// Depth of the extension scan below the root.
const DETECT_SCAN_DEPTH: usize = 4;

fn has_marker(dir: &Path, markers: &[String]) -> bool {
    markers.iter().any(|marker| dir.join(marker).exists())
}

/// Nearest ancestor of `path` that looks like a project root.
///
/// Markers of the file's own language win over generic ones, so a
/// `Cargo.toml` nested inside a JavaScript monorepo still roots a Rust file
/// at its crate. Falls back to any language's marker or a `.git` entry, then
/// to the file's directory.
#[must_use]
pub fn find_project_root(path: &Path, table: &LanguageTable) -> PathBuf {
    let path = normalize_root(path);
    let start = if path.is_dir() {
        path.as_path()
    } else {
        path.parent().unwrap_or(&path)
    };

    if let Some(spec) = table.for_path(&path)
        && !spec.root_markers.is_empty()
        && let Some(dir) = start
            .ancestors()
            .find(|dir| has_marker(dir, &spec.root_markers))
    {
        return dir.to_path_buf();
    }

    let all_markers: Vec<String> = table
        .specs()
        .flat_map(|spec| spec.root_markers.iter().cloned())
        .chain(iter::once(".git".to_string()))
        .collect();
    start
        .ancestors()
        .find(|dir| has_marker(dir, &all_markers))
        .unwrap_or(start)
        .to_path_buf()
}

/// Languages present in `root`: any whose root marker sits at the root,
/// plus any with a matching file in a shallow, ignore-aware scan.
#[must_use]
pub fn detect_languages(root: &Path, table: &LanguageTable) -> Vec<LanguageId> {
    let mut found: BTreeSet<LanguageId> = table
        .specs()
        .filter(|spec| has_marker(root, &spec.root_markers))
        .map(|spec| spec.id.clone())
        .collect();

    let walker = WalkBuilder::new(root)
        .max_depth(Some(DETECT_SCAN_DEPTH))
        .require_git(false)
        .filter_entry(|entry| {
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            !(is_dir && IgnoreRules::is_default_dir(&entry.file_name().to_string_lossy()))
        })
        .build();
    for entry in walker.flatten().take(DETECT_SCAN_LIMIT) {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        if let Some(spec) = table.for_path(entry.path()) {
            found.insert(spec.id.clone());
        }
    }
    found.into_iter().collect()
}
