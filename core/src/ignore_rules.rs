//! Which paths never count toward a project's diagnostics.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Build output, dependency and tooling directories excluded everywhere.
pub const DEFAULT_IGNORED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "build",
    "dist",
    ".git",
    "vendor",
    "__pycache__",
    ".venv",
    "venv",
    "out",
    ".gradle",
    ".idea",
    ".next",
    "coverage",
];

/// Root `.gitignore` plus [`DEFAULT_IGNORED_DIRS`].
pub struct IgnoreRules {
    root: PathBuf,
    gitignore: Gitignore,
    defaults: GlobSet,
}

fn default_globs() -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for dir in DEFAULT_IGNORED_DIRS {
        for pattern in [format!("{dir}/**"), format!("**/{dir}/**")] {
            if let Ok(glob) = Glob::new(&pattern) {
                builder.add(glob);
            }
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

impl IgnoreRules {
    /// Load `<root>/.gitignore` if present. A malformed file is logged and
    /// only the defaults apply.
    #[must_use]
    pub fn load(root: &Path) -> Self {
        let mut builder = GitignoreBuilder::new(root);
        let gitignore_path = root.join(".gitignore");
        if gitignore_path.is_file()
            && let Some(err) = builder.add(&gitignore_path)
        {
            tracing::warn!(path = %gitignore_path.display(), "Ignoring malformed .gitignore: {err}");
        }
        let gitignore = builder.build().unwrap_or_else(|e| {
            tracing::warn!(root = %root.display(), "Failed to build ignore rules: {e}");
            Gitignore::empty()
        });
        Self {
            root: root.to_path_buf(),
            gitignore,
            defaults: default_globs(),
        }
    }

    /// Whether a directory entry name is one of the defaults, for pruning
    /// walks early.
    #[must_use]
    pub fn is_default_dir(name: &str) -> bool {
        DEFAULT_IGNORED_DIRS.contains(&name)
    }

    /// Paths outside the root are never ignored by the root's rules.
    #[must_use]
    pub fn is_ignored(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        if self.defaults.is_match(relative) {
            return true;
        }
        self.gitignore
            .matched_path_or_any_parents(relative, false)
            .is_ignore()
    }
}
