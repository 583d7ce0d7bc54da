use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the root digest.
const PROJECT_HASH_LEN: usize = 16;

/// Stable identity of a project: a digest of its normalized absolute root.
///
/// Two spellings of the same directory (`/a/b/`, `/a/./b`, a symlink to it)
/// hash to the same value, which is what keeps the registry at one row per
/// project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectHash(String);

impl ProjectHash {
    /// Hash a project root. The root is normalized first.
    #[must_use]
    pub fn of(root: &Path) -> Self {
        let normalized = normalize_root(root);
        let digest = Sha256::digest(normalized.to_string_lossy().as_bytes());
        let mut hex = String::with_capacity(PROJECT_HASH_LEN);
        for byte in digest.iter().take(PROJECT_HASH_LEN / 2) {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    /// Wrap an already-computed hash (e.g. read back from storage).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a project root to an absolute path without `.`/`..` segments.
///
/// Existing directories are canonicalized so symlinked spellings collapse;
/// paths that don't exist fall back to lexical normalization.
#[must_use]
pub fn normalize_root(root: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(root) {
        return canonical;
    }
    let absolute = if root.is_absolute() {
        root.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(root))
            .unwrap_or_else(|_| root.to_path_buf())
    };
    let mut out = Vec::new();
    for c in absolute.components() {
        match c {
            Component::ParentDir => {
                if matches!(out.last(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Identifier of a language in the language table (e.g. `"rust"`, `"python"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageId(String);

impl LanguageId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LanguageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LanguageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_across_spellings() {
        let a = ProjectHash::of(Path::new("/nonexistent/warden/proj"));
        let b = ProjectHash::of(Path::new("/nonexistent/warden/./proj/"));
        let c = ProjectHash::of(Path::new("/nonexistent/warden/other/../proj"));
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.as_str().len(), PROJECT_HASH_LEN);
    }

    #[test]
    fn distinct_roots_hash_differently() {
        let a = ProjectHash::of(Path::new("/nonexistent/proj/A"));
        let b = ProjectHash::of(Path::new("/nonexistent/proj/B"));
        assert_ne!(a, b);
    }

    #[test]
    fn existing_dir_is_canonicalized() {
        let dir = tempfile::tempdir().unwrap();
        let dotted = dir.path().join(".");
        assert_eq!(
            ProjectHash::of(dir.path()),
            ProjectHash::of(&dotted),
            "canonical and dotted spellings must agree"
        );
    }

    #[test]
    fn normalize_does_not_escape_root() {
        let normalized = normalize_root(Path::new("/../../nonexistent-x"));
        assert_eq!(normalized, PathBuf::from("/nonexistent-x"));
    }
}
