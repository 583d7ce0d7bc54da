//! Language table entries.
//!
//! Each analyzer is described by data, not control flow: adding a language
//! means adding a [`LanguageSpec`], never a new branch in the supervisor.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::LanguageId;

/// How to launch and treat one analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub id: LanguageId,
    /// Executable name or path (resolved on `PATH`).
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// File extensions (without the dot) routed to this analyzer.
    pub extensions: Vec<String>,
    /// LSP `languageId` per extension; extensions not listed use `id`.
    #[serde(default)]
    pub document_language_ids: BTreeMap<String, String>,
    /// Files whose presence marks a project root for this language.
    #[serde(default)]
    pub root_markers: Vec<String>,
    /// Warm-up delay between the handshake and `ready`.
    pub settle_delay_ms: u64,
    /// Substring in the analyzer's log stream that signals readiness.
    #[serde(default)]
    pub ready_pattern: Option<String>,
    /// Upper bound on waiting for `ready_pattern`.
    pub ready_timeout_ms: u64,
    /// Ignore empty diagnostic batches that would erase a non-empty set
    /// while the analyzer is reindexing.
    #[serde(default)]
    pub suppress_empty_updates: bool,
    /// Command-line substring identifying this analyzer in the process table.
    /// Defaults to `command`.
    #[serde(default)]
    pub process_signature: Option<String>,
    /// Shown when the install probe (`command` on `PATH`) fails.
    #[serde(default)]
    pub install_hint: Option<String>,
}

impl LanguageSpec {
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    #[must_use]
    pub fn handles_extension(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }

    /// LSP `languageId` to send in `didOpen` for a file with this extension.
    #[must_use]
    pub fn document_language_id(&self, ext: &str) -> &str {
        self.document_language_ids
            .get(ext)
            .map_or(self.id.as_str(), String::as_str)
    }

    #[must_use]
    pub fn process_signature(&self) -> &str {
        self.process_signature.as_deref().unwrap_or(&self.command)
    }
}

/// Partial language entry from configuration.
///
/// Applied on top of a built-in [`LanguageSpec`], or promoted to a new one
/// when it names a language the table doesn't know and supplies at least a
/// command and extensions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LanguageOverride {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub extensions: Option<Vec<String>>,
    pub root_markers: Option<Vec<String>>,
    pub settle_delay_ms: Option<u64>,
    pub ready_pattern: Option<String>,
    pub ready_timeout_ms: Option<u64>,
    pub suppress_empty_updates: Option<bool>,
    pub process_signature: Option<String>,
    /// Disable the language entirely.
    #[serde(default)]
    pub disabled: bool,
}

impl LanguageOverride {
    /// Overlay this override onto an existing spec.
    #[must_use]
    pub fn apply(&self, mut spec: LanguageSpec) -> LanguageSpec {
        if let Some(command) = &self.command {
            spec.command = command.clone();
        }
        if let Some(args) = &self.args {
            spec.args = args.clone();
        }
        if let Some(extensions) = &self.extensions {
            spec.extensions = extensions.clone();
        }
        if let Some(markers) = &self.root_markers {
            spec.root_markers = markers.clone();
        }
        if let Some(ms) = self.settle_delay_ms {
            spec.settle_delay_ms = ms;
        }
        if let Some(pattern) = &self.ready_pattern {
            spec.ready_pattern = Some(pattern.clone());
        }
        if let Some(ms) = self.ready_timeout_ms {
            spec.ready_timeout_ms = ms;
        }
        if let Some(flag) = self.suppress_empty_updates {
            spec.suppress_empty_updates = flag;
        }
        if let Some(sig) = &self.process_signature {
            spec.process_signature = Some(sig.clone());
        }
        spec
    }

    /// Build a brand-new spec, if enough fields are present.
    #[must_use]
    pub fn into_spec(&self, id: LanguageId) -> Option<LanguageSpec> {
        let command = self.command.clone()?;
        let extensions = self.extensions.clone().filter(|e| !e.is_empty())?;
        let settle_delay_ms = self.settle_delay_ms.unwrap_or(1_000);
        Some(LanguageSpec {
            id,
            command,
            args: self.args.clone().unwrap_or_default(),
            extensions,
            document_language_ids: BTreeMap::new(),
            root_markers: self.root_markers.clone().unwrap_or_default(),
            settle_delay_ms,
            ready_pattern: self.ready_pattern.clone(),
            ready_timeout_ms: self.ready_timeout_ms.unwrap_or(settle_delay_ms + 30_000),
            suppress_empty_updates: self.suppress_empty_updates.unwrap_or(false),
            process_signature: self.process_signature.clone(),
            install_hint: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LanguageSpec {
        LanguageSpec {
            id: LanguageId::new("typescript"),
            command: "typescript-language-server".to_string(),
            args: vec!["--stdio".to_string()],
            extensions: vec!["ts".to_string(), "tsx".to_string()],
            document_language_ids: BTreeMap::from([(
                "tsx".to_string(),
                "typescriptreact".to_string(),
            )]),
            root_markers: vec!["tsconfig.json".to_string()],
            settle_delay_ms: 1_500,
            ready_pattern: None,
            ready_timeout_ms: 30_000,
            suppress_empty_updates: false,
            process_signature: None,
            install_hint: None,
        }
    }

    #[test]
    fn document_language_id_falls_back_to_id() {
        let spec = spec();
        assert_eq!(spec.document_language_id("tsx"), "typescriptreact");
        assert_eq!(spec.document_language_id("ts"), "typescript");
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        assert!(spec().handles_extension("TS"));
        assert!(!spec().handles_extension("rs"));
    }

    #[test]
    fn signature_defaults_to_command() {
        assert_eq!(spec().process_signature(), "typescript-language-server");
    }

    #[test]
    fn override_applies_only_present_fields() {
        let over = LanguageOverride {
            settle_delay_ms: Some(5),
            suppress_empty_updates: Some(true),
            ..LanguageOverride::default()
        };
        let applied = over.apply(spec());
        assert_eq!(applied.settle_delay_ms, 5);
        assert!(applied.suppress_empty_updates);
        assert_eq!(applied.command, "typescript-language-server");
    }

    #[test]
    fn override_needs_command_and_extensions_to_create() {
        let partial = LanguageOverride {
            command: Some("zls".to_string()),
            ..LanguageOverride::default()
        };
        assert!(partial.into_spec(LanguageId::new("zig")).is_none());

        let full = LanguageOverride {
            command: Some("zls".to_string()),
            extensions: Some(vec!["zig".to_string()]),
            ..LanguageOverride::default()
        };
        let spec = full.into_spec(LanguageId::new("zig")).unwrap();
        assert_eq!(spec.settle_delay_ms, 1_000);
        assert!(spec.handles_extension("zig"));
    }
}
