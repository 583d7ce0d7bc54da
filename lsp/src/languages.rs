//! The language table: which analyzer handles which files, and how.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use warden_types::{LanguageId, LanguageOverride, LanguageSpec};

struct Builtin {
    id: &'static str,
    command: &'static str,
    args: &'static [&'static str],
    extensions: &'static [&'static str],
    document_ids: &'static [(&'static str, &'static str)],
    root_markers: &'static [&'static str],
    settle_delay_ms: u64,
    suppress_empty_updates: bool,
    process_signature: Option<&'static str>,
    install_hint: &'static str,
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        id: "typescript",
        command: "typescript-language-server",
        args: &["--stdio"],
        extensions: &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
        document_ids: &[
            ("tsx", "typescriptreact"),
            ("js", "javascript"),
            ("jsx", "javascriptreact"),
            ("mjs", "javascript"),
            ("cjs", "javascript"),
        ],
        root_markers: &["tsconfig.json", "jsconfig.json", "package.json"],
        settle_delay_ms: 1_500,
        suppress_empty_updates: false,
        process_signature: None,
        install_hint: "npm install -g typescript typescript-language-server",
    },
    Builtin {
        id: "python",
        command: "pyright-langserver",
        args: &["--stdio"],
        extensions: &["py", "pyi"],
        document_ids: &[],
        root_markers: &[
            "pyproject.toml",
            "setup.py",
            "setup.cfg",
            "requirements.txt",
            "pyrightconfig.json",
        ],
        settle_delay_ms: 2_000,
        // Pyright publishes empty batches while it re-checks dependents.
        suppress_empty_updates: true,
        process_signature: Some("pyright"),
        install_hint: "npm install -g pyright",
    },
    Builtin {
        id: "go",
        command: "gopls",
        args: &[],
        extensions: &["go"],
        document_ids: &[],
        root_markers: &["go.mod", "go.work"],
        settle_delay_ms: 1_000,
        suppress_empty_updates: false,
        process_signature: None,
        install_hint: "go install golang.org/x/tools/gopls@latest",
    },
    Builtin {
        id: "rust",
        command: "rust-analyzer",
        args: &[],
        extensions: &["rs"],
        document_ids: &[],
        root_markers: &["Cargo.toml"],
        settle_delay_ms: 3_000,
        suppress_empty_updates: false,
        process_signature: None,
        install_hint: "rustup component add rust-analyzer",
    },
    Builtin {
        id: "lua",
        command: "lua-language-server",
        args: &[],
        extensions: &["lua"],
        document_ids: &[],
        root_markers: &[".luarc.json", ".luarc.jsonc"],
        settle_delay_ms: 1_000,
        suppress_empty_updates: false,
        process_signature: None,
        install_hint: "install lua-language-server from your package manager",
    },
    Builtin {
        id: "java",
        command: "jdtls",
        args: &[],
        extensions: &["java"],
        document_ids: &[],
        root_markers: &["pom.xml", "build.gradle", "build.gradle.kts"],
        settle_delay_ms: 8_000,
        suppress_empty_updates: false,
        process_signature: Some("jdtls"),
        install_hint: "install eclipse.jdt.ls and put `jdtls` on PATH",
    },
    Builtin {
        id: "scala",
        command: "metals",
        args: &[],
        extensions: &["scala", "sc", "sbt"],
        document_ids: &[],
        root_markers: &["build.sbt", "build.sc"],
        settle_delay_ms: 8_000,
        suppress_empty_updates: false,
        process_signature: Some("metals"),
        install_hint: "cs install metals",
    },
    Builtin {
        id: "cpp",
        command: "clangd",
        args: &["--background-index"],
        extensions: &["c", "h", "cc", "cpp", "cxx", "hpp", "hh"],
        document_ids: &[("c", "c"), ("h", "c")],
        root_markers: &["compile_commands.json", "CMakeLists.txt", ".clangd"],
        settle_delay_ms: 1_500,
        suppress_empty_updates: false,
        process_signature: None,
        install_hint: "install clangd from LLVM",
    },
];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

impl Builtin {
    fn to_spec(&self) -> LanguageSpec {
        LanguageSpec {
            id: LanguageId::new(self.id),
            command: self.command.to_string(),
            args: strings(self.args),
            extensions: strings(self.extensions),
            document_language_ids: self
                .document_ids
                .iter()
                .map(|(ext, id)| ((*ext).to_string(), (*id).to_string()))
                .collect(),
            root_markers: strings(self.root_markers),
            settle_delay_ms: self.settle_delay_ms,
            ready_pattern: None,
            ready_timeout_ms: self.settle_delay_ms + 30_000,
            suppress_empty_updates: self.suppress_empty_updates,
            process_signature: self.process_signature.map(ToString::to_string),
            install_hint: Some(self.install_hint.to_string()),
        }
    }
}

/// Every analyzer Warden knows, keyed by id, plus an extension index.
#[derive(Debug, Clone, Default)]
pub struct LanguageTable {
    specs: BTreeMap<LanguageId, LanguageSpec>,
    by_extension: HashMap<String, LanguageId>,
}

impl LanguageTable {
    #[must_use]
    pub fn builtin() -> Self {
        Self::from_specs(BUILTINS.iter().map(Builtin::to_spec))
    }

    /// Built-ins with configuration applied: overrides patch known entries,
    /// complete overrides add new languages, `disabled` removes one.
    #[must_use]
    pub fn with_overrides(overrides: &BTreeMap<String, LanguageOverride>) -> Self {
        let mut specs: BTreeMap<LanguageId, LanguageSpec> = BUILTINS
            .iter()
            .map(|b| (LanguageId::new(b.id), b.to_spec()))
            .collect();
        for (id, over) in overrides {
            let id = LanguageId::new(id.as_str());
            if over.disabled {
                specs.remove(&id);
                continue;
            }
            match specs.remove(&id) {
                Some(spec) => {
                    specs.insert(id, over.apply(spec));
                }
                None => match over.into_spec(id.clone()) {
                    Some(spec) => {
                        specs.insert(id, spec);
                    }
                    None => {
                        tracing::warn!(
                            language = %id,
                            "Ignoring language override without command and extensions"
                        );
                    }
                },
            }
        }
        Self::from_specs(specs.into_values())
    }

    /// Build from explicit specs. Extension clashes go to the first language
    /// in id order.
    pub fn from_specs(specs: impl IntoIterator<Item = LanguageSpec>) -> Self {
        let specs: BTreeMap<LanguageId, LanguageSpec> =
            specs.into_iter().map(|s| (s.id.clone(), s)).collect();
        let mut by_extension = HashMap::new();
        for spec in specs.values() {
            for ext in &spec.extensions {
                let ext = ext.to_ascii_lowercase();
                if let Some(existing) = by_extension.get(&ext) {
                    tracing::warn!(
                        "Extension '{ext}' claimed by both '{existing}' and '{}'; using '{existing}'",
                        spec.id
                    );
                    continue;
                }
                by_extension.insert(ext, spec.id.clone());
            }
        }
        Self {
            specs,
            by_extension,
        }
    }

    #[must_use]
    pub fn get(&self, id: &LanguageId) -> Option<&LanguageSpec> {
        self.specs.get(id)
    }

    #[must_use]
    pub fn for_extension(&self, ext: &str) -> Option<&LanguageSpec> {
        self.by_extension
            .get(&ext.to_ascii_lowercase())
            .and_then(|id| self.specs.get(id))
    }

    #[must_use]
    pub fn for_path(&self, path: &Path) -> Option<&LanguageSpec> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|ext| self.for_extension(ext))
    }

    pub fn specs(&self) -> impl Iterator<Item = &LanguageSpec> {
        self.specs.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &LanguageId> {
        self.specs.keys()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Whether the analyzer binary for `id` is on `PATH`.
    #[must_use]
    pub fn is_installed(&self, id: &LanguageId) -> bool {
        self.get(id)
            .is_some_and(|spec| which::which(&spec.command).is_ok())
    }
}
