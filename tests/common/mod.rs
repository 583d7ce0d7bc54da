//! Shared test utilities and fixtures
//!
//! A project daemon's service backed by an in-process fake analyzer.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Notify;
use url::form_urlencoded;
use warden_cli::{ControlState, RateLimiter};
use warden_config::WardenConfig;
use warden_core::{ProjectService, supervisor_config};
use warden_lsp::testing::{FakeAnalyzer, FakeOptions, test_spec};
use warden_lsp::{LanguageTable, Supervisor};
use warden_registry::Registry;
use warden_types::{LanguageId, normalize_root};

pub struct Project {
    pub dir: TempDir,
    pub root: PathBuf,
    pub service: ProjectService,
    pub analyzer: FakeAnalyzer,
}

impl Project {
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Control state with room for `requests` rate-limited calls a minute.
    pub fn control(&self, requests: u32) -> (ControlState, Arc<Notify>) {
        let shutdown = Arc::new(Notify::new());
        let state = ControlState::new(
            self.service.clone(),
            RateLimiter::new(requests, Duration::from_secs(60)),
            Arc::clone(&shutdown),
        );
        (state, shutdown)
    }
}

pub fn config() -> WardenConfig {
    let mut config = WardenConfig::default();
    config.collect.settle_window_ms = 30;
    config.collect.open_batch_delay_ms = 0;
    config.collect.timeout_ms = 2_000;
    config
}

/// A project of `.fk` files whose analyzer reports the given diagnostics.
pub async fn project(files: &[(&str, Vec<Value>)]) -> Project {
    let dir = tempfile::tempdir().unwrap();
    let root = normalize_root(dir.path());
    let config = config();
    let table = LanguageTable::from_specs([test_spec("fake", "fk")]);
    let supervisor = Supervisor::new(&root, table, supervisor_config(&config));
    let (analyzer, reader, writer) = FakeAnalyzer::start(FakeOptions::default());
    for (name, diagnostics) in files {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("// {name}\n")).unwrap();
        analyzer.set_diagnostics(&path, diagnostics.clone());
    }
    supervisor
        .attach_transport(&LanguageId::new("fake"), reader, writer)
        .await
        .unwrap();
    let registry = Registry::open_in_memory().unwrap();
    let service = ProjectService::with_supervisor(supervisor, registry, &config);
    Project {
        dir,
        root,
        service,
        analyzer,
    }
}

/// `/diagnostics?file=...` for `path`.
pub fn file_uri(path: &Path) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("file", &path.to_string_lossy())
        .finish();
    format!("/diagnostics?{query}")
}
