//! Warden CLI - binary entry point.
//!
//! ```text
//! warden check [PATH]   -> Coordinator -> DaemonHost -> warden serve (per project)
//!                                                        |
//!                                                        v
//!                                    ProjectService -> Supervisor -> analyzers
//! ```
//!
//! `check` finds the project root for `PATH`, makes sure exactly one daemon
//! serves it, and prints what the daemon reports. Everything else is fleet
//! housekeeping.

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::SystemTime;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use warden_cli::{DaemonHost, ServeOptions, logging, serve};
use warden_config::{ToolPaths, WardenConfig};
use warden_core::{Coordinator, CoordinatorConfig, find_project_root};
use warden_lsp::LanguageTable;
use warden_registry::Registry;
use warden_types::{CollectionResult, LanguageId, normalize_root};

#[derive(Parser)]
#[command(
    name = "warden",
    about = "Language-server fleet supervisor and diagnostic aggregator",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon for one project (normally launched by `check`)
    Serve {
        #[arg(long)]
        root: PathBuf,
        /// Control socket path [default: one per project under the tool dir]
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Report diagnostics: new ones for a project, or all of one file's
    Check {
        /// File or directory [default: current directory]
        path: Option<PathBuf>,
        /// Print the raw result as JSON
        #[arg(long)]
        json: bool,
    },
    /// List running daemons and recent fleet events
    Status {
        /// How many recent events to show
        #[arg(long, default_value_t = 5)]
        events: usize,
    },
    /// Stop the daemon for a project
    Stop {
        /// Project directory [default: current directory]
        #[arg(long)]
        root: Option<PathBuf>,
        /// Stop every running daemon
        #[arg(long, conflicts_with = "root")]
        all: bool,
    },
    /// Reap dead daemons, restart silent ones, and enforce the fleet ceiling
    Reap,
    /// Show already-reported diagnostics again on the next project check
    ResetDedup {
        /// Project directory [default: current directory]
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let Some(paths) = ToolPaths::discover() else {
        eprintln!("warden: cannot determine a home directory; set WARDEN_HOME");
        return ExitCode::FAILURE;
    };
    if let Err(e) = warden_utils::ensure_secure_dir(paths.root()) {
        eprintln!("warden: {e:#}");
        return ExitCode::FAILURE;
    }
    logging::init(&paths.log_file());

    let config = WardenConfig::load_from(&paths.config_file()).unwrap_or_else(|e| {
        eprintln!("warden: {e}; using defaults");
        WardenConfig::default()
    });

    match run(cli.command, &paths, &config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("warden: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, paths: &ToolPaths, config: &WardenConfig) -> Result<ExitCode> {
    match command {
        Commands::Serve { root, socket } => {
            serve(ServeOptions { root, socket }, paths, config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { path, json } => check(&target(path)?, json, paths, config).await,
        Commands::Status { events } => {
            status(&Registry::open(&paths.database())?, events)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stop { root, all } => {
            let coordinator = coordinator(paths, config)?;
            if all {
                let rows = coordinator.registry().list_active()?;
                for row in &rows {
                    coordinator
                        .stop_project(&row.project_root, "stopped by user")
                        .await?;
                }
                println!("Stopped {} daemon(s)", rows.len());
            } else {
                let root = project_root(&target(root)?, config);
                if coordinator.stop_project(&root, "stopped by user").await? {
                    println!("Stopped daemon for {}", root.display());
                } else {
                    println!("No daemon running for {}", root.display());
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reap => {
            let report = coordinator(paths, config)?.liveness_sweep().await?;
            println!(
                "reaped {}, demoted {}, restarted {}, evicted {}",
                report.reaped.len(),
                report.demoted.len(),
                report.restarted.len(),
                report.evicted.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::ResetDedup { root } => {
            let root = project_root(&target(root)?, config);
            coordinator(paths, config)?.reset_dedup(&root)?;
            println!("Cleared reported diagnostics for {}", root.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn coordinator(paths: &ToolPaths, config: &WardenConfig) -> Result<Coordinator<DaemonHost>> {
    let host = DaemonHost::current(paths, config).context("Failed to locate the warden executable")?;
    Ok(Coordinator::new(
        host,
        Registry::open(&paths.database())?,
        paths.clone(),
        LanguageTable::with_overrides(&config.languages),
        CoordinatorConfig::from_config(config),
    ))
}

fn target(path: Option<PathBuf>) -> Result<PathBuf> {
    let path = match path {
        Some(path) => path,
        None => env::current_dir().context("Failed to read the current directory")?,
    };
    Ok(normalize_root(&path))
}

fn project_root(path: &Path, config: &WardenConfig) -> PathBuf {
    find_project_root(path, &LanguageTable::with_overrides(&config.languages))
}

async fn check(path: &Path, json: bool, paths: &ToolPaths, config: &WardenConfig) -> Result<ExitCode> {
    let root = project_root(path, config);
    let file = path.is_file().then_some(path);
    let result = coordinator(paths, config)?
        .collect_diagnostics(&root, file)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&root, &result);
    }
    Ok(if result.counts.errors > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn print_result(root: &Path, result: &CollectionResult) {
    for record in &result.diagnostics {
        println!("{}", record.display_relative_to(root));
    }
    if let Some(summary) = &result.summary {
        println!("{summary}");
    }
    for note in &result.notes {
        eprintln!("note: {note}");
    }
}

fn status(registry: &Registry, events: usize) -> Result<()> {
    let rows = registry.list_active()?;
    let now = SystemTime::now();
    if rows.is_empty() {
        println!("No daemons running");
    }
    for row in &rows {
        let languages: Vec<&str> = row.languages.iter().map(LanguageId::as_str).collect();
        println!(
            "{}  {:<9}  pid {:<7}  quiet {:>4}s  [{}]  {}",
            row.project_hash,
            row.status.as_str(),
            row.pid,
            row.unresponsive_for(now).as_secs(),
            languages.join(","),
            row.project_root.display()
        );
    }
    let stats = registry.statistics()?;
    println!(
        "{} active, {} stopped, {} pending checks, {} shown diagnostics",
        stats.active(),
        stats.stopped,
        stats.pending_checks,
        stats.displayed_diagnostics
    );
    for event in registry.recent_events(events)? {
        let age = now.duration_since(event.created_at).unwrap_or_default();
        println!(
            "  {:>6}s ago  {}  {}  {}",
            age.as_secs(),
            event.project_hash,
            event.kind,
            event.detail
        );
    }
    Ok(())
}
