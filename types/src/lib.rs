//! Core domain types for Warden.
//!
//! This crate contains pure domain types with no async and minimal
//! dependencies. Everything here can be used from any layer: the registry,
//! the language-server supervisor, the coordinator and the control plane all
//! speak these types.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod diagnostic;
mod error;
mod ids;
mod language;
mod server;

pub use diagnostic::{
    CollectionResult, DiagnosticCounts, DiagnosticRecord, NO_ISSUES_SUMMARY, Severity,
    display_order, format_summary,
};
pub use error::WardenError;
pub use ids::{LanguageId, ProjectHash, normalize_root};
pub use language::{LanguageOverride, LanguageSpec};
pub use server::{
    HealthReport, LanguageHealth, PendingFileCheck, ServerInstance, ServerStatus,
    UnknownStatusError, from_unix_millis, unix_millis,
};
