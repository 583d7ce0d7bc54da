//! Analyzer side of Warden: LSP framing, one connection per analyzer
//! process, and the per-project [`Supervisor`] that owns them.

pub mod backoff;
pub mod codec;
pub mod connection;
pub mod diagnostics;
pub mod languages;
pub mod supervisor;
pub mod types;

pub(crate) mod protocol;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use backoff::{BackoffPolicy, FailureRecord};
pub use connection::LanguageConnection;
pub use diagnostics::DiagnosticStore;
pub use languages::LanguageTable;
pub use supervisor::Supervisor;
pub use types::{ConnectionId, ConnectionState, LspEvent, StopReason, SupervisorConfig};
