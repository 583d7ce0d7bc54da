//! The `warden` binary's building blocks: the per-project daemon and its
//! control plane, the client that talks to it, and the host that launches
//! daemons for the coordinator.

pub mod client;
pub mod control;
pub mod daemon;
pub mod host;
pub mod logging;
pub mod rate_limit;

pub use client::ControlClient;
pub use control::{ControlState, bind_socket, router};
pub use daemon::{ServeOptions, serve};
pub use host::DaemonHost;
pub use rate_limit::RateLimiter;
