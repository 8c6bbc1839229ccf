//! Session-multiplexed CDP relay server.
//!
//! Accepts ops-protocol websocket clients, multiplexes their automation
//! sessions over per-session CDP routers, and governs admission with
//! resource-pressure-aware caps.
//!
//! The layering:
//!
//! - [`server`] owns the Axum surface (`/ops`, `/health`, `/metrics`) and
//!   process lifecycle.
//! - [`session_loop`] runs one connected client: handshake, dispatch,
//!   heartbeat, cleanup.
//! - [`commands`] is the ops command surface (`session.*`,
//!   `forwardCDPCommand`).
//! - [`runtime`] ties each open session to its CDP router and bridges
//!   router notices back out as pushes and ring-buffer captures.
//! - [`pressure`] samples memory and queue state for the admission
//!   governor and sweeps idle sessions.

#![deny(unsafe_code)]

pub mod broadcast;
pub mod chunker;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod metrics;
pub mod pressure;
pub mod runtime;
pub mod server;
pub mod session_loop;
pub mod shutdown;

pub use broadcast::ConnectionRegistry;
pub use commands::{CommandContext, CommandHandler, CommandRequest, OpsCommandRegistry};
pub use config::RelayConfig;
pub use connection::OpsClientConn;
pub use error::RelayError;
pub use pressure::{MemoryProbe, ProcMemoryProbe, StaticMemoryProbe};
pub use runtime::{DebuggerFactory, SessionDriver, SessionDrivers, SharedDebuggerFactory};
pub use server::{AppState, RelayHandle, RelayServer};
pub use shutdown::ShutdownCoordinator;
