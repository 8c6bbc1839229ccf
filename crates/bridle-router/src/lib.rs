//! CDP session multiplexer.
//!
//! The host platform exposes a single flat debugger attachment per tab; a
//! remote CDP client expects the full multi-session surface (root target,
//! auto-attach, flat-session routing). This crate bridges the two: one
//! [`CdpRouter`] owns the physical attachment and multiplexes N logical
//! sessions onto it, answering browser-level methods locally, recovering
//! from stale tab ids through a bounded fallback ladder, and pumping native
//! events back out scoped to live logical sessions.
//!
//! Platform access goes through the [`DebuggerApi`] trait; the scriptable
//! [`FakeDebugger`] implements it for tests and stub deployments.

#![deny(unsafe_code)]

pub mod attachment;
pub mod debugger;
pub mod decode;
pub mod error;
pub mod fake;
pub mod local;
pub mod router;
pub mod sessions;
pub mod targets;

pub use attachment::{PhysicalAttachment, attach_with_fallback};
pub use debugger::{DebuggerApi, DebuggerError, DebuggerNotice};
pub use decode::{Nested, decode_nested};
pub use error::RouterError;
pub use fake::FakeDebugger;
pub use router::{CdpEvent, CdpRouter, RouterNotice};
pub use sessions::{LogicalSession, SessionLink, SessionTable};
pub use targets::{TargetInfo, TargetTable};
