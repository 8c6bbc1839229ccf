//! Session registry and per-session state.
//!
//! Holds everything one automation session owns — target roster, element
//! refs, console/network capture rings, per-target command gates — plus the
//! process-wide [`SessionRegistry`] that admits sessions against the
//! governor's per-mode caps, answers late status races through a bounded
//! recently-closed record set, and expires idle sessions.

#![deny(unsafe_code)]

pub mod queue;
pub mod recently;
pub mod refs;
pub mod registry;
pub mod ring;
pub mod session;

pub use queue::{GateGuard, TargetGates};
pub use recently::RecentlyClosed;
pub use refs::{ElementDescriptor, InMemoryRefStore, RefStore};
pub use registry::{
    DEFAULT_RECENTLY_CLOSED_CAPACITY, DEFAULT_RING_CAPACITY, RegistryError, SessionRegistry,
};
pub use ring::{ConsoleEntry, NetworkEntry, RingBuffer, SeqEntry};
pub use session::{OpsSession, SessionState};
