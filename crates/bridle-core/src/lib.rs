//! # bridle-core
//!
//! Foundation types shared by every bridle crate.
//!
//! - **Branded IDs**: `OpsSessionId`, `ClientId`, `RequestId`, `TargetId` and
//!   friends as `String` newtypes so a lease id can never be passed where a
//!   session id is expected, plus the numeric `TabId`
//! - **Backoff**: reconnect policy and capped exponential delay math used by
//!   the ops transport's reconnect loop

#![deny(unsafe_code)]

pub mod backoff;
pub mod ids;

pub use backoff::ReconnectPolicy;
pub use ids::{
    CdpSessionId, ClientId, LeaseId, OpsSessionId, PayloadId, RequestId, TabId, TargetId,
};
