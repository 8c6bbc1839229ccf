//! Branded ID newtypes for type safety.
//!
//! Every identifier flowing through the relay has a distinct newtype wrapped
//! around `String`. The ops protocol, the CDP router, and the session
//! registry all traffic in opaque string tokens; branding them prevents a
//! `LeaseId` from ending up where a `CdpSessionId` belongs.
//!
//! Synthesized IDs are UUID v7 (time-ordered) via [`uuid::Uuid::now_v7`].
//! IDs received from a remote peer or the browser platform are wrapped
//! as-is — the relay never assumes any internal structure beyond uniqueness.
//!
//! Tab identifiers are the one exception: the host platform numbers tabs, so
//! [`TabId`] wraps an `i64` instead of a string.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generate a new UUID v7 string (time-ordered).
fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of one automation session in the registry.
    OpsSessionId
}

branded_id! {
    /// Server-assigned identifier of one connected ops client.
    ClientId
}

branded_id! {
    /// Correlation id for one in-flight ops request.
    RequestId
}

branded_id! {
    /// Identifier tying a chunked response to its chunk frames.
    PayloadId
}

branded_id! {
    /// Synthesized CDP session token multiplexed by the router.
    ///
    /// Opaque and stable for the lifetime of its logical session; carries no
    /// meaning beyond uniqueness.
    CdpSessionId
}

branded_id! {
    /// Identifier of a debuggable target (page, frame, worker).
    TargetId
}

branded_id! {
    /// Opaque lease token issued by the external daemon; forwarded, never
    /// validated here.
    LeaseId
}

/// Numeric tab identifier assigned by the host browser platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(i64);

impl TabId {
    /// Wrap a platform tab number.
    #[must_use]
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Return the raw platform tab number.
    #[must_use]
    pub fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TabId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl From<TabId> for i64 {
    fn from(id: TabId) -> Self {
        id.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
