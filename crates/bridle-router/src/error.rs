//! Router error taxonomy.

use bridle_core::{CdpSessionId, TabId};
use bridle_ops::OpsErrorBody;
use bridle_ops::codes;

use crate::debugger::DebuggerError;

/// Errors surfaced by the CDP router.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The platform lacks a capability the router cannot work without.
    /// Retrying cannot succeed.
    #[error("debugger backend does not support {capability}")]
    CapabilityRequired {
        /// Name of the missing capability.
        capability: &'static str,
    },

    /// The stale-attach fallback ladder ran out of candidates.
    #[error("attach failed after fallback: {message}")]
    AttachExhausted {
        /// Last tab tried.
        tab: TabId,
        /// Final underlying failure.
        message: String,
    },

    /// A forwarded command named a session the table does not hold.
    #[error("unknown CDP session {0}")]
    SessionNotFound(CdpSessionId),

    /// A forwarded command referenced a target the table does not hold.
    #[error("unknown target {0}")]
    TargetNotFound(String),

    /// Malformed params on a router-handled method.
    #[error("invalid params for {method}: {message}")]
    InvalidParams {
        /// Method whose params were malformed.
        method: String,
        /// What was wrong.
        message: String,
    },

    /// The platform dropped the attachment; surfaced, never retried here.
    #[error("physical attachment lost: {reason}")]
    HardDetach {
        /// Tab that was attached.
        tab: TabId,
        /// Platform-reported reason.
        reason: String,
    },

    /// Underlying debugger failure outside the ladder's recovery scope.
    #[error(transparent)]
    Debugger(#[from] DebuggerError),
}

impl RouterError {
    /// Wire error code for this failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapabilityRequired { .. } => codes::CAPABILITY_REQUIRED,
            Self::AttachExhausted { .. } => codes::ATTACH_FAILED,
            Self::SessionNotFound(_) | Self::TargetNotFound(_) => codes::SESSION_NOT_FOUND,
            Self::InvalidParams { .. } => codes::INVALID_PARAMS,
            Self::HardDetach { .. } => codes::SOCKET_CLOSED,
            Self::Debugger(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Whether a caller-side retry could plausibly succeed.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::HardDetach { .. } | Self::Debugger(_))
    }

    /// Convert into the wire error body.
    #[must_use]
    pub fn to_error_body(&self) -> OpsErrorBody {
        OpsErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
            retryable: self.retryable(),
            details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_error_is_not_retryable() {
        let err = RouterError::CapabilityRequired {
            capability: "flat sessions",
        };
        assert_eq!(err.code(), codes::CAPABILITY_REQUIRED);
        assert!(!err.retryable());
        assert!(err.to_string().contains("flat sessions"));
    }

    #[test]
    fn hard_detach_is_retryable() {
        let err = RouterError::HardDetach {
            tab: TabId::new(7),
            reason: "target_closed".into(),
        };
        assert!(err.retryable());
        let body = err.to_error_body();
        assert!(body.retryable);
    }
}
