//! Relay command error taxonomy.

use bridle_ops::OpsErrorBody;
use bridle_ops::codes;
use bridle_registry::RegistryError;
use bridle_router::RouterError;

/// Errors surfaced by ops command handlers.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Missing or malformed command parameters.
    #[error("{message}")]
    InvalidParams {
        /// What is wrong.
        message: String,
    },

    /// Command name not registered.
    #[error("command '{command}' not found")]
    CommandNotFound {
        /// Requested command.
        command: String,
    },

    /// An element ref did not resolve against the session's ref store.
    #[error("ref '{ref_id}' not found")]
    RefNotFound {
        /// The unresolved ref.
        ref_id: String,
    },

    /// Session registry failure (admission, lookup, lease gate).
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// CDP router failure.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// Unexpected internal failure.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },
}

impl RelayError {
    /// Wire error code for this failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParams { .. } => codes::INVALID_PARAMS,
            Self::CommandNotFound { .. } => codes::COMMAND_NOT_FOUND,
            Self::RefNotFound { .. } => codes::REF_NOT_FOUND,
            Self::Registry(err) => err.code(),
            Self::Router(err) => err.code(),
            Self::Internal { .. } => codes::INTERNAL_ERROR,
        }
    }

    /// Whether a caller-side retry could plausibly succeed.
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Self::Registry(err) => err.retryable(),
            Self::Router(err) => err.retryable(),
            Self::InvalidParams { .. }
            | Self::CommandNotFound { .. }
            | Self::RefNotFound { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Convert into the wire error body.
    #[must_use]
    pub fn to_error_body(&self) -> OpsErrorBody {
        match self {
            Self::Registry(err) => err.to_error_body(),
            Self::Router(err) => err.to_error_body(),
            _ => OpsErrorBody {
                code: self.code().to_owned(),
                message: self.to_string(),
                retryable: self.retryable(),
                details: None,
            },
        }
    }
}
