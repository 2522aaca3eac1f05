//! Error taxonomy for gateway operations.
//!
//! Every downstream failure is classified into one of these variants at the
//! router boundary and rendered as the uniform failure envelope. The two
//! exceptions are relay failures and the breaker trip: those are
//! connection-level events where headers may already be committed, so they
//! never produce a JSON body.

use thiserror::Error;

/// Errors that can occur while handling a gateway request.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Missing or malformed request parameter. No provider call is made.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Downstream provider failed (extraction, chat, render, delivery).
    #[error("provider failure: {0}")]
    Provider(String),

    /// Downstream provider did not answer within the configured deadline.
    #[error("provider timed out after {timeout_secs}s")]
    ProviderTimeout { timeout_secs: u64 },

    /// Origin fetch or mid-stream relay failure. Connection-level: the
    /// client socket is dropped without a structured body.
    #[error("relay failure: {0}")]
    Relay(String),

    /// Snapshot archiving failed.
    #[error("backup failed: {0}")]
    Backup(String),

    /// The traffic breaker has tripped; the process no longer serves.
    #[error("service is shut down")]
    ShutDown,
}

impl GatewayError {
    /// HTTP status code for envelope-bearing errors.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::Provider(_)
            | GatewayError::ProviderTimeout { .. }
            | GatewayError::Backup(_) => 500,
            // Connection-level variants never reach envelope rendering;
            // the codes here only matter for logging.
            GatewayError::Relay(_) => 502,
            GatewayError::ShutDown => 503,
        }
    }

    /// Whether this error must terminate the connection instead of being
    /// rendered as a failure envelope.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, GatewayError::Relay(_) | GatewayError::ShutDown)
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
