//! Failure taxonomy shared by the whole engine.

/// Errors surfaced by the core engine.
///
/// Only `AuthDenied`, `InvalidKey`, `Persistence` (at login) and
/// `Terminal` reach the operator directly; everything else is drained by
/// the polling loop and logged as a warning.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The authorization service refused the credentials.
    #[error("authentication failed: {0}")]
    AuthDenied(String),

    /// Network, TLS, non-2xx or undecodable response from the
    /// authorization service or a remote agent.
    #[error("request failed: {0}")]
    Transport(String),

    /// The operator's public key file does not parse as a single
    /// authorized-key line.
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    /// A remote agent answered with a non-empty error type.
    #[error("agent at {endpoint} rejected the request: {message}")]
    AgentRejected { endpoint: String, message: String },

    /// The persistent machine store could not be read or written.
    #[error("persistent store failure: {0}")]
    Persistence(String),

    /// Raw mode or terminal size negotiation failed.
    #[error("terminal failure: {0}")]
    Terminal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Transport(err.to_string())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Persistence(err.to_string())
    }
}
