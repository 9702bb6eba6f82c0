use crate::config::NameMatch;

/// Failure of a single exchange attempt. Always retriable, and always a
/// reason to rebuild the client before the next attempt.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DispatchError::Timeout
        } else {
            DispatchError::Transport(err.into())
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Transport(err.into())
    }
}

/// Non-retriable fault that terminates its owner.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Fault {
    #[error("chaos: {0}")]
    Chaos(String),
    #[error("client name \"{client}\" must match server {rule} \"{server}\"")]
    NameMismatch {
        client: String,
        server: String,
        rule: NameMatch,
    },
}
