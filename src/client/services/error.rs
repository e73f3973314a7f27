use thiserror::Error;

/// Error taxonomy for the exchange client.
///
/// `Conflict` and `Cancelled` are benign: the first is a duplicate-state
/// answer from the server that callers normalize instead of surfacing, the
/// second is the user declining at a confirmation step.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Socket or stream failed to open, or dropped mid-flight.
    #[error("transport error: {0}")]
    Transport(String),
    /// Frame or payload that matches no known wire shape. Logged and dropped
    /// at the codec boundary; never tears down the connection.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Non-2xx HTTP response, carrying the server's message when present.
    #[error("request failed ({status}): {message}")]
    Request { status: u16, message: String },
    /// Duplicate-state answer (already favorited, request already pending).
    #[error("state conflict: {0}")]
    Conflict(String),
    /// The user declined at the confirmation step.
    #[error("cancelled by user")]
    Cancelled,
}

impl ExchangeError {
    pub fn request(status: u16, message: impl Into<String>) -> Self {
        ExchangeError::Request {
            status,
            message: message.into(),
        }
    }

    /// The server-provided message, when this error carries one.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ExchangeError::Request { message, .. } => Some(message),
            ExchangeError::Conflict(message) => Some(message),
            _ => None,
        }
    }

    /// True for terminal paths that are not failures from the user's view.
    pub fn is_benign(&self) -> bool {
        matches!(self, ExchangeError::Conflict(_) | ExchangeError::Cancelled)
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        ExchangeError::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ExchangeError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        ExchangeError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_error_keeps_server_message() {
        let err = ExchangeError::request(402, "insufficient points");
        assert_eq!(err.server_message(), Some("insufficient points"));
        assert!(!err.is_benign());
    }

    #[test]
    fn conflict_and_cancel_are_benign() {
        assert!(ExchangeError::Conflict("already favorited".into()).is_benign());
        assert!(ExchangeError::Cancelled.is_benign());
        assert!(!ExchangeError::Transport("refused".into()).is_benign());
    }
}
