use std::fmt;

/// Errors surfaced by the client.
///
/// Connection-wide failures (socket death, invalid session) drive the
/// gateway state machine and never resolve individual request futures;
/// request-local failures resolve exactly one future and leave the
/// connection alone.
#[derive(Debug)]
pub enum ClientError {
    /// Transport-level HTTP failure (DNS, TLS, connection reset).
    Http(reqwest::Error),
    /// Non-2xx response that is not a rate limit.
    Server { status: u16, body: String },
    /// The server rate limited the request and the retry ceiling was hit.
    RateLimited { retry_after: u64, global: bool },
    /// WebSocket transport failure.
    Socket(String),
    /// A frame violated the protocol (bad JSON, missing required field).
    Protocol(String),
    /// The gateway connection is closed and will not be retried.
    Closed { code: Option<u16>, reason: String },
    /// The dispatch sequencer ran out of buffer space. Fatal for the
    /// current connection: it implies event loss.
    SequencerOverflow { capacity: usize, sequence: u64 },
    /// The future backing this operation was canceled before completion.
    Canceled,
    Decode(serde_json::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Http(e) => write!(f, "HTTP error: {e}"),
            ClientError::Server { status, body } => {
                write!(f, "server returned {status}: {body}")
            }
            ClientError::RateLimited { retry_after, global } => {
                let scope = if *global { "global" } else { "bucket" };
                write!(f, "rate limited ({scope}), retry after {retry_after}s")
            }
            ClientError::Socket(msg) => write!(f, "socket error: {msg}"),
            ClientError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            ClientError::Closed { code, reason } => match code {
                Some(code) => write!(f, "connection closed ({code}): {reason}"),
                None => write!(f, "connection closed: {reason}"),
            },
            ClientError::SequencerOverflow { capacity, sequence } => write!(
                f,
                "dispatch sequencer overflow at seq {sequence} (capacity {capacity})"
            ),
            ClientError::Canceled => write!(f, "canceled"),
            ClientError::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Http(e)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Decode(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Socket(e.to_string())
    }
}
