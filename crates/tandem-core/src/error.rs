//! Error types for tandem-rpc.
//!
//! Two families of failure exist and callers need to tell them apart:
//!
//! - The peer answered, but with a JSON-RPC error object
//!   ([`TandemError::Remote`]).
//! - No answer was possible at all: timeout, closed or failed transport,
//!   rejected credentials, a broken response ([`TandemError::is_transport`]).
//!
//! Wire-level error objects (the `error` member of a response) are modelled by
//! [`ErrorObject`](crate::message::ErrorObject) and are what method handlers
//! return.

use std::time::Duration;
use thiserror::Error;

/// Main error type for tandem-rpc.
///
/// Variants carry messages rather than source errors so that a single
/// transport failure can be handed to every call pending on that transport.
#[derive(Debug, Clone, Error)]
pub enum TandemError {
    /// The peer answered with a JSON-RPC error object.
    #[error("Remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Transport failure: {message}")]
    Transport { message: String },

    #[error("Authentication required")]
    Unauthorized,

    #[error("Request failed with HTTP status {status}")]
    Http { status: u16 },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    /// A persistent transport was required but could not be opened.
    #[error("Persistent connection unavailable: {message}")]
    UpgradeFailed { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("JSON error: {message}")]
    Json { message: String },

    #[error("IO error: {message}")]
    Io { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for tandem-rpc operations.
pub type Result<T> = std::result::Result<T, TandemError>;

impl From<std::io::Error> for TandemError {
    fn from(err: std::io::Error) -> Self {
        TandemError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TandemError {
    fn from(err: serde_json::Error) -> Self {
        TandemError::Json {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for TandemError {
    fn from(err: url::ParseError) -> Self {
        TandemError::Config {
            message: format!("Invalid URL: {}", err),
        }
    }
}

impl From<reqwest::Error> for TandemError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return TandemError::Unauthorized;
            }
            return TandemError::Http {
                status: status.as_u16(),
            };
        }
        TandemError::Transport {
            message: err.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TandemError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::Http(response) if response.status().as_u16() == 401 => {
                TandemError::Unauthorized
            }
            WsError::Http(response) => TandemError::Http {
                status: response.status().as_u16(),
            },
            WsError::ConnectionClosed | WsError::AlreadyClosed => TandemError::TransportClosed,
            other => TandemError::Transport {
                message: other.to_string(),
            },
        }
    }
}

impl TandemError {
    /// True when no answer from the peer was possible.
    ///
    /// Everything except [`TandemError::Remote`] and local configuration
    /// mistakes counts as a transport-level failure.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TandemError::Timeout(_)
                | TandemError::TransportClosed
                | TandemError::Transport { .. }
                | TandemError::Unauthorized
                | TandemError::Http { .. }
                | TandemError::InvalidResponse { .. }
                | TandemError::UpgradeFailed { .. }
                | TandemError::Io { .. }
        )
    }

    /// The JSON-RPC error code reported by the peer, if it answered.
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            TandemError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}
