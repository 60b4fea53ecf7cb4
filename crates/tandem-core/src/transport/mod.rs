//! Message transports.
//!
//! A transport moves whole JSON frames between two endpoints and reports
//! what arrives on an event stream. Two kinds exist:
//!
//! - [`duplex`]: a persistent bidirectional channel (WebSocket, or an
//!   in-memory pair). Either side may send at any time.
//! - [`http`]: an ephemeral exchange. One frame goes out as an HTTP POST and
//!   at most one frame comes back, after which the transport is closed.
//!
//! A transport stops emitting frames at its first terminal event
//! ([`TransportEvent::Failure`] or [`TransportEvent::Close`]). The ephemeral
//! transport always ends with `Close`, also after a failure; consumers act on
//! the first terminal event only.

pub mod duplex;
pub mod http;

use crate::error::{Result, TandemError};
use crate::message::Frame;
use serde_json::Value;
use tokio::sync::mpsc;

pub use duplex::DuplexTransport;
pub use http::HttpTransport;

/// What a transport reports to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// A frame arrived and was classified.
    Frame(Frame),
    /// The transport failed; this is terminal.
    Failure(TandemError),
    /// The transport closed cleanly; this is terminal.
    Close,
}

impl TransportEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransportEvent::Frame(_))
    }
}

/// Receiving half of a transport's event stream.
pub type Events = mpsc::UnboundedReceiver<TransportEvent>;

/// Sending side of a transport.
pub trait Transport: Send + Sync + 'static {
    /// Queue one frame for delivery.
    ///
    /// Fails with [`TandemError::TransportClosed`] once the transport has
    /// terminated, or when an ephemeral transport has already been used.
    fn send(&self, frame: Value) -> Result<()>;

    /// False once a terminal event has been (or is about to be) emitted.
    fn is_alive(&self) -> bool;

    /// Close the transport. Emits `Close` unless already terminated.
    fn close(&self);
}

/// Parse one text frame. Frames that are not JSON, or are JSON of no known
/// shape, are dropped.
pub(crate) fn decode(text: &str) -> Option<Frame> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => {
            let frame = Frame::classify(value);
            if frame.is_none() {
                tracing::debug!("Ignoring frame of unknown shape");
            }
            frame
        }
        Err(e) => {
            tracing::debug!("Ignoring non-JSON frame: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        assert!(decode("not json").is_none());
        assert!(decode("42").is_none());
        assert!(matches!(
            decode(r#"{"jsonrpc":"2.0","id":1,"result":true}"#),
            Some(Frame::Success { .. })
        ));
    }

    #[test]
    fn test_terminal_events() {
        assert!(TransportEvent::Close.is_terminal());
        assert!(TransportEvent::Failure(TandemError::TransportClosed).is_terminal());
        assert!(!TransportEvent::Frame(Frame::Call(serde_json::json!({}))).is_terminal());
    }
}
