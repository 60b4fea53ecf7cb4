//! Centralized configuration for tandem-rpc.
//!
//! Protocol constants live on [`RpcConfig`]; per-endpoint settings are the
//! [`ListenConfig`] and [`ConnectConfig`] structs.

use crate::auth::Credentials;
use std::time::Duration;

/// Protocol-level constants.
pub struct RpcConfig;

impl RpcConfig {
    pub const JSONRPC_VERSION: &'static str = "2.0";

    /// How long an outbound call waits for its response.
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);
    /// How long the connection manager waits for a WebSocket handshake.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    pub const MAX_BATCH_SIZE: usize = 100;

    // Reserved method names
    pub const SUBSCRIBE_METHOD: &'static str = "subscribe";
    pub const UNSUBSCRIBE_METHOD: &'static str = "unsubscribe";
    pub const SUBSCRIPTION_METHOD: &'static str = "subscription";

    // HTTP surface
    pub const BANNER: &'static str = "JSON-RPC Server\n";
    pub const AUTH_REALM: &'static str = "JSON-RPC";
}

/// Settings for an accepting endpoint.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    /// Credentials every HTTP POST and WebSocket upgrade must present.
    pub credentials: Credentials,
    /// Serve one-shot calls over `POST /`.
    pub http_enabled: bool,
    /// Accept WebSocket upgrades on `GET /`.
    pub websocket_enabled: bool,
    /// Timeout for reverse calls issued on accepted connections.
    pub call_timeout: Duration,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::None,
            http_enabled: true,
            websocket_enabled: true,
            call_timeout: RpcConfig::CALL_TIMEOUT,
        }
    }
}

impl ListenConfig {
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_http(mut self, enable: bool) -> Self {
        self.http_enabled = enable;
        self
    }

    pub fn with_websocket(mut self, enable: bool) -> Self {
        self.websocket_enabled = enable;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Settings for an initiating endpoint.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// `http`, `https`, `ws` or `wss` URL of the peer.
    pub url: String,
    pub credentials: Credentials,
    pub call_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl ConnectConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: Credentials::None,
            call_timeout: RpcConfig::CALL_TIMEOUT,
            handshake_timeout: RpcConfig::HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}
