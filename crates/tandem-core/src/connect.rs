//! Connection manager for the initiating side.
//!
//! A [`Connection`] prefers a persistent WebSocket transport and falls back to
//! one HTTP POST per call when the upgrade fails. The upgrade decision is
//! explicit state:
//!
//! ```text
//! NoTransport ──upgrade──▶ UpgradeInFlight ──ok──▶ PersistentAvailable
//!      ▲                         │                        │
//!      │                        err                 transport dies
//!      │                         ▼                        │
//!      └──reset_upgrade── UpgradeFailed ◀─────────────────┘ (re-upgrade)
//! ```
//!
//! A failed upgrade is sticky: later `execute` calls go straight to HTTP
//! until [`Connection::reset_upgrade`]. `subscribe` and `listen` need inbound
//! push and always attempt an upgrade, failing when it does not succeed.
//! Concurrent calls arriving while an upgrade is in flight join that attempt.

use crate::caller::{Caller, Subscription};
use crate::callee::Callee;
use crate::config::ConnectConfig;
use crate::error::{Result, TandemError};
use crate::lock;
use crate::transport::{DuplexTransport, HttpTransport};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};
use url::Url;

type Upgrade = Shared<BoxFuture<'static, Result<Caller>>>;

/// Observable state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No persistent transport yet, or the last one died.
    NoTransport,
    PersistentAvailable,
    UpgradeInFlight,
    /// The last upgrade failed; calls use HTTP until reset.
    UpgradeFailed,
}

enum LinkState {
    Disconnected,
    Upgrading { attempt: u64, upgrade: Upgrade },
    Connected(Caller),
    Unsupported,
}

/// Client endpoint with WebSocket upgrade and HTTP fallback.
pub struct Connection {
    http_url: Url,
    ws_url: Url,
    authorization: Option<String>,
    call_timeout: Duration,
    handshake_timeout: Duration,
    client: reqwest::Client,
    callee: Option<Arc<Callee>>,
    state: Mutex<LinkState>,
    attempts: AtomicU64,
}

impl Connection {
    /// Create a connection. No network activity happens until the first call.
    ///
    /// `callee` serves calls the peer makes back over the persistent
    /// transport.
    pub fn new(config: ConnectConfig, callee: Option<Arc<Callee>>) -> Result<Self> {
        let (http_url, ws_url) = endpoints(&config.url)?;
        let client = reqwest::Client::builder().build()?;

        Ok(Self {
            http_url,
            ws_url,
            authorization: config.credentials.authorization_header(),
            call_timeout: config.call_timeout,
            handshake_timeout: config.handshake_timeout,
            client,
            callee,
            state: Mutex::new(LinkState::Disconnected),
            attempts: AtomicU64::new(0),
        })
    }

    /// Call `method` on the peer, over the persistent transport when one is
    /// (or can be made) available, over HTTP otherwise.
    pub async fn execute(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        match self.upgrade(false).await {
            Ok(caller) => caller.execute(method, params).await,
            Err(e) => {
                debug!("Calling {} over HTTP: {}", method, e);
                self.execute_http(method, params).await
            }
        }
    }

    /// Subscribe to the peer's stream `stream`. Requires a persistent
    /// transport.
    pub async fn subscribe<F>(
        &self,
        callback: F,
        stream: &str,
        params: Vec<Value>,
    ) -> Result<Subscription>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let caller = self.upgrade(true).await?;
        caller.subscribe(callback, stream, params).await
    }

    /// Open the persistent transport so the peer can call back into the
    /// local callee. Returns the caller bound to it.
    pub async fn listen(&self) -> Result<Caller> {
        self.upgrade(true).await
    }

    pub fn state(&self) -> ConnectionState {
        match &*lock(&self.state) {
            LinkState::Disconnected => ConnectionState::NoTransport,
            LinkState::Upgrading { .. } => ConnectionState::UpgradeInFlight,
            LinkState::Connected(caller) if caller.is_alive() => {
                ConnectionState::PersistentAvailable
            }
            LinkState::Connected(_) => ConnectionState::NoTransport,
            LinkState::Unsupported => ConnectionState::UpgradeFailed,
        }
    }

    /// Forget a failed upgrade so the next call tries again.
    pub fn reset_upgrade(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, LinkState::Unsupported) {
            *state = LinkState::Disconnected;
        }
    }

    /// Close the persistent transport, if any. Later calls may upgrade again.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), LinkState::Disconnected);
        if let LinkState::Connected(caller) = previous {
            caller.close();
        }
    }

    async fn upgrade(&self, force: bool) -> Result<Caller> {
        let (attempt, upgrade) = {
            let mut state = lock(&self.state);
            match &*state {
                LinkState::Connected(caller) if caller.is_alive() => return Ok(caller.clone()),
                LinkState::Unsupported if !force => {
                    return Err(TandemError::UpgradeFailed {
                        message: "an earlier upgrade attempt failed".to_string(),
                    })
                }
                LinkState::Upgrading { attempt, upgrade } => (*attempt, upgrade.clone()),
                _ => {
                    let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    let upgrade = open_persistent(
                        self.ws_url.clone(),
                        self.authorization.clone(),
                        self.callee.clone(),
                        self.handshake_timeout,
                        self.call_timeout,
                    )
                    .boxed()
                    .shared();
                    *state = LinkState::Upgrading {
                        attempt,
                        upgrade: upgrade.clone(),
                    };
                    (attempt, upgrade)
                }
            }
        };

        let outcome = upgrade.await;

        let mut state = lock(&self.state);
        let current = matches!(&*state, LinkState::Upgrading { attempt: a, .. } if *a == attempt);
        if current {
            *state = match &outcome {
                Ok(caller) => {
                    info!("Persistent connection to {} established", self.ws_url);
                    LinkState::Connected(caller.clone())
                }
                Err(e) => {
                    warn!(
                        "Upgrade to {} failed, falling back to HTTP: {}",
                        self.ws_url, e
                    );
                    LinkState::Unsupported
                }
            };
        }
        outcome
    }

    async fn execute_http(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let (transport, events) = HttpTransport::new(
            self.client.clone(),
            self.http_url.clone(),
            self.authorization.clone(),
        );
        let caller = Caller::spawn(transport, events, None, self.call_timeout);
        caller.execute(method, params).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn open_persistent(
    url: Url,
    authorization: Option<String>,
    callee: Option<Arc<Callee>>,
    handshake_timeout: Duration,
    call_timeout: Duration,
) -> Result<Caller> {
    let mut request = url.as_str().into_client_request()?;
    if let Some(authorization) = authorization {
        let value = HeaderValue::from_str(&authorization).map_err(|e| TandemError::Config {
            message: format!("Invalid credentials: {}", e),
        })?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (socket, _) = tokio::time::timeout(
        handshake_timeout,
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| TandemError::Timeout(handshake_timeout))??;

    let (transport, events) = DuplexTransport::from_tungstenite(socket);
    Ok(Caller::spawn(transport, events, callee, call_timeout))
}

/// Derive the HTTP and WebSocket endpoints from one URL.
fn endpoints(url: &str) -> Result<(Url, Url)> {
    let url = Url::parse(url)?;
    let (http_scheme, ws_scheme) = match url.scheme() {
        "http" | "ws" => ("http", "ws"),
        "https" | "wss" => ("https", "wss"),
        other => {
            return Err(TandemError::Config {
                message: format!("Unsupported URL scheme: {}", other),
            })
        }
    };

    let with_scheme = |scheme: &str| -> Result<Url> {
        let mut derived = url.clone();
        derived.set_scheme(scheme).map_err(|_| TandemError::Config {
            message: format!("Cannot use {} with scheme {}", url, scheme),
        })?;
        Ok(derived)
    };
    Ok((with_scheme(http_scheme)?, with_scheme(ws_scheme)?))
}
