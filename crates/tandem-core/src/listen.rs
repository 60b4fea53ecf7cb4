//! Accepting endpoint.
//!
//! Serves one route, `/`:
//!
//! - `GET /` answers a plain-text banner, or upgrades to a WebSocket when
//!   asked to. Each upgraded socket gets its own [`Caller`] so the server can
//!   call back into that peer, and the shared [`Callee`] serves its calls.
//! - `POST /` runs one JSON-RPC exchange against the shared callee.
//! - Anything else is refused with 405, or with the banner and 400 when
//!   HTTP calls are disabled.
//!
//! Credentials are checked before anything is dispatched, on both paths.

use crate::caller::Caller;
use crate::callee::Callee;
use crate::config::{ListenConfig, RpcConfig};
use crate::error::Result;
use crate::transport::DuplexTransport;
use axum::body::Bytes;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CONNECTION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

type CallerHook = Arc<dyn Fn(Caller) + Send + Sync>;

/// Builder and router factory for an accepting endpoint.
pub struct Listener {
    callee: Arc<Callee>,
    config: ListenConfig,
    on_caller: Option<CallerHook>,
}

#[derive(Clone)]
struct ListenState {
    callee: Arc<Callee>,
    config: Arc<ListenConfig>,
    on_caller: Option<CallerHook>,
    shutdown: watch::Receiver<bool>,
}

impl Listener {
    pub fn new(callee: Arc<Callee>, config: ListenConfig) -> Self {
        Self {
            callee,
            config,
            on_caller: None,
        }
    }

    /// Run `hook` with the reverse caller of every accepted WebSocket.
    pub fn on_caller<F>(mut self, hook: F) -> Self
    where
        F: Fn(Caller) + Send + Sync + 'static,
    {
        self.on_caller = Some(Arc::new(hook));
        self
    }

    /// The endpoint as an axum router, for mounting in an existing server.
    ///
    /// Sessions accepted through this router end when their peer goes away;
    /// only [`Listener::bind`] can close them on shutdown.
    pub fn router(&self) -> Router {
        let (_, shutdown) = watch::channel(false);
        self.build_router(shutdown)
    }

    /// Bind to `addr` and serve in a background task.
    pub async fn bind(self, addr: impl ToSocketAddrs) -> Result<ListenerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        if self.config.credentials.is_required() {
            info!("Listening on {} (credentials required)", addr);
        } else {
            info!("Listening on {}", addr);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = self.build_router(shutdown_rx.clone());

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_requested(shutdown_rx).await;
                })
                .await;
            match served {
                Ok(()) => info!("Listener on {} stopped", addr),
                Err(e) => error!("Listener on {} failed: {}", addr, e),
            }
        });

        Ok(ListenerHandle {
            addr,
            shutdown_tx,
            task: Some(task),
        })
    }

    fn build_router(&self, shutdown: watch::Receiver<bool>) -> Router {
        let state = ListenState {
            callee: self.callee.clone(),
            config: Arc::new(self.config.clone()),
            on_caller: self.on_caller.clone(),
            shutdown,
        };

        Router::new()
            .route(
                "/",
                get(handle_get).post(handle_post).fallback(handle_other),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Handle to a bound listener. Dropping it shuts the listener down.
pub struct ListenerHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting and close every live WebSocket session.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// True once shutdown was signalled; false if it never can be.
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) -> bool {
    shutdown.wait_for(|stop| *stop).await.is_ok()
}

async fn handle_get(
    State(state): State<ListenState>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    match upgrade {
        Some(upgrade) if state.config.websocket_enabled => {
            if !authorized(&state, &headers) {
                warn!("Rejected WebSocket upgrade: bad credentials");
                return (
                    StatusCode::UNAUTHORIZED,
                    [(WWW_AUTHENTICATE, challenge()), (CONNECTION, "close".to_string())],
                )
                    .into_response();
            }
            upgrade.on_upgrade(move |socket| session(state, socket))
        }
        _ => banner(&state),
    }
}

async fn handle_post(State(state): State<ListenState>, headers: HeaderMap, body: Bytes) -> Response {
    if !state.config.http_enabled {
        return banner(&state);
    }
    if !authorized(&state, &headers) {
        warn!("Rejected HTTP call: bad credentials");
        return (StatusCode::UNAUTHORIZED, [(WWW_AUTHENTICATE, challenge())]).into_response();
    }

    // Unparseable bodies become null, which the callee rejects as invalid.
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let reply = state.callee.on_request(body, None).await;
    Json(reply).into_response()
}

async fn handle_other(State(state): State<ListenState>) -> Response {
    if !state.config.http_enabled {
        return banner(&state);
    }
    StatusCode::METHOD_NOT_ALLOWED.into_response()
}

async fn session(state: ListenState, socket: WebSocket) {
    let (transport, events) = DuplexTransport::from_axum(socket);
    let caller = Caller::spawn(
        transport,
        events,
        Some(state.callee.clone()),
        state.config.call_timeout,
    );
    info!("Accepted WebSocket session as caller {}", caller.id());

    if let Some(hook) = &state.on_caller {
        hook(caller.clone());
    }

    tokio::select! {
        _ = caller.closed() => {}
        true = shutdown_requested(state.shutdown.clone()) => {
            caller.close();
            caller.closed().await;
        }
    }
    debug!("WebSocket session of caller {} ended", caller.id());
}

fn banner(state: &ListenState) -> Response {
    let status = if state.config.http_enabled {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, RpcConfig::BANNER).into_response()
}

fn authorized(state: &ListenState, headers: &HeaderMap) -> bool {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    state.config.credentials.authorize(header)
}

fn challenge() -> String {
    format!("Basic realm=\"{}\", charset=\"UTF-8\"", RpcConfig::AUTH_REALM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn echo_listener(config: ListenConfig) -> Listener {
        let callee = Callee::builder()
            .method("echo", |params| async move {
                Ok(params.into_iter().next().unwrap_or(Value::Null))
            })
            .build();
        Listener::new(Arc::new(callee), config)
    }

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_banner() {
        let app = echo_listener(ListenConfig::default()).router();
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"JSON-RPC Server\n");
    }

    #[tokio::test]
    async fn test_post_echo() {
        let app = echo_listener(ListenConfig::default()).router();
        let response = app
            .oneshot(post(r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":["hi"]}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"jsonrpc": "2.0", "result": "hi", "id": 1})
        );
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_request() {
        let app = echo_listener(ListenConfig::default()).router();
        let response = app.oneshot(post("{oops")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32600);
        assert_eq!(body["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_other_methods_not_allowed() {
        let app = echo_listener(ListenConfig::default()).router();
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let config = ListenConfig::default().with_credentials(Credentials::basic("user", "pass"));
        let app = echo_listener(config).router();

        let response = app
            .clone()
            .oneshot(post(r#"{"jsonrpc":"2.0","id":1,"method":"echo"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response.headers().get(WWW_AUTHENTICATE).unwrap();
        assert!(challenge.to_str().unwrap().starts_with("Basic realm="));

        let mut authorized = post(r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":[2]}"#);
        authorized
            .headers_mut()
            .insert(AUTHORIZATION, "Basic dXNlcjpwYXNz".parse().unwrap());
        let response = app.oneshot(authorized).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["result"], 2);
    }

    #[tokio::test]
    async fn test_http_disabled() {
        let app = echo_listener(ListenConfig::default().with_http(false)).router();

        let response = app
            .clone()
            .oneshot(post(r#"{"jsonrpc":"2.0","id":1,"method":"echo"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], RpcConfig::BANNER.as_bytes());
    }

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let handle = echo_listener(ListenConfig::default())
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        assert_ne!(handle.port(), 0);
        assert!(handle.addr().ip().is_loopback());
        handle.shutdown();
    }
}
