//! Inbound half of an endpoint: method and stream registries plus dispatch.
//!
//! A [`Callee`] is shared by every connection of an endpoint. It validates
//! each inbound payload, runs method handlers, and manages subscriptions to
//! its streams. Subscriptions belong to the caller (connection) that created
//! them and are cancelled when that connection goes away.

use crate::caller::Caller;
use crate::config::RpcConfig;
use crate::error::{Result, TandemError};
use crate::lock;
use crate::message::{ErrorObject, Payload, Publication, Reply, Request, Response};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Outcome of a method or stream handler.
pub type HandlerResult<T> = std::result::Result<T, ErrorObject>;

/// Cancellation action returned by a stream handler.
pub type Cancel = Box<dyn FnOnce() + Send>;

type MethodHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, HandlerResult<Value>> + Send + Sync>;
type StreamHandler = Arc<dyn Fn(Publisher, Vec<Value>) -> HandlerResult<Cancel> + Send + Sync>;

/// Builder for [`Callee`].
pub struct CalleeBuilder {
    methods: HashMap<String, MethodHandler>,
    streams: HashMap<String, StreamHandler>,
    max_batch_size: usize,
}

impl CalleeBuilder {
    fn new() -> Self {
        Self {
            methods: HashMap::new(),
            streams: HashMap::new(),
            max_batch_size: RpcConfig::MAX_BATCH_SIZE,
        }
    }

    /// Register an async method.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Arc::new(move |params| handler(params).boxed()));
        self
    }

    /// Register a stream.
    ///
    /// The handler is called once per subscription with a [`Publisher`] and
    /// the subscription's remaining params, and returns the action that stops
    /// publishing.
    pub fn stream<F, C>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Publisher, Vec<Value>) -> HandlerResult<C> + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.streams.insert(
            name.into(),
            Arc::new(move |publisher, params| {
                handler(publisher, params).map(|cancel| Box::new(cancel) as Cancel)
            }),
        );
        self
    }

    /// Largest accepted batch.
    pub fn max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    pub fn build(self) -> Callee {
        Callee {
            methods: self.methods,
            streams: self.streams,
            max_batch_size: self.max_batch_size,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }
}

struct LiveSubscription {
    /// Id of the caller the subscription was created through.
    owner: u64,
    cancel: Cancel,
}

/// Dispatcher for inbound calls.
pub struct Callee {
    methods: HashMap<String, MethodHandler>,
    streams: HashMap<String, StreamHandler>,
    max_batch_size: usize,
    subscriptions: Mutex<HashMap<String, LiveSubscription>>,
}

impl Default for Callee {
    fn default() -> Self {
        CalleeBuilder::new().build()
    }
}

/// Opened once the reply carrying a new subscription token has been queued,
/// so no publish can overtake it.
type Gate = watch::Sender<bool>;

impl Callee {
    pub fn builder() -> CalleeBuilder {
        CalleeBuilder::new()
    }

    /// Answer one inbound payload.
    ///
    /// `caller` is the reverse channel to the peer. Without one (plain HTTP
    /// exchanges) `subscribe` and `unsubscribe` are not available. The reply
    /// mirrors the payload: a batch yields a batch of the same length and
    /// order, anything else a single response.
    pub async fn on_request(&self, body: Value, caller: Option<&Caller>) -> Reply {
        let (reply, gates) = self.dispatch(body, caller).await;
        open(gates);
        reply
    }

    /// Answer a payload that arrived on `caller`'s transport and send the
    /// reply back over it.
    pub(crate) async fn serve(&self, body: Value, caller: &Caller) -> Result<()> {
        let (reply, gates) = self.dispatch(body, Some(caller)).await;
        let sent = caller.send_frame(reply.into_value());
        open(gates);
        sent
    }

    /// Cancel every subscription created through the given caller.
    pub fn release(&self, caller_id: u64) {
        let released: Vec<LiveSubscription> = {
            let mut subscriptions = lock(&self.subscriptions);
            let tokens: Vec<String> = subscriptions
                .iter()
                .filter(|(_, sub)| sub.owner == caller_id)
                .map(|(token, _)| token.clone())
                .collect();
            tokens
                .iter()
                .filter_map(|token| subscriptions.remove(token))
                .collect()
        };

        if !released.is_empty() {
            debug!(
                "Releasing {} subscriptions of caller {}",
                released.len(),
                caller_id
            );
        }
        for sub in released {
            cancel(sub.cancel);
        }
    }

    /// Cancel every live subscription.
    pub fn shutdown(&self) {
        let all: Vec<LiveSubscription> = lock(&self.subscriptions)
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for sub in all {
            cancel(sub.cancel);
        }
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    async fn dispatch(&self, body: Value, caller: Option<&Caller>) -> (Reply, Vec<Gate>) {
        match Payload::from_body(body, self.max_batch_size) {
            Err(response) => (Reply::Single(response), Vec::new()),
            Ok(Payload::Single(item)) => {
                let (response, gate) = self.handle_item(item, caller).await;
                (Reply::Single(response), gate.into_iter().collect())
            }
            Ok(Payload::Batch(items)) => {
                let handled =
                    join_all(items.into_iter().map(|item| self.handle_item(item, caller))).await;

                let mut gates = Vec::new();
                let responses = handled
                    .into_iter()
                    .map(|(response, gate)| {
                        gates.extend(gate);
                        response
                    })
                    .collect();
                (Reply::Batch(responses), gates)
            }
        }
    }

    async fn handle_item(&self, item: Value, caller: Option<&Caller>) -> (Response, Option<Gate>) {
        let request = match Request::parse(item) {
            Ok(request) => request,
            Err(response) => return (response, None),
        };
        let id = request.request_id().map(|id| id.to_value());
        debug!("Dispatching {}", request.method);

        if let Some(caller) = caller {
            match request.method.as_str() {
                RpcConfig::SUBSCRIBE_METHOD => {
                    return match self.subscribe(request.params, caller) {
                        Ok((token, gate)) => (Response::success(id, Value::String(token)), Some(gate)),
                        Err(error) => (Response::error(id, error), None),
                    };
                }
                RpcConfig::UNSUBSCRIBE_METHOD => {
                    let response = match self.unsubscribe(&request.params, caller) {
                        Ok(found) => Response::success(id, Value::Bool(found)),
                        Err(error) => Response::error(id, error),
                    };
                    return (response, None);
                }
                _ => {}
            }
        }

        let Some(handler) = self.methods.get(&request.method) else {
            return (
                Response::error(id, ErrorObject::not_found("Method or stream not found")),
                None,
            );
        };

        let response = match run_method(handler, request.params).await {
            Ok(result) if id.is_some() => Response::success(id, result),
            Ok(_) => Response::error(None, ErrorObject::not_found("Invalid ID")),
            Err(error) => Response::error(id, error),
        };
        (response, None)
    }

    fn subscribe(&self, params: Vec<Value>, caller: &Caller) -> HandlerResult<(String, Gate)> {
        let mut params = params.into_iter();
        let handler = params
            .next()
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|name| self.streams.get(name))
            .ok_or_else(|| ErrorObject::not_found("Subscription not found"))?;

        let token = uuid::Uuid::new_v4().to_string();
        let (gate, ready) = watch::channel(false);
        let publisher = Publisher {
            caller: caller.clone(),
            subscription: token.clone(),
            ready,
        };

        let rest: Vec<Value> = params.collect();
        let cancel = match catch_unwind(AssertUnwindSafe(|| handler(publisher, rest))) {
            Ok(outcome) => outcome?,
            Err(_) => {
                warn!("Stream handler panicked");
                return Err(ErrorObject::application("Stream handler panicked"));
            }
        };

        lock(&self.subscriptions).insert(
            token.clone(),
            LiveSubscription {
                owner: caller.id(),
                cancel,
            },
        );
        // The transport may have ended while the handler ran; `release` has
        // then already passed over this caller and will not see the entry.
        if !caller.is_alive() {
            if let Some(sub) = lock(&self.subscriptions).remove(&token) {
                self::cancel(sub.cancel);
            }
            return Err(TandemError::TransportClosed.into());
        }
        debug!("Caller {} subscribed as {}", caller.id(), token);
        Ok((token, gate))
    }

    fn unsubscribe(&self, params: &[Value], caller: &Caller) -> HandlerResult<bool> {
        let [token] = params else {
            return Err(ErrorObject::not_found("unsubscribe called incorrectly"));
        };
        let Some(token) = token.as_str() else {
            return Ok(false);
        };

        let removed = {
            let mut subscriptions = lock(&self.subscriptions);
            match subscriptions.get(token) {
                Some(sub) if sub.owner == caller.id() => subscriptions.remove(token),
                _ => None,
            }
        };

        match removed {
            Some(sub) => {
                cancel(sub.cancel);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for Callee {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_method(handler: &MethodHandler, params: Vec<Value>) -> HandlerResult<Value> {
    let future = match catch_unwind(AssertUnwindSafe(|| handler(params))) {
        Ok(future) => future,
        Err(_) => return Err(panicked()),
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => Err(panicked()),
    }
}

fn panicked() -> ErrorObject {
    warn!("Method handler panicked");
    ErrorObject::application("Method handler panicked")
}

fn cancel(action: Cancel) {
    if catch_unwind(AssertUnwindSafe(action)).is_err() {
        warn!("Subscription cancel action panicked");
    }
}

fn open(gates: Vec<Gate>) {
    for gate in gates {
        gate.send_replace(true);
    }
}

/// Publishes values to one subscriber.
///
/// Each publish is an acknowledged call to the peer's `"subscription"`
/// method. Publishes issued before the subscribe reply has been sent wait
/// for it.
#[derive(Clone)]
pub struct Publisher {
    caller: Caller,
    subscription: String,
    ready: watch::Receiver<bool>,
}

impl Publisher {
    /// Token of the subscription this publisher feeds.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Deliver one value. Resolves to `true` when the peer still had a live
    /// callback for it.
    pub async fn publish(&self, payload: Value) -> Result<bool> {
        let mut ready = self.ready.clone();
        if ready.wait_for(|ready| *ready).await.is_err() {
            return Err(TandemError::TransportClosed);
        }

        let result = self
            .caller
            .execute(
                RpcConfig::SUBSCRIPTION_METHOD,
                Publication::params(&self.subscription, payload),
            )
            .await?;
        result.as_bool().ok_or_else(|| TandemError::InvalidResponse {
            message: format!("Publish acknowledged with {}", result),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::duplex::memory_pair;
    use crate::transport::Transport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};

    fn echo_callee() -> Callee {
        Callee::builder()
            .method("echo", |params| async move {
                Ok(params.into_iter().next().unwrap_or(Value::Null))
            })
            .method("fail", |_| async { Err(ErrorObject::from("boom")) })
            .method("teapot", |_| async { Err(ErrorObject::new(418, "short and stout")) })
            .method("panic", |params| async move {
                if params.is_empty() {
                    panic!("handler bug");
                }
                Ok(Value::Null)
            })
            .build()
    }

    fn single(reply: Reply) -> Response {
        match reply {
            Reply::Single(response) => response,
            Reply::Batch(batch) => panic!("Expected single reply, got batch: {:?}", batch),
        }
    }

    #[tokio::test]
    async fn test_single_call() {
        let callee = echo_callee();
        let reply = callee
            .on_request(json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": ["hi"]}), None)
            .await;
        let response = single(reply);
        assert_eq!(response.id, Some(json!(1)));
        assert_eq!(response.result, Some(json!("hi")));
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_scalar_params_are_wrapped() {
        let callee = echo_callee();
        let reply = callee
            .on_request(json!({"jsonrpc": "2.0", "id": "s", "method": "echo", "params": {"k": 1}}), None)
            .await;
        assert_eq!(single(reply).result, Some(json!({"k": 1})));
    }

    #[tokio::test]
    async fn test_batch_mirrors_input() {
        let callee = echo_callee();
        let reply = callee
            .on_request(
                json!([
                    {"jsonrpc": "2.0", "id": 1, "method": "echo", "params": ["a"]},
                    {"jsonrpc": "1.0", "id": 2, "method": "echo"},
                    {"jsonrpc": "2.0", "id": 3, "method": "missing"},
                    {"jsonrpc": "2.0", "id": 4, "method": "echo", "params": ["d"]},
                ]),
                None,
            )
            .await;

        let Reply::Batch(responses) = reply else {
            panic!("Expected batch reply");
        };
        assert_eq!(responses.len(), 4);
        assert_eq!(responses[0].result, Some(json!("a")));
        assert_eq!(responses[1].error.as_ref().unwrap().code, -32600);
        assert_eq!(responses[1].id, Some(json!(2)));
        assert_eq!(responses[2].error.as_ref().unwrap().code, -32601);
        assert_eq!(
            responses[2].error.as_ref().unwrap().message,
            "Method or stream not found"
        );
        assert_eq!(responses[3].id, Some(json!(4)));
    }

    #[tokio::test]
    async fn test_single_element_batch_stays_batch() {
        let callee = echo_callee();
        let reply = callee
            .on_request(json!([{"jsonrpc": "2.0", "id": 1, "method": "echo", "params": [1]}]), None)
            .await;
        assert!(matches!(reply, Reply::Batch(ref r) if r.len() == 1));
    }

    #[tokio::test]
    async fn test_invalid_top_level() {
        let callee = echo_callee();
        let oversized = Value::Array(vec![json!({"jsonrpc": "2.0", "id": 1, "method": "echo"}); 101]);

        for body in [json!(null), json!(5), json!([]), oversized] {
            let response = single(callee.on_request(body, None).await);
            assert_eq!(response.id, None);
            assert_eq!(response.error.unwrap().code, -32600);
        }
    }

    #[tokio::test]
    async fn test_batch_limit_is_configurable() {
        let callee = Callee::builder().max_batch_size(2).build();
        let body = json!([
            {"jsonrpc": "2.0", "id": 1, "method": "x"},
            {"jsonrpc": "2.0", "id": 2, "method": "x"},
            {"jsonrpc": "2.0", "id": 3, "method": "x"},
        ]);
        let response = single(callee.on_request(body, None).await);
        assert_eq!(response.error.unwrap().code, -32600);
    }

    #[tokio::test]
    async fn test_missing_id_is_invalid_id() {
        let callee = echo_callee();
        let response = single(
            callee
                .on_request(json!({"jsonrpc": "2.0", "method": "echo", "params": [1]}), None)
                .await,
        );
        let error = response.error.unwrap();
        assert_eq!(error.code, -32601);
        assert_eq!(error.message, "Invalid ID");
    }

    #[tokio::test]
    async fn test_handler_errors() {
        let callee = echo_callee();

        let response = single(
            callee
                .on_request(json!({"jsonrpc": "2.0", "id": 1, "method": "fail"}), None)
                .await,
        );
        assert_eq!(response.error.unwrap().code, 1);

        let response = single(
            callee
                .on_request(json!({"jsonrpc": "2.0", "id": 2, "method": "teapot"}), None)
                .await,
        );
        let error = response.error.unwrap();
        assert_eq!(error.code, 418);
        assert_eq!(error.message, "short and stout");

        let response = single(
            callee
                .on_request(json!({"jsonrpc": "2.0", "id": 3, "method": "panic"}), None)
                .await,
        );
        assert_eq!(response.id, Some(json!(3)));
        assert_eq!(response.error.unwrap().code, 1);
    }

    #[tokio::test]
    async fn test_subscribe_needs_reverse_caller() {
        let callee = echo_callee();
        let response = single(
            callee
                .on_request(json!({"jsonrpc": "2.0", "id": 1, "method": "subscribe", "params": ["echo"]}), None)
                .await,
        );
        assert_eq!(response.error.unwrap().message, "Method or stream not found");
    }

    /// A callee with a `ticks` stream publishing the given values, and a
    /// connected client/server caller pair.
    fn ticking(values: Vec<Value>) -> (Arc<Callee>, Caller, Caller, oneshot::Receiver<()>) {
        let (cancelled_tx, cancelled_rx) = oneshot::channel();
        let cancelled_tx = Mutex::new(Some(cancelled_tx));

        let callee = Arc::new(
            Callee::builder()
                .stream("ticks", move |publisher, _params| {
                    let values = values.clone();
                    let task = tokio::spawn(async move {
                        for value in values {
                            if publisher.publish(value).await.is_err() {
                                break;
                            }
                        }
                    });
                    let cancelled = lock(&cancelled_tx).take();
                    Ok(move || {
                        task.abort();
                        if let Some(tx) = cancelled {
                            let _ = tx.send(());
                        }
                    })
                })
                .build(),
        );

        let ((a, a_events), (b, b_events)) = memory_pair();
        let client = Caller::new(a, a_events);
        let server = Caller::serve(b, b_events, callee.clone());
        (callee, client, server, cancelled_rx)
    }

    #[tokio::test]
    async fn test_subscription_delivers_in_order() {
        let (callee, client, _server, cancelled) =
            ticking(vec![json!("x"), json!("y"), json!("z")]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = client
            .subscribe(
                move |value| {
                    let _ = tx.send(value);
                },
                "ticks",
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(callee.subscription_count(), 1);

        for expected in ["x", "y", "z"] {
            assert_eq!(rx.recv().await, Some(json!(expected)));
        }

        assert!(subscription.close().await.unwrap());
        cancelled.await.unwrap();
        assert_eq!(callee.subscription_count(), 0);
        assert_eq!(client.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_returns_false() {
        let (_callee, client, _server, _cancelled) = ticking(vec![]);

        let result = client
            .execute("unsubscribe", vec![json!("not-a-token")])
            .await
            .unwrap();
        assert_eq!(result, json!(false));

        let err = client.execute("unsubscribe", vec![]).await.unwrap_err();
        assert_eq!(err.remote_code(), Some(-32601));
    }

    #[tokio::test]
    async fn test_unknown_stream() {
        let (_callee, client, _server, _cancelled) = ticking(vec![]);

        let err = client
            .subscribe(|_| {}, "nope", vec![])
            .await
            .unwrap_err();
        match err {
            TandemError::Remote { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Subscription not found");
            }
            other => panic!("Expected remote error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_is_owner_scoped() {
        let (callee, client, _server, _cancelled) = ticking(vec![]);
        let subscription = client.subscribe(|_| {}, "ticks", vec![]).await.unwrap();

        let ((a, a_events), (b, b_events)) = memory_pair();
        let intruder = Caller::new(a, a_events);
        let _intruder_server = Caller::serve(b, b_events, callee.clone());

        let result = intruder
            .execute("unsubscribe", vec![json!(subscription.id())])
            .await
            .unwrap();
        assert_eq!(result, json!(false));
        assert_eq!(callee.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_close_releases_subscriptions() {
        let (callee, client, server, cancelled) = ticking(vec![]);
        let _subscription = client.subscribe(|_| {}, "ticks", vec![]).await.unwrap();
        assert_eq!(callee.subscription_count(), 1);

        client.close();
        server.closed().await;
        tokio::time::timeout(Duration::from_secs(5), cancelled)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(callee.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_racing_transport_close_is_cancelled() {
        let started = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));
        let callee = Arc::new(
            Callee::builder()
                .stream("idle", {
                    let started = started.clone();
                    let cancelled = cancelled.clone();
                    move |_publisher, _params| {
                        started.fetch_add(1, Ordering::SeqCst);
                        let cancelled = cancelled.clone();
                        Ok(move || {
                            cancelled.fetch_add(1, Ordering::SeqCst);
                        })
                    }
                })
                .build(),
        );

        for id in 0..20 {
            let ((a, _a_events), (b, b_events)) = memory_pair();
            let server = Caller::serve(b, b_events, callee.clone());
            a.send(json!({"jsonrpc": "2.0", "id": id, "method": "subscribe", "params": ["idle"]}))
                .unwrap();
            a.close();
            server.closed().await;
        }

        // Serve tasks may still be finishing after the pumps have stopped.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while callee.subscription_count() > 0
                || cancelled.load(Ordering::SeqCst) != started.load(Ordering::SeqCst)
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(callee.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_all() {
        let (callee, client, _server, cancelled) = ticking(vec![]);
        let _subscription = client.subscribe(|_| {}, "ticks", vec![]).await.unwrap();

        callee.shutdown();
        cancelled.await.unwrap();
        assert_eq!(callee.subscription_count(), 0);
    }
}
