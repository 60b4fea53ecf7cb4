//! Outbound half of an endpoint.
//!
//! A [`Caller`] owns one transport. It sends requests, correlates responses by
//! id, delivers subscription publishes to local callbacks, and hands inbound
//! calls to the local [`Callee`]. A single event pump task per caller consumes
//! the transport's events in order.
//!
//! # Lifecycle
//!
//! Every pending call ends exactly once: resolved, rejected by the peer, timed
//! out, or rejected because the transport terminated. A terminal transport
//! event rejects all pending calls with the same cause and detaches every
//! subscription callback. Dropping the last handle of a caller closes its
//! transport.

use crate::callee::Callee;
use crate::config::RpcConfig;
use crate::error::{Result, TandemError};
use crate::lock;
use crate::message::{Frame, Publication, Request, RequestId, Response};
use crate::transport::{Events, Transport, TransportEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

static NEXT_CALLER_ID: AtomicU64 = AtomicU64::new(1);

type Callback = Box<dyn Fn(Value) + Send + Sync>;

/// Handle to the outbound side of one transport. Cheap to clone.
#[derive(Clone)]
pub struct Caller {
    inner: Arc<CallerInner>,
}

struct CallerInner {
    id: u64,
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, PendingCall>>,
    subscriptions: Mutex<HashMap<String, Arc<SubscriptionSlot>>>,
    timeout: Duration,
    closed: watch::Sender<bool>,
}

struct PendingCall {
    respond: oneshot::Sender<Result<Value>>,
    /// Set for `subscribe` calls; registered under the returned token before
    /// the call resolves, so no publish can arrive unrouted.
    subscription: Option<Arc<SubscriptionSlot>>,
}

/// Local end of a subscription. The callback is dropped on detach, after
/// which it can never fire again.
struct SubscriptionSlot {
    callback: Mutex<Option<Callback>>,
}

impl SubscriptionSlot {
    fn new(callback: Callback) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    fn deliver(&self, payload: Value) -> bool {
        let callback = lock(&self.callback);
        match callback.as_ref() {
            Some(callback) => {
                if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                    warn!("Subscription callback panicked");
                }
                true
            }
            None => false,
        }
    }

    fn detach(&self) {
        lock(&self.callback).take();
    }
}

/// Removes a call's pending entry however the call ends.
struct PendingGuard<'a> {
    inner: &'a CallerInner,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.id);
    }
}

impl Caller {
    /// Create a caller with no local methods and the default call timeout.
    ///
    /// Inbound calls are still answered, each with `-32601`.
    pub fn new(transport: Arc<dyn Transport>, events: Events) -> Self {
        Self::spawn(transport, events, None, RpcConfig::CALL_TIMEOUT)
    }

    /// Create a caller whose inbound calls are served by `callee`.
    pub fn serve(transport: Arc<dyn Transport>, events: Events, callee: Arc<Callee>) -> Self {
        Self::spawn(transport, events, Some(callee), RpcConfig::CALL_TIMEOUT)
    }

    /// Create a caller and start its event pump.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        events: Events,
        callee: Option<Arc<Callee>>,
        timeout: Duration,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(CallerInner {
            id: NEXT_CALLER_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            timeout,
            closed,
        });

        let callee = callee.unwrap_or_default();
        tokio::spawn(route_events(
            inner.id,
            Arc::downgrade(&inner),
            events,
            callee,
        ));

        Self { inner }
    }

    /// Process-unique id of this caller, used to scope subscriptions.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_alive(&self) -> bool {
        self.inner.transport.is_alive()
    }

    /// Call `method` on the peer and wait for its result.
    ///
    /// Fails immediately with [`TandemError::TransportClosed`] when the
    /// transport is already dead.
    pub async fn execute(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.call(method, params, None).await
    }

    /// Subscribe to the peer's stream `stream`.
    ///
    /// `callback` runs on the caller's event pump for every publish carrying
    /// the returned token, until the subscription is closed or the transport
    /// terminates. Dropping the handle without closing it leaves the
    /// subscription running for the life of the transport.
    pub async fn subscribe<F>(
        &self,
        callback: F,
        stream: &str,
        params: Vec<Value>,
    ) -> Result<Subscription>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let slot = Arc::new(SubscriptionSlot::new(Box::new(callback)));

        let mut args = Vec::with_capacity(params.len() + 1);
        args.push(Value::String(stream.to_string()));
        args.extend(params);

        let result = self
            .call(RpcConfig::SUBSCRIBE_METHOD, args, Some(slot.clone()))
            .await?;
        let id = match result {
            Value::String(token) => token,
            other => {
                return Err(TandemError::InvalidResponse {
                    message: format!("Subscription token must be a string, got {}", other),
                })
            }
        };

        debug!("Subscribed to {} as {}", stream, id);
        Ok(Subscription {
            id,
            caller: self.clone(),
            slot,
        })
    }

    /// Close the transport. Pending calls are rejected.
    pub fn close(&self) {
        self.inner.transport.close();
    }

    /// Resolves once the transport has terminated and every pending call has
    /// been rejected.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Number of live local subscription callbacks.
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }

    pub(crate) fn send_frame(&self, frame: Value) -> Result<()> {
        self.inner.transport.send(frame)
    }

    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        subscription: Option<Arc<SubscriptionSlot>>,
    ) -> Result<Value> {
        let inner = &*self.inner;
        if !inner.transport.is_alive() {
            return Err(TandemError::TransportClosed);
        }

        let id = RequestId::Number(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (respond, response) = oneshot::channel();

        // Register before sending so a terminal event cannot slip between.
        lock(&inner.pending).insert(
            id.clone(),
            PendingCall {
                respond,
                subscription,
            },
        );
        let _guard = PendingGuard {
            inner,
            id: id.clone(),
        };

        let request = Request::new(&id, method, params);
        inner.transport.send(serde_json::to_value(&request)?)?;
        debug!("Caller {} sent {} as {}", inner.id, method, id);

        match tokio::time::timeout(inner.timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TandemError::TransportClosed),
            Err(_) => Err(TandemError::Timeout(inner.timeout)),
        }
    }
}

impl fmt::Debug for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caller")
            .field("id", &self.inner.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl CallerInner {
    fn resolve(&self, id: RequestId, outcome: Result<Value>) {
        let Some(call) = lock(&self.pending).remove(&id) else {
            debug!("Caller {} ignoring response for unknown id {}", self.id, id);
            return;
        };

        let mut registered = None;
        let outcome = match (outcome, call.subscription) {
            (Ok(Value::String(token)), Some(slot)) => {
                lock(&self.subscriptions).insert(token.clone(), slot);
                registered = Some(token.clone());
                Ok(Value::String(token))
            }
            (Ok(other), Some(_)) => Err(TandemError::InvalidResponse {
                message: format!("Subscription token must be a string, got {}", other),
            }),
            (outcome, _) => outcome,
        };

        if call.respond.send(outcome).is_err() {
            // The call already timed out; nobody will ever close this one.
            if let Some(token) = registered {
                if let Some(slot) = lock(&self.subscriptions).remove(&token) {
                    slot.detach();
                }
            }
        }
    }

    fn reject_all(&self, cause: TandemError) {
        let pending: Vec<PendingCall> = lock(&self.pending).drain().map(|(_, call)| call).collect();
        for call in pending {
            let _ = call.respond.send(Err(cause.clone()));
        }
    }

    fn publish(&self, publication: Publication) {
        let slot = lock(&self.subscriptions)
            .get(&publication.subscription)
            .cloned();
        let delivered = match slot {
            Some(slot) => slot.deliver(publication.result),
            None => {
                debug!(
                    "Caller {} has no subscription {}",
                    self.id, publication.subscription
                );
                false
            }
        };

        if RequestId::from_value(&publication.id).is_some() {
            let ack = Response::success(Some(publication.id), Value::Bool(delivered));
            if let Ok(ack) = serde_json::to_value(&ack) {
                let _ = self.transport.send(ack);
            }
        }
    }

    fn terminate(&self, cause: TandemError) {
        debug!("Caller {} terminated: {}", self.id, cause);
        self.reject_all(cause);

        let slots: Vec<Arc<SubscriptionSlot>> = lock(&self.subscriptions)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            slot.detach();
        }

        self.closed.send_replace(true);
    }
}

impl Drop for CallerInner {
    fn drop(&mut self) {
        self.transport.close();
    }
}

async fn route_events(caller_id: u64, weak: Weak<CallerInner>, mut events: Events, callee: Arc<Callee>) {
    let cause = loop {
        let Some(event) = events.recv().await else {
            break TandemError::TransportClosed;
        };
        let Some(inner) = weak.upgrade() else {
            break TandemError::TransportClosed;
        };

        match event {
            TransportEvent::Frame(frame) => route_frame(Caller { inner }, frame, &callee),
            TransportEvent::Failure(e) => break e,
            TransportEvent::Close => break TandemError::TransportClosed,
        }
    };

    if let Some(inner) = weak.upgrade() {
        inner.terminate(cause);
    }
    callee.release(caller_id);
}

fn route_frame(caller: Caller, frame: Frame, callee: &Arc<Callee>) {
    let inner = &caller.inner;
    match frame {
        Frame::Success { id: Some(id), result } => inner.resolve(id, Ok(result)),
        Frame::Error {
            id: Some(id),
            error,
        } => inner.resolve(id, Err(error.into())),
        Frame::Success { id: None, .. } | Frame::Error { id: None, .. } => {
            warn!("Caller {} received a response without a usable id", inner.id);
            inner.reject_all(TandemError::InvalidResponse {
                message: "Response without a usable id".to_string(),
            });
        }
        Frame::Publish(publication) => inner.publish(publication),
        Frame::Call(body) => {
            let callee = callee.clone();
            tokio::spawn(async move {
                if let Err(e) = callee.serve(body, &caller).await {
                    debug!("Caller {} could not send reply: {}", caller.id(), e);
                }
            });
        }
    }
}

/// Handle to a live subscription.
pub struct Subscription {
    id: String,
    caller: Caller,
    slot: Arc<SubscriptionSlot>,
}

impl Subscription {
    /// The token the peer assigned.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop receiving and cancel the subscription on the peer.
    ///
    /// The callback is detached before `unsubscribe` is sent, so it never
    /// fires once this is called. Resolves to the peer's answer: `false` when
    /// the peer had already dropped the subscription.
    pub async fn close(self) -> Result<bool> {
        self.slot.detach();
        lock(&self.caller.inner.subscriptions).remove(&self.id);

        let result = self
            .caller
            .execute(
                RpcConfig::UNSUBSCRIBE_METHOD,
                vec![Value::String(self.id.clone())],
            )
            .await?;
        result.as_bool().ok_or_else(|| TandemError::InvalidResponse {
            message: format!("Unsubscribe answered {}", result),
        })
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
