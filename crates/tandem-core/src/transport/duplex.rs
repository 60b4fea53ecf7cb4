//! Persistent bidirectional transport.
//!
//! [`DuplexTransport`] drives any text sink/stream pair with two background
//! tasks: a writer draining the outgoing queue and a reader classifying
//! inbound frames. Adapters exist for server-side axum sockets, client-side
//! tokio-tungstenite sockets and an in-memory pair used in tests.

use super::{decode, Events, Transport, TransportEvent};
use crate::error::{Result, TandemError};
use crate::lock;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// A persistent transport over a text sink/stream pair.
pub struct DuplexTransport {
    outgoing: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
}

/// State shared by the handle and both background tasks.
struct Shared {
    /// Taken by the first terminal event; `None` means terminated.
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }

    fn finish(&self, event: TransportEvent) {
        if let Some(events) = lock(&self.events).take() {
            let _ = events.send(event);
            self.shutdown.send_replace(true);
        }
    }

    fn is_alive(&self) -> bool {
        lock(&self.events).is_some()
    }
}

impl DuplexTransport {
    /// Start driving a sink/stream pair.
    ///
    /// The stream ending, or yielding [`TandemError::TransportClosed`], is a
    /// clean close; any other stream or sink error is a failure.
    pub fn spawn<S, R>(sink: S, stream: R) -> (Arc<Self>, Events)
    where
        S: Sink<String, Error = TandemError> + Send + 'static,
        R: Stream<Item = Result<String>> + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            events: Mutex::new(Some(events_tx)),
            shutdown: shutdown_tx,
        });

        tokio::spawn(write_loop(
            sink,
            outgoing_rx,
            shared.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(read_loop(stream, shared.clone(), shutdown_rx));

        let transport = Arc::new(Self {
            outgoing: outgoing_tx,
            shared,
        });
        (transport, events_rx)
    }

    /// Wrap a WebSocket accepted by the axum listener.
    pub fn from_axum(socket: axum::extract::ws::WebSocket) -> (Arc<Self>, Events) {
        use axum::extract::ws::Message;

        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(|e| TandemError::Transport {
                message: e.to_string(),
            })
            .with(|text: String| future::ready(Ok::<_, TandemError>(Message::Text(text))));
        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(TandemError::Transport {
                    message: e.to_string(),
                })),
            })
        });

        Self::spawn(sink, stream)
    }

    /// Wrap a client-side tokio-tungstenite socket.
    pub fn from_tungstenite<S>(socket: WebSocketStream<S>) -> (Arc<Self>, Events)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(TandemError::from)
            .with(|text: String| future::ready(Ok::<_, TandemError>(WsMessage::Text(text))));
        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(WsMessage::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(TandemError::from(e))),
            })
        });

        Self::spawn(sink, stream)
    }
}

/// Two duplex transports connected to each other in memory.
pub fn memory_pair() -> ((Arc<DuplexTransport>, Events), (Arc<DuplexTransport>, Events)) {
    let (a_tx, a_rx) = futures::channel::mpsc::unbounded::<String>();
    let (b_tx, b_rx) = futures::channel::mpsc::unbounded::<String>();

    let a = DuplexTransport::spawn(
        a_tx.sink_map_err(|_| TandemError::TransportClosed),
        b_rx.map(Ok),
    );
    let b = DuplexTransport::spawn(
        b_tx.sink_map_err(|_| TandemError::TransportClosed),
        a_rx.map(Ok),
    );
    (a, b)
}

impl Transport for DuplexTransport {
    fn send(&self, frame: Value) -> Result<()> {
        if !self.shared.is_alive() {
            return Err(TandemError::TransportClosed);
        }
        let text = serde_json::to_string(&frame)?;
        self.outgoing
            .send(text)
            .map_err(|_| TandemError::TransportClosed)
    }

    fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    fn close(&self) {
        self.shared.finish(TransportEvent::Close);
    }
}

impl Drop for DuplexTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolves once shutdown is signalled or the signal's sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

async fn write_loop<S>(
    sink: S,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Sink<String, Error = TandemError> + Send + 'static,
{
    let mut sink = Box::pin(sink);

    loop {
        tokio::select! {
            biased;
            frame = outgoing.recv() => {
                let Some(text) = frame else { break };
                if let Err(e) = sink.send(text).await {
                    debug!("Duplex write failed: {}", e);
                    shared.finish(TransportEvent::Failure(e));
                    break;
                }
            }
            _ = stopped(&mut shutdown) => break,
        }
    }

    let _ = sink.close().await;
}

async fn read_loop<R>(stream: R, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>)
where
    R: Stream<Item = Result<String>> + Send + 'static,
{
    let mut stream = Box::pin(stream);

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(text)) => {
                    if let Some(frame) = decode(&text) {
                        shared.emit(TransportEvent::Frame(frame));
                    }
                }
                Some(Err(TandemError::TransportClosed)) | None => {
                    shared.finish(TransportEvent::Close);
                    break;
                }
                Some(Err(e)) => {
                    debug!("Duplex read failed: {}", e);
                    shared.finish(TransportEvent::Failure(e));
                    break;
                }
            },
            _ = stopped(&mut shutdown) => break,
        }
    }
}
