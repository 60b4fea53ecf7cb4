//! Ephemeral transport: one call over one HTTP POST.

use super::{Events, Transport, TransportEvent};
use crate::error::{Result, TandemError};
use crate::lock;
use crate::message::Frame;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

/// A transport good for exactly one exchange.
///
/// `send` posts the frame and spawns the exchange. The response body is
/// emitted as one frame (or the exchange as one failure), always followed by
/// `Close`. A second `send` fails with [`TandemError::TransportClosed`].
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    authorization: Option<String>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    alive: Arc<AtomicBool>,
}

impl HttpTransport {
    pub fn new(
        client: reqwest::Client,
        url: Url,
        authorization: Option<String>,
    ) -> (Arc<Self>, Events) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            client,
            url,
            authorization,
            events: Mutex::new(Some(events_tx)),
            alive: Arc::new(AtomicBool::new(true)),
        });
        (transport, events_rx)
    }
}

impl Transport for HttpTransport {
    fn send(&self, frame: Value) -> Result<()> {
        let events = lock(&self.events)
            .take()
            .ok_or(TandemError::TransportClosed)?;

        let mut request = self.client.post(self.url.clone()).json(&frame);
        if let Some(authorization) = &self.authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        let alive = self.alive.clone();
        tokio::spawn(async move {
            let event = match exchange(request).await {
                Ok(frame) => TransportEvent::Frame(frame),
                Err(e) => {
                    debug!("HTTP exchange failed: {}", e);
                    TransportEvent::Failure(e)
                }
            };
            alive.store(false, Ordering::SeqCst);
            let _ = events.send(event);
            let _ = events.send(TransportEvent::Close);
        });

        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        // Only an unused transport can still be closed; a running exchange
        // closes itself when it completes.
        if let Some(events) = lock(&self.events).take() {
            let _ = events.send(TransportEvent::Close);
        }
    }
}

async fn exchange(request: reqwest::RequestBuilder) -> Result<Frame> {
    let response = request.send().await?;

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(TandemError::Unauthorized);
    }
    if !status.is_success() {
        return Err(TandemError::Http {
            status: status.as_u16(),
        });
    }

    let body = response.text().await?;
    let value: Value = serde_json::from_str(&body).map_err(|e| TandemError::InvalidResponse {
        message: format!("Response body is not JSON: {}", e),
    })?;

    match Frame::classify(value) {
        Some(frame @ (Frame::Success { .. } | Frame::Error { .. })) => Ok(frame),
        _ => Err(TandemError::InvalidResponse {
            message: "Response body is not a JSON-RPC response".to_string(),
        }),
    }
}
