//! Deriv WebSocket Transport
//!
//! A [`Transport`] over one WebSocket connection to the Deriv API.
//!
//! # Protocol
//!
//! - Every outbound request gets a numeric `req_id`; the server echoes it
//!   on the response, which resolves the matching pending request.
//! - `tick` and `ohlc` messages are subscription pushes. They are forwarded
//!   as [`TransportEvent::Live`] in arrival order, whatever `req_id` they
//!   carry.
//! - When the socket ends, every pending request fails with
//!   [`TransportError::ConnectionClosed`] and a single
//!   [`TransportEvent::Closed`] is sent.
//!
//! A `{"ping": 1}` keep-alive is sent on a fixed interval. There is no
//! reconnect: a closed transport stays closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::messages::StreamEvent;
use crate::application::ports::{ResponseFuture, Transport, TransportError, TransportEvent};

// =============================================================================
// Configuration
// =============================================================================

/// Default Deriv WebSocket endpoint.
pub const DEFAULT_WS_URL: &str = "wss://ws.derivws.com/websockets/v3";

/// Configuration for the Deriv transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivTransportConfig {
    /// WebSocket URL, without query string.
    pub url: String,
    /// Registered application id.
    pub app_id: String,
    /// Capacity of the event channel handed to the caller.
    pub event_buffer: usize,
    /// Keep-alive ping interval.
    pub ping_interval: Duration,
}

impl DerivTransportConfig {
    /// Configuration for `app_id` against the default endpoint.
    #[must_use]
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            app_id: app_id.into(),
            event_buffer: 1024,
            ping_interval: Duration::from_secs(30),
        }
    }

    /// Full endpoint including the `app_id` query.
    ///
    /// A URL without a path gets `/` so the request target stays valid.
    #[must_use]
    pub fn endpoint(&self) -> String {
        let has_path = self
            .url
            .split_once("://")
            .is_none_or(|(_, rest)| rest.contains('/'));
        let root = if has_path { "" } else { "/" };
        format!("{}{root}?app_id={}", self.url, self.app_id)
    }
}

// =============================================================================
// Pending Requests
// =============================================================================

type Waiter = oneshot::Sender<Result<Value, TransportError>>;

#[derive(Debug, Default)]
struct PendingRequests {
    next_req_id: u64,
    waiters: HashMap<u64, Waiter>,
    closed: bool,
}

impl PendingRequests {
    fn register(&mut self) -> Option<(u64, oneshot::Receiver<Result<Value, TransportError>>)> {
        if self.closed {
            return None;
        }

        self.next_req_id += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(self.next_req_id, tx);
        Some((self.next_req_id, rx))
    }

    fn resolve(&mut self, req_id: u64, response: Value) -> bool {
        self.waiters.remove(&req_id).is_some_and(|waiter| {
            // Receiver may have been dropped by a fire-and-forget caller
            let _ = waiter.send(Ok(response));
            true
        })
    }

    fn fail(&mut self, req_id: u64, error: TransportError) {
        if let Some(waiter) = self.waiters.remove(&req_id) {
            let _ = waiter.send(Err(error));
        }
    }

    fn close(&mut self) -> usize {
        self.closed = true;
        let drained = self.waiters.len();
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(TransportError::ConnectionClosed));
        }
        drained
    }
}

// =============================================================================
// Inbound Routing
// =============================================================================

/// Classification of one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
enum Inbound {
    /// Subscription push.
    Live(StreamEvent),
    /// Response to a pending request.
    Response { req_id: u64, body: Value },
    /// Anything we cannot attribute.
    Unsolicited(Value),
}

fn classify(text: &str) -> Result<Inbound, TransportError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| TransportError::Decode(e.to_string()))?;

    let msg_type = value.get("msg_type").and_then(Value::as_str);
    if matches!(msg_type, Some("tick" | "ohlc")) {
        let event = serde_json::from_value(value)
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        return Ok(Inbound::Live(event));
    }

    match value.get("req_id").and_then(Value::as_u64) {
        Some(req_id) => Ok(Inbound::Response { req_id, body: value }),
        None => Ok(Inbound::Unsolicited(value)),
    }
}

// =============================================================================
// Transport
// =============================================================================

/// WebSocket transport to the Deriv API.
pub struct DerivTransport {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<PendingRequests>>,
}

impl DerivTransport {
    /// Connect and start the socket tasks.
    ///
    /// Returns the transport and the receiver of its [`TransportEvent`]s.
    /// The tasks stop when the socket closes or `cancel` fires. A closing
    /// socket does not cancel `cancel` itself.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Send`] if the WebSocket handshake fails.
    pub async fn connect(
        config: &DerivTransportConfig,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TransportEvent>), TransportError> {
        tracing::info!(url = %config.url, "Connecting to Deriv stream");

        // Socket tasks stop together without cancelling the caller
        let cancel = cancel.child_token();

        let (ws_stream, _response) = tokio_tungstenite::connect_async(config.endpoint())
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let pending = Arc::new(Mutex::new(PendingRequests::default()));

        let transport = Arc::new(Self {
            outbound: outbound_tx,
            pending: Arc::clone(&pending),
        });

        // Writer
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_cancel.cancelled() => break,
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };
                        if let Err(e) = write.send(message).await {
                            tracing::warn!(error = %e, "WebSocket write failed");
                            break;
                        }
                    }
                }
            }
            let _ = write.close().await;
        });

        // Reader
        let reader_cancel = cancel.clone();
        let outbound_pong = transport.outbound.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = reader_cancel.cancelled() => break,
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            route(&text, &pending, &event_tx).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = outbound_pong.send(Message::Pong(data));
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!("Server sent close frame");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "WebSocket read failed");
                            break;
                        }
                        None => {
                            tracing::info!("WebSocket stream ended");
                            break;
                        }
                    }
                }
            }

            let failed = pending.lock().close();
            tracing::info!(failed_requests = failed, "Deriv connection closed");
            let _ = event_tx.send(TransportEvent::Closed).await;
            reader_cancel.cancel();
        });

        // Keep-alive
        let keepalive = Arc::downgrade(&transport);
        let keepalive_cancel = cancel;
        let period = config.ping_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = keepalive_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(transport) = keepalive.upgrade() else { break };
                        drop(transport.send(json!({"ping": 1})));
                    }
                }
            }
        });

        Ok((transport, event_rx))
    }

    /// Number of requests still waiting for a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().waiters.len()
    }
}

impl Transport for DerivTransport {
    fn send(&self, mut request: Value) -> ResponseFuture {
        let Some(fields) = request.as_object_mut() else {
            return futures::future::ready(Err(TransportError::Send(
                "request must be a JSON object".to_string(),
            )))
            .boxed();
        };

        let mut pending = self.pending.lock();
        let Some((req_id, rx)) = pending.register() else {
            return futures::future::ready(Err(TransportError::ConnectionClosed)).boxed();
        };
        fields.insert("req_id".to_string(), json!(req_id));

        // Queue while holding the lock so requests leave in req_id order
        let text = request.to_string();
        if self.outbound.send(Message::Text(text.into())).is_err() {
            pending.fail(req_id, TransportError::ConnectionClosed);
        }
        drop(pending);

        async move { rx.await.unwrap_or(Err(TransportError::ConnectionClosed)) }.boxed()
    }
}

async fn route(
    text: &str,
    pending: &Mutex<PendingRequests>,
    events: &mpsc::Sender<TransportEvent>,
) {
    match classify(text) {
        Ok(Inbound::Live(event)) => {
            if events
                .send(TransportEvent::Live(Box::new(event)))
                .await
                .is_err()
            {
                tracing::debug!("Event receiver dropped");
            }
        }
        Ok(Inbound::Response { req_id, body }) => {
            if !pending.lock().resolve(req_id, body) {
                tracing::debug!(req_id, "Response for unknown request");
            }
        }
        Ok(Inbound::Unsolicited(body)) => {
            tracing::debug!(msg_type = ?body.get("msg_type"), "Unsolicited message");
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to decode message");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
