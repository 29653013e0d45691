//! Websocket implementation of the relay transport.
//!
//! Frames are JSON text messages shaped `{event, data, ack?}` outbound and
//! either `{event, data, ack?}` (a frame, `ack` carrying the id to answer)
//! or `{ack, data}` (an ack reply) inbound. Reconnection is indefinite with
//! a fixed delay; pending acks live outside the per-connection state so an
//! in-flight request survives a reconnect until its emitter gives up.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::transport::{AckHandle, RelayTransport, TransportError, TransportEvent};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    ack: Option<u64>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type Outbound = Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>;

/// Websocket transport to the relay.
pub struct WsTransport {
    url: String,
    next_ack: AtomicU64,
    pending: Pending,
    outbound: Outbound,
    closed: Arc<AtomicBool>,
    reconnect_nudge: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

impl WsTransport {
    /// Create a transport for the relay socket endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            next_ack: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outbound: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            reconnect_nudge: Mutex::new(None),
        }
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<Message>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn send_frame(&self, frame: &WireFrame) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        self.sender()?
            .send(Message::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }
}

async fn run_connection(
    url: &str,
    events: &mpsc::UnboundedSender<TransportEvent>,
    outbound: &Outbound,
    pending: &Pending,
) -> String {
    let (stream, _) = match connect_async(url).await {
        Ok(ok) => ok,
        Err(e) => return format!("connect error: {e}"),
    };
    let (mut sink, mut source) = stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let _ = events.send(TransportEvent::Connected);

    let reason = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame: WireFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("dropping unparseable frame: {e}");
                        continue;
                    }
                };
                dispatch_frame(frame, events, &tx, pending);
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "transport close".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("read error: {e}"),
            None => break "stream ended".to_string(),
        }
    };

    *outbound.lock().unwrap_or_else(PoisonError::into_inner) = None;
    writer.abort();
    reason
}

fn dispatch_frame(
    frame: WireFrame,
    events: &mpsc::UnboundedSender<TransportEvent>,
    tx: &mpsc::UnboundedSender<Message>,
    pending: &Pending,
) {
    match frame.event {
        Some(event) => {
            let ack = frame.ack.map(|id| {
                let (handle, rx) = AckHandle::new();
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Ok(payload) = rx.await {
                        let reply = WireFrame {
                            event: None,
                            data: payload,
                            ack: Some(id),
                        };
                        if let Ok(text) = serde_json::to_string(&reply) {
                            let _ = tx.send(Message::Text(text));
                        }
                    }
                });
                handle
            });
            let _ = events.send(TransportEvent::Frame {
                event,
                data: frame.data,
                ack,
            });
        }
        None => {
            if let Some(id) = frame.ack {
                let waiter = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(frame.data);
                    }
                    None => log::debug!("ack {id} arrived after its waiter left"),
                }
            }
        }
    }
}

#[async_trait]
impl RelayTransport for WsTransport {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (nudge_tx, mut nudge_rx) = mpsc::unbounded_channel::<()>();
        *self
            .reconnect_nudge
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(nudge_tx);

        let url = self.url.clone();
        let outbound = Arc::clone(&self.outbound);
        let pending = Arc::clone(&self.pending);
        let closed = Arc::clone(&self.closed);

        tokio::spawn(async move {
            loop {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                let reason = run_connection(&url, &events_tx, &outbound, &pending).await;
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("relay socket down ({reason}), reconnecting");
                let _ = events_tx.send(TransportEvent::Disconnected {
                    reason: reason.clone(),
                });

                // Wait out the delay, or skip it on an explicit nudge.
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = nudge_rx.recv() => {}
                }
            }
        });

        Ok(events_rx)
    }

    async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError> {
        self.send_frame(&WireFrame {
            event: Some(event.to_string()),
            data,
            ack: None,
        })
    }

    async fn emit_with_ack(&self, event: &str, data: Value) -> Result<Value, TransportError> {
        let id = self.next_ack.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        if let Err(e) = self.send_frame(&WireFrame {
            event: Some(event.to_string()),
            data,
            ack: Some(id),
        }) {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let nudge = self
            .reconnect_nudge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        nudge
            .ok_or(TransportError::NotConnected)?
            .send(())
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = None;
        // Dropping the senders rejects every pending ack.
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_frame_shapes() {
        let frame = WireFrame {
            event: Some("message".to_string()),
            data: serde_json::json!({"x": 1}),
            ack: Some(7),
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert_eq!(text, r#"{"event":"message","data":{"x":1},"ack":7}"#);

        let reply: WireFrame = serde_json::from_str(r#"{"ack":7,"data":{"ok":true}}"#).unwrap();
        assert!(reply.event.is_none());
        assert_eq!(reply.ack, Some(7));
    }

    #[tokio::test]
    async fn test_emit_before_connect_is_not_connected() {
        let transport = WsTransport::new("ws://127.0.0.1:1");
        let result = transport.emit("message", Value::Null).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_emit_after_close_is_closed() {
        let transport = WsTransport::new("ws://127.0.0.1:1");
        transport.close().await;
        let result = transport.emit("message", Value::Null).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
