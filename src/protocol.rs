//! Remote debugging connection to a browser process
//!
//! One `Connection` multiplexes every command, response and event for a
//! browser over a single transport. Commands are correlated by a
//! monotonically increasing id; events fan out to subscribers filtered by
//! method and (flattened) session id. When the transport ends, every
//! outstanding command fails with "Browser closed" and every event stream
//! ends, so higher layers never need their own crash detection.

use crate::{CaptureError, Result};
use dashmap::DashMap;
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

/// A message received from the browser, either a command reply or an event.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Incoming {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RemoteError>,
    method: Option<String>,
    params: Option<Value>,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    message: String,
    #[serde(default)]
    data: Option<String>,
}

struct Subscriber {
    method: String,
    session_id: Option<String>,
    tx: mpsc::UnboundedSender<Value>,
}

type PendingReply = (String, oneshot::Sender<Result<Value>>);

pub struct Connection {
    outgoing: mpsc::UnboundedSender<String>,
    next_id: AtomicU64,
    pending: DashMap<u64, PendingReply>,
    subscribers: std::sync::Mutex<Vec<Subscriber>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    pumps: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Build a connection over an arbitrary text transport.
    ///
    /// `outgoing` receives serialized commands; messages pushed into
    /// `incoming` are dispatched. Dropping every sender of `incoming`
    /// closes the connection.
    pub fn from_channels(
        outgoing: mpsc::UnboundedSender<String>,
        incoming: mpsc::UnboundedReceiver<String>,
    ) -> Arc<Self> {
        let (closed_tx, closed_rx) = watch::channel(false);
        let connection = Arc::new(Self {
            outgoing,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            subscribers: std::sync::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            closed_tx,
            closed_rx,
            pumps: std::sync::Mutex::new(Vec::new()),
        });

        let reader = tokio::spawn(Self::read_loop(Arc::downgrade(&connection), incoming));
        connection.track(reader);
        connection
    }

    /// Connect to a browser's websocket debugging endpoint.
    pub async fn connect(ws_url: &str) -> Result<Arc<Self>> {
        debug!("Connecting to debugging endpoint at {}", ws_url);
        let (socket, _) = connect_async(ws_url)
            .await
            .map_err(|e| CaptureError::BrowserLaunchFailed(format!("{ws_url}: {e}")))?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("Debugging transport write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Debugging transport read failed: {}", e);
                        break;
                    }
                };
                if in_tx.send(text).is_err() {
                    break;
                }
            }
        });

        let connection = Self::from_channels(out_tx, in_rx);
        connection.track(writer);
        connection.track(reader);
        Ok(connection)
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut pumps) = self.pumps.lock() {
            pumps.push(handle);
        }
    }

    async fn read_loop(connection: Weak<Self>, mut incoming: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = incoming.recv().await {
            let Some(connection) = connection.upgrade() else {
                return;
            };
            connection.dispatch(&text);
        }

        if let Some(connection) = connection.upgrade() {
            connection.shutdown();
        }
    }

    fn dispatch(&self, text: &str) {
        let message: Incoming = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed protocol message: {}", e);
                return;
            }
        };

        if let Some(id) = message.id {
            let Some((_, (method, reply))) = self.pending.remove(&id) else {
                trace!("Reply for unknown command {}", id);
                return;
            };

            let outcome = match message.error {
                Some(error) => {
                    let detail = error.data.map(|d| format!(" {d}")).unwrap_or_default();
                    Err(CaptureError::Protocol(format!(
                        "{}: {}{}",
                        method, error.message, detail
                    )))
                }
                None => Ok(message.result.unwrap_or_else(|| json!({}))),
            };
            let _ = reply.send(outcome);
            return;
        }

        if let Some(method) = message.method {
            let params = message.params.unwrap_or(Value::Null);
            let session_id = message.session_id;

            if let Ok(mut subscribers) = self.subscribers.lock() {
                subscribers.retain(|subscriber| {
                    if subscriber.tx.is_closed() {
                        return false;
                    }
                    let session_matches = match &subscriber.session_id {
                        Some(wanted) => session_id.as_deref() == Some(wanted.as_str()),
                        None => true,
                    };
                    if subscriber.method == method && session_matches {
                        return subscriber.tx.send(params.clone()).is_ok();
                    }
                    true
                });
            }
        }
    }

    /// Send a command and wait for its reply.
    pub async fn send(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value> {
        if self.is_closed() {
            return Err(CaptureError::browser_closed());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, (method.to_string(), tx));

        // shutdown() may have drained the map between the check above and the insert
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(CaptureError::browser_closed());
        }

        let mut message = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        if let Some(session_id) = session_id {
            message["sessionId"] = Value::String(session_id.to_string());
        }

        trace!(id = id, method = %method, "sending protocol command");
        if self.outgoing.send(message.to_string()).is_err() {
            self.pending.remove(&id);
            return Err(CaptureError::browser_closed());
        }

        rx.await.unwrap_or_else(|_| Err(CaptureError::browser_closed()))
    }

    /// Stream of `method` events, optionally limited to one session.
    pub fn subscribe(&self, method: &str, session_id: Option<&str>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();

        if let Ok(mut subscribers) = self.subscribers.lock() {
            if !self.is_closed() {
                subscribers.push(Subscriber {
                    method: method.to_string(),
                    session_id: session_id.map(str::to_string),
                    tx,
                });
            }
        }

        EventStream { rx }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close the transport and fail everything outstanding.
    pub fn close(&self) {
        if let Ok(mut pumps) = self.pumps.lock() {
            for pump in pumps.drain(..) {
                pump.abort();
            }
        }
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Debugging connection closed");

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, (_, reply))) = self.pending.remove(&id) {
                let _ = reply.send(Err(CaptureError::browser_closed()));
            }
        }

        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }

        let _ = self.closed_tx.send(true);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(mut pumps) = self.pumps.lock() {
            for pump in pumps.drain(..) {
                pump.abort();
            }
        }
    }
}

/// Events for one subscription; ends when the connection closes.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Value>,
}

impl EventStream {
    pub async fn next_event(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClosedCause;
    use std::time::Duration;

    struct Peer {
        from_client: mpsc::UnboundedReceiver<String>,
        to_client: mpsc::UnboundedSender<String>,
    }

    impl Peer {
        async fn next_command(&mut self) -> Value {
            let text = self.from_client.recv().await.expect("command");
            serde_json::from_str(&text).unwrap()
        }

        fn reply(&self, message: Value) {
            self.to_client.send(message.to_string()).unwrap();
        }
    }

    fn pair() -> (Arc<Connection>, Peer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let connection = Connection::from_channels(out_tx, in_rx);
        (
            connection,
            Peer {
                from_client: out_rx,
                to_client: in_tx,
            },
        )
    }

    #[tokio::test]
    async fn test_replies_are_matched_by_id() {
        let (connection, mut peer) = pair();

        let first = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send("A.one", json!({}), None).await })
        };
        let second = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send("B.two", json!({}), Some("S1")).await })
        };

        let c1 = peer.next_command().await;
        let c2 = peer.next_command().await;
        // answer out of order
        for command in [&c2, &c1] {
            let tag = command["method"].as_str().unwrap().to_string();
            peer.reply(json!({"id": command["id"], "result": {"tag": tag}}));
        }

        assert_eq!(first.await.unwrap().unwrap()["tag"], "A.one");
        assert_eq!(second.await.unwrap().unwrap()["tag"], "B.two");
        let session_command = if c1["method"] == "B.two" { &c1 } else { &c2 };
        assert_eq!(session_command["sessionId"], "S1");
    }

    #[tokio::test]
    async fn test_error_reply_names_method() {
        let (connection, mut peer) = pair();
        let call = tokio::spawn({
            let connection = connection.clone();
            async move {
                connection
                    .send("Emulation.setDeviceMetricsOverride", json!({"width": -1}), None)
                    .await
            }
        });

        let command = peer.next_command().await;
        peer.reply(json!({
            "id": command["id"],
            "error": {"code": -32602, "message": "Invalid parameters", "data": "width: integer value expected"}
        }));

        let err = call.await.unwrap().unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, CaptureError::Protocol(_)));
        assert!(message.contains("Emulation.setDeviceMetricsOverride"));
        assert!(message.contains("width"));
    }

    #[tokio::test]
    async fn test_events_are_filtered_by_method_and_session() {
        let (connection, peer) = pair();
        let mut any_session = connection.subscribe("Page.loadEventFired", None);
        let mut one_session = connection.subscribe("Page.loadEventFired", Some("S2"));

        peer.reply(json!({"method": "Page.loadEventFired", "params": {"n": 1}, "sessionId": "S1"}));
        peer.reply(json!({"method": "Page.other", "params": {}, "sessionId": "S2"}));
        peer.reply(json!({"method": "Page.loadEventFired", "params": {"n": 2}, "sessionId": "S2"}));

        assert_eq!(any_session.next_event().await.unwrap()["n"], 1);
        assert_eq!(any_session.next_event().await.unwrap()["n"], 2);
        assert_eq!(one_session.next_event().await.unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn test_transport_closure_fails_pending_and_ends_streams() {
        let (connection, mut peer) = pair();
        let mut events = connection.subscribe("Fetch.requestPaused", None);
        let call = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send("Page.navigate", json!({"url": "http://h/"}), None).await }
        });

        peer.next_command().await;
        drop(peer);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CaptureError::SessionClosed(ClosedCause::Browser)));
        assert_eq!(err.to_string(), "Browser closed");
        assert!(events.next_event().await.is_none());

        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .expect("closed resolves");
        let late = connection.send("Page.enable", json!({}), None).await;
        assert!(matches!(late, Err(CaptureError::SessionClosed(ClosedCause::Browser))));
    }
}
