//! One browser tab driven over the shared debugging connection
//!
//! Every operation on a `Page` races the tab's closed signal, so a tab that
//! is closed, crashes, or loses its browser mid-operation fails with the
//! matching `SessionClosed` cause instead of hanging or timing out.

use crate::protocol::{Connection, EventStream};
use crate::{validate_url, CaptureError, ClosedCause, Result};
use futures::future::Future;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct Page {
    connection: Arc<Connection>,
    target_id: String,
    session_id: String,
    closed_tx: watch::Sender<Option<ClosedCause>>,
    closed_rx: watch::Receiver<Option<ClosedCause>>,
    viewport: std::sync::Mutex<Option<(u32, u32)>>,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Page {
    /// Open a blank tab and attach a flattened session to it.
    pub async fn open(connection: Arc<Connection>) -> Result<Arc<Self>> {
        let created = connection
            .send("Target.createTarget", json!({"url": "about:blank"}), None)
            .await?;
        let target_id = string_field(&created, "targetId", "Target.createTarget")?;
        let mut pending = PendingTarget {
            connection: connection.clone(),
            target_id: Some(target_id.clone()),
        };

        let attached = connection
            .send(
                "Target.attachToTarget",
                json!({"targetId": target_id, "flatten": true}),
                None,
            )
            .await?;
        let session_id = string_field(&attached, "sessionId", "Target.attachToTarget")?;

        let (closed_tx, closed_rx) = watch::channel(None);
        let page = Arc::new(Self {
            connection,
            target_id,
            session_id,
            closed_tx,
            closed_rx,
            viewport: std::sync::Mutex::new(None),
            watcher: std::sync::Mutex::new(None),
        });
        page.start_watcher();

        let setup = async {
            page.send("Page.enable", json!({})).await?;
            page.send("Runtime.enable", json!({})).await?;
            page.send("Inspector.enable", json!({})).await?;
            page.send("Page.setLifecycleEventsEnabled", json!({"enabled": true}))
                .await?;
            Ok::<_, CaptureError>(())
        };
        if let Err(e) = setup.await {
            pending.disarm();
            page.close().await;
            return Err(e);
        }
        pending.disarm();

        debug!("Opened page {} (session {})", page.target_id, page.session_id);
        Ok(page)
    }

    fn start_watcher(self: &Arc<Self>) {
        let mut detached = self.connection.subscribe("Target.detachedFromTarget", None);
        let mut crashed = self
            .connection
            .subscribe("Inspector.targetCrashed", Some(&self.session_id));
        let session_id = self.session_id.clone();
        let closed_tx = self.closed_tx.clone();

        let handle = tokio::spawn(async move {
            let cause = loop {
                tokio::select! {
                    event = detached.next_event() => match event {
                        Some(params) if params["sessionId"] == session_id.as_str() => break ClosedCause::Page,
                        Some(_) => continue,
                        None => break ClosedCause::Browser,
                    },
                    event = crashed.next_event() => match event {
                        Some(_) => break ClosedCause::PageCrashed,
                        None => break ClosedCause::Browser,
                    },
                }
            };
            closed_tx.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(cause);
                    true
                } else {
                    false
                }
            });
        });

        if let Ok(mut watcher) = self.watcher.lock() {
            *watcher = Some(handle);
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn closed_cause(&self) -> Option<ClosedCause> {
        *self.closed_rx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_cause().is_some()
    }

    /// Resolves with the cause once the page can no longer be used.
    pub async fn closed(&self) -> ClosedCause {
        let mut rx = self.closed_rx.clone();
        loop {
            if let Some(cause) = *rx.borrow() {
                return cause;
            }
            if rx.changed().await.is_err() {
                return ClosedCause::Page;
            }
        }
    }

    /// Run `operation` unless the page closes first.
    pub async fn guard<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(cause) = self.closed_cause() {
            return Err(CaptureError::SessionClosed(cause));
        }

        tokio::select! {
            biased;
            result = operation => result.map_err(|e| match (self.closed_cause(), e) {
                // replies for a detached session come back as protocol errors
                (Some(cause), CaptureError::Protocol(_)) => CaptureError::SessionClosed(cause),
                (_, e) => e,
            }),
            cause = self.closed() => Err(CaptureError::SessionClosed(cause)),
        }
    }

    /// Send a command to this page's session.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.guard(self.connection.send(method, params, Some(&self.session_id)))
            .await
    }

    /// Events of `method` emitted for this page.
    pub fn subscribe(&self, method: &str) -> EventStream {
        self.connection.subscribe(method, Some(&self.session_id))
    }

    /// Navigate and wait for the load event.
    ///
    /// Requests made by the navigation go through any installed interceptor,
    /// which may answer the document itself without touching the network.
    pub async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        validate_url(url).map_err(|_| {
            CaptureError::Navigation(format!("Unsupported URL or scheme: {url}"))
        })?;

        let mut load = self.subscribe("Page.loadEventFired");
        let result = self.send("Page.navigate", json!({"url": url})).await?;

        if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
            if !error_text.is_empty() {
                return Err(CaptureError::Navigation(format!("{error_text} at {url}")));
            }
        }

        self.guard(async {
            match tokio::time::timeout(timeout, load.next_event()).await {
                Ok(Some(_)) => Ok(()),
                Ok(None) => Err(CaptureError::SessionClosed(
                    self.closed_cause().unwrap_or(ClosedCause::Browser),
                )),
                Err(_) => Err(CaptureError::Navigation(format!(
                    "Navigation timed out after {timeout:?}: {url}"
                ))),
            }
        })
        .await
    }

    pub async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        for (name, value) in [("width", width), ("height", height)] {
            if value == 0 {
                return Err(CaptureError::Protocol(format!(
                    "Emulation.setDeviceMetricsOverride: Invalid parameters: {name} must be greater than 0"
                )));
            }
        }

        self.send(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": width,
                "height": height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
        )
        .await?;

        if let Ok(mut viewport) = self.viewport.lock() {
            *viewport = Some((width, height));
        }
        Ok(())
    }

    /// Current emulated viewport, if one was set.
    pub fn viewport(&self) -> Option<(u32, u32)> {
        self.viewport.lock().ok().and_then(|v| *v)
    }

    /// Call `function` (JavaScript source of a function) with JSON `args`.
    ///
    /// Promises are awaited and the result is returned by value.
    pub async fn evaluate(&self, function: &str, args: &[Value]) -> Result<Value> {
        let expression = format!(
            "({}).apply(null, {})",
            function,
            Value::Array(args.to_vec())
        );

        let result = self
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                    "userGesture": true,
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            return Err(CaptureError::Script(exception_message(details)));
        }

        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Parse `source` in the page without running it.
    pub async fn compile(&self, source: &str) -> Result<()> {
        let result = self
            .send(
                "Runtime.compileScript",
                json!({
                    "expression": source,
                    "sourceURL": "",
                    "persistScript": false,
                }),
            )
            .await?;

        match result.get("exceptionDetails") {
            Some(details) => Err(CaptureError::ScriptCompile(exception_message(details))),
            None => Ok(()),
        }
    }

    /// Evaluate `source` in every document this page loads from now on.
    pub async fn insert_script(&self, source: &str) -> Result<()> {
        self.send(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({"source": source}),
        )
        .await?;
        Ok(())
    }

    pub async fn set_javascript_enabled(&self, enabled: bool) -> Result<()> {
        self.send(
            "Emulation.setScriptExecutionDisabled",
            json!({"value": !enabled}),
        )
        .await?;
        Ok(())
    }

    /// Close the tab. Safe to call more than once.
    pub async fn close(&self) {
        let already_closed = !self.closed_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(ClosedCause::Page);
                true
            } else {
                false
            }
        });

        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(handle) = watcher.take() {
                handle.abort();
            }
        }

        if already_closed || self.connection.is_closed() {
            return;
        }

        if let Err(e) = self
            .connection
            .send(
                "Target.closeTarget",
                json!({"targetId": self.target_id}),
                None,
            )
            .await
        {
            warn!("Failed to close page {}: {}", self.target_id, e);
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(handle) = watcher.take() {
                handle.abort();
            }
        }
    }
}

/// A target created by `Page::open` that is closed again unless the open
/// completes, including when the open future is dropped midway.
struct PendingTarget {
    connection: Arc<Connection>,
    target_id: Option<String>,
}

impl PendingTarget {
    fn disarm(&mut self) {
        self.target_id = None;
    }
}

impl Drop for PendingTarget {
    fn drop(&mut self) {
        let Some(target_id) = self.target_id.take() else {
            return;
        };
        if self.connection.is_closed() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let connection = self.connection.clone();
        runtime.spawn(async move {
            debug!("Closing abandoned target {}", target_id);
            if let Err(e) = connection
                .send("Target.closeTarget", json!({"targetId": target_id}), None)
                .await
            {
                warn!("Failed to close abandoned target {}: {}", target_id, e);
            }
        });
    }
}

fn string_field(value: &Value, field: &str, method: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CaptureError::Protocol(format!("{method}: missing {field} in reply")))
}

fn exception_message(details: &Value) -> String {
    details
        .get("exception")
        .and_then(|e| e.get("description").or_else(|| e.get("value")))
        .and_then(Value::as_str)
        .or_else(|| details.get("text").and_then(Value::as_str))
        .unwrap_or("Unknown script error")
        .to_string()
}
