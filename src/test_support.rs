//! In-process stand-ins for the browser and the external collaborators
//!
//! `FakeBrowser` answers debugging-protocol commands over channels the way
//! a headless Chromium does for the subset the crate uses. Navigating a page
//! with `Fetch` enabled pauses the document request, then every configured
//! subresource request, and fires the load event once all of them were
//! answered.

use crate::protocol::Connection;
use crate::{
    Build, CaptureError, DomSerializer, DomSnapshot, FetchRequest, FetchedResponse, Page,
    Resource, ResourceFetcher, Result, SerializeOptions, SnapshotPayload, UploadClient,
    UploadError,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct FakeRequest {
    pub url: String,
    pub method: String,
    pub headers: Value,
}

impl FakeRequest {
    pub fn get(url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: "GET".to_string(),
            headers: json!({}),
        }
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers[name] = Value::String(value.to_string());
        self
    }
}

/// How the interceptor answered one paused request.
#[derive(Debug, Clone)]
pub struct Answer {
    pub url: String,
    pub action: String,
    pub status: Option<u64>,
    pub body: Option<Vec<u8>>,
    pub reason: Option<String>,
}

struct Navigation {
    command_id: Value,
    session_id: String,
    document: String,
    document_done: bool,
    outstanding: HashSet<String>,
}

#[derive(Default)]
struct State {
    commands: Vec<(Option<String>, String, Value)>,
    next_id: usize,
    targets: HashMap<String, String>,
    fetch_enabled: HashSet<String>,
    dead_sessions: HashSet<String>,
    requests: Vec<FakeRequest>,
    paused: HashMap<String, String>,
    navigations: Vec<Navigation>,
    answers: Vec<Answer>,
    navigation_error: Option<String>,
    evaluate_results: Vec<(String, Value)>,
    stalled: HashSet<String>,
}

#[derive(Clone)]
pub struct FakeBrowser {
    state: Arc<Mutex<State>>,
    to_client: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    connection: Arc<Connection>,
}

impl FakeBrowser {
    pub fn start() -> Self {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let connection = Connection::from_channels(out_tx, in_rx);

        let browser = Self {
            state: Arc::new(Mutex::new(State::default())),
            to_client: Arc::new(Mutex::new(Some(in_tx))),
            connection,
        };

        let responder = browser.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                let command: Value = match serde_json::from_str(&text) {
                    Ok(command) => command,
                    Err(_) => continue,
                };
                responder.handle(command);
            }
        });

        browser
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.connection.clone()
    }

    /// Requests the page issues after its document loads.
    pub fn set_page_requests(&self, requests: Vec<FakeRequest>) {
        self.state.lock().unwrap().requests = requests;
    }

    /// Never reply to `method`.
    pub fn stall(&self, method: &str) {
        self.state.lock().unwrap().stalled.insert(method.to_string());
    }

    pub fn fail_navigation(&self, error_text: &str) {
        self.state.lock().unwrap().navigation_error = Some(error_text.to_string());
    }

    /// Answer evaluations whose expression contains `pattern` with `value`.
    pub fn evaluate_returns(&self, pattern: &str, value: Value) {
        self.state
            .lock()
            .unwrap()
            .evaluate_results
            .push((pattern.to_string(), value));
    }

    pub fn crash(&self, session_id: &str) {
        self.state
            .lock()
            .unwrap()
            .dead_sessions
            .insert(session_id.to_string());
        self.emit(json!({
            "method": "Inspector.targetCrashed",
            "params": {},
            "sessionId": session_id,
        }));
    }

    pub fn detach(&self, session_id: &str) {
        self.state
            .lock()
            .unwrap()
            .dead_sessions
            .insert(session_id.to_string());
        self.emit(json!({
            "method": "Target.detachedFromTarget",
            "params": {"sessionId": session_id},
        }));
    }

    /// Drop the transport as if the browser process exited.
    pub fn shutdown(&self) {
        self.to_client.lock().unwrap().take();
    }

    pub fn commands(&self) -> Vec<(Option<String>, String, Value)> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn methods_for(&self, session_id: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|(session, _, _)| session.as_deref() == Some(session_id))
            .map(|(_, method, _)| method)
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.commands()
            .iter()
            .filter(|(_, m, _)| m == method)
            .count()
    }

    pub fn answers(&self) -> Vec<Answer> {
        self.state.lock().unwrap().answers.clone()
    }

    pub fn answer_for(&self, url: &str) -> Option<Answer> {
        self.answers().into_iter().find(|a| a.url == url)
    }

    fn emit(&self, message: Value) {
        if let Some(tx) = self.to_client.lock().unwrap().as_ref() {
            let _ = tx.send(message.to_string());
        }
    }

    fn reply(&self, id: &Value, session_id: Option<&str>, result: Value) {
        let mut message = json!({"id": id, "result": result});
        if let Some(session_id) = session_id {
            message["sessionId"] = json!(session_id);
        }
        self.emit(message);
    }

    fn reply_error(&self, id: &Value, message: &str) {
        self.emit(json!({"id": id, "error": {"code": -32000, "message": message}}));
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        format!("{prefix}{}", state.next_id)
    }

    fn handle(&self, command: Value) {
        let id = command["id"].clone();
        let method = command["method"].as_str().unwrap_or_default().to_string();
        let params = command["params"].clone();
        let session_id = command["sessionId"].as_str().map(str::to_string);
        let session = session_id.as_deref();

        {
            let mut state = self.state.lock().unwrap();
            state
                .commands
                .push((session_id.clone(), method.clone(), params.clone()));
            if let Some(session) = session {
                if state.dead_sessions.contains(session) {
                    drop(state);
                    self.reply_error(&id, &format!("{method}: Session with given id not found."));
                    return;
                }
            }
            if state.stalled.contains(&method) {
                return;
            }
        }

        match method.as_str() {
            "Target.createTarget" => {
                let target_id = self.next_id("T");
                self.reply(&id, None, json!({"targetId": target_id}));
            }
            "Target.attachToTarget" => {
                let session_id = self.next_id("S");
                let target_id = params["targetId"].as_str().unwrap_or_default().to_string();
                self.state
                    .lock()
                    .unwrap()
                    .targets
                    .insert(target_id, session_id.clone());
                self.reply(&id, None, json!({"sessionId": session_id}));
            }
            "Target.closeTarget" => {
                let target_id = params["targetId"].as_str().unwrap_or_default();
                let session_id = self.state.lock().unwrap().targets.remove(target_id);
                self.reply(&id, None, json!({"success": true}));
                if let Some(session_id) = session_id {
                    self.detach(&session_id);
                }
            }
            "Fetch.enable" => {
                if let Some(session) = session {
                    self.state
                        .lock()
                        .unwrap()
                        .fetch_enabled
                        .insert(session.to_string());
                }
                self.reply(&id, session, json!({}));
            }
            "Page.navigate" => self.navigate(id, session.unwrap_or_default(), &params),
            "Fetch.fulfillRequest" | "Fetch.continueRequest" | "Fetch.failRequest" => {
                self.reply(&id, session, json!({}));
                self.answer(&method, &params);
            }
            "Runtime.evaluate" => self.evaluate(&id, session, &params),
            "Runtime.compileScript" => {
                let source = params["expression"].as_str().unwrap_or_default();
                if source.contains("@@") {
                    self.reply(
                        &id,
                        session,
                        json!({"exceptionDetails": {"text": "SyntaxError: Invalid or unexpected token"}}),
                    );
                } else {
                    self.reply(&id, session, json!({}));
                }
            }
            "Page.addScriptToEvaluateOnNewDocument" => {
                self.reply(&id, session, json!({"identifier": "1"}));
            }
            _ => self.reply(&id, session, json!({})),
        }
    }

    fn navigate(&self, id: Value, session_id: &str, params: &Value) {
        let url = params["url"].as_str().unwrap_or_default().to_string();
        let (error, intercepted) = {
            let state = self.state.lock().unwrap();
            (
                state.navigation_error.clone(),
                state.fetch_enabled.contains(session_id),
            )
        };

        if let Some(error_text) = error {
            self.reply(&id, Some(session_id), json!({"errorText": error_text}));
            return;
        }

        if !intercepted {
            self.reply(&id, Some(session_id), json!({"frameId": "F1"}));
            self.emit(json!({"method": "Page.loadEventFired", "params": {}, "sessionId": session_id}));
            return;
        }

        let document = self.next_id("interception-");
        {
            let mut state = self.state.lock().unwrap();
            state.paused.insert(document.clone(), url.clone());
            state.navigations.push(Navigation {
                command_id: id,
                session_id: session_id.to_string(),
                document: document.clone(),
                document_done: false,
                outstanding: HashSet::new(),
            });
        }
        self.pause(session_id, &document, &FakeRequest::get(&url), "Document");
    }

    fn pause(&self, session_id: &str, request_id: &str, request: &FakeRequest, resource_type: &str) {
        self.emit(json!({
            "method": "Fetch.requestPaused",
            "sessionId": session_id,
            "params": {
                "requestId": request_id,
                "request": {
                    "url": request.url,
                    "method": request.method,
                    "headers": request.headers,
                },
                "frameId": "F1",
                "resourceType": resource_type,
            },
        }));
    }

    fn answer(&self, method: &str, params: &Value) {
        let request_id = params["requestId"].as_str().unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();
        let url = state.paused.remove(&request_id).unwrap_or_default();

        let action = match method {
            "Fetch.fulfillRequest" => "fulfill",
            "Fetch.continueRequest" => "continue",
            _ => "fail",
        };
        state.answers.push(Answer {
            url,
            action: action.to_string(),
            status: params["responseCode"].as_u64(),
            body: params["body"]
                .as_str()
                .and_then(|body| STANDARD.decode(body).ok()),
            reason: params["errorReason"].as_str().map(str::to_string),
        });

        let mut emit = Vec::new();
        let mut finished = Vec::new();
        let requests = state.requests.clone();
        let mut new_paused = Vec::new();

        for (index, navigation) in state.navigations.iter_mut().enumerate() {
            if navigation.document == request_id && !navigation.document_done {
                navigation.document_done = true;
                if action == "fail" {
                    emit.push(json!({
                        "id": navigation.command_id,
                        "result": {"errorText": "net::ERR_FAILED"},
                        "sessionId": navigation.session_id,
                    }));
                    finished.push(index);
                    continue;
                }
                emit.push(json!({
                    "id": navigation.command_id,
                    "result": {"frameId": "F1"},
                    "sessionId": navigation.session_id,
                }));
                for request in &requests {
                    new_paused.push((navigation.session_id.clone(), request.clone()));
                }
            } else {
                navigation.outstanding.remove(&request_id);
            }
        }

        let mut pauses = Vec::new();
        for (session_id, request) in new_paused {
            state.next_id += 1;
            let request_id = format!("interception-{}", state.next_id);
            state.paused.insert(request_id.clone(), request.url.clone());
            if let Some(navigation) = state
                .navigations
                .iter_mut()
                .find(|n| n.session_id == session_id)
            {
                navigation.outstanding.insert(request_id.clone());
            }
            pauses.push((session_id, request_id, request));
        }

        for (index, navigation) in state.navigations.iter().enumerate() {
            if navigation.document_done
                && navigation.outstanding.is_empty()
                && !finished.contains(&index)
            {
                emit.push(json!({
                    "method": "Page.loadEventFired",
                    "params": {},
                    "sessionId": navigation.session_id,
                }));
                finished.push(index);
            }
        }
        for index in finished.into_iter().rev() {
            state.navigations.remove(index);
        }
        drop(state);

        // replies and load events must be queued before pauses for the same page
        let (events, replies): (Vec<_>, Vec<_>) =
            emit.into_iter().partition(|m| m.get("method").is_some());
        for message in replies {
            self.emit(message);
        }
        for (session_id, request_id, request) in pauses {
            self.pause(&session_id, &request_id, &request, "Other");
        }
        for message in events {
            self.emit(message);
        }
    }

    fn evaluate(&self, id: &Value, session: Option<&str>, params: &Value) {
        let expression = params["expression"].as_str().unwrap_or_default();

        if expression.contains("__hang__") {
            return;
        }
        if expression.contains("__throw__") {
            self.reply(
                id,
                session,
                json!({
                    "result": {"type": "object", "subtype": "error"},
                    "exceptionDetails": {
                        "text": "Uncaught",
                        "exception": {"description": "Error: __throw__ boom"},
                    },
                }),
            );
            return;
        }
        if expression.contains("__timeout__") {
            let message = "Selector \".missing\" not found within timeout: 100ms";
            self.reply(
                id,
                session,
                json!({
                    "result": {"type": "object", "subtype": "error"},
                    "exceptionDetails": {
                        "text": "Uncaught",
                        "exception": {"description": format!("Error: {message}")},
                    },
                }),
            );
            return;
        }

        let value = self
            .state
            .lock()
            .unwrap()
            .evaluate_results
            .iter()
            .find(|(pattern, _)| expression.contains(pattern.as_str()))
            .map(|(_, value)| value.clone());

        match value {
            Some(value) => self.reply(id, session, json!({"result": {"type": "object", "value": value}})),
            None => self.reply(id, session, json!({"result": {"type": "undefined"}})),
        }
    }
}

/// Serves canned bodies by URL and counts every fetch.
#[derive(Default)]
pub struct MapFetcher {
    bodies: Mutex<HashMap<String, (u16, String, Vec<u8>)>>,
    redirects: Mutex<HashMap<String, String>>,
    hanging: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    fetched: Mutex<Vec<String>>,
}

impl MapFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, mimetype: &str, body: &[u8]) {
        self.serve_status(url, 200, mimetype, body);
    }

    pub fn serve_status(&self, url: &str, status: u16, mimetype: &str, body: &[u8]) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, mimetype.to_string(), body.to_vec()));
    }

    pub fn redirect(&self, from: &str, to: &str) {
        self.redirects
            .lock()
            .unwrap()
            .insert(from.to_string(), to.to_string());
    }

    /// Never answer requests for `url`.
    pub fn hang(&self, url: &str) {
        self.hanging.lock().unwrap().insert(url.to_string());
    }

    pub fn delay(&self, url: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetched().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl ResourceFetcher for MapFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResponse> {
        self.fetched.lock().unwrap().push(request.url.clone());

        if self.hanging.lock().unwrap().contains(&request.url) {
            futures::future::pending::<()>().await;
        }
        let delay = self.delays.lock().unwrap().get(&request.url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let final_url = self
            .redirects
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or_else(|| request.url.clone());

        let found = self.bodies.lock().unwrap().get(&final_url).cloned();
        match found {
            Some((status, mimetype, body)) => Ok(FetchedResponse {
                url: final_url,
                status,
                headers: vec![("content-type".to_string(), mimetype.clone())],
                mimetype,
                body,
            }),
            None => Err(CaptureError::Resource(format!("connection refused: {}", request.url))),
        }
    }
}

/// Serializes a fixed document, optionally varying by viewport width.
#[derive(Default)]
pub struct FakeSerializer {
    html: String,
    by_width: HashMap<u32, String>,
    warnings: Vec<String>,
    calls: AtomicUsize,
}

impl FakeSerializer {
    pub fn new(html: &str) -> Self {
        Self {
            html: html.to_string(),
            ..Default::default()
        }
    }

    pub fn with_width(mut self, width: u32, html: &str) -> Self {
        self.by_width.insert(width, html.to_string());
        self
    }

    pub fn with_warning(mut self, warning: &str) -> Self {
        self.warnings.push(warning.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DomSerializer for FakeSerializer {
    async fn serialize(&self, page: &Page, _options: &SerializeOptions) -> Result<DomSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let width = page.viewport().map(|(width, _)| width).unwrap_or_default();
        let html = self.by_width.get(&width).unwrap_or(&self.html).clone();

        Ok(DomSnapshot {
            html,
            resources: Vec::new(),
            warnings: self.warnings.clone(),
        })
    }
}

/// Records every backend call in order.
#[derive(Default)]
pub struct RecordingClient {
    calls: Mutex<Vec<String>>,
    snapshots: Mutex<Vec<SnapshotPayload>>,
    failing_snapshots: Mutex<HashSet<String>>,
    fail_build: Mutex<bool>,
    upload_delay: Mutex<Option<Duration>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_snapshot(&self, name: &str) {
        self.failing_snapshots.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_build(&self) {
        *self.fail_build.lock().unwrap() = true;
    }

    pub fn slow_uploads(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn snapshots(&self) -> Vec<SnapshotPayload> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        self.snapshots().into_iter().map(|s| s.name).collect()
    }
}

#[async_trait]
impl UploadClient for RecordingClient {
    async fn create_build(&self) -> std::result::Result<Build, UploadError> {
        self.calls.lock().unwrap().push("create_build".to_string());
        if *self.fail_build.lock().unwrap() {
            return Err(UploadError::new(Some(401), "Unauthorized"));
        }
        Ok(Build {
            id: "123".to_string(),
            number: 1,
            url: "https://example.test/builds/123".to_string(),
        })
    }

    async fn upload_resource(
        &self,
        _build_id: &str,
        resource: &Resource,
    ) -> std::result::Result<(), UploadError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("upload_resource {}", resource.url));
        Ok(())
    }

    async fn create_snapshot(
        &self,
        _build_id: &str,
        snapshot: &SnapshotPayload,
    ) -> std::result::Result<(), UploadError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("create_snapshot {}", snapshot.name));
        let delay = *self.upload_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_snapshots.lock().unwrap().contains(&snapshot.name) {
            return Err(UploadError::new(Some(422), "Invalid snapshot"));
        }
        self.snapshots.lock().unwrap().push(snapshot.clone());
        Ok(())
    }

    async fn finalize_build(&self, _build_id: &str) -> std::result::Result<(), UploadError> {
        self.calls.lock().unwrap().push("finalize_build".to_string());
        Ok(())
    }
}
