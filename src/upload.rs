//! Upload queue and build lifecycle
//!
//! Completed snapshots are handed to a single worker which talks to the
//! upload backend one task at a time, so the backend sees snapshots in the
//! order they were released. The upload policy decides when a task is
//! released: immediately, once the next snapshot is ready, or only when the
//! queue is flushed at the end of the run.
//!
//! The build is created on the first upload and shared by every later one.
//! If creating it fails, every queued task fails quickly with the same
//! error. Finalization happens at most once, after the worker drained.

use crate::discovery::CapturedSnapshot;
use crate::{CaptureError, Config, DiscoveryStats, Resource, Result, UploadError, UploadPolicy};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub number: u64,
    pub url: String,
}

/// A resource as referenced by a snapshot payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub url: String,
    pub sha: String,
    pub mimetype: String,
    pub root: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub for_widths: Vec<u32>,
}

impl From<&Resource> for ResourceRef {
    fn from(resource: &Resource) -> Self {
        Self {
            url: resource.url.clone(),
            sha: resource.sha.clone(),
            mimetype: resource.mimetype.clone(),
            root: resource.root,
            for_widths: resource.for_widths.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub name: String,
    pub url: String,
    pub widths: Vec<u32>,
    pub min_height: u32,
    pub resources: Vec<ResourceRef>,
}

/// One completed snapshot waiting to be uploaded. Never changed once queued.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub name: String,
    pub url: String,
    pub widths: Vec<u32>,
    pub min_height: u32,
    pub resources: Vec<Resource>,
    /// Position of the originating request in submission order
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl UploadTask {
    pub fn new(snapshot: CapturedSnapshot, sequence: u64) -> Self {
        Self {
            name: snapshot.name,
            url: snapshot.url,
            widths: snapshot.widths,
            min_height: snapshot.min_height,
            resources: snapshot.resources,
            sequence,
            enqueued_at: Utc::now(),
        }
    }

    pub fn payload(&self) -> SnapshotPayload {
        SnapshotPayload {
            name: self.name.clone(),
            url: self.url.clone(),
            widths: self.widths.clone(),
            min_height: self.min_height,
            resources: self.resources.iter().map(ResourceRef::from).collect(),
        }
    }
}

/// The upload backend.
#[async_trait]
pub trait UploadClient: Send + Sync {
    async fn create_build(&self) -> std::result::Result<Build, UploadError>;

    async fn upload_resource(
        &self,
        build_id: &str,
        resource: &Resource,
    ) -> std::result::Result<(), UploadError>;

    async fn create_snapshot(
        &self,
        build_id: &str,
        snapshot: &SnapshotPayload,
    ) -> std::result::Result<(), UploadError>;

    async fn finalize_build(&self, build_id: &str) -> std::result::Result<(), UploadError>;
}

/// JSON over HTTP client for the upload backend.
pub struct HttpUploadClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl HttpUploadClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(
                config
                    .user_agent
                    .clone()
                    .unwrap_or_else(|| format!("snapshot-capture/{}", env!("CARGO_PKG_VERSION"))),
            )
            .build()
            .map_err(|e| CaptureError::ConfigurationError(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> std::result::Result<reqwest::Response, UploadError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.api_url, path))
            .json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UploadError::new(None, e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(UploadError::new(
            Some(status.as_u16()),
            if message.is_empty() {
                status.to_string()
            } else {
                message
            },
        ))
    }
}

#[async_trait]
impl UploadClient for HttpUploadClient {
    async fn create_build(&self) -> std::result::Result<Build, UploadError> {
        self.post("/builds", json!({}))
            .await?
            .json::<Build>()
            .await
            .map_err(|e| UploadError::new(None, format!("invalid build response: {e}")))
    }

    async fn upload_resource(
        &self,
        build_id: &str,
        resource: &Resource,
    ) -> std::result::Result<(), UploadError> {
        self.post(
            &format!("/builds/{build_id}/resources"),
            json!({
                "url": resource.url,
                "sha": resource.sha,
                "mimetype": resource.mimetype,
                "content": STANDARD.encode(resource.content.as_slice()),
            }),
        )
        .await?;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        build_id: &str,
        snapshot: &SnapshotPayload,
    ) -> std::result::Result<(), UploadError> {
        let body = serde_json::to_value(snapshot)
            .map_err(|e| UploadError::new(None, e.to_string()))?;
        self.post(&format!("/builds/{build_id}/snapshots"), body)
            .await?;
        Ok(())
    }

    async fn finalize_build(&self, build_id: &str) -> std::result::Result<(), UploadError> {
        self.post(&format!("/builds/{build_id}/finalize"), json!({}))
            .await?;
        Ok(())
    }
}

/// State shared between the queue and its worker.
struct Uploader {
    client: Arc<dyn UploadClient>,
    build: OnceCell<std::result::Result<Build, UploadError>>,
    uploaded: Mutex<HashSet<String>>,
    outstanding: watch::Sender<usize>,
    stats: Arc<DiscoveryStats>,
}

impl Uploader {
    async fn build(&self) -> std::result::Result<Build, UploadError> {
        self.build
            .get_or_init(|| async {
                debug!("Creating build");
                let build = self.client.create_build().await;
                match &build {
                    Ok(build) => info!("Build #{} created: {}", build.number, build.url),
                    Err(e) => error!("Failed to create build: {}", e),
                }
                build
            })
            .await
            .clone()
    }

    async fn upload(&self, task: &UploadTask) -> std::result::Result<(), UploadError> {
        let build = self.build().await?;

        for resource in &task.resources {
            let fresh = self
                .uploaded
                .lock()
                .map(|uploaded| !uploaded.contains(&resource.sha))
                .unwrap_or(true);
            if !fresh {
                continue;
            }

            self.client.upload_resource(&build.id, resource).await?;
            if let Ok(mut uploaded) = self.uploaded.lock() {
                uploaded.insert(resource.sha.clone());
            }
        }

        self.client.create_snapshot(&build.id, &task.payload()).await
    }

    async fn process(&self, task: UploadTask) {
        debug!("Uploading snapshot: {}", task.name);

        match self.upload(&task).await {
            Ok(()) => {
                debug!("Snapshot uploaded: {}", task.name);
                self.stats.record_upload(true);
            }
            Err(e) => {
                error!("Encountered an error uploading snapshot: {}", task.name);
                error!("{}", e);
                self.stats.record_upload(false);
            }
        }

        self.outstanding.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Orders completed snapshots on their way to the backend.
pub struct UploadQueue {
    policy: UploadPolicy,
    uploader: Arc<Uploader>,
    sender: Mutex<Option<mpsc::UnboundedSender<UploadTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    held: Mutex<Vec<UploadTask>>,
    closed: AtomicBool,
}

impl UploadQueue {
    pub fn new(
        client: Arc<dyn UploadClient>,
        policy: UploadPolicy,
        stats: Arc<DiscoveryStats>,
    ) -> Self {
        let (outstanding, _) = watch::channel(0);
        let uploader = Arc::new(Uploader {
            client,
            build: OnceCell::new(),
            uploaded: Mutex::new(HashSet::new()),
            outstanding,
            stats,
        });

        let (sender, mut receiver) = mpsc::unbounded_channel::<UploadTask>();
        let worker = tokio::spawn({
            let uploader = uploader.clone();
            async move {
                while let Some(task) = receiver.recv().await {
                    uploader.process(task).await;
                }
            }
        });

        Self {
            policy,
            uploader,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            held: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> UploadPolicy {
        self.policy
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The build, once one was created successfully.
    pub fn build(&self) -> Option<Build> {
        self.uploader.build.get().and_then(|build| build.clone().ok())
    }

    /// Tasks released to the worker and not yet settled.
    pub fn outstanding(&self) -> usize {
        *self.uploader.outstanding.borrow()
    }

    /// Tasks held back by the upload policy.
    pub fn held(&self) -> usize {
        self.held.lock().map(|held| held.len()).unwrap_or(0)
    }

    /// Queue a completed snapshot according to the upload policy.
    pub fn push(&self, task: UploadTask) -> Result<()> {
        if self.is_closed() {
            return Err(CaptureError::Aborted(format!(
                "upload queue is closed: {}",
                task.name
            )));
        }

        match self.policy {
            UploadPolicy::Skip => {
                debug!("Skipping upload: {}", task.name);
                Ok(())
            }
            UploadPolicy::Immediate => self.release(vec![task]),
            UploadPolicy::Delayed => {
                // released while still holding `held` so concurrent pushes
                // reach the worker in the order they took the lock
                let mut held = self.lock_held()?;
                held.retain(|queued| queued.name != task.name);
                let released = std::mem::take(&mut *held);
                held.push(task);
                self.release(released)
            }
            UploadPolicy::Deferred => {
                let mut held = self.lock_held()?;
                held.retain(|queued| queued.name != task.name);
                held.push(task);
                Ok(())
            }
        }
    }

    /// Release every held task to the worker.
    pub fn flush(&self) -> Result<()> {
        let mut held = self.lock_held()?;
        let mut released = std::mem::take(&mut *held);
        if self.policy == UploadPolicy::Deferred {
            released.sort_by_key(|task| task.sequence);
        }
        self.release(released)
    }

    /// Wait until every released task has settled.
    pub async fn idle(&self) {
        let mut outstanding = self.uploader.outstanding.subscribe();
        while *outstanding.borrow_and_update() > 0 {
            if outstanding.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop accepting tasks. With `finalize`, held tasks are flushed, the
    /// worker drains and the build (if any) is finalized; otherwise pending
    /// work is dropped.
    pub async fn close(&self, finalize: bool) -> Result<Option<Build>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        if finalize {
            self.flush()?;
        } else {
            let dropped = std::mem::take(&mut *self.lock_held()?);
            if !dropped.is_empty() {
                debug!("Dropping {} held upload(s)", dropped.len());
            }
        }

        // closing the channel lets the worker finish what it already has
        drop(self.sender.lock().ok().and_then(|mut sender| sender.take()));
        let worker = self.worker.lock().ok().and_then(|mut worker| worker.take());

        if let Some(worker) = worker {
            if finalize {
                let _ = worker.await;
            } else {
                worker.abort();
                self.uploader.outstanding.send_replace(0);
            }
        }

        if !finalize {
            return Ok(None);
        }

        let Some(build) = self.build() else {
            return Ok(None);
        };
        self.uploader.client.finalize_build(&build.id).await?;
        info!("Finalized build #{}: {}", build.number, build.url);
        Ok(Some(build))
    }

    fn release(&self, tasks: Vec<UploadTask>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let sender = self
            .sender
            .lock()
            .map_err(|_| CaptureError::Aborted("upload queue poisoned".to_string()))?;
        let Some(sender) = sender.as_ref() else {
            return Err(CaptureError::Aborted("upload queue is closed".to_string()));
        };

        for task in tasks {
            self.uploader.outstanding.send_modify(|count| *count += 1);
            if let Err(returned) = sender.send(task) {
                self.uploader.outstanding.send_modify(|count| *count = count.saturating_sub(1));
                return Err(CaptureError::Aborted(format!(
                    "upload worker stopped: {}",
                    returned.0.name
                )));
            }
        }
        Ok(())
    }

    fn lock_held(&self) -> Result<std::sync::MutexGuard<'_, Vec<UploadTask>>> {
        self.held
            .lock()
            .map_err(|_| CaptureError::Aborted("upload queue poisoned".to_string()))
    }
}

impl Drop for UploadQueue {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().ok().and_then(|mut worker| worker.take()) {
            worker.abort();
        }
    }
}
