//! Capture service orchestrating discovery and uploads
//!
//! This module provides the `CaptureService` that callers submit snapshot
//! requests to. Each request is validated, run through the capture state
//! machine on a pooled page and handed to the upload queue. Requests share
//! one browser, one resource cache and one build.

use crate::browser_pool::{Browser, PagePool, PagePoolStats};
use crate::discovery::{CapturedSnapshot, Discovery};
use crate::fetcher::{HttpFetcher, ResourceFetcher};
use crate::protocol::Connection;
use crate::serialize::DomSerializer;
use crate::snapshot::{SnapshotOptions, SnapshotRequest};
use crate::upload::{Build, UploadClient, UploadQueue, UploadTask};
use crate::{
    CaptureError, Config, DiscoveryStats, ErrorScope, ResourceCache, Result, StatsSnapshot,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// A snapshot name currently being captured.
struct InFlight {
    id: u64,
    abort: oneshot::Sender<()>,
}

/// Snapshot capture service with a shared browser, cache and upload queue
///
/// # Examples
///
/// ```rust,no_run
/// use snapshot_capture::{CaptureService, Config, HttpUploadClient, OuterHtmlSerializer, SnapshotRequest};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let client = Arc::new(HttpUploadClient::new(&config)?);
///     let service = CaptureService::launch(config, client, Arc::new(OuterHtmlSerializer)).await?;
///
///     service.capture(SnapshotRequest::new("https://example.com")).await?;
///     service.idle().await;
///
///     service.stop(true).await?;
///     Ok(())
/// }
/// ```
pub struct CaptureService {
    config: Arc<Config>,
    browser: Option<Browser>,
    pool: Arc<PagePool>,
    discovery: Discovery,
    queue: UploadQueue,
    stats: Arc<DiscoveryStats>,
    in_flight: DashMap<String, InFlight>,
    next_id: AtomicU64,
    sequence: AtomicU64,
    active: watch::Sender<usize>,
    stopping: AtomicBool,
}

impl CaptureService {
    /// Launch a discovery browser and build a service around it.
    pub async fn launch(
        config: Config,
        client: Arc<dyn UploadClient>,
        serializer: Arc<dyn DomSerializer>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let fetcher: Arc<dyn ResourceFetcher> = Arc::new(HttpFetcher::new(&config)?);
        let browser = Browser::launch(&config).await?;
        let connection = browser.connection();

        Ok(Self::assemble(
            connection,
            Some(browser),
            config,
            client,
            serializer,
            fetcher,
        ))
    }

    /// Build a service on an existing browser connection.
    pub fn new(
        connection: Arc<Connection>,
        config: Config,
        client: Arc<dyn UploadClient>,
        serializer: Arc<dyn DomSerializer>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Self::assemble(connection, None, config, client, serializer, fetcher))
    }

    fn assemble(
        connection: Arc<Connection>,
        browser: Option<Browser>,
        config: Config,
        client: Arc<dyn UploadClient>,
        serializer: Arc<dyn DomSerializer>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let stats = Arc::new(DiscoveryStats::new());
        let cache = Arc::new(ResourceCache::new(!config.disable_cache));
        let pool = PagePool::new(connection, config.concurrency);
        let discovery = Discovery::new(config.clone(), cache, fetcher, serializer, stats.clone());
        let queue = UploadQueue::new(client, config.upload_policy(), stats.clone());
        let (active, _) = watch::channel(0);

        info!(
            "Capture service ready: concurrency {}, uploads {:?}",
            config.concurrency,
            config.upload_policy()
        );

        Arc::new(Self {
            config,
            browser,
            pool,
            discovery,
            queue,
            stats,
            in_flight: DashMap::new(),
            next_id: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
            active,
            stopping: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Capture one snapshot request, resolving once its snapshots are queued.
    ///
    /// A later request with the same name aborts this one. Failures are
    /// logged once here and also returned.
    pub async fn capture(&self, request: SnapshotRequest) -> Result<()> {
        if self.is_stopping() {
            return Err(CaptureError::Aborted(format!(
                "capture service is stopping: {}",
                request.display_name()
            )));
        }

        let display_name = request.display_name();
        let normalized = match request.normalize(&self.config) {
            Ok(normalized) => normalized,
            Err(e) => {
                error!("Encountered an error taking snapshot: {}: {}", display_name, e);
                self.stats.record_failed();
                return Err(e);
            }
        };
        for warning in &normalized.warnings {
            warn!("{}", warning);
        }
        let options = normalized.options;
        for problem in &normalized.errors {
            error!("[{}] {}", options.name, problem);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (abort, aborted) = oneshot::channel();

        if let Some(previous) = self
            .in_flight
            .insert(options.name.clone(), InFlight { id, abort })
        {
            warn!(
                "Received a duplicate snapshot name, the previous snapshot was aborted: {}",
                options.name
            );
            let _ = previous.abort.send(());
        }

        let _active = ActiveCapture::new(self, &options.name, id);
        debug!("Taking snapshot: {}", options.name);

        // dropping the capture future closes its page
        let result = tokio::select! {
            biased;
            _ = aborted => Err(CaptureError::Aborted(options.name.clone())),
            result = self.run(&options) => result,
        };

        match result.and_then(|snapshots| self.enqueue(snapshots, sequence)) {
            Ok(()) => Ok(()),
            Err(e @ CaptureError::Aborted(_)) => {
                debug!("{}", e);
                self.stats.record_aborted();
                Err(e)
            }
            Err(e) => {
                error!("Encountered an error taking snapshot: {}: {}", options.name, e);
                self.stats.record_failed();
                if e.scope() == ErrorScope::Run && !self.pool.is_closed() {
                    // every other capture shares the same browser
                    warn!("Browser is gone, failing the remaining snapshots");
                    self.pool.close_all().await;
                }
                Err(e)
            }
        }
    }

    async fn run(&self, options: &SnapshotOptions) -> Result<Vec<CapturedSnapshot>> {
        let page = self.pool.acquire().await?;
        let result = self.discovery.capture(page.page().clone(), options).await;
        page.release().await;
        result
    }

    fn enqueue(&self, snapshots: Vec<CapturedSnapshot>, sequence: u64) -> Result<()> {
        for snapshot in snapshots {
            info!("Snapshot taken: {}", snapshot.name);
            self.stats.record_captured();
            self.queue.push(UploadTask::new(snapshot, sequence))?;
        }
        Ok(())
    }

    /// Wait for in-flight captures and any released uploads to settle.
    pub async fn idle(&self) {
        self.captures_settled().await;
        self.queue.idle().await;
    }

    async fn captures_settled(&self) {
        let mut active = self.active.subscribe();
        while *active.borrow_and_update() > 0 {
            if active.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the service.
    ///
    /// With `finalize`, in-flight captures are allowed to finish, queued
    /// uploads drain and the build is finalized. Without it, in-flight
    /// captures are aborted and pending uploads dropped.
    pub async fn stop(&self, finalize: bool) -> Result<Option<Build>> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        info!("Stopping capture service");

        if finalize {
            self.captures_settled().await;
        } else {
            let names: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
            for name in names {
                if let Some((_, entry)) = self.in_flight.remove(&name) {
                    let _ = entry.abort.send(());
                }
            }
        }

        self.pool.close_all().await;
        self.captures_settled().await;

        let build = self.queue.close(finalize).await;

        if let Some(browser) = &self.browser {
            browser.close().await;
        }
        self.stats.snapshot().log_summary();
        build
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pool_stats(&self) -> PagePoolStats {
        self.pool.stats()
    }

    pub fn build(&self) -> Option<Build> {
        self.queue.build()
    }
}

/// Counts a capture as active until dropped, and clears its name.
struct ActiveCapture<'a> {
    service: &'a CaptureService,
    name: String,
    id: u64,
}

impl<'a> ActiveCapture<'a> {
    fn new(service: &'a CaptureService, name: &str, id: u64) -> Self {
        service.active.send_modify(|count| *count += 1);
        Self {
            service,
            name: name.to_string(),
            id,
        }
    }
}

impl Drop for ActiveCapture<'_> {
    fn drop(&mut self) {
        self.service
            .in_flight
            .remove_if(&self.name, |_, entry| entry.id == self.id);
        self.service
            .active
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}
