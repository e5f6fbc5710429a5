//! Request interception for asset discovery
//!
//! Every request a discovery page makes is paused in the `Fetch` domain and
//! answered here. The root document can be served from a supplied DOM
//! snapshot, data URIs and event streams go straight through, requests to
//! hosts outside the allow-list are aborted, and everything else is fetched
//! (or served from the cache), handed back to the page and recorded as a
//! resource.
//!
//! Failures are contained per request: a request that cannot be handled is
//! failed for the page and logged with its URL, and the capture carries on.

use crate::fetcher::{FetchRequest, FetchedResponse, ResourceFetcher};
use crate::page::Page;
use crate::{
    extract_hostname, format_bytes, normalize_url, CaptureError, Config, DiscoveryStats,
    HostnameMatcher, Resource, ResourceCache, ResourceSet, Result,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Response headers that no longer describe a body we hand back ourselves.
const DROPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
];

/// Per-snapshot interception settings.
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    pub root_url: String,
    /// Served instead of fetching the root document when present.
    pub root_html: Option<String>,
    pub allowed_hostnames: HostnameMatcher,
    pub disallowed_hostnames: HostnameMatcher,
    pub max_resource_size: usize,
    pub request_headers: HashMap<String, String>,
}

impl NetworkOptions {
    /// Options for `root_url`; its own host is always allowed.
    pub fn new(config: &Config, root_url: &str, root_html: Option<String>) -> Self {
        let mut allowed_hostnames = HostnameMatcher::new(&config.allowed_hostnames);
        if let Some(hostname) = extract_hostname(root_url) {
            allowed_hostnames.push(hostname);
        }

        Self {
            root_url: root_url.to_string(),
            root_html,
            allowed_hostnames,
            disallowed_hostnames: HostnameMatcher::new(&config.disallowed_hostnames),
            max_resource_size: config.max_resource_size,
            request_headers: config.request_headers.clone(),
        }
    }
}

/// What to do with one paused request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Answer with the supplied root document.
    ServeRoot,
    /// Let the browser handle it; never captured or counted for idle.
    Passthrough,
    /// Abort the request.
    Deny,
    /// Fetch (or serve from cache) and record it.
    Capture,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedRequest {
    pub request_id: String,
    pub request: RequestInfo,
    #[serde(default)]
    pub resource_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestInfo {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl RequestInfo {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Decide how to answer `request`.
pub fn decide(request: &RequestInfo, options: &NetworkOptions) -> Decision {
    if normalize_url(&request.url) == normalize_url(&options.root_url) {
        return match options.root_html {
            Some(_) => Decision::ServeRoot,
            None => Decision::Passthrough,
        };
    }

    if request.url.starts_with("data:") {
        return Decision::Passthrough;
    }

    if request
        .header("accept")
        .map_or(false, |accept| accept.contains("text/event-stream"))
    {
        return Decision::Passthrough;
    }

    let Some(hostname) = extract_hostname(&request.url) else {
        return Decision::Passthrough;
    };

    if options.disallowed_hostnames.matches(&hostname)
        || !options.allowed_hostnames.matches(&hostname)
    {
        return Decision::Deny;
    }

    if !request.method.eq_ignore_ascii_case("GET") {
        return Decision::Passthrough;
    }

    Decision::Capture
}

/// Debounced tracker of capturable requests in flight.
///
/// The network is idle once nothing has been outstanding for a whole quiet
/// window. Any request starting or finishing restarts the window.
#[derive(Debug)]
pub struct IdleTracker {
    pending: Mutex<HashMap<String, String>>,
    activity: watch::Sender<u64>,
}

impl IdleTracker {
    pub fn new() -> Self {
        let (activity, _) = watch::channel(0);
        Self {
            pending: Mutex::new(HashMap::new()),
            activity,
        }
    }

    pub fn request_started(&self, request_id: &str, url: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(request_id.to_string(), url.to_string());
        }
        self.activity.send_modify(|generation| *generation += 1);
    }

    pub fn request_finished(&self, request_id: &str) {
        let removed = self
            .pending
            .lock()
            .map(|mut pending| pending.remove(request_id).is_some())
            .unwrap_or(false);
        if removed {
            self.activity.send_modify(|generation| *generation += 1);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn pending_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .pending
            .lock()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        urls.sort();
        urls
    }

    /// Wait until nothing was in flight for `quiet`, failing after `ceiling`.
    pub async fn wait_for_idle(&self, quiet: Duration, ceiling: Duration) -> Result<()> {
        let mut activity = self.activity.subscribe();

        let settle = async {
            loop {
                activity.borrow_and_update();

                if self.pending_count() == 0 {
                    match tokio::time::timeout(quiet, activity.changed()).await {
                        Err(_) => return,
                        Ok(_) => continue,
                    }
                } else if activity.changed().await.is_err() {
                    return;
                }
            }
        };

        tokio::time::timeout(ceiling, settle)
            .await
            .map_err(|_| CaptureError::NetworkIdleTimeout {
                timeout: ceiling,
                pending: self.pending_urls(),
            })
    }
}

impl Default for IdleTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct RequestHandler {
    page: Arc<Page>,
    options: NetworkOptions,
    cache: Arc<ResourceCache>,
    fetcher: Arc<dyn ResourceFetcher>,
    idle: Arc<IdleTracker>,
    resources: Arc<Mutex<ResourceSet>>,
    stats: Arc<DiscoveryStats>,
}

impl RequestHandler {
    async fn handle(&self, paused: PausedRequest, decision: Decision) {
        let url = paused.request.url.clone();

        let outcome = match decision {
            Decision::ServeRoot => self.serve_root(&paused).await,
            Decision::Passthrough => self.continue_request(&paused).await,
            Decision::Deny => {
                debug!("- Skipping disallowed hostname: {}", url);
                self.stats.record_denied();
                self.fail_request(&paused, "BlockedByClient").await
            }
            Decision::Capture => {
                let outcome = self.capture(&paused).await;
                self.idle.request_finished(&paused.request_id);
                outcome
            }
        };

        if let Err(e) = outcome {
            if e.is_closed() {
                debug!("Page went away while handling {}: {}", url, e);
                return;
            }
            warn!("Encountered an error processing resource: {}", url);
            warn!("{}", e);
            // the page must not wait on a request we could not answer
            let _ = self.fail_request(&paused, "Failed").await;
        }
    }

    async fn serve_root(&self, paused: &PausedRequest) -> Result<()> {
        let html = self.options.root_html.as_deref().unwrap_or_default();
        debug!("- Serving root resource: {}", paused.request.url);
        self.fulfill(
            paused,
            200,
            &[("content-type".to_string(), "text/html".to_string())],
            html.as_bytes(),
        )
        .await
    }

    async fn capture(&self, paused: &PausedRequest) -> Result<()> {
        let url = &paused.request.url;

        if let Some(cached) = self.cache.lookup(url) {
            debug!("- Resource cache hit: {}", url);
            self.stats.record_cache_hit();
            self.fulfill(
                paused,
                200,
                &[("content-type".to_string(), cached.mimetype.clone())],
                &cached.content,
            )
            .await?;
            self.record((*cached).clone());
            return Ok(());
        }

        let mut request = FetchRequest {
            url: url.clone(),
            method: paused.request.method.clone(),
            headers: paused.request.headers.clone(),
            max_size: Some(self.options.max_resource_size),
        };
        request.headers.extend(self.options.request_headers.clone());

        let response = match self.fetcher.fetch(&request).await {
            // the page still loads it, it just is not part of the snapshot
            Err(CaptureError::ResourceTooLarge { size, .. }) => {
                info!("Skipping - Max file size exceeded [{}]: {}", format_bytes(size), url);
                self.stats.record_skipped();
                return self.continue_request(paused).await;
            }
            result => result?,
        };
        self.stats.record_fetched();

        if response.is_event_stream() {
            self.idle.request_finished(&paused.request_id);
            return self.continue_request(paused).await;
        }

        self.fulfill(
            paused,
            response.status,
            &response_headers(&response),
            &response.body,
        )
        .await?;

        if !response.is_success() || response.body.is_empty() {
            debug!("- Not capturing {} response: {}", response.status, url);
            return Ok(());
        }

        if response.body.len() > self.options.max_resource_size {
            info!(
                "Skipping - Max file size exceeded [{}]: {}",
                format_bytes(response.body.len()),
                url
            );
            self.stats.record_skipped();
            return Ok(());
        }

        let FetchedResponse {
            url: final_url,
            mimetype,
            body,
            ..
        } = response;
        let resource = self
            .cache
            .store(url, Resource::new(final_url, body, mimetype));
        self.record((*resource).clone());
        Ok(())
    }

    fn record(&self, resource: Resource) {
        let url = resource.url.clone();
        if let Ok(mut resources) = self.resources.lock() {
            if resources.insert(resource) {
                debug!("- Captured resource: {}", url);
            }
        }
    }

    async fn fulfill(
        &self,
        paused: &PausedRequest,
        status: u16,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<()> {
        let headers: Vec<Value> = headers
            .iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();

        self.page
            .send(
                "Fetch.fulfillRequest",
                json!({
                    "requestId": paused.request_id,
                    "responseCode": status,
                    "responseHeaders": headers,
                    "body": STANDARD.encode(body),
                }),
            )
            .await?;
        Ok(())
    }

    async fn continue_request(&self, paused: &PausedRequest) -> Result<()> {
        self.page
            .send(
                "Fetch.continueRequest",
                json!({"requestId": paused.request_id}),
            )
            .await?;
        Ok(())
    }

    async fn fail_request(&self, paused: &PausedRequest, reason: &str) -> Result<()> {
        self.page
            .send(
                "Fetch.failRequest",
                json!({"requestId": paused.request_id, "errorReason": reason}),
            )
            .await?;
        Ok(())
    }
}

fn response_headers(response: &FetchedResponse) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = response
        .headers
        .iter()
        .filter(|(name, _)| !DROPPED_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
        .cloned()
        .collect();

    if !headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("content-type"))
    {
        headers.push(("content-type".to_string(), response.mimetype.clone()));
    }
    headers
}

/// Interception installed on one page for the duration of a capture.
pub struct Network {
    idle: Arc<IdleTracker>,
    resources: Arc<Mutex<ResourceSet>>,
    task: JoinHandle<()>,
}

impl Network {
    /// Enable interception on `page` and start answering its requests.
    pub async fn intercept(
        page: Arc<Page>,
        options: NetworkOptions,
        cache: Arc<ResourceCache>,
        fetcher: Arc<dyn ResourceFetcher>,
        stats: Arc<DiscoveryStats>,
    ) -> Result<Self> {
        let idle = Arc::new(IdleTracker::new());
        let resources = Arc::new(Mutex::new(ResourceSet::new()));

        let mut paused = page.subscribe("Fetch.requestPaused");
        page.send(
            "Fetch.enable",
            json!({"patterns": [{"urlPattern": "*", "requestStage": "Request"}]}),
        )
        .await?;

        let handler = Arc::new(RequestHandler {
            page,
            options,
            cache,
            fetcher,
            idle: idle.clone(),
            resources: resources.clone(),
            stats,
        });

        let task = tokio::spawn(async move {
            let mut in_flight = JoinSet::new();

            loop {
                tokio::select! {
                    event = paused.next_event() => {
                        let Some(params) = event else { break };
                        let request: PausedRequest = match serde_json::from_value(params) {
                            Ok(request) => request,
                            Err(e) => {
                                warn!("Ignoring malformed paused request: {}", e);
                                continue;
                            }
                        };

                        let decision = decide(&request.request, &handler.options);
                        if decision == Decision::Capture {
                            handler.idle.request_started(&request.request_id, &request.request.url);
                        }

                        let handler = handler.clone();
                        in_flight.spawn(async move { handler.handle(request, decision).await });
                    }
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                }
            }
        });

        Ok(Self {
            idle,
            resources,
            task,
        })
    }

    pub fn idle(&self) -> &Arc<IdleTracker> {
        &self.idle
    }

    pub fn resources(&self) -> &Arc<Mutex<ResourceSet>> {
        &self.resources
    }

    /// Wait for the network to settle on `page`.
    pub async fn wait_for_idle(&self, page: &Page, quiet: Duration, ceiling: Duration) -> Result<()> {
        debug!("Wait for {}ms idle", quiet.as_millis());
        page.guard(self.idle.wait_for_idle(quiet, ceiling)).await
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::MockResourceFetcher;
    use crate::test_support::{FakeBrowser, FakeRequest, MapFetcher};

    fn info(url: &str) -> RequestInfo {
        RequestInfo {
            url: url.to_string(),
            method: "GET".to_string(),
            headers: HashMap::new(),
        }
    }

    fn options(root_html: Option<&str>) -> NetworkOptions {
        let config = Config {
            allowed_hostnames: vec!["*.cdn.test".to_string()],
            disallowed_hostnames: vec!["ads.cdn.test".to_string()],
            ..Default::default()
        };
        NetworkOptions::new(&config, "http://h.test/", root_html.map(str::to_string))
    }

    #[test]
    fn test_decide() {
        let with_root = options(Some("<p>Test</p>"));
        let without_root = options(None);

        assert_eq!(decide(&info("http://h.test/"), &with_root), Decision::ServeRoot);
        assert_eq!(decide(&info("http://h.test/#top"), &with_root), Decision::ServeRoot);
        assert_eq!(decide(&info("http://h.test/"), &without_root), Decision::Passthrough);
        assert_eq!(decide(&info("data:image/png;base64,AAAA"), &with_root), Decision::Passthrough);
        assert_eq!(decide(&info("http://h.test/style.css"), &with_root), Decision::Capture);
        assert_eq!(decide(&info("http://img.cdn.test/a.png"), &with_root), Decision::Capture);
        assert_eq!(decide(&info("http://ads.cdn.test/a.js"), &with_root), Decision::Deny);
        assert_eq!(decide(&info("http://other.test/a.js"), &with_root), Decision::Deny);
    }

    #[test]
    fn test_decide_passes_event_streams_and_posts() {
        let options = options(None);

        let mut events = info("http://h.test/events");
        events
            .headers
            .insert("Accept".to_string(), "text/event-stream".to_string());
        assert_eq!(decide(&events, &options), Decision::Passthrough);

        let mut post = info("http://h.test/api");
        post.method = "POST".to_string();
        assert_eq!(decide(&post, &options), Decision::Passthrough);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_waits_for_quiet_window() {
        let tracker = Arc::new(IdleTracker::new());
        tracker.request_started("1", "http://h/slow.css");

        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move {
                tracker
                    .wait_for_idle(Duration::from_millis(100), Duration::from_secs(5))
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!waiter.is_finished());

        tracker.request_finished("1");
        tokio::time::sleep(Duration::from_millis(60)).await;
        // a new request inside the quiet window restarts it
        tracker.request_started("2", "http://h/late.png");
        tokio::time::sleep(Duration::from_millis(60)).await;
        tracker.request_finished("2");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!waiter.is_finished());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_lists_pending_requests() {
        let tracker = IdleTracker::new();
        tracker.request_started("1", "http://h/never.js");

        let err = tracker
            .wait_for_idle(Duration::from_millis(100), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            CaptureError::NetworkIdleTimeout { pending, .. } => {
                assert_eq!(pending, vec!["http://h/never.js".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_idle_page_settles_after_one_quiet_window() {
        let tracker = IdleTracker::new();
        let result = tokio_test::block_on(
            tracker.wait_for_idle(Duration::from_millis(10), Duration::from_secs(1)),
        );
        tokio_test::assert_ok!(result);
    }

    #[test]
    fn test_unknown_request_does_not_wake_waiters() {
        let tracker = IdleTracker::new();
        tracker.request_finished("never-started");
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(*tracker.activity.borrow(), 0);
    }

    async fn navigate_with(
        browser: &FakeBrowser,
        fetcher: Arc<dyn ResourceFetcher>,
        cache: Arc<ResourceCache>,
        options: NetworkOptions,
    ) -> (Network, Arc<Page>) {
        let page = Page::open(browser.connection()).await.unwrap();
        let network = Network::intercept(
            page.clone(),
            options.clone(),
            cache,
            fetcher,
            Arc::new(DiscoveryStats::new()),
        )
        .await
        .unwrap();
        page.navigate(&options.root_url, Duration::from_secs(5))
            .await
            .unwrap();
        network
            .wait_for_idle(&page, Duration::from_millis(50), Duration::from_secs(5))
            .await
            .unwrap();
        (network, page)
    }

    #[tokio::test]
    async fn test_root_is_served_locally_and_assets_captured() {
        let browser = FakeBrowser::start();
        browser.set_page_requests(vec![
            FakeRequest::get("http://h.test/style.css"),
            FakeRequest::get("http://other.test/tracker.js"),
            FakeRequest::get("data:text/plain,hi"),
        ]);
        let fetcher = Arc::new(MapFetcher::new());
        fetcher.serve("http://h.test/style.css", "text/css", b"p{color:red}");

        let (network, _page) = navigate_with(
            &browser,
            fetcher.clone(),
            Arc::new(ResourceCache::new(true)),
            options(Some("<p>Test</p>")),
        )
        .await;

        let root = browser.answer_for("http://h.test/").unwrap();
        assert_eq!(root.action, "fulfill");
        assert_eq!(root.body.as_deref(), Some(&b"<p>Test</p>"[..]));
        assert_eq!(browser.answer_for("http://other.test/tracker.js").unwrap().reason.as_deref(), Some("BlockedByClient"));
        assert_eq!(browser.answer_for("data:text/plain,hi").unwrap().action, "continue");

        let resources = network.resources().lock().unwrap().discovered();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].url, "http://h.test/style.css");
        assert_eq!(fetcher.fetched(), vec!["http://h.test/style.css".to_string()]);
    }

    #[tokio::test]
    async fn test_cached_resources_skip_the_fetcher() {
        let browser = FakeBrowser::start();
        browser.set_page_requests(vec![FakeRequest::get("http://h.test/app.js")]);

        let mut fetcher = MockResourceFetcher::new();
        fetcher.expect_fetch().times(1).returning(|request| {
            Ok(FetchedResponse {
                url: request.url.clone(),
                status: 200,
                headers: Vec::new(),
                mimetype: "application/javascript".to_string(),
                body: b"console.log(1)".to_vec(),
            })
        });
        let fetcher: Arc<dyn ResourceFetcher> = Arc::new(fetcher);
        let cache = Arc::new(ResourceCache::new(true));

        let (first, _) =
            navigate_with(&browser, fetcher.clone(), cache.clone(), options(Some("<p></p>"))).await;
        let (second, _) = navigate_with(&browser, fetcher, cache, options(Some("<p></p>"))).await;

        assert_eq!(first.resources().lock().unwrap().len(), 1);
        assert_eq!(second.resources().lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_and_failed_responses_are_not_captured() {
        let browser = FakeBrowser::start();
        browser.set_page_requests(vec![
            FakeRequest::get("http://h.test/huge.png"),
            FakeRequest::get("http://h.test/missing.css"),
            FakeRequest::get("http://h.test/broken.js"),
        ]);
        let fetcher = Arc::new(MapFetcher::new());
        fetcher.serve("http://h.test/huge.png", "image/png", &[0u8; 64]);
        fetcher.serve_status("http://h.test/missing.css", 404, "text/html", b"not found");

        let mut options = options(Some("<p></p>"));
        options.max_resource_size = 32;
        let (network, _) =
            navigate_with(&browser, fetcher, Arc::new(ResourceCache::new(true)), options).await;

        assert!(network.resources().lock().unwrap().is_empty());
        // still handed to the page
        assert_eq!(browser.answer_for("http://h.test/huge.png").unwrap().action, "fulfill");
        assert_eq!(browser.answer_for("http://h.test/missing.css").unwrap().status, Some(404));
        assert_eq!(browser.answer_for("http://h.test/broken.js").unwrap().reason.as_deref(), Some("Failed"));
    }

    #[tokio::test]
    async fn test_oversized_download_is_abandoned_and_left_to_the_page() {
        let browser = FakeBrowser::start();
        browser.set_page_requests(vec![FakeRequest::get("http://h.test/video.mp4")]);

        let mut fetcher = MockResourceFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|request| request.max_size == Some(32))
            .times(1)
            .returning(|request| {
                Err(CaptureError::ResourceTooLarge {
                    url: request.url.clone(),
                    size: 33,
                })
            });

        let mut options = options(Some("<p></p>"));
        options.max_resource_size = 32;
        let (network, _) = navigate_with(
            &browser,
            Arc::new(fetcher),
            Arc::new(ResourceCache::new(true)),
            options,
        )
        .await;

        assert!(network.resources().lock().unwrap().is_empty());
        assert_eq!(browser.answer_for("http://h.test/video.mp4").unwrap().action, "continue");
    }

    #[tokio::test]
    async fn test_event_stream_response_is_released_without_blocking_idle() {
        let browser = FakeBrowser::start();
        // no Accept header, so only the response reveals the stream
        browser.set_page_requests(vec![
            FakeRequest::get("http://h.test/updates"),
            FakeRequest::get("http://h.test/app.css"),
        ]);
        let fetcher = Arc::new(MapFetcher::new());
        fetcher.serve("http://h.test/updates", "text/event-stream", b"");
        fetcher.serve("http://h.test/app.css", "text/css", b"p{}");
        let cache = Arc::new(ResourceCache::new(true));

        let (network, _) =
            navigate_with(&browser, fetcher.clone(), cache.clone(), options(Some("<p></p>"))).await;

        assert_eq!(browser.answer_for("http://h.test/updates").unwrap().action, "continue");
        assert_eq!(network.idle().pending_count(), 0);
        let resources = network.resources().lock().unwrap();
        assert!(!resources.contains("http://h.test/updates"));
        assert!(resources.contains("http://h.test/app.css"));
        assert!(cache.lookup("http://h.test/updates").is_none());
        assert_eq!(fetcher.fetch_count("http://h.test/updates"), 1);
    }

    #[tokio::test]
    async fn test_redirects_record_final_destination() {
        let browser = FakeBrowser::start();
        browser.set_page_requests(vec![FakeRequest::get("http://h.test/old.css")]);
        let fetcher = Arc::new(MapFetcher::new());
        fetcher.redirect("http://h.test/old.css", "http://h.test/new.css");
        fetcher.serve("http://h.test/new.css", "text/css", b"a{}");

        let (network, _) = navigate_with(
            &browser,
            fetcher,
            Arc::new(ResourceCache::new(true)),
            options(Some("<p></p>")),
        )
        .await;

        let resources = network.resources().lock().unwrap().discovered();
        assert_eq!(resources[0].url, "http://h.test/new.css");
    }
}
