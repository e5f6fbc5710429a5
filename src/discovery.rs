//! Per-snapshot capture state machine
//!
//! A capture walks one page through navigation, its lifecycle hooks, one
//! pass per width (resize, settle, serialize) and finally any additional
//! snapshots, which reuse the navigated page and everything it discovered.
//!
//! ```text
//! Pending -> Navigating -> AfterNavigation -> Discovering(0..n) -> Serializing -> Complete
//!                                                     \_____________ any error ____> Failed
//! ```

use crate::fetcher::ResourceFetcher;
use crate::hooks::{self, ExecuteScript, HookPhase};
use crate::network::{Network, NetworkOptions};
use crate::page::Page;
use crate::serialize::{DomSerializer, SerializeOptions};
use crate::snapshot::SnapshotOptions;
use crate::{
    extract_hostname, sha256_hex, CaptureError, Config, DiscoveryStats, Resource, ResourceCache,
    Result,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Pending,
    Navigating,
    AfterNavigation,
    Discovering { width_index: usize },
    Serializing,
    Complete,
    Failed,
}

/// One finished snapshot, ready to be queued for upload.
#[derive(Debug, Clone)]
pub struct CapturedSnapshot {
    pub name: String,
    pub url: String,
    pub widths: Vec<u32>,
    pub min_height: u32,
    /// Root resources first, then everything discovered
    pub resources: Vec<Resource>,
}

impl CapturedSnapshot {
    pub fn roots(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(|r| r.root)
    }
}

/// What every capture in a run shares.
#[derive(Clone)]
pub struct Discovery {
    config: Arc<Config>,
    cache: Arc<ResourceCache>,
    fetcher: Arc<dyn ResourceFetcher>,
    serializer: Arc<dyn DomSerializer>,
    stats: Arc<DiscoveryStats>,
}

impl Discovery {
    pub fn new(
        config: Arc<Config>,
        cache: Arc<ResourceCache>,
        fetcher: Arc<dyn ResourceFetcher>,
        serializer: Arc<dyn DomSerializer>,
        stats: Arc<DiscoveryStats>,
    ) -> Self {
        Self {
            config,
            cache,
            fetcher,
            serializer,
            stats,
        }
    }

    /// Capture `options` on `page`, returning the base snapshot followed by
    /// its additional snapshots.
    pub async fn capture(&self, page: Arc<Page>, options: &SnapshotOptions) -> Result<Vec<CapturedSnapshot>> {
        let mut context = CaptureContext::new(self, page, options);
        let result = context.run().await;

        match &result {
            Ok(_) => context.transition(CaptureState::Complete),
            Err(_) => context.transition(CaptureState::Failed),
        }
        result
    }
}

/// Mutable state of one in-flight capture.
pub struct CaptureContext<'a> {
    discovery: &'a Discovery,
    options: &'a SnapshotOptions,
    page: Arc<Page>,
    network: Option<Network>,
    state: CaptureState,
    current_width: Option<u32>,
    snapshots: Vec<CapturedSnapshot>,
}

impl<'a> CaptureContext<'a> {
    fn new(discovery: &'a Discovery, page: Arc<Page>, options: &'a SnapshotOptions) -> Self {
        Self {
            discovery,
            options,
            page,
            network: None,
            state: CaptureState::Pending,
            current_width: None,
            snapshots: Vec::new(),
        }
    }

    fn transition(&mut self, next: CaptureState) {
        debug!("{}: {:?} -> {:?}", self.options.name, self.state, next);
        self.state = next;
    }

    fn config(&self) -> &Config {
        &self.discovery.config
    }

    fn network(&self) -> Result<&Network> {
        self.network
            .as_ref()
            .ok_or_else(|| CaptureError::Protocol("request interception is not installed".to_string()))
    }

    async fn run(&mut self) -> Result<Vec<CapturedSnapshot>> {
        self.compile_scripts().await?;

        self.transition(CaptureState::Navigating);
        self.navigate().await?;

        self.transition(CaptureState::AfterNavigation);
        let options = self.options;
        self.after_navigation(
            options.execute.as_ref(),
            options.wait_for_timeout,
            options.wait_for_selector.clone(),
        )
        .await?;
        self.capture_widths(&options.name, options.execute.as_ref())
            .await?;

        for sibling in &options.additional_snapshots {
            debug!("Capturing additional snapshot: {}", sibling.name);
            self.after_navigation(
                sibling.execute.as_ref(),
                sibling.wait_for_timeout,
                sibling.wait_for_selector.clone(),
            )
            .await?;
            self.capture_widths(&sibling.name, sibling.execute.as_ref())
                .await?;
        }

        Ok(std::mem::take(&mut self.snapshots))
    }

    /// Unparseable scripts fail the capture before anything is loaded.
    async fn compile_scripts(&self) -> Result<()> {
        let scripts = self
            .options
            .execute
            .iter()
            .chain(self.options.additional_snapshots.iter().filter_map(|s| s.execute.as_ref()));

        for script in scripts {
            script.compile(&self.page).await?;
        }
        Ok(())
    }

    async fn navigate(&mut self) -> Result<()> {
        let config = self.config();
        let mut network_options = NetworkOptions::new(
            config,
            &self.options.url,
            self.options.dom_snapshot.as_ref().map(|dom| dom.html.clone()),
        );
        let overrides = &self.options.discovery;
        for hostname in &overrides.allowed_hostnames {
            network_options.allowed_hostnames.push(hostname);
        }
        for hostname in &overrides.disallowed_hostnames {
            network_options.disallowed_hostnames.push(hostname);
        }
        network_options
            .request_headers
            .extend(overrides.request_headers.clone());

        let enable_javascript = self.options.enable_javascript;
        let navigation_timeout = config.navigation_timeout;

        self.page.set_javascript_enabled(enable_javascript).await?;
        self.network = Some(
            Network::intercept(
                self.page.clone(),
                network_options,
                self.discovery.cache.clone(),
                self.discovery.fetcher.clone(),
                self.discovery.stats.clone(),
            )
            .await?,
        );

        self.resize(self.options.widths[0]).await?;
        debug!("Navigate to: {}", self.options.url);
        self.page
            .navigate(&self.options.url, navigation_timeout)
            .await
    }

    async fn after_navigation(
        &mut self,
        execute: Option<&ExecuteScript>,
        wait_for_timeout: Option<Duration>,
        wait_for_selector: Option<String>,
    ) -> Result<()> {
        if let Some(execute) = execute {
            execute.run(&self.page, HookPhase::AfterNavigation).await?;
        }
        if let Some(timeout) = wait_for_timeout {
            hooks::wait_for_timeout(&self.page, timeout).await?;
        }
        if let Some(selector) = wait_for_selector {
            let timeout = self.config().navigation_timeout;
            hooks::wait_for_selector(&self.page, &selector, timeout).await?;
        }
        Ok(())
    }

    async fn resize(&mut self, width: u32) -> Result<()> {
        if self.current_width == Some(width) {
            return Ok(());
        }
        debug!("Resize page to {}x{}", width, self.options.min_height);
        self.page.set_viewport(width, self.options.min_height).await?;
        self.current_width = Some(width);
        Ok(())
    }

    async fn capture_widths(&mut self, name: &str, execute: Option<&ExecuteScript>) -> Result<()> {
        let options = self.options;
        let widths = &options.widths;

        for (width_index, width) in widths.iter().copied().enumerate() {
            self.transition(CaptureState::Discovering { width_index });

            if self.current_width != Some(width) {
                if let Some(execute) = execute {
                    execute.run(&self.page, HookPhase::BeforeResize).await?;
                }
                self.resize(width).await?;
                if let Some(execute) = execute {
                    execute.run(&self.page, HookPhase::AfterResize).await?;
                }
            }

            let config = self.config();
            let (quiet, ceiling) = (config.network_idle_timeout, config.network_idle_wait_timeout);
            self.network()?
                .wait_for_idle(&self.page, quiet, ceiling)
                .await?;

            if let Some(execute) = execute {
                execute.run(&self.page, HookPhase::BeforeSnapshot).await?;
            }

            self.transition(CaptureState::Serializing);
            self.serialize(name, width).await?;
        }

        let network = self.network()?;
        let mut resources = network
            .resources()
            .lock()
            .map_err(|_| CaptureError::Protocol("resource set poisoned".to_string()))?;
        let mut roots = resources.take_roots();
        let discovered = resources.discovered();
        drop(resources);

        let mut all = Vec::with_capacity(roots.len() + discovered.len() + 1);
        if let Some(css) = &options.css {
            let stylesheet = css_resource(&options.url, css);
            for root in &mut roots {
                *root = Resource::root(
                    root.url.clone(),
                    inject_css(&String::from_utf8_lossy(&root.content), &stylesheet.url),
                    root.for_widths.clone(),
                );
            }
            all.extend(roots);
            all.extend(discovered);
            all.push(stylesheet);
        } else {
            all.extend(roots);
            all.extend(discovered);
        }

        debug!("Snapshot {} captured {} resource(s)", name, all.len());
        self.snapshots.push(CapturedSnapshot {
            name: name.to_string(),
            url: self.options.url.clone(),
            widths: widths.to_vec(),
            min_height: self.options.min_height,
            resources: all,
        });
        Ok(())
    }

    async fn serialize(&mut self, name: &str, width: u32) -> Result<()> {
        let dom = match &self.options.dom_snapshot {
            Some(dom) => dom.clone(),
            None => {
                let options = SerializeOptions {
                    enable_javascript: self.options.enable_javascript,
                    disable_shadow_dom: self.options.disable_shadow_dom,
                    dom_transformation: None,
                };
                self.page
                    .guard(self.discovery.serializer.serialize(&self.page, &options))
                    .await?
            }
        };

        for warning in &dom.warnings {
            warn!("[{}] {}", name, warning);
        }

        let network = self.network()?;
        let mut resources = network
            .resources()
            .lock()
            .map_err(|_| CaptureError::Protocol("resource set poisoned".to_string()))?;
        for serialized in &dom.resources {
            resources.insert(serialized.decode()?);
        }
        resources.add_root(&self.options.url, &dom.html, width);
        Ok(())
    }
}

/// The stylesheet carrying a snapshot's extra CSS, hosted on the page's origin.
pub fn css_resource(root_url: &str, css: &str) -> Resource {
    let origin = Url::parse(root_url)
        .ok()
        .map(|url| url.origin().ascii_serialization())
        .filter(|origin| origin != "null")
        .or_else(|| extract_hostname(root_url).map(|host| format!("http://{host}")))
        .unwrap_or_default();
    let sha = sha256_hex(css.as_bytes());

    Resource::new(
        format!("{}/snapshot-specific.{}.css", origin, &sha[..10]),
        css.as_bytes().to_vec(),
        "text/css",
    )
}

/// Link `href` as the last stylesheet of `html`.
pub fn inject_css(html: &str, href: &str) -> String {
    let link = format!(r#"<link data-snapshot-specific-css rel="stylesheet" href="{href}"/>"#);

    match html.rfind("</body>") {
        Some(index) => format!("{}{}{}", &html[..index], link, &html[index..]),
        None => format!("{html}{link}"),
    }
}
