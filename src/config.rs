//! Configuration management with serde serialization/deserialization
//!
//! This module provides the run-wide settings for asset discovery: page pool
//! size, idle and size limits, hostname policy, upload timing and browser
//! launch arguments.

use crate::CaptureError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default ceiling for a single captured resource (15 MiB).
pub const DEFAULT_MAX_RESOURCE_SIZE: usize = 15 * 1024 * 1024;

/// Main configuration structure for a capture run
///
/// Controls the discovery browser, the request interceptor and the upload
/// pipeline. One `Config` is resolved per run and shared read-only.
///
/// # Examples
///
/// ```rust
/// use snapshot_capture::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Capture with two tabs and never reuse cached responses
/// let config = Config {
///     concurrency: 2,
///     disable_cache: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of browser tabs discovering assets at once (default: CPUs, at most 5)
    pub concurrency: usize,

    /// Quiet period with no capturable request before the network counts as idle (default: 100ms)
    pub network_idle_timeout: Duration,

    /// Longest a single idle wait may take before the snapshot fails (default: 30 seconds)
    pub network_idle_wait_timeout: Duration,

    /// Timeout for the top-level navigation and request-level waits (default: 30 seconds)
    pub navigation_timeout: Duration,

    /// Timeout for launching the discovery browser (default: 30 seconds)
    pub launch_timeout: Duration,

    /// Responses larger than this are served to the page but not captured (default: 15MB)
    pub max_resource_size: usize,

    /// Always refetch instead of reusing responses from earlier snapshots (default: false)
    pub disable_cache: bool,

    /// Hostnames whose requests are captured in addition to the snapshot origin
    ///
    /// Entries match exactly, by `*.` suffix, or `*` for every host.
    pub allowed_hostnames: Vec<String>,

    /// Hostnames whose requests are always aborted, even when allowed
    pub disallowed_hostnames: Vec<String>,

    /// Extra headers sent with every asset request
    pub request_headers: HashMap<String, String>,

    /// Custom User-Agent string for asset requests (default: browser default)
    pub user_agent: Option<String>,

    /// Widths used when a snapshot does not name any (default: 375, 1280)
    pub default_widths: Vec<u32>,

    /// Minimum viewport height used while discovering (default: 1024)
    pub min_height: u32,

    /// Keep JavaScript running in the captured page (default: false)
    pub enable_javascript: bool,

    /// Skip shadow DOM while serializing (default: false)
    pub disable_shadow_dom: bool,

    /// Capture snapshots but never upload them
    pub skip_uploads: bool,

    /// Hold each upload until the next snapshot is ready
    pub delay_uploads: bool,

    /// Hold every upload until the run stops
    pub defer_uploads: bool,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Launch window size for the discovery browser
    pub viewport: Viewport,

    /// Script file exposing the DOM serializer inside the page
    ///
    /// When unset the page's outer HTML is used as the root document.
    pub dom_serializer_script: Option<String>,

    /// Base URL of the upload backend
    pub api_url: String,

    /// Token sent to the upload backend
    pub token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            network_idle_timeout: Duration::from_millis(100),
            network_idle_wait_timeout: Duration::from_secs(30),
            navigation_timeout: Duration::from_secs(30),
            launch_timeout: Duration::from_secs(30),
            max_resource_size: DEFAULT_MAX_RESOURCE_SIZE,
            disable_cache: false,
            allowed_hostnames: Vec::new(),
            disallowed_hostnames: Vec::new(),
            request_headers: HashMap::new(),
            user_agent: None,
            default_widths: vec![375, 1280],
            min_height: 1024,
            enable_javascript: false,
            disable_shadow_dom: false,
            skip_uploads: false,
            delay_uploads: false,
            defer_uploads: false,
            chrome_path: None,
            viewport: Viewport::default(),
            dom_serializer_script: None,
            api_url: "http://localhost:5338/api".to_string(),
            token: None,
        }
    }
}

fn default_concurrency() -> usize {
    num_cpus::get().clamp(1, 5)
}

impl Config {
    /// Resolve the upload timing flags into a single policy
    ///
    /// Skipping wins over everything, then deferring, then delaying.
    pub fn upload_policy(&self) -> UploadPolicy {
        if self.skip_uploads {
            UploadPolicy::Skip
        } else if self.defer_uploads {
            UploadPolicy::Deferred
        } else if self.delay_uploads {
            UploadPolicy::Delayed
        } else {
            UploadPolicy::Immediate
        }
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.concurrency == 0 {
            return Err(CaptureError::ConfigurationError(
                "Concurrency must be greater than 0".to_string(),
            ));
        }

        if self.network_idle_timeout.is_zero() {
            return Err(CaptureError::ConfigurationError(
                "Network idle timeout must be greater than 0".to_string(),
            ));
        }

        if self.network_idle_wait_timeout < self.network_idle_timeout {
            return Err(CaptureError::ConfigurationError(
                "Network idle wait timeout must not be shorter than the idle timeout".to_string(),
            ));
        }

        if self.max_resource_size == 0 {
            return Err(CaptureError::ConfigurationError(
                "Max resource size must be greater than 0".to_string(),
            ));
        }

        if self.default_widths.is_empty() || self.default_widths.contains(&0) {
            return Err(CaptureError::ConfigurationError(
                "Default widths must be non-empty and greater than 0".to_string(),
            ));
        }

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(CaptureError::ConfigurationError(
                "Viewport dimensions must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// When completed snapshots reach the upload backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum UploadPolicy {
    /// Upload each snapshot as soon as it is captured (default)
    Immediate,
    /// Upload a snapshot once the next one is ready, or at stop
    Delayed,
    /// Upload everything at stop, in submission order
    Deferred,
    /// Never upload and never create a build
    Skip,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::Immediate
    }
}

/// Browser window configuration used when launching the discovery browser
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    /// Window width in pixels (default: 1280)
    pub width: u32,

    /// Window height in pixels (default: 1024)
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 1024,
        }
    }
}

/// Generate Chrome command-line arguments based on configuration
///
/// # Examples
///
/// ```rust
/// use snapshot_capture::{Config, get_chrome_args};
///
/// let config = Config::default();
/// let args = get_chrome_args(&config);
/// assert!(args.contains(&"--headless".to_string()));
/// ```
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    get_chrome_args_with_instance_id(config, None)
}

/// Generate Chrome arguments with a unique id so parallel runs do not share profiles
pub fn get_chrome_args_with_instance_id(
    config: &Config,
    instance_id: Option<usize>,
) -> Vec<String> {
    let unique_id = match instance_id {
        Some(id) => format!("{}-{}", std::process::id(), id),
        None => format!("{}-{}", std::process::id(), uuid::Uuid::new_v4()),
    };

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        "--font-render-hinting=none".to_string(),
        "--disable-features=ProcessSingleton".to_string(),
        "--no-process-singleton-dialog".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!("--user-data-dir=/tmp/snapshot-capture-{}", unique_id),
    ];

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config(
    config: &Config,
) -> Result<chromiumoxide::browser::BrowserConfig, CaptureError> {
    create_browser_config_with_instance_id(config, None)
}

pub fn create_browser_config_with_instance_id(
    config: &Config,
    instance_id: Option<usize>,
) -> Result<chromiumoxide::browser::BrowserConfig, CaptureError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .launch_timeout(config.launch_timeout)
        .args(get_chrome_args_with_instance_id(config, instance_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(CaptureError::BrowserLaunchFailed)
}
