//! Snapshot requests as submitted by callers, and their canonical form
//!
//! Requests accept camelCase and snake_case keys plus a few deprecated
//! aliases. `SnapshotRequest::normalize` resolves all of that once, applies
//! run defaults and validates the result into an immutable `SnapshotOptions`.

use crate::hooks::ExecuteScript;
use crate::serialize::DomSnapshot;
use crate::{validate_url, CaptureError, Config, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

pub const MIN_WIDTH: u32 = 120;
pub const MAX_WIDTH: u32 = 2000;
pub const MAX_WIDTHS: usize = 10;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub widths: Vec<u32>,
    #[serde(default, alias = "min_height")]
    pub min_height: Option<u32>,
    /// Deprecated spelling of `min_height`
    #[serde(default, alias = "minimum_height", skip_serializing)]
    pub minimum_height: Option<u32>,
    /// Extra CSS applied to the captured page
    #[serde(default)]
    pub css: Option<String>,
    #[serde(default, rename = "enableJavaScript", alias = "enable_javascript", alias = "enableJavascript")]
    pub enable_javascript: Option<bool>,
    #[serde(default, rename = "disableShadowDOM", alias = "disable_shadow_dom", alias = "disableShadowDom")]
    pub disable_shadow_dom: Option<bool>,
    #[serde(default, alias = "dom_snapshot")]
    pub dom_snapshot: Option<Value>,
    #[serde(default)]
    pub execute: Option<ExecuteScript>,
    #[serde(default, alias = "wait_for_timeout")]
    pub wait_for_timeout: Option<u64>,
    #[serde(default, alias = "wait_for_selector")]
    pub wait_for_selector: Option<String>,
    #[serde(default, alias = "additional_snapshots")]
    pub additional_snapshots: Vec<AdditionalSnapshot>,
    /// Deprecated spelling of `additional_snapshots`
    #[serde(default, skip_serializing)]
    pub snapshots: Option<Vec<AdditionalSnapshot>>,
    #[serde(default)]
    pub discovery: DiscoveryOverrides,
}

impl SnapshotRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalSnapshot {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub suffix: Option<String>,
    #[serde(default)]
    pub execute: Option<ExecuteScript>,
    #[serde(default, alias = "wait_for_timeout")]
    pub wait_for_timeout: Option<u64>,
    #[serde(default, alias = "wait_for_selector")]
    pub wait_for_selector: Option<String>,
}

/// Per-snapshot additions to the run's discovery settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryOverrides {
    #[serde(default, alias = "allowed_hostnames")]
    pub allowed_hostnames: Vec<String>,
    #[serde(default, alias = "disallowed_hostnames")]
    pub disallowed_hostnames: Vec<String>,
    #[serde(default, alias = "request_headers")]
    pub request_headers: HashMap<String, String>,
}

/// Canonical, validated snapshot options.
#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    pub name: String,
    pub url: String,
    pub widths: Vec<u32>,
    pub min_height: u32,
    pub css: Option<String>,
    pub enable_javascript: bool,
    pub disable_shadow_dom: bool,
    pub dom_snapshot: Option<DomSnapshot>,
    pub execute: Option<ExecuteScript>,
    pub wait_for_timeout: Option<Duration>,
    pub wait_for_selector: Option<String>,
    pub additional_snapshots: Vec<AdditionalOptions>,
    pub discovery: DiscoveryOverrides,
}

#[derive(Debug, Clone)]
pub struct AdditionalOptions {
    pub name: String,
    pub execute: Option<ExecuteScript>,
    pub wait_for_timeout: Option<Duration>,
    pub wait_for_selector: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub options: SnapshotOptions,
    /// Deprecation notices
    pub warnings: Vec<String>,
    /// Problems that dropped one additional snapshot without failing the rest
    pub errors: Vec<String>,
}

impl SnapshotRequest {
    /// The name a request is known by, even before it validates.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| name_from_url(&self.url))
    }

    pub fn normalize(self, config: &Config) -> Result<Normalized> {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let url = validate_url(&self.url)
            .map_err(|_| CaptureError::Validation(format!("url: invalid URL: {}", self.url)))?;
        let name = match self.name.as_deref().map(str::trim) {
            Some("") => return Err(CaptureError::Validation("name: must not be empty".to_string())),
            Some(name) => name.to_string(),
            None => name_from_url(url.as_str()),
        };

        let widths = normalize_widths(if self.widths.is_empty() {
            &config.default_widths
        } else {
            &self.widths
        })?;

        if self.minimum_height.is_some() {
            warnings.push("The snapshot option `minimumHeight` is deprecated, use `minHeight` instead".to_string());
        }
        let min_height = self
            .min_height
            .or(self.minimum_height)
            .unwrap_or(config.min_height);
        if min_height == 0 {
            return Err(CaptureError::Validation("minHeight: must be greater than 0".to_string()));
        }

        let mut additional = self.additional_snapshots;
        if let Some(deprecated) = self.snapshots {
            warnings.push(
                "The snapshot option `snapshots` is deprecated, use `additionalSnapshots` instead"
                    .to_string(),
            );
            additional.extend(deprecated);
        }

        if self.dom_snapshot.is_some() {
            let mut conflicts = Vec::new();
            if self.execute.is_some() {
                conflicts.push("execute");
            }
            if self.wait_for_timeout.is_some() {
                conflicts.push("waitForTimeout");
            }
            if self.wait_for_selector.is_some() {
                conflicts.push("waitForSelector");
            }
            if !additional.is_empty() {
                conflicts.push("additionalSnapshots");
            }
            if !conflicts.is_empty() {
                return Err(CaptureError::Validation(format!(
                    "domSnapshot: cannot be combined with {}",
                    conflicts.join(", ")
                )));
            }
        }

        let dom_snapshot = self
            .dom_snapshot
            .map(DomSnapshot::from_value)
            .transpose()
            .map_err(|e| CaptureError::Validation(format!("domSnapshot: {e}")))?;

        let mut additional_snapshots: Vec<AdditionalOptions> = Vec::new();
        for (index, sibling) in additional.into_iter().enumerate() {
            let sibling_name = match (&sibling.name, &sibling.prefix, &sibling.suffix) {
                (Some(explicit), _, _) if !explicit.trim().is_empty() => explicit.trim().to_string(),
                (_, None, None) => {
                    errors.push(format!(
                        "additionalSnapshots[{index}]: missing required name, prefix, or suffix"
                    ));
                    continue;
                }
                (_, prefix, suffix) => format!(
                    "{}{}{}",
                    prefix.as_deref().unwrap_or_default(),
                    name,
                    suffix.as_deref().unwrap_or_default()
                ),
            };

            if sibling_name == name || additional_snapshots.iter().any(|s| s.name == sibling_name) {
                errors.push(format!(
                    "additionalSnapshots[{index}]: duplicate snapshot name: {sibling_name}"
                ));
                continue;
            }

            additional_snapshots.push(AdditionalOptions {
                name: sibling_name,
                execute: sibling.execute,
                wait_for_timeout: sibling.wait_for_timeout.map(Duration::from_millis),
                wait_for_selector: sibling.wait_for_selector,
            });
        }

        Ok(Normalized {
            options: SnapshotOptions {
                name,
                url: url.to_string(),
                widths,
                min_height,
                css: self.css.filter(|css| !css.trim().is_empty()),
                enable_javascript: self.enable_javascript.unwrap_or(config.enable_javascript),
                disable_shadow_dom: self.disable_shadow_dom.unwrap_or(config.disable_shadow_dom),
                dom_snapshot,
                execute: self.execute,
                wait_for_timeout: self.wait_for_timeout.map(Duration::from_millis),
                wait_for_selector: self.wait_for_selector,
                additional_snapshots,
                discovery: self.discovery,
            },
            warnings,
            errors,
        })
    }
}

/// Sort and deduplicate widths, then check their count and range.
pub fn normalize_widths(widths: &[u32]) -> Result<Vec<u32>> {
    let mut widths = widths.to_vec();
    widths.sort_unstable();
    widths.dedup();

    if widths.is_empty() || widths.len() > MAX_WIDTHS {
        return Err(CaptureError::Validation(format!(
            "widths: must contain between 1 and {MAX_WIDTHS} widths"
        )));
    }

    if let Some(width) = widths.iter().find(|w| **w < MIN_WIDTH || **w > MAX_WIDTH) {
        return Err(CaptureError::Validation(format!(
            "widths: {width} must be between {MIN_WIDTH} and {MAX_WIDTH}"
        )));
    }

    Ok(widths)
}

/// Default snapshot name: the URL's path and query.
pub fn name_from_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        },
        Err(_) => url.to_string(),
    }
}
