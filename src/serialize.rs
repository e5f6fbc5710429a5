//! Serializing the live page into a root document

use crate::page::Page;
use crate::{CaptureError, Resource, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializeOptions {
    #[serde(rename = "enableJavaScript")]
    pub enable_javascript: bool,
    #[serde(rename = "disableShadowDOM")]
    pub disable_shadow_dom: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dom_transformation: Option<String>,
}

/// A resource produced by the serializer itself, such as a canvas capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedResource {
    pub url: String,
    /// Base64 encoded bytes
    pub content: String,
    pub mimetype: String,
}

impl SerializedResource {
    pub fn decode(&self) -> Result<Resource> {
        let content = STANDARD.decode(self.content.as_bytes()).map_err(|e| {
            CaptureError::SerializationError(format!("{}: {}", self.url, e))
        })?;
        Ok(Resource::new(self.url.clone(), content, self.mimetype.clone()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub html: String,
    #[serde(default)]
    pub resources: Vec<SerializedResource>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl DomSnapshot {
    /// Accepts either a bare HTML string or the full object form.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(html) => Ok(Self {
                html,
                ..Default::default()
            }),
            value @ Value::Object(_) => Ok(serde_json::from_value(value)?),
            other => Err(CaptureError::SerializationError(format!(
                "expected a string or object DOM snapshot, got {other}"
            ))),
        }
    }
}

#[async_trait]
pub trait DomSerializer: Send + Sync {
    async fn serialize(&self, page: &Page, options: &SerializeOptions) -> Result<DomSnapshot>;
}

/// Runs a serializer library inside the page.
///
/// The library must define `window.serializeDOM(options)` returning either
/// an HTML string or a `DomSnapshot`-shaped object.
pub struct ScriptSerializer {
    library: String,
}

impl ScriptSerializer {
    pub fn new(library: impl Into<String>) -> Self {
        Self {
            library: library.into(),
        }
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let library = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(Self::new(library))
    }
}

#[async_trait]
impl DomSerializer for ScriptSerializer {
    async fn serialize(&self, page: &Page, options: &SerializeOptions) -> Result<DomSnapshot> {
        page.evaluate(
            "(library) => { if (!window.serializeDOM) { (0, eval)(library); } }",
            &[json!(self.library)],
        )
        .await?;

        let value = page
            .evaluate(
                "(options) => window.serializeDOM(options)",
                &[serde_json::to_value(options)?],
            )
            .await?;

        DomSnapshot::from_value(value)
    }
}

/// Uses the page's own markup when no serializer library is configured.
#[derive(Debug, Default)]
pub struct OuterHtmlSerializer;

const OUTER_HTML: &str = r#"() => {
  const doctype = document.doctype ? new XMLSerializer().serializeToString(document.doctype) : '';
  return doctype + document.documentElement.outerHTML;
}"#;

#[async_trait]
impl DomSerializer for OuterHtmlSerializer {
    async fn serialize(&self, page: &Page, _options: &SerializeOptions) -> Result<DomSnapshot> {
        match page.evaluate(OUTER_HTML, &[]).await? {
            Value::String(html) => Ok(DomSnapshot {
                html,
                ..Default::default()
            }),
            other => Err(CaptureError::SerializationError(format!(
                "page did not return markup: {other}"
            ))),
        }
    }
}
