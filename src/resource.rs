//! Captured resources and the per-snapshot resource set
//!
//! Every resource is identified by the SHA-256 of its bytes. Root resources
//! carry the widths they were rendered at; identical roots from different
//! widths collapse into one resource tagged with every width.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Hex SHA-256 digest of `content`.
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub url: String,
    pub sha: String,
    pub mimetype: String,
    pub content: Arc<Vec<u8>>,
    pub root: bool,
    pub for_widths: Vec<u32>,
}

impl Resource {
    pub fn new(url: impl Into<String>, content: Vec<u8>, mimetype: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sha: sha256_hex(&content),
            mimetype: mimetype.into(),
            content: Arc::new(content),
            root: false,
            for_widths: Vec::new(),
        }
    }

    pub fn root(url: impl Into<String>, html: impl Into<String>, widths: Vec<u32>) -> Self {
        Self {
            root: true,
            for_widths: widths,
            ..Self::new(url, html.into().into_bytes(), "text/html")
        }
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// Resources accumulated by one capture.
///
/// Non-root resources are keyed by URL, and a second URL with an already
/// present digest is dropped. Roots are kept in capture order.
#[derive(Debug, Default)]
pub struct ResourceSet {
    resources: HashMap<String, Resource>,
    order: Vec<String>,
    roots: Vec<Resource>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a discovered resource, returning false when it was already present.
    pub fn insert(&mut self, resource: Resource) -> bool {
        if self.resources.contains_key(&resource.url)
            || self.resources.values().any(|r| r.sha == resource.sha)
        {
            return false;
        }

        self.order.push(resource.url.clone());
        self.resources.insert(resource.url.clone(), resource);
        true
    }

    pub fn contains(&self, url: &str) -> bool {
        self.resources.contains_key(url)
    }

    /// Record the serialized document for `width`.
    ///
    /// When it matches the most recent root for the same URL the width is
    /// appended to that root instead of adding a new one.
    pub fn add_root(&mut self, url: &str, html: &str, width: u32) {
        let sha = sha256_hex(html.as_bytes());

        if let Some(last) = self.roots.iter_mut().rev().find(|r| r.url == url) {
            if last.sha == sha {
                if !last.for_widths.contains(&width) {
                    last.for_widths.push(width);
                }
                return;
            }
        }

        self.roots.push(Resource::root(url, html, vec![width]));
    }

    pub fn roots(&self) -> &[Resource] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.resources.len() + self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discovered (non-root) resources in discovery order.
    pub fn discovered(&self) -> Vec<Resource> {
        self.order
            .iter()
            .filter_map(|url| self.resources.get(url).cloned())
            .collect()
    }

    /// Roots first, then discovered resources.
    pub fn to_vec(&self) -> Vec<Resource> {
        let mut all = self.roots.clone();
        all.extend(self.discovered());
        all
    }

    /// Drop the roots while keeping discovered resources, for a sibling snapshot.
    pub fn take_roots(&mut self) -> Vec<Resource> {
        std::mem::take(&mut self.roots)
    }
}
