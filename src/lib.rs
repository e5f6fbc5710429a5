//! # Snapshot Capture
//!
//! Asset discovery and upload engine for visual-regression snapshots. A
//! headless Chromium is driven over its remote debugging protocol: every
//! request a page makes is intercepted, fetched (or served from a shared
//! cache) and recorded, the viewport is walked through each requested width,
//! and the serialized DOM plus everything it loaded becomes one
//! content-addressed resource set per snapshot. Completed snapshots then go
//! through an upload queue that keeps backend order and finalizes the build
//! last.
//!
//! ## Pipeline
//!
//! ```text
//! SnapshotRequest -> normalize -> PagePool slot -> Discovery (navigate, hooks, widths)
//!                                                   |  Network interception -> ResourceCache
//!                                                   v
//!                                           CapturedSnapshot -> UploadQueue -> UploadClient
//! ```
//!
//! ## Upload policies
//!
//! | Policy | Flag | When snapshots reach the backend |
//! |--------|------|----------------------------------|
//! | **Immediate** | (default) | as soon as each snapshot is captured |
//! | **Delayed** | `--delay-uploads` | once the next snapshot is ready, or at stop |
//! | **Deferred** | `--defer-uploads` | at stop, in submission order |
//! | **Skip** | `--skip-uploads` | never; no build is created |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use snapshot_capture::{CaptureService, Config, HttpUploadClient, OuterHtmlSerializer, SnapshotRequest};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let client = Arc::new(HttpUploadClient::new(&config)?);
//!     let service = CaptureService::launch(config, client, Arc::new(OuterHtmlSerializer)).await?;
//!
//!     let request = SnapshotRequest {
//!         name: Some("Home".to_string()),
//!         widths: vec![375, 1280],
//!         ..SnapshotRequest::new("https://example.com")
//!     };
//!     service.capture(request).await?;
//!
//!     service.stop(true).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### Single Snapshot
//! ```bash
//! snapshot-capture snapshot --url https://example.com --width 375 --width 1280
//! ```
//!
//! ### Batch Processing
//! ```bash
//! snapshot-capture batch --input snapshots.json --concurrency 5 --defer-uploads
//! ```

/// Configuration and settings for discovery and uploads
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Remote debugging protocol connection
pub mod protocol;

/// Page sessions on the discovery browser
pub mod page;

/// Discovery browser launch and the page pool
pub mod browser_pool;

/// Captured resources and content hashing
pub mod resource;

/// Process-wide resource cache
pub mod cache;

/// Asset fetching for intercepted requests
pub mod fetcher;

/// Request interception and network idle tracking
pub mod network;

/// Snapshot requests and their normalized options
pub mod snapshot;

/// Lifecycle hook scripts and wait helpers
pub mod hooks;

/// DOM serialization inside the page
pub mod serialize;

/// Per-snapshot capture state machine
pub mod discovery;

/// Upload queue and build lifecycle
pub mod upload;

/// Capture service orchestrating discovery and uploads
pub mod capture_service;

/// Command-line interface implementation
pub mod cli;

/// Run statistics collection
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod test_support;


pub use browser_pool::*;
pub use cache::*;
pub use capture_service::*;
pub use cli::*;
pub use config::*;
pub use discovery::*;
pub use error::*;
pub use fetcher::*;
pub use hooks::*;
pub use self::metrics::*;
pub use network::*;
pub use page::*;
pub use protocol::*;
pub use resource::*;
pub use serialize::*;
pub use snapshot::*;
pub use upload::*;
pub use utils::*;
