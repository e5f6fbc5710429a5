use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

/// Why a page session stopped answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedCause {
    /// The debugging transport to the browser process went away.
    Browser,
    /// The tab was closed or detached while an operation was outstanding.
    Page,
    /// The renderer process for the tab crashed.
    PageCrashed,
}

impl fmt::Display for ClosedCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosedCause::Browser => write!(f, "Browser closed"),
            ClosedCause::Page => write!(f, "Page closed"),
            ClosedCause::PageCrashed => write!(f, "Page crashed"),
        }
    }
}

/// A structured failure reported by the upload backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadError {
    pub status: Option<u16>,
    pub message: String,
}

impl UploadError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Invalid snapshot options: {0}")]
    Validation(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    SessionClosed(ClosedCause),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Max file size exceeded [{size}]: {url}")]
    ResourceTooLarge { url: String, size: usize },

    #[error("Upload failed: {0}")]
    Upload(UploadError),

    #[error("Script error: {0}")]
    Script(String),

    #[error("The provided function is not serializable: {0}")]
    ScriptCompile(String),

    #[error("{0}")]
    WaitTimeout(String),

    #[error("Timed out waiting for network requests to idle after {timeout:?}: {pending:?}")]
    NetworkIdleTimeout {
        timeout: Duration,
        pending: Vec<String>,
    },

    #[error("Snapshot aborted: {0}")]
    Aborted(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// How far a failure is allowed to travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Confined to one intercepted request; the snapshot still succeeds.
    Request,
    /// Fails one snapshot and its additional snapshots.
    Snapshot,
    /// Affects every in-flight snapshot.
    Run,
}

impl CaptureError {
    pub fn scope(&self) -> ErrorScope {
        match self {
            CaptureError::Resource(_) | CaptureError::ResourceTooLarge { .. } => {
                ErrorScope::Request
            }
            CaptureError::SessionClosed(ClosedCause::Browser)
            | CaptureError::BrowserLaunchFailed(_)
            | CaptureError::ConfigurationError(_) => ErrorScope::Run,
            _ => ErrorScope::Snapshot,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, CaptureError::SessionClosed(_))
    }

    pub fn browser_closed() -> Self {
        CaptureError::SessionClosed(ClosedCause::Browser)
    }
}

impl From<UploadError> for CaptureError {
    fn from(err: UploadError) -> Self {
        CaptureError::Upload(err)
    }
}

// The pool closes its semaphore on shutdown, so a failed acquire means the browser is gone.
impl From<AcquireError> for CaptureError {
    fn from(_: AcquireError) -> Self {
        CaptureError::browser_closed()
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::SerializationError(err.to_string())
    }
}

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;
