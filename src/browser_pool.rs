//! Discovery browser process and the pool of pages handed to captures
//!
//! The browser is launched once per run. Captures borrow pages from a
//! `PagePool`, which caps how many tabs are open at a time and force-closes
//! every tab when the run stops.

use crate::page::Page;
use crate::protocol::Connection;
use crate::{create_browser_config, CaptureError, Config, Result};
use chromiumoxide::browser::Browser as ChromiumBrowser;
use dashmap::DashMap;
use futures::StreamExt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// A launched Chromium process and our debugging connection to it.
pub struct Browser {
    browser: Mutex<ChromiumBrowser>,
    handler: tokio::task::JoinHandle<std::result::Result<(), chromiumoxide::error::CdpError>>,
    connection: Arc<Connection>,
}

impl Browser {
    pub async fn launch(config: &Config) -> Result<Self> {
        let browser_config = create_browser_config(config)?;

        let (browser, mut handler) = ChromiumBrowser::launch(browser_config)
            .await
            .map_err(|e| CaptureError::BrowserLaunchFailed(e.to_string()))?;

        // The handler implements Stream and must be polled for the launcher's own connection
        let handler = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("Handler error: {}", e);
                        return Err(e);
                    }
                    None => {
                        debug!("Handler stream ended");
                        break;
                    }
                }
            }
            Ok(())
        });

        let connection = match Connection::connect(browser.websocket_address()).await {
            Ok(connection) => connection,
            Err(e) => {
                handler.abort();
                return Err(e);
            }
        };

        info!("Discovery browser launched");
        Ok(Self {
            browser: Mutex::new(browser),
            handler,
            connection,
        })
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.connection.clone()
    }

    pub async fn close(&self) {
        self.connection.close();

        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            debug!("Browser close failed: {}", e);
        }
        let _ = browser.wait().await;
        self.handler.abort();
        info!("Discovery browser closed");
    }
}

/// Bounded set of open pages.
pub struct PagePool {
    connection: Arc<Connection>,
    semaphore: Arc<Semaphore>,
    size: usize,
    open: DashMap<u64, Arc<Page>>,
    next_id: AtomicU64,
    total_acquired: AtomicUsize,
    is_closed: AtomicBool,
}

impl PagePool {
    pub fn new(connection: Arc<Connection>, size: usize) -> Arc<Self> {
        let pool = Arc::new(Self {
            connection: connection.clone(),
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            open: DashMap::new(),
            next_id: AtomicU64::new(1),
            total_acquired: AtomicUsize::new(0),
            is_closed: AtomicBool::new(false),
        });

        let weak: Weak<Self> = Arc::downgrade(&pool);
        tokio::spawn(async move {
            connection.closed().await;
            if let Some(pool) = weak.upgrade() {
                debug!("Browser connection closed, closing page pool");
                pool.mark_closed();
            }
        });

        pool
    }

    /// Wait for a free slot and open a page in it.
    ///
    /// Fails with "Browser closed" once the pool is closed, including for
    /// callers already waiting.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledPage> {
        if self.is_closed() {
            return Err(CaptureError::browser_closed());
        }

        let permit = self.semaphore.clone().acquire_owned().await?;
        let page = Page::open(self.connection.clone()).await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.open.insert(id, page.clone());

        // close_all() may have run while the page was opening
        if self.is_closed() {
            self.open.remove(&id);
            page.close().await;
            return Err(CaptureError::browser_closed());
        }

        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        debug!("Acquired page {} ({} open)", page.target_id(), self.open.len());

        Ok(PooledPage {
            id,
            page,
            pool: Arc::downgrade(self),
            permit: Some(permit),
        })
    }

    fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::SeqCst);
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst)
    }

    /// Fail pending acquires and force-close every page currently out.
    pub async fn close_all(&self) {
        self.mark_closed();

        let pages: Vec<Arc<Page>> = self.open.iter().map(|e| e.value().clone()).collect();
        self.open.clear();
        if !pages.is_empty() {
            warn!("Closing {} open page(s)", pages.len());
        }

        for page in pages {
            page.close().await;
        }
    }

    pub fn stats(&self) -> PagePoolStats {
        PagePoolStats {
            size: self.size,
            open_pages: self.open.len(),
            available_slots: self.semaphore.available_permits(),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
        }
    }
}

/// A page on loan from the pool; dropping it closes the page and frees the slot.
pub struct PooledPage {
    id: u64,
    page: Arc<Page>,
    pool: Weak<PagePool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for PooledPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledPage").field("id", &self.id).finish_non_exhaustive()
    }
}

impl PooledPage {
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    /// Close the page and free its slot.
    pub async fn release(mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.open.remove(&self.id);
        }
        self.page.close().await;
        self.permit.take();
    }
}

impl Deref for PooledPage {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PooledPage {
    fn drop(&mut self) {
        // released pages already gave their permit back
        let Some(permit) = self.permit.take() else {
            return;
        };

        if let Some(pool) = self.pool.upgrade() {
            pool.open.remove(&self.id);
        }

        let page = self.page.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    page.close().await;
                    drop(permit);
                });
            }
            Err(_) => drop(permit),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PagePoolStats {
    pub size: usize,
    pub open_pages: usize,
    pub available_slots: usize,
    pub total_acquired: usize,
}
