//! Outbound fetching of intercepted requests
//!
//! The interceptor never lets the browser hit the network for a captured
//! request. It fetches the bytes itself through a `ResourceFetcher`, so the
//! same response can be cached, measured and handed back to the page.

use crate::{guess_mimetype, mimetype_from_content_type, CaptureError, Config, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::redirect::Policy;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    /// Stop reading once the body grows past this many bytes
    pub max_size: Option<usize>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            max_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    /// Final URL after following redirects
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub mimetype: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_event_stream(&self) -> bool {
        self.mimetype == "text/event-stream"
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResponse>;
}

/// Request headers the fetcher manages itself.
const SKIPPED_REQUEST_HEADERS: &[&str] = &["accept-encoding", "host", "content-length", "connection"];

pub struct HttpFetcher {
    client: reqwest::Client,
    extra_headers: HashMap<String, String>,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::limited(10))
            .timeout(config.navigation_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|e| CaptureError::ConfigurationError(e.to_string()))?;

        Ok(Self {
            client,
            extra_headers: config.request_headers.clone(),
        })
    }

    fn headers_for(&self, request: &FetchRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in request.headers.iter().chain(self.extra_headers.iter()) {
            if SKIPPED_REQUEST_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        headers
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| CaptureError::Resource(format!("{}: {}", request.url, e)))?;

        let mut response = self
            .client
            .request(method, &request.url)
            .headers(self.headers_for(request))
            .send()
            .await
            .map_err(|e| CaptureError::Resource(format!("{}: {}", request.url, e)))?;

        let url = response.url().to_string();
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let mimetype = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(mimetype_from_content_type)
            .unwrap_or_else(|| guess_mimetype(&url).to_string());

        // an event stream never ends, so its body is left to the browser
        let body = if mimetype == "text/event-stream" {
            Vec::new()
        } else {
            read_body(&mut response, &url, request.max_size).await?
        };

        if url != request.url {
            debug!("{} redirected to {}", request.url, url);
        }

        Ok(FetchedResponse {
            url,
            status,
            headers,
            mimetype,
            body,
        })
    }
}

/// Read the body, giving up as soon as it is known to exceed `max_size`.
async fn read_body(
    response: &mut reqwest::Response,
    url: &str,
    max_size: Option<usize>,
) -> Result<Vec<u8>> {
    let limit = max_size.unwrap_or(usize::MAX);
    if let Some(length) = response.content_length() {
        if length > limit as u64 {
            return Err(CaptureError::ResourceTooLarge {
                url: url.to_string(),
                size: length as usize,
            });
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| CaptureError::Resource(format!("{url}: {e}")))?
    {
        body.extend_from_slice(&chunk);
        if body.len() > limit {
            return Err(CaptureError::ResourceTooLarge {
                url: url.to_string(),
                size: body.len(),
            });
        }
    }
    Ok(body)
}
