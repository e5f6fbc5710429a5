use std::time::Duration;
use url::Url;

/// Hostname policy for intercepted requests.
///
/// Patterns match exactly, by leading `*.` suffix (`*.example.com` matches
/// `cdn.example.com` but not `example.com`), or `*` for any host.
#[derive(Debug, Clone, Default)]
pub struct HostnameMatcher {
    patterns: Vec<String>,
}

impl HostnameMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn push(&mut self, pattern: impl AsRef<str>) {
        let pattern = pattern.as_ref().trim().to_ascii_lowercase();
        if !pattern.is_empty() && !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
    }

    pub fn matches(&self, hostname: &str) -> bool {
        let hostname = hostname.to_ascii_lowercase();
        self.patterns
            .iter()
            .any(|pattern| hostname_matches(pattern, &hostname))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

pub fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    match pattern.strip_prefix("*.") {
        Some(suffix) => hostname
            .strip_suffix(suffix)
            .map_or(false, |rest| rest.ends_with('.') && rest.len() > 1),
        None => pattern == hostname,
    }
}

/// Short human-readable duration: `250ms`, `4.2s`, `3m 5s`, `1h 2m 5s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let tenths = duration.subsec_millis() / 100;

    match (secs / 3600, secs % 3600 / 60, secs % 60) {
        (0, 0, 0) => format!("{}ms", duration.subsec_millis()),
        (0, 0, s) => format!("{s}.{tenths}s"),
        (0, m, s) => format!("{m}m {s}s"),
        (h, m, s) => format!("{h}h {m}m {s}s"),
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

pub fn validate_url(url: &str) -> Result<Url, url::ParseError> {
    let parsed = Url::parse(url)?;

    // Ensure it's HTTP or HTTPS
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        _ => Err(url::ParseError::InvalidPort),
    }
}

pub fn extract_hostname(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Drop the fragment so `page#a` and `page#b` address the same document.
pub fn normalize_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// Mimetype from a `Content-Type` header value, without parameters.
pub fn mimetype_from_content_type(content_type: &str) -> Option<String> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    (!mime.is_empty()).then_some(mime)
}

pub fn guess_mimetype(url: &str) -> &'static str {
    let path = Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_default();
    let extension = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");

    match extension {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        _ => "application/octet-stream",
    }
}
