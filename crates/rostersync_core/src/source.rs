use std::io::{self, Read};
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::HttpSection;
use crate::document::HtmlDocument;

const BLOCK_MARKERS: &[&str] = &[
    "captcha",
    "cf-challenge",
    "challenge-platform",
    "access denied",
    "are you a robot",
    "unusual traffic",
];

const ERROR_PATH_MARKERS: &[&str] = &["404", "not-found", "notfound", "page-not-found", "/error"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorKind {
    Unreachable,
    NotFound,
    Blocked,
}

impl SourceErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::NotFound => "not_found",
            Self::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("unreachable: {address}: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("not found: {address} ({reason})")]
    NotFound { address: String, reason: String },
    #[error("blocked: {address} ({reason})")]
    Blocked { address: String, reason: String },
}

impl SourceError {
    pub fn kind(&self) -> SourceErrorKind {
        match self {
            Self::Unreachable { .. } => SourceErrorKind::Unreachable,
            Self::NotFound { .. } => SourceErrorKind::NotFound,
            Self::Blocked { .. } => SourceErrorKind::Blocked,
        }
    }
}

/// Fetches one rendered page per call. Implementations make exactly one
/// attempt; retrying is left to whoever re-runs the pipeline.
pub trait PageSource {
    fn fetch(&mut self, address: &str) -> Result<HtmlDocument, SourceError>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSourceConfig {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub min_delay_ms: u64,
    pub max_bytes: usize,
}

impl HttpSourceConfig {
    pub fn from_section(section: &HttpSection) -> Self {
        Self {
            user_agent: section.user_agent(),
            timeout_ms: section.timeout_ms(),
            min_delay_ms: section.min_delay_ms(),
            max_bytes: section.max_bytes(),
        }
    }
}

pub struct HttpSource {
    client: Client,
    config: HttpSourceConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl HttpSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build roster HTTP client")?;
        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.min_delay_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }
}

impl PageSource for HttpSource {
    fn fetch(&mut self, address: &str) -> Result<HtmlDocument, SourceError> {
        let url = Url::parse(address).map_err(|error| SourceError::NotFound {
            address: address.to_string(),
            reason: format!("invalid address: {error}"),
        })?;

        self.apply_rate_limit();
        debug!(address, "fetching page");
        let response = self
            .client
            .get(url.clone())
            .header("User-Agent", self.config.user_agent.clone())
            .header("Accept", "text/html,application/xhtml+xml;q=0.9,*/*;q=0.1")
            .send()
            .map_err(|error| SourceError::Unreachable {
                address: address.to_string(),
                reason: error.to_string(),
            })?;

        let status = response.status();
        let final_url = response.url().clone();
        let body = if status.is_success() || status == StatusCode::SERVICE_UNAVAILABLE {
            read_capped(response, self.config.max_bytes).map_err(|error| {
                SourceError::Unreachable {
                    address: address.to_string(),
                    reason: format!("failed to read body: {error}"),
                }
            })?
        } else {
            String::new()
        };

        classify_response(address, status, &url, &final_url, &body)?;
        Ok(HtmlDocument::new(final_url.to_string(), body))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Map a response onto the adapter's failure taxonomy.
pub fn classify_response(
    address: &str,
    status: StatusCode,
    requested: &Url,
    final_url: &Url,
    body: &str,
) -> Result<(), SourceError> {
    if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(SourceError::Blocked {
            address: address.to_string(),
            reason: format!("HTTP {}", status.as_u16()),
        });
    }
    if status.is_server_error() {
        if status == StatusCode::SERVICE_UNAVAILABLE && has_block_marker(body) {
            return Err(SourceError::Blocked {
                address: address.to_string(),
                reason: "anti-automation challenge".to_string(),
            });
        }
        return Err(SourceError::Unreachable {
            address: address.to_string(),
            reason: format!("HTTP {}", status.as_u16()),
        });
    }
    if status.is_client_error() {
        return Err(SourceError::NotFound {
            address: address.to_string(),
            reason: format!("HTTP {}", status.as_u16()),
        });
    }
    if !status.is_success() {
        return Err(SourceError::Unreachable {
            address: address.to_string(),
            reason: format!("unexpected HTTP {}", status.as_u16()),
        });
    }
    if final_url.path() != requested.path() && looks_like_error_path(final_url.path()) {
        return Err(SourceError::NotFound {
            address: address.to_string(),
            reason: format!("redirected to {final_url}"),
        });
    }
    if has_block_marker(body) && !looks_like_content(body) {
        return Err(SourceError::Blocked {
            address: address.to_string(),
            reason: "anti-automation page".to_string(),
        });
    }
    Ok(())
}

fn has_block_marker(body: &str) -> bool {
    let head = truncate_at_char_boundary(body, 16_384).to_ascii_lowercase();
    BLOCK_MARKERS.iter().any(|marker| head.contains(marker))
}

// Challenge pages are tiny and imageless; real roster pages mentioning
// "captcha" in a footer script are not.
fn looks_like_content(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.len() > 50_000 || lower.matches("<img").count() >= 5
}

fn looks_like_error_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    ERROR_PATH_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Read at most `max_bytes` of a body. A character split by the cap is dropped.
fn read_capped(reader: impl Read, max_bytes: usize) -> io::Result<String> {
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX);
    let mut bytes = Vec::new();
    reader.take(limit).read_to_end(&mut bytes)?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(error) => {
            let valid_up_to = error.utf8_error().valid_up_to();
            let incomplete_tail = error.utf8_error().error_len().is_none();
            let mut bytes = error.into_bytes();
            if incomplete_tail {
                bytes.truncate(valid_up_to);
            }
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

fn truncate_at_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use reqwest::Url;

    use super::{SourceErrorKind, classify_response, read_capped, truncate_at_char_boundary};

    fn url(value: &str) -> Url {
        Url::parse(value).expect("url")
    }

    fn kind(status: StatusCode, requested: &str, final_url: &str, body: &str) -> Option<SourceErrorKind> {
        classify_response(requested, status, &url(requested), &url(final_url), body)
            .err()
            .map(|error| error.kind())
    }

    #[test]
    fn block_statuses_are_blocked() {
        let address = "https://a.example.edu/roster";
        assert_eq!(kind(StatusCode::FORBIDDEN, address, address, ""), Some(SourceErrorKind::Blocked));
        assert_eq!(
            kind(StatusCode::TOO_MANY_REQUESTS, address, address, ""),
            Some(SourceErrorKind::Blocked)
        );
        assert_eq!(
            kind(StatusCode::SERVICE_UNAVAILABLE, address, address, "<div id=cf-challenge>"),
            Some(SourceErrorKind::Blocked)
        );
    }

    #[test]
    fn server_errors_are_unreachable_and_client_errors_not_found() {
        let address = "https://a.example.edu/roster";
        assert_eq!(
            kind(StatusCode::BAD_GATEWAY, address, address, ""),
            Some(SourceErrorKind::Unreachable)
        );
        assert_eq!(kind(StatusCode::NOT_FOUND, address, address, ""), Some(SourceErrorKind::NotFound));
        assert_eq!(kind(StatusCode::GONE, address, address, ""), Some(SourceErrorKind::NotFound));
    }

    #[test]
    fn redirect_to_error_page_is_not_found() {
        assert_eq!(
            kind(
                StatusCode::OK,
                "https://a.example.edu/roster/jane/1",
                "https://a.example.edu/404.aspx",
                "<html></html>"
            ),
            Some(SourceErrorKind::NotFound)
        );
        assert_eq!(
            kind(
                StatusCode::OK,
                "https://a.example.edu/roster/jane/1",
                "https://a.example.edu/roster/jane-doe/1",
                "<html></html>"
            ),
            None
        );
    }

    #[test]
    fn small_challenge_body_is_blocked() {
        let address = "https://a.example.edu/roster";
        assert_eq!(
            kind(StatusCode::OK, address, address, "<title>Please complete the CAPTCHA</title>"),
            Some(SourceErrorKind::Blocked)
        );
        let real_page = format!("captcha{}", "<img src=x.jpg>".repeat(6));
        assert_eq!(kind(StatusCode::OK, address, address, &real_page), None);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_at_char_boundary("héllo", 2), "h");
        assert_eq!(truncate_at_char_boundary("abc", 10), "abc");
    }

    #[test]
    fn body_read_stops_at_the_cap() {
        let body = "<html>".to_string() + &"x".repeat(10_000);
        let read = read_capped(body.as_bytes(), 64).expect("read");
        assert_eq!(read.len(), 64);
        assert!(read.starts_with("<html>"));

        // 'é' is two bytes; cutting through it drops the partial character.
        let read = read_capped("abé".as_bytes(), 3).expect("read");
        assert_eq!(read, "ab");
        assert_eq!(read_capped("abé".as_bytes(), 1024).expect("read"), "abé");
    }
}
