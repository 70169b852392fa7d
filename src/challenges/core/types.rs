//! Core data structures shared across the transport, detection, and mitigation layers.

use std::collections::BTreeMap;
use std::time::Duration;

use http::HeaderMap;
use url::Url;

/// Borrowed view of an HTTP response handed to the challenge detector.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    pub url: &'a Url,
    pub status: u16,
    pub headers: &'a HeaderMap,
    pub body: &'a str,
}

impl ResponseView<'_> {
    pub fn is_success(&self) -> bool {
        is_success_status(self.status)
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Single outbound attempt handed to an [`HttpTransport`](super::HttpTransport).
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub proxy: Option<String>,
}

impl TransportRequest {
    pub fn new(url: Url, timeout: Duration) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
            timeout,
            proxy: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }
}

/// Fully buffered response returned by the transport.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    pub url: Url,
}

impl TransportResponse {
    pub fn view(&self) -> ResponseView<'_> {
        ResponseView {
            url: &self.url,
            status: self.status,
            headers: &self.headers,
            body: &self.body,
        }
    }

    /// Flatten headers into an owned map suitable for caching.
    pub fn header_map(&self) -> BTreeMap<String, String> {
        flatten_headers(&self.headers)
    }
}

/// Status codes treated as usable content (2xx and 3xx).
pub fn is_success_status(status: u16) -> bool {
    (200..=399).contains(&status)
}

pub fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}
