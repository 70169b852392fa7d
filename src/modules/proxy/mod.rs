//! Proxy rotation utilities.
//!
//! A static, ordered pool of proxy endpoints with one shared round-robin cursor.
//! Each call tries at most two proxies; no per-proxy health is tracked.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use http::HeaderMap;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::challenges::core::{
    HttpTransport, TransportRequest, TransportResponse, host_key, mask_proxy,
    until_cancelled,
};
use crate::challenges::detectors::ChallengeDetector;
use crate::modules::events::{EventDispatcher, FetchEvent, RequestEvent, ResponseEvent};

pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(6);
pub const DEFAULT_MAX_PROXY_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Deadline for one proxied request.
    pub attempt_timeout: Duration,
    /// Proxies tried per call, starting at the cursor.
    pub max_attempts: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: DEFAULT_PROXY_TIMEOUT,
            max_attempts: DEFAULT_MAX_PROXY_ATTEMPTS,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no proxies configured")]
    NoProxies,
    #[error("all {attempted} proxy attempts failed")]
    Exhausted { attempted: usize },
    #[error("proxy attempt cancelled")]
    Cancelled,
}

/// Accepted response fetched through a proxy.
#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    pub response: TransportResponse,
    /// Masked endpoint that served the response.
    pub proxy: String,
}

#[derive(Debug, Default)]
pub struct ProxyPool {
    proxies: Vec<String>,
    cursor: AtomicUsize,
    config: ProxyConfig,
}

impl ProxyPool {
    pub fn new<I, S>(proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            proxies: proxies.into_iter().map(Into::into).collect(),
            cursor: AtomicUsize::new(0),
            config: ProxyConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Advance the cursor once and return the proxies to try for this call:
    /// the primary and, when the pool has more than one entry, its successor.
    pub fn next_candidates(&self) -> Vec<&str> {
        let total = self.proxies.len();
        if total == 0 {
            return Vec::new();
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % total;
        (0..self.config.max_attempts.clamp(1, total))
            .map(|offset| self.proxies[(start + offset) % total].as_str())
            .collect()
    }

    /// Try `url` through the next candidates, returning the first acceptable response.
    ///
    /// Failures here never count against the host's timeout budget.
    pub async fn attempt(
        &self,
        transport: &dyn HttpTransport,
        detector: &ChallengeDetector,
        url: &Url,
        headers: &HeaderMap,
        events: &EventDispatcher,
        cancel: &CancellationToken,
    ) -> Result<ProxiedResponse, ProxyError> {
        let candidates = self.next_candidates();
        if candidates.is_empty() {
            return Err(ProxyError::NoProxies);
        }

        let host = host_key(url);
        for (attempt, proxy) in candidates.iter().enumerate() {
            let masked = mask_proxy(proxy);
            events.dispatch(FetchEvent::Request(RequestEvent {
                url: url.clone(),
                host: host.clone(),
                attempt: attempt as u32,
                proxy: Some(masked.clone()),
                user_agent: headers
                    .get(http::header::USER_AGENT)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string(),
                has_cookie: headers.contains_key(http::header::COOKIE),
                timestamp: chrono::Utc::now(),
            }));

            let request = TransportRequest::new(url.clone(), self.config.attempt_timeout)
                .with_headers(headers.clone())
                .with_proxy(*proxy);
            let started = Instant::now();
            let outcome = until_cancelled(cancel, transport.execute(request))
                .await
                .map_err(|_| ProxyError::Cancelled)?;

            match outcome {
                Ok(response) => {
                    events.dispatch(FetchEvent::Response(ResponseEvent {
                        url: response.url.clone(),
                        host: host.clone(),
                        status: response.status,
                        latency: started.elapsed(),
                        proxy: Some(masked.clone()),
                        timestamp: chrono::Utc::now(),
                    }));
                    if detector.accepts_proxy_response(&response.view()) {
                        log::info!("proxy {masked} served {url} ({})", response.status);
                        return Ok(ProxiedResponse {
                            response,
                            proxy: masked,
                        });
                    }
                    log::debug!(
                        "proxy {masked} returned unusable response {} for {url}",
                        response.status
                    );
                }
                Err(err) => log::debug!("proxy {masked} failed for {url}: {err}"),
            }
        }

        Err(ProxyError::Exhausted {
            attempted: candidates.len(),
        })
    }
}
