//! Request execution with bounded retries.
//!
//! Drives a single logical fetch through the transport while honouring the host's
//! rate-limit window and timeout circuit breaker:
//!
//! 1. A stored rate-limit window is slept through only when short and on the first
//!    attempt; otherwise the fetch fails fast.
//! 2. Hosts over their timeout budget short-circuit without touching the network.
//! 3. 5xx answers are retried with a fixed backoff up to the policy limit.
//! 4. 429 answers record `Retry-After` for the host and are retried once if short.
//! 5. Timeouts bump the host's counter and are retried once.
//!
//! Anything else is handed back to the caller for classification.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{
    ACCEPT, ACCEPT_LANGUAGE, COOKIE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER, USER_AGENT,
};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::analysis::{host_key, parse_retry_after};
use super::timing::RetryPolicy;
use super::types::{TransportRequest, TransportResponse};
use crate::modules::events::{
    EventDispatcher, FetchEvent, RequestEvent, ResponseEvent, RetryEvent,
};
use crate::modules::state::HostStateStore;

pub const DEFAULT_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 ",
    "(KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
);
const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en";
const PRIORITY: HeaderName = HeaderName::from_static("priority");

/// Contract that abstracts the HTTP transport used for every attempt.
///
/// Implementations perform exactly one request (no retries) and must honour
/// `request.timeout` and `request.proxy`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("invalid proxy '{0}'")]
    InvalidProxy(String),
    #[error("http transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Failure states that can occur while executing a fetch.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("host {0} is rate limited")]
    RateLimited(String),
    #[error("host {0} exceeded its timeout budget")]
    TooManyTimeouts(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("fetch cancelled by caller")]
    Cancelled,
}

/// Default headers plus the user-agent used when a host has none of its own.
#[derive(Debug, Clone)]
pub struct RequestProfile {
    base: HeaderMap,
    default_user_agent: HeaderValue,
}

impl RequestProfile {
    pub fn new(default_user_agent: &str) -> Result<Self, http::header::InvalidHeaderValue> {
        Ok(Self {
            default_user_agent: HeaderValue::from_str(default_user_agent)?,
            ..Self::default()
        })
    }

    pub fn default_user_agent(&self) -> &HeaderValue {
        &self.default_user_agent
    }

    /// Headers for a request to `host`, with the host's stored user-agent and,
    /// when `with_cookies` is set, its durable cookies.
    pub fn headers_for(
        &self,
        state: &dyn HostStateStore,
        host: &str,
        with_cookies: bool,
    ) -> HeaderMap {
        let mut headers = self.base.clone();

        let user_agent = state
            .user_agent(host)
            .and_then(|agent| HeaderValue::from_str(&agent).ok())
            .unwrap_or_else(|| self.default_user_agent.clone());
        headers.insert(USER_AGENT, user_agent);

        if with_cookies && let Some(cookies) = state.cookie_header(host) {
            match HeaderValue::from_str(&cookies) {
                Ok(value) => {
                    headers.insert(COOKIE, value);
                }
                Err(_) => log::warn!("dropping unencodable cookie header for {host}"),
            }
        }

        headers
    }
}

impl Default for RequestProfile {
    fn default() -> Self {
        let mut base = HeaderMap::new();
        base.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
        base.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE));
        base.insert(PRIORITY, HeaderValue::from_static("u=0"));
        Self {
            base,
            default_user_agent: HeaderValue::from_static(DEFAULT_USER_AGENT),
        }
    }
}

/// Race `future` against the caller's cancellation token.
pub async fn until_cancelled<F>(
    cancel: &CancellationToken,
    future: F,
) -> Result<F::Output, ExecutionError>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
        output = future => Ok(output),
    }
}

/// Retry/rate-limit orchestrator wrapping a transport.
pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    state: Arc<dyn HostStateStore>,
    events: Arc<EventDispatcher>,
    profile: RequestProfile,
    policy: RetryPolicy,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        state: Arc<dyn HostStateStore>,
        events: Arc<EventDispatcher>,
        profile: RequestProfile,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            state,
            events,
            profile,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the bounded retry loop for `url`.
    ///
    /// Terminates after at most `max_server_error_retries + 1` attempts; rate-limit
    /// and timeout retries only happen on the first attempt.
    pub async fn execute(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, ExecutionError> {
        let host = host_key(url);
        let mut attempt: u32 = 0;

        loop {
            if let Some(until) = self.state.rate_limited_until(&host) {
                let now = Instant::now();
                if until > now {
                    let wait = until - now;
                    if !self.policy.waits_for_rate_limit(attempt, wait) {
                        log::debug!(
                            "{host} rate limited for another {:.1}s, failing fast",
                            wait.as_secs_f64()
                        );
                        return Err(ExecutionError::RateLimited(host));
                    }
                    self.notify_retry(&host, attempt, "rate_limit_window", wait);
                    until_cancelled(cancel, tokio::time::sleep_until(until)).await?;
                }
            }

            if self.state.timeout_budget_exceeded(&host) {
                return Err(ExecutionError::TooManyTimeouts(host));
            }

            let headers = self.profile.headers_for(self.state.as_ref(), &host, true);
            self.events.dispatch(FetchEvent::Request(RequestEvent {
                url: url.clone(),
                host: host.clone(),
                attempt,
                proxy: None,
                user_agent: header_text(&headers, USER_AGENT),
                has_cookie: headers.contains_key(COOKIE),
                timestamp: chrono::Utc::now(),
            }));

            let request = TransportRequest::new(url.clone(), self.policy.request_timeout)
                .with_headers(headers);
            let started = Instant::now();
            let outcome = until_cancelled(cancel, self.transport.execute(request)).await?;

            match outcome {
                Ok(response) => {
                    self.events.dispatch(FetchEvent::Response(ResponseEvent {
                        url: response.url.clone(),
                        host: host.clone(),
                        status: response.status,
                        latency: started.elapsed(),
                        proxy: None,
                        timestamp: chrono::Utc::now(),
                    }));

                    match response.status {
                        500..=599 if self.policy.retries_server_error(attempt) => {
                            let reason = format!("status_{}", response.status);
                            self.backoff(&host, attempt, reason, cancel).await?;
                        }
                        429 => {
                            let retry_after = response
                                .headers
                                .get(RETRY_AFTER)
                                .and_then(|value| value.to_str().ok())
                                .and_then(parse_retry_after);
                            let Some((wait, until)) = retry_after
                                .and_then(|wait| Some((wait, Instant::now().checked_add(wait)?)))
                            else {
                                return Ok(response);
                            };
                            self.state.extend_rate_limit(&host, until);
                            if !self.policy.waits_for_rate_limit(attempt, wait) {
                                return Ok(response);
                            }
                            self.notify_retry(&host, attempt, "retry_after", wait);
                            until_cancelled(cancel, tokio::time::sleep_until(until)).await?;
                        }
                        _ => return Ok(response),
                    }
                }
                Err(err) if err.is_timeout() => {
                    let count = self.state.record_timeout(&host);
                    log::debug!("{url} timed out ({count} timeouts recorded for {host})");
                    if !self.policy.retries_timeout(attempt) {
                        return Err(err.into());
                    }
                    self.backoff(&host, attempt, "timeout".to_string(), cancel).await?;
                }
                Err(err) => return Err(err.into()),
            }

            attempt += 1;
        }
    }

    async fn backoff(
        &self,
        host: &str,
        attempt: u32,
        reason: String,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        let delay = self.policy.backoff;
        self.notify_retry(host, attempt, reason, delay);
        until_cancelled(cancel, tokio::time::sleep(delay)).await
    }

    fn notify_retry(&self, host: &str, attempt: u32, reason: impl Into<String>, after: Duration) {
        self.events.dispatch(FetchEvent::Retry(RetryEvent {
            host: host.to_string(),
            attempt: attempt + 1,
            reason: reason.into(),
            scheduled_after: after,
            timestamp: chrono::Utc::now(),
        }));
    }
}

fn header_text(headers: &HeaderMap, name: HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
