//! Event system for the fetch pipeline.
//!
//! Provides hooks for metrics, logging, and custom reactions around request
//! activity, cache lookups, retries, and challenge mitigation.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::MetricsCollector;

/// Structured pre-request event.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub url: Url,
    pub host: String,
    pub attempt: u32,
    /// Masked proxy endpoint when the request goes through the pool.
    pub proxy: Option<String>,
    pub user_agent: String,
    pub has_cookie: bool,
    pub timestamp: DateTime<Utc>,
}

/// Structured post-response event.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub url: Url,
    pub host: String,
    pub status: u16,
    pub latency: Duration,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub url: String,
    pub hit: bool,
    pub status: Option<u16>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MitigationStage {
    Solver,
    Proxy,
}

#[derive(Debug, Clone)]
pub struct ChallengeEvent {
    pub host: String,
    pub signal: String,
    pub stage: MitigationStage,
    pub success: bool,
    pub metadata: Vec<(String, String)>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub host: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub host: String,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum FetchEvent {
    Request(RequestEvent),
    Response(ResponseEvent),
    Cache(CacheEvent),
    Challenge(ChallengeEvent),
    Error(ErrorEvent),
    Retry(RetryEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &FetchEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: FetchEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &FetchEvent) {
        match event {
            FetchEvent::Request(req) => match req.proxy {
                Some(ref proxy) => {
                    log::debug!("-> {} via {} (attempt {})", req.url, proxy, req.attempt)
                }
                None => log::debug!(
                    "-> {} (attempt {}, ua={}, cookie={})",
                    req.url,
                    req.attempt,
                    req.user_agent,
                    req.has_cookie
                ),
            },
            FetchEvent::Response(resp) => {
                log::debug!(
                    "<- {} -> {} ({:.2}s)",
                    resp.url,
                    resp.status,
                    resp.latency.as_secs_f64()
                );
            }
            FetchEvent::Cache(cache) => {
                if cache.hit {
                    log::debug!("cache hit {} status={:?}", cache.url, cache.status);
                } else {
                    log::trace!("cache miss {}", cache.url);
                }
            }
            FetchEvent::Challenge(challenge) => {
                log::info!(
                    "challenge {} ({}) {:?} success={}",
                    challenge.host,
                    challenge.signal,
                    challenge.stage,
                    challenge.success
                );
            }
            FetchEvent::Error(error) => {
                log::warn!("warning {} -> {}", error.host, error.error);
            }
            FetchEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} after {:.2}s ({})",
                    retry.host,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &FetchEvent) {
        match event {
            FetchEvent::Response(resp) => {
                self.metrics.record_response(&resp.host, resp.status, resp.latency);
            }
            FetchEvent::Cache(cache) => {
                self.metrics.record_cache_lookup(cache.hit);
            }
            FetchEvent::Challenge(challenge) => {
                self.metrics.record_mitigation(challenge.stage, challenge.success);
            }
            FetchEvent::Error(error) => {
                self.metrics.record_error(&error.host);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &FetchEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.dispatch(FetchEvent::Error(ErrorEvent {
            host: "example.com".into(),
            error: "timeout".into(),
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[test]
    fn metrics_handler_counts_cache_lookups() {
        let metrics = MetricsCollector::new();
        let handler = MetricsHandler::new(metrics.clone());
        for hit in [true, false, true] {
            handler.handle(&FetchEvent::Cache(CacheEvent {
                url: "https://example.com/".into(),
                hit,
                status: hit.then_some(200),
                timestamp: Utc::now(),
            }));
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.global.cache_hits, 2);
        assert_eq!(snapshot.global.cache_misses, 1);
    }
}
