//! Fetch metrics.
//!
//! Counts responses per host by outcome class, keeps a bounded latency window
//! for averages and p95, and tallies cache lookups and mitigation results.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::events::MitigationStage;

const DEFAULT_WINDOW: usize = 128;
const MIN_WINDOW: usize = 16;

/// Process-wide counters.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub responses: u64,
    pub errors: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub solver_successes: u64,
    pub solver_failures: u64,
    pub proxy_successes: u64,
    pub proxy_failures: u64,
}

impl GlobalStats {
    fn empty() -> Self {
        Self {
            started_at: Utc::now(),
            responses: 0,
            errors: 0,
            average_latency: None,
            p95_latency: None,
            cache_hits: 0,
            cache_misses: 0,
            solver_successes: 0,
            solver_failures: 0,
            proxy_successes: 0,
            proxy_failures: 0,
        }
    }
}

/// Per-host view. `failure_streak` counts consecutive non-success outcomes,
/// failed fetches included.
#[derive(Debug, Clone, Default)]
pub struct HostStats {
    pub host: String,
    pub ok: u64,
    pub forbidden: u64,
    pub rate_limited: u64,
    pub server_errors: u64,
    pub other_failures: u64,
    pub errors: u64,
    pub failure_streak: u32,
    pub last_status: Option<u16>,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl HostStats {
    pub fn responses(&self) -> u64 {
        self.ok + self.forbidden + self.rate_limited + self.server_errors + self.other_failures
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub hosts: Vec<HostStats>,
}

impl MetricsSnapshot {
    pub fn host(&self, host: &str) -> Option<&HostStats> {
        self.hosts.iter().find(|stats| stats.host == host)
    }
}

/// Most recent latency samples, oldest dropped first.
#[derive(Debug)]
struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    fn p95(&self) -> Option<Duration> {
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (sorted.len() * 95).div_ceil(100);
        sorted.get(rank.checked_sub(1)?).copied()
    }
}

#[derive(Debug)]
struct HostLedger {
    stats: HostStats,
    latency: LatencyWindow,
}

#[derive(Debug)]
struct Ledger {
    global: GlobalStats,
    latency: LatencyWindow,
    window: usize,
    hosts: HashMap<String, HostLedger>,
}

impl Ledger {
    fn host(&mut self, host: &str) -> &mut HostLedger {
        let window = self.window;
        self.hosts.entry(host.to_string()).or_insert_with(|| HostLedger {
            stats: HostStats {
                host: host.to_string(),
                ..HostStats::default()
            },
            latency: LatencyWindow::new(window),
        })
    }
}

/// Shared collector fed by [`MetricsHandler`](super::events::MetricsHandler).
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    ledger: Arc<Mutex<Ledger>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Collector keeping at most `window` latency samples per host (never fewer than 16).
    pub fn with_window(window: usize) -> Self {
        let window = window.max(MIN_WINDOW);
        Self {
            ledger: Arc::new(Mutex::new(Ledger {
                global: GlobalStats::empty(),
                latency: LatencyWindow::new(window),
                window,
                hosts: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_response(&self, host: &str, status: u16, latency: Duration) {
        let mut ledger = self.lock();
        ledger.global.responses += 1;
        ledger.latency.push(latency);
        ledger.global.average_latency = ledger.latency.average();
        ledger.global.p95_latency = ledger.latency.p95();

        let entry = ledger.host(host);
        entry.latency.push(latency);
        let stats = &mut entry.stats;
        stats.last_status = Some(status);
        match status {
            200..=399 => stats.ok += 1,
            403 => stats.forbidden += 1,
            429 => stats.rate_limited += 1,
            500..=599 => stats.server_errors += 1,
            _ => stats.other_failures += 1,
        }
        if (200..=399).contains(&status) {
            stats.failure_streak = 0;
        } else {
            stats.failure_streak = stats.failure_streak.saturating_add(1);
        }
    }

    pub fn record_error(&self, host: &str) {
        let mut ledger = self.lock();
        ledger.global.errors += 1;
        let stats = &mut ledger.host(host).stats;
        stats.errors += 1;
        stats.failure_streak = stats.failure_streak.saturating_add(1);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let mut ledger = self.lock();
        if hit {
            ledger.global.cache_hits += 1;
        } else {
            ledger.global.cache_misses += 1;
        }
    }

    pub fn record_mitigation(&self, stage: MitigationStage, success: bool) {
        let mut ledger = self.lock();
        let global = &mut ledger.global;
        match (stage, success) {
            (MitigationStage::Solver, true) => global.solver_successes += 1,
            (MitigationStage::Solver, false) => global.solver_failures += 1,
            (MitigationStage::Proxy, true) => global.proxy_successes += 1,
            (MitigationStage::Proxy, false) => global.proxy_failures += 1,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let ledger = self.lock();
        let mut hosts: Vec<HostStats> = ledger
            .hosts
            .values()
            .map(|entry| HostStats {
                average_latency: entry.latency.average(),
                p95_latency: entry.latency.p95(),
                ..entry.stats.clone()
            })
            .collect();
        hosts.sort_by(|a, b| a.host.cmp(&b.host));
        MetricsSnapshot {
            global: ledger.global.clone(),
            hosts,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_responses_per_host() {
        let metrics = MetricsCollector::new();
        metrics.record_response("films.example", 200, Duration::from_millis(120));
        metrics.record_response("films.example", 403, Duration::from_millis(40));
        metrics.record_response("films.example", 502, Duration::from_millis(900));
        metrics.record_error("films.example");
        metrics.record_response("other.example", 429, Duration::from_millis(10));

        let snapshot = metrics.snapshot();
        let films = snapshot.host("films.example").unwrap();
        assert_eq!(films.ok, 1);
        assert_eq!(films.forbidden, 1);
        assert_eq!(films.server_errors, 1);
        assert_eq!(films.errors, 1);
        assert_eq!(films.responses(), 3);
        assert_eq!(films.failure_streak, 3);
        assert_eq!(films.last_status, Some(502));
        assert_eq!(snapshot.host("other.example").unwrap().rate_limited, 1);
        assert_eq!(snapshot.global.responses, 4);
        assert_eq!(snapshot.global.errors, 1);
    }

    #[test]
    fn success_resets_failure_streak() {
        let metrics = MetricsCollector::new();
        metrics.record_error("films.example");
        metrics.record_response("films.example", 503, Duration::from_millis(5));
        metrics.record_response("films.example", 304, Duration::from_millis(5));
        assert_eq!(metrics.snapshot().host("films.example").unwrap().failure_streak, 0);
    }

    #[test]
    fn latency_window_is_bounded() {
        let metrics = MetricsCollector::with_window(1);
        for ms in 1..=20u64 {
            metrics.record_response("films.example", 200, Duration::from_millis(ms * 10));
        }
        let host = metrics.snapshot().host("films.example").cloned().unwrap();
        // Window clamps to 16 samples: 50ms..=200ms.
        assert_eq!(host.average_latency, Some(Duration::from_millis(125)));
        assert_eq!(host.p95_latency, Some(Duration::from_millis(200)));
    }

    #[test]
    fn counts_mitigation_stages() {
        let metrics = MetricsCollector::new();
        metrics.record_mitigation(MitigationStage::Solver, false);
        metrics.record_mitigation(MitigationStage::Proxy, true);
        let global = metrics.snapshot().global;
        assert_eq!(global.solver_failures, 1);
        assert_eq!(global.proxy_successes, 1);
        assert_eq!(global.solver_successes, 0);
    }
}
