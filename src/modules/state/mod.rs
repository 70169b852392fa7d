//! Shared per-host state.
//!
//! Keeps the durable anti-bot cookies, the user-agent that earned them, the
//! rate-limit window, and the timeout circuit breaker for every host the fetcher
//! talks to. Entries are created lazily and live for the process lifetime.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::challenges::solvers::SolvedCookie;

/// Timeouts a host may accumulate before fetches short-circuit.
pub const DEFAULT_TIMEOUT_BUDGET: u32 = 30;
/// Quiet period after the last recorded timeout that resets the counter.
pub const DEFAULT_TIMEOUT_DECAY: Duration = Duration::from_secs(60 * 60);
/// Clearance cookie issued once a challenge has been passed.
pub const CLEARANCE_COOKIE: &str = "cf_clearance";

/// Allow-list of cookie names worth keeping between requests.
///
/// Anything not listed is discarded when solver results are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableCookiePolicy {
    allowed: Vec<String>,
}

impl DurableCookiePolicy {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn retains(&self, name: &str) -> bool {
        self.allowed.iter().any(|allowed| allowed == name)
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }
}

impl Default for DurableCookiePolicy {
    fn default() -> Self {
        Self::new([CLEARANCE_COOKIE])
    }
}

/// Mutable state tracked for one host.
#[derive(Debug, Clone, Default)]
pub struct HostState {
    pub cookies: BTreeMap<String, String>,
    pub user_agent: Option<String>,
    pub rate_limited_until: Option<Instant>,
    pub timeout_failures: u32,
    pub last_timeout: Option<Instant>,
}

impl HostState {
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Reset the timeout counter once the decay window elapsed since the last increment.
    fn decay_timeouts(&mut self, now: Instant, window: Duration) {
        if let Some(last) = self.last_timeout
            && now.saturating_duration_since(last) >= window
        {
            self.timeout_failures = 0;
            self.last_timeout = None;
        }
    }

    fn active_timeouts(&self, now: Instant, window: Duration) -> u32 {
        match self.last_timeout {
            Some(last) if now.saturating_duration_since(last) < window => self.timeout_failures,
            _ => 0,
        }
    }
}

/// Storage contract for per-host state.
///
/// Every method is a single atomic operation on the underlying map so callers
/// never hold a lock across a network call.
pub trait HostStateStore: Send + Sync {
    fn cookie_header(&self, host: &str) -> Option<String>;
    fn user_agent(&self, host: &str) -> Option<String>;
    /// Merge solver output, keeping only durable cookies.
    fn merge_solved_state(&self, host: &str, cookies: &[SolvedCookie], user_agent: Option<&str>);
    /// Increment the timeout counter and return the new value.
    fn record_timeout(&self, host: &str) -> u32;
    fn timeout_budget_exceeded(&self, host: &str) -> bool;
    fn rate_limited_until(&self, host: &str) -> Option<Instant>;
    /// Record a rate-limit window, keeping whichever expiry is later.
    fn extend_rate_limit(&self, host: &str, until: Instant);
    fn snapshot(&self, host: &str) -> Option<HostState>;
}

/// Thread-safe in-memory state manager.
#[derive(Clone, Debug)]
pub struct StateManager {
    inner: Arc<RwLock<HashMap<String, HostState>>>,
    cookie_policy: DurableCookiePolicy,
    timeout_budget: u32,
    timeout_decay: Duration,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            cookie_policy: DurableCookiePolicy::default(),
            timeout_budget: DEFAULT_TIMEOUT_BUDGET,
            timeout_decay: DEFAULT_TIMEOUT_DECAY,
        }
    }

    pub fn with_cookie_policy(mut self, policy: DurableCookiePolicy) -> Self {
        self.cookie_policy = policy;
        self
    }

    pub fn with_timeout_budget(mut self, budget: u32, decay: Duration) -> Self {
        self.timeout_budget = budget.max(1);
        self.timeout_decay = decay;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, HostState>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, HostState>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update<F, T>(&self, host: &str, f: F) -> T
    where
        F: FnOnce(&mut HostState) -> T,
    {
        let mut guard = self.write();
        f(guard.entry(host.to_string()).or_default())
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HostStateStore for StateManager {
    fn cookie_header(&self, host: &str) -> Option<String> {
        self.read().get(host).and_then(HostState::cookie_header)
    }

    fn user_agent(&self, host: &str) -> Option<String> {
        self.read().get(host).and_then(|state| state.user_agent.clone())
    }

    fn merge_solved_state(&self, host: &str, cookies: &[SolvedCookie], user_agent: Option<&str>) {
        let policy = &self.cookie_policy;
        let retained = self.update(host, |state| {
            let mut retained = Vec::new();
            for cookie in cookies.iter().filter(|cookie| policy.retains(&cookie.name)) {
                state.cookies.insert(cookie.name.clone(), cookie.value.clone());
                retained.push(cookie.name.clone());
            }
            if let Some(agent) = user_agent.filter(|agent| !agent.is_empty()) {
                state.user_agent = Some(agent.to_string());
            }
            retained
        });
        log::debug!(
            "stored solver state for {host}: cookies=[{}] ua={}",
            retained.join(","),
            user_agent.is_some()
        );
    }

    fn record_timeout(&self, host: &str) -> u32 {
        let window = self.timeout_decay;
        self.update(host, |state| {
            let now = Instant::now();
            state.decay_timeouts(now, window);
            state.timeout_failures = state.timeout_failures.saturating_add(1);
            state.last_timeout = Some(now);
            state.timeout_failures
        })
    }

    fn timeout_budget_exceeded(&self, host: &str) -> bool {
        self.read()
            .get(host)
            .map(|state| state.active_timeouts(Instant::now(), self.timeout_decay))
            .is_some_and(|count| count >= self.timeout_budget)
    }

    fn rate_limited_until(&self, host: &str) -> Option<Instant> {
        self.read().get(host).and_then(|state| state.rate_limited_until)
    }

    fn extend_rate_limit(&self, host: &str, until: Instant) {
        self.update(host, |state| {
            state.rate_limited_until = Some(match state.rate_limited_until {
                Some(current) if current > until => current,
                _ => until,
            });
        });
    }

    fn snapshot(&self, host: &str) -> Option<HostState> {
        self.read().get(host).cloned()
    }
}
