//! High level fetch orchestration.
//!
//! Wires together the response cache, the retrying executor, the challenge
//! detector and the solver/proxy mitigation pipeline behind two entry points:
//! [`Fetcher::fetch_page`] runs the full pipeline, while
//! [`Fetcher::fetch_page_with_proxies`] goes straight to the proxy pool.

use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::challenges::core::{
	DEFAULT_USER_AGENT, ExecutionError, HttpTransport, ReqwestTransport, RequestExecutor,
	RequestProfile, RetryPolicy, TransportError, host_key,
};
use crate::challenges::detectors::{
	ChallengeDetector, DEFAULT_CONTENT_MARKER, Verdict,
};
use crate::challenges::pipeline::{ChallengePipeline, MitigationError, MitigationOutcome};
use crate::challenges::solvers::{ChallengeSolver, FlareSolverrClient};
use crate::config::{ConfigError, EnvConfig};
use crate::modules::cache::{
	CacheError, CacheStore, DEFAULT_CACHE_TTL, JsonFileCacheStore, MemoryCacheStore,
	RedbCacheStore, ResponseCache,
};
use crate::modules::events::{
	CacheEvent, ErrorEvent, EventDispatcher, EventHandler, FetchEvent, LoggingHandler,
	MetricsHandler,
};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::proxy::{ProxyConfig, ProxyError, ProxyPool};
use crate::modules::state::{
	DEFAULT_TIMEOUT_BUDGET, DEFAULT_TIMEOUT_DECAY, DurableCookiePolicy, HostState,
	HostStateStore, StateManager,
};

/// Result alias used across the facade.
pub type FetchResult<T> = Result<T, FetchError>;

/// Classified failure surfaced to callers. [`FetchError::code`] gives the stable
/// string form consumers match on.
#[derive(Debug, Error)]
pub enum FetchError {
	#[error("{url} was not found")]
	NotFound { url: String },
	#[error("{host} blocked the request and mitigation failed")]
	Blocked { host: String },
	#[error("challenge on {host} could not be bypassed ({signal})")]
	Challenge { host: String, signal: String },
	#[error("{url} is unavailable for legal reasons")]
	Censored { url: String },
	#[error("{host} is rate limiting requests")]
	TooManyRequests { host: String },
	#[error("{host} exceeded its timeout budget")]
	TooManyTimeouts { host: String },
	#[error("unexpected http status {0}")]
	Http(u16),
	#[error("no proxies configured")]
	NoProxies,
	#[error("request timed out after {0:?}")]
	Timeout(Duration),
	#[error("network error: {0}")]
	Network(#[source] TransportError),
	#[error("fetch cancelled")]
	Cancelled,
	#[error("invalid url: {0}")]
	InvalidUrl(#[from] url::ParseError),
	#[error("configuration error: {0}")]
	Config(String),
}

impl FetchError {
	/// Stable error code (`not_found`, `cloudflare_challenge`, `http_502`, ...).
	pub fn code(&self) -> Cow<'static, str> {
		match self {
			FetchError::NotFound { .. } => "not_found".into(),
			FetchError::Blocked { .. } => "blocked".into(),
			FetchError::Challenge { .. } => "cloudflare_challenge".into(),
			FetchError::Censored { .. } => "cloudflare_censor".into(),
			FetchError::TooManyRequests { .. } => "too_many_requests".into(),
			FetchError::TooManyTimeouts { .. } => "too_many_timeouts".into(),
			FetchError::Http(status) => format!("http_{status}").into(),
			FetchError::NoProxies => "no_proxies".into(),
			FetchError::Timeout(_) => "timeout".into(),
			FetchError::Network(_) => "network_error".into(),
			FetchError::Cancelled => "cancelled".into(),
			FetchError::InvalidUrl(_) => "invalid_url".into(),
			FetchError::Config(_) => "config_error".into(),
		}
	}

	/// Conditions a caller may reasonably retry later.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			FetchError::TooManyRequests { .. }
				| FetchError::TooManyTimeouts { .. }
				| FetchError::Timeout(_)
				| FetchError::Network(_)
		)
	}
}

impl From<ExecutionError> for FetchError {
	fn from(err: ExecutionError) -> Self {
		match err {
			ExecutionError::RateLimited(host) => FetchError::TooManyRequests { host },
			ExecutionError::TooManyTimeouts(host) => FetchError::TooManyTimeouts { host },
			ExecutionError::Transport(TransportError::Timeout(after)) => FetchError::Timeout(after),
			ExecutionError::Transport(other) => FetchError::Network(other),
			ExecutionError::Cancelled => FetchError::Cancelled,
		}
	}
}

impl From<MitigationError> for FetchError {
	fn from(err: MitigationError) -> Self {
		match err {
			MitigationError::Blocked { host } => FetchError::Blocked { host },
			MitigationError::Unbypassed { host, signal } => FetchError::Challenge {
				host,
				signal: signal.to_string(),
			},
			MitigationError::Cancelled => FetchError::Cancelled,
		}
	}
}

impl From<ConfigError> for FetchError {
	fn from(err: ConfigError) -> Self {
		FetchError::Config(err.to_string())
	}
}

impl From<CacheError> for FetchError {
	fn from(err: CacheError) -> Self {
		FetchError::Config(err.to_string())
	}
}

/// Per-call options for [`Fetcher::fetch_page`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
	/// Skip the cache lookup; a fresh result is still written back.
	pub no_cache: bool,
	pub cancellation: Option<CancellationToken>,
}

impl FetchOptions {
	pub fn no_cache() -> Self {
		Self {
			no_cache: true,
			..Self::default()
		}
	}

	pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
		self.cancellation = Some(token);
		self
	}
}

/// Fetcher configuration used by the builder.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
	pub solver_url: Option<Url>,
	pub proxies: Vec<String>,
	pub proxy_config: ProxyConfig,
	pub retry_policy: RetryPolicy,
	pub cache_ttl: Duration,
	pub cache_file: Option<std::path::PathBuf>,
	/// `None` disables the content-marker override.
	pub content_marker: Option<String>,
	pub durable_cookies: DurableCookiePolicy,
	pub timeout_budget: u32,
	pub timeout_decay: Duration,
	pub user_agent: String,
	pub enable_metrics: bool,
}

impl Default for FetcherConfig {
	fn default() -> Self {
		Self {
			solver_url: None,
			proxies: Vec::new(),
			proxy_config: ProxyConfig::default(),
			retry_policy: RetryPolicy::default(),
			cache_ttl: DEFAULT_CACHE_TTL,
			cache_file: None,
			content_marker: Some(DEFAULT_CONTENT_MARKER.to_string()),
			durable_cookies: DurableCookiePolicy::default(),
			timeout_budget: DEFAULT_TIMEOUT_BUDGET,
			timeout_decay: DEFAULT_TIMEOUT_DECAY,
			user_agent: DEFAULT_USER_AGENT.to_string(),
			enable_metrics: true,
		}
	}
}

/// Fluent builder for [`Fetcher`].
#[derive(Default)]
pub struct FetcherBuilder {
	config: FetcherConfig,
	transport: Option<Arc<dyn HttpTransport>>,
	state: Option<Arc<dyn HostStateStore>>,
	cache_store: Option<Arc<dyn CacheStore>>,
	solver: Option<Arc<dyn ChallengeSolver>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl FetcherBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Builder seeded from the process environment.
	pub fn from_env() -> FetchResult<Self> {
		Ok(Self::new().with_env(EnvConfig::from_env()?))
	}

	pub fn with_env(mut self, env: EnvConfig) -> Self {
		if let Some(url) = env.solver_url {
			self.config.solver_url = Some(url);
		}
		if !env.proxies.is_empty() {
			self.config.proxies = env.proxies;
		}
		if let Some(timeout) = env.request_timeout {
			self.config.retry_policy = self.config.retry_policy.with_request_timeout(timeout);
		}
		if let Some(marker) = env.content_marker {
			self.config.content_marker = (!marker.is_empty()).then_some(marker);
		}
		if let Some(path) = env.cache_file {
			self.config.cache_file = Some(path);
		}
		self
	}

	pub fn with_config(mut self, config: FetcherConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn with_host_state(mut self, state: Arc<dyn HostStateStore>) -> Self {
		self.state = Some(state);
		self
	}

	pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
		self.cache_store = Some(store);
		self
	}

	pub fn with_cache_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
		self.config.cache_file = Some(path.into());
		self
	}

	pub fn with_solver(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
		self.solver = Some(solver);
		self
	}

	pub fn with_solver_url(mut self, url: Url) -> Self {
		self.config.solver_url = Some(url);
		self
	}

	pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.proxies = proxies.into_iter().map(Into::into).collect();
		self
	}

	pub fn with_proxy_config(mut self, config: ProxyConfig) -> Self {
		self.config.proxy_config = config;
		self
	}

	pub fn with_content_marker(mut self, pattern: Option<&str>) -> Self {
		self.config.content_marker = pattern.map(str::to_string);
		self
	}

	pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
		self.config.retry_policy = policy;
		self
	}

	pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
		self.config.retry_policy = self.config.retry_policy.with_request_timeout(timeout);
		self
	}

	pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
		self.config.cache_ttl = ttl;
		self
	}

	pub fn with_durable_cookies(mut self, policy: DurableCookiePolicy) -> Self {
		self.config.durable_cookies = policy;
		self
	}

	pub fn with_timeout_budget(mut self, budget: u32, decay: Duration) -> Self {
		self.config.timeout_budget = budget;
		self.config.timeout_decay = decay;
		self
	}

	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.config.user_agent = user_agent.into();
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	pub fn build(self) -> FetchResult<Fetcher> {
		Fetcher::from_parts(self)
	}
}

/// Resilient page fetcher shared by every scraper.
pub struct Fetcher {
	config: FetcherConfig,
	cache: ResponseCache,
	executor: RequestExecutor,
	detector: Arc<ChallengeDetector>,
	pipeline: ChallengePipeline,
	state: Arc<dyn HostStateStore>,
	metrics: Option<MetricsCollector>,
	events: Arc<EventDispatcher>,
}

impl Fetcher {
	/// Construct a fetcher with default configuration.
	pub fn new() -> FetchResult<Self> {
		FetcherBuilder::new().build()
	}

	/// Obtain a builder to customise the fetcher instance.
	pub fn builder() -> FetcherBuilder {
		FetcherBuilder::new()
	}

	fn from_parts(builder: FetcherBuilder) -> FetchResult<Self> {
		let FetcherBuilder {
			config,
			transport,
			state,
			cache_store,
			solver,
			handlers,
		} = builder;

		let transport = transport.unwrap_or_else(|| Arc::new(ReqwestTransport::new()));
		let state = state.unwrap_or_else(|| {
			Arc::new(
				StateManager::new()
					.with_cookie_policy(config.durable_cookies.clone())
					.with_timeout_budget(config.timeout_budget, config.timeout_decay),
			)
		});

		let store = match (cache_store, &config.cache_file) {
			(Some(store), _) => store,
			(None, Some(path)) => open_cache_file(path)?,
			(None, None) => Arc::new(MemoryCacheStore::new()),
		};
		let cache = ResponseCache::new(store).with_ttl(config.cache_ttl);

		let detector = ChallengeDetector::default()
			.with_content_marker(config.content_marker.as_deref())
			.map_err(|err| FetchError::Config(format!("invalid content marker: {err}")))?;
		let detector = Arc::new(detector);

		let solver = match (solver, &config.solver_url) {
			(Some(solver), _) => Some(solver),
			(None, Some(url)) => {
				let client = FlareSolverrClient::new(url.clone())
					.map_err(|err| FetchError::Config(err.to_string()))?;
				Some(Arc::new(client) as Arc<dyn ChallengeSolver>)
			}
			(None, None) => None,
		};

		let profile = RequestProfile::new(&config.user_agent)
			.map_err(|err| FetchError::Config(format!("invalid user-agent: {err}")))?;

		let metrics = config.enable_metrics.then(MetricsCollector::new);
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in handlers {
			events.register_handler(handler);
		}
		let events = Arc::new(events);

		let executor = RequestExecutor::new(
			transport.clone(),
			state.clone(),
			events.clone(),
			profile.clone(),
			config.retry_policy.clone(),
		);

		let proxies = ProxyPool::new(config.proxies.iter().cloned())
			.with_config(config.proxy_config.clone());
		let pipeline = ChallengePipeline::new(transport, detector.clone(), state.clone(), events.clone())
			.with_solver(solver)
			.with_proxies(Arc::new(proxies))
			.with_profile(profile);

		log::debug!(
			"fetcher ready (solver={}, proxies={}, cache_ttl={:?})",
			pipeline.has_solver(),
			pipeline.proxies().len(),
			config.cache_ttl
		);

		Ok(Self {
			config,
			cache,
			executor,
			detector,
			pipeline,
			state,
			metrics,
			events,
		})
	}

	pub fn config(&self) -> &FetcherConfig {
		&self.config
	}

	/// Fetch `url` through the full pipeline: cache, retries, classification and
	/// challenge mitigation.
	pub async fn fetch_page(&self, url: &str, options: FetchOptions) -> FetchResult<String> {
		let url = Url::parse(url)?;
		let cancel = options.cancellation.unwrap_or_default();

		if !options.no_cache {
			let cached = self.cache.get(url.as_str());
			self.events.dispatch(FetchEvent::Cache(CacheEvent {
				url: url.to_string(),
				hit: cached.is_some(),
				status: cached.as_ref().map(|entry| entry.status),
				timestamp: chrono::Utc::now(),
			}));
			if let Some(entry) = cached {
				return match entry.status {
					404 => Err(FetchError::NotFound {
						url: url.to_string(),
					}),
					_ => Ok(entry.body),
				};
			}
		}

		self.fetch_fresh(&url, &cancel).await
	}

	/// Proxy-only fetch: never reads or writes the cache and never calls the solver.
	pub async fn fetch_page_with_proxies(&self, url: &str) -> FetchResult<String> {
		self.fetch_page_with_proxies_with_cancel(url, &CancellationToken::new())
			.await
	}

	pub async fn fetch_page_with_proxies_with_cancel(
		&self,
		url: &str,
		cancel: &CancellationToken,
	) -> FetchResult<String> {
		let url = Url::parse(url)?;
		match self.pipeline.fetch_via_proxies(&url, cancel).await {
			Ok(proxied) => Ok(proxied.response.body),
			Err(ProxyError::NoProxies) => Err(FetchError::NoProxies),
			Err(ProxyError::Cancelled) => Err(FetchError::Cancelled),
			Err(ProxyError::Exhausted { attempted }) => {
				log::debug!("{attempted} proxies failed for {url}");
				Err(FetchError::Challenge {
					host: host_key(&url),
					signal: "proxy_exhausted".into(),
				})
			}
		}
	}

	async fn fetch_fresh(&self, url: &Url, cancel: &CancellationToken) -> FetchResult<String> {
		let key = url.as_str();
		let response = match self.executor.execute(url, cancel).await {
			Ok(response) => response,
			Err(err) => {
				if !matches!(err, ExecutionError::Cancelled) {
					self.events.dispatch(FetchEvent::Error(ErrorEvent {
						host: host_key(url),
						error: err.to_string(),
						timestamp: chrono::Utc::now(),
					}));
				}
				return Err(err.into());
			}
		};

		match self.detector.classify(&response.view()) {
			Verdict::Accept => {
				self.cache
					.put(key, response.status, response.header_map(), &response.body);
				Ok(response.body)
			}
			Verdict::NotFound => {
				self.cache.put(key, 404, response.header_map(), "");
				Err(FetchError::NotFound {
					url: url.to_string(),
				})
			}
			Verdict::Challenge(detection) => {
				match self.pipeline.mitigate(url, &detection, cancel).await? {
					MitigationOutcome::Solved(solution) => {
						self.cache.put(key, 200, solution.headers.clone(), &solution.body);
						Ok(solution.body)
					}
					outcome @ MitigationOutcome::Proxied(_) => Ok(outcome.into_body()),
				}
			}
			Verdict::Censored => Err(FetchError::Censored {
				url: url.to_string(),
			}),
			Verdict::RateLimited => Err(FetchError::TooManyRequests {
				host: host_key(url),
			}),
			Verdict::HttpFailure(status) => Err(FetchError::Http(status)),
		}
	}

	/// Current state recorded for `host` (`host` or `host:port`).
	pub fn host_state(&self, host: &str) -> Option<HostState> {
		self.state.snapshot(host)
	}

	pub fn metrics(&self) -> Option<MetricsSnapshot> {
		self.metrics.as_ref().map(MetricsCollector::snapshot)
	}

	/// Drop expired cache entries eagerly; reads evict lazily anyway.
	pub fn purge_cache(&self) -> usize {
		self.cache.purge_expired()
	}
}

fn open_cache_file(path: &Path) -> FetchResult<Arc<dyn CacheStore>> {
	let store: Arc<dyn CacheStore> = match path.extension().and_then(|ext| ext.to_str()) {
		Some("redb") => Arc::new(RedbCacheStore::open(path)?),
		_ => Arc::new(JsonFileCacheStore::open(path)?),
	};
	Ok(store)
}
