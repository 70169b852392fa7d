//! Cross-cutting services module
//!
//! Shared host state, the response cache, proxy rotation, and the event and
//! metrics plumbing used by the fetch pipeline.

pub mod cache;
pub mod events;
pub mod metrics;
pub mod proxy;
pub mod state;

// Re-export commonly used types
pub use cache::{
    CacheEntry,
    CacheError,
    CacheStore,
    JsonFileCacheStore,
    MemoryCacheStore,
    RedbCacheStore,
    ResponseCache,
};
pub use events::{
    CacheEvent, ChallengeEvent, ErrorEvent, EventDispatcher, EventHandler, FetchEvent,
    LoggingHandler, MetricsHandler, MitigationStage, RequestEvent, ResponseEvent, RetryEvent,
};
pub use metrics::{GlobalStats, HostStats, MetricsCollector, MetricsSnapshot};
pub use proxy::{ProxiedResponse, ProxyConfig, ProxyError, ProxyPool};
pub use state::{DurableCookiePolicy, HostState, HostStateStore, StateManager};
