//! Challenge mitigation pipeline.
//!
//! Once the detector flags a response, the pipeline tries the external solver
//! first and falls back to the proxy pool. A solved challenge is projected into
//! the host state (clearance cookie and user-agent) so later plain fetches to the
//! same host pass without solving again.

use std::collections::BTreeMap;
use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::challenges::core::{
    HttpTransport, RequestProfile, ResponseView, host_key, until_cancelled,
};
use crate::challenges::detectors::{ChallengeDetection, ChallengeDetector, Verdict};
use crate::challenges::solvers::{ChallengeSolution, ChallengeSolver, SolverError};
use crate::modules::events::{ChallengeEvent, EventDispatcher, FetchEvent, MitigationStage};
use crate::modules::proxy::{ProxiedResponse, ProxyError, ProxyPool};
use crate::modules::state::HostStateStore;

/// Successful mitigation.
#[derive(Debug, Clone)]
pub enum MitigationOutcome {
    /// The solver passed the challenge; the body may be cached.
    Solved(ChallengeSolution),
    /// A proxy served an acceptable page; never cached.
    Proxied(ProxiedResponse),
}

impl MitigationOutcome {
    pub fn body(&self) -> &str {
        match self {
            MitigationOutcome::Solved(solution) => &solution.body,
            MitigationOutcome::Proxied(proxied) => &proxied.response.body,
        }
    }

    pub fn into_body(self) -> String {
        match self {
            MitigationOutcome::Solved(solution) => solution.body,
            MitigationOutcome::Proxied(proxied) => proxied.response.body,
        }
    }
}

#[derive(Debug, Error)]
pub enum MitigationError {
    /// Mitigation was forced by a 403 and nothing got through.
    #[error("{host} keeps blocking requests")]
    Blocked { host: String },
    #[error("challenge on {host} could not be bypassed (signal {signal})")]
    Unbypassed { host: String, signal: &'static str },
    #[error("mitigation cancelled")]
    Cancelled,
}

/// Solver-then-proxy mitigation shared by every fetch.
pub struct ChallengePipeline {
    solver: Option<Arc<dyn ChallengeSolver>>,
    proxies: Arc<ProxyPool>,
    transport: Arc<dyn HttpTransport>,
    detector: Arc<ChallengeDetector>,
    state: Arc<dyn HostStateStore>,
    profile: RequestProfile,
    events: Arc<EventDispatcher>,
}

impl ChallengePipeline {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        detector: Arc<ChallengeDetector>,
        state: Arc<dyn HostStateStore>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            solver: None,
            proxies: Arc::new(ProxyPool::default()),
            transport,
            detector,
            state,
            profile: RequestProfile::default(),
            events,
        }
    }

    pub fn with_solver(mut self, solver: Option<Arc<dyn ChallengeSolver>>) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_proxies(mut self, proxies: Arc<ProxyPool>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_profile(mut self, profile: RequestProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn has_solver(&self) -> bool {
        self.solver.is_some()
    }

    pub fn proxies(&self) -> &ProxyPool {
        &self.proxies
    }

    /// Run the mitigation sequence for `url` after `detection` flagged it.
    pub async fn mitigate(
        &self,
        url: &Url,
        detection: &ChallengeDetection,
        cancel: &CancellationToken,
    ) -> Result<MitigationOutcome, MitigationError> {
        let host = host_key(url);
        log::info!(
            "mitigating {} on {url} (status {}, forced={})",
            detection.signal,
            detection.status,
            detection.forced
        );

        if let Some(solver) = &self.solver
            && let Some(solution) =
                self.solve(solver.as_ref(), url, &host, detection, cancel).await?
        {
            return Ok(MitigationOutcome::Solved(solution));
        }

        match self.fetch_via_proxies(url, cancel).await {
            Ok(proxied) => {
                self.notify(&host, detection.signal, MitigationStage::Proxy, true, vec![
                    ("proxy".into(), proxied.proxy.clone()),
                ]);
                return Ok(MitigationOutcome::Proxied(proxied));
            }
            Err(ProxyError::Cancelled) => return Err(MitigationError::Cancelled),
            Err(ProxyError::NoProxies) => {}
            Err(err) => {
                self.notify(&host, detection.signal, MitigationStage::Proxy, false, vec![
                    ("error".into(), err.to_string()),
                ]);
            }
        }

        if detection.forced {
            Err(MitigationError::Blocked { host })
        } else {
            Err(MitigationError::Unbypassed {
                host,
                signal: detection.signal,
            })
        }
    }

    /// Proxy-only attempt: no cache, no solver, no host timeout bookkeeping.
    pub async fn fetch_via_proxies(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<ProxiedResponse, ProxyError> {
        let headers = self
            .profile
            .headers_for(self.state.as_ref(), &host_key(url), false);
        self.proxies
            .attempt(
                self.transport.as_ref(),
                &self.detector,
                url,
                &headers,
                &self.events,
                cancel,
            )
            .await
    }

    /// `Ok(None)` when the solver could not produce a usable page.
    async fn solve(
        &self,
        solver: &dyn ChallengeSolver,
        url: &Url,
        host: &str,
        detection: &ChallengeDetection,
        cancel: &CancellationToken,
    ) -> Result<Option<ChallengeSolution>, MitigationError> {
        let outcome = until_cancelled(cancel, solver.solve(url))
            .await
            .map_err(|_| MitigationError::Cancelled)?
            .and_then(|solution| self.verify(solution));

        match outcome {
            Ok(solution) => {
                self.state
                    .merge_solved_state(host, &solution.cookies, solution.user_agent.as_deref());
                self.notify(host, detection.signal, MitigationStage::Solver, true, vec![
                    ("solver".into(), solver.name().to_string()),
                    ("cookies".into(), solution.cookies.len().to_string()),
                ]);
                Ok(Some(solution))
            }
            Err(err) => {
                log::warn!("{} could not solve {url}: {err}", solver.name());
                self.notify(host, detection.signal, MitigationStage::Solver, false, vec![
                    ("solver".into(), solver.name().to_string()),
                    ("error".into(), err.to_string()),
                ]);
                Ok(None)
            }
        }
    }

    /// Reject solver output that still looks like a challenge page.
    fn verify(&self, solution: ChallengeSolution) -> Result<ChallengeSolution, SolverError> {
        let headers = header_map(&solution.headers);
        let view = ResponseView {
            url: &solution.url,
            status: solution.status,
            headers: &headers,
            body: &solution.body,
        };
        match self.detector.classify(&view) {
            Verdict::Challenge(detection) => Err(SolverError::Malformed(format!(
                "solution still carries challenge signal {}",
                detection.signal
            ))),
            _ => Ok(solution),
        }
    }

    fn notify(
        &self,
        host: &str,
        signal: &str,
        stage: MitigationStage,
        success: bool,
        metadata: Vec<(String, String)>,
    ) {
        self.events.dispatch(FetchEvent::Challenge(ChallengeEvent {
            host: host.to_string(),
            signal: signal.to_string(),
            stage,
            success,
            metadata,
            timestamp: chrono::Utc::now(),
        }));
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    headers
        .iter()
        .filter_map(|(name, value)| {
            Some((
                HeaderName::from_bytes(name.as_bytes()).ok()?,
                HeaderValue::from_str(value).ok()?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::core::testing::{ScriptedTransport, Step, StubSolver};
    use crate::modules::state::StateManager;

    fn detection(forced: bool) -> ChallengeDetection {
        ChallengeDetection {
            signal: if forced { "forbidden_status" } else { "interstitial_splash" },
            forced,
            status: if forced { 403 } else { 200 },
            url: target(),
        }
    }

    fn target() -> Url {
        Url::parse("https://example.com/film").unwrap()
    }

    fn pipeline(transport: Arc<ScriptedTransport>, state: Arc<StateManager>) -> ChallengePipeline {
        ChallengePipeline::new(
            transport,
            Arc::new(ChallengeDetector::default()),
            state,
            Arc::new(EventDispatcher::new()),
        )
    }

    #[tokio::test]
    async fn solver_success_persists_clearance() {
        let transport = Arc::new(ScriptedTransport::repeating(Step::status(200, "unused")));
        let state = Arc::new(StateManager::new());
        let solver = Arc::new(StubSolver::solving("<html>solved</html>"));
        let pipeline = pipeline(transport.clone(), state.clone()).with_solver(Some(solver.clone()));

        let outcome = pipeline
            .mitigate(&target(), &detection(true), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, MitigationOutcome::Solved(_)));
        assert_eq!(outcome.body(), "<html>solved</html>");
        assert_eq!(solver.calls(), 1);
        assert_eq!(transport.calls(), 0);
        assert_eq!(state.cookie_header("example.com").as_deref(), Some("cf_clearance=cleared"));
        assert_eq!(state.user_agent("example.com").as_deref(), Some("SolverAgent/2.0"));
    }

    #[tokio::test]
    async fn solver_failure_falls_back_to_proxy() {
        let transport = Arc::new(ScriptedTransport::repeating(Step::status(200, "<html>via proxy</html>")));
        let state = Arc::new(StateManager::new());
        let pipeline = pipeline(transport.clone(), state.clone())
            .with_solver(Some(Arc::new(StubSolver::failing())))
            .with_proxies(Arc::new(ProxyPool::new(["http://p1:8080"])));

        let outcome = pipeline
            .mitigate(&target(), &detection(false), &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            MitigationOutcome::Proxied(proxied) => assert_eq!(proxied.proxy, "http://p1:8080"),
            other => panic!("expected proxy outcome, got {other:?}"),
        }
        let request = transport.last_request().unwrap();
        assert!(!request.headers.contains_key(http::header::COOKIE));
        assert!(state.cookie_header("example.com").is_none());
    }

    #[tokio::test]
    async fn challenged_solution_is_not_trusted() {
        let transport = Arc::new(ScriptedTransport::repeating(Step::status(200, "unused")));
        let state = Arc::new(StateManager::new());
        let pipeline = pipeline(transport, state.clone())
            .with_solver(Some(Arc::new(StubSolver::solving(r#"<div class="cf-turnstile"></div>"#))));

        let err = pipeline
            .mitigate(&target(), &detection(false), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MitigationError::Unbypassed { signal: "interstitial_splash", .. }));
        assert!(state.cookie_header("example.com").is_none());
    }

    #[tokio::test]
    async fn exhausted_mitigation_distinguishes_forced_blocks() {
        let transport = Arc::new(ScriptedTransport::repeating(Step::status(403, "denied")));
        let pipeline = pipeline(transport, Arc::new(StateManager::new()))
            .with_proxies(Arc::new(ProxyPool::new(["http://p1:1", "http://p2:2"])));

        let forced = pipeline
            .mitigate(&target(), &detection(true), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(forced, MitigationError::Blocked { .. }));

        let detected = pipeline
            .mitigate(&target(), &detection(false), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(detected, MitigationError::Unbypassed { .. }));
    }
}
