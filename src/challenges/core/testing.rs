//! Scripted transport and solver stubs used by unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use super::executor::{HttpTransport, TransportError};
use super::types::{TransportRequest, TransportResponse};
use crate::challenges::solvers::{ChallengeSolution, ChallengeSolver, SolvedCookie, SolverError};

#[derive(Debug, Clone)]
pub enum Step {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: String,
    },
    Timeout,
    Connect,
}

impl Step {
    pub fn status(status: u16, body: &str) -> Self {
        Step::Respond {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Step::Respond { ref mut headers, .. } = self {
            headers.push((name, value.to_string()));
        }
        self
    }

    fn resolve(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        match self {
            Step::Respond { status, headers, body } => {
                let mut map = HeaderMap::new();
                for (name, value) in headers {
                    map.append(
                        HeaderName::from_static(name),
                        HeaderValue::from_str(value).expect("test header value"),
                    );
                }
                Ok(TransportResponse {
                    status: *status,
                    headers: map,
                    body: body.clone(),
                    url: request.url.clone(),
                })
            }
            Step::Timeout => Err(TransportError::Timeout(request.timeout)),
            Step::Connect => Err(TransportError::Connect("connection refused".into())),
        }
    }
}

/// Transport that replays queued steps, repeating the last one once the queue drains.
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    fallback: Mutex<Option<Step>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<TransportRequest>>,
    latency: Duration,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: Mutex::new(None),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    pub fn repeating(step: Step) -> Self {
        Self::new(vec![step])
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<TransportRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let step = {
            let mut steps = self.steps.lock().unwrap();
            let mut fallback = self.fallback.lock().unwrap();
            match steps.pop_front() {
                Some(step) => {
                    *fallback = Some(step.clone());
                    step
                }
                None => fallback.clone().expect("scripted transport has no steps"),
            }
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        step.resolve(&request)
    }
}

/// Solver stub returning a fixed page with a clearance cookie, or failing.
pub struct StubSolver {
    calls: AtomicUsize,
    body: Option<String>,
}

impl StubSolver {
    pub fn solving(body: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            body: Some(body.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            body: None,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChallengeSolver for StubSolver {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn solve(&self, url: &Url) -> Result<ChallengeSolution, SolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = self.body.clone().ok_or_else(|| SolverError::Rejected {
            status: "error".into(),
            message: "Timeout".into(),
        })?;
        Ok(ChallengeSolution {
            url: url.clone(),
            status: 200,
            body,
            user_agent: Some("SolverAgent/2.0".into()),
            headers: BTreeMap::new(),
            cookies: vec![
                SolvedCookie {
                    name: "cf_clearance".into(),
                    value: "cleared".into(),
                    domain: ".example.com".into(),
                    expires: 0.0,
                },
                SolvedCookie {
                    name: "__cf_bm".into(),
                    value: "noise".into(),
                    domain: ".example.com".into(),
                    expires: 0.0,
                },
            ],
        })
    }
}
