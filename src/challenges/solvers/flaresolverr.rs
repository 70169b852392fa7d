//! Adapter for FlareSolverr-compatible solving services.
//!
//! Protocol: a single `POST` with `{"cmd": "request.get", "url", "session", "maxTimeout"}`;
//! the service answers `{"status": "ok", "solution": {...}}` on success.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{ChallengeSolution, ChallengeSolver, SolvedCookie, SolverError};
use crate::challenges::core::is_success_status;

const DEFAULT_SESSION: &str = "default";
const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(60);
/// Slack added on top of the solver's own budget before the HTTP call gives up.
const REQUEST_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct SolverRequest<'a> {
    cmd: &'static str,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
    #[serde(rename = "maxTimeout")]
    max_timeout: u64,
}

#[derive(Debug, Deserialize)]
struct SolverReply {
    status: String,
    #[serde(default)]
    message: String,
    solution: Option<SolverSolution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolverSolution {
    url: String,
    status: u16,
    #[serde(default)]
    response: String,
    #[serde(default)]
    user_agent: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, Value>,
    #[serde(default)]
    cookies: Vec<SolvedCookie>,
}

/// HTTP client for a FlareSolverr endpoint.
#[derive(Debug, Clone)]
pub struct FlareSolverrClient {
    client: reqwest::Client,
    endpoint: Url,
    session: Option<String>,
    max_timeout: Duration,
}

impl FlareSolverrClient {
    pub fn new(endpoint: Url) -> Result<Self, SolverError> {
        Self::with_max_timeout(endpoint, DEFAULT_MAX_TIMEOUT)
    }

    pub fn with_max_timeout(endpoint: Url, max_timeout: Duration) -> Result<Self, SolverError> {
        let client = reqwest::Client::builder()
            .timeout(max_timeout + REQUEST_GRACE)
            .build()
            .map_err(|err| SolverError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            session: Some(DEFAULT_SESSION.to_string()),
            max_timeout,
        })
    }

    /// Override the browser session name; `None` lets the service use a throwaway session.
    pub fn with_session(mut self, session: Option<String>) -> Self {
        self.session = session;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl ChallengeSolver for FlareSolverrClient {
    fn name(&self) -> &'static str {
        "flaresolverr"
    }

    async fn solve(&self, url: &Url) -> Result<ChallengeSolution, SolverError> {
        let payload = SolverRequest {
            cmd: "request.get",
            url: url.as_str(),
            session: self.session.as_deref(),
            max_timeout: self.max_timeout.as_millis() as u64,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|err| SolverError::Transport(err.to_string()))?;

        let raw = response
            .text()
            .await
            .map_err(|err| SolverError::Transport(err.to_string()))?;
        let reply: SolverReply =
            serde_json::from_str(&raw).map_err(|err| SolverError::Malformed(err.to_string()))?;

        into_solution(reply)
    }
}

fn into_solution(reply: SolverReply) -> Result<ChallengeSolution, SolverError> {
    if reply.status != "ok" {
        return Err(SolverError::Rejected {
            status: reply.status,
            message: reply.message,
        });
    }

    let solution = reply
        .solution
        .ok_or_else(|| SolverError::Malformed("missing solution".into()))?;

    if !is_success_status(solution.status) {
        return Err(SolverError::Unresolved(solution.status));
    }
    if solution.response.is_empty() {
        return Err(SolverError::Malformed("empty response body".into()));
    }

    let url = Url::parse(&solution.url).map_err(|err| SolverError::Malformed(err.to_string()))?;
    let headers = solution
        .headers
        .into_iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            (name.to_ascii_lowercase(), value)
        })
        .collect();

    Ok(ChallengeSolution {
        url,
        status: solution.status,
        body: solution.response,
        user_agent: solution.user_agent.filter(|agent| !agent.is_empty()),
        headers,
        cookies: solution.cookies,
    })
}
