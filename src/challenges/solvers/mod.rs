//! External challenge solver integrations.
//!
//! A solver drives a real browser session elsewhere and hands back the final
//! page together with the cookies and user-agent that passed the challenge.

pub mod flaresolverr;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub use flaresolverr::FlareSolverrClient;

/// Cookie returned by the solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolvedCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    /// Unix timestamp in seconds; session cookies report `-1` or `0`.
    #[serde(default)]
    pub expires: f64,
}

/// Successful solver outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeSolution {
    pub url: Url,
    pub status: u16,
    pub body: String,
    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub cookies: Vec<SolvedCookie>,
}

/// Shared interface implemented by challenge solving services.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    fn name(&self) -> &'static str;
    async fn solve(&self, url: &Url) -> Result<ChallengeSolution, SolverError>;
}

/// Errors surfaced by solver integrations.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("solver request failed: {0}")]
    Transport(String),
    #[error("solver returned status '{status}': {message}")]
    Rejected { status: String, message: String },
    #[error("solver response is malformed: {0}")]
    Malformed(String),
    #[error("solver reached the page but it answered with status {0}")]
    Unresolved(u16),
}
