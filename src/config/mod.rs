//! Environment configuration.
//!
//! Reads the process-level settings once at start-up:
//!
//! | Variable               | Meaning                                                    |
//! |------------------------|------------------------------------------------------------|
//! | `SOLVER_URL`           | FlareSolverr-compatible endpoint (`http://host:8191/v1`)   |
//! | `FETCH_PROXIES`        | proxy URIs, JSON array or comma/newline separated          |
//! | `FETCH_PROXY_FILE`     | file holding more proxy URIs in the same formats           |
//! | `FETCH_TIMEOUT_MS`     | per-attempt request timeout                                |
//! | `FETCH_CONTENT_MARKER` | content marker regex; empty disables the override          |
//! | `FETCH_CACHE_FILE`     | persistent cache (`.redb` for redb, anything else is JSON) |

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::challenges::core::mask_proxy;

pub const SOLVER_URL_VAR: &str = "SOLVER_URL";
pub const PROXIES_VAR: &str = "FETCH_PROXIES";
pub const PROXY_FILE_VAR: &str = "FETCH_PROXY_FILE";
pub const TIMEOUT_VAR: &str = "FETCH_TIMEOUT_MS";
pub const CONTENT_MARKER_VAR: &str = "FETCH_CONTENT_MARKER";
pub const CACHE_FILE_VAR: &str = "FETCH_CACHE_FILE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid URL: {reason}")]
    InvalidUrl { var: &'static str, reason: String },
    #[error("invalid proxy entry '{0}'")]
    InvalidProxy(String),
    #[error("{var} must be a positive integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Settings gathered from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub solver_url: Option<Url>,
    pub proxies: Vec<String>,
    pub request_timeout: Option<Duration>,
    /// `Some("")` disables the content marker override.
    pub content_marker: Option<String>,
    pub cache_file: Option<PathBuf>,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let solver_url = var(SOLVER_URL_VAR)
            .map(|raw| {
                Url::parse(&raw).map_err(|err| ConfigError::InvalidUrl {
                    var: SOLVER_URL_VAR,
                    reason: err.to_string(),
                })
            })
            .transpose()?;

        let mut proxies = match var(PROXIES_VAR) {
            Some(raw) => parse_proxy_list(&raw)?,
            None => Vec::new(),
        };
        if let Some(path) = var(PROXY_FILE_VAR) {
            for proxy in load_proxy_file(&path)? {
                if !proxies.contains(&proxy) {
                    proxies.push(proxy);
                }
            }
        }

        let request_timeout = var(TIMEOUT_VAR)
            .map(|raw| match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
                _ => Err(ConfigError::InvalidNumber {
                    var: TIMEOUT_VAR,
                    value: raw,
                }),
            })
            .transpose()?;

        let content_marker = lookup(CONTENT_MARKER_VAR).map(|value| value.trim().to_string());
        let cache_file = var(CACHE_FILE_VAR).map(PathBuf::from);

        if !proxies.is_empty() {
            log::debug!(
                "configured {} proxies: {}",
                proxies.len(),
                proxies.iter().map(|p| mask_proxy(p)).collect::<Vec<_>>().join(", ")
            );
        }

        Ok(Self {
            solver_url,
            proxies,
            request_timeout,
            content_marker,
            cache_file,
        })
    }
}

/// Parse a proxy list given as a JSON array of strings or as comma/newline
/// separated text. Lines starting with `#` are ignored.
pub fn parse_proxy_list(raw: &str) -> Result<Vec<String>, ConfigError> {
    let trimmed = raw.trim();
    let entries: Vec<String> = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<String>>(trimmed)
            .map_err(|err| ConfigError::InvalidProxy(err.to_string()))?
    } else {
        trimmed
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#'))
            .flat_map(|line| line.split(','))
            .map(|entry| entry.trim().to_string())
            .collect()
    };

    entries
        .into_iter()
        .filter(|entry| !entry.is_empty())
        .map(|entry| match Url::parse(&entry) {
            Ok(url) if url.host_str().is_some() => Ok(entry),
            _ => Err(ConfigError::InvalidProxy(mask_proxy(&entry))),
        })
        .collect()
}

pub fn load_proxy_file(path: impl AsRef<Path>) -> Result<Vec<String>, ConfigError> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_proxy_list(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn parses_json_and_plain_lists() {
        let json = r#"["http://u:p@proxy-a:80/", "http://proxy-b:3128"]"#;
        assert_eq!(parse_proxy_list(json).unwrap().len(), 2);

        let plain = "http://proxy-a:80/, http://proxy-b:3128\n# disabled\n\nsocks5://proxy-c:1080";
        assert_eq!(
            parse_proxy_list(plain).unwrap(),
            vec!["http://proxy-a:80/", "http://proxy-b:3128", "socks5://proxy-c:1080"]
        );
    }

    #[test]
    fn invalid_proxy_is_masked_in_error() {
        let err = parse_proxy_list("not a proxy:secret@").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProxy(ref entry) if !entry.contains("secret")));
    }

    #[test]
    fn reads_every_variable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("proxies.txt");
        fs::write(&file, "http://proxy-b:3128\nhttp://proxy-c:3128\n").unwrap();

        let config = EnvConfig::from_lookup(lookup(&[
            (SOLVER_URL_VAR, "http://localhost:8191/v1"),
            (PROXIES_VAR, "http://proxy-a:80,http://proxy-b:3128"),
            (PROXY_FILE_VAR, file.to_str().unwrap()),
            (TIMEOUT_VAR, "7000"),
            (CONTENT_MARKER_VAR, ""),
            (CACHE_FILE_VAR, "/tmp/fetch-cache.json"),
        ]))
        .unwrap();

        assert_eq!(config.solver_url.unwrap().as_str(), "http://localhost:8191/v1");
        assert_eq!(
            config.proxies,
            vec!["http://proxy-a:80", "http://proxy-b:3128", "http://proxy-c:3128"]
        );
        assert_eq!(config.request_timeout, Some(Duration::from_secs(7)));
        assert_eq!(config.content_marker.as_deref(), Some(""));
        assert_eq!(config.cache_file, Some(PathBuf::from("/tmp/fetch-cache.json")));
    }

    #[test]
    fn empty_environment_is_default() {
        assert_eq!(EnvConfig::from_lookup(|_| None).unwrap(), EnvConfig::default());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            EnvConfig::from_lookup(lookup(&[(TIMEOUT_VAR, "soon")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            EnvConfig::from_lookup(lookup(&[(SOLVER_URL_VAR, "localhost")])),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }
}
