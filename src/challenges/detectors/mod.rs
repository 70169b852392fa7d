//! Challenge detection module.
//!
//! Classifies responses using an ordered list of signal predicates over
//! `(status, headers, body)`. Signals are either strict (the response is a
//! challenge no matter what else it contains) or broad heuristics that are known
//! to fire on pages embedding challenge scripts without gating content. A
//! configurable content marker overrides broad signals on successful pages.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::challenges::core::ResponseView;

/// Default marker for pages that carry usable content even when they embed
/// challenge assets.
pub const DEFAULT_CONTENT_MARKER: &str = r#"data-link\s*=\s*"[^"]+""#;

/// Signal id reported when a 403 forces mitigation.
pub const FORBIDDEN_SIGNAL: &str = "forbidden_status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalStrength {
    /// Never overridden by the content marker.
    Strict,
    /// Heuristic; a successful page with the content marker is accepted anyway.
    Broad,
}

/// Named predicate flagging a challenge response.
#[derive(Clone, Copy)]
pub struct ChallengeSignal {
    pub id: &'static str,
    pub strength: SignalStrength,
    pub predicate: fn(&ResponseView<'_>) -> bool,
}

impl ChallengeSignal {
    pub const fn new(
        id: &'static str,
        strength: SignalStrength,
        predicate: fn(&ResponseView<'_>) -> bool,
    ) -> Self {
        Self {
            id,
            strength,
            predicate,
        }
    }

    pub fn matches(&self, response: &ResponseView<'_>) -> bool {
        (self.predicate)(response)
    }
}

impl std::fmt::Debug for ChallengeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeSignal")
            .field("id", &self.id)
            .field("strength", &self.strength)
            .finish()
    }
}

static TURNSTILE_RE: Lazy<Regex> = Lazy::new(|| build_regex(r"cf-turnstile"));
static INLINE_CHALLENGE_RE: Lazy<Regex> = Lazy::new(|| build_regex(r"__cf_chl_"));
static SPLASH_RE: Lazy<Regex> = Lazy::new(|| {
    build_regex(r"Just a moment|enable javascript and cookies to continue")
});
static PLATFORM_ASSET_RE: Lazy<Regex> = Lazy::new(|| build_regex(r"challenge-platform/"));

pub fn cf_mitigated_header(response: &ResponseView<'_>) -> bool {
    response
        .header("cf-mitigated")
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("challenge"))
}

pub fn captcha_marker(response: &ResponseView<'_>) -> bool {
    TURNSTILE_RE.is_match(response.body)
}

pub fn inline_challenge_script(response: &ResponseView<'_>) -> bool {
    INLINE_CHALLENGE_RE.is_match(response.body)
}

pub fn interstitial_splash(response: &ResponseView<'_>) -> bool {
    SPLASH_RE.is_match(response.body)
}

pub fn challenge_platform_asset(response: &ResponseView<'_>) -> bool {
    PLATFORM_ASSET_RE.is_match(response.body)
}

/// Built-in signals in evaluation order.
pub fn default_signals() -> Vec<ChallengeSignal> {
    vec![
        ChallengeSignal::new("cf_mitigated_header", SignalStrength::Strict, cf_mitigated_header),
        ChallengeSignal::new("captcha_marker", SignalStrength::Strict, captcha_marker),
        ChallengeSignal::new(
            "inline_challenge_script",
            SignalStrength::Broad,
            inline_challenge_script,
        ),
        ChallengeSignal::new("interstitial_splash", SignalStrength::Broad, interstitial_splash),
        ChallengeSignal::new(
            "challenge_platform_asset",
            SignalStrength::Broad,
            challenge_platform_asset,
        ),
    ]
}

/// Details of a response that needs mitigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeDetection {
    pub signal: &'static str,
    /// Set when mitigation was forced by a 403 rather than a matched signal.
    pub forced: bool,
    pub status: u16,
    pub url: Url,
}

/// Outcome of classifying one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    NotFound,
    Challenge(ChallengeDetection),
    Censored,
    RateLimited,
    HttpFailure(u16),
}

/// Ordered signal list plus the optional content marker.
#[derive(Debug, Clone)]
pub struct ChallengeDetector {
    signals: Vec<ChallengeSignal>,
    content_marker: Option<Regex>,
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self {
            signals: default_signals(),
            content_marker: Some(build_regex(DEFAULT_CONTENT_MARKER)),
        }
    }
}

impl ChallengeDetector {
    pub fn new(signals: Vec<ChallengeSignal>, content_marker: Option<Regex>) -> Self {
        Self {
            signals,
            content_marker,
        }
    }

    /// Compile `pattern` case-insensitively as the content marker.
    pub fn with_content_marker(mut self, pattern: Option<&str>) -> Result<Self, regex::Error> {
        self.content_marker = pattern
            .map(|pattern| regex::RegexBuilder::new(pattern).case_insensitive(true).build())
            .transpose()?;
        Ok(self)
    }

    pub fn with_signal(mut self, signal: ChallengeSignal) -> Self {
        self.signals.push(signal);
        self
    }

    pub fn signals(&self) -> &[ChallengeSignal] {
        &self.signals
    }

    pub fn has_content_marker(&self, response: &ResponseView<'_>) -> bool {
        response.is_success()
            && self
                .content_marker
                .as_ref()
                .is_some_and(|marker| marker.is_match(response.body))
    }

    /// First matching signal, in declaration order.
    pub fn first_signal(&self, response: &ResponseView<'_>) -> Option<&ChallengeSignal> {
        self.signals.iter().find(|signal| signal.matches(response))
    }

    fn strict_signal(&self, response: &ResponseView<'_>) -> Option<&ChallengeSignal> {
        self.signals
            .iter()
            .filter(|signal| signal.strength == SignalStrength::Strict)
            .find(|signal| signal.matches(response))
    }

    pub fn classify(&self, response: &ResponseView<'_>) -> Verdict {
        let detection = |signal: &'static str, forced: bool| {
            Verdict::Challenge(ChallengeDetection {
                signal,
                forced,
                status: response.status,
                url: response.url.clone(),
            })
        };

        match response.status {
            404 => return Verdict::NotFound,
            403 => {
                let signal = self
                    .first_signal(response)
                    .map_or(FORBIDDEN_SIGNAL, |signal| signal.id);
                return detection(signal, true);
            }
            _ => {}
        }

        if self.has_content_marker(response) {
            return match self.strict_signal(response) {
                Some(signal) => detection(signal.id, false),
                None => Verdict::Accept,
            };
        }

        if let Some(signal) = self.first_signal(response) {
            return detection(signal.id, false);
        }

        match response.status {
            451 => Verdict::Censored,
            429 => Verdict::RateLimited,
            200..=399 => Verdict::Accept,
            status => Verdict::HttpFailure(status),
        }
    }

    /// Whether a body fetched through a proxy is usable.
    pub fn accepts_proxy_response(&self, response: &ResponseView<'_>) -> bool {
        if !response.is_success() || response.body.trim().is_empty() {
            return false;
        }
        self.has_content_marker(response) || self.first_signal(response).is_none()
    }
}

fn build_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid challenge detection regex `{}`: {}", pattern, err))
}
