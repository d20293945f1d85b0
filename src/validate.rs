//! Redirect-chain validation for origin URLs.
//!
//! Before any bytes are copied the origin URL is vetted by walking its
//! redirect chain with HEAD requests, one hop at a time, with automatic
//! redirect following disabled.  Every hop must satisfy the TLS policy and
//! match the configured allowlist, establishing an HTTPS chain of custody
//! from the requested URL to the final artifact.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, LOCATION};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("insecure URL, https is required: {0}")]
    InsecureUrl(String),
    #[error("URL does not match any allowed pattern: {0}")]
    DisallowedUrl(String),
    #[error("unexpected status {status} from {url}")]
    BadHttpStatus { status: u16, url: String },
    #[error("redirect chain exceeded {0} hops")]
    TooManyRedirects(u32),
    #[error("redirect from {0} carried no Location header")]
    RedirectMissingLocation(String),
    #[error("malformed URL {url}: {reason}")]
    MalformedUrl { url: String, reason: String },
    #[error("HEAD request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ValidationError {
    /// `true` for the policy rejections that map to HTTP 403 at the redirect
    /// surface; everything else surfaces as 400.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            ValidationError::InsecureUrl(_) | ValidationError::DisallowedUrl(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One hop of the redirect chain, recorded for blob metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Hop {
    pub code: u16,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a successful chain walk.
#[derive(Debug)]
pub struct ValidatedUrl {
    /// The URL that terminated the chain with 2xx/304.
    pub final_url: String,
    /// Response headers of the terminating HEAD.
    pub headers: HeaderMap,
    pub status: u16,
    /// Every hop traversed, the terminating one included.
    pub hops: Vec<Hop>,
}

// ---------------------------------------------------------------------------
// Client & allowlist construction
// ---------------------------------------------------------------------------

/// Build the dedicated HEAD client: no automatic redirect following (each
/// hop must pass policy checks before we move on) and a short per-request
/// timeout.
pub fn build_validator_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("cloudmirror/0.1")
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("failed to build validator HTTP client")
}

/// Compile the configured allowlist patterns once at startup.
pub fn compile_allowlist(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("invalid allowlist pattern: {p:?}")))
        .collect()
}

// ---------------------------------------------------------------------------
// Per-hop policy checks
// ---------------------------------------------------------------------------

fn check_scheme(url: &str, ensure_tls: bool) -> Result<(), ValidationError> {
    if ensure_tls && !url.starts_with("https://") {
        return Err(ValidationError::InsecureUrl(url.to_string()));
    }
    Ok(())
}

fn check_allowlist(url: &str, allowlist: &[Regex]) -> Result<(), ValidationError> {
    if allowlist.iter().any(|re| re.is_match(url)) {
        Ok(())
    } else {
        Err(ValidationError::DisallowedUrl(url.to_string()))
    }
}

/// Policy-only gate for the request path: enforce TLS and the allowlist on
/// the requested URL without touching the network.  The full chain walk
/// re-applies both checks at every hop.
pub fn precheck_url(
    url: &str,
    allowlist: &[Regex],
    ensure_tls: bool,
) -> Result<(), ValidationError> {
    check_scheme(url, ensure_tls)?;
    check_allowlist(url, allowlist)
}

/// Resolve a `Location` header value against the URL it was served from.
/// Relative redirects are allowed.
fn resolve_location(current: &str, location: &str) -> Result<String, ValidationError> {
    let base = Url::parse(current).map_err(|e| ValidationError::MalformedUrl {
        url: current.to_string(),
        reason: e.to_string(),
    })?;
    let next = base
        .join(location)
        .map_err(|e| ValidationError::MalformedUrl {
            url: location.to_string(),
            reason: e.to_string(),
        })?;
    Ok(next.to_string())
}

// ---------------------------------------------------------------------------
// Chain walk
// ---------------------------------------------------------------------------

/// Walk the redirect chain starting at `url` for up to `max_redirects` hops.
///
/// Each hop: enforce the TLS policy, require an allowlist match, issue a
/// HEAD without following redirects, and record `{code, url, timestamp}`.
/// A 2xx or 304 terminates the walk successfully; a 3xx (except 304/305)
/// continues at the resolved `Location`; anything else fails.
pub async fn validate_url(
    client: &reqwest::Client,
    url: &str,
    allowlist: &[Regex],
    max_redirects: u32,
    ensure_tls: bool,
) -> Result<ValidatedUrl, ValidationError> {
    let mut current = url.to_string();
    let mut hops: Vec<Hop> = Vec::new();

    for _ in 0..max_redirects {
        check_scheme(&current, ensure_tls)?;
        check_allowlist(&current, allowlist)?;

        let resp = client
            .head(&current)
            .send()
            .await
            .map_err(|e| ValidationError::Transport {
                url: current.clone(),
                source: e,
            })?;

        let status = resp.status().as_u16();
        hops.push(Hop {
            code: status,
            url: current.clone(),
            timestamp: Utc::now(),
        });
        debug!(%current, status, hop = hops.len(), "validation hop");

        if (200..300).contains(&status) || status == 304 {
            return Ok(ValidatedUrl {
                final_url: current,
                headers: resp.headers().clone(),
                status,
                hops,
            });
        }

        if (300..400).contains(&status) && status != 304 && status != 305 {
            let location = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ValidationError::RedirectMissingLocation(current.clone()))?;
            current = resolve_location(&current, location)?;
            continue;
        }

        return Err(ValidationError::BadHttpStatus {
            status,
            url: current,
        });
    }

    Err(ValidationError::TooManyRedirects(max_redirects))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist(patterns: &[&str]) -> Vec<Regex> {
        compile_allowlist(&patterns.iter().map(|p| p.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn scheme_check_rejects_plain_http_when_tls_required() {
        assert!(matches!(
            check_scheme("http://example.com/a", true),
            Err(ValidationError::InsecureUrl(_))
        ));
        check_scheme("http://example.com/a", false).unwrap();
        check_scheme("https://example.com/a", true).unwrap();
    }

    #[test]
    fn allowlist_is_anchored() {
        let list = allowlist(&["^https://queue\\.example\\.net/"]);
        check_allowlist("https://queue.example.net/v1/artifact", &list).unwrap();
        // A prefix elsewhere in the URL must not satisfy the anchor.
        assert!(matches!(
            check_allowlist("https://evil.test/https://queue.example.net/", &list),
            Err(ValidationError::DisallowedUrl(_))
        ));
    }

    #[test]
    fn match_all_pattern_admits_everything() {
        let list = allowlist(&["^.*/"]);
        check_allowlist("https://anything.example/at/all", &list).unwrap();
    }

    #[test]
    fn resolves_relative_and_absolute_locations() {
        assert_eq!(
            resolve_location("https://a.example/x/y", "/z").unwrap(),
            "https://a.example/z"
        );
        assert_eq!(
            resolve_location("https://a.example/x/y", "w").unwrap(),
            "https://a.example/x/w"
        );
        assert_eq!(
            resolve_location("https://a.example/x", "https://b.example/q").unwrap(),
            "https://b.example/q"
        );
    }

    #[tokio::test]
    async fn zero_redirect_limit_fails_before_any_request() {
        let client = build_validator_client(1).unwrap();
        let list = allowlist(&["^.*/"]);
        let err = validate_url(&client, "https://unreachable.invalid/", &list, 0, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::TooManyRedirects(0)));
    }

    #[tokio::test]
    async fn policy_checks_precede_network_io() {
        // Both URLs are unreachable; the errors prove no HEAD was attempted.
        let client = build_validator_client(1).unwrap();
        let list = allowlist(&["^https://allowed\\.invalid/"]);
        let err = validate_url(&client, "http://allowed.invalid/a", &list, 5, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::InsecureUrl(_)));

        let err = validate_url(&client, "https://other.invalid/a", &list, 5, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::DisallowedUrl(_)));
    }

    #[test]
    fn policy_rejection_classification() {
        assert!(ValidationError::InsecureUrl("u".into()).is_policy_rejection());
        assert!(ValidationError::DisallowedUrl("u".into()).is_policy_rejection());
        assert!(!ValidationError::TooManyRedirects(3).is_policy_rejection());
        assert!(!ValidationError::BadHttpStatus {
            status: 500,
            url: "u".into()
        }
        .is_policy_rejection());
    }
}
