//! Cache-entry records in the status store.
//!
//! Every (pool, url) pair owns at most one flat hash in KeyDB describing the
//! relationship of the URL to its regional copy: `pending` while a copy
//! worker streams it, `present` once the blob is live, `error` with a
//! private stack text when a copy failed.  Records carry a TTL so the store
//! never outlives the blob it describes; a missing record is an expected
//! outcome (the store may be flushed at any time), never an error.

use std::collections::HashMap;

use anyhow::{Context, Result};
use fred::interfaces::{ClientLike, HashesInterface, LuaInterface};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tracing::{info, trace, warn};

use crate::config::StatusStoreConfig;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Entry model
// ---------------------------------------------------------------------------

/// Lifecycle state of a cache entry as stored.  `absent` is the read-side
/// outcome of a missing record and is never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Present,
    Pending,
    Error,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Present => "present",
            EntryStatus::Pending => "pending",
            EntryStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(EntryStatus::Present),
            "pending" => Some(EntryStatus::Pending),
            "error" => Some(EntryStatus::Error),
            _ => None,
        }
    }
}

/// One cache-entry record.  `url` holds the original request URL
/// byte-for-byte; encoding is applied only when forming the key.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub url: String,
    pub status: EntryStatus,
    /// Diagnostic text attached on the failure path.  Never exposed to
    /// clients.
    pub stack: Option<String>,
}

impl CacheEntry {
    pub fn pending(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: EntryStatus::Pending,
            stack: None,
        }
    }

    pub fn present(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: EntryStatus::Present,
            stack: None,
        }
    }

    pub fn error(url: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: EntryStatus::Error,
            stack: Some(stack.into()),
        }
    }

    fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("url".to_string(), self.url.clone()),
            ("status".to_string(), self.status.as_str().to_string()),
        ];
        if let Some(ref stack) = self.stack {
            pairs.push(("stack".to_string(), stack.clone()));
        }
        pairs
    }

    fn from_map(map: HashMap<String, String>) -> Option<Self> {
        let status = EntryStatus::parse(map.get("status")?)?;
        Some(Self {
            url: map.get("url").cloned().unwrap_or_default(),
            status,
            stack: map.get("stack").cloned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Key encoding
// ---------------------------------------------------------------------------

/// Build the status-store key for a (pool, url) pair.
///
/// Every non-alphanumeric byte of the URL is percent-encoded, which keeps
/// the mapping injective and the key free of the `_` separator.
pub fn encode_cache_key(pool_id: &str, url: &str) -> String {
    format!("{pool_id}_{}", utf8_percent_encode(url, NON_ALPHANUMERIC))
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Where the status store lives, resolved from the configured connection
/// string.
#[derive(Debug, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
    tls: bool,
}

/// Resolve a connection string.  Accepts `redis://host[:port][/db]`,
/// `rediss://...` (which forces TLS regardless of `tls_flag`), or a bare
/// `host[:port]`.  The database suffix is ignored; entries always live in
/// the default keyspace.
fn parse_endpoint(raw: &str, tls_flag: bool) -> Result<Endpoint> {
    let (scheme_tls, rest) = match raw.split_once("://") {
        Some(("rediss", rest)) => (true, rest),
        Some(("redis", rest)) => (false, rest),
        Some((scheme, _)) => anyhow::bail!("unsupported status store scheme: {scheme:?}"),
        None => (false, raw),
    };

    let authority = rest.split('/').next().unwrap_or(rest);
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>()
                .with_context(|| format!("invalid status store port: {port:?}"))?,
        ),
        None => (authority, 6379),
    };
    anyhow::ensure!(!host.is_empty(), "status store endpoint has no host: {raw:?}");

    Ok(Endpoint {
        host: host.to_string(),
        port,
        tls: scheme_tls || tls_flag,
    })
}

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

/// Narrow key/value facade over the external store.  This is the only code
/// that knows the wire format of a cache entry, and it owns its own
/// connection: callers get a verified handle or the process does not start.
#[derive(Clone)]
pub struct StatusStore {
    pool: fred::clients::Pool,
    metrics: MetricsRegistry,
}

// HSET of all fields and the EXPIRE must land together, and a rewrite must
// drop fields the new record does not carry (a stale `stack` surviving an
// error -> pending transition would be wrong).
const PUT_ENTRY_SCRIPT: &str = r#"
    redis.call('DEL', KEYS[1])
    for i = 1, #ARGV - 1, 2 do
        redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
    end
    redis.call('EXPIRE', KEYS[1], ARGV[#ARGV])
    return 1
"#;

impl StatusStore {
    pub fn new(pool: fred::clients::Pool, metrics: MetricsRegistry) -> Self {
        Self { pool, metrics }
    }

    /// Connect to the configured store and return a verified handle.
    ///
    /// The auth token is read from the environment variable named in the
    /// config so the secret never sits in the YAML file.  Redirect pollers
    /// and copy workers share the pool, which reconnects with exponential
    /// backoff; a PING runs up front so a bad endpoint or token fails the
    /// process at startup rather than on the first redirect.
    pub async fn connect(config: &StatusStoreConfig, metrics: MetricsRegistry) -> Result<Self> {
        let endpoint = parse_endpoint(&config.endpoint, config.tls)?;

        let mut store_config = fred::types::config::Config {
            server: ServerConfig::new_centralized(endpoint.host.as_str(), endpoint.port),
            password: std::env::var(&config.auth_token_env).ok(),
            ..fred::types::config::Config::default()
        };
        if endpoint.tls {
            store_config.tls = Some(TlsConnector::default_rustls()?.into());
        }

        let mut builder = Builder::from_config(store_config);
        builder.set_policy(ReconnectPolicy::new_exponential(0, 200, 20_000, 2));
        let pool = builder
            .build_pool(8)
            .context("failed to build status store pool")?;

        pool.init().await.with_context(|| {
            format!(
                "status store unreachable at {}:{}",
                endpoint.host, endpoint.port
            )
        })?;
        let _: String = pool
            .ping(None)
            .await
            .context("status store PING failed after connect")?;

        info!(
            host = %endpoint.host,
            port = endpoint.port,
            tls = endpoint.tls,
            "status store connected"
        );
        Ok(Self::new(pool, metrics))
    }

    pub fn pool(&self) -> &fred::clients::Pool {
        &self.pool
    }

    /// Read a cache entry.  `Ok(None)` is a miss: no record, an expired
    /// record, or a record this version cannot parse.
    pub async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let map: HashMap<String, String> = self
            .pool
            .hgetall(key)
            .await
            .map_err(|e| self.count_failure(e))
            .context("HGETALL cache entry")?;
        if map.is_empty() {
            trace!(%key, "cache entry miss");
            return Ok(None);
        }
        match CacheEntry::from_map(map) {
            Some(entry) => Ok(Some(entry)),
            None => {
                warn!(%key, "unparseable cache entry treated as miss");
                Ok(None)
            }
        }
    }

    /// Write a cache entry with its TTL in one atomic step.
    pub async fn put_entry(&self, key: &str, entry: &CacheEntry, ttl_secs: u64) -> Result<()> {
        let mut args: Vec<String> = Vec::new();
        for (field, value) in entry.to_pairs() {
            args.push(field);
            args.push(value);
        }
        args.push(ttl_secs.to_string());

        let _: i64 = self
            .pool
            .eval(PUT_ENTRY_SCRIPT, vec![key.to_string()], args)
            .await
            .map_err(|e| self.count_failure(e))
            .context("EVAL put cache entry")?;
        trace!(%key, status = entry.status.as_str(), ttl_secs, "cache entry written");
        Ok(())
    }

    /// Delete a cache entry.  Deleting a missing key is a no-op.
    pub async fn delete_entry(&self, key: &str) -> Result<()> {
        use fred::interfaces::KeysInterface;
        let _: i64 = self
            .pool
            .del(key)
            .await
            .map_err(|e| self.count_failure(e))
            .context("DEL cache entry")?;
        trace!(%key, "cache entry deleted");
        Ok(())
    }

    fn count_failure(&self, err: fred::error::Error) -> fred::error::Error {
        self.metrics.metrics.status_store_failures.inc();
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_encodes_every_non_alphanumeric_byte() {
        let key = encode_cache_key("s3_us-west-1", "https://origin.example/a b?x=1");
        assert_eq!(
            key,
            "s3_us-west-1_https%3A%2F%2Forigin%2Eexample%2Fa%20b%3Fx%3D1"
        );
    }

    #[test]
    fn cache_key_is_injective_for_separator_collisions() {
        // Underscores in the URL are encoded, so they cannot collide with
        // the pool-id separator.
        let a = encode_cache_key("s3_us-west-1", "https://h/a_b");
        let b = encode_cache_key("s3_us-west-1", "https://h/a%5Fb");
        assert_ne!(a, b);
    }

    #[test]
    fn entry_round_trips_through_pairs() {
        let entry = CacheEntry::error("https://h/x", "trace text");
        let map: HashMap<String, String> = entry.to_pairs().into_iter().collect();
        let parsed = CacheEntry::from_map(map).unwrap();
        assert_eq!(parsed.url, "https://h/x");
        assert_eq!(parsed.status, EntryStatus::Error);
        assert_eq!(parsed.stack.as_deref(), Some("trace text"));
    }

    #[test]
    fn pending_and_present_omit_stack() {
        let map: HashMap<String, String> =
            CacheEntry::present("https://h/x").to_pairs().into_iter().collect();
        assert!(!map.contains_key("stack"));
        let map: HashMap<String, String> =
            CacheEntry::pending("https://h/x").to_pairs().into_iter().collect();
        assert!(!map.contains_key("stack"));
    }

    #[test]
    fn unknown_status_is_a_miss() {
        let mut map = HashMap::new();
        map.insert("url".to_string(), "https://h/x".to_string());
        map.insert("status".to_string(), "uploading".to_string());
        assert!(CacheEntry::from_map(map).is_none());
    }

    #[test]
    fn endpoint_defaults_the_port() {
        let ep = parse_endpoint("keydb.local", false).unwrap();
        assert_eq!(ep.host, "keydb.local");
        assert_eq!(ep.port, 6379);
        assert!(!ep.tls);
    }

    #[test]
    fn endpoint_scheme_forces_tls() {
        let ep = parse_endpoint("rediss://keydb.local:6380", false).unwrap();
        assert_eq!(ep.port, 6380);
        assert!(ep.tls);
    }

    #[test]
    fn endpoint_honours_the_tls_flag_for_plain_schemes() {
        let ep = parse_endpoint("redis://keydb.local", true).unwrap();
        assert!(ep.tls);
    }

    #[test]
    fn endpoint_ignores_the_database_suffix() {
        let ep = parse_endpoint("redis://keydb.local:6380/0", false).unwrap();
        assert_eq!(ep.host, "keydb.local");
        assert_eq!(ep.port, 6380);
    }

    #[test]
    fn endpoint_rejects_garbage() {
        assert!(parse_endpoint("http://keydb.local", false).is_err());
        assert!(parse_endpoint("redis://keydb.local:notaport", false).is_err());
        assert!(parse_endpoint("redis://", false).is_err());
    }
}
