use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Token naming the blob-store service (e.g. `s3`). Forms the first half
    /// of every pool id.
    pub service: String,
    /// Comma-separated list of regions to mirror into (e.g. `us-west-1,us-east-1`).
    pub regions: String,
    pub backend: BackendConfig,
    pub bucket: BucketConfig,
    pub cache: CacheConfig,
    pub redirect: RedirectConfig,
    pub queue: QueueConfig,
    pub upload: UploadConfig,
    pub status_store: StatusStoreConfig,
    pub proxy: ProxyConfig,
    pub aws: AwsConfig,
}

impl Config {
    /// Split the comma-separated region list into trimmed, non-empty tokens.
    pub fn region_list(&self) -> Vec<String> {
        self.regions
            .split(',')
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Copy workers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Number of copy workers per region, all consuming the same queue.
    #[serde(default = "default_backend_count")]
    pub count: usize,
}

fn default_backend_count() -> usize {
    4
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    /// Bucket name template; `{region}` is substituted per pool.
    #[serde(default = "default_bucket_template")]
    pub name_template: String,
    /// Days after which mirrored objects expire via the bucket lifecycle.
    #[serde(default = "default_lifespan_days")]
    pub lifespan_days: u32,
    /// Canned ACL applied to mirrored objects.
    #[serde(default = "default_bucket_acl")]
    pub acl: String,
}

fn default_bucket_template() -> String {
    "cloud-mirror-{region}".to_string()
}

fn default_lifespan_days() -> u32 {
    30
}

fn default_bucket_acl() -> String {
    "public-read".to_string()
}

// ---------------------------------------------------------------------------
// Cache entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TTL (seconds) of cache entries written on `pending` / `present` /
    /// `error` transitions. Also bounds the single-flight lock.
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,
    /// How long (milliseconds) a redirect request polls for a copy to land
    /// before falling back to the original URL.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

fn default_cache_ttl() -> u64 {
    86_400
}

fn default_max_wait_ms() -> u64 {
    25_000
}

// ---------------------------------------------------------------------------
// Redirect validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectConfig {
    /// Maximum number of hops the redirect-chain validator will follow.
    #[serde(default = "default_redirect_limit")]
    pub limit: u32,
    /// Require https on every hop of the chain.
    #[serde(default = "bool_true")]
    pub ensure_ssl: bool,
    /// Allowlist of anchored regexes; a URL must match one at every hop.
    pub allowed_patterns: Vec<String>,
    /// Timeout (seconds) for each validation HEAD request.
    #[serde(default = "default_validator_timeout")]
    pub validator_timeout_secs: u64,
}

fn default_redirect_limit() -> u32 {
    10
}

fn bool_true() -> bool {
    true
}

fn default_validator_timeout() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Work queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Base queue name; the region is appended per pool.
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// Messages fetched per receive (1-10, the SQS batch window).
    #[serde(default = "default_batch_size")]
    pub batch_size: i32,
    /// Deliveries before a message is moved to the dead-letter queue.
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    /// Visibility timeout (seconds) for in-flight copy jobs.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u32,
    /// Suffix appended to the queue name for its dead-letter companion.
    #[serde(default = "default_dead_letter_suffix")]
    pub dead_letter_suffix: String,
}

fn default_queue_name() -> String {
    "cloud-mirror".to_string()
}

fn default_batch_size() -> i32 {
    10
}

fn default_max_receive_count() -> u32 {
    5
}

fn default_visibility_timeout() -> u32 {
    3_600
}

fn default_dead_letter_suffix() -> String {
    "_dead".to_string()
}

// ---------------------------------------------------------------------------
// Upload behaviour
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Multipart part size in bytes. S3 requires at least 5 MiB for every
    /// part but the last.
    #[serde(default = "default_part_size")]
    pub part_size: usize,
    /// Maximum number of part uploads kept in flight per copy.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Hard wall-clock ceiling (seconds) on a single blob upload.
    #[serde(default = "default_max_copy_secs")]
    pub max_copy_secs: u64,
    /// Inactivity timeout (seconds) on the streaming origin GET.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
}

fn default_part_size() -> usize {
    8 * 1024 * 1024
}

fn default_queue_size() -> usize {
    4
}

fn default_max_copy_secs() -> u64 {
    3_600
}

fn default_inactivity_timeout() -> u64 {
    3_600
}

// ---------------------------------------------------------------------------
// Status store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StatusStoreConfig {
    /// Connection string, `redis://host[:port][/db]` or bare `host[:port]`.
    /// A `rediss://` scheme forces TLS on.
    pub endpoint: String,
    /// Force TLS even for an endpoint without a `rediss://` scheme.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the store auth token.
    #[serde(default = "default_status_store_auth_env")]
    pub auth_token_env: String,
}

fn default_status_store_auth_env() -> String {
    "STATUS_STORE_AUTH_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// HTTP listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    pub http_listen: String,
}

// ---------------------------------------------------------------------------
// AWS control plane
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// Region used for the SQS control plane (S3 clients are per-pool).
    pub region: String,
    /// Use the FIPS endpoints.
    #[serde(default)]
    pub use_fips: bool,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Return `true` when `token` is usable as one half of a pool id: lower-case,
/// underscore-free, and within the route-token alphabet.
pub fn is_valid_pool_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= 22
        && token
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        is_valid_pool_token(&config.service),
        "service must be a lower-case, underscore-free token of at most 22 chars: {:?}",
        config.service
    );

    let regions = config.region_list();
    anyhow::ensure!(!regions.is_empty(), "regions must name at least one region");
    for region in &regions {
        anyhow::ensure!(
            is_valid_pool_token(region),
            "region must be a lower-case, underscore-free token of at most 22 chars: {region:?}"
        );
    }

    for pattern in &config.redirect.allowed_patterns {
        anyhow::ensure!(
            pattern.starts_with('^') && pattern.ends_with('/'),
            "allowed pattern must be anchored with '^' and end with '/': {pattern:?}"
        );
        regex::Regex::new(pattern)
            .with_context(|| format!("allowed pattern does not compile: {pattern:?}"))?;
    }

    anyhow::ensure!(config.backend.count >= 1, "backend.count must be >= 1");
    anyhow::ensure!(
        config.upload.part_size >= 5 * 1024 * 1024,
        "upload.part_size must be at least 5 MiB"
    );
    anyhow::ensure!(config.upload.queue_size >= 1, "upload.queue_size must be >= 1");
    anyhow::ensure!(config.bucket.lifespan_days >= 1, "bucket.lifespan_days must be >= 1");
    anyhow::ensure!(config.cache.ttl > 0, "cache.ttl must be > 0");
    anyhow::ensure!(
        (1..=10).contains(&config.queue.batch_size),
        "queue.batch_size must be 1-10"
    );
    anyhow::ensure!(
        config.queue.max_receive_count >= 1,
        "queue.max_receive_count must be >= 1"
    );
    anyhow::ensure!(
        config.bucket.name_template.contains("{region}"),
        "bucket.name_template must contain {{region}}"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> String {
        r#"
service: s3
regions: us-west-1,us-east-1
backend:
  count: 2
bucket:
  name_template: cloud-mirror-{region}
cache:
  ttl: 86400
  max_wait_ms: 25000
redirect:
  limit: 10
  ensure_ssl: true
  allowed_patterns:
    - "^https://queue\\.taskcluster\\.net/"
queue:
  name: cloud-mirror
upload: {}
status_store:
  endpoint: redis://localhost:6379
proxy:
  http_listen: 0.0.0.0:8080
aws:
  region: us-west-2
"#
        .to_string()
    }

    #[test]
    fn parses_and_validates_sample() {
        let config: Config = serde_yaml::from_str(&sample_yaml()).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.region_list(), vec!["us-west-1", "us-east-1"]);
        assert_eq!(config.backend.count, 2);
        assert_eq!(config.upload.part_size, 8 * 1024 * 1024);
        assert_eq!(config.queue.dead_letter_suffix, "_dead");
    }

    #[test]
    fn rejects_unanchored_pattern() {
        let mut config: Config = serde_yaml::from_str(&sample_yaml()).unwrap();
        config.redirect.allowed_patterns = vec!["https://example.com/".to_string()];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_pattern_without_trailing_slash() {
        let mut config: Config = serde_yaml::from_str(&sample_yaml()).unwrap();
        config.redirect.allowed_patterns = vec!["^https://example.com".to_string()];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_underscored_region() {
        let mut config: Config = serde_yaml::from_str(&sample_yaml()).unwrap();
        config.regions = "us_west_1".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_small_part_size() {
        let mut config: Config = serde_yaml::from_str(&sample_yaml()).unwrap();
        config.upload.part_size = 1024;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn pool_token_alphabet() {
        assert!(is_valid_pool_token("us-west-1"));
        assert!(is_valid_pool_token("s3"));
        assert!(!is_valid_pool_token("us_west_1"));
        assert!(!is_valid_pool_token("US-WEST-1"));
        assert!(!is_valid_pool_token(""));
        assert!(!is_valid_pool_token("a-very-long-region-name-exceeding"));
    }
}
