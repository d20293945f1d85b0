//! Cache manager: the state machine between redirect requests, the status
//! store, the copy queue, and the regional bucket.
//!
//! Stateless beyond its injected adapters; every mutation flows through the
//! status store or the queue so that any number of front ends and workers
//! can share a pool.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::coordination::status::{encode_cache_key, CacheEntry, EntryStatus, StatusStore};
use crate::metrics::{MetricsRegistry, PoolLabels};
use crate::queue::{CopyJob, QueueSender};
use crate::storage::s3::parse_expiration;
use crate::storage::BlobStore;

/// Safety margin between a backfilled entry's TTL and the blob's own
/// expiry: the entry must never outlive the object it points at.
pub(crate) const BACKFILL_SAFETY_MARGIN_SECS: i64 = 30 * 60;

// ---------------------------------------------------------------------------
// Lookup outcome
// ---------------------------------------------------------------------------

/// What a redirect request observes for a URL.  `Absent` is the read-side
/// outcome of a missing entry (and a failed backfill probe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectStatus {
    Present,
    Pending,
    Error,
    Absent,
}

#[derive(Debug, Clone)]
pub struct RedirectLookup {
    pub status: RedirectStatus,
    /// The blob's public URL; meaningful to clients only when `Present`.
    pub url: String,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// One `{service, region}` pool.
#[derive(Clone)]
pub struct CacheManager {
    pub pool_id: String,
    pub service: String,
    pub region: String,
    pub(crate) status: StatusStore,
    pub(crate) blob: BlobStore,
    pub(crate) sender: QueueSender,
    pub(crate) metrics: MetricsRegistry,
    /// Plain client for streaming origin GETs and backfill HEADs.
    pub(crate) http_client: reqwest::Client,
    /// No-redirect client used by the chain validator.
    pub(crate) validator_client: reqwest::Client,
    pub(crate) allowlist: Vec<Regex>,
    pub(crate) cache_ttl: u64,
    pub(crate) redirect_limit: u32,
    pub(crate) ensure_ssl: bool,
    pub(crate) inactivity_timeout: Duration,
    pub(crate) node_id: String,
}

/// Compose the pool id that keys all routing.
pub fn pool_id(service: &str, region: &str) -> String {
    format!("{service}_{region}")
}

impl CacheManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: String,
        region: String,
        status: StatusStore,
        blob: BlobStore,
        sender: QueueSender,
        metrics: MetricsRegistry,
        http_client: reqwest::Client,
        validator_client: reqwest::Client,
        allowlist: Vec<Regex>,
        cache_ttl: u64,
        redirect_limit: u32,
        ensure_ssl: bool,
        inactivity_timeout: Duration,
        node_id: String,
    ) -> Self {
        let pool_id = pool_id(&service, &region);
        Self {
            pool_id,
            service,
            region,
            status,
            blob,
            sender,
            metrics,
            http_client,
            validator_client,
            allowlist,
            cache_ttl,
            redirect_limit,
            ensure_ssl,
            inactivity_timeout,
            node_id,
        }
    }

    pub(crate) fn labels(&self) -> PoolLabels {
        PoolLabels::new(&self.pool_id)
    }

    pub(crate) fn cache_key(&self, url: &str) -> String {
        encode_cache_key(&self.pool_id, url)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Read the status a redirect request should act on.  A miss is probed
    /// against the bucket first: the entry may have expired while the blob
    /// is still live, in which case the entry is backfilled.
    #[instrument(skip(self), fields(pool = %self.pool_id))]
    pub async fn get_url_for_redirect(&self, url: &str) -> Result<RedirectLookup> {
        let key = self.cache_key(url);
        let public_url = self.blob.public_url(url);

        if let Some(entry) = self.status.get_entry(&key).await? {
            let status = match entry.status {
                EntryStatus::Present => {
                    self.metrics.metrics.cache_hit.get_or_create(&self.labels()).inc();
                    RedirectStatus::Present
                }
                EntryStatus::Pending => RedirectStatus::Pending,
                EntryStatus::Error => RedirectStatus::Error,
            };
            return Ok(RedirectLookup {
                status,
                url: public_url,
            });
        }

        self.metrics.metrics.cache_miss.get_or_create(&self.labels()).inc();

        if self.backfill(url).await? {
            return Ok(RedirectLookup {
                status: RedirectStatus::Present,
                url: public_url,
            });
        }

        Ok(RedirectLookup {
            status: RedirectStatus::Absent,
            url: public_url,
        })
    }

    // -----------------------------------------------------------------------
    // Backfill
    // -----------------------------------------------------------------------

    /// Repopulate a missing entry from a still-live blob.
    ///
    /// HEADs the public URL; on 2xx with a parseable expiration, writes
    /// `present` with a TTL capped 30 minutes short of the blob's remaining
    /// life (floored at zero).  Anything else leaves the entry absent.
    #[instrument(skip(self), fields(pool = %self.pool_id))]
    pub async fn backfill(&self, url: &str) -> Result<bool> {
        let public_url = self.blob.public_url(url);
        let resp = match self.http_client.head(&public_url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                debug!(error = %err, "backfill probe failed, treating as absent");
                return Ok(false);
            }
        };

        if !resp.status().is_success() {
            return Ok(false);
        }

        let expiration = resp
            .headers()
            .get("x-amz-expiration")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_expiration);

        let Some(expiry) = expiration else {
            // Without the lifecycle stamp we cannot keep the entry strictly
            // shorter-lived than the blob.
            debug!("blob is live but carries no expiration, skipping backfill");
            return Ok(false);
        };

        let ttl = capped_backfill_ttl(expiry.timestamp() - Utc::now().timestamp());
        let key = self.cache_key(url);
        self.status
            .put_entry(&key, &CacheEntry::present(url), ttl)
            .await?;
        self.metrics.metrics.backfill.get_or_create(&self.labels()).inc();
        info!(%url, ttl, "entry backfilled from live blob");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Request / purge
    // -----------------------------------------------------------------------

    /// Mark the URL `pending` and enqueue a copy job.
    #[instrument(skip(self), fields(pool = %self.pool_id))]
    pub async fn request_put(&self, url: &str) -> Result<()> {
        let key = self.cache_key(url);
        self.status
            .put_entry(&key, &CacheEntry::pending(url), self.cache_ttl)
            .await?;
        self.sender
            .send_job(&CopyJob::put(&self.pool_id, url))
            .await
            .context("failed to enqueue copy job")?;
        debug!(%url, "copy requested");
        Ok(())
    }

    /// Remove the blob, then the entry.  Not-found is ignored on both.
    #[instrument(skip(self), fields(pool = %self.pool_id))]
    pub async fn purge(&self, url: &str) -> Result<()> {
        if let Err(err) = self.blob.delete(url).await {
            warn!(%url, error = %format!("{err:#}"), "blob delete during purge failed");
        }
        let key = self.cache_key(url);
        self.status.delete_entry(&key).await?;
        self.metrics.metrics.purges_total.get_or_create(&self.labels()).inc();
        info!(%url, "purged");
        Ok(())
    }

    /// Worker entry point: perform the copy described by a dequeued job.
    pub async fn put(&self, url: &str) -> Result<()> {
        super::copier::copy(self, url).await
    }
}

/// TTL for a backfilled entry: the blob's remaining life minus the safety
/// margin, floored at zero.
pub(crate) fn capped_backfill_ttl(remaining_secs: i64) -> u64 {
    (remaining_secs - BACKFILL_SAFETY_MARGIN_SECS).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_id_composition() {
        assert_eq!(pool_id("s3", "us-west-1"), "s3_us-west-1");
    }

    #[test]
    fn backfill_ttl_keeps_thirty_minute_margin() {
        assert_eq!(capped_backfill_ttl(3 * 3600), 3 * 3600 - 1800);
    }

    #[test]
    fn backfill_ttl_floors_at_zero() {
        assert_eq!(capped_backfill_ttl(60), 0);
        assert_eq!(capped_backfill_ttl(0), 0);
        assert_eq!(capped_backfill_ttl(-5), 0);
    }

    #[test]
    fn backfill_ttl_is_strictly_shorter_than_blob_life() {
        for remaining in [1800_i64, 1801, 7200, 86_400] {
            let ttl = capped_backfill_ttl(remaining) as i64;
            assert!(ttl <= remaining - BACKFILL_SAFETY_MARGIN_SECS || ttl == 0);
        }
    }
}
