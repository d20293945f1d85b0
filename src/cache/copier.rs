//! The copy operation: stream one validated origin URL into the regional
//! bucket under a single-flight lock.
//!
//! Exactly one worker process may mutate the blob for a given (pool, url)
//! at any instant.  The lock is acquired by conditional put in the status
//! store and released in a finalizer path; a worker that dies mid-copy
//! stalls the lock no longer than its TTL.

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use tracing::{info, instrument, warn};

use crate::cache::manager::CacheManager;
use crate::coordination::locks;
use crate::coordination::status::CacheEntry;
use crate::metrics::{CopyLabels, CopyOutcome};
use crate::storage::s3::PutHeaders;
use crate::validate::{validate_url, ValidatedUrl};

/// Run the full copy lifecycle for `url`.
///
/// Declining because another worker holds the lock is success (the holder
/// will complete the copy; observers see `pending`).  Any failure records
/// an `error` entry and propagates, leaving the queue message unacked so
/// redelivery drives the retry.
#[instrument(skip(manager), fields(pool = %manager.pool_id))]
pub async fn copy(manager: &CacheManager, url: &str) -> Result<()> {
    let cache_key = manager.cache_key(url);

    let acquired = locks::acquire_copy_lock(
        manager.status.pool(),
        &cache_key,
        &manager.node_id,
        manager.cache_ttl,
    )
    .await?;

    if !acquired {
        manager
            .metrics
            .metrics
            .concurrent_copy_already_locked
            .get_or_create(&manager.labels())
            .inc();
        manager.metrics.metrics.copies_total.get_or_create(&CopyLabels {
            pool: manager.pool_id.clone(),
            outcome: CopyOutcome::Declined,
        })
        .inc();
        info!(%url, "copy already in flight elsewhere, declining");
        return Ok(());
    }

    let result = copy_locked(manager, url, &cache_key).await;

    // Finalizer: the lock is released whatever happened above.
    if let Err(err) =
        locks::release_copy_lock(manager.status.pool(), &cache_key, &manager.node_id).await
    {
        warn!(%url, error = %format!("{err:#}"), "failed to release copy lock, TTL will reap it");
    }

    let outcome = if result.is_ok() {
        CopyOutcome::Ok
    } else {
        CopyOutcome::Error
    };
    manager.metrics.metrics.copies_total.get_or_create(&CopyLabels {
        pool: manager.pool_id.clone(),
        outcome,
    })
    .inc();

    result
}

/// The work done while holding the single-flight lock.
async fn copy_locked(manager: &CacheManager, url: &str, cache_key: &str) -> Result<()> {
    manager
        .status
        .put_entry(cache_key, &CacheEntry::pending(url), manager.cache_ttl)
        .await?;

    match stream_to_blob(manager, url).await {
        Ok(()) => {
            manager
                .status
                .put_entry(cache_key, &CacheEntry::present(url), manager.cache_ttl)
                .await?;
            Ok(())
        }
        Err(err) => {
            // Best-effort cleanup: a half-written object must not satisfy a
            // later backfill probe.
            if let Err(delete_err) = manager.blob.delete(url).await {
                warn!(%url, error = %format!("{delete_err:#}"), "cleanup delete failed");
            }
            let stack = format!("{err:#}");
            if let Err(status_err) = manager
                .status
                .put_entry(
                    cache_key,
                    &CacheEntry::error(url, &stack),
                    manager.cache_ttl,
                )
                .await
            {
                warn!(%url, error = %format!("{status_err:#}"), "failed to record error entry");
            }
            Err(err)
        }
    }
}

/// Validate the URL, open the origin stream, and feed it to the blob store.
async fn stream_to_blob(manager: &CacheManager, url: &str) -> Result<()> {
    let validated = validate_url(
        &manager.validator_client,
        url,
        &manager.allowlist,
        manager.redirect_limit,
        manager.ensure_ssl,
    )
    .await
    .with_context(|| format!("validation failed for {url}"))?;

    let resp = manager
        .http_client
        .get(&validated.final_url)
        .header("Accept-Encoding", "*")
        .send()
        .await
        .with_context(|| format!("origin GET failed for {}", validated.final_url))?
        .error_for_status()
        .context("origin GET returned an error status")?;

    let headers = PutHeaders::from_upstream(resp.headers())?;
    let metadata = build_metadata(url, &validated, resp.headers())?;
    let advertised_length = headers.content_length;

    // Inactivity watchdog: any single gap between chunks longer than the
    // configured timeout aborts the stream, which surfaces as a put error.
    let inactivity = manager.inactivity_timeout;
    let guarded = Box::pin(futures::stream::unfold(
        resp.bytes_stream(),
        move |mut inner| async move {
            match tokio::time::timeout(inactivity, inner.next()).await {
                Ok(Some(Ok(chunk))) => Some((Ok(chunk), inner)),
                Ok(Some(Err(err))) => {
                    Some((Err(anyhow::Error::new(err).context("origin read failed")), inner))
                }
                Ok(None) => None,
                Err(_) => Some((
                    Err(anyhow::anyhow!(
                        "origin stream stalled for {}s, aborting",
                        inactivity.as_secs()
                    )),
                    inner,
                )),
            }
        },
    ));

    let started = Instant::now();
    let bytes = manager.blob.put(url, guarded, &headers, &metadata).await?;
    let elapsed = started.elapsed();

    let labels = manager.labels();
    let metrics = &manager.metrics.metrics;
    metrics
        .copy_duration_ms
        .get_or_create(&labels)
        .observe(elapsed.as_millis() as f64);
    metrics.copy_size_bytes.get_or_create(&labels).observe(bytes as f64);
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    metrics
        .copy_speed_kbps
        .get_or_create(&labels)
        .observe(bytes as f64 * 8.0 / 1000.0 / secs);

    if let Some(advertised) = advertised_length {
        if advertised != bytes as i64 {
            metrics.content_length_mismatch.get_or_create(&labels).inc();
            warn!(
                %url,
                advertised,
                observed = bytes,
                "observed byte count differs from advertised Content-Length"
            );
        }
    }

    info!(
        %url,
        bytes,
        duration_ms = elapsed.as_millis() as u64,
        hops = validated.hops.len(),
        "copy completed"
    );
    Ok(())
}

/// Assemble the namespaced metadata recorded on every mirrored object.
fn build_metadata(
    request_url: &str,
    validated: &ValidatedUrl,
    upstream: &reqwest::header::HeaderMap,
) -> Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    if let Some(etag) = upstream.get("etag").and_then(|v| v.to_str().ok()) {
        metadata.insert("upstream-etag".to_string(), etag.to_string());
    }
    if let Some(len) = upstream.get("content-length").and_then(|v| v.to_str().ok()) {
        metadata.insert("upstream-content-length".to_string(), len.to_string());
    }
    metadata.insert("upstream-url".to_string(), request_url.to_string());
    metadata.insert(
        "stored".to_string(),
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    metadata.insert(
        "addresses".to_string(),
        serde_json::to_string(&validated.hops).context("failed to encode hop chain")?,
    );
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::Hop;

    #[test]
    fn metadata_records_url_hops_and_timestamp() {
        let mut upstream = reqwest::header::HeaderMap::new();
        upstream.insert("etag", "\"abc123\"".parse().unwrap());
        upstream.insert("content-length", "42".parse().unwrap());

        let validated = ValidatedUrl {
            final_url: "https://cdn.example/artifact".to_string(),
            headers: reqwest::header::HeaderMap::new(),
            status: 200,
            hops: vec![
                Hop {
                    code: 302,
                    url: "https://origin.example/artifact".to_string(),
                    timestamp: Utc::now(),
                },
                Hop {
                    code: 200,
                    url: "https://cdn.example/artifact".to_string(),
                    timestamp: Utc::now(),
                },
            ],
        };

        let metadata =
            build_metadata("https://origin.example/artifact", &validated, &upstream).unwrap();
        assert_eq!(metadata["upstream-etag"], "\"abc123\"");
        assert_eq!(metadata["upstream-content-length"], "42");
        assert_eq!(metadata["upstream-url"], "https://origin.example/artifact");

        let hops: serde_json::Value = serde_json::from_str(&metadata["addresses"]).unwrap();
        assert_eq!(hops.as_array().unwrap().len(), 2);
        assert_eq!(hops[0]["code"], 302);

        // `stored` is RFC 3339 / ISO 8601.
        assert!(chrono::DateTime::parse_from_rfc3339(&metadata["stored"]).is_ok());
    }

    #[test]
    fn metadata_omits_absent_upstream_fields() {
        let validated = ValidatedUrl {
            final_url: "https://o/x".to_string(),
            headers: reqwest::header::HeaderMap::new(),
            status: 200,
            hops: vec![],
        };
        let metadata =
            build_metadata("https://o/x", &validated, &reqwest::header::HeaderMap::new()).unwrap();
        assert!(!metadata.contains_key("upstream-etag"));
        assert!(!metadata.contains_key("upstream-content-length"));
        assert!(metadata.contains_key("upstream-url"));
        assert!(metadata.contains_key("stored"));
        assert!(metadata.contains_key("addresses"));
    }
}
