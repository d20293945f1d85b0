//! Single-flight copy locks.
//!
//! At most one copy worker may stream a given (pool, url) into its regional
//! bucket at any instant.  The lock is a conditional put (SET NX EX) of a
//! `LOCK-<cache_key>` key in the status store; a worker that dies without
//! releasing stalls the key no longer than the lock TTL.

use anyhow::{Context, Result};
use fred::interfaces::{KeysInterface, LuaInterface};
use tracing::{debug, warn};

/// Lock key companion of a cache-entry key.
pub fn lock_key(cache_key: &str) -> String {
    format!("LOCK-{cache_key}")
}

/// Attempt to acquire the single-flight lock for `cache_key`.
///
/// Returns `true` if this node now holds the lock, `false` if another
/// worker already does (the caller declines the job; the holder will
/// complete it).
pub async fn acquire_copy_lock(
    pool: &fred::clients::Pool,
    cache_key: &str,
    node_id: &str,
    ttl_secs: u64,
) -> Result<bool> {
    let key = lock_key(cache_key);
    let value = format!("{node_id}:{}", chrono::Utc::now().timestamp());
    let result: Option<String> = pool
        .set(
            &key,
            value.as_str(),
            Some(fred::types::Expiration::EX(ttl_secs as i64)),
            Some(fred::types::SetOptions::NX),
            false,
        )
        .await
        .context("SET NX copy lock")?;
    // SET … NX returns "OK" when the key was set, nil otherwise.
    let acquired = result.is_some();
    debug!(%key, %node_id, acquired, "acquire_copy_lock");
    Ok(acquired)
}

/// Release the lock only if it is still owned by `node_id`.
///
/// Uses a Lua script so the owner check and the delete are atomic; a lock
/// that expired and was re-acquired by another worker is left alone.
pub async fn release_copy_lock(
    pool: &fred::clients::Pool,
    cache_key: &str,
    node_id: &str,
) -> Result<()> {
    let script = r#"
        local val = redis.call('GET', KEYS[1])
        if val and string.find(val, ARGV[1] .. ":", 1, true) == 1 then
            redis.call('DEL', KEYS[1])
            return 1
        end
        return 0
    "#;
    let key = lock_key(cache_key);
    let released: i64 = pool
        .eval(script, vec![key.clone()], vec![node_id.to_string()])
        .await
        .context("copy lock release script failed")?;
    if released == 1 {
        debug!(%key, %node_id, "copy lock released");
    } else {
        warn!(%key, %node_id, "copy lock release: key missing or owned by another worker");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_prefixes_cache_key() {
        assert_eq!(
            lock_key("s3_us-west-1_https%3A%2F%2Fa"),
            "LOCK-s3_us-west-1_https%3A%2F%2Fa"
        );
    }
}
