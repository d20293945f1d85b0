//! Worker node identity, used as the owner tag on single-flight locks.

/// Derive a stable-ish node identifier.
///
/// Prefers the `EC2_INSTANCE_ID` environment variable (set via user-data or
/// IMDSv2 on EC2 instances).  Falls back to `<hostname>-<random-8-chars>` so
/// that every process gets a unique id even on the same host.
pub fn node_id() -> String {
    std::env::var("EC2_INSTANCE_ID").unwrap_or_else(|_| {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let suffix = &uuid::Uuid::new_v4().to_string()[..8];
        format!("{hostname}-{suffix}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_distinct_without_instance_id() {
        // Unless EC2_INSTANCE_ID pins the value, two calls must not collide.
        if std::env::var("EC2_INSTANCE_ID").is_err() {
            assert_ne!(node_id(), node_id());
        }
    }
}
