//! S3-backed blob store for mirrored artifacts.
//!
//! The object key is the raw origin URL; percent-encoding is applied only
//! when the key is rendered into a public URL.  Object lifetime is governed
//! exclusively by the bucket lifecycle policy, so upstream `Cache-Control` /
//! `Expires` headers are never forwarded.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    AbortIncompleteMultipartUpload, BucketLifecycleConfiguration, BucketLocationConstraint,
    CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration, ExpirationStatus,
    LifecycleExpiration, LifecycleRule, LifecycleRuleFilter, ObjectCannedAcl,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::{debug, info, instrument, warn};

/// Prefix applied to every metadata key so mirror-owned fields cannot
/// collide with anything else in the bucket.
const METADATA_PREFIX: &str = "cloud-mirror-";

/// Characters escaped when the object key is rendered into a URL path.
/// `%` is included so the rendering stays injective.
const PUBLIC_URL_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'\\')
    .add(b'^')
    .add(b'|');

// ---------------------------------------------------------------------------
// Forwarded headers
// ---------------------------------------------------------------------------

/// The subset of upstream response headers a put may carry to the store.
/// `Cache-Control` and `Expires` are unrepresentable here; the bucket
/// lifecycle governs object lifetime.
#[derive(Debug, Clone)]
pub struct PutHeaders {
    pub content_type: String,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_md5: Option<String>,
    pub content_length: Option<i64>,
}

impl PutHeaders {
    /// Extract the forwardable subset from an upstream header map.
    /// `Content-Type` is required; everything else is optional.
    pub fn from_upstream(headers: &reqwest::header::HeaderMap) -> Result<Self> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        let content_type = get("content-type")
            .context("origin response carried no Content-Type header")?;
        Ok(Self {
            content_type,
            content_disposition: get("content-disposition"),
            content_encoding: get("content-encoding"),
            content_md5: get("content-md5"),
            content_length: headers
                .get("content-length")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok()),
        })
    }
}

/// Result of a successful head.  `None` from [`BlobStore::head`] means the
/// object does not exist.
#[derive(Debug, Clone)]
pub struct BlobHead {
    pub status: u16,
    pub etag: Option<String>,
    pub content_length: Option<i64>,
    /// Raw `x-amz-expiration` value, when the lifecycle has stamped one.
    pub expiration: Option<String>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// One regional bucket plus the upload policy applied to every copy.
#[derive(Clone)]
pub struct BlobStore {
    client: Client,
    bucket: String,
    region: String,
    acl: String,
    part_size: usize,
    queue_size: usize,
    put_deadline: Duration,
}

impl BlobStore {
    pub fn new(
        client: Client,
        bucket: String,
        region: String,
        acl: String,
        part_size: usize,
        queue_size: usize,
        put_deadline: Duration,
    ) -> Self {
        Self {
            client,
            bucket,
            region,
            acl,
            part_size,
            queue_size,
            put_deadline,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    /// Ensure the bucket exists and carries the mirror lifecycle policy:
    /// objects expire after `lifespan_days`, incomplete multipart uploads
    /// are aborted after one day.  "Already exists / already owned" is
    /// success.
    #[instrument(skip(self), fields(bucket = %self.bucket, region = %self.region))]
    pub async fn init(&self, lifespan_days: u32) -> Result<()> {
        // us-east-1 rejects an explicit LocationConstraint.
        let mut create_bucket = self.client.create_bucket().bucket(&self.bucket);
        if self.region != "us-east-1" {
            let constraint = BucketLocationConstraint::from(self.region.as_str());
            create_bucket = create_bucket.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(constraint)
                    .build(),
            );
        }

        match create_bucket.send().await {
            Ok(_) => info!("bucket created"),
            Err(err) => {
                let already_there = err.as_service_error().is_some_and(|e| {
                    e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists()
                });
                if already_there {
                    debug!("bucket already exists");
                } else {
                    return Err(err).context("S3 CreateBucket");
                }
            }
        }

        let rule = LifecycleRule::builder()
            .id("mirror-expiry")
            .status(ExpirationStatus::Enabled)
            .filter(LifecycleRuleFilter::builder().prefix("").build())
            .expiration(
                LifecycleExpiration::builder()
                    .days(lifespan_days as i32)
                    .build(),
            )
            .abort_incomplete_multipart_upload(
                AbortIncompleteMultipartUpload::builder()
                    .days_after_initiation(1)
                    .build(),
            )
            .build()
            .context("failed to build lifecycle rule")?;

        self.client
            .put_bucket_lifecycle_configuration()
            .bucket(&self.bucket)
            .lifecycle_configuration(
                BucketLifecycleConfiguration::builder()
                    .rules(rule)
                    .build()
                    .context("failed to build lifecycle configuration")?,
            )
            .send()
            .await
            .context("S3 PutBucketLifecycleConfiguration")?;

        info!(lifespan_days, "bucket lifecycle configured");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Put
    // -----------------------------------------------------------------------

    /// Stream `body` into the bucket as a chunked multipart upload.
    ///
    /// Chunks are buffered into parts of `part_size` bytes with at most
    /// `queue_size` part uploads in flight.  The whole upload runs under a
    /// hard wall-clock deadline; on timeout or any error the multipart
    /// upload is aborted (the lifecycle policy sweeps whatever the abort
    /// leaves behind).  Returns the number of bytes written.
    #[instrument(skip(self, body, headers, metadata), fields(bucket = %self.bucket, %key))]
    pub async fn put<S>(
        &self,
        key: &str,
        body: S,
        headers: &PutHeaders,
        metadata: &HashMap<String, String>,
    ) -> Result<u64>
    where
        S: Stream<Item = Result<Bytes>> + Send + Unpin,
    {
        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .acl(ObjectCannedAcl::from(self.acl.as_str()))
            .content_type(&headers.content_type);
        if let Some(ref disposition) = headers.content_disposition {
            create = create.content_disposition(disposition);
        }
        if let Some(ref encoding) = headers.content_encoding {
            create = create.content_encoding(encoding);
        }
        if let Some(ref md5) = headers.content_md5 {
            // A multipart upload cannot carry a whole-object Content-MD5
            // header (the store checksums per part), so the upstream digest
            // rides along as metadata.
            create = create.metadata(
                format!("{METADATA_PREFIX}upstream-content-md5"),
                md5.clone(),
            );
        }
        for (name, value) in metadata {
            create = create.metadata(format!("{METADATA_PREFIX}{name}"), value.clone());
        }

        let upload_id = create
            .send()
            .await
            .context("S3 CreateMultipartUpload")?
            .upload_id
            .context("S3 returned no upload_id")?;

        let outcome = tokio::time::timeout(
            self.put_deadline,
            self.upload_parts(key, &upload_id, body),
        )
        .await;

        let result = match outcome {
            Ok(inner) => inner,
            Err(_) => Err(anyhow::anyhow!(
                "upload exceeded the {}s deadline",
                self.put_deadline.as_secs()
            )),
        };

        match result {
            Ok(bytes) => Ok(bytes),
            Err(err) => {
                self.abort_upload(key, &upload_id).await;
                Err(err)
            }
        }
    }

    /// Inner part loop, separated so the watchdog can cancel it wholesale.
    async fn upload_parts<S>(&self, key: &str, upload_id: &str, mut body: S) -> Result<u64>
    where
        S: Stream<Item = Result<Bytes>> + Send + Unpin,
    {
        let mut buffer: Vec<u8> = Vec::with_capacity(self.part_size);
        let mut bytes_written: u64 = 0;
        let mut part_number: i32 = 1;
        let mut in_flight = FuturesUnordered::new();
        let mut completed: Vec<CompletedPart> = Vec::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("origin stream error")?;
            bytes_written += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);

            while buffer.len() >= self.part_size {
                let part: Vec<u8> = buffer.drain(..self.part_size).collect();
                if in_flight.len() >= self.queue_size {
                    let done: CompletedPart =
                        in_flight.next().await.expect("in-flight set non-empty")?;
                    completed.push(done);
                }
                in_flight.push(self.spawn_part(key, upload_id, part_number, part));
                part_number += 1;
            }
        }

        // The final part may be any size, including empty-stream zero parts
        // handled below.
        if !buffer.is_empty() {
            if in_flight.len() >= self.queue_size {
                let done: CompletedPart = in_flight.next().await.expect("in-flight set non-empty")?;
                completed.push(done);
            }
            in_flight.push(self.spawn_part(key, upload_id, part_number, std::mem::take(&mut buffer)));
        }

        while let Some(done) = in_flight.next().await {
            completed.push(done?);
        }

        // S3 multipart requires at least one non-empty part; mirror an empty
        // origin body with a plain PutObject under the same key.
        if completed.is_empty() {
            self.abort_upload(key, upload_id).await;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .acl(ObjectCannedAcl::from(self.acl.as_str()))
                .body(ByteStream::from(Bytes::new()))
                .send()
                .await
                .context("S3 PutObject for empty body")?;
            return Ok(0);
        }

        completed.sort_by_key(|p| p.part_number().unwrap_or(0));

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .context("S3 CompleteMultipartUpload")?;

        debug!(bytes_written, parts = part_number - 1, "multipart upload completed");
        Ok(bytes_written)
    }

    fn spawn_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<CompletedPart>> + Send {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        async move {
            let output = client
                .upload_part()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(data))
                .send()
                .await
                .with_context(|| format!("S3 UploadPart {part_number}"))?;
            Ok(CompletedPart::builder()
                .e_tag(output.e_tag().unwrap_or_default())
                .part_number(part_number)
                .build())
        }
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) {
        if let Err(err) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(
                %key,
                error = %aws_sdk_s3::error::DisplayErrorContext(&err),
                "failed to abort multipart upload, lifecycle will sweep the parts"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Delete / head
    // -----------------------------------------------------------------------

    /// Delete an object.  Deleting a missing key is success.
    #[instrument(skip(self), fields(bucket = %self.bucket, %key))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("S3 DeleteObject")?;
        debug!("blob deleted");
        Ok(())
    }

    /// Head an object.  Returns `None` when it does not exist.
    #[instrument(skip(self), fields(bucket = %self.bucket, %key))]
    pub async fn head(&self, key: &str) -> Result<Option<BlobHead>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(BlobHead {
                status: 200,
                etag: output.e_tag().map(|s| s.to_string()),
                content_length: output.content_length(),
                expiration: output.expiration().map(|s| s.to_string()),
            })),
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    Ok(None)
                } else {
                    Err(err).context("S3 HeadObject")
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // URL construction
    // -----------------------------------------------------------------------

    /// Deterministic public read-through URL for an object key.  No network.
    pub fn public_url(&self, key: &str) -> String {
        format!(
            "https://{}.s3-{}.amazonaws.com/{}",
            self.bucket,
            self.region,
            utf8_percent_encode(key, PUBLIC_URL_SET)
        )
    }
}

// ---------------------------------------------------------------------------
// Expiration parsing
// ---------------------------------------------------------------------------

/// Parse the store's per-object expiration signal, e.g.
/// `expiry-date="Fri, 21 Dec 2012 00:00:00 GMT", rule-id="mirror-expiry"`.
pub fn parse_expiration(header_value: &str) -> Option<DateTime<Utc>> {
    let start = header_value.find("expiry-date=\"")? + "expiry-date=\"".len();
    let rest = &header_value[start..];
    let end = rest.find('"')?;
    DateTime::parse_from_rfc2822(&rest[..end])
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> BlobStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-west-1"))
            .build();
        BlobStore::new(
            Client::from_conf(config),
            "cloud-mirror-us-west-1".to_string(),
            "us-west-1".to_string(),
            "public-read".to_string(),
            8 * 1024 * 1024,
            4,
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn public_url_uses_virtual_hosted_regional_endpoint() {
        let url = store().public_url("https://origin.example/artifact.tar.gz");
        assert_eq!(
            url,
            "https://cloud-mirror-us-west-1.s3-us-west-1.amazonaws.com/https://origin.example/artifact.tar.gz"
        );
    }

    #[test]
    fn public_url_escapes_queries_and_spaces() {
        let url = store().public_url("https://origin.example/a b?v=1");
        assert!(url.ends_with("/https://origin.example/a%20b%3Fv=1"));
    }

    #[test]
    fn public_url_is_injective_on_percent() {
        let a = store().public_url("https://o/a%20b");
        let b = store().public_url("https://o/a b");
        assert_ne!(a, b);
    }

    #[test]
    fn parses_expiration_header() {
        let value = r#"expiry-date="Fri, 21 Dec 2012 00:00:00 GMT", rule-id="mirror-expiry""#;
        let parsed = parse_expiration(value).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2012, 12, 21, 0, 0, 0).unwrap());
    }

    #[test]
    fn expiration_parse_tolerates_garbage() {
        assert!(parse_expiration("").is_none());
        assert!(parse_expiration("rule-id=\"only\"").is_none());
        assert!(parse_expiration("expiry-date=\"not a date\"").is_none());
    }

    #[test]
    fn put_headers_require_content_type() {
        let headers = reqwest::header::HeaderMap::new();
        assert!(PutHeaders::from_upstream(&headers).is_err());
    }

    #[test]
    fn put_headers_extract_passthrough_fields_only() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("content-type", "application/octet-stream".parse().unwrap());
        headers.insert("content-encoding", "gzip".parse().unwrap());
        headers.insert("content-length", "1234".parse().unwrap());
        headers.insert("content-md5", "1B2M2Y8AsgTpgAmY7PhCfg==".parse().unwrap());
        // Lifetime is governed by the bucket lifecycle, never by the origin.
        headers.insert("cache-control", "max-age=60".parse().unwrap());
        headers.insert("expires", "Fri, 21 Dec 2012 00:00:00 GMT".parse().unwrap());

        let parsed = PutHeaders::from_upstream(&headers).unwrap();
        assert_eq!(parsed.content_type, "application/octet-stream");
        assert_eq!(parsed.content_encoding.as_deref(), Some("gzip"));
        assert_eq!(parsed.content_length, Some(1234));
        assert_eq!(
            parsed.content_md5.as_deref(),
            Some("1B2M2Y8AsgTpgAmY7PhCfg==")
        );
        assert!(parsed.content_disposition.is_none());
    }
}
