//! Copy-job queue over SQS.
//!
//! One primary queue per region carries `{id, url, action}` jobs from the
//! redirect front end to the copy workers; a companion dead-letter queue
//! absorbs messages that exhaust the redelivery cap.  Redelivery and backoff
//! are driven entirely by SQS: a handler failure leaves the message unacked
//! and the visibility timeout returns it to the queue.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::metrics::{MetricsRegistry, PoolLabels};

// ---------------------------------------------------------------------------
// Job message
// ---------------------------------------------------------------------------

/// The one message shape the queue carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CopyJob {
    /// Pool id, `<service>_<region>`.
    pub id: String,
    pub url: String,
    pub action: String,
}

impl CopyJob {
    pub fn put(pool_id: &str, url: &str) -> Self {
        Self {
            id: pool_id.to_string(),
            url: url.to_string(),
            action: "put".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue creation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueueUrls {
    pub queue_url: String,
    pub dead_letter_url: String,
}

/// Create the dead-letter queue, read back its ARN, then create the primary
/// queue bound to it with the redelivery cap and visibility timeout.
///
/// `CreateQueue` is idempotent when the attributes match, so re-running at
/// startup against existing queues succeeds.
pub async fn initialize(
    client: &Client,
    queue_name: &str,
    dead_letter_suffix: &str,
    max_receive_count: u32,
    visibility_timeout_secs: u32,
) -> Result<QueueUrls> {
    let dead_letter_name = format!("{queue_name}{dead_letter_suffix}");

    let dead_letter_url = client
        .create_queue()
        .queue_name(&dead_letter_name)
        .send()
        .await
        .with_context(|| format!("failed to create dead-letter queue {dead_letter_name}"))?
        .queue_url
        .context("CreateQueue returned no queue_url for the dead-letter queue")?;

    let dead_letter_arn = client
        .get_queue_attributes()
        .queue_url(&dead_letter_url)
        .attribute_names(QueueAttributeName::QueueArn)
        .send()
        .await
        .context("failed to read dead-letter queue ARN")?
        .attributes
        .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn).cloned())
        .context("dead-letter queue has no QueueArn attribute")?;

    let redrive_policy = serde_json::json!({
        "deadLetterTargetArn": dead_letter_arn,
        "maxReceiveCount": max_receive_count.to_string(),
    })
    .to_string();

    let queue_url = client
        .create_queue()
        .queue_name(queue_name)
        .attributes(QueueAttributeName::RedrivePolicy, redrive_policy)
        .attributes(
            QueueAttributeName::VisibilityTimeout,
            visibility_timeout_secs.to_string(),
        )
        .send()
        .await
        .with_context(|| format!("failed to create queue {queue_name}"))?
        .queue_url
        .context("CreateQueue returned no queue_url for the primary queue")?;

    info!(%queue_url, %dead_letter_url, "copy queue initialised");

    Ok(QueueUrls {
        queue_url,
        dead_letter_url,
    })
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct QueueSender {
    client: Client,
    queue_url: String,
}

impl QueueSender {
    pub fn new(client: Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }

    /// Serialise and send a payload.  Non-object payloads are rejected
    /// locally before anything touches the network.
    pub async fn send(&self, payload: &serde_json::Value) -> Result<()> {
        anyhow::ensure!(
            payload.is_object(),
            "queue payload must be a JSON object, got: {payload}"
        );
        let body = serde_json::to_string(payload).context("failed to serialise queue payload")?;
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .context("SQS SendMessage")?;
        debug!(queue_url = %self.queue_url, "job enqueued");
        Ok(())
    }

    /// Typed convenience for the one message shape producers use.
    pub async fn send_job(&self, job: &CopyJob) -> Result<()> {
        self.send(&serde_json::to_value(job).context("failed to encode copy job")?)
            .await
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Classify an SQS receive failure.  A service-level rejection (bad
/// credentials, missing queue, malformed request) cannot be fixed by
/// retrying and must terminate the process; transport-level failures are
/// retried after a short pause.
fn is_fatal_sqs_error<E, R>(err: &aws_sdk_sqs::error::SdkError<E, R>) -> bool {
    matches!(err, aws_sdk_sqs::error::SdkError::ServiceError(_))
}

pub struct QueueListener {
    client: Client,
    queue_url: String,
    batch_size: i32,
    visibility_timeout_secs: i32,
}

impl QueueListener {
    pub fn new(
        client: Client,
        queue_url: String,
        batch_size: i32,
        visibility_timeout_secs: i32,
    ) -> Self {
        Self {
            client,
            queue_url,
            batch_size,
            visibility_timeout_secs,
        }
    }

    /// Reset a message's lease to the full visibility window.  Called before
    /// a copy starts so that queueing latency never eats into the window,
    /// and available to long-running handlers that need more time.
    pub async fn extend_lease(&self, receipt_handle: &str, secs: i32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(secs)
            .send()
            .await
            .context("SQS ChangeMessageVisibility")?;
        Ok(())
    }

    /// Long-lived consumer loop.  Fetches up to `batch_size` messages with a
    /// 20 s long poll, runs `handler` on each concurrently, and acks only on
    /// handler success; failures leave the message for SQS redelivery.
    ///
    /// Returns only on a fatal queue error.
    pub async fn run<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(String) -> Fut + Send + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        info!(queue_url = %self.queue_url, "queue listener started");
        loop {
            let received = self
                .client
                .receive_message()
                .queue_url(&self.queue_url)
                .max_number_of_messages(self.batch_size)
                .wait_time_seconds(20)
                .send()
                .await;

            let output = match received {
                Ok(output) => output,
                Err(err) if is_fatal_sqs_error(&err) => {
                    error!(error = %aws_sdk_sqs::error::DisplayErrorContext(&err), "fatal queue API error");
                    return Err(err).context("SQS ReceiveMessage rejected");
                }
                Err(err) => {
                    warn!(error = %aws_sdk_sqs::error::DisplayErrorContext(&err), "transient queue receive failure");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let messages = output.messages.unwrap_or_default();
            if messages.is_empty() {
                continue;
            }
            debug!(count = messages.len(), "received copy jobs");

            let work = messages.into_iter().map(|message| {
                let handler = &handler;
                async move {
                    let body = message.body.unwrap_or_default();
                    if let Some(ref receipt) = message.receipt_handle {
                        if let Err(e) = self.extend_lease(receipt, self.visibility_timeout_secs).await {
                            warn!(error = %format!("{e:#}"), "failed to extend message lease");
                        }
                    }
                    match handler(body).await {
                        Ok(()) => {
                            if let Some(receipt) = message.receipt_handle {
                                if let Err(e) = self
                                    .client
                                    .delete_message()
                                    .queue_url(&self.queue_url)
                                    .receipt_handle(receipt)
                                    .send()
                                    .await
                                {
                                    warn!(error = %aws_sdk_sqs::error::DisplayErrorContext(&e), "failed to ack message");
                                }
                            }
                        }
                        Err(e) => {
                            // Leave unacked: the visibility timeout returns the
                            // message to the queue and the redrive policy caps
                            // redelivery.
                            warn!(error = %format!("{e:#}"), "copy job failed, leaving for redelivery");
                        }
                    }
                }
            });
            futures::future::join_all(work).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Dead-letter drain
// ---------------------------------------------------------------------------

/// Drain the dead-letter queue, counting each message.  The raw body is
/// logged rather than parsed, because a parse failure may be exactly why the
/// message dead-lettered.
pub async fn run_dead_letter_listener(
    client: Client,
    dead_letter_url: String,
    metrics: MetricsRegistry,
    pool_id: String,
) {
    info!(queue_url = %dead_letter_url, "dead-letter listener started");
    let labels = PoolLabels::new(&pool_id);
    loop {
        let received = client
            .receive_message()
            .queue_url(&dead_letter_url)
            .max_number_of_messages(10)
            .wait_time_seconds(20)
            .send()
            .await;

        let output = match received {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %aws_sdk_sqs::error::DisplayErrorContext(&err), "dead-letter receive failure");
                tokio::time::sleep(Duration::from_secs(30)).await;
                continue;
            }
        };

        for message in output.messages.unwrap_or_default() {
            metrics.metrics.dead_letters.get_or_create(&labels).inc();
            warn!(
                pool = %pool_id,
                body = %message.body.as_deref().unwrap_or("<empty>"),
                "copy job exhausted redelivery"
            );
            if let Some(receipt) = message.receipt_handle {
                let _ = client
                    .delete_message()
                    .queue_url(&dead_letter_url)
                    .receipt_handle(receipt)
                    .send()
                    .await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Depth probe
// ---------------------------------------------------------------------------

/// Periodically observe queue depth and publish it as gauges.
pub async fn run_depth_probe(
    client: Client,
    queue_url: String,
    metrics: MetricsRegistry,
    pool_id: String,
) {
    let probe_interval = Duration::from_secs(30);
    let labels = PoolLabels::new(&pool_id);
    loop {
        match client
            .get_queue_attributes()
            .queue_url(&queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
        {
            Ok(output) => {
                let attrs = output.attributes.unwrap_or_default();
                let visible = attrs
                    .get(&QueueAttributeName::ApproximateNumberOfMessages)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                let inflight = attrs
                    .get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0);
                metrics
                    .metrics
                    .queue_depth_visible
                    .get_or_create(&labels)
                    .set(visible);
                metrics
                    .metrics
                    .queue_depth_inflight
                    .get_or_create(&labels)
                    .set(inflight);
                debug!(pool = %pool_id, visible, inflight, "queue depth probed");
            }
            Err(err) => {
                warn!(error = %aws_sdk_sqs::error::DisplayErrorContext(&err), "queue depth probe failed");
            }
        }
        tokio::time::sleep(probe_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_job_serialises_to_the_wire_shape() {
        let job = CopyJob::put("s3_us-west-1", "https://origin.example/artifact");
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": "s3_us-west-1",
                "url": "https://origin.example/artifact",
                "action": "put",
            })
        );
    }

    #[test]
    fn copy_job_round_trips() {
        let job = CopyJob::put("s3_us-east-1", "https://origin.example/a");
        let body = serde_json::to_string(&job).unwrap();
        let parsed: CopyJob = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed, job);
    }

    #[tokio::test]
    async fn sender_rejects_non_object_payloads() {
        let config = aws_sdk_sqs::Config::builder()
            .behavior_version(aws_sdk_sqs::config::BehaviorVersion::latest())
            .region(aws_sdk_sqs::config::Region::new("us-east-1"))
            .build();
        let sender = QueueSender::new(
            Client::from_conf(config),
            "https://sqs.invalid/queue".to_string(),
        );
        // Fails locally, before any request is dispatched.
        assert!(sender.send(&serde_json::json!("just a string")).await.is_err());
        assert!(sender.send(&serde_json::json!(42)).await.is_err());
        assert!(sender.send(&serde_json::json!(["a", "b"])).await.is_err());
    }
}
