//! Fleet controller: one cache pool per configured region.
//!
//! For each region the controller builds a regional S3 client and bucket,
//! a cache manager, a queue sender, and `backend.count` copy workers bound
//! to the region's queue, plus a dead-letter listener and a queue-depth
//! probe.  Pool ids key all routing; registering the same pool twice is a
//! misconfiguration the process refuses to start with.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cache::manager::pool_id;
use crate::cache::CacheManager;
use crate::config::Config;
use crate::coordination::status::StatusStore;
use crate::metrics::MetricsRegistry;
use crate::queue::{self, CopyJob, QueueListener, QueueSender};
use crate::storage::BlobStore;
use crate::validate;

/// The running fleet: routing table plus every background task it spawned.
pub struct Fleet {
    pub pools: HashMap<String, Arc<CacheManager>>,
    /// Primary queue URL per pool, exposed for health checks.
    pub queue_urls: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Fleet {
    /// Abort every worker, listener, and probe.  In-flight multipart
    /// uploads are abandoned; the bucket lifecycle sweeps their parts.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        info!(tasks = self.tasks.len(), "fleet stopped");
    }
}

/// Construct and start one (manager, workers) pair per region.
pub async fn build_and_start(
    config: Arc<Config>,
    aws_config: &aws_config::SdkConfig,
    status_store: StatusStore,
    metrics: MetricsRegistry,
    http_client: reqwest::Client,
    validator_client: reqwest::Client,
) -> Result<Fleet> {
    let allowlist = validate::compile_allowlist(&config.redirect.allowed_patterns)?;
    let sqs = aws_sdk_sqs::Client::new(aws_config);
    let node_id = crate::coordination::node::node_id();

    let mut pools: HashMap<String, Arc<CacheManager>> = HashMap::new();
    let mut queue_urls = Vec::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    for region in config.region_list() {
        let id = pool_id(&config.service, &region);

        // Regional S3 client and bucket.
        let s3_config = aws_sdk_s3::config::Builder::from(aws_config)
            .region(aws_config::Region::new(region.clone()))
            .build();
        let s3_client = aws_sdk_s3::Client::from_conf(s3_config);
        let bucket = config.bucket.name_template.replace("{region}", &region);

        let blob = BlobStore::new(
            s3_client,
            bucket,
            region.clone(),
            config.bucket.acl.clone(),
            config.upload.part_size,
            config.upload.queue_size,
            Duration::from_secs(config.upload.max_copy_secs),
        );
        blob.init(config.bucket.lifespan_days)
            .await
            .with_context(|| format!("failed to initialise bucket for {id}"))?;

        // Regional queue pair.
        let queue_name = format!("{}-{}", config.queue.name, region);
        let urls = queue::initialize(
            &sqs,
            &queue_name,
            &config.queue.dead_letter_suffix,
            config.queue.max_receive_count,
            config.queue.visibility_timeout_secs,
        )
        .await
        .with_context(|| format!("failed to initialise queue for {id}"))?;
        queue_urls.push(urls.queue_url.clone());

        let manager = Arc::new(CacheManager::new(
            config.service.clone(),
            region.clone(),
            status_store.clone(),
            blob,
            QueueSender::new(sqs.clone(), urls.queue_url.clone()),
            metrics.clone(),
            http_client.clone(),
            validator_client.clone(),
            allowlist.clone(),
            config.cache.ttl,
            config.redirect.limit,
            config.redirect.ensure_ssl,
            Duration::from_secs(config.upload.inactivity_timeout_secs),
            node_id.clone(),
        ));

        if pools.insert(id.clone(), Arc::clone(&manager)).is_some() {
            anyhow::bail!("duplicate cache pool registered: {id}");
        }

        // Copy workers.
        for worker in 0..config.backend.count {
            let listener = QueueListener::new(
                sqs.clone(),
                urls.queue_url.clone(),
                config.queue.batch_size,
                config.queue.visibility_timeout_secs as i32,
            );
            let manager = Arc::clone(&manager);
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                let outcome = listener
                    .run(|body| {
                        let manager = Arc::clone(&manager);
                        async move { handle_job(&manager, &body).await }
                    })
                    .await;
                if let Err(e) = outcome {
                    // Queue API rejections require operator intervention.
                    error!(pool = %id, worker, error = %format!("{e:#}"), "copy worker hit a fatal queue error");
                    std::process::exit(1);
                }
            }));
        }

        // Dead-letter drain and depth probe.
        tasks.push(tokio::spawn(queue::run_dead_letter_listener(
            sqs.clone(),
            urls.dead_letter_url.clone(),
            metrics.clone(),
            id.clone(),
        )));
        tasks.push(tokio::spawn(queue::run_depth_probe(
            sqs.clone(),
            urls.queue_url.clone(),
            metrics.clone(),
            id.clone(),
        )));

        info!(pool = %id, workers = config.backend.count, "cache pool started");
    }

    Ok(Fleet {
        pools,
        queue_urls,
        tasks,
    })
}

/// Decode and dispatch one queue message.  An undecodable body or a job
/// addressed to another pool is an error: the message rides the redelivery
/// path until the dead-letter queue absorbs it.
async fn handle_job(manager: &CacheManager, body: &str) -> Result<()> {
    let job: CopyJob =
        serde_json::from_str(body).with_context(|| format!("undecodable copy job: {body:?}"))?;
    anyhow::ensure!(
        job.id == manager.pool_id,
        "job addressed to pool {} arrived on {}",
        job.id,
        manager.pool_id
    );
    anyhow::ensure!(job.action == "put", "unsupported job action: {:?}", job.action);
    manager.put(&job.url).await
}
