//! Ingest pipeline: routes attribute updates to their evaluator and persists
//! the resulting classification.
//!
//! Updates are sharded by attribute key onto a fixed set of sequential
//! queues, so one key never has two evaluations in flight while different
//! keys proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::model::{AttributeKey, AttributeUpdate, Classification};
use crate::ports::{AlertSink, ClassificationSink, HistoryStore};
use crate::watch::WatchRegistry;

/// Synchronous evaluation core shared by every shard.
pub struct Engine {
    registry: Arc<WatchRegistry>,
    history: Arc<dyn HistoryStore>,
    classifications: Arc<dyn ClassificationSink>,
    alerts: Arc<dyn AlertSink>,
}

impl Engine {
    pub fn new(
        registry: Arc<WatchRegistry>,
        history: Arc<dyn HistoryStore>,
        classifications: Arc<dyn ClassificationSink>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            registry,
            history,
            classifications,
            alerts,
        }
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    /// Evaluate one update. Returns `None` for attributes that are not
    /// watched; those are ignored.
    pub fn process(&self, update: &AttributeUpdate) -> Result<Option<Classification>> {
        let key = update.key();
        let Some(watched) = self.registry.get(&key) else {
            trace!(%key, "update for unwatched attribute");
            return Ok(None);
        };

        let classification = watched.evaluator().evaluate(
            update.value.as_ref(),
            update.timestamp,
            self.history.as_ref(),
            self.alerts.as_ref(),
        );
        debug!(
            entity_id = %key.entity_id,
            attribute = %key.attribute_name,
            timestamp = update.timestamp,
            classification = %classification,
            "update classified"
        );

        self.classifications
            .record_classification(&key, classification, update.timestamp)
            .with_context(|| format!("failed to persist classification for {}", key))?;
        Ok(Some(classification))
    }
}

type Reply = oneshot::Sender<Result<Option<Classification>>>;

struct Job {
    update: AttributeUpdate,
    reply: Option<Reply>,
}

/// Cloneable submission side of a running pipeline.
#[derive(Clone)]
pub struct IngestHandle {
    shards: Arc<Vec<mpsc::Sender<Job>>>,
}

impl IngestHandle {
    /// Queue an update without waiting for its classification. Waits only
    /// when the target shard is full.
    pub async fn submit(&self, update: AttributeUpdate) -> Result<()> {
        self.enqueue(Job { update, reply: None }).await
    }

    /// Queue an update and wait for its classification.
    pub async fn evaluate(&self, update: AttributeUpdate) -> Result<Option<Classification>> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Job {
            update,
            reply: Some(tx),
        })
        .await?;
        rx.await.map_err(|_| anyhow!("ingest worker dropped the update"))?
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    async fn enqueue(&self, job: Job) -> Result<()> {
        let shard = shard_for(&job.update.key(), self.shards.len());
        self.shards[shard]
            .send(job)
            .await
            .map_err(|_| anyhow!("ingest pipeline is shut down"))
    }
}

fn shard_for(key: &AttributeKey, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

pub struct IngestPipeline {
    handle: IngestHandle,
    workers: Vec<JoinHandle<()>>,
}

impl IngestPipeline {
    /// Start `workers` shards, each with a queue of `queue_capacity` updates.
    /// Must be called inside a tokio runtime.
    pub fn spawn(engine: Arc<Engine>, workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(queue_capacity);
            senders.push(tx);
            handles.push(tokio::spawn(run_shard(shard, engine.clone(), rx)));
        }
        info!(workers, queue_capacity, "ingest pipeline started");

        Self {
            handle: IngestHandle {
                shards: Arc::new(senders),
            },
            workers: handles,
        }
    }

    pub fn handle(&self) -> IngestHandle {
        self.handle.clone()
    }

    /// Close the queues and wait for queued updates to drain. Outstanding
    /// handles keep their shards open until they are dropped.
    pub async fn shutdown(self) {
        drop(self.handle);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "ingest worker ended abnormally");
            }
        }
        info!("ingest pipeline stopped");
    }
}

async fn run_shard(shard: usize, engine: Arc<Engine>, mut rx: mpsc::Receiver<Job>) {
    while let Some(Job { update, reply }) = rx.recv().await {
        let key = update.key();
        let engine = engine.clone();
        // History reads block; keep them off the async workers.
        let result = match tokio::task::spawn_blocking(move || engine.process(&update)).await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("evaluation task failed: {}", e)),
        };
        if let Err(e) = &result {
            warn!(shard, %key, error = %e, "update processing failed");
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }
    debug!(shard, "ingest shard stopped");
}
