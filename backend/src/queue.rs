//! Workflow job queue.
//!
//! A single logical queue with at-least-once delivery: messages are handed to
//! the registered handler by a bounded worker pool, and a failing delivery is
//! re-enqueued with exponential backoff until its attempt budget is spent.
//! Delayed delivery (wait continuations, per-action delays) is a timer in
//! front of the same channel — workers never sleep while holding a message.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;

/// Where a continuation dequeue picks up inside a workflow's action list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "action_id")]
pub enum ResumePoint {
    /// Resume with the action following this one (wait continuation).
    AfterAction(Uuid),
    /// Resume at this action; its pre-execution delay has been served.
    AtAction(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJobMessage {
    pub job_id: Uuid,
    pub resume: Option<ResumePoint>,
}

impl WorkflowJobMessage {
    pub fn initial(job_id: Uuid) -> Self {
        Self {
            job_id,
            resume: None,
        }
    }

    pub fn resume_after(job_id: Uuid, action_id: Uuid) -> Self {
        Self {
            job_id,
            resume: Some(ResumePoint::AfterAction(action_id)),
        }
    }

    pub fn resume_at(job_id: Uuid, action_id: Uuid) -> Self {
        Self {
            job_id,
            resume: Some(ResumePoint::AtAction(action_id)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub delay: Duration,
    pub attempts: u32,
    /// Base delay for exponential backoff between redeliveries.
    pub backoff: Duration,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            attempts: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

impl EnqueueOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

/// The queue interface the engine consumes. Production uses [`JobQueue`];
/// tests substitute a recording implementation.
#[async_trait]
pub trait WorkflowQueue: Send + Sync {
    async fn enqueue(&self, message: WorkflowJobMessage, options: EnqueueOptions)
    -> anyhow::Result<()>;
}

/// Handler invoked once per delivery. An `Err` triggers redelivery.
pub type JobHandler =
    Arc<dyn Fn(WorkflowJobMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug)]
struct Envelope {
    message: WorkflowJobMessage,
    attempt: u32,
    options: EnqueueOptions,
}

/// In-process queue backed by an unbounded channel plus a semaphore-bounded
/// worker pool.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl JobQueue {
    /// Create the queue and start its dispatcher.
    pub fn start(config: QueueConfig, handler: JobHandler) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self { tx: tx.clone() };

        tokio::spawn(dispatch_loop(rx, tx, config, handler));

        queue
    }

    fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| anyhow::anyhow!("workflow queue is shut down"))
    }
}

#[async_trait]
impl WorkflowQueue for JobQueue {
    async fn enqueue(
        &self,
        message: WorkflowJobMessage,
        options: EnqueueOptions,
    ) -> anyhow::Result<()> {
        let envelope = Envelope {
            message,
            attempt: 1,
            options,
        };

        if envelope.options.delay.is_zero() {
            return self.send(envelope);
        }

        let tx = self.tx.clone();
        let delay = envelope.options.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(envelope).is_err() {
                warn!("delayed enqueue dropped: queue is shut down");
            }
        });

        Ok(())
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    tx: mpsc::UnboundedSender<Envelope>,
    config: QueueConfig,
    handler: JobHandler,
) {
    let limit = Arc::new(Semaphore::new(config.workers.max(1)));
    info!("workflow queue started with {} worker(s)", config.workers);

    while let Some(envelope) = rx.recv().await {
        let permit = match limit.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break, // semaphore closed, shutting down
        };

        let handler = handler.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let job_id = envelope.message.job_id;
            let attempt = envelope.attempt;

            match handler(envelope.message.clone()).await {
                Ok(()) => {}
                Err(err) if attempt < envelope.options.attempts => {
                    let backoff = retry_backoff(envelope.options.backoff, attempt);
                    warn!(
                        "job {} attempt {}/{} failed: {} — retrying in {:?}",
                        job_id, attempt, envelope.options.attempts, err, backoff
                    );

                    let retry = Envelope {
                        message: envelope.message,
                        attempt: attempt + 1,
                        options: envelope.options,
                    };
                    tokio::spawn(async move {
                        tokio::time::sleep(backoff).await;
                        if tx.send(retry).is_err() {
                            warn!("retry for job {} dropped: queue is shut down", job_id);
                        }
                    });
                }
                Err(err) => {
                    error!(
                        "job {} exhausted {} attempt(s), dropping: {}",
                        job_id, envelope.options.attempts, err
                    );
                }
            }
        });
    }
}

/// Exponential backoff before redelivery `attempt + 1`. The exponent is
/// capped so large attempt budgets saturate instead of overflowing.
fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    const MAX_EXPONENT: u32 = 16;
    let factor = 2u32.pow(attempt.saturating_sub(1).min(MAX_EXPONENT));
    base.saturating_mul(factor)
}
