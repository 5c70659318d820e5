use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::adapters::{adapter_for, publish};
use crate::error::{FailureReason, PublishError};
use crate::router::RateRouter;
use crate::stores::ConfigStore;
use crate::types::{Channel, ChannelMode, Job};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "tracing")]
fn trace_event(message: &'static str) {
    tracing::info!(message);
}

#[cfg(not(feature = "tracing"))]
fn trace_event(_message: &'static str) {}

/// A unit of work consumed by workers: one delivery attempt for one
/// (job, channel) pair. A job naming three channels becomes three
/// independent tasks, so one channel's failure never blocks another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub job: Job,
    pub channel: Channel,
    pub attempt: u32,
}

/// What the worker observed for a single attempt. The scheduler owns
/// retry policy; the worker only classifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    FallbackRequired,
    Deferred,
    /// Transient failure with retry budget remaining.
    Retryable(FailureReason),
    /// Permanent failure or exhausted budget.
    DeadLetter(FailureReason),
}

/// Result of a single delivery attempt, sent to the scheduler.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub task: Task,
    pub outcome: AttemptOutcome,
}

/// Shared, read-only context for all workers.
pub struct WorkerContext {
    /// Global in-flight delivery limiter.
    pub global_semaphore: Arc<Semaphore>,

    /// Routing configuration, read-only during dispatch.
    pub config_store: Arc<dyn ConfigStore>,

    /// Daily-quota router.
    pub router: RateRouter,

    /// Total attempts allowed per (job, channel), initial included.
    pub max_attempts: u32,

    /// Reports from workers to the scheduler.
    pub report_tx: mpsc::Sender<DeliveryReport>,

    /// HTTP client for real delivery.
    #[cfg(feature = "http")]
    pub http_client: reqwest::Client,
}

/// Main worker loop.
///
/// Each worker pulls tasks from the shared ready queue, performs one
/// delivery attempt, and reports the classification back. Backoff
/// waits happen in the scheduler, never while holding a permit.
pub async fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Task>>>, ctx: Arc<WorkerContext>) {
    loop {
        let task = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(task) = task else { break };

        let report = process_task(task, &ctx).await;
        let _ = ctx.report_tx.send(report).await;
    }
}

/// Process a single delivery attempt for one (job, channel) pair.
async fn process_task(mut task: Task, ctx: &WorkerContext) -> DeliveryReport {
    let config = ctx
        .config_store
        .channel_config(&task.job.tenant_id, task.channel)
        .await;

    let config = match config {
        Some(config) if config.mode != ChannelMode::Unconfigured => config,
        _ => {
            metric_inc("post.delivery.fallback");
            return DeliveryReport {
                task,
                outcome: AttemptOutcome::FallbackRequired,
            };
        }
    };

    // Self-throttle before the call, not in reaction to a 429: platform
    // daily quotas are hard ceilings and overshooting risks suspension.
    if ctx.router.should_defer(&task.job.tenant_id, task.channel).await {
        metric_inc("post.delivery.deferred");
        return DeliveryReport {
            task,
            outcome: AttemptOutcome::Deferred,
        };
    }

    let permit = match ctx.global_semaphore.acquire().await {
        Ok(permit) => permit,
        Err(_) => {
            return DeliveryReport {
                task,
                outcome: AttemptOutcome::Retryable(FailureReason::Network),
            };
        }
    };

    task.attempt += 1;

    let adapter = adapter_for(task.channel);
    #[cfg(feature = "http")]
    let result = publish(adapter, &config, &task.job, &ctx.http_client).await;
    #[cfg(not(feature = "http"))]
    let result = publish(adapter, &config, &task.job).await;

    // Release before any scheduler-side backoff.
    drop(permit);

    match result {
        Ok(()) => {
            // Counted only after confirmed delivery; retries of a failed
            // attempt never inflate the quota.
            ctx.router
                .record_delivery(&task.job.tenant_id, task.channel)
                .await;
            metric_inc("post.delivery.delivered");
            trace_event("post.delivery.delivered");
            DeliveryReport {
                task,
                outcome: AttemptOutcome::Delivered,
            }
        }
        Err(PublishError::NotConfigured) => DeliveryReport {
            task,
            outcome: AttemptOutcome::FallbackRequired,
        },
        Err(PublishError::Permanent(reason)) => {
            metric_inc("post.delivery.permanent_failure");
            DeliveryReport {
                task,
                outcome: AttemptOutcome::DeadLetter(reason),
            }
        }
        Err(PublishError::Transient(reason)) => {
            metric_inc("post.delivery.transient_failure");
            trace_event("post.delivery.transient_failure");
            if task.attempt >= ctx.max_attempts {
                DeliveryReport {
                    task,
                    outcome: AttemptOutcome::DeadLetter(FailureReason::MaxAttemptsExceeded),
                }
            } else {
                DeliveryReport {
                    task,
                    outcome: AttemptOutcome::Retryable(reason),
                }
            }
        }
    }
}
