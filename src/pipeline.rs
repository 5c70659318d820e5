use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::adapters::{validate_webhook_url, DEFAULT_ALLOWED_WEBHOOK_HOSTS};
use crate::error::{ConfigError, SubmitError};
use crate::router::RateRouter;
use crate::signing::derive_idempotency_key;
use crate::stores::{Begin, Stores};
use crate::types::{
    Channel, ChannelConfig, ChannelMode, ChannelState, ChannelStatus, DeadLetterEntry,
    IdempotencyKey, IdempotencyRecord, Job, JobKey, SubmitReceipt, SubmitState, TenantId,
};
use crate::worker::{worker_loop, AttemptOutcome, DeliveryReport, Task, WorkerContext};

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

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    pub max_in_flight: usize,
    /// Total attempts per (job, channel), initial attempt included.
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_ms: u64,
    pub idempotency_ttl_secs: u64,
    /// Operator webhook notified (best-effort) on dead-lettering.
    pub alert_webhook_url: Option<String>,
    /// Trusted host suffixes for BYO webhook URLs.
    pub allowed_webhook_hosts: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            queue_size: 1_000,
            max_in_flight: 100,
            max_attempts: 5,
            retry_base_ms: 1_000,
            retry_max_ms: 60_000,
            retry_jitter_ms: 250,
            idempotency_ttl_secs: 24 * 60 * 60,
            alert_webhook_url: None,
            allowed_webhook_hosts: DEFAULT_ALLOWED_WEBHOOK_HOSTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// A job submission as received from a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub tenant_id: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub template: String,
    pub channels: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Per-job aggregation state held by the scheduler.
#[derive(Debug, Clone)]
struct JobProgress {
    expected: Vec<Channel>,
    states: HashMap<Channel, ChannelState>,
}

type ProgressMap = Arc<RwLock<HashMap<JobKey, JobProgress>>>;

/// The multi-tenant post dispatch pipeline.
///
/// Owns the ready queue, the worker pool, and the scheduler task that
/// applies retry backoff and aggregates per-channel outcomes into the
/// idempotency cache.
pub struct Pipeline {
    ready_tx: Option<mpsc::Sender<Task>>,
    is_running: Arc<AtomicBool>,
    worker_handles: Vec<JoinHandle<()>>,
    scheduler_handle: Option<JoinHandle<()>>,
    scheduler_shutdown: Arc<Notify>,
    progress: ProgressMap,
    stores: Stores,
    config: PipelineConfig,
}

impl Pipeline {
    /// Pipeline backed by in-memory stores.
    pub fn new(config: PipelineConfig) -> Self {
        Self::build(config, Stores::in_memory())
    }

    /// Pipeline backed by injected stores; replays journaled pending
    /// tasks so a restart resumes at-least-once delivery.
    pub async fn new_with_stores(config: PipelineConfig, stores: Stores) -> Self {
        let pipeline = Self::build(config, stores);
        let pending = pipeline.stores.journal.load_pending().await;
        for task in pending {
            pipeline.track_queued(&task).await;
            if let Some(tx) = pipeline.ready_tx.as_ref() {
                let _ = tx.send(task).await;
            }
        }
        pipeline
    }

    fn build(config: PipelineConfig, stores: Stores) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(config.queue_size.max(1));
        let shared_ready_rx = Arc::new(Mutex::new(ready_rx));
        let (report_tx, report_rx) = mpsc::channel(config.queue_size.max(1));

        let router = RateRouter::new(stores.config.clone(), stores.counters.clone());
        let ctx = Arc::new(WorkerContext {
            global_semaphore: Arc::new(Semaphore::new(config.max_in_flight)),
            config_store: stores.config.clone(),
            router,
            max_attempts: config.max_attempts.max(1),
            report_tx,
            #[cfg(feature = "http")]
            http_client: reqwest::Client::new(),
        });

        let mut worker_handles = Vec::new();
        for _ in 0..config.worker_count.max(1) {
            worker_handles.push(tokio::spawn(worker_loop(
                shared_ready_rx.clone(),
                ctx.clone(),
            )));
        }

        let progress: ProgressMap = Arc::new(RwLock::new(HashMap::new()));
        let scheduler_shutdown = Arc::new(Notify::new());

        let scheduler_handle = tokio::spawn(scheduler_loop(
            report_rx,
            ready_tx.clone(),
            progress.clone(),
            stores.clone(),
            config.clone(),
            scheduler_shutdown.clone(),
        ));

        Self {
            ready_tx: Some(ready_tx),
            is_running: Arc::new(AtomicBool::new(true)),
            worker_handles,
            scheduler_handle: Some(scheduler_handle),
            scheduler_shutdown,
            progress,
            stores,
            config,
        }
    }

    /// Validate, deduplicate, and enqueue a job submission.
    ///
    /// Dispatch is asynchronous: the receipt acknowledges acceptance per
    /// channel, or returns the cached per-channel outcome when the same
    /// (tenant, idempotency key) already completed within its TTL.
    pub async fn submit(&self, submission: Submission) -> Result<SubmitReceipt, SubmitError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(SubmitError::Shutdown);
        }

        let tenant_id = TenantId(submission.tenant_id.clone());
        if !self.stores.config.tenant_exists(&tenant_id).await {
            metric_inc("post.submit.rejected");
            return Err(SubmitError::UnknownTenant(submission.tenant_id));
        }

        if submission.channels.is_empty() {
            metric_inc("post.submit.rejected");
            return Err(SubmitError::EmptyChannels);
        }

        let mut channels: Vec<Channel> = Vec::new();
        for name in &submission.channels {
            let channel: Channel = name
                .parse()
                .map_err(|_| SubmitError::UnknownChannel(name.clone()))?;
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }

        let idempotency_key = IdempotencyKey(match submission.idempotency_key {
            Some(key) => key,
            None => derive_idempotency_key(&tenant_id, &submission.template, &submission.payload),
        });
        let key = JobKey::new(tenant_id.clone(), idempotency_key.clone());

        // Reservation-at-accept: a burst of identical submissions
        // enqueues at most one job before the first completes.
        let prior = match self.stores.idempotency.begin(&key, now_secs()).await {
            Begin::Cached(record) => {
                metric_inc("post.submit.cached");
                return Ok(SubmitReceipt {
                    key,
                    results: record
                        .results
                        .into_iter()
                        .map(|(channel, status)| (channel, SubmitState::Cached(status)))
                        .collect(),
                });
            }
            Begin::InFlight => {
                metric_inc("post.submit.in_flight");
                return Ok(SubmitReceipt {
                    key,
                    results: channels
                        .iter()
                        .map(|&channel| (channel, SubmitState::Accepted))
                        .collect(),
                });
            }
            Begin::Reserved(prior) => prior,
        };

        let job = Job {
            tenant_id,
            idempotency_key,
            template: submission.template,
            channels: channels.clone(),
            payload: submission.payload,
        };

        // Channels already terminal from an earlier partially-deferred
        // cycle are acknowledged from their recorded state and never
        // re-attempted; everything else gets a fresh task. Terminal
        // outcomes come from local progress or from the parked record a
        // previous instance left in the shared store.
        let mut results = BTreeMap::new();
        let mut to_enqueue = Vec::new();
        {
            let mut guard = self.progress.write().await;
            let entry = guard.entry(key.clone()).or_insert_with(|| JobProgress {
                expected: Vec::new(),
                states: HashMap::new(),
            });
            entry.expected = channels.clone();

            for &channel in &channels {
                if let Some(state) = entry.states.get(&channel) {
                    if state.status.is_terminal() {
                        results.insert(channel, SubmitState::Cached(state.status));
                        continue;
                    }
                }
                if let Some(status) = prior
                    .as_ref()
                    .and_then(|record| record.results.get(&channel))
                    .copied()
                    .filter(ChannelStatus::is_terminal)
                {
                    entry.states.insert(
                        channel,
                        ChannelState {
                            status,
                            attempts: 0,
                            last_error: None,
                            last_updated_secs: now_secs(),
                        },
                    );
                    results.insert(channel, SubmitState::Cached(status));
                    continue;
                }
                entry.states.insert(
                    channel,
                    ChannelState {
                        status: ChannelStatus::Queued,
                        attempts: 0,
                        last_error: None,
                        last_updated_secs: now_secs(),
                    },
                );
                results.insert(channel, SubmitState::Accepted);
                to_enqueue.push(Task {
                    job: job.clone(),
                    channel,
                    attempt: 0,
                });
            }
        }

        if to_enqueue.is_empty() {
            // Nothing left to dispatch; finalize straight away.
            finalize_if_settled(&key, &self.progress, &self.stores, &self.config).await;
            return Ok(SubmitReceipt { key, results });
        }

        let Some(ready_tx) = self.ready_tx.as_ref() else {
            self.abandon_reservation(&key, prior.is_some()).await;
            return Err(SubmitError::Shutdown);
        };

        // All-or-nothing admission: reserve a queue slot per task before
        // sending any, so a rejected submission never leaves part of the
        // job enqueued.
        let mut permits = Vec::with_capacity(to_enqueue.len());
        for _ in &to_enqueue {
            match ready_tx.try_reserve() {
                Ok(permit) => permits.push(permit),
                Err(mpsc::error::TrySendError::Full(())) => {
                    drop(permits);
                    self.abandon_reservation(&key, prior.is_some()).await;
                    metric_inc("post.submit.backpressure");
                    return Err(SubmitError::Backpressure);
                }
                Err(mpsc::error::TrySendError::Closed(())) => {
                    drop(permits);
                    self.abandon_reservation(&key, prior.is_some()).await;
                    return Err(SubmitError::Shutdown);
                }
            }
        }

        for (task, permit) in to_enqueue.into_iter().zip(permits) {
            self.stores.journal.record_enqueue(&task).await;
            permit.send(task);
            metric_inc("post.submit.enqueued");
        }

        trace_event("post.submit.accepted");
        Ok(SubmitReceipt { key, results })
    }

    /// Register a tenant. Submissions for unknown tenants are rejected.
    pub async fn register_tenant(&self, tenant_id: &TenantId) {
        self.stores.config.register_tenant(tenant_id).await;
    }

    /// Administrative: set routing for a (tenant, channel). BYO webhook
    /// URLs are validated against the trusted host allow-list here, so
    /// dispatch can trust stored configs.
    pub async fn configure_channel(
        &self,
        tenant_id: &TenantId,
        channel: Channel,
        config: ChannelConfig,
    ) -> Result<(), ConfigError> {
        if config.mode == ChannelMode::ByoWebhook {
            let url = config.webhook_url.as_deref().unwrap_or("");
            validate_webhook_url(url, &self.config.allowed_webhook_hosts)?;
        }
        self.stores
            .config
            .put_channel_config(tenant_id, channel, config)
            .await;
        Ok(())
    }

    /// Administrative: override a channel's daily quota for a tenant.
    pub async fn set_rate_limit_override(&self, tenant_id: &TenantId, channel: Channel, limit: u32) {
        self.stores
            .config
            .put_limit_override(tenant_id, channel, limit)
            .await;
    }

    /// Read-only dead-letter listing for operator inspection.
    pub async fn dead_letters(
        &self,
        tenant_id: Option<&TenantId>,
        channel: Option<Channel>,
    ) -> Vec<DeadLetterEntry> {
        self.stores.dead_letters.list(tenant_id, channel).await
    }

    /// Manually replay a dead-lettered (job, channel) pair with a fresh
    /// retry budget. Returns false when no matching entry exists.
    pub async fn replay_dead_letter(&self, key: &JobKey, channel: Channel) -> bool {
        let Some(entry) = self.stores.dead_letters.remove(key, channel).await else {
            return false;
        };

        let job = Job {
            tenant_id: entry.key.tenant_id.clone(),
            idempotency_key: entry.key.idempotency_key.clone(),
            template: entry.template,
            channels: vec![channel],
            payload: entry.payload,
        };
        let task = Task { job, channel, attempt: 0 };

        self.track_queued(&task).await;
        self.stores.journal.record_enqueue(&task).await;

        match self.ready_tx.as_ref() {
            Some(tx) => tx.send(task).await.is_ok(),
            None => false,
        }
    }

    /// Per-channel status for a job, if the pipeline has seen it.
    pub async fn job_status(&self, key: &JobKey) -> Option<BTreeMap<Channel, ChannelState>> {
        let guard = self.progress.read().await;
        guard.get(key).map(|progress| {
            progress
                .states
                .iter()
                .map(|(&channel, state)| (channel, state.clone()))
                .collect()
        })
    }

    /// Cached final outcome for a (tenant, idempotency key), if any.
    pub async fn cached_result(&self, key: &JobKey) -> Option<IdempotencyRecord> {
        self.stores.idempotency.get(key, now_secs()).await
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Graceful shutdown: stop accepting, let workers drain, stop the
    /// scheduler. Unfinished tasks stay journaled for the next start.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.ready_tx.take();

        self.scheduler_shutdown.notify_one();
        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.await;
        }

        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
    }

    /// Drop a reservation taken by a submission that did not enqueue.
    /// A key carrying previously recorded outcomes is parked instead of
    /// released, so those outcomes survive for the next resubmission.
    async fn abandon_reservation(&self, key: &JobKey, has_prior: bool) {
        if has_prior {
            self.stores
                .idempotency
                .complete(
                    key,
                    IdempotencyRecord {
                        results: BTreeMap::new(),
                        created_at_secs: now_secs(),
                        ttl_secs: self.config.idempotency_ttl_secs,
                        partial: true,
                    },
                )
                .await;
        } else {
            self.stores.idempotency.release(key).await;
        }
    }

    async fn track_queued(&self, task: &Task) {
        let key = task.job.key();
        let mut guard = self.progress.write().await;
        let entry = guard.entry(key).or_insert_with(|| JobProgress {
            expected: Vec::new(),
            states: HashMap::new(),
        });
        if !entry.expected.contains(&task.channel) {
            entry.expected.push(task.channel);
        }
        entry.states.insert(
            task.channel,
            ChannelState {
                status: ChannelStatus::Queued,
                attempts: task.attempt,
                last_error: None,
                last_updated_secs: now_secs(),
            },
        );
    }
}

#[derive(Debug)]
struct TimedTask {
    ready_at: Instant,
    task: Task,
}

impl Eq for TimedTask {}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

async fn scheduler_loop(
    mut report_rx: mpsc::Receiver<DeliveryReport>,
    retry_tx: mpsc::Sender<Task>,
    progress: ProgressMap,
    stores: Stores,
    config: PipelineConfig,
    shutdown: Arc<Notify>,
) {
    let mut delay_heap: BinaryHeap<TimedTask> = BinaryHeap::new();

    loop {
        let next_ready = delay_heap.peek().map(|t| t.ready_at);
        let sleep_target =
            next_ready.unwrap_or_else(|| Instant::now() + Duration::from_secs(3_600));

        tokio::select! {
            maybe_report = report_rx.recv() => {
                let Some(report) = maybe_report else { break };
                handle_report(report, &progress, &stores, &config, &mut delay_heap).await;
            }
            _ = sleep_until(sleep_target), if next_ready.is_some() => {
                let now = Instant::now();
                while let Some(timed) = delay_heap.peek() {
                    if timed.ready_at > now {
                        break;
                    }
                    let timed = delay_heap.pop().expect("peeked");
                    // Send failure means shutdown; the journal keeps the
                    // task for replay on the next start.
                    let _ = retry_tx.send(timed.task).await;
                }
            }
            _ = shutdown.notified() => {
                while let Ok(report) = report_rx.try_recv() {
                    handle_report(report, &progress, &stores, &config, &mut delay_heap).await;
                }
                break;
            }
        }
    }
}

async fn handle_report(
    report: DeliveryReport,
    progress: &ProgressMap,
    stores: &Stores,
    config: &PipelineConfig,
    delay_heap: &mut BinaryHeap<TimedTask>,
) {
    let key = report.task.job.key();

    match report.outcome {
        AttemptOutcome::Delivered => {
            stores.journal.record_settled(&report.task).await;
            stores
                .idempotency
                .record_channel(&key, report.task.channel, ChannelStatus::Delivered)
                .await;
            update_state(progress, &key, &report.task, ChannelStatus::Delivered, None).await;
            metric_inc("post.job.delivered");
        }
        AttemptOutcome::FallbackRequired => {
            stores.journal.record_settled(&report.task).await;
            stores
                .idempotency
                .record_channel(&key, report.task.channel, ChannelStatus::FallbackRequired)
                .await;
            update_state(
                progress,
                &key,
                &report.task,
                ChannelStatus::FallbackRequired,
                None,
            )
            .await;
            metric_inc("post.job.fallback_required");
        }
        AttemptOutcome::Deferred => {
            stores.journal.record_settled(&report.task).await;
            update_state(progress, &key, &report.task, ChannelStatus::Deferred, None).await;
            metric_inc("post.job.deferred");
        }
        AttemptOutcome::Retryable(reason) => {
            let delay = retry_delay_for_attempt(report.task.attempt, config);
            let jitter = jitter_delay(config.retry_jitter_ms);
            delay_heap.push(TimedTask {
                ready_at: Instant::now() + delay + jitter,
                task: report.task.clone(),
            });
            update_state(
                progress,
                &key,
                &report.task,
                ChannelStatus::Retrying,
                Some(reason.to_string()),
            )
            .await;
            metric_inc("post.job.retry_scheduled");
            return;
        }
        AttemptOutcome::DeadLetter(reason) => {
            stores.journal.record_settled(&report.task).await;
            stores
                .idempotency
                .record_channel(&key, report.task.channel, ChannelStatus::DeadLettered)
                .await;
            let entry = DeadLetterEntry {
                key: key.clone(),
                channel: report.task.channel,
                template: report.task.job.template.clone(),
                payload: report.task.job.payload.clone(),
                failure: reason.to_string(),
                attempts: report.task.attempt,
                last_attempt_secs: now_secs(),
            };
            stores.dead_letters.push(entry.clone()).await;
            metric_inc("post.job.dead_lettered");
            notify_operator(config, &entry);
            update_state(
                progress,
                &key,
                &report.task,
                ChannelStatus::DeadLettered,
                Some(reason.to_string()),
            )
            .await;
        }
    }

    finalize_if_settled(&key, progress, stores, config).await;
}

async fn update_state(
    progress: &ProgressMap,
    key: &JobKey,
    task: &Task,
    status: ChannelStatus,
    last_error: Option<String>,
) {
    let mut guard = progress.write().await;
    let entry = guard.entry(key.clone()).or_insert_with(|| JobProgress {
        expected: vec![task.channel],
        states: HashMap::new(),
    });
    entry.states.insert(
        task.channel,
        ChannelState {
            status,
            attempts: task.attempt,
            last_error,
            last_updated_secs: now_secs(),
        },
    );
}

/// Once every expected channel has settled for this cycle, cache the
/// aggregated per-channel map. A cycle containing a deferred channel is
/// not final: the key is parked with the terminal outcomes reached so
/// far, so a resubmission (from any instance) retries the deferred
/// channels once quota allows and never re-dispatches the rest.
async fn finalize_if_settled(
    key: &JobKey,
    progress: &ProgressMap,
    stores: &Stores,
    config: &PipelineConfig,
) {
    let (all_settled, any_deferred, results) = {
        let guard = progress.read().await;
        let Some(entry) = guard.get(key) else { return };

        let mut results = BTreeMap::new();
        let mut all_settled = true;
        let mut any_deferred = false;
        for channel in &entry.expected {
            match entry.states.get(channel) {
                Some(state) if state.status.is_settled() => {
                    if state.status == ChannelStatus::Deferred {
                        any_deferred = true;
                    }
                    results.insert(*channel, state.status);
                }
                _ => {
                    all_settled = false;
                    break;
                }
            }
        }
        (all_settled, any_deferred, results)
    };

    if !all_settled {
        return;
    }

    if any_deferred {
        let terminal: BTreeMap<Channel, ChannelStatus> = results
            .into_iter()
            .filter(|(_, status)| status.is_terminal())
            .collect();
        stores
            .idempotency
            .complete(
                key,
                IdempotencyRecord {
                    results: terminal,
                    created_at_secs: now_secs(),
                    ttl_secs: config.idempotency_ttl_secs,
                    partial: true,
                },
            )
            .await;
        trace_event("post.job.cycle_deferred");
        return;
    }

    // Merge over any earlier record (e.g. a dead-letter replay updating
    // a single channel) so previously cached channels are preserved.
    let mut merged = stores
        .idempotency
        .get(key, now_secs())
        .await
        .map(|record| record.results)
        .unwrap_or_default();
    merged.extend(results);

    stores
        .idempotency
        .complete(
            key,
            IdempotencyRecord {
                results: merged,
                created_at_secs: now_secs(),
                ttl_secs: config.idempotency_ttl_secs,
                partial: false,
            },
        )
        .await;

    // The cached record now answers status reads for this key.
    progress.write().await.remove(key);
    metric_inc("post.job.finalized");
}

/// Best-effort operator alert on dead-lettering. Failure to notify
/// never affects job state.
#[cfg(feature = "http")]
fn notify_operator(config: &PipelineConfig, entry: &DeadLetterEntry) {
    let Some(url) = config.alert_webhook_url.clone() else {
        return;
    };
    let body = serde_json::json!({
        "tenant_id": entry.key.tenant_id.0,
        "channel": entry.channel.as_str(),
        "failure": entry.failure,
        "attempts": entry.attempts,
    });
    // Alerts are rare (one per dead letter); a throwaway client is fine.
    tokio::spawn(async move {
        let _ = reqwest::Client::new()
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(10))
            .send()
            .await;
    });
}

#[cfg(not(feature = "http"))]
fn notify_operator(config: &PipelineConfig, _entry: &DeadLetterEntry) {
    if config.alert_webhook_url.is_some() {
        trace_event("post.dlq.alert_skipped");
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(0);
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

/// Exponential backoff: base * 2^(attempt-1), capped.
fn retry_delay_for_attempt(attempt: u32, config: &PipelineConfig) -> Duration {
    let base = config.retry_base_ms.max(1);
    let max = config.retry_max_ms.max(base);
    let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base.saturating_mul(pow).min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: u64, max: u64) -> PipelineConfig {
        PipelineConfig {
            retry_base_ms: base,
            retry_max_ms: max,
            ..Default::default()
        }
    }

    #[test]
    fn backoff_grows_strictly_until_cap() {
        let config = config(1_000, 60_000);
        let mut previous = Duration::from_millis(0);
        for attempt in 1..=5 {
            let delay = retry_delay_for_attempt(attempt, &config);
            assert!(delay > previous, "attempt {attempt} did not back off");
            previous = delay;
        }
        assert_eq!(retry_delay_for_attempt(1, &config), Duration::from_millis(1_000));
        assert_eq!(retry_delay_for_attempt(3, &config), Duration::from_millis(4_000));
    }

    #[test]
    fn backoff_is_capped() {
        let config = config(1_000, 4_000);
        assert_eq!(retry_delay_for_attempt(10, &config), Duration::from_millis(4_000));
        // Overflow-prone attempts still clamp.
        assert_eq!(retry_delay_for_attempt(64, &config), Duration::from_millis(4_000));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        assert_eq!(jitter_delay(0), Duration::from_millis(0));
        for _ in 0..100 {
            assert!(jitter_delay(50) <= Duration::from_millis(50));
        }
    }
}
