use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::types::{
    Channel, ChannelConfig, ChannelStatus, DeadLetterEntry, IdempotencyRecord, JobKey, TenantId,
};
use crate::worker::Task;

/// Per-tenant routing configuration. Read during dispatch; mutated only
/// through the pipeline's admin methods.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn tenant_exists(&self, tenant_id: &TenantId) -> bool;
    async fn channel_config(&self, tenant_id: &TenantId, channel: Channel) -> Option<ChannelConfig>;
    async fn limit_override(&self, tenant_id: &TenantId, channel: Channel) -> Option<u32>;

    async fn register_tenant(&self, tenant_id: &TenantId);
    async fn put_channel_config(&self, tenant_id: &TenantId, channel: Channel, config: ChannelConfig);
    async fn put_limit_override(&self, tenant_id: &TenantId, channel: Channel, limit: u32);
}

/// Per-(tenant, channel, day) usage counters. Increments must be atomic:
/// many consumer instances may deliver for the same tenant concurrently.
#[async_trait]
pub trait RateCounterStore: Send + Sync {
    async fn usage(&self, tenant_id: &TenantId, channel: Channel, day: &str) -> u32;
    async fn increment(&self, tenant_id: &TenantId, channel: Channel, day: &str) -> u32;
}

/// Result of attempting to reserve an idempotency key at accept time.
#[derive(Debug, Clone)]
pub enum Begin {
    /// Key unseen, expired, or parked after a deferred cycle; the caller
    /// now holds the reservation. Carries the parked record's terminal
    /// channel outcomes when there was one.
    Reserved(Option<IdempotencyRecord>),
    /// A reservation exists but no record yet; dispatch is in flight.
    InFlight,
    /// A completed record exists within its TTL window.
    Cached(IdempotencyRecord),
}

/// Maps (tenant, idempotency key) to prior responses with bounded TTL.
///
/// `begin` writes a reservation so a burst of concurrent identical
/// submissions enqueues at most one job before the first completes.
/// Terminal channel outcomes are recorded against the open reservation
/// as they happen, so they survive instance crashes and deferred cycles
/// in the shared backends.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn begin(&self, key: &JobKey, now_secs: u64) -> Begin;

    /// Record one channel's terminal outcome against the open
    /// reservation. Only the reservation holder dispatches a key, so
    /// writes for a given key never race across instances.
    async fn record_channel(&self, key: &JobKey, channel: Channel, status: ChannelStatus);

    /// Store the aggregated record, merging in any outcomes recorded
    /// against the reservation (the record's own entries win). A record
    /// with `partial` set parks the key instead of finalizing it: `get`
    /// ignores it and the next `begin` re-reserves, returning it.
    async fn complete(&self, key: &JobKey, record: IdempotencyRecord);

    /// Drop the reservation without caching a record; a later
    /// resubmission of the same key will dispatch again.
    async fn release(&self, key: &JobKey);

    async fn get(&self, key: &JobKey, now_secs: u64) -> Option<IdempotencyRecord>;
}

/// Terminal failure records, retained until an operator replays them.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn push(&self, entry: DeadLetterEntry);
    async fn list(&self, tenant_id: Option<&TenantId>, channel: Option<Channel>) -> Vec<DeadLetterEntry>;
    async fn remove(&self, key: &JobKey, channel: Channel) -> Option<DeadLetterEntry>;
}

/// At-least-once journal for queued tasks, replayed on startup.
#[async_trait]
pub trait JobJournal: Send + Sync {
    async fn record_enqueue(&self, task: &Task);
    async fn record_settled(&self, task: &Task);
    async fn load_pending(&self) -> Vec<Task>;
}

/// Bundle of store handles injected into the pipeline.
#[derive(Clone)]
pub struct Stores {
    pub config: Arc<dyn ConfigStore>,
    pub counters: Arc<dyn RateCounterStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub journal: Arc<dyn JobJournal>,
}

impl Stores {
    /// In-memory stores for tests and lightweight deployments.
    pub fn in_memory() -> Self {
        let memory = Arc::new(InMemoryStores::new());
        Self {
            config: memory.clone(),
            counters: memory.clone(),
            idempotency: memory.clone(),
            dead_letters: memory.clone(),
            journal: memory,
        }
    }
}

enum IdempotencySlot {
    /// Open reservation plus the terminal outcomes recorded so far.
    Reserved(BTreeMap<Channel, ChannelStatus>),
    Completed(IdempotencyRecord),
}

/// In-memory backing for every store trait.
#[derive(Default)]
pub struct InMemoryStores {
    tenants: Mutex<HashSet<TenantId>>,
    configs: Mutex<HashMap<(TenantId, Channel), ChannelConfig>>,
    overrides: Mutex<HashMap<(TenantId, Channel), u32>>,
    counters: Mutex<HashMap<(TenantId, Channel, String), u32>>,
    idempotency: Mutex<HashMap<JobKey, IdempotencySlot>>,
    dead_letters: Mutex<Vec<DeadLetterEntry>>,
    pending: Mutex<Vec<Task>>,
}

impl InMemoryStores {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for InMemoryStores {
    async fn tenant_exists(&self, tenant_id: &TenantId) -> bool {
        self.tenants.lock().await.contains(tenant_id)
    }

    async fn channel_config(&self, tenant_id: &TenantId, channel: Channel) -> Option<ChannelConfig> {
        let guard = self.configs.lock().await;
        guard.get(&(tenant_id.clone(), channel)).cloned()
    }

    async fn limit_override(&self, tenant_id: &TenantId, channel: Channel) -> Option<u32> {
        let guard = self.overrides.lock().await;
        guard.get(&(tenant_id.clone(), channel)).copied()
    }

    async fn register_tenant(&self, tenant_id: &TenantId) {
        self.tenants.lock().await.insert(tenant_id.clone());
    }

    async fn put_channel_config(&self, tenant_id: &TenantId, channel: Channel, config: ChannelConfig) {
        let mut guard = self.configs.lock().await;
        guard.insert((tenant_id.clone(), channel), config);
    }

    async fn put_limit_override(&self, tenant_id: &TenantId, channel: Channel, limit: u32) {
        let mut guard = self.overrides.lock().await;
        guard.insert((tenant_id.clone(), channel), limit);
    }
}

#[async_trait]
impl RateCounterStore for InMemoryStores {
    async fn usage(&self, tenant_id: &TenantId, channel: Channel, day: &str) -> u32 {
        let guard = self.counters.lock().await;
        guard
            .get(&(tenant_id.clone(), channel, day.to_string()))
            .copied()
            .unwrap_or(0)
    }

    async fn increment(&self, tenant_id: &TenantId, channel: Channel, day: &str) -> u32 {
        let mut guard = self.counters.lock().await;
        let count = guard
            .entry((tenant_id.clone(), channel, day.to_string()))
            .or_insert(0);
        *count += 1;
        *count
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStores {
    async fn begin(&self, key: &JobKey, now_secs: u64) -> Begin {
        let mut guard = self.idempotency.lock().await;
        match guard.get(key) {
            Some(IdempotencySlot::Reserved(_)) => Begin::InFlight,
            Some(IdempotencySlot::Completed(record)) if !record.is_expired(now_secs) => {
                if record.partial {
                    // Parked after a deferred cycle: re-reserve, keeping
                    // the terminal outcomes already reached.
                    let record = record.clone();
                    guard.insert(
                        key.clone(),
                        IdempotencySlot::Reserved(record.results.clone()),
                    );
                    Begin::Reserved(Some(record))
                } else {
                    Begin::Cached(record.clone())
                }
            }
            _ => {
                guard.insert(key.clone(), IdempotencySlot::Reserved(BTreeMap::new()));
                Begin::Reserved(None)
            }
        }
    }

    async fn record_channel(&self, key: &JobKey, channel: Channel, status: ChannelStatus) {
        let mut guard = self.idempotency.lock().await;
        if let Some(IdempotencySlot::Reserved(results)) = guard.get_mut(key) {
            results.insert(channel, status);
        }
    }

    async fn complete(&self, key: &JobKey, record: IdempotencyRecord) {
        let mut guard = self.idempotency.lock().await;
        let mut merged = match guard.get(key) {
            Some(IdempotencySlot::Reserved(results)) => results.clone(),
            _ => BTreeMap::new(),
        };
        merged.extend(record.results.clone());
        guard.insert(
            key.clone(),
            IdempotencySlot::Completed(IdempotencyRecord {
                results: merged,
                ..record
            }),
        );
    }

    async fn release(&self, key: &JobKey) {
        let mut guard = self.idempotency.lock().await;
        if matches!(guard.get(key), Some(IdempotencySlot::Reserved(_))) {
            guard.remove(key);
        }
    }

    async fn get(&self, key: &JobKey, now_secs: u64) -> Option<IdempotencyRecord> {
        let guard = self.idempotency.lock().await;
        match guard.get(key) {
            Some(IdempotencySlot::Completed(record))
                if !record.partial && !record.is_expired(now_secs) =>
            {
                Some(record.clone())
            }
            _ => None,
        }
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryStores {
    async fn push(&self, entry: DeadLetterEntry) {
        self.dead_letters.lock().await.push(entry);
    }

    async fn list(&self, tenant_id: Option<&TenantId>, channel: Option<Channel>) -> Vec<DeadLetterEntry> {
        let guard = self.dead_letters.lock().await;
        guard
            .iter()
            .filter(|entry| tenant_id.map_or(true, |t| &entry.key.tenant_id == t))
            .filter(|entry| channel.map_or(true, |c| entry.channel == c))
            .cloned()
            .collect()
    }

    async fn remove(&self, key: &JobKey, channel: Channel) -> Option<DeadLetterEntry> {
        let mut guard = self.dead_letters.lock().await;
        let index = guard
            .iter()
            .position(|entry| &entry.key == key && entry.channel == channel)?;
        Some(guard.remove(index))
    }
}

#[async_trait]
impl JobJournal for InMemoryStores {
    async fn record_enqueue(&self, task: &Task) {
        self.pending.lock().await.push(task.clone());
    }

    async fn record_settled(&self, task: &Task) {
        let mut pending = self.pending.lock().await;
        pending.retain(|t| t.job.key() != task.job.key() || t.channel != task.channel);
    }

    async fn load_pending(&self) -> Vec<Task> {
        self.pending.lock().await.clone()
    }
}
