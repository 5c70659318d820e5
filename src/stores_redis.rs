use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::stores::{
    Begin, ConfigStore, DeadLetterStore, IdempotencyStore, JobJournal, RateCounterStore, Stores,
};
use crate::types::{
    Channel, ChannelConfig, ChannelStatus, DeadLetterEntry, IdempotencyRecord, JobKey, TenantId,
};
use crate::worker::Task;

/// Stored value for one idempotency key: either an open reservation
/// (with the terminal outcomes recorded so far) or a completed record.
#[derive(Serialize, Deserialize)]
enum IdempotencySlot {
    Reserved(BTreeMap<Channel, ChannelStatus>),
    Completed(IdempotencyRecord),
}

/// Counters expire well after the day they cover; lazy rollover means
/// a stale day is simply never read again.
const COUNTER_TTL_SECS: usize = 2 * 86_400;

/// Redis-backed stores for multi-instance deployments. All operations
/// are best-effort: a connection failure degrades to defaults rather
/// than failing the dispatch path.
pub struct RedisStores {
    client: redis::Client,
    prefix: String,
}

impl RedisStores {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    /// One shared redis backing for every store trait.
    pub fn into_stores(self) -> Stores {
        let redis = Arc::new(self);
        Stores {
            config: redis.clone(),
            counters: redis.clone(),
            idempotency: redis.clone(),
            dead_letters: redis.clone(),
            journal: redis,
        }
    }

    async fn conn(&self) -> Option<redis::aio::Connection> {
        self.client.get_tokio_connection().await.ok()
    }

    fn tenants_key(&self) -> String {
        format!("{}:tenants", self.prefix)
    }

    fn config_key(&self) -> String {
        format!("{}:config", self.prefix)
    }

    fn overrides_key(&self) -> String {
        format!("{}:overrides", self.prefix)
    }

    fn counter_key(&self, tenant_id: &TenantId, channel: Channel, day: &str) -> String {
        format!("{}:count:{}|{}|{}", self.prefix, tenant_id.0, channel, day)
    }

    fn idempotency_key(&self, key: &JobKey) -> String {
        format!("{}:idem:{}|{}", self.prefix, key.tenant_id.0, key.idempotency_key.0)
    }

    fn dlq_key(&self) -> String {
        format!("{}:dlq", self.prefix)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    fn channel_field(tenant_id: &TenantId, channel: Channel) -> String {
        format!("{}|{}", tenant_id.0, channel)
    }
}

#[async_trait]
impl ConfigStore for RedisStores {
    async fn tenant_exists(&self, tenant_id: &TenantId) -> bool {
        let Some(mut conn) = self.conn().await else { return false };
        conn.sismember(self.tenants_key(), &tenant_id.0)
            .await
            .unwrap_or(false)
    }

    async fn channel_config(&self, tenant_id: &TenantId, channel: Channel) -> Option<ChannelConfig> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn
            .hget(self.config_key(), Self::channel_field(tenant_id, channel))
            .await
            .ok()
            .flatten();
        value.and_then(|v| serde_json::from_str(&v).ok())
    }

    async fn limit_override(&self, tenant_id: &TenantId, channel: Channel) -> Option<u32> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn
            .hget(self.overrides_key(), Self::channel_field(tenant_id, channel))
            .await
            .ok()
            .flatten();
        value.and_then(|v| v.parse().ok())
    }

    async fn register_tenant(&self, tenant_id: &TenantId) {
        let Some(mut conn) = self.conn().await else { return };
        let _: redis::RedisResult<i64> = conn.sadd(self.tenants_key(), &tenant_id.0).await;
    }

    async fn put_channel_config(&self, tenant_id: &TenantId, channel: Channel, config: ChannelConfig) {
        let Some(mut conn) = self.conn().await else { return };
        let _: redis::RedisResult<i64> = conn
            .hset(
                self.config_key(),
                Self::channel_field(tenant_id, channel),
                serde_json::to_string(&config).unwrap_or_default(),
            )
            .await;
    }

    async fn put_limit_override(&self, tenant_id: &TenantId, channel: Channel, limit: u32) {
        let Some(mut conn) = self.conn().await else { return };
        let _: redis::RedisResult<i64> = conn
            .hset(
                self.overrides_key(),
                Self::channel_field(tenant_id, channel),
                limit.to_string(),
            )
            .await;
    }
}

#[async_trait]
impl RateCounterStore for RedisStores {
    async fn usage(&self, tenant_id: &TenantId, channel: Channel, day: &str) -> u32 {
        let Some(mut conn) = self.conn().await else { return 0 };
        let value: Option<String> = conn
            .get(self.counter_key(tenant_id, channel, day))
            .await
            .ok()
            .flatten();
        value.and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    async fn increment(&self, tenant_id: &TenantId, channel: Channel, day: &str) -> u32 {
        let Some(mut conn) = self.conn().await else { return 0 };
        let key = self.counter_key(tenant_id, channel, day);
        // INCR is atomic across consumer instances.
        let count: u32 = conn.incr(&key, 1u32).await.unwrap_or(0);
        if count == 1 {
            let _: redis::RedisResult<bool> = conn.expire(&key, COUNTER_TTL_SECS).await;
        }
        count
    }
}

#[async_trait]
impl IdempotencyStore for RedisStores {
    async fn begin(&self, key: &JobKey, now_secs: u64) -> Begin {
        let Some(mut conn) = self.conn().await else {
            return Begin::Reserved(None);
        };
        let redis_key = self.idempotency_key(key);
        let empty = serde_json::to_string(&IdempotencySlot::Reserved(BTreeMap::new()))
            .unwrap_or_default();

        // SETNX makes the reservation race-free across instances.
        let reserved: bool = conn.set_nx(&redis_key, &empty).await.unwrap_or(false);
        if reserved {
            return Begin::Reserved(None);
        }

        let value: Option<String> = conn.get(&redis_key).await.ok().flatten();
        match value.and_then(|v| serde_json::from_str::<IdempotencySlot>(&v).ok()) {
            Some(IdempotencySlot::Reserved(_)) => Begin::InFlight,
            Some(IdempotencySlot::Completed(record)) if !record.is_expired(now_secs) => {
                if record.partial {
                    // Parked after a deferred cycle: re-reserve, keeping
                    // the terminal outcomes already reached.
                    let seeded = serde_json::to_string(&IdempotencySlot::Reserved(
                        record.results.clone(),
                    ))
                    .unwrap_or_default();
                    let _: redis::RedisResult<()> = conn.set(&redis_key, seeded).await;
                    Begin::Reserved(Some(record))
                } else {
                    Begin::Cached(record)
                }
            }
            _ => {
                let _: redis::RedisResult<()> = conn.set(&redis_key, &empty).await;
                Begin::Reserved(None)
            }
        }
    }

    async fn record_channel(&self, key: &JobKey, channel: Channel, status: ChannelStatus) {
        let Some(mut conn) = self.conn().await else { return };
        let redis_key = self.idempotency_key(key);
        // Read-modify-write is safe: only the reservation holder writes
        // this key until it completes or parks.
        let value: Option<String> = conn.get(&redis_key).await.ok().flatten();
        if let Some(IdempotencySlot::Reserved(mut results)) =
            value.and_then(|v| serde_json::from_str(&v).ok())
        {
            results.insert(channel, status);
            let _: redis::RedisResult<()> = conn
                .set(
                    &redis_key,
                    serde_json::to_string(&IdempotencySlot::Reserved(results))
                        .unwrap_or_default(),
                )
                .await;
        }
    }

    async fn complete(&self, key: &JobKey, record: IdempotencyRecord) {
        let Some(mut conn) = self.conn().await else { return };
        let redis_key = self.idempotency_key(key);

        let value: Option<String> = conn.get(&redis_key).await.ok().flatten();
        let mut merged = match value.and_then(|v| serde_json::from_str(&v).ok()) {
            Some(IdempotencySlot::Reserved(results)) => results,
            _ => BTreeMap::new(),
        };
        merged.extend(record.results.clone());

        let slot = IdempotencySlot::Completed(IdempotencyRecord {
            results: merged,
            ..record
        });
        let _: redis::RedisResult<()> = conn
            .set_ex(
                redis_key,
                serde_json::to_string(&slot).unwrap_or_default(),
                record.ttl_secs as usize,
            )
            .await;
    }

    async fn release(&self, key: &JobKey) {
        let Some(mut conn) = self.conn().await else { return };
        let redis_key = self.idempotency_key(key);
        let value: Option<String> = conn.get(&redis_key).await.ok().flatten();
        if matches!(
            value.and_then(|v| serde_json::from_str(&v).ok()),
            Some(IdempotencySlot::Reserved(_))
        ) {
            let _: redis::RedisResult<i64> = conn.del(&redis_key).await;
        }
    }

    async fn get(&self, key: &JobKey, now_secs: u64) -> Option<IdempotencyRecord> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(self.idempotency_key(key)).await.ok().flatten();
        match value.and_then(|v| serde_json::from_str::<IdempotencySlot>(&v).ok()) {
            Some(IdempotencySlot::Completed(record))
                if !record.partial && !record.is_expired(now_secs) =>
            {
                Some(record)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl DeadLetterStore for RedisStores {
    async fn push(&self, entry: DeadLetterEntry) {
        let Some(mut conn) = self.conn().await else { return };
        let _: redis::RedisResult<i64> = conn
            .rpush(self.dlq_key(), serde_json::to_string(&entry).unwrap_or_default())
            .await;
    }

    async fn list(&self, tenant_id: Option<&TenantId>, channel: Option<Channel>) -> Vec<DeadLetterEntry> {
        let Some(mut conn) = self.conn().await else { return Vec::new() };
        let values: Vec<String> = conn.lrange(self.dlq_key(), 0, -1).await.unwrap_or_default();
        values
            .into_iter()
            .filter_map(|v| serde_json::from_str::<DeadLetterEntry>(&v).ok())
            .filter(|entry| tenant_id.map_or(true, |t| &entry.key.tenant_id == t))
            .filter(|entry| channel.map_or(true, |c| entry.channel == c))
            .collect()
    }

    async fn remove(&self, key: &JobKey, channel: Channel) -> Option<DeadLetterEntry> {
        let mut conn = self.conn().await?;
        let values: Vec<String> = conn.lrange(self.dlq_key(), 0, -1).await.unwrap_or_default();
        for value in values {
            if let Ok(entry) = serde_json::from_str::<DeadLetterEntry>(&value) {
                if &entry.key == key && entry.channel == channel {
                    let _: redis::RedisResult<i64> = conn.lrem(self.dlq_key(), 1, value).await;
                    return Some(entry);
                }
            }
        }
        None
    }
}

#[async_trait]
impl JobJournal for RedisStores {
    async fn record_enqueue(&self, task: &Task) {
        let Some(mut conn) = self.conn().await else { return };
        let _: redis::RedisResult<i64> = conn
            .rpush(self.pending_key(), serde_json::to_string(task).unwrap_or_default())
            .await;
    }

    async fn record_settled(&self, task: &Task) {
        let Some(mut conn) = self.conn().await else { return };
        let key = task.job.key();
        let values: Vec<String> = conn
            .lrange(self.pending_key(), 0, -1)
            .await
            .unwrap_or_default();
        for value in values {
            if let Ok(pending) = serde_json::from_str::<Task>(&value) {
                if pending.job.key() == key && pending.channel == task.channel {
                    let _: redis::RedisResult<i64> = conn.lrem(self.pending_key(), 1, value).await;
                    break;
                }
            }
        }
    }

    async fn load_pending(&self) -> Vec<Task> {
        let Some(mut conn) = self.conn().await else { return Vec::new() };
        let values: Vec<String> = conn
            .lrange(self.pending_key(), 0, -1)
            .await
            .unwrap_or_default();
        values
            .into_iter()
            .filter_map(|v| serde_json::from_str::<Task>(&v).ok())
            .collect()
    }
}
