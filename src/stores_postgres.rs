use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_postgres::Client;

use crate::stores::{
    Begin, ConfigStore, DeadLetterStore, IdempotencyStore, JobJournal, RateCounterStore, Stores,
};
use crate::types::{
    Channel, ChannelConfig, ChannelStatus, DeadLetterEntry, IdempotencyRecord, JobKey, TenantId,
};
use crate::worker::Task;

/// Stored payload for one idempotency key: either an open reservation
/// (with the terminal outcomes recorded so far) or a completed record.
#[derive(Serialize, Deserialize)]
enum IdempotencySlot {
    Reserved(BTreeMap<Channel, ChannelStatus>),
    Completed(IdempotencyRecord),
}

/// Postgres-backed stores. Schema is created on construction; reads and
/// writes after that are best-effort, mirroring the dispatch path's
/// tolerance for storage hiccups.
pub struct PostgresStores {
    client: Client,
}

impl PostgresStores {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS post_tenants (
                    id TEXT PRIMARY KEY
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS post_config (
                    tenant TEXT NOT NULL,
                    channel TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    PRIMARY KEY (tenant, channel)
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS post_overrides (
                    tenant TEXT NOT NULL,
                    channel TEXT NOT NULL,
                    max_daily INT NOT NULL,
                    PRIMARY KEY (tenant, channel)
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS post_counters (
                    tenant TEXT NOT NULL,
                    channel TEXT NOT NULL,
                    day TEXT NOT NULL,
                    count INT NOT NULL,
                    PRIMARY KEY (tenant, channel, day)
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS post_idempotency (
                    id TEXT PRIMARY KEY,
                    payload JSONB
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS post_dlq (
                    id TEXT PRIMARY KEY,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS post_pending (
                    id TEXT PRIMARY KEY,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        Ok(Self { client })
    }

    /// One shared postgres backing for every store trait.
    pub fn into_stores(self) -> Stores {
        let postgres = Arc::new(self);
        Stores {
            config: postgres.clone(),
            counters: postgres.clone(),
            idempotency: postgres.clone(),
            dead_letters: postgres.clone(),
            journal: postgres,
        }
    }

    fn key_id(key: &JobKey) -> String {
        format!("{}|{}", key.tenant_id.0, key.idempotency_key.0)
    }

    fn task_id(task: &Task) -> String {
        format!(
            "{}|{}|{}",
            task.job.tenant_id.0, task.job.idempotency_key.0, task.channel
        )
    }

    fn dlq_id(key: &JobKey, channel: Channel) -> String {
        format!("{}|{}|{}", key.tenant_id.0, key.idempotency_key.0, channel)
    }
}

#[async_trait]
impl ConfigStore for PostgresStores {
    async fn tenant_exists(&self, tenant_id: &TenantId) -> bool {
        self.client
            .query_opt("SELECT 1 FROM post_tenants WHERE id = $1", &[&tenant_id.0])
            .await
            .ok()
            .flatten()
            .is_some()
    }

    async fn channel_config(&self, tenant_id: &TenantId, channel: Channel) -> Option<ChannelConfig> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM post_config WHERE tenant = $1 AND channel = $2",
                &[&tenant_id.0, &channel.as_str()],
            )
            .await
            .ok()
            .flatten()?;
        let payload: serde_json::Value = row.try_get(0).ok()?;
        serde_json::from_value(payload).ok()
    }

    async fn limit_override(&self, tenant_id: &TenantId, channel: Channel) -> Option<u32> {
        let row = self
            .client
            .query_opt(
                "SELECT max_daily FROM post_overrides WHERE tenant = $1 AND channel = $2",
                &[&tenant_id.0, &channel.as_str()],
            )
            .await
            .ok()
            .flatten()?;
        let limit: i32 = row.try_get(0).ok()?;
        u32::try_from(limit).ok()
    }

    async fn register_tenant(&self, tenant_id: &TenantId) {
        let _ = self
            .client
            .execute(
                "INSERT INTO post_tenants (id) VALUES ($1) ON CONFLICT (id) DO NOTHING",
                &[&tenant_id.0],
            )
            .await;
    }

    async fn put_channel_config(&self, tenant_id: &TenantId, channel: Channel, config: ChannelConfig) {
        let payload = serde_json::to_value(&config).unwrap_or_default();
        let _ = self
            .client
            .execute(
                "INSERT INTO post_config (tenant, channel, payload)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (tenant, channel) DO UPDATE SET payload = EXCLUDED.payload",
                &[&tenant_id.0, &channel.as_str(), &payload],
            )
            .await;
    }

    async fn put_limit_override(&self, tenant_id: &TenantId, channel: Channel, limit: u32) {
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        let _ = self
            .client
            .execute(
                "INSERT INTO post_overrides (tenant, channel, max_daily)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (tenant, channel) DO UPDATE SET max_daily = EXCLUDED.max_daily",
                &[&tenant_id.0, &channel.as_str(), &limit],
            )
            .await;
    }
}

#[async_trait]
impl RateCounterStore for PostgresStores {
    async fn usage(&self, tenant_id: &TenantId, channel: Channel, day: &str) -> u32 {
        let row = self
            .client
            .query_opt(
                "SELECT count FROM post_counters WHERE tenant = $1 AND channel = $2 AND day = $3",
                &[&tenant_id.0, &channel.as_str(), &day],
            )
            .await
            .ok()
            .flatten();
        row.and_then(|r| r.try_get::<_, i32>(0).ok())
            .and_then(|c| u32::try_from(c).ok())
            .unwrap_or(0)
    }

    async fn increment(&self, tenant_id: &TenantId, channel: Channel, day: &str) -> u32 {
        // Single-statement upsert keeps the increment atomic under
        // concurrent deliveries from many consumer instances.
        let row = self
            .client
            .query_opt(
                "INSERT INTO post_counters (tenant, channel, day, count)
                 VALUES ($1, $2, $3, 1)
                 ON CONFLICT (tenant, channel, day)
                 DO UPDATE SET count = post_counters.count + 1
                 RETURNING count",
                &[&tenant_id.0, &channel.as_str(), &day],
            )
            .await
            .ok()
            .flatten();
        row.and_then(|r| r.try_get::<_, i32>(0).ok())
            .and_then(|c| u32::try_from(c).ok())
            .unwrap_or(0)
    }
}

#[async_trait]
impl IdempotencyStore for PostgresStores {
    async fn begin(&self, key: &JobKey, now_secs: u64) -> Begin {
        let id = Self::key_id(key);
        let empty = serde_json::to_value(IdempotencySlot::Reserved(BTreeMap::new()))
            .unwrap_or_default();

        // Insert succeeding means the caller holds the reservation.
        let inserted = self
            .client
            .execute(
                "INSERT INTO post_idempotency (id, payload) VALUES ($1, $2)
                 ON CONFLICT (id) DO NOTHING",
                &[&id, &empty],
            )
            .await
            .unwrap_or(0);
        if inserted == 1 {
            return Begin::Reserved(None);
        }

        let row = self
            .client
            .query_opt("SELECT payload FROM post_idempotency WHERE id = $1", &[&id])
            .await
            .ok()
            .flatten();
        let Some(row) = row else { return Begin::Reserved(None) };
        let slot = row
            .try_get::<_, serde_json::Value>(0)
            .ok()
            .and_then(|v| serde_json::from_value::<IdempotencySlot>(v).ok());
        match slot {
            Some(IdempotencySlot::Reserved(_)) => Begin::InFlight,
            Some(IdempotencySlot::Completed(record)) if !record.is_expired(now_secs) => {
                if record.partial {
                    // Parked after a deferred cycle: re-reserve, keeping
                    // the terminal outcomes already reached.
                    let seeded =
                        serde_json::to_value(IdempotencySlot::Reserved(record.results.clone()))
                            .unwrap_or_default();
                    let _ = self
                        .client
                        .execute(
                            "UPDATE post_idempotency SET payload = $2 WHERE id = $1",
                            &[&id, &seeded],
                        )
                        .await;
                    Begin::Reserved(Some(record))
                } else {
                    Begin::Cached(record)
                }
            }
            _ => {
                let _ = self
                    .client
                    .execute(
                        "UPDATE post_idempotency SET payload = $2 WHERE id = $1",
                        &[&id, &empty],
                    )
                    .await;
                Begin::Reserved(None)
            }
        }
    }

    async fn record_channel(&self, key: &JobKey, channel: Channel, status: ChannelStatus) {
        let id = Self::key_id(key);
        // Read-modify-write is safe: only the reservation holder writes
        // this key until it completes or parks.
        let row = self
            .client
            .query_opt("SELECT payload FROM post_idempotency WHERE id = $1", &[&id])
            .await
            .ok()
            .flatten();
        let slot = row
            .and_then(|r| r.try_get::<_, serde_json::Value>(0).ok())
            .and_then(|v| serde_json::from_value::<IdempotencySlot>(v).ok());
        if let Some(IdempotencySlot::Reserved(mut results)) = slot {
            results.insert(channel, status);
            let payload = serde_json::to_value(IdempotencySlot::Reserved(results))
                .unwrap_or_default();
            let _ = self
                .client
                .execute(
                    "UPDATE post_idempotency SET payload = $2 WHERE id = $1",
                    &[&id, &payload],
                )
                .await;
        }
    }

    async fn complete(&self, key: &JobKey, record: IdempotencyRecord) {
        let id = Self::key_id(key);
        let row = self
            .client
            .query_opt("SELECT payload FROM post_idempotency WHERE id = $1", &[&id])
            .await
            .ok()
            .flatten();
        let mut merged = match row
            .and_then(|r| r.try_get::<_, serde_json::Value>(0).ok())
            .and_then(|v| serde_json::from_value::<IdempotencySlot>(v).ok())
        {
            Some(IdempotencySlot::Reserved(results)) => results,
            _ => BTreeMap::new(),
        };
        merged.extend(record.results.clone());

        let payload = serde_json::to_value(IdempotencySlot::Completed(IdempotencyRecord {
            results: merged,
            ..record
        }))
        .unwrap_or_default();
        let _ = self
            .client
            .execute(
                "INSERT INTO post_idempotency (id, payload) VALUES ($1, $2)
                 ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
                &[&id, &payload],
            )
            .await;
    }

    async fn release(&self, key: &JobKey) {
        let _ = self
            .client
            .execute(
                "DELETE FROM post_idempotency
                 WHERE id = $1 AND payload ? 'Reserved'",
                &[&Self::key_id(key)],
            )
            .await;
    }

    async fn get(&self, key: &JobKey, now_secs: u64) -> Option<IdempotencyRecord> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM post_idempotency WHERE id = $1",
                &[&Self::key_id(key)],
            )
            .await
            .ok()
            .flatten()?;
        let payload: serde_json::Value = row.try_get(0).ok()?;
        match serde_json::from_value::<IdempotencySlot>(payload).ok()? {
            IdempotencySlot::Completed(record)
                if !record.partial && !record.is_expired(now_secs) =>
            {
                Some(record)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl DeadLetterStore for PostgresStores {
    async fn push(&self, entry: DeadLetterEntry) {
        let payload = serde_json::to_value(&entry).unwrap_or_default();
        let _ = self
            .client
            .execute(
                "INSERT INTO post_dlq (id, payload) VALUES ($1, $2)
                 ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
                &[&Self::dlq_id(&entry.key, entry.channel), &payload],
            )
            .await;
    }

    async fn list(&self, tenant_id: Option<&TenantId>, channel: Option<Channel>) -> Vec<DeadLetterEntry> {
        let rows = self
            .client
            .query("SELECT payload FROM post_dlq", &[])
            .await
            .unwrap_or_default();
        rows.into_iter()
            .filter_map(|row| row.try_get::<_, serde_json::Value>(0).ok())
            .filter_map(|v| serde_json::from_value::<DeadLetterEntry>(v).ok())
            .filter(|entry| tenant_id.map_or(true, |t| &entry.key.tenant_id == t))
            .filter(|entry| channel.map_or(true, |c| entry.channel == c))
            .collect()
    }

    async fn remove(&self, key: &JobKey, channel: Channel) -> Option<DeadLetterEntry> {
        let row = self
            .client
            .query_opt(
                "DELETE FROM post_dlq WHERE id = $1 RETURNING payload",
                &[&Self::dlq_id(key, channel)],
            )
            .await
            .ok()
            .flatten()?;
        let payload: serde_json::Value = row.try_get(0).ok()?;
        serde_json::from_value(payload).ok()
    }
}

#[async_trait]
impl JobJournal for PostgresStores {
    async fn record_enqueue(&self, task: &Task) {
        let payload = serde_json::to_value(task).unwrap_or_default();
        let _ = self
            .client
            .execute(
                "INSERT INTO post_pending (id, payload) VALUES ($1, $2)
                 ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
                &[&Self::task_id(task), &payload],
            )
            .await;
    }

    async fn record_settled(&self, task: &Task) {
        let _ = self
            .client
            .execute(
                "DELETE FROM post_pending WHERE id = $1",
                &[&Self::task_id(task)],
            )
            .await;
    }

    async fn load_pending(&self) -> Vec<Task> {
        let rows = self
            .client
            .query("SELECT payload FROM post_pending", &[])
            .await
            .unwrap_or_default();
        rows.into_iter()
            .filter_map(|row| row.try_get::<_, serde_json::Value>(0).ok())
            .filter_map(|v| serde_json::from_value::<Task>(v).ok())
            .collect()
    }
}
