//! A multi-tenant dispatch pipeline for match-day social content.
//!
//! Clients submit a single "post job" (a goal, card, fixture, or
//! highlight) naming zero or more destination channels; the pipeline
//! delivers to each channel independently, never duplicates a delivery
//! for the same logical event, and degrades gracefully when a channel
//! is unconfigured or over its daily quota.
//!
//! ## Guarantees
//! - At-most-once dispatch per (tenant, idempotency key)
//! - Per-channel isolation: one channel's failure never blocks another
//! - Self-throttling against per-channel daily platform quotas
//! - Bounded retry with exponential backoff, then dead-lettering
//!
//! ## Non-Guarantees
//! - Exactly-once delivery end to end
//! - Ordering across channels or across jobs
//! - Real-time delivery (asynchronous, best-effort within seconds)
//!
//! Each channel routes per tenant: forward to a tenant-supplied
//! webhook (BYO mode), call the platform API with managed credentials,
//! or surface "not configured" so the caller can fall back.

mod adapters;
mod error;
mod pipeline;
mod router;
mod signing;
mod stores;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod stores_redis;

#[cfg(feature = "postgres")]
mod stores_postgres;

#[cfg(feature = "api")]
pub mod api;

pub use adapters::{
    adapter_for, classify_status, validate_webhook_url, ChannelAdapter,
    DEFAULT_ALLOWED_WEBHOOK_HOSTS,
};
pub use error::{ConfigError, FailureReason, PublishError, SubmitError};
pub use pipeline::{Pipeline, PipelineConfig, Submission};
pub use router::{default_daily_limit, RateRouter};
pub use signing::{
    build_signature_headers, compute_signature, derive_idempotency_key, is_timestamp_fresh,
    verify_signature, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
pub use stores::{
    Begin, ConfigStore, DeadLetterStore, IdempotencyStore, InMemoryStores, JobJournal,
    RateCounterStore, Stores,
};
pub use types::{
    Channel, ChannelConfig, ChannelMode, ChannelState, ChannelStatus, DeadLetterEntry,
    IdempotencyKey, IdempotencyRecord, Job, JobKey, SubmitReceipt, SubmitState, TenantId,
};
pub use worker::Task;

#[cfg(feature = "redis")]
pub use stores_redis::RedisStores;

#[cfg(feature = "postgres")]
pub use stores_postgres::PostgresStores;
