use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Unique identifier for a tenant (an isolated club/organization).
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of tenant IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller- or system-derived key ensuring a logical event is
/// dispatched at most once per tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

/// The unit of deduplication: (tenant, idempotency key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub tenant_id: TenantId,
    pub idempotency_key: IdempotencyKey,
}

impl JobKey {
    pub fn new(tenant_id: TenantId, idempotency_key: IdempotencyKey) -> Self {
        Self { tenant_id, idempotency_key }
    }
}

/// A delivery destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Youtube,
    Facebook,
    Instagram,
    Tiktok,
    X,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Youtube,
        Channel::Facebook,
        Channel::Instagram,
        Channel::Tiktok,
        Channel::X,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Youtube => "youtube",
            Channel::Facebook => "facebook",
            Channel::Instagram => "instagram",
            Channel::Tiktok => "tiktok",
            Channel::X => "x",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "youtube" | "yt" => Ok(Channel::Youtube),
            "facebook" | "fb" => Ok(Channel::Facebook),
            "instagram" | "ig" => Ok(Channel::Instagram),
            "tiktok" | "tt" => Ok(Channel::Tiktok),
            "x" | "twitter" => Ok(Channel::X),
            _ => Err(()),
        }
    }
}

/// A unit of work: one logical event to be posted to a set of channels.
///
/// The payload is template data forwarded verbatim to adapters; the
/// pipeline never inspects it beyond canonical serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub tenant_id: TenantId,
    pub idempotency_key: IdempotencyKey,
    pub template: String,
    pub channels: Vec<Channel>,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.tenant_id.clone(), self.idempotency_key.clone())
    }
}

/// Routing mode for a (tenant, channel) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    Unconfigured,
    ByoWebhook,
    Managed,
}

/// Per-(tenant, channel) routing configuration.
///
/// Exactly one of `webhook_url` / `credentials_ref` is populated,
/// matching `mode`. Use the constructors; they uphold the invariant.
/// Read-only during dispatch; mutated only through the admin path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub mode: ChannelMode,

    /// Destination URL for BYO-webhook forwarding.
    pub webhook_url: Option<String>,

    /// Opaque reference to stored platform credentials (managed mode).
    /// Never embedded in job payloads.
    pub credentials_ref: Option<String>,

    /// Tenant override for the channel's default daily quota.
    pub daily_limit: Option<u32>,

    /// Optional secret for HMAC-signing forwarded payloads.
    pub secret: Option<Vec<u8>>,

    /// Maximum time allowed for a single delivery attempt.
    pub timeout: Duration,
}

impl ChannelConfig {
    /// BYO-webhook mode: the tenant supplies their own endpoint and the
    /// pipeline forwards payloads instead of calling a platform API.
    pub fn byo_webhook(url: impl Into<String>) -> Self {
        Self {
            mode: ChannelMode::ByoWebhook,
            webhook_url: Some(url.into()),
            credentials_ref: None,
            daily_limit: None,
            secret: None,
            timeout: Duration::from_secs(10),
        }
    }

    /// Managed mode: the pipeline holds platform credentials and calls
    /// the destination's native API directly.
    pub fn managed(credentials_ref: impl Into<String>) -> Self {
        Self {
            mode: ChannelMode::Managed,
            webhook_url: None,
            credentials_ref: Some(credentials_ref.into()),
            daily_limit: None,
            secret: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_daily_limit(mut self, limit: u32) -> Self {
        self.daily_limit = Some(limit);
        self
    }

    pub fn with_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Delivery lifecycle status for one (job, channel) pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Queued,
    Retrying,
    Delivered,
    /// Over the daily quota; not attempted this cycle. Not terminal:
    /// a resubmission may retry once the quota allows.
    Deferred,
    /// No routing configured for the tenant; the caller must fall back.
    FallbackRequired,
    DeadLettered,
}

impl ChannelStatus {
    /// Whether this status can never change for the job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelStatus::Delivered | ChannelStatus::FallbackRequired | ChannelStatus::DeadLettered
        )
    }

    /// Whether the channel has a result for the current dispatch cycle
    /// (terminal, or deferred until a later resubmission).
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || matches!(self, ChannelStatus::Deferred)
    }
}

/// Status details for one (job, channel) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelState {
    pub status: ChannelStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_updated_secs: u64,
}

/// Per-channel acknowledgment returned from a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitState {
    /// Enqueued (or already in flight); dispatch is asynchronous.
    Accepted,
    /// Cached outcome from a previous submission of the same key.
    Cached(ChannelStatus),
}

/// Result of submitting a job: one entry per requested channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub key: JobKey,
    pub results: BTreeMap<Channel, SubmitState>,
}

/// Cached terminal response for a (tenant, idempotency key) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub results: BTreeMap<Channel, ChannelStatus>,
    pub created_at_secs: u64,
    pub ttl_secs: u64,

    /// Set when a cycle ended with a deferred channel: the record holds
    /// the terminal outcomes reached so far and the key stays open for
    /// resubmission.
    #[serde(default)]
    pub partial: bool,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs.saturating_sub(self.created_at_secs) > self.ttl_secs
    }
}

/// A (job, channel) pair that exhausted its delivery attempts.
/// Never auto-deleted; removal requires operator action (replay).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub key: JobKey,
    pub channel: Channel,
    pub template: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub failure: String,
    pub attempts: u32,
    pub last_attempt_secs: u64,
}
