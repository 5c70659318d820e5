#[cfg(not(feature = "http"))]
use std::time::Duration;

use serde_json::json;

#[cfg(not(feature = "http"))]
use tokio::time::sleep;

use crate::error::{ConfigError, FailureReason, PublishError};
use crate::signing::build_signature_headers;
use crate::types::{Channel, ChannelConfig, ChannelMode, Job};

/// Hosts (matched by suffix) trusted for BYO-webhook forwarding.
pub const DEFAULT_ALLOWED_WEBHOOK_HOSTS: &[&str] = &["make.com", "zapier.com", "n8n.cloud"];

/// One adapter per destination. Every adapter runs the same mode
/// branching; only the downstream call shape differs, so the shared
/// logic lives in [`publish`] and adapters provide the channel-specific
/// pieces.
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Envelope for BYO-webhook forwarding: the job payload verbatim
    /// plus the channel-specific fields a downstream automation expects.
    fn envelope(&self, job: &Job) -> serde_json::Value;

    /// Native platform call for managed mode. Platforms without an
    /// integration return a permanent error rather than silently
    /// succeeding.
    fn publish_managed(&self, credentials_ref: &str, job: &Job) -> Result<(), PublishError>;
}

/// Select the adapter for a channel.
pub fn adapter_for(channel: Channel) -> &'static dyn ChannelAdapter {
    match channel {
        Channel::Youtube => &YoutubeAdapter,
        Channel::Facebook => &FacebookAdapter,
        Channel::Instagram => &InstagramAdapter,
        Channel::Tiktok => &TiktokAdapter,
        Channel::X => &XAdapter,
    }
}

fn base_envelope(channel: Channel, job: &Job) -> serde_json::Value {
    json!({
        "tenant_id": job.tenant_id.0,
        "template": job.template,
        "channel": channel.as_str(),
        "data": job.payload,
    })
}

fn merge_hints(mut envelope: serde_json::Value, hints: &[(&str, &str)], job: &Job) -> serde_json::Value {
    if let Some(object) = envelope.as_object_mut() {
        for (target, source) in hints {
            if let Some(value) = job.payload.get(*source) {
                object.insert((*target).to_string(), value.clone());
            }
        }
    }
    envelope
}

fn require_credentials(credentials_ref: &str) -> Result<(), PublishError> {
    if credentials_ref.trim().is_empty() {
        return Err(PublishError::Permanent(FailureReason::InvalidCredentials));
    }
    Ok(())
}

pub struct YoutubeAdapter;

impl ChannelAdapter for YoutubeAdapter {
    fn channel(&self) -> Channel {
        Channel::Youtube
    }

    fn envelope(&self, job: &Job) -> serde_json::Value {
        merge_hints(
            base_envelope(Channel::Youtube, job),
            &[("title", "title"), ("description", "caption"), ("video_url", "video_url")],
            job,
        )
    }

    fn publish_managed(&self, credentials_ref: &str, _job: &Job) -> Result<(), PublishError> {
        require_credentials(credentials_ref)?;
        // YouTube Data API resumable upload is not wired up yet.
        Err(PublishError::Permanent(FailureReason::NotImplemented))
    }
}

pub struct FacebookAdapter;

impl ChannelAdapter for FacebookAdapter {
    fn channel(&self) -> Channel {
        Channel::Facebook
    }

    fn envelope(&self, job: &Job) -> serde_json::Value {
        merge_hints(
            base_envelope(Channel::Facebook, job),
            &[("message", "caption"), ("link", "link"), ("media_url", "media_url")],
            job,
        )
    }

    fn publish_managed(&self, credentials_ref: &str, _job: &Job) -> Result<(), PublishError> {
        require_credentials(credentials_ref)?;
        Err(PublishError::Permanent(FailureReason::NotImplemented))
    }
}

pub struct InstagramAdapter;

impl ChannelAdapter for InstagramAdapter {
    fn channel(&self) -> Channel {
        Channel::Instagram
    }

    fn envelope(&self, job: &Job) -> serde_json::Value {
        merge_hints(
            base_envelope(Channel::Instagram, job),
            &[("caption", "caption"), ("media_url", "media_url")],
            job,
        )
    }

    fn publish_managed(&self, credentials_ref: &str, _job: &Job) -> Result<(), PublishError> {
        require_credentials(credentials_ref)?;
        Err(PublishError::Permanent(FailureReason::NotImplemented))
    }
}

pub struct TiktokAdapter;

impl ChannelAdapter for TiktokAdapter {
    fn channel(&self) -> Channel {
        Channel::Tiktok
    }

    fn envelope(&self, job: &Job) -> serde_json::Value {
        merge_hints(
            base_envelope(Channel::Tiktok, job),
            &[("caption", "caption"), ("video_url", "video_url")],
            job,
        )
    }

    fn publish_managed(&self, credentials_ref: &str, _job: &Job) -> Result<(), PublishError> {
        require_credentials(credentials_ref)?;
        Err(PublishError::Permanent(FailureReason::NotImplemented))
    }
}

pub struct XAdapter;

impl ChannelAdapter for XAdapter {
    fn channel(&self) -> Channel {
        Channel::X
    }

    fn envelope(&self, job: &Job) -> serde_json::Value {
        merge_hints(
            base_envelope(Channel::X, job),
            &[("text", "caption"), ("media_url", "media_url")],
            job,
        )
    }

    fn publish_managed(&self, credentials_ref: &str, _job: &Job) -> Result<(), PublishError> {
        require_credentials(credentials_ref)?;
        Err(PublishError::Permanent(FailureReason::NotImplemented))
    }
}

/// Shared per-channel decision logic: BYO-webhook forwarding, managed
/// platform call, or "not configured".
pub async fn publish(
    adapter: &dyn ChannelAdapter,
    config: &ChannelConfig,
    job: &Job,
    #[cfg(feature = "http")] client: &reqwest::Client,
) -> Result<(), PublishError> {
    match config.mode {
        ChannelMode::Unconfigured => Err(PublishError::NotConfigured),
        ChannelMode::ByoWebhook => {
            let url = config
                .webhook_url
                .as_deref()
                .ok_or(PublishError::NotConfigured)?;
            let body = serde_json::to_vec(&adapter.envelope(job))
                .map_err(|_| PublishError::Permanent(FailureReason::ClientError))?;
            #[cfg(feature = "http")]
            let result = forward_webhook(url, &body, config, client).await;
            #[cfg(not(feature = "http"))]
            let result = forward_webhook(url, &body, config).await;
            result
        }
        ChannelMode::Managed => {
            let credentials_ref = config
                .credentials_ref
                .as_deref()
                .ok_or(PublishError::Permanent(FailureReason::InvalidCredentials))?;
            adapter.publish_managed(credentials_ref, job)
        }
    }
}

/// POST the signed envelope to a tenant-supplied webhook.
#[cfg(feature = "http")]
async fn forward_webhook(
    url: &str,
    body: &[u8],
    config: &ChannelConfig,
    client: &reqwest::Client,
) -> Result<(), PublishError> {
    let headers = build_signature_headers(config, body);

    let mut request = client
        .post(url)
        .body(body.to_vec())
        .timeout(config.timeout)
        .header("Content-Type", "application/json");

    if let Some((name, value)) = headers.signature {
        request = request.header(name, value);
    }
    if let Some((name, value)) = headers.timestamp {
        request = request.header(name, value);
    }

    match request.send().await {
        Ok(response) => classify_status(response.status().as_u16()),
        Err(err) => {
            if err.is_timeout() {
                Err(PublishError::Transient(FailureReason::Timeout))
            } else {
                Err(PublishError::Transient(FailureReason::Network))
            }
        }
    }
}

/// Simulated forwarding when built without the `http` feature: a bounded
/// sleep standing in for network latency, timing out if the configured
/// budget is below it. Tests drive the transient-failure path by setting
/// a sub-latency timeout.
#[cfg(not(feature = "http"))]
async fn forward_webhook(
    _url: &str,
    body: &[u8],
    config: &ChannelConfig,
) -> Result<(), PublishError> {
    let _ = build_signature_headers(config, body);
    const SIMULATED_LATENCY: Duration = Duration::from_millis(20);
    sleep(SIMULATED_LATENCY.min(config.timeout)).await;
    if config.timeout < SIMULATED_LATENCY {
        return Err(PublishError::Transient(FailureReason::Timeout));
    }
    Ok(())
}

/// Map an HTTP status to the delivery taxonomy: 2xx success, 408/429/5xx
/// transient, any other 4xx permanent.
pub fn classify_status(status: u16) -> Result<(), PublishError> {
    match status {
        200..=299 => Ok(()),
        408 | 429 => Err(PublishError::Transient(FailureReason::RemoteError)),
        500..=599 => Err(PublishError::Transient(FailureReason::RemoteError)),
        400..=499 => Err(PublishError::Permanent(FailureReason::ClientError)),
        _ => Err(PublishError::Transient(FailureReason::RemoteError)),
    }
}

/// Validate a BYO webhook URL against the trusted host allow-list.
/// Called at configuration time; dispatch trusts stored configs.
pub fn validate_webhook_url(url: &str, allowed_hosts: &[String]) -> Result<(), ConfigError> {
    let rest = url
        .strip_prefix("https://")
        .ok_or_else(|| ConfigError::InvalidWebhookUrl(url.to_string()))?;

    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host = authority.split(':').next().unwrap_or("");
    if host.is_empty() {
        return Err(ConfigError::InvalidWebhookUrl(url.to_string()));
    }

    let allowed = allowed_hosts
        .iter()
        .any(|entry| host == entry || host.ends_with(&format!(".{entry}")));
    if allowed {
        Ok(())
    } else {
        Err(ConfigError::WebhookHostNotAllowed(host.to_string()))
    }
}
