use std::fmt;

/// Errors surfaced synchronously to the caller at ingestion.
/// A job that fails validation is never enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The tenant is not registered.
    UnknownTenant(String),

    /// The submission named no channels.
    EmptyChannels,

    /// A channel name did not match any known destination.
    UnknownChannel(String),

    /// Ready queue is full. Caller must retry or apply backoff.
    Backpressure,

    /// Pipeline has been shut down.
    Shutdown,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::UnknownTenant(tenant) =>
                write!(f, "unknown tenant: {tenant}"),
            SubmitError::EmptyChannels =>
                write!(f, "submission names no channels"),
            SubmitError::UnknownChannel(name) =>
                write!(f, "unrecognized channel: {name}"),
            SubmitError::Backpressure =>
                write!(f, "pipeline at capacity"),
            SubmitError::Shutdown =>
                write!(f, "pipeline is shut down"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Errors rejected by the administrative configuration path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Webhook URL could not be parsed or is not https.
    InvalidWebhookUrl(String),

    /// Webhook host is not on the trusted allow-list.
    WebhookHostNotAllowed(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidWebhookUrl(url) =>
                write!(f, "invalid webhook url: {url}"),
            ConfigError::WebhookHostNotAllowed(host) =>
                write!(f, "webhook host not on allow-list: {host}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Why a single delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    Network,
    /// Destination returned a retryable status (429/5xx).
    RemoteError,
    /// Destination rejected the request (non-retryable 4xx).
    ClientError,
    /// Managed credentials are missing or malformed.
    InvalidCredentials,
    /// No native integration exists for this platform yet.
    NotImplemented,
    MaxAttemptsExceeded,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout =>
                write!(f, "request timed out"),
            FailureReason::Network =>
                write!(f, "network error"),
            FailureReason::RemoteError =>
                write!(f, "destination returned retryable error"),
            FailureReason::ClientError =>
                write!(f, "destination rejected request (non-retryable)"),
            FailureReason::InvalidCredentials =>
                write!(f, "managed credentials missing or malformed"),
            FailureReason::NotImplemented =>
                write!(f, "no native integration for this platform"),
            FailureReason::MaxAttemptsExceeded =>
                write!(f, "maximum delivery attempts exceeded"),
        }
    }
}

/// Outcome of one adapter call, before retry policy is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The channel has no routing configured for the tenant. Mapped to
    /// `fallback_required` by the consumer; never a dead letter.
    NotConfigured,

    /// Network failure, timeout, or 5xx. Retried with bounded backoff.
    Transient(FailureReason),

    /// Invalid credentials, non-retryable 4xx, or missing integration.
    /// Dead-lettered immediately without retry.
    Permanent(FailureReason),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NotConfigured =>
                write!(f, "channel not configured for tenant"),
            PublishError::Transient(reason) =>
                write!(f, "transient delivery failure: {reason}"),
            PublishError::Permanent(reason) =>
                write!(f, "permanent delivery failure: {reason}"),
        }
    }
}

impl std::error::Error for PublishError {}
