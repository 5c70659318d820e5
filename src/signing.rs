use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::types::{ChannelConfig, TenantId};

pub const SIGNATURE_HEADER: &str = "X-Post-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Post-Timestamp";

pub struct SignatureHeaders {
    pub signature: Option<(String, String)>,
    pub timestamp: Option<(String, String)>,
}

/// Build signature headers for a forwarded BYO-webhook body.
///
/// Returns empty headers when the channel has no secret configured.
pub fn build_signature_headers(config: &ChannelConfig, body: &[u8]) -> SignatureHeaders {
    let Some(secret) = config.secret.as_ref() else {
        return SignatureHeaders { signature: None, timestamp: None };
    };

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string();

    let signature = compute_signature(secret, body, Some(&timestamp));

    SignatureHeaders {
        signature: Some((SIGNATURE_HEADER.to_string(), signature)),
        timestamp: Some((TIMESTAMP_HEADER.to_string(), timestamp)),
    }
}

/// Compute the HMAC-SHA256 signature used for webhook forwarding.
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> String {
    let data = if let Some(ts) = timestamp {
        [ts.as_bytes(), payload].concat()
    } else {
        payload.to_vec()
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"default").expect("hmac"));
    mac.update(&data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received signature with optional timestamp.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    timestamp: Option<&str>,
    signature_hex: &str,
) -> bool {
    let data = if let Some(ts) = timestamp {
        [ts.as_bytes(), payload].concat()
    } else {
        payload.to_vec()
    };

    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"default").expect("hmac"));
    mac.update(&data);

    mac.verify_slice(&signature).is_ok()
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    if now_secs >= timestamp_secs {
        now_secs - timestamp_secs <= max_age_secs
    } else {
        false
    }
}

/// Derive an idempotency key when the caller did not supply one.
///
/// Stable hash of tenant + template + canonical payload, so identical
/// resubmissions of the same logical event map to the same key.
/// `serde_json::Map` keeps keys sorted, making serialization canonical.
pub fn derive_idempotency_key(
    tenant_id: &TenantId,
    template: &str,
    payload: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let canonical = serde_json::to_string(payload).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(tenant_id.0.as_bytes());
    hasher.update([0u8]);
    hasher.update(template.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
