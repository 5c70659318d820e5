use std::sync::Arc;

use crate::stores::{ConfigStore, RateCounterStore};
use crate::types::{Channel, TenantId};

/// Conservative daily ceilings reflecting real platform quotas.
/// Exceeding these risks account suspension, so the router throttles
/// before a call is attempted rather than reacting to 429s.
pub fn default_daily_limit(channel: Channel) -> u32 {
    match channel {
        Channel::Youtube => 20,
        Channel::Facebook => 100,
        // Instagram's content-publishing API caps at 25 posts per day.
        Channel::Instagram => 25,
        Channel::Tiktok => 30,
        Channel::X => 100,
    }
}

/// Decides, per (tenant, channel), whether today's quota is spent.
///
/// Counters roll over lazily: the calendar day is part of the key, so a
/// new day simply reads an absent counter. Increments happen only after
/// a confirmed delivery, never pre-emptively, which avoids over-counting
/// retries and under-counting on failure.
pub struct RateRouter {
    config: Arc<dyn ConfigStore>,
    counters: Arc<dyn RateCounterStore>,
}

impl RateRouter {
    pub fn new(config: Arc<dyn ConfigStore>, counters: Arc<dyn RateCounterStore>) -> Self {
        Self { config, counters }
    }

    /// Current UTC calendar day, e.g. "2026-08-26".
    pub fn today() -> String {
        chrono::Utc::now().format("%Y-%m-%d").to_string()
    }

    pub async fn effective_limit(&self, tenant_id: &TenantId, channel: Channel) -> u32 {
        match self.config.limit_override(tenant_id, channel).await {
            Some(limit) => limit,
            None => {
                // A per-channel override on the config itself also wins
                // over the platform default.
                let config_limit = self
                    .config
                    .channel_config(tenant_id, channel)
                    .await
                    .and_then(|c| c.daily_limit);
                config_limit.unwrap_or_else(|| default_daily_limit(channel))
            }
        }
    }

    pub async fn should_defer(&self, tenant_id: &TenantId, channel: Channel) -> bool {
        let day = Self::today();
        let used = self.counters.usage(tenant_id, channel, &day).await;
        used >= self.effective_limit(tenant_id, channel).await
    }

    /// Record one confirmed delivery against today's quota.
    pub async fn record_delivery(&self, tenant_id: &TenantId, channel: Channel) -> u32 {
        let day = Self::today();
        self.counters.increment(tenant_id, channel, &day).await
    }
}
