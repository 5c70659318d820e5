use std::time::Duration;

use post_dispatcher::{
    Channel, ChannelConfig, ChannelStatus, ConfigStore, IdempotencyRecord, InMemoryStores,
    JobKey, Pipeline, PipelineConfig, RateRouter, Stores, SubmitError, SubmitState, Submission,
    TenantId,
};

fn test_config() -> PipelineConfig {
    PipelineConfig {
        worker_count: 1,
        max_in_flight: 1,
        max_attempts: 3,
        retry_base_ms: 5,
        retry_max_ms: 40,
        retry_jitter_ms: 1,
        ..Default::default()
    }
}

fn submission(tenant: &str, key: &str, channels: &[&str]) -> Submission {
    let mut payload = serde_json::Map::new();
    payload.insert("caption".into(), serde_json::json!("GOAL! 88' header"));
    Submission {
        tenant_id: tenant.to_string(),
        idempotency_key: Some(key.to_string()),
        template: "goal".to_string(),
        channels: channels.iter().map(|c| c.to_string()).collect(),
        payload,
    }
}

fn webhook_config() -> ChannelConfig {
    ChannelConfig::byo_webhook("https://hook.eu1.make.com/abc123")
}

/// Channel config whose timeout is below the simulated delivery latency,
/// so every attempt fails with a transient timeout.
fn timing_out_config() -> ChannelConfig {
    webhook_config().with_timeout(Duration::from_millis(1))
}

/// Poll until the channel settles, reading the live status map while the
/// job is open and the idempotency cache once it has finalized (the
/// status entry is dropped at finalization).
async fn wait_outcome(pipeline: &Pipeline, key: &JobKey, channel: Channel) -> ChannelStatus {
    for _ in 0..300 {
        match pipeline.job_status(key).await {
            Some(states) => {
                if let Some(state) = states.get(&channel) {
                    if state.status.is_settled() {
                        return state.status;
                    }
                }
            }
            None => {
                if let Some(record) = pipeline.cached_result(key).await {
                    if let Some(status) = record.results.get(&channel) {
                        return *status;
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("channel {channel} of job {key:?} never settled");
}

/// The cached record is written just after the last channel settles, so
/// poll for it rather than reading once.
async fn wait_cached(pipeline: &Pipeline, key: &JobKey) -> IdempotencyRecord {
    for _ in 0..100 {
        if let Some(record) = pipeline.cached_result(key).await {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {key:?} was never cached");
}

#[tokio::test]
async fn partial_success_yields_per_channel_breakdown() {
    let mut pipeline = Pipeline::new(test_config());
    let tenant = TenantId("t1".into());
    pipeline.register_tenant(&tenant).await;
    // youtube deliberately left unconfigured.
    pipeline
        .configure_channel(&tenant, Channel::X, webhook_config())
        .await
        .expect("configure");

    let receipt = pipeline
        .submit(submission("t1", "evt-1", &["yt", "x"]))
        .await
        .expect("submit");
    assert_eq!(receipt.results.len(), 2);

    assert_eq!(
        wait_outcome(&pipeline, &receipt.key, Channel::Youtube).await,
        ChannelStatus::FallbackRequired
    );
    assert_eq!(
        wait_outcome(&pipeline, &receipt.key, Channel::X).await,
        ChannelStatus::Delivered
    );

    // The fallback never lands in the dead-letter queue.
    assert!(pipeline.dead_letters(None, None).await.is_empty());

    let cached = wait_cached(&pipeline, &receipt.key).await;
    assert_eq!(cached.results[&Channel::Youtube], ChannelStatus::FallbackRequired);
    assert_eq!(cached.results[&Channel::X], ChannelStatus::Delivered);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn duplicate_submission_returns_cached_result_without_redispatch() {
    let stores = Stores::in_memory();
    let counters = stores.counters.clone();
    let mut pipeline = Pipeline::new_with_stores(test_config(), stores).await;
    let tenant = TenantId("t1".into());
    pipeline.register_tenant(&tenant).await;
    pipeline
        .configure_channel(&tenant, Channel::X, webhook_config())
        .await
        .expect("configure");

    let first = pipeline
        .submit(submission("t1", "evt-1", &["x"]))
        .await
        .expect("first submit");
    assert_eq!(
        wait_outcome(&pipeline, &first.key, Channel::X).await,
        ChannelStatus::Delivered
    );
    wait_cached(&pipeline, &first.key).await;

    let second = pipeline
        .submit(submission("t1", "evt-1", &["x"]))
        .await
        .expect("second submit");
    assert_eq!(
        second.results[&Channel::X],
        SubmitState::Cached(ChannelStatus::Delivered)
    );

    // No second delivery happened: a single quota increment.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let today = RateRouter::today();
    assert_eq!(counters.usage(&tenant, Channel::X, &today).await, 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn concurrent_identical_submissions_enqueue_once() {
    let stores = Stores::in_memory();
    let counters = stores.counters.clone();
    let pipeline =
        std::sync::Arc::new(Pipeline::new_with_stores(test_config(), stores).await);
    let tenant = TenantId("t1".into());
    pipeline.register_tenant(&tenant).await;
    pipeline
        .configure_channel(&tenant, Channel::X, webhook_config())
        .await
        .expect("configure");

    let a = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.submit(submission("t1", "evt-1", &["x"])).await })
    };
    let b = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.submit(submission("t1", "evt-1", &["x"])).await })
    };

    let first = a.await.expect("join").expect("submit");
    let _second = b.await.expect("join").expect("submit");

    assert_eq!(
        wait_outcome(&pipeline, &first.key, Channel::X).await,
        ChannelStatus::Delivered
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let today = RateRouter::today();
    assert_eq!(counters.usage(&tenant, Channel::X, &today).await, 1);
}

#[tokio::test]
async fn rate_limit_defers_after_quota_spent() {
    let mut pipeline = Pipeline::new(test_config());
    let tenant = TenantId("t2".into());
    pipeline.register_tenant(&tenant).await;
    pipeline
        .configure_channel(&tenant, Channel::Instagram, webhook_config())
        .await
        .expect("configure");
    pipeline
        .set_rate_limit_override(&tenant, Channel::Instagram, 2)
        .await;

    let mut statuses = Vec::new();
    for event in ["evt-1", "evt-2", "evt-3"] {
        let receipt = pipeline
            .submit(submission("t2", event, &["ig"]))
            .await
            .expect("submit");
        statuses.push(wait_outcome(&pipeline, &receipt.key, Channel::Instagram).await);
    }

    let delivered = statuses
        .iter()
        .filter(|s| **s == ChannelStatus::Delivered)
        .count();
    let deferred = statuses
        .iter()
        .filter(|s| **s == ChannelStatus::Deferred)
        .count();
    assert_eq!(delivered, 2);
    assert_eq!(deferred, 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn deferred_cycle_is_not_cached_and_retries_on_resubmit() {
    let mut pipeline = Pipeline::new(test_config());
    let tenant = TenantId("t2".into());
    pipeline.register_tenant(&tenant).await;
    pipeline
        .configure_channel(&tenant, Channel::X, webhook_config())
        .await
        .expect("configure");
    pipeline.set_rate_limit_override(&tenant, Channel::X, 0).await;

    let receipt = pipeline
        .submit(submission("t2", "evt-1", &["x"]))
        .await
        .expect("submit");
    assert_eq!(
        wait_outcome(&pipeline, &receipt.key, Channel::X).await,
        ChannelStatus::Deferred
    );

    // Deferred is not terminal: nothing is cached as final.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pipeline.cached_result(&receipt.key).await.is_none());

    // Quota restored: resubmitting the same key dispatches this time.
    pipeline.set_rate_limit_override(&tenant, Channel::X, 5).await;
    let retry = pipeline
        .submit(submission("t2", "evt-1", &["x"]))
        .await
        .expect("resubmit");
    assert_eq!(retry.results[&Channel::X], SubmitState::Accepted);

    assert_eq!(
        wait_outcome(&pipeline, &retry.key, Channel::X).await,
        ChannelStatus::Delivered
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn parked_outcomes_survive_across_instances() {
    // Two pipeline instances over one shared store backing, as in a
    // multi-instance deployment behind a load balancer.
    let stores = Stores::in_memory();
    let counters = stores.counters.clone();
    let tenant = TenantId("t1".into());

    let mut first = Pipeline::new_with_stores(test_config(), stores.clone()).await;
    first.register_tenant(&tenant).await;
    first
        .configure_channel(&tenant, Channel::X, webhook_config())
        .await
        .expect("configure");
    first
        .configure_channel(&tenant, Channel::Instagram, webhook_config())
        .await
        .expect("configure");
    first
        .set_rate_limit_override(&tenant, Channel::Instagram, 0)
        .await;

    // x delivers, instagram defers: the cycle parks with x recorded.
    let receipt = first
        .submit(submission("t1", "evt-1", &["x", "ig"]))
        .await
        .expect("submit");
    assert_eq!(
        wait_outcome(&first, &receipt.key, Channel::X).await,
        ChannelStatus::Delivered
    );
    assert_eq!(
        wait_outcome(&first, &receipt.key, Channel::Instagram).await,
        ChannelStatus::Deferred
    );
    first.shutdown().await;

    // A fresh instance handles the resubmission. The delivered channel
    // must be acknowledged from the shared store, never re-dispatched.
    let mut second = Pipeline::new_with_stores(test_config(), stores).await;
    second
        .set_rate_limit_override(&tenant, Channel::Instagram, 5)
        .await;
    let retry = second
        .submit(submission("t1", "evt-1", &["x", "ig"]))
        .await
        .expect("resubmit");
    assert_eq!(
        retry.results[&Channel::X],
        SubmitState::Cached(ChannelStatus::Delivered)
    );
    assert_eq!(retry.results[&Channel::Instagram], SubmitState::Accepted);

    assert_eq!(
        wait_outcome(&second, &retry.key, Channel::Instagram).await,
        ChannelStatus::Delivered
    );

    let today = RateRouter::today();
    assert_eq!(counters.usage(&tenant, Channel::X, &today).await, 1);
    assert_eq!(counters.usage(&tenant, Channel::Instagram, &today).await, 1);

    second.shutdown().await;
}

#[tokio::test]
async fn rejected_submission_enqueues_nothing() {
    // A one-slot queue can never admit a two-channel job, so admission
    // must reject it whole and leave the key resubmittable.
    let config = PipelineConfig {
        queue_size: 1,
        ..test_config()
    };
    let stores = Stores::in_memory();
    let counters = stores.counters.clone();
    let mut pipeline = Pipeline::new_with_stores(config, stores).await;
    let tenant = TenantId("t1".into());
    pipeline.register_tenant(&tenant).await;
    pipeline
        .configure_channel(&tenant, Channel::X, webhook_config())
        .await
        .expect("configure");
    pipeline
        .configure_channel(&tenant, Channel::Youtube, webhook_config())
        .await
        .expect("configure");

    let result = pipeline.submit(submission("t1", "evt-1", &["x", "yt"])).await;
    assert!(matches!(result, Err(SubmitError::Backpressure)));

    // Nothing leaked into the queue and the reservation was dropped:
    // the same key resubmitted with one channel dispatches normally.
    let receipt = pipeline
        .submit(submission("t1", "evt-1", &["x"]))
        .await
        .expect("resubmit");
    assert_eq!(receipt.results[&Channel::X], SubmitState::Accepted);
    assert_eq!(
        wait_outcome(&pipeline, &receipt.key, Channel::X).await,
        ChannelStatus::Delivered
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let today = RateRouter::today();
    assert_eq!(counters.usage(&tenant, Channel::X, &today).await, 1);
    assert_eq!(counters.usage(&tenant, Channel::Youtube, &today).await, 0);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn managed_mode_with_bad_credentials_dead_letters_without_retry() {
    let mut pipeline = Pipeline::new(test_config());
    let tenant = TenantId("t3".into());
    pipeline.register_tenant(&tenant).await;
    pipeline
        .configure_channel(&tenant, Channel::Facebook, ChannelConfig::managed(""))
        .await
        .expect("configure");

    let receipt = pipeline
        .submit(submission("t3", "evt-1", &["fb"]))
        .await
        .expect("submit");
    assert_eq!(
        wait_outcome(&pipeline, &receipt.key, Channel::Facebook).await,
        ChannelStatus::DeadLettered
    );

    // One attempt, no retries: permanent failures go straight to DLQ.
    let entries = pipeline
        .dead_letters(Some(&tenant), Some(Channel::Facebook))
        .await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts, 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn transient_failures_exhaust_retry_budget_then_dead_letter() {
    let mut pipeline = Pipeline::new(test_config());
    let tenant = TenantId("t1".into());
    pipeline.register_tenant(&tenant).await;
    pipeline
        .configure_channel(&tenant, Channel::Tiktok, timing_out_config())
        .await
        .expect("configure");

    let receipt = pipeline
        .submit(submission("t1", "evt-1", &["tt"]))
        .await
        .expect("submit");
    assert_eq!(
        wait_outcome(&pipeline, &receipt.key, Channel::Tiktok).await,
        ChannelStatus::DeadLettered
    );

    // max_attempts = 3 in the test config: three attempts, then DLQ.
    let entries = pipeline.dead_letters(None, Some(Channel::Tiktok)).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts, 3);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn tenants_are_isolated() {
    let mut pipeline = Pipeline::new(test_config());
    let club_a = TenantId("club-a".into());
    let club_b = TenantId("club-b".into());
    pipeline.register_tenant(&club_a).await;
    pipeline.register_tenant(&club_b).await;
    // Only club-b configures youtube.
    pipeline
        .configure_channel(&club_b, Channel::Youtube, webhook_config())
        .await
        .expect("configure");

    let a = pipeline
        .submit(submission("club-a", "evt-1", &["yt"]))
        .await
        .expect("submit a");
    let b = pipeline
        .submit(submission("club-b", "evt-1", &["yt"]))
        .await
        .expect("submit b");

    assert_eq!(
        wait_outcome(&pipeline, &a.key, Channel::Youtube).await,
        ChannelStatus::FallbackRequired
    );
    assert_eq!(
        wait_outcome(&pipeline, &b.key, Channel::Youtube).await,
        ChannelStatus::Delivered
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn validation_rejects_bad_submissions() {
    let mut pipeline = Pipeline::new(test_config());
    let tenant = TenantId("t1".into());
    pipeline.register_tenant(&tenant).await;

    let unknown_tenant = pipeline.submit(submission("ghost", "evt-1", &["x"])).await;
    assert!(matches!(unknown_tenant, Err(SubmitError::UnknownTenant(_))));

    let empty = pipeline.submit(submission("t1", "evt-1", &[])).await;
    assert!(matches!(empty, Err(SubmitError::EmptyChannels)));

    let bogus = pipeline
        .submit(submission("t1", "evt-1", &["friendster"]))
        .await;
    assert!(matches!(bogus, Err(SubmitError::UnknownChannel(_))));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn duplicate_channel_names_collapse() {
    let mut pipeline = Pipeline::new(test_config());
    let tenant = TenantId("t1".into());
    pipeline.register_tenant(&tenant).await;
    pipeline
        .configure_channel(&tenant, Channel::X, webhook_config())
        .await
        .expect("configure");

    let receipt = pipeline
        .submit(submission("t1", "evt-1", &["x", "x", "twitter"]))
        .await
        .expect("submit");
    assert_eq!(receipt.results.len(), 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn derived_key_deduplicates_when_caller_omits_one() {
    let mut pipeline = Pipeline::new(test_config());
    let tenant = TenantId("t1".into());
    pipeline.register_tenant(&tenant).await;
    pipeline
        .configure_channel(&tenant, Channel::X, webhook_config())
        .await
        .expect("configure");

    let mut submission = submission("t1", "ignored", &["x"]);
    submission.idempotency_key = None;

    let first = pipeline.submit(submission.clone()).await.expect("first");
    assert_eq!(
        wait_outcome(&pipeline, &first.key, Channel::X).await,
        ChannelStatus::Delivered
    );
    wait_cached(&pipeline, &first.key).await;

    let second = pipeline.submit(submission).await.expect("second");
    assert_eq!(first.key, second.key);
    assert_eq!(
        second.results[&Channel::X],
        SubmitState::Cached(ChannelStatus::Delivered)
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn dead_letter_replay_delivers_after_reconfiguration() {
    let mut pipeline = Pipeline::new(test_config());
    let tenant = TenantId("t3".into());
    pipeline.register_tenant(&tenant).await;
    pipeline
        .configure_channel(&tenant, Channel::Facebook, ChannelConfig::managed(""))
        .await
        .expect("configure");

    let receipt = pipeline
        .submit(submission("t3", "evt-1", &["fb"]))
        .await
        .expect("submit");
    assert_eq!(
        wait_outcome(&pipeline, &receipt.key, Channel::Facebook).await,
        ChannelStatus::DeadLettered
    );
    assert_eq!(pipeline.dead_letters(None, None).await.len(), 1);

    // Operator fixes routing, then replays the entry.
    pipeline
        .configure_channel(&tenant, Channel::Facebook, webhook_config())
        .await
        .expect("reconfigure");
    assert!(pipeline.replay_dead_letter(&receipt.key, Channel::Facebook).await);
    assert!(pipeline.dead_letters(None, None).await.is_empty());

    assert_eq!(
        wait_outcome(&pipeline, &receipt.key, Channel::Facebook).await,
        ChannelStatus::Delivered
    );

    // Replaying a non-existent entry is a no-op.
    assert!(!pipeline.replay_dead_letter(&receipt.key, Channel::Facebook).await);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn journaled_tasks_replay_on_startup() {
    use post_dispatcher::{IdempotencyKey, Job, Task};

    let stores = Stores::in_memory();
    let tenant = TenantId("t1".into());
    stores.config.register_tenant(&tenant).await;
    stores
        .config
        .put_channel_config(&tenant, Channel::X, webhook_config())
        .await;

    // A task enqueued by a previous process that died before settling.
    let job = Job {
        tenant_id: tenant.clone(),
        idempotency_key: IdempotencyKey("evt-1".into()),
        template: "goal".into(),
        channels: vec![Channel::X],
        payload: serde_json::Map::new(),
    };
    let key = job.key();
    stores
        .journal
        .record_enqueue(&Task { job, channel: Channel::X, attempt: 0 })
        .await;

    let mut pipeline = Pipeline::new_with_stores(test_config(), stores).await;
    assert_eq!(
        wait_outcome(&pipeline, &key, Channel::X).await,
        ChannelStatus::Delivered
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn configure_channel_enforces_webhook_allow_list() {
    let pipeline = Pipeline::new(test_config());
    let tenant = TenantId("t1".into());
    pipeline.register_tenant(&tenant).await;

    let result = pipeline
        .configure_channel(
            &tenant,
            Channel::X,
            ChannelConfig::byo_webhook("https://attacker.example.com/steal"),
        )
        .await;
    assert!(result.is_err());

    let result = pipeline
        .configure_channel(&tenant, Channel::X, webhook_config())
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn in_memory_stores_back_every_trait() {
    // Compile-time exercise of the Stores bundle over one backing.
    let stores = Stores::in_memory();
    let standalone = InMemoryStores::new();
    let tenant = TenantId("t1".into());
    standalone.register_tenant(&tenant).await;
    assert!(standalone.tenant_exists(&tenant).await);
    assert!(!stores.config.tenant_exists(&tenant).await);
}
