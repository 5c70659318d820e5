//! Minimal end-to-end run: one tenant, three channels, one goal event.
//!
//! Without the `http` feature deliveries are simulated, so this runs
//! offline: the webhook channel delivers, the managed channel dead
//! letters on missing credentials, and the unconfigured channel asks
//! the caller to fall back.

use std::time::Duration;

use post_dispatcher::{
    Channel, ChannelConfig, Pipeline, PipelineConfig, Submission, TenantId,
};

#[tokio::main]
async fn main() {
    let mut pipeline = Pipeline::new(PipelineConfig::default());

    let tenant = TenantId("fc-demo".into());
    pipeline.register_tenant(&tenant).await;
    pipeline
        .configure_channel(
            &tenant,
            Channel::X,
            ChannelConfig::byo_webhook("https://hook.eu1.make.com/abc123")
                .with_secret(*b"demo-secret"),
        )
        .await
        .expect("webhook url is on the allow-list");
    pipeline
        .configure_channel(&tenant, Channel::Facebook, ChannelConfig::managed(""))
        .await
        .expect("managed config");
    // Youtube is deliberately left unconfigured.

    let mut payload = serde_json::Map::new();
    payload.insert("minute".into(), serde_json::json!(88));
    payload.insert("scorer".into(), serde_json::json!("N. Demo"));
    payload.insert("score".into(), serde_json::json!("2-1"));

    let receipt = pipeline
        .submit(Submission {
            tenant_id: "fc-demo".into(),
            idempotency_key: Some("match-42-goal-2".into()),
            template: "goal".into(),
            channels: vec!["x".into(), "fb".into(), "yt".into()],
            payload,
        })
        .await
        .expect("submit");

    println!("accepted: {:?}", receipt.results);

    // Dispatch is asynchronous; poll until every channel settles.
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let Some(states) = pipeline.job_status(&receipt.key).await else {
            continue;
        };
        if states.values().all(|s| s.status.is_settled()) {
            for (channel, state) in &states {
                println!("{channel}: {:?} after {} attempt(s)", state.status, state.attempts);
            }
            break;
        }
    }

    for entry in pipeline.dead_letters(Some(&tenant), None).await {
        println!("dead-lettered {} on {}: {}", entry.key.idempotency_key.0, entry.channel, entry.failure);
    }

    pipeline.shutdown().await;
}
