// ABOUTME: Wiring tests for settings mapping, provider registry and fleet summary
// ABOUTME: Uses explicit variable maps and an in-memory database

use crate::app::{
    build_providers, delivery_settings, lifecycle_settings, orchestrator_settings, summarize,
};
use chrono::Utc;
use fleet_config::FleetConfig;
use fleet_conversations::store::NewConversation;
use fleet_conversations::{ConversationStatus, ConversationStore};
use fleet_sandbox::{Sandbox, SandboxStatus, SandboxStorage};
use fleet_storage::memory_pool;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

fn sandbox(id: &str, status: SandboxStatus) -> Sandbox {
    let now = Utc::now();
    Sandbox {
        id: id.to_string(),
        provider: "docker".to_string(),
        instance_id: Some(format!("inst-{}", id)),
        sandbox_url: Some("http://sandbox.test".to_string()),
        status,
        team_id: Some("team_a".to_string()),
        callback_fingerprint: None,
        image: "img".to_string(),
        conversation_count: 0,
        reserved_until: None,
        error_message: None,
        last_activity_at: now,
        created_at: now,
        stopped_at: None,
    }
}

fn config(pairs: &[(&str, &str)]) -> FleetConfig {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    FleetConfig::from_vars(&vars).unwrap()
}

#[test]
fn test_settings_follow_config() {
    let config = config(&[
        ("FLEET_DEFAULT_PROVIDER", "local"),
        ("FLEET_LOCAL_SANDBOX_COMMAND", "sandbox-agent --serve"),
        ("FLEET_WARM_TTL_SECS", "120"),
        ("FLEET_DELIVERY_MAX_ATTEMPTS", "7"),
        ("FLEET_POLL_INTERVAL_SECS", "2"),
        ("FLEET_DEDUP_PREFIX_CHARS", "32"),
    ]);

    let lifecycle = lifecycle_settings(&config);
    assert_eq!(lifecycle.warm_ttl, Duration::from_secs(120));
    assert_eq!(lifecycle.image, "ghcr.io/fleet/sandbox:latest");

    let delivery = delivery_settings(&config);
    assert_eq!(delivery.max_attempts, 7);
    assert_eq!(delivery.base_delay, Duration::from_secs(1));

    let orchestrator = orchestrator_settings(&config);
    assert_eq!(orchestrator.poll_interval, Duration::from_secs(2));
    assert_eq!(orchestrator.extraction.dedup_prefix, 32);
    assert_eq!(orchestrator.extraction.max_natural_questions, 3);
    assert!(orchestrator.auto_answer);
}

#[test]
fn test_local_default_provider_is_registered() {
    let config = config(&[
        ("FLEET_DEFAULT_PROVIDER", "local"),
        ("FLEET_LOCAL_SANDBOX_COMMAND", "sandbox-agent --serve"),
        ("FLEET_MICROVM_API_URL", "https://vm.example.test"),
        ("FLEET_MICROVM_API_KEY", "key"),
    ]);

    let registry = build_providers(&config).unwrap();
    assert_eq!(registry.default_name(), "local");
    assert!(registry.names().contains(&"local"));
    assert!(registry.names().contains(&"microvm"));
}

#[tokio::test]
async fn test_summary_counts_sandboxes_and_open_conversations() {
    let pool = memory_pool().await.unwrap();
    let sandboxes = SandboxStorage::new(pool.clone());
    let running = sandbox("sbx_1", SandboxStatus::Running);
    sandboxes.create(&running).await.unwrap();
    sandboxes
        .create(&sandbox("sbx_2", SandboxStatus::Pending))
        .await
        .unwrap();

    let store = ConversationStore::new(pool.clone());
    store
        .create_conversation(NewConversation {
            team_id: "team_a".to_string(),
            user_id: "user_1".to_string(),
            agent_provider: "claude".to_string(),
            cwd: "/workspace".to_string(),
            client_key: "chat-1".to_string(),
            sandbox_id: Some(running.id.clone()),
            status: ConversationStatus::Active,
        })
        .await
        .unwrap();

    let summary = summarize(&pool).await.unwrap();
    assert_eq!(summary.open_conversations, 1);
    assert_eq!(
        summary.to_json(),
        json!({
            "sandboxes": { "pending": 1, "running": 1 },
            "open_conversations": 1,
        })
    );
}
