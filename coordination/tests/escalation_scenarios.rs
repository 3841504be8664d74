//! End-to-end escalation scenarios on a paused clock.
//!
//! Every test runs the real coordinator (actors, timer driver, fire router)
//! against a `MemoryStore` and a `RecordingDispatcher`, so send times are
//! exact tokio instants relative to the trigger.

use std::sync::Arc;
use std::time::Duration;

use coordination::chain::store::SeedFile;
use coordination::dispatch::RecordedSend;
use coordination::{
    AckOutcome, AllFailedPolicy, ChainStore, DeliveryMethod, DeliveryMethodType, EngineConfig,
    EngineError, EscalationChain, EscalationCoordinator, EscalationStage, InstanceStatus,
    MemoryStore, MethodStore, RecordingDispatcher, SharedCoordinator,
};
use serde_json::json;
use tokio::time::{sleep, Instant};

const TOLERANCE: Duration = Duration::from_millis(50);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> EngineConfig {
    EngineConfig {
        watchdog_interval_secs: 0,
        ..EngineConfig::default()
    }
}

fn store_with_methods(ids: &[(&str, DeliveryMethodType)]) -> Arc<MemoryStore> {
    let store = MemoryStore::new().shared();
    for (id, method_type) in ids {
        MethodStore::put(&*store, DeliveryMethod::new(*id, *method_type)).unwrap();
    }
    store
}

fn start(
    store: &Arc<MemoryStore>,
    config: EngineConfig,
) -> (SharedCoordinator, RecordingDispatcher) {
    init_tracing();
    let recorder = RecordingDispatcher::new();
    let coordinator = EscalationCoordinator::start(
        store.clone(),
        store.clone(),
        Arc::new(recorder.clone()),
        config,
    );
    (coordinator, recorder)
}

/// Slack with one retry after 30s and a 60s wait, then voice for 300s
fn scenario_chain() -> EscalationChain {
    EscalationChain::new("ops-critical", "Ops critical")
        .with_stage(EscalationStage::new(0, vec!["slack".into()], 60).with_retries(2, 30))
        .with_stage(EscalationStage::new(0, vec!["voice".into()], 300))
}

fn scenario_store() -> Arc<MemoryStore> {
    let store = store_with_methods(&[
        ("slack", DeliveryMethodType::Slack),
        ("voice", DeliveryMethodType::Voice),
    ]);
    ChainStore::create(&*store, scenario_chain()).unwrap();
    store
}

fn offset(send: &RecordedSend, start: Instant) -> Duration {
    send.at.duration_since(start)
}

fn assert_near(actual: Duration, expected_secs: u64) {
    let expected = Duration::from_secs(expected_secs);
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff <= TOLERANCE,
        "expected ~{}s, got {:?}",
        expected_secs,
        actual
    );
}

// ── Reference scenario ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_scenario_without_ack_exhausts_at_390s() {
    let store = scenario_store();
    let (coordinator, recorder) = start(&store, config());
    let started = Instant::now();

    let id = coordinator.trigger("ops-critical", json!({"title": "db down"})).unwrap();
    let done = coordinator.wait_terminal(&id).await.unwrap();

    assert_eq!(done.status, InstanceStatus::Exhausted);
    assert_near(started.elapsed(), 390);

    let sends = recorder.sends_for(&id);
    let plan: Vec<(&str, u32, u32)> = sends
        .iter()
        .map(|s| (s.method_id.as_str(), s.stage_order, s.attempt))
        .collect();
    assert_eq!(plan, vec![("slack", 1, 1), ("slack", 1, 2), ("voice", 2, 1)]);
    assert_near(offset(&sends[0], started), 0);
    assert_near(offset(&sends[1], started), 30);
    assert_near(offset(&sends[2], started), 90);

    assert_eq!(
        done.status_path(),
        vec![
            InstanceStatus::Pending,
            InstanceStatus::Dispatching,
            InstanceStatus::WaitingAck,
            InstanceStatus::Dispatching,
            InstanceStatus::WaitingAck,
            InstanceStatus::Escalating,
            InstanceStatus::Dispatching,
            InstanceStatus::WaitingAck,
            InstanceStatus::Exhausted,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_ack_at_45s_stops_before_voice() {
    let store = scenario_store();
    let (coordinator, recorder) = start(&store, config());

    let id = coordinator.trigger("ops-critical", json!({})).unwrap();
    sleep(Duration::from_secs(45)).await;
    let outcome = coordinator
        .acknowledge(&id, Some("oncall@example.com".into()))
        .await
        .unwrap();
    assert_eq!(outcome, AckOutcome::Accepted);

    // Nothing may be dispatched after the ack, however long we wait
    sleep(Duration::from_secs(600)).await;

    let instance = coordinator.instance(&id).unwrap();
    assert_eq!(instance.status, InstanceStatus::Acknowledged);
    assert_eq!(
        instance.acknowledged_by.as_deref(),
        Some("oncall@example.com")
    );
    let methods: Vec<String> = recorder
        .sends_for(&id)
        .into_iter()
        .map(|s| s.method_id)
        .collect();
    assert_eq!(methods, vec!["slack", "slack"]);
    assert_eq!(coordinator.scheduler().pending_count(), 0);
    assert_eq!(coordinator.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ack_in_same_tick_as_deadline_wins() {
    let store = store_with_methods(&[("slack", DeliveryMethodType::Slack)]);
    ChainStore::create(
        &*store,
        EscalationChain::new("short", "Short")
            .with_stage(EscalationStage::new(0, vec!["slack".into()], 1)),
    )
    .unwrap();
    let (coordinator, _) = start(&store, config());

    for _ in 0..20 {
        let id = coordinator.trigger("short", json!({})).unwrap();
        sleep(Duration::from_secs(1)).await;
        let ack = coordinator.acknowledge(&id, None).await;
        let done = coordinator.wait_terminal(&id).await.unwrap();

        assert!(
            matches!(ack, Ok(AckOutcome::Accepted)),
            "ack at the deadline lost: {:?}",
            ack
        );
        assert_eq!(done.status, InstanceStatus::Acknowledged);
        let terminal = done.transitions.iter().filter(|t| t.to.is_terminal()).count();
        assert_eq!(terminal, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_ack_after_deadline_grace_is_rejected() {
    let store = store_with_methods(&[("slack", DeliveryMethodType::Slack)]);
    ChainStore::create(
        &*store,
        EscalationChain::new("short", "Short")
            .with_stage(EscalationStage::new(0, vec!["slack".into()], 1)),
    )
    .unwrap();
    let (coordinator, _) = start(&store, config());

    let id = coordinator.trigger("short", json!({})).unwrap();
    sleep(Duration::from_millis(1100)).await;
    let err = coordinator.acknowledge(&id, None).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InstanceTerminated {
            status: InstanceStatus::Exhausted,
            ..
        }
    ));
}

// ── Timing composition ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_stage_spans_add_up() {
    let store = store_with_methods(&[
        ("a", DeliveryMethodType::Email),
        ("b", DeliveryMethodType::Text),
        ("c", DeliveryMethodType::Voice),
    ]);
    let chain = EscalationChain::new("additive", "Additive")
        .with_stage(EscalationStage::new(0, vec!["a".into()], 10))
        .with_stage(EscalationStage::new(0, vec!["b".into()], 20).with_retries(3, 5))
        .with_stage(EscalationStage::new(0, vec!["c".into()], 7));
    assert_eq!(chain.total_span(), Duration::from_secs(47));
    ChainStore::create(&*store, chain).unwrap();
    let (coordinator, recorder) = start(&store, config());
    let started = Instant::now();

    let id = coordinator.trigger("additive", json!({})).unwrap();
    let done = coordinator.wait_terminal(&id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Exhausted);
    assert_near(started.elapsed(), 47);

    let offsets: Vec<(String, Duration)> = recorder
        .sends_for(&id)
        .iter()
        .map(|s| (s.method_id.clone(), offset(s, started)))
        .collect();
    let expected = [("a", 0), ("b", 10), ("b", 15), ("b", 20), ("c", 40)];
    assert_eq!(offsets.len(), expected.len());
    for ((method, at), (want_method, want_at)) in offsets.iter().zip(expected) {
        assert_eq!(method, want_method);
        assert_near(*at, want_at);
    }
}

#[tokio::test(start_paused = true)]
async fn test_delay_only_stage_paces_without_sending() {
    let store = store_with_methods(&[
        ("slack", DeliveryMethodType::Slack),
        ("voice", DeliveryMethodType::Voice),
    ]);
    ChainStore::create(
        &*store,
        EscalationChain::new("paced", "Paced")
            .with_stage(EscalationStage::new(0, vec!["slack".into()], 10))
            .with_stage(EscalationStage::new(0, vec![], 20))
            .with_stage(EscalationStage::new(0, vec!["voice".into()], 5)),
    )
    .unwrap();
    let (coordinator, recorder) = start(&store, config());
    let started = Instant::now();

    let id = coordinator.trigger("paced", json!({})).unwrap();
    let done = coordinator.wait_terminal(&id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Exhausted);
    assert_near(started.elapsed(), 35);

    let sends = recorder.sends_for(&id);
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[1].method_id, "voice");
    assert_eq!(sends[1].stage_order, 3);
    assert_near(offset(&sends[1], started), 30);
}

#[tokio::test(start_paused = true)]
async fn test_zero_stage_chain_exhausts_immediately() {
    let store = store_with_methods(&[]);
    ChainStore::create(&*store, EscalationChain::new("empty", "Empty")).unwrap();
    let (coordinator, recorder) = start(&store, config());
    let started = Instant::now();

    let id = coordinator.trigger("empty", json!({})).unwrap();
    let done = coordinator.wait_terminal(&id).await.unwrap();

    assert_eq!(done.status, InstanceStatus::Exhausted);
    assert_near(started.elapsed(), 0);
    assert!(recorder.sends().is_empty());
}

// ── Failing delivery ────────────────────────────────────────────────

fn failover_store(policy: Option<AllFailedPolicy>) -> Arc<MemoryStore> {
    let store = store_with_methods(&[
        ("pager", DeliveryMethodType::Webhook),
        ("slack", DeliveryMethodType::Slack),
    ]);
    let mut chain = EscalationChain::new("failover", "Failover")
        .with_stage(EscalationStage::new(0, vec!["pager".into()], 60))
        .with_stage(EscalationStage::new(0, vec!["slack".into()], 30));
    if let Some(policy) = policy {
        chain = chain.with_all_failed_policy(policy);
    }
    ChainStore::create(&*store, chain).unwrap();
    store
}

#[tokio::test(start_paused = true)]
async fn test_all_failed_waits_full_duration_by_default() {
    let store = failover_store(None);
    let (coordinator, recorder) = start(&store, config());
    recorder.fail_method("pager");
    let started = Instant::now();

    let id = coordinator.trigger("failover", json!({})).unwrap();
    let done = coordinator.wait_terminal(&id).await.unwrap();

    assert_eq!(done.status, InstanceStatus::Exhausted);
    assert_near(started.elapsed(), 90);
    let sends = recorder.sends_for(&id);
    assert_near(offset(&sends[1], started), 60);
    assert!(done
        .dispatches
        .iter()
        .any(|d| d.method_id == "pager" && !d.success));
}

#[tokio::test(start_paused = true)]
async fn test_all_failed_short_circuits_when_configured() {
    let store = failover_store(Some(AllFailedPolicy::ShortCircuit));
    let (coordinator, recorder) = start(&store, config());
    recorder.fail_method("pager");
    let started = Instant::now();

    let id = coordinator.trigger("failover", json!({})).unwrap();
    let done = coordinator.wait_terminal(&id).await.unwrap();

    assert_eq!(done.status, InstanceStatus::Exhausted);
    assert_near(started.elapsed(), 30);
    let sends = recorder.sends_for(&id);
    assert_eq!(sends[1].method_id, "slack");
    assert_near(offset(&sends[1], started), 0);
}

#[tokio::test(start_paused = true)]
async fn test_short_circuit_still_spaces_retries() {
    let store = store_with_methods(&[
        ("pager", DeliveryMethodType::Webhook),
        ("slack", DeliveryMethodType::Slack),
    ]);
    ChainStore::create(
        &*store,
        EscalationChain::new("paged", "Paged")
            .with_stage(EscalationStage::new(0, vec!["pager".into()], 60).with_retries(3, 30))
            .with_stage(EscalationStage::new(0, vec!["slack".into()], 30))
            .with_all_failed_policy(AllFailedPolicy::ShortCircuit),
    )
    .unwrap();
    let (coordinator, recorder) = start(&store, config());
    recorder.fail_method("pager");
    let started = Instant::now();

    let id = coordinator.trigger("paged", json!({})).unwrap();
    let done = coordinator.wait_terminal(&id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Exhausted);

    let offsets: Vec<(String, Duration)> = recorder
        .sends_for(&id)
        .iter()
        .map(|s| (s.method_id.clone(), offset(s, started)))
        .collect();
    let expected = [("pager", 0), ("pager", 30), ("pager", 60), ("slack", 60)];
    assert_eq!(offsets.len(), expected.len());
    for ((method, at), (want_method, want_at)) in offsets.iter().zip(expected) {
        assert_eq!(method, want_method);
        assert_near(*at, want_at);
    }
    assert_near(started.elapsed(), 90);
}

#[tokio::test(start_paused = true)]
async fn test_missing_method_is_a_failed_dispatch() {
    let store = store_with_methods(&[("slack", DeliveryMethodType::Slack)]);
    ChainStore::create(
        &*store,
        EscalationChain::new("mixed", "Mixed").with_stage(EscalationStage::new(
            0,
            vec!["ghost".into(), "slack".into()],
            10,
        )),
    )
    .unwrap();
    let (coordinator, recorder) = start(&store, config());

    let id = coordinator.trigger("mixed", json!({})).unwrap();
    let done = coordinator.wait_terminal(&id).await.unwrap();

    assert_eq!(done.status, InstanceStatus::Exhausted);
    let ghost = done
        .dispatches
        .iter()
        .find(|d| d.method_id == "ghost")
        .unwrap();
    assert!(!ghost.success);
    assert!(ghost.error.as_deref().unwrap_or_default().contains("ghost"));
    assert_eq!(recorder.sends_for(&id).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_result_is_audited_after_ack() {
    let store = store_with_methods(&[("slow", DeliveryMethodType::Webhook)]);
    ChainStore::create(
        &*store,
        EscalationChain::new("slow", "Slow")
            .with_stage(EscalationStage::new(0, vec!["slow".into()], 60)),
    )
    .unwrap();
    let (coordinator, recorder) = start(&store, config());
    recorder.delay_method("slow", Duration::from_secs(20));

    let id = coordinator.trigger("slow", json!({})).unwrap();
    sleep(Duration::from_secs(5)).await;
    coordinator.acknowledge(&id, None).await.unwrap();
    sleep(Duration::from_secs(30)).await;

    let instance = coordinator.instance(&id).unwrap();
    assert_eq!(instance.status, InstanceStatus::Acknowledged);
    assert_eq!(instance.dispatches.len(), 1);
    assert!(instance.dispatches[0].late);
    assert!(instance.dispatches[0].success);
    assert_eq!(instance.transitions.last().unwrap().to, InstanceStatus::Acknowledged);
}

// ── Live configuration changes ──────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_chain_deleted_mid_flight_fails_instance() {
    let store = scenario_store();
    let (coordinator, _) = start(&store, config());

    let id = coordinator.trigger("ops-critical", json!({})).unwrap();
    sleep(Duration::from_secs(10)).await;
    ChainStore::delete(&*store, "ops-critical").unwrap();

    let done = coordinator.wait_terminal(&id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Failed);
    assert!(done
        .terminal_reason
        .as_deref()
        .unwrap_or_default()
        .contains("not found"));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_chain_keeps_running_unless_configured() {
    let store = scenario_store();
    let (coordinator, _) = start(&store, config());
    let id = coordinator.trigger("ops-critical", json!({})).unwrap();
    sleep(Duration::from_secs(1)).await;
    ChainStore::disable(&*store, "ops-critical").unwrap();
    let done = coordinator.wait_terminal(&id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Exhausted);

    let store = scenario_store();
    let strict = EngineConfig {
        fail_on_disabled_chain: true,
        ..config()
    };
    let (coordinator, _) = start(&store, strict);
    let id = coordinator.trigger("ops-critical", json!({})).unwrap();
    sleep(Duration::from_secs(1)).await;
    ChainStore::disable(&*store, "ops-critical").unwrap();
    let done = coordinator.wait_terminal(&id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Failed);

    let err = coordinator.trigger("ops-critical", json!({})).unwrap_err();
    assert_eq!(err.code(), "CHAIN_DISABLED");
}

#[tokio::test(start_paused = true)]
async fn test_lost_timer_is_rearmed_at_original_deadline() {
    let store = store_with_methods(&[("slack", DeliveryMethodType::Slack)]);
    ChainStore::create(
        &*store,
        EscalationChain::new("ops", "Ops").with_stage(EscalationStage::new(
            0,
            vec!["slack".into()],
            60,
        )),
    )
    .unwrap();
    let (coordinator, _) = start(&store, config());
    let started = Instant::now();

    let id = coordinator.trigger("ops", json!({})).unwrap();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(coordinator.scheduler().reset().unwrap(), 1);

    assert_eq!(coordinator.rearm_stalled().await, 1);
    // already pending: nothing to do
    assert_eq!(coordinator.rearm_stalled().await, 0);

    let done = coordinator.wait_terminal(&id).await.unwrap();
    assert_eq!(done.status, InstanceStatus::Exhausted);
    assert_near(started.elapsed(), 60);
}

// ── Admin schema variants ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_both_schema_variants_escalate_identically() {
    let seed: SeedFile = serde_json::from_value(json!({
        "methods": [
            {"id": "slack", "type": "SLACK"},
            {"id": "voice", "type": "VOICE"}
        ],
        "chains": [
            {
                "id": "steps", "name": "Steps", "isEnabled": true,
                "steps": [
                    {"methodId": "slack", "waitTime": 60, "retryCount": 1, "retryInterval": 30},
                    {"methodId": "voice", "waitTime": 300}
                ]
            },
            {
                "id": "stages", "name": "Stages", "isEnabled": true,
                "stages": [
                    {"stageOrder": 2, "waitDurationSeconds": 300,
                     "deliveryMethods": [{"methodId": "voice"}]},
                    {"stageOrder": 1, "waitDurationSeconds": 60, "maxAttempts": 2,
                     "retryIntervalSeconds": 30, "deliveryMethods": [{"methodId": "slack"}]}
                ]
            }
        ]
    }))
    .unwrap();
    let store = MemoryStore::from_seed(seed).unwrap().shared();
    let (coordinator, recorder) = start(&store, config());
    let started = Instant::now();

    let a = coordinator.trigger("steps", json!({})).unwrap();
    let b = coordinator.trigger("stages", json!({})).unwrap();
    coordinator.wait_terminal(&a).await.unwrap();
    coordinator.wait_terminal(&b).await.unwrap();

    let timeline = |id: &str| -> Vec<(String, u32, u32, u64)> {
        recorder
            .sends_for(id)
            .iter()
            .map(|s| {
                let secs = (offset(s, started) + TOLERANCE).as_secs();
                (s.method_id.clone(), s.stage_order, s.attempt, secs)
            })
            .collect()
    };
    assert_eq!(timeline(&a), timeline(&b));
    assert_eq!(timeline(&a).len(), 3);
}

#[test]
fn test_seed_with_both_variants_is_rejected() {
    let seed: SeedFile = serde_json::from_value(json!({
        "chains": [{
            "id": "both", "name": "Both", "isEnabled": true,
            "steps": [{"methodId": "slack", "waitTime": 60}],
            "stages": [{"stageOrder": 1, "waitDurationSeconds": 60,
                        "deliveryMethods": [{"methodId": "slack"}]}]
        }]
    }))
    .unwrap();
    let err = MemoryStore::from_seed(seed).err().unwrap();
    assert_eq!(err.code(), "AMBIGUOUS_SCHEMA");
}
