//! Workflow engine integration tests
//!
//! Each test runs against its own temporary storage root with the
//! file-backed store and schema loader, exactly as a caller would.

use chatflow::{
    ChatflowConfig, FeatureProgress, FlowError, HistoryEventType, PhaseDefinition,
    RecommendationSource, SchemaError, TaskExecutionRecord, TaskStatus, Variables, WorkflowEngine,
    WorkflowSchema, WorkflowStatus,
};
use chatflow::workflows::ConditionExpression;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

/// Test helper owning a storage root and an engine over it
struct EngineTestHelper {
    temp_dir: TempDir,
    engine: WorkflowEngine,
}

impl EngineTestHelper {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let engine = WorkflowEngine::from_config(&Self::config_for(&temp_dir));
        Self { temp_dir, engine }
    }

    fn config_for(temp_dir: &TempDir) -> ChatflowConfig {
        let mut config = ChatflowConfig::default();
        config.storage.root = temp_dir.path().to_path_buf();
        config.engine.lock_timeout_ms = 2_000;
        config
    }

    /// Second engine over the same root, with its own caches
    fn fresh_engine(&self) -> WorkflowEngine {
        WorkflowEngine::from_config(&Self::config_for(&self.temp_dir))
    }

    async fn start(&self, schema: &WorkflowSchema, feature_id: &str) -> String {
        self.engine
            .start(schema, Variables::new(), feature_id, Map::new())
            .await
            .unwrap()
            .instance_id
    }

    async fn trigger(&self, instance_id: &str, data: Value) -> chatflow::WorkflowInstanceState {
        self.engine
            .trigger(instance_id, vars(data), false, None)
            .await
            .unwrap()
    }
}

fn vars(value: Value) -> Variables {
    value.as_object().cloned().unwrap_or_default()
}

fn schema(value: Value) -> WorkflowSchema {
    WorkflowSchema::from_value(&value).unwrap()
}

fn linear_schema() -> WorkflowSchema {
    schema(json!({
        "name": "linear",
        "version": "1.0",
        "phases": [
            {"name": "analyze", "task": "analyze_task"},
            {"name": "design", "task": "design_task"},
            {"name": "implement", "task": "implement_task"}
        ]
    }))
}

fn gated_schema() -> WorkflowSchema {
    schema(json!({
        "name": "gated",
        "phases": [
            {"name": "start"},
            {
                "name": "security_gate",
                "condition": {"field": "code.risk_level", "operator": ">=", "value": 3}
            },
            {
                "name": "perf_gate",
                "condition": {
                    "operator": "or",
                    "operands": [
                        {"field": "perf.critical", "operator": "==", "value": true},
                        {"field": "perf.budget_ms", "operator": "<", "value": 50}
                    ]
                }
            },
            {"name": "target"}
        ]
    }))
}

#[tokio::test]
async fn test_linear_traversal_to_completion() {
    let helper = EngineTestHelper::new();
    let instance_id = helper.start(&linear_schema(), "feat_linear").await;

    let state = helper.engine.get_state(&instance_id).await.unwrap().unwrap();
    assert_eq!(state.current_phase, "analyze");
    assert_eq!(state.status, WorkflowStatus::Created);
    assert_eq!(state.total_phases, 3);
    assert_eq!(state.history[0].event_type, HistoryEventType::WorkflowStarted);

    let state = helper.trigger(&instance_id, json!({})).await;
    assert_eq!(state.current_phase, "design");
    assert_eq!(state.status, WorkflowStatus::Running);

    let state = helper.trigger(&instance_id, json!({})).await;
    assert_eq!(state.current_phase, "implement");

    let state = helper.trigger(&instance_id, json!({})).await;
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.current_phase, "implement");
    assert_eq!(state.completed_phase_count(), 3);
    assert_eq!(state.progress(), 1.0);
    assert_eq!(
        state.history.last().map(|e| e.event_type.clone()),
        Some(HistoryEventType::WorkflowCompleted)
    );

    let err = helper
        .engine
        .trigger(&instance_id, Variables::new(), false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::InvalidTransition { status: WorkflowStatus::Completed, .. }));
}

#[tokio::test]
async fn test_false_conditions_are_skipped_in_one_trigger() {
    let helper = EngineTestHelper::new();
    let instance_id = helper.start(&gated_schema(), "feat_gated").await;

    let state = helper
        .trigger(&instance_id, json!({"code": {"risk_level": 1}, "perf": {"critical": false}}))
        .await;

    assert_eq!(state.current_phase, "target");
    let skipped: Vec<_> = state
        .history
        .iter()
        .filter(|e| e.event_type == HistoryEventType::PhaseSkipped)
        .map(|e| e.phase.as_str())
        .collect();
    assert_eq!(skipped, vec!["security_gate", "perf_gate"]);
    assert!(!state
        .history
        .iter()
        .any(|e| e.event_type == HistoryEventType::PhaseStarted && e.phase != "target"));
}

#[tokio::test]
async fn test_trigger_data_is_merged_before_resolution() {
    let helper = EngineTestHelper::new();
    let instance_id = helper.start(&gated_schema(), "feat_gated").await;

    let state = helper.trigger(&instance_id, json!({"code": {"risk_level": 4}})).await;
    assert_eq!(state.current_phase, "security_gate");
    assert_eq!(state.variables["code"]["risk_level"], json!(4));

    let state = helper.trigger(&instance_id, json!({"perf": {"budget_ms": 20}})).await;
    assert_eq!(state.current_phase, "perf_gate");
    assert_eq!(state.variables["code"]["risk_level"], json!(4));
}

#[tokio::test]
async fn test_missing_variable_path_skips_gate() {
    let helper = EngineTestHelper::new();
    let instance_id = helper.start(&gated_schema(), "feat_gated").await;

    let state = helper.trigger(&instance_id, json!({})).await;
    assert_eq!(state.current_phase, "target");
}

#[tokio::test]
async fn test_false_condition_with_fallback_jumps() {
    let helper = EngineTestHelper::new();
    let flow = schema(json!({
        "name": "fallback_flow",
        "phases": [
            {"name": "start"},
            {
                "name": "deep_review",
                "condition": {"field": "risk", "operator": "==", "value": "high"},
                "fallback_phase": "quick_review"
            },
            {"name": "implement"},
            {"name": "quick_review"}
        ]
    }));
    let instance_id = helper.start(&flow, "feat_fb").await;

    let state = helper.trigger(&instance_id, json!({"risk": "low"})).await;
    assert_eq!(state.current_phase, "quick_review");
    assert_eq!(state.status, WorkflowStatus::Running);

    let skipped = state
        .history
        .iter()
        .find(|e| e.event_type == HistoryEventType::PhaseSkipped)
        .unwrap();
    assert_eq!(skipped.phase, "deep_review");
    assert_eq!(skipped.data["reason"], json!("fallback"));
    assert_eq!(skipped.data["fallback_phase"], json!("quick_review"));
}

#[tokio::test]
async fn test_dry_run_does_not_persist() {
    let helper = EngineTestHelper::new();
    let instance_id = helper.start(&linear_schema(), "feat_dry").await;

    let preview = helper
        .engine
        .trigger(&instance_id, vars(json!({"note": "preview"})), true, None)
        .await
        .unwrap();
    assert_eq!(preview.current_phase, "design");

    let stored = helper.fresh_engine().get_state(&instance_id).await.unwrap().unwrap();
    assert_eq!(stored.current_phase, "analyze");
    assert_eq!(stored.status, WorkflowStatus::Created);
    assert!(!stored.variables.contains_key("note"));

    let cached = helper.engine.get_state(&instance_id).await.unwrap().unwrap();
    assert_eq!(cached.current_phase, "analyze");

    let history = helper.engine.get_history(&instance_id).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_unknown_instance_is_not_found() {
    let helper = EngineTestHelper::new();

    let err = helper
        .engine
        .trigger("wfi_0000000000000000", Variables::new(), false, None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    assert!(helper.engine.get_state("wfi_0000000000000000").await.unwrap().is_none());
    assert!(helper.engine.get_status_info("wfi_0000000000000000").await.unwrap().is_none());
    assert!(helper.engine.pause("wfi_0000000000000000").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_duplicate_phases_fail_validation() {
    let helper = EngineTestHelper::new();

    let parsed = WorkflowSchema::from_value(&json!({
        "name": "dup",
        "phases": [{"name": "a"}, {"name": "a"}]
    }));
    assert!(matches!(parsed, Err(SchemaError::DuplicatePhase { .. })));

    let unchecked = WorkflowSchema {
        name: "dup".to_string(),
        version: "1.0".to_string(),
        phases: vec![PhaseDefinition::new("a", "t"), PhaseDefinition::new("a", "t")],
    };
    let err = helper
        .engine
        .start(&unchecked, Variables::new(), "feat_dup", Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(SchemaError::DuplicatePhase { .. })));
    assert!(helper.engine.list_by_feature("feat_dup").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_condition_fails_start() {
    let helper = EngineTestHelper::new();

    let unchecked = WorkflowSchema {
        name: "cond".to_string(),
        version: "1.0".to_string(),
        phases: vec![
            PhaseDefinition::new("a", "t"),
            PhaseDefinition::new("b", "t").with_condition(ConditionExpression::and(vec![])),
        ],
    };
    let err = helper
        .engine
        .start(&unchecked, Variables::new(), "feat_cond", Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Validation(SchemaError::MalformedCondition { .. })));
    assert!(helper.engine.list_by_feature("feat_cond").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_new_schema_version_leaves_running_instances_alone() {
    let helper = EngineTestHelper::new();
    let v1 = schema(json!({
        "name": "evolving",
        "version": "1.0",
        "phases": [{"name": "a"}, {"name": "b"}, {"name": "c"}]
    }));
    let v2 = schema(json!({
        "name": "evolving",
        "version": "2.0",
        "phases": [{"name": "a"}, {"name": "z"}]
    }));

    let old_instance = helper.start(&v1, "feat_versions").await;
    let new_instance = helper.start(&v2, "feat_versions").await;

    let restarted = helper.fresh_engine();
    let old_state = restarted
        .trigger(&old_instance, Variables::new(), false, None)
        .await
        .unwrap();
    assert_eq!(old_state.schema_version, "1.0");
    assert_eq!(old_state.current_phase, "b");

    let new_state = restarted
        .trigger(&new_instance, Variables::new(), false, None)
        .await
        .unwrap();
    assert_eq!(new_state.schema_version, "2.0");
    assert_eq!(new_state.current_phase, "z");
}

#[tokio::test]
async fn test_empty_schema_starts_unknown_and_completes() {
    let helper = EngineTestHelper::new();
    let flow = schema(json!({"name": "empty", "phases": []}));
    let instance_id = helper.start(&flow, "feat_empty").await;

    let state = helper.engine.get_state(&instance_id).await.unwrap().unwrap();
    assert_eq!(state.current_phase, "unknown");

    let state = helper.trigger(&instance_id, json!({})).await;
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.current_phase, "unknown");
}

#[tokio::test]
async fn test_state_survives_engine_restart() {
    let helper = EngineTestHelper::new();
    let instance_id = helper.start(&linear_schema(), "feat_restart").await;
    helper.trigger(&instance_id, json!({"owner": "alice"})).await;

    let restarted = helper.fresh_engine();
    let state = restarted
        .trigger(&instance_id, Variables::new(), false, Some(vars(json!({"source": "ci"}))))
        .await
        .unwrap();

    assert_eq!(state.current_phase, "implement");
    assert_eq!(state.variables["owner"], json!("alice"));
    assert_eq!(state.meta["source"], json!("ci"));

    let info = restarted.get_status_info(&instance_id).await.unwrap().unwrap();
    assert_eq!(info.current_phase, "implement");
    assert!((info.progress - 2.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_feature_status_aggregates_instances() {
    let helper = EngineTestHelper::new();
    let first = helper.start(&linear_schema(), "feat_agg").await;
    let second = helper.start(&linear_schema(), "feat_agg").await;
    helper.start(&linear_schema(), "feat_other").await;

    assert_eq!(helper.engine.list_by_feature("feat_agg").await.unwrap(), vec![first.clone(), second.clone()]);

    let status = helper.engine.get_feature_status("feat_agg").await.unwrap();
    assert_eq!(status.instance_count(), 2);
    assert_eq!(status.overall, FeatureProgress::Pending);
    assert_eq!(status.status_counts.get(&WorkflowStatus::Created), Some(&2));
    assert_eq!(status.instances[0].next_phase.as_deref(), Some("design"));

    helper.trigger(&first, json!({})).await;
    let status = helper.engine.get_feature_status("feat_agg").await.unwrap();
    assert_eq!(status.overall, FeatureProgress::InProgress);
    assert_eq!(status.completed_phases, 1);
    assert_eq!(status.total_phases, 6);
    assert_eq!(status.status_counts.get(&WorkflowStatus::Running), Some(&1));
    assert_eq!(status.instances[0].current_phase, "design");
    assert_eq!(status.instances[0].next_phase.as_deref(), Some("implement"));

    let none = helper.engine.get_feature_status("feat_missing").await.unwrap();
    assert_eq!(none.overall, FeatureProgress::Unknown);
    assert!(none.instances.is_empty());

    let features = helper.engine.list_features().await.unwrap();
    assert_eq!(features, vec!["feat_agg".to_string(), "feat_other".to_string()]);
}

fn review_schema() -> WorkflowSchema {
    schema(json!({
        "name": "review_flow",
        "phases": [
            {"name": "analyze"},
            {"name": "implement"},
            {"name": "security_review"},
            {"name": "migration_plan"}
        ]
    }))
}

#[tokio::test]
async fn test_recommendation_standard_without_confirmed_output() {
    let helper = EngineTestHelper::new();
    let instance_id = helper.start(&review_schema(), "feat_rec").await;

    let rec = helper.engine.recommend_next_phase("feat_rec").await.unwrap().unwrap();
    assert_eq!(rec.source, RecommendationSource::Standard);
    assert_eq!(rec.phase, "implement");
    assert_eq!(rec.instance_id, instance_id);

    helper
        .engine
        .save_task_artifacts(
            "feat_rec",
            &instance_id,
            "analyze",
            TaskExecutionRecord::new("analyze", TaskStatus::Failed),
            "analyze prompt",
            "there is a security risk here",
        )
        .await
        .unwrap();

    let rec = helper.engine.recommend_next_phase("feat_rec").await.unwrap().unwrap();
    assert_eq!(rec.source, RecommendationSource::Standard);

    assert!(helper.engine.recommend_next_phase("feat_nothing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_recommendation_smart_override() {
    let helper = EngineTestHelper::new();
    let instance_id = helper.start(&review_schema(), "feat_rec").await;

    let record = helper
        .engine
        .save_task_artifacts(
            "feat_rec",
            &instance_id,
            "analyze",
            TaskExecutionRecord::new("analyze", TaskStatus::Confirmed),
            "Analyze the login feature",
            "Storing tokens in plain text is a Security risk.",
        )
        .await
        .unwrap();
    assert_eq!(record.status, TaskStatus::Confirmed);

    let rec = helper.engine.recommend_next_phase("feat_rec").await.unwrap().unwrap();
    assert_eq!(rec.source, RecommendationSource::Smart);
    assert_eq!(rec.phase, "security_review");
    assert_eq!(rec.standard_phase, "implement");
}

#[tokio::test]
async fn test_smart_rule_ignored_when_target_phase_absent() {
    let helper = EngineTestHelper::new();
    let instance_id = helper.start(&linear_schema(), "feat_rec").await;

    helper
        .engine
        .save_task_artifacts(
            "feat_rec",
            &instance_id,
            "analyze",
            TaskExecutionRecord::new("analyze", TaskStatus::Success),
            "prompt",
            "needs a database migration",
        )
        .await
        .unwrap();

    let rec = helper.engine.recommend_next_phase("feat_rec").await.unwrap().unwrap();
    assert_eq!(rec.source, RecommendationSource::Standard);
    assert_eq!(rec.phase, "design");
}

#[tokio::test]
async fn test_task_artifacts_round_trip() {
    let helper = EngineTestHelper::new();
    let instance_id = helper.start(&linear_schema(), "feat_art").await;

    let first = helper
        .engine
        .save_task_artifacts(
            "feat_art",
            &instance_id,
            "analyze",
            TaskExecutionRecord::new("analyze", TaskStatus::Confirmed),
            "same prompt",
            "response one",
        )
        .await
        .unwrap();
    let second = helper
        .engine
        .save_task_artifacts(
            "feat_art",
            &instance_id,
            "design",
            TaskExecutionRecord::new("design", TaskStatus::Confirmed),
            "same prompt",
            "response two",
        )
        .await
        .unwrap();

    assert_eq!(first.prompt_checksum, second.prompt_checksum);
    assert_ne!(first.response_checksum, second.response_checksum);
    assert_eq!(first.prompt_checksum, chatflow::calculate_checksum("same prompt"));

    let records = helper.engine.list_task_records(&instance_id).await.unwrap();
    assert_eq!(records.len(), 2);

    let text = helper
        .engine
        .read_artifact(&instance_id, &second.artifact_paths["response"])
        .await
        .unwrap();
    assert_eq!(text.as_deref(), Some("response two"));
}
