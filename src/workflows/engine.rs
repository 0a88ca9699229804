//! Workflow engine: starts instances and moves them through their schema.
//!
//! Every read-modify-write of an instance runs under that instance's file
//! lock and reloads state from the store, so any number of engines (in this
//! process or others) can share one storage root. The in-process caches are
//! only used for reads and expire after the configured TTL.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

use super::conditions::evaluate;
use super::loader::{FileSchemaLoader, SchemaLoader};
use super::recommend::{
    default_smart_rules, FeatureProgress, FeatureStatus, InstanceSummary, Recommendation,
    RecommendationSource, SmartRule,
};
use super::schema::{SchemaError, WorkflowSchema};
use super::state::{
    HistoryEvent, HistoryEventType, TaskExecutionRecord, Variables, WorkflowInstanceState,
    WorkflowStartResult, WorkflowStatus, WorkflowStatusInfo, SYSTEM_TASK, UNKNOWN_PHASE,
};
use crate::config::{ChatflowConfig, EngineConfig};
use crate::error::FlowError;
use crate::ids::{generate_correlation_id, generate_instance_id};
use crate::storage::{FileLock, FileStateStore, StateStore};
use crate::telemetry::create_workflow_span;

/// Why a phase was passed over while resolving the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    ConditionFalse,
    Fallback { target: String },
}

impl SkipReason {
    fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ConditionFalse => "condition_false",
            SkipReason::Fallback { .. } => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPhase {
    pub phase: String,
    pub reason: SkipReason,
}

/// Outcome of next-phase resolution: index of the selected phase, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseResolution {
    pub next: Option<usize>,
    pub skipped: Vec<SkippedPhase>,
}

/// Find the phase that follows `current_phase`.
///
/// Starts right after `current_phase` (or at the first phase when it is not
/// part of the schema). A phase whose condition is false jumps to its
/// fallback when it has one and is skipped otherwise; skipping repeats until
/// a phase is selected or the schema is exhausted.
pub fn resolve_next(schema: &WorkflowSchema, current_phase: &str, variables: &Variables) -> PhaseResolution {
    let mut candidate = schema.phase_index(current_phase).map_or(0, |index| index + 1);
    let mut skipped = Vec::new();

    while let Some(phase) = schema.phases.get(candidate) {
        match &phase.condition {
            Some(condition) if !evaluate(condition, variables) => {
                let fallback = phase
                    .fallback_phase
                    .as_deref()
                    .and_then(|name| schema.phase_index(name).map(|index| (name, index)));

                if let Some((target, index)) = fallback {
                    skipped.push(SkippedPhase {
                        phase: phase.name.clone(),
                        reason: SkipReason::Fallback {
                            target: target.to_string(),
                        },
                    });
                    return PhaseResolution {
                        next: Some(index),
                        skipped,
                    };
                }

                skipped.push(SkippedPhase {
                    phase: phase.name.clone(),
                    reason: SkipReason::ConditionFalse,
                });
                candidate += 1;
            }
            _ => {
                return PhaseResolution {
                    next: Some(candidate),
                    skipped,
                }
            }
        }
    }

    PhaseResolution { next: None, skipped }
}

/// Mark the current phase as finished before moving on.
fn close_out_phase(state: &mut WorkflowInstanceState, schema: &WorkflowSchema, trigger_data: &Variables, now: DateTime<Utc>) {
    if schema.phase_index(&state.current_phase).is_none() {
        return;
    }
    let snapshot = Value::Object(trigger_data.clone());

    match state.last_phase_started(&state.current_phase) {
        Some(index) => {
            let data = &mut state.history[index].data;
            data.insert("status".to_string(), Value::from("completed"));
            data.insert("ended_at".to_string(), Value::from(now.to_rfc3339()));
            data.insert("trigger_data_snapshot".to_string(), snapshot);
        }
        None => {
            let task = schema
                .phase(&state.current_phase)
                .map_or(SYSTEM_TASK, |phase| phase.task.as_str());
            let event = HistoryEvent::new(HistoryEventType::PhaseCompleted, state.current_phase.clone(), task)
                .with_data("ended_at", now.to_rfc3339())
                .with_data("trigger_data_snapshot", snapshot);
            state.history.push(event);
        }
    }
}

fn schema_key(name: &str, version: &str) -> String {
    format!("{}@{}", name, version)
}

pub struct WorkflowEngine {
    store: Arc<dyn StateStore>,
    schemas: Arc<dyn SchemaLoader>,
    state_cache: Cache<String, WorkflowInstanceState>,
    schema_cache: Cache<String, Arc<WorkflowSchema>>,
    lock_timeout: Duration,
    lock_poll_interval: Duration,
    default_automation_level: u8,
    smart_rules: Vec<SmartRule>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn StateStore>, schemas: Arc<dyn SchemaLoader>, config: &EngineConfig) -> Self {
        let state_cache = Cache::builder()
            .max_capacity(config.cache_max_capacity)
            .time_to_live(config.cache_ttl())
            .build();
        let schema_cache = Cache::builder()
            .max_capacity(config.cache_max_capacity)
            .time_to_live(config.cache_ttl())
            .build();

        Self {
            store,
            schemas,
            state_cache,
            schema_cache,
            lock_timeout: config.lock_timeout(),
            lock_poll_interval: config.lock_poll_interval(),
            default_automation_level: config.default_automation_level.min(100),
            smart_rules: default_smart_rules(),
        }
    }

    /// File-backed engine rooted at `config.storage.root`.
    pub fn from_config(config: &ChatflowConfig) -> Self {
        let store = FileStateStore::new(&config.storage.root).with_lock_timeout(config.engine.lock_timeout());
        let schemas = FileSchemaLoader::new(store.schemas_dir());
        Self::new(Arc::new(store), Arc::new(schemas), &config.engine)
    }

    /// Replace the keyword rules used by [`WorkflowEngine::recommend_next_phase`].
    pub fn with_smart_rules(mut self, rules: Vec<SmartRule>) -> Self {
        self.smart_rules = rules;
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    fn instance_lock(&self, instance_id: &str) -> FileLock {
        FileLock::new(self.store.lock_path(instance_id))
            .with_timeout(self.lock_timeout)
            .with_poll_interval(self.lock_poll_interval)
    }

    async fn load_schema(&self, name: &str, version: &str) -> Result<Arc<WorkflowSchema>, SchemaError> {
        let key = schema_key(name, version);
        if let Some(schema) = self.schema_cache.get(&key).await {
            return Ok(schema);
        }
        let schema = Arc::new(self.schemas.load(name, version).await?);
        self.schema_cache.insert(key, schema.clone()).await;
        Ok(schema)
    }

    /// Persist `schema` under its name and version. A stored schema with the
    /// same name and version must have identical content.
    async fn register_schema(&self, schema: &WorkflowSchema) -> Result<(), FlowError> {
        match self.load_schema(&schema.name, &schema.version).await {
            Ok(existing) if *existing == *schema => return Ok(()),
            Ok(_) => {
                return Err(SchemaError::VersionConflict {
                    name: schema.name.clone(),
                    version: schema.version.clone(),
                }
                .into())
            }
            Err(SchemaError::NotFound { .. }) => {}
            Err(e) => {
                warn!(schema = %schema.name, version = %schema.version, error = %e, "Replacing unreadable stored schema");
            }
        }

        self.store.save_schema(schema).await?;
        self.schema_cache
            .insert(schema_key(&schema.name, &schema.version), Arc::new(schema.clone()))
            .await;
        Ok(())
    }

    /// Create a new instance positioned at the schema's first phase.
    pub async fn start(
        &self,
        schema: &WorkflowSchema,
        initial_context: Variables,
        feature_id: &str,
        meta: Map<String, Value>,
    ) -> Result<WorkflowStartResult, FlowError> {
        let instance_id = generate_instance_id();
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("start", Some(instance_id.as_str()), Some(feature_id), &correlation_id);

        async {
            schema.validate()?;
            self.register_schema(schema).await?;

            let automation_level = meta
                .get("automation_level")
                .and_then(Value::as_u64)
                .map(|level| level.min(100) as u8)
                .unwrap_or(self.default_automation_level);
            let initial_phase = schema
                .first_phase()
                .map_or_else(|| UNKNOWN_PHASE.to_string(), |phase| phase.name.clone());
            let now = Utc::now();

            let started = HistoryEvent::new(HistoryEventType::WorkflowStarted, initial_phase.clone(), SYSTEM_TASK)
                .with_data("feature_id", feature_id)
                .with_data("schema_version", schema.version.clone());

            let state = WorkflowInstanceState {
                instance_id: instance_id.clone(),
                feature_id: feature_id.to_string(),
                workflow_name: schema.name.clone(),
                schema_version: schema.version.clone(),
                current_phase: initial_phase.clone(),
                status: WorkflowStatus::Created,
                history: vec![started],
                variables: initial_context,
                created_at: now,
                updated_at: now,
                automation_level,
                meta,
                total_phases: schema.len(),
            };

            self.store.save(&instance_id, &state).await?;
            self.state_cache.insert(instance_id.clone(), state).await;

            info!(
                instance_id = %instance_id,
                feature_id = %feature_id,
                workflow = %schema.name,
                version = %schema.version,
                initial_phase = %initial_phase,
                "Workflow instance started"
            );

            Ok::<_, FlowError>(WorkflowStartResult {
                instance_id: instance_id.clone(),
                initial_phase,
                created_at: now,
            })
        }
        .instrument(span)
        .await
    }

    /// Advance an instance to its next phase.
    ///
    /// With `dry_run` the resulting state is computed and returned but nothing
    /// is written and no lock is taken.
    pub async fn trigger(
        &self,
        instance_id: &str,
        trigger_data: Variables,
        dry_run: bool,
        meta: Option<Map<String, Value>>,
    ) -> Result<WorkflowInstanceState, FlowError> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("trigger", Some(instance_id), None, &correlation_id);

        async {
            if dry_run {
                return self.transition(instance_id, trigger_data, true, meta).await;
            }
            self.instance_lock(instance_id)
                .run_exclusive(|| self.transition(instance_id, trigger_data, false, meta))
                .await
        }
        .instrument(span)
        .await
    }

    async fn transition(
        &self,
        instance_id: &str,
        trigger_data: Variables,
        dry_run: bool,
        meta: Option<Map<String, Value>>,
    ) -> Result<WorkflowInstanceState, FlowError> {
        let mut state = self
            .store
            .load(instance_id)
            .await?
            .ok_or_else(|| FlowError::NotFound {
                instance_id: instance_id.to_string(),
            })?;

        if matches!(
            state.status,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Paused
        ) {
            return Err(FlowError::InvalidTransition {
                instance_id: instance_id.to_string(),
                status: state.status,
            });
        }

        let schema = match self.load_schema(&state.workflow_name, &state.schema_version).await {
            Ok(schema) => schema,
            Err(source) => {
                error!(
                    instance_id = %instance_id,
                    workflow = %state.workflow_name,
                    error = %source,
                    "Schema resolution failed, marking instance failed"
                );
                state.status = WorkflowStatus::Failed;
                state.updated_at = Utc::now();
                state.history.push(
                    HistoryEvent::new(HistoryEventType::WorkflowFailed, state.current_phase.clone(), SYSTEM_TASK)
                        .with_data("error", source.to_string()),
                );
                if !dry_run {
                    self.persist(instance_id, &state).await?;
                }
                return Err(FlowError::SchemaUnavailable {
                    workflow: state.workflow_name,
                    source,
                });
            }
        };

        let now = Utc::now();
        let from_phase = state.current_phase.clone();
        close_out_phase(&mut state, &schema, &trigger_data, now);
        state.variables.extend(trigger_data);

        let resolution = resolve_next(&schema, &state.current_phase, &state.variables);
        for skipped in &resolution.skipped {
            let mut event = HistoryEvent::new(HistoryEventType::PhaseSkipped, skipped.phase.clone(), SYSTEM_TASK)
                .with_data("reason", skipped.reason.as_str());
            if let SkipReason::Fallback { target } = &skipped.reason {
                event = event.with_data("fallback_phase", target.clone());
            }
            debug!(instance_id = %instance_id, phase = %skipped.phase, reason = %skipped.reason.as_str(), "Phase skipped");
            state.history.push(event);
        }

        match resolution.next.and_then(|index| schema.phases.get(index)) {
            Some(phase) => {
                state.current_phase = phase.name.clone();
                state.status = WorkflowStatus::Running;
                state.history.push(
                    HistoryEvent::new(HistoryEventType::PhaseStarted, phase.name.clone(), phase.task.clone())
                        .with_data("status", "running")
                        .with_data("started_at", now.to_rfc3339())
                        .with_data("execution_strategy", phase.execution_strategy.clone()),
                );
            }
            None => {
                state.status = WorkflowStatus::Completed;
                state.history.push(
                    HistoryEvent::new(HistoryEventType::WorkflowCompleted, state.current_phase.clone(), SYSTEM_TASK)
                        .with_data("completed_at", now.to_rfc3339()),
                );
            }
        }

        if let Some(meta) = meta {
            state.meta.extend(meta);
        }
        state.updated_at = now;

        if !dry_run {
            self.persist(instance_id, &state).await?;
        }

        info!(
            instance_id = %instance_id,
            from_phase = %from_phase,
            to_phase = %state.current_phase,
            status = %state.status,
            skipped = %resolution.skipped.len(),
            dry_run = %dry_run,
            "Workflow transition"
        );
        Ok(state)
    }

    async fn persist(&self, instance_id: &str, state: &WorkflowInstanceState) -> Result<(), FlowError> {
        self.store.save(instance_id, state).await?;
        self.state_cache.insert(instance_id.to_string(), state.clone()).await;
        Ok(())
    }

    /// Stop an instance from advancing until [`WorkflowEngine::resume`].
    pub async fn pause(&self, instance_id: &str) -> Result<WorkflowInstanceState, FlowError> {
        self.set_paused(instance_id, true).await
    }

    pub async fn resume(&self, instance_id: &str) -> Result<WorkflowInstanceState, FlowError> {
        self.set_paused(instance_id, false).await
    }

    async fn set_paused(&self, instance_id: &str, pause: bool) -> Result<WorkflowInstanceState, FlowError> {
        let correlation_id = generate_correlation_id();
        let operation = if pause { "pause" } else { "resume" };
        let span = create_workflow_span(operation, Some(instance_id), None, &correlation_id);

        async {
            self.instance_lock(instance_id)
                .run_exclusive(|| async {
                    let mut state = self
                        .store
                        .load(instance_id)
                        .await?
                        .ok_or_else(|| FlowError::NotFound {
                            instance_id: instance_id.to_string(),
                        })?;

                    let allowed = if pause {
                        matches!(state.status, WorkflowStatus::Created | WorkflowStatus::Running)
                    } else {
                        state.status == WorkflowStatus::Paused
                    };
                    if !allowed {
                        return Err(FlowError::InvalidTransition {
                            instance_id: instance_id.to_string(),
                            status: state.status,
                        });
                    }

                    let (status, event_type) = if pause {
                        (WorkflowStatus::Paused, HistoryEventType::WorkflowPaused)
                    } else {
                        (WorkflowStatus::Running, HistoryEventType::WorkflowResumed)
                    };
                    state.status = status;
                    state.updated_at = Utc::now();
                    state
                        .history
                        .push(HistoryEvent::new(event_type, state.current_phase.clone(), SYSTEM_TASK));

                    self.persist(instance_id, &state).await?;
                    info!(instance_id = %instance_id, status = %state.status, "Workflow {}d", operation);
                    Ok(state)
                })
                .await
        }
        .instrument(span)
        .await
    }

    /// Current state, served from the cache while it is fresh.
    pub async fn get_state(&self, instance_id: &str) -> Result<Option<WorkflowInstanceState>, FlowError> {
        if let Some(state) = self.state_cache.get(instance_id).await {
            return Ok(Some(state));
        }
        let state = self.store.load(instance_id).await?;
        if let Some(state) = &state {
            self.state_cache.insert(instance_id.to_string(), state.clone()).await;
        }
        Ok(state)
    }

    pub async fn get_status_info(&self, instance_id: &str) -> Result<Option<WorkflowStatusInfo>, FlowError> {
        Ok(self.store.get_status_info(instance_id).await?)
    }

    pub async fn get_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>, FlowError> {
        Ok(self.store.get_history(instance_id).await?)
    }

    pub async fn list_by_feature(&self, feature_id: &str) -> Result<Vec<String>, FlowError> {
        Ok(self.store.list_by_feature(feature_id).await?)
    }

    pub async fn list_features(&self) -> Result<Vec<String>, FlowError> {
        Ok(self.store.list_features().await?)
    }

    pub async fn save_task_artifacts(
        &self,
        feature_id: &str,
        instance_id: &str,
        phase_name: &str,
        record: TaskExecutionRecord,
        prompt_text: &str,
        response_text: &str,
    ) -> Result<TaskExecutionRecord, FlowError> {
        Ok(self
            .store
            .save_task_artifacts(feature_id, instance_id, phase_name, record, prompt_text, response_text)
            .await?)
    }

    pub async fn list_task_records(&self, instance_id: &str) -> Result<Vec<TaskExecutionRecord>, FlowError> {
        Ok(self.store.list_task_records(instance_id).await?)
    }

    pub async fn read_artifact(&self, instance_id: &str, relative_path: &str) -> Result<Option<String>, FlowError> {
        Ok(self.store.read_artifact(instance_id, relative_path).await?)
    }

    /// Aggregate every instance of a feature.
    pub async fn get_feature_status(&self, feature_id: &str) -> Result<FeatureStatus, FlowError> {
        let instance_ids = self.store.list_by_feature(feature_id).await?;

        let mut instances = Vec::with_capacity(instance_ids.len());
        let mut status_counts: BTreeMap<WorkflowStatus, usize> = BTreeMap::new();
        let mut completed_phases = 0;
        let mut total_phases = 0;

        for instance_id in &instance_ids {
            let Some(state) = self.store.load(instance_id).await? else {
                warn!(feature_id = %feature_id, instance_id = %instance_id, "Indexed instance has no readable state");
                continue;
            };

            let next_phase = if state.status.is_terminal() {
                None
            } else {
                match self.load_schema(&state.workflow_name, &state.schema_version).await {
                    Ok(schema) => resolve_next(&schema, &state.current_phase, &state.variables)
                        .next
                        .and_then(|index| schema.phases.get(index))
                        .map(|phase| phase.name.clone()),
                    Err(e) => {
                        warn!(instance_id = %instance_id, workflow = %state.workflow_name, error = %e, "Schema unavailable for status");
                        None
                    }
                }
            };

            let completed = state.completed_phase_count();
            *status_counts.entry(state.status).or_default() += 1;
            completed_phases += completed;
            total_phases += state.total_phases;

            instances.push(InstanceSummary {
                progress: state.progress(),
                instance_id: state.instance_id,
                workflow_name: state.workflow_name,
                schema_version: state.schema_version,
                status: state.status,
                current_phase: state.current_phase,
                next_phase,
                completed_phases: completed,
                total_phases: state.total_phases,
                created_at: state.created_at,
            });
        }

        Ok(FeatureStatus {
            feature_id: feature_id.to_string(),
            overall: FeatureProgress::from_counts(instances.len(), completed_phases, total_phases),
            status_counts,
            completed_phases,
            total_phases,
            instances,
        })
    }

    /// Suggest the phase to run next for a feature.
    ///
    /// The schema-order choice of the latest instance is always computed. A
    /// keyword rule matched against the latest confirmed response may replace
    /// it when the rule's target phase exists in that instance's schema.
    pub async fn recommend_next_phase(&self, feature_id: &str) -> Result<Option<Recommendation>, FlowError> {
        let status = self.get_feature_status(feature_id).await?;
        let Some(latest) = status.latest_instance() else {
            return Ok(None);
        };
        let Some(standard_phase) = latest.next_phase.clone() else {
            return Ok(None);
        };

        let mut recommendation = Recommendation {
            feature_id: feature_id.to_string(),
            instance_id: latest.instance_id.clone(),
            phase: standard_phase.clone(),
            source: RecommendationSource::Standard,
            reason: "next phase in schema order".to_string(),
            standard_phase,
        };

        if let Some(text) = self.latest_confirmed_response(&latest.instance_id).await? {
            if let Ok(schema) = self.load_schema(&latest.workflow_name, &latest.schema_version).await {
                let rule = self.smart_rules.iter().find(|rule| {
                    rule.target_phase != recommendation.standard_phase
                        && schema.phase(&rule.target_phase).is_some()
                        && rule.matches(&text)
                });
                if let Some(rule) = rule {
                    recommendation.phase = rule.target_phase.clone();
                    recommendation.source = RecommendationSource::Smart;
                    recommendation.reason = rule.reason.clone();
                }
            }
        }

        info!(
            feature_id = %feature_id,
            phase = %recommendation.phase,
            source = %recommendation.source,
            "Next phase recommended"
        );
        Ok(Some(recommendation))
    }

    async fn latest_confirmed_response(&self, instance_id: &str) -> Result<Option<String>, FlowError> {
        let records = self.store.list_task_records(instance_id).await?;
        let Some(record) = records.iter().rev().find(|record| record.status.is_confirmed()) else {
            return Ok(None);
        };
        let Some(path) = record.artifact_paths.get("response") else {
            return Ok(None);
        };
        Ok(self.store.read_artifact(instance_id, path).await?)
    }
}
