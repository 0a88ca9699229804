//! Persisted workflow instance records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Accumulated per-instance variables, also the condition evaluation context.
pub type Variables = Map<String, Value>;

pub const UNKNOWN_PHASE: &str = "unknown";
pub const SYSTEM_TASK: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Created => "created",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventType {
    WorkflowStarted,
    PhaseStarted,
    PhaseCompleted,
    PhaseSkipped,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCompleted,
    WorkflowFailed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_type: HistoryEventType,
    pub phase: String,
    pub task: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl HistoryEvent {
    pub fn new(event_type: HistoryEventType, phase: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            event_type,
            phase: phase.into(),
            task: task.into(),
            timestamp: Utc::now(),
            data: Map::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Either an explicit completion event or a started event closed out as completed.
    pub fn marks_phase_completed(&self) -> bool {
        match self.event_type {
            HistoryEventType::PhaseCompleted => true,
            HistoryEventType::PhaseStarted => {
                self.data.get("status").and_then(Value::as_str) == Some("completed")
            }
            _ => false,
        }
    }
}

/// Full runtime state of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstanceState {
    pub instance_id: String,
    pub feature_id: String,
    pub workflow_name: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub current_phase: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
    #[serde(default)]
    pub variables: Variables,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_automation_level")]
    pub automation_level: u8,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default = "default_total_phases")]
    pub total_phases: usize,
}

fn default_schema_version() -> String {
    crate::workflows::schema::DEFAULT_VERSION.to_string()
}

fn default_automation_level() -> u8 {
    60
}

fn default_total_phases() -> usize {
    1
}

impl WorkflowInstanceState {
    pub fn completed_phase_count(&self) -> usize {
        self.history.iter().filter(|e| e.marks_phase_completed()).count()
    }

    /// Fraction of phases completed, clamped to `[0.0, 1.0]`.
    pub fn progress(&self) -> f64 {
        let total = self.total_phases.max(1);
        let completed = self.completed_phase_count();
        if completed >= total {
            1.0
        } else {
            completed as f64 / total as f64
        }
    }

    /// Index of the most recent `phase_started` event for `phase`.
    pub fn last_phase_started(&self, phase: &str) -> Option<usize> {
        self.history
            .iter()
            .rposition(|e| e.event_type == HistoryEventType::PhaseStarted && e.phase == phase)
    }

    pub fn status_info(&self) -> WorkflowStatusInfo {
        WorkflowStatusInfo {
            instance_id: self.instance_id.clone(),
            feature_id: self.feature_id.clone(),
            workflow_name: self.workflow_name.clone(),
            status: self.status,
            current_phase: self.current_phase.clone(),
            progress: self.progress(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Compact projection kept beside the full state for cheap listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusInfo {
    pub instance_id: String,
    pub feature_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub current_phase: String,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStartResult {
    pub instance_id: String,
    pub initial_phase: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Confirmed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Output of this task has been accepted and may steer recommendations.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, TaskStatus::Confirmed | TaskStatus::Success)
    }
}

/// Metadata stored for one phase's prompt/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    pub phase_name: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub feature_id: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub prompt_checksum: String,
    #[serde(default)]
    pub response_checksum: String,
    #[serde(default)]
    pub artifact_paths: BTreeMap<String, String>,
}

impl TaskExecutionRecord {
    pub fn new(phase_name: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            phase_name: phase_name.into(),
            status,
            started_at: Utc::now(),
            ended_at: None,
            feature_id: String::new(),
            instance_id: String::new(),
            prompt_checksum: String::new(),
            response_checksum: String::new(),
            artifact_paths: BTreeMap::new(),
        }
    }

    pub fn finished(mut self, ended_at: DateTime<Utc>) -> Self {
        self.ended_at = Some(ended_at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_state() -> WorkflowInstanceState {
        let now = Utc::now();
        WorkflowInstanceState {
            instance_id: "wfi_test".to_string(),
            feature_id: "feat_login".to_string(),
            workflow_name: "default".to_string(),
            schema_version: "1.0".to_string(),
            current_phase: "analyze".to_string(),
            status: WorkflowStatus::Running,
            history: vec![],
            variables: Map::new(),
            created_at: now,
            updated_at: now,
            automation_level: 60,
            meta: Map::new(),
            total_phases: 4,
        }
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_value(WorkflowStatus::Completed).unwrap(), json!("completed"));
        let parsed: WorkflowStatus = serde_json::from_value(json!("paused")).unwrap();
        assert_eq!(parsed, WorkflowStatus::Paused);
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
    }

    #[test]
    fn test_progress_accepts_both_completion_forms() {
        let mut state = sample_state();
        state.history.push(HistoryEvent::new(HistoryEventType::PhaseCompleted, "analyze", "a"));
        state.history.push(
            HistoryEvent::new(HistoryEventType::PhaseStarted, "design", "d").with_data("status", "completed"),
        );
        state.history.push(HistoryEvent::new(HistoryEventType::PhaseStarted, "implement", "i"));

        assert_eq!(state.completed_phase_count(), 2);
        assert!((state.progress() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_progress_guards_zero_total() {
        let mut state = sample_state();
        state.total_phases = 0;
        assert_eq!(state.progress(), 0.0);

        state.history.push(HistoryEvent::new(HistoryEventType::PhaseCompleted, "analyze", "a"));
        state.history.push(HistoryEvent::new(HistoryEventType::PhaseCompleted, "design", "d"));
        assert_eq!(state.progress(), 1.0);
    }

    #[test]
    fn test_unknown_event_types_deserialize() {
        let event: HistoryEvent = serde_json::from_value(json!({
            "event_type": "custom_marker",
            "phase": "analyze",
            "task": "system",
            "timestamp": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(event.event_type, HistoryEventType::Other);
        assert!(event.data.is_empty());
    }

    #[test]
    fn test_missing_total_phases_defaults_to_one() {
        let mut value = serde_json::to_value(sample_state()).unwrap();
        value.as_object_mut().unwrap().remove("total_phases");
        let state: WorkflowInstanceState = serde_json::from_value(value).unwrap();
        assert_eq!(state.total_phases, 1);
    }

    #[test]
    fn test_missing_schema_version_defaults() {
        let mut value = serde_json::to_value(sample_state()).unwrap();
        value.as_object_mut().unwrap().remove("schema_version");
        let state: WorkflowInstanceState = serde_json::from_value(value).unwrap();
        assert_eq!(state.schema_version, "1.0");
    }
}
