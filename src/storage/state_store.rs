use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use super::atomic::{write_atomic, write_json_atomic};
use super::file_lock::{FileLock, LockError, DEFAULT_LOCK_TIMEOUT};
use crate::checksum::calculate_checksum;
use crate::workflows::{
    HistoryEvent, TaskExecutionRecord, WorkflowInstanceState, WorkflowSchema, WorkflowStatus,
    WorkflowStatusInfo,
};

const INSTANCES_DIR: &str = "instances";
const SCHEMAS_DIR: &str = "schemas";
const LOCKS_DIR: &str = ".locks";
const INDEXES_DIR: &str = ".indexes";
const FEATURE_INDEX_FILE: &str = "feature_index.json";
const INSTANCE_INDEX_FILE: &str = "instance_index.json";
const INDEX_LOCK_FILE: &str = "indexes.lock";
const INSTANCE_LOCK_PREFIX: &str = "instance_";
const FULL_STATE_FILE: &str = "full_state.json";
const HISTORY_FILE: &str = "history.ndjson";
const TASKS_DIR: &str = "tasks";
const ARTIFACTS_DIR: &str = "artifacts";

/// Errors that can occur while reading or writing durable state
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid storage path component '{component}'")]
    InvalidPath { component: String },

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

/// Entry of the instance_id -> summary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub feature_id: String,
    pub status: WorkflowStatus,
    pub updated_at: DateTime<Utc>,
}

pub type FeatureIndex = BTreeMap<String, Vec<String>>;
pub type InstanceIndex = BTreeMap<String, IndexEntry>;

/// Durable storage for workflow instances.
///
/// Writes are atomic per document. Callers that read-modify-write one
/// instance must hold the lock at [`StateStore::lock_path`] for that instance.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist full state, status projection and history, then update indexes.
    async fn save(&self, instance_id: &str, state: &WorkflowInstanceState) -> Result<(), PersistenceError>;

    /// `None` when the instance is missing or its document cannot be decoded.
    async fn load(&self, instance_id: &str) -> Result<Option<WorkflowInstanceState>, PersistenceError>;

    async fn get_status_info(&self, instance_id: &str) -> Result<Option<WorkflowStatusInfo>, PersistenceError>;

    async fn get_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>, PersistenceError>;

    async fn list_by_feature(&self, feature_id: &str) -> Result<Vec<String>, PersistenceError>;

    async fn list_features(&self) -> Result<Vec<String>, PersistenceError>;

    async fn index_entry(&self, instance_id: &str) -> Result<Option<IndexEntry>, PersistenceError>;

    /// Store prompt/response text for a phase and return the record with checksums and paths filled in.
    async fn save_task_artifacts(
        &self,
        feature_id: &str,
        instance_id: &str,
        phase_name: &str,
        record: TaskExecutionRecord,
        prompt_text: &str,
        response_text: &str,
    ) -> Result<TaskExecutionRecord, PersistenceError>;

    async fn list_task_records(&self, instance_id: &str) -> Result<Vec<TaskExecutionRecord>, PersistenceError>;

    /// Read an artifact by the relative path recorded in a task record.
    async fn read_artifact(&self, instance_id: &str, relative_path: &str) -> Result<Option<String>, PersistenceError>;

    async fn save_schema(&self, schema: &WorkflowSchema) -> Result<(), PersistenceError>;

    fn lock_path(&self, instance_id: &str) -> PathBuf;
}

/// File system implementation of [`StateStore`]
pub struct FileStateStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn schemas_dir(&self) -> PathBuf {
        self.root.join(SCHEMAS_DIR)
    }

    fn instances_dir(&self) -> PathBuf {
        self.root.join(INSTANCES_DIR)
    }

    fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.instances_dir().join(instance_id)
    }

    fn status_file(&self, instance_id: &str) -> PathBuf {
        self.instances_dir().join(format!("{}.json", instance_id))
    }

    fn feature_index_path(&self) -> PathBuf {
        self.root.join(INDEXES_DIR).join(FEATURE_INDEX_FILE)
    }

    fn instance_index_path(&self) -> PathBuf {
        self.root.join(INDEXES_DIR).join(INSTANCE_INDEX_FILE)
    }

    fn index_lock(&self) -> FileLock {
        FileLock::new(self.root.join(LOCKS_DIR).join(INDEX_LOCK_FILE)).with_timeout(self.lock_timeout)
    }

    async fn read_indexes(&self) -> Result<(FeatureIndex, InstanceIndex), PersistenceError> {
        let features = parse_optional::<FeatureIndex>(read_optional(&self.feature_index_path()).await?);
        let instances = parse_optional::<InstanceIndex>(read_optional(&self.instance_index_path()).await?);

        match (features, instances) {
            (Ok(features), Ok(instances)) => Ok((features, instances)),
            (features, instances) => {
                warn!(
                    feature_index_ok = %features.is_ok(),
                    instance_index_ok = %instances.is_ok(),
                    "Index files unreadable, rebuilding from status documents"
                );
                self.scan_status_documents().await
            }
        }
    }

    async fn write_indexes(&self, features: &FeatureIndex, instances: &InstanceIndex) -> Result<(), PersistenceError> {
        write_json_atomic(&self.feature_index_path(), features).await?;
        write_json_atomic(&self.instance_index_path(), instances).await
    }

    async fn update_indexes(&self, instance_id: &str, state: &WorkflowInstanceState) -> Result<(), PersistenceError> {
        self.index_lock()
            .run_exclusive(|| async {
                let (mut features, mut instances) = self.read_indexes().await?;

                let ids = features.entry(state.feature_id.clone()).or_default();
                if !ids.iter().any(|id| id == instance_id) {
                    ids.push(instance_id.to_string());
                }
                instances.insert(
                    instance_id.to_string(),
                    IndexEntry {
                        feature_id: state.feature_id.clone(),
                        status: state.status,
                        updated_at: state.updated_at,
                    },
                );

                self.write_indexes(&features, &instances).await
            })
            .await
    }

    /// Rebuild both indexes from the per-instance status documents.
    async fn scan_status_documents(&self) -> Result<(FeatureIndex, InstanceIndex), PersistenceError> {
        let mut infos = Vec::new();
        let mut entries = match fs::read_dir(self.instances_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Default::default()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(contents) = read_optional(&path).await? else {
                continue;
            };
            match serde_json::from_str::<WorkflowStatusInfo>(&contents) {
                Ok(info) => infos.push(info),
                Err(e) => warn!(file = ?path, error = %e, "Skipping unreadable status document"),
            }
        }

        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut features = FeatureIndex::new();
        let mut instances = InstanceIndex::new();
        for info in infos {
            features
                .entry(info.feature_id.clone())
                .or_default()
                .push(info.instance_id.clone());
            instances.insert(
                info.instance_id,
                IndexEntry {
                    feature_id: info.feature_id,
                    status: info.status,
                    updated_at: info.updated_at,
                },
            );
        }
        Ok((features, instances))
    }

    /// Recreate the index files by scanning status documents.
    pub async fn rebuild_indexes(&self) -> Result<usize, PersistenceError> {
        self.index_lock()
            .run_exclusive(|| async {
                let (features, instances) = self.scan_status_documents().await?;
                self.write_indexes(&features, &instances).await?;
                info!(instances = %instances.len(), features = %features.len(), "Rebuilt indexes");
                Ok::<_, PersistenceError>(instances.len())
            })
            .await
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, instance_id: &str, state: &WorkflowInstanceState) -> Result<(), PersistenceError> {
        validate_component(instance_id)?;
        let instance_dir = self.instance_dir(instance_id);

        write_json_atomic(&instance_dir.join(FULL_STATE_FILE), state).await?;
        write_json_atomic(&self.status_file(instance_id), &state.status_info()).await?;

        let mut history = Vec::new();
        for event in &state.history {
            serde_json::to_writer(&mut history, event)?;
            history.push(b'\n');
        }
        write_atomic(&instance_dir.join(HISTORY_FILE), &history).await?;

        self.update_indexes(instance_id, state).await?;

        debug!(
            instance_id = %instance_id,
            status = %state.status,
            current_phase = %state.current_phase,
            history_len = %state.history.len(),
            "Workflow state saved"
        );
        Ok(())
    }

    async fn load(&self, instance_id: &str) -> Result<Option<WorkflowInstanceState>, PersistenceError> {
        if validate_component(instance_id).is_err() {
            return Ok(None);
        }
        let path = self.instance_dir(instance_id).join(FULL_STATE_FILE);
        let Some(contents) = read_optional(&path).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&contents) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(
                    instance_id = %instance_id,
                    file = ?path,
                    error = %e,
                    "Corrupted state document, treating instance as absent"
                );
                Ok(None)
            }
        }
    }

    async fn get_status_info(&self, instance_id: &str) -> Result<Option<WorkflowStatusInfo>, PersistenceError> {
        if validate_component(instance_id).is_err() {
            return Ok(None);
        }
        let path = self.status_file(instance_id);
        let Some(contents) = read_optional(&path).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&contents) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "Corrupted status document");
                Ok(None)
            }
        }
    }

    async fn get_history(&self, instance_id: &str) -> Result<Vec<HistoryEvent>, PersistenceError> {
        if validate_component(instance_id).is_err() {
            return Ok(Vec::new());
        }
        let path = self.instance_dir(instance_id).join(HISTORY_FILE);
        let Some(contents) = read_optional(&path).await? else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    instance_id = %instance_id,
                    line = %(line_no + 1),
                    error = %e,
                    "Skipping unreadable history line"
                ),
            }
        }
        Ok(events)
    }

    async fn list_by_feature(&self, feature_id: &str) -> Result<Vec<String>, PersistenceError> {
        let (features, _) = self.read_indexes().await?;
        Ok(features.get(feature_id).cloned().unwrap_or_default())
    }

    async fn list_features(&self) -> Result<Vec<String>, PersistenceError> {
        let (features, _) = self.read_indexes().await?;
        Ok(features.into_keys().collect())
    }

    async fn index_entry(&self, instance_id: &str) -> Result<Option<IndexEntry>, PersistenceError> {
        let (_, mut instances) = self.read_indexes().await?;
        Ok(instances.remove(instance_id))
    }

    async fn save_task_artifacts(
        &self,
        feature_id: &str,
        instance_id: &str,
        phase_name: &str,
        mut record: TaskExecutionRecord,
        prompt_text: &str,
        response_text: &str,
    ) -> Result<TaskExecutionRecord, PersistenceError> {
        validate_component(instance_id)?;
        let base = artifact_base_name(phase_name);
        let instance_dir = self.instance_dir(instance_id);

        let prompt_path = format!("{}/{}/{}.prompt.md", ARTIFACTS_DIR, base, base);
        let response_path = format!("{}/{}/{}.ai_response.md", ARTIFACTS_DIR, base, base);

        if record.phase_name.is_empty() {
            record.phase_name = phase_name.to_string();
        }
        record.feature_id = feature_id.to_string();
        record.instance_id = instance_id.to_string();
        record.prompt_checksum = calculate_checksum(prompt_text);
        record.response_checksum = calculate_checksum(response_text);
        record.artifact_paths.insert("prompt".to_string(), prompt_path.clone());
        record.artifact_paths.insert("response".to_string(), response_path.clone());

        write_atomic(&instance_dir.join(&prompt_path), prompt_text.as_bytes()).await?;
        write_atomic(&instance_dir.join(&response_path), response_text.as_bytes()).await?;
        write_json_atomic(&instance_dir.join(TASKS_DIR).join(format!("{}.json", base)), &record).await?;

        info!(
            feature_id = %feature_id,
            instance_id = %instance_id,
            phase = %phase_name,
            prompt_checksum = %record.prompt_checksum,
            response_checksum = %record.response_checksum,
            "Task artifacts saved"
        );
        Ok(record)
    }

    async fn list_task_records(&self, instance_id: &str) -> Result<Vec<TaskExecutionRecord>, PersistenceError> {
        if validate_component(instance_id).is_err() {
            return Ok(Vec::new());
        }
        let tasks_dir = self.instance_dir(instance_id).join(TASKS_DIR);
        let mut entries = match fs::read_dir(&tasks_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(contents) = read_optional(&path).await? else {
                continue;
            };
            match serde_json::from_str::<TaskExecutionRecord>(&contents) {
                Ok(record) => records.push(record),
                Err(e) => warn!(file = ?path, error = %e, "Skipping unreadable task record"),
            }
        }

        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }

    async fn read_artifact(&self, instance_id: &str, relative_path: &str) -> Result<Option<String>, PersistenceError> {
        validate_component(instance_id)?;
        let relative = Path::new(relative_path);
        if relative_path.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(PersistenceError::InvalidPath {
                component: relative_path.to_string(),
            });
        }
        read_optional(&self.instance_dir(instance_id).join(relative)).await
    }

    async fn save_schema(&self, schema: &WorkflowSchema) -> Result<(), PersistenceError> {
        let stem = format!("{}@{}", schema.name, schema.version);
        validate_component(&schema.name)?;
        validate_component(&stem)?;
        let path = self.schemas_dir().join(format!("{}.json", stem));
        write_json_atomic(&path, schema).await?;
        debug!(schema = %schema.name, version = %schema.version, file = ?path, "Schema saved");
        Ok(())
    }

    fn lock_path(&self, instance_id: &str) -> PathBuf {
        self.root
            .join(LOCKS_DIR)
            .join(format!("{}{}.lock", INSTANCE_LOCK_PREFIX, file_safe(instance_id)))
    }
}

/// File contents, or `None` when the file does not exist.
async fn read_optional(path: &Path) -> Result<Option<String>, PersistenceError> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_optional<T: DeserializeOwned + Default>(contents: Option<String>) -> Result<T, serde_json::Error> {
    match contents {
        Some(contents) => serde_json::from_str(&contents),
        None => Ok(T::default()),
    }
}

/// Reject ids that would escape their directory.
fn validate_component(component: &str) -> Result<(), PersistenceError> {
    let valid = !component.is_empty()
        && !component.starts_with('.')
        && !component.contains(['/', '\\'])
        && component != "..";
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidPath {
            component: component.to_string(),
        })
    }
}

fn file_safe(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// File-name-safe form of a phase name.
///
/// Names that are already safe are used as-is. Anything that had to be
/// rewritten gets a short checksum of the raw name appended, so `Code Review`
/// and `code_review` never share a directory.
pub fn artifact_base_name(phase_name: &str) -> String {
    let base = file_safe(phase_name).to_ascii_lowercase();
    if !base.is_empty() && base == phase_name {
        return base;
    }
    let base = if base.is_empty() { "phase".to_string() } else { base };
    format!("{}_{}", base, &calculate_checksum(phase_name)[..8])
}
