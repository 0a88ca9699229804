// chatflow library - phase-based workflow orchestration over a shared file store
// Instances are advanced through schema-defined phases by any number of processes

pub mod checksum;
pub mod config;
pub mod error;
pub mod ids;
pub mod storage;
pub mod telemetry;
pub mod workflows;

// Re-export key types for easy access
pub use checksum::calculate_checksum;
pub use config::{ChatflowConfig, EngineConfig, ObservabilityConfig, StorageConfig};
pub use error::FlowError;
pub use ids::{generate_correlation_id, generate_instance_id};
pub use storage::{FileLock, FileStateStore, LockError, PersistenceError, StateStore};
pub use telemetry::{create_workflow_span, init_telemetry};
pub use workflows::{
    evaluate, FeatureProgress, FeatureStatus, FileSchemaLoader, HistoryEvent, HistoryEventType,
    PhaseDefinition, Recommendation, RecommendationSource, SchemaError, SchemaLoader, SmartRule,
    TaskExecutionRecord, TaskStatus, Variables, WorkflowEngine, WorkflowInstanceState,
    WorkflowSchema, WorkflowStartResult, WorkflowStatus, WorkflowStatusInfo,
};
