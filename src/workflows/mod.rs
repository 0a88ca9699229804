// Workflow orchestration modules
// Schema model, condition evaluation, instance records and the engine

pub mod conditions;
pub mod engine;
pub mod loader;
pub mod recommend;
pub mod schema;
pub mod state;

pub use conditions::{evaluate, lookup_path};
pub use engine::{resolve_next, PhaseResolution, SkipReason, SkippedPhase, WorkflowEngine};
pub use loader::{FileSchemaLoader, SchemaLoader};
pub use recommend::{
    default_smart_rules, FeatureProgress, FeatureStatus, InstanceSummary, Recommendation,
    RecommendationSource, SmartRule,
};
pub use schema::{
    ComparisonOperator, ConditionExpression, ConditionNode, ConditionTerm, LogicalOperator,
    PhaseDefinition, SchemaError, WorkflowSchema,
};
pub use state::{
    HistoryEvent, HistoryEventType, TaskExecutionRecord, TaskStatus, Variables,
    WorkflowInstanceState, WorkflowStartResult, WorkflowStatus, WorkflowStatusInfo, SYSTEM_TASK,
    UNKNOWN_PHASE,
};
