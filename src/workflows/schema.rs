//! Workflow schema model: ordered phases, optionally gated by conditions.
//!
//! Schemas arrive as loosely typed documents (YAML or JSON). Parsing normalises
//! them into typed trees and validates eagerly; a malformed condition anywhere
//! in the tree rejects the whole schema instead of being dropped.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_TASK: &str = "default_task";
pub const DEFAULT_VERSION: &str = "1.0";
pub const DEFAULT_EXECUTION_STRATEGY: &str = "sequential";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Duplicate phase name '{phase}' in schema {schema}@{version}")]
    DuplicatePhase {
        schema: String,
        version: String,
        phase: String,
    },

    #[error("Malformed schema: {reason}")]
    MalformedSchema { reason: String },

    #[error("Malformed phase at index {index}: {reason}")]
    MalformedPhase { index: usize, reason: String },

    #[error("Malformed condition on phase '{phase}': {reason}")]
    MalformedCondition { phase: String, reason: String },

    #[error("Unknown operator '{operator}' in condition on phase '{phase}'")]
    UnknownOperator { phase: String, operator: String },

    #[error("Phase '{phase}' has invalid fallback '{fallback}'")]
    UnknownFallback { phase: String, fallback: String },

    #[error("Schema '{name}' not found")]
    NotFound { name: String },

    #[error("Schema {name}@{version} already exists with different phases")]
    VersionConflict { name: String, version: String },

    #[error("Failed to parse schema document: {0}")]
    Parse(String),

    #[error("IO error reading schema: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SchemaError {
    fn from(err: serde_json::Error) -> Self {
        SchemaError::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for SchemaError {
    fn from(err: serde_yaml::Error) -> Self {
        SchemaError::Parse(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComparisonOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
}

impl ComparisonOperator {
    pub fn parse(operator: &str) -> Option<Self> {
        match operator.trim() {
            "=" | "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            ">=" => Some(Self::Ge),
            "<=" => Some(Self::Le),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    And,
    Or,
    Not,
}

impl LogicalOperator {
    pub fn parse(operator: &str) -> Option<Self> {
        match operator.trim().to_ascii_lowercase().as_str() {
            "and" => Some(Self::And),
            "or" => Some(Self::Or),
            "not" => Some(Self::Not),
            _ => None,
        }
    }
}

/// Compares the value at a dotted path against a literal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionTerm {
    pub field: String,
    pub operator: ComparisonOperator,
    pub value: Value,
}

impl ConditionTerm {
    pub fn new(field: impl Into<String>, operator: ComparisonOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Term(ConditionTerm),
    Expression(ConditionExpression),
}

impl From<ConditionTerm> for ConditionNode {
    fn from(term: ConditionTerm) -> Self {
        ConditionNode::Term(term)
    }
}

impl From<ConditionExpression> for ConditionNode {
    fn from(expr: ConditionExpression) -> Self {
        ConditionNode::Expression(expr)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionExpression {
    pub operator: LogicalOperator,
    pub operands: Vec<ConditionNode>,
}

impl ConditionExpression {
    pub fn and(operands: Vec<ConditionNode>) -> Self {
        Self {
            operator: LogicalOperator::And,
            operands,
        }
    }

    pub fn or(operands: Vec<ConditionNode>) -> Self {
        Self {
            operator: LogicalOperator::Or,
            operands,
        }
    }

    pub fn not(operand: impl Into<ConditionNode>) -> Self {
        Self {
            operator: LogicalOperator::Not,
            operands: vec![operand.into()],
        }
    }

    /// Single-term expression.
    pub fn term(term: ConditionTerm) -> Self {
        Self::and(vec![term.into()])
    }

    /// Parse a condition document attached to `phase`.
    ///
    /// A bare term at the top level is accepted and wrapped in `and`.
    pub fn from_value(phase: &str, value: &Value) -> Result<Self, SchemaError> {
        let obj = value.as_object().ok_or_else(|| SchemaError::MalformedCondition {
            phase: phase.to_string(),
            reason: format!("expected a mapping, found {}", value_kind(value)),
        })?;

        if obj.contains_key("field") {
            return Ok(Self::term(parse_term(phase, obj)?));
        }
        parse_expression(phase, obj)
    }

    fn validate(&self, phase: &str) -> Result<(), SchemaError> {
        let malformed = |reason: &str| SchemaError::MalformedCondition {
            phase: phase.to_string(),
            reason: reason.to_string(),
        };
        match self.operator {
            LogicalOperator::Not if self.operands.len() != 1 => {
                Err(malformed("'not' takes exactly one operand"))
            }
            LogicalOperator::And | LogicalOperator::Or if self.operands.is_empty() => {
                Err(malformed("'and'/'or' need at least one operand"))
            }
            _ => Ok(()),
        }
    }

    /// Check this node and every nested expression below it.
    pub fn validate_tree(&self, phase: &str) -> Result<(), SchemaError> {
        self.validate(phase)?;
        for operand in &self.operands {
            if let ConditionNode::Expression(expr) = operand {
                expr.validate_tree(phase)?;
            }
        }
        Ok(())
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

fn parse_expression(phase: &str, obj: &Map<String, Value>) -> Result<ConditionExpression, SchemaError> {
    let raw_operator = obj
        .get("operator")
        .and_then(Value::as_str)
        .ok_or_else(|| SchemaError::MalformedCondition {
            phase: phase.to_string(),
            reason: "expression is missing its operator".to_string(),
        })?;
    let operator = LogicalOperator::parse(raw_operator).ok_or_else(|| SchemaError::UnknownOperator {
        phase: phase.to_string(),
        operator: raw_operator.to_string(),
    })?;

    let raw_operands = obj
        .get("operands")
        .and_then(Value::as_array)
        .ok_or_else(|| SchemaError::MalformedCondition {
            phase: phase.to_string(),
            reason: format!("'{}' expression is missing its operands list", raw_operator),
        })?;

    let mut operands = Vec::with_capacity(raw_operands.len());
    for raw in raw_operands {
        let operand = raw.as_object().ok_or_else(|| SchemaError::MalformedCondition {
            phase: phase.to_string(),
            reason: format!("operand must be a mapping, found {}", value_kind(raw)),
        })?;

        if operand.contains_key("field") {
            operands.push(ConditionNode::Term(parse_term(phase, operand)?));
        } else if operand.contains_key("operator") {
            operands.push(ConditionNode::Expression(parse_expression(phase, operand)?));
        } else {
            return Err(SchemaError::MalformedCondition {
                phase: phase.to_string(),
                reason: "operand is neither a term nor an expression".to_string(),
            });
        }
    }

    let expr = ConditionExpression { operator, operands };
    expr.validate(phase)?;
    Ok(expr)
}

fn parse_term(phase: &str, obj: &Map<String, Value>) -> Result<ConditionTerm, SchemaError> {
    let malformed = |reason: String| SchemaError::MalformedCondition {
        phase: phase.to_string(),
        reason,
    };

    let field = obj
        .get("field")
        .and_then(Value::as_str)
        .filter(|f| !f.trim().is_empty())
        .ok_or_else(|| malformed("term field must be a non-empty string".to_string()))?;
    let raw_operator = obj
        .get("operator")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(format!("term on '{}' is missing its operator", field)))?;
    let operator = ComparisonOperator::parse(raw_operator).ok_or_else(|| SchemaError::UnknownOperator {
        phase: phase.to_string(),
        operator: raw_operator.to_string(),
    })?;
    let value = obj
        .get("value")
        .cloned()
        .ok_or_else(|| malformed(format!("term on '{}' is missing its value", field)))?;

    Ok(ConditionTerm {
        field: field.to_string(),
        operator,
        value,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseDefinition {
    pub name: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionExpression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_phase: Option<String>,
    pub execution_strategy: String,
}

impl PhaseDefinition {
    pub fn new(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            condition: None,
            fallback_phase: None,
            execution_strategy: DEFAULT_EXECUTION_STRATEGY.to_string(),
        }
    }

    pub fn with_condition(mut self, condition: ConditionExpression) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_fallback(mut self, fallback_phase: impl Into<String>) -> Self {
        self.fallback_phase = Some(fallback_phase.into());
        self
    }

    pub fn from_value(index: usize, value: &Value) -> Result<Self, SchemaError> {
        let malformed = |reason: &str| SchemaError::MalformedPhase {
            index,
            reason: reason.to_string(),
        };
        let obj = value
            .as_object()
            .ok_or_else(|| malformed("phase must be a mapping"))?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| malformed("phase name must be a non-empty string"))?
            .to_string();

        let task = match obj.get("task") {
            None | Some(Value::Null) => DEFAULT_TASK.to_string(),
            Some(Value::String(task)) => task.clone(),
            Some(_) => return Err(malformed("task must be a string")),
        };

        let condition = match obj.get("condition") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(ConditionExpression::from_value(&name, raw)?),
        };

        let fallback_phase = match obj.get("fallback_phase") {
            None | Some(Value::Null) => None,
            Some(Value::String(fallback)) => Some(fallback.clone()),
            Some(_) => return Err(malformed("fallback_phase must be a string")),
        };

        let execution_strategy = match obj.get("execution_strategy") {
            None | Some(Value::Null) => DEFAULT_EXECUTION_STRATEGY.to_string(),
            Some(Value::String(strategy)) => strategy.clone(),
            Some(_) => return Err(malformed("execution_strategy must be a string")),
        };

        Ok(Self {
            name,
            task,
            condition,
            fallback_phase,
            execution_strategy,
        })
    }
}

/// Immutable, validated phase sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSchema {
    pub name: String,
    pub version: String,
    pub phases: Vec<PhaseDefinition>,
}

impl WorkflowSchema {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        phases: Vec<PhaseDefinition>,
    ) -> Result<Self, SchemaError> {
        let schema = Self {
            name: name.into(),
            version: version.into(),
            phases,
        };
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_value(value: &Value) -> Result<Self, SchemaError> {
        let obj = value.as_object().ok_or_else(|| SchemaError::MalformedSchema {
            reason: format!("expected a mapping, found {}", value_kind(value)),
        })?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| SchemaError::MalformedSchema {
                reason: "schema name must be a non-empty string".to_string(),
            })?;

        let version = match obj.get("version") {
            None | Some(Value::Null) => DEFAULT_VERSION.to_string(),
            Some(Value::String(v)) => v.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(SchemaError::MalformedSchema {
                    reason: format!("version must be a string, found {}", value_kind(other)),
                })
            }
        };

        let phases = match obj.get("phases") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(index, item)| PhaseDefinition::from_value(index, item))
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(SchemaError::MalformedSchema {
                    reason: format!("phases must be a list, found {}", value_kind(other)),
                })
            }
        };

        Self::new(name, version, phases)
    }

    pub fn from_json_str(input: &str) -> Result<Self, SchemaError> {
        let value: Value = serde_json::from_str(input)?;
        Self::from_value(&value)
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, SchemaError> {
        let value: Value = serde_yaml::from_str(input)?;
        Self::from_value(&value)
    }

    /// Reject duplicate phase names, malformed conditions and dangling fallbacks.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.name.trim().is_empty() || self.version.trim().is_empty() {
            return Err(SchemaError::MalformedSchema {
                reason: "schema name and version must be non-empty".to_string(),
            });
        }

        let mut seen = HashSet::with_capacity(self.phases.len());
        for phase in &self.phases {
            if !seen.insert(phase.name.as_str()) {
                return Err(SchemaError::DuplicatePhase {
                    schema: self.name.clone(),
                    version: self.version.clone(),
                    phase: phase.name.clone(),
                });
            }
        }

        for phase in &self.phases {
            if let Some(condition) = &phase.condition {
                condition.validate_tree(&phase.name)?;
            }
            if let Some(fallback) = &phase.fallback_phase {
                if fallback == &phase.name || !seen.contains(fallback.as_str()) {
                    return Err(SchemaError::UnknownFallback {
                        phase: phase.name.clone(),
                        fallback: fallback.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn first_phase(&self) -> Option<&PhaseDefinition> {
        self.phases.first()
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
