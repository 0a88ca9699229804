//! Feature-level aggregation and next-phase recommendation records.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use super::state::WorkflowStatus;

/// Overall state of a feature derived from completed vs. total phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureProgress {
    Unknown,
    Pending,
    InProgress,
    Completed,
}

impl FeatureProgress {
    pub fn from_counts(instances: usize, completed_phases: usize, total_phases: usize) -> Self {
        if instances == 0 || total_phases == 0 {
            FeatureProgress::Unknown
        } else if completed_phases == 0 {
            FeatureProgress::Pending
        } else if completed_phases >= total_phases {
            FeatureProgress::Completed
        } else {
            FeatureProgress::InProgress
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub workflow_name: String,
    pub schema_version: String,
    pub status: WorkflowStatus,
    pub current_phase: String,
    /// `None` for terminal instances or when the schema cannot be resolved.
    pub next_phase: Option<String>,
    pub completed_phases: usize,
    pub total_phases: usize,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureStatus {
    pub feature_id: String,
    pub overall: FeatureProgress,
    pub status_counts: BTreeMap<WorkflowStatus, usize>,
    pub completed_phases: usize,
    pub total_phases: usize,
    pub instances: Vec<InstanceSummary>,
}

impl FeatureStatus {
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Most recently created instance.
    pub fn latest_instance(&self) -> Option<&InstanceSummary> {
        self.instances.iter().max_by_key(|summary| summary.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationSource {
    /// Schema order after condition resolution.
    Standard,
    /// Keyword rule matched against recorded output.
    Smart,
}

impl fmt::Display for RecommendationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecommendationSource::Standard => f.write_str("standard"),
            RecommendationSource::Smart => f.write_str("smart"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub feature_id: String,
    pub instance_id: String,
    pub phase: String,
    pub source: RecommendationSource,
    pub reason: String,
    /// Schema-order choice, kept even when a smart rule overrides it.
    pub standard_phase: String,
}

/// Redirects to `target_phase` when every pattern matches the inspected text.
#[derive(Debug, Clone)]
pub struct SmartRule {
    pub target_phase: String,
    pub reason: String,
    patterns: Vec<Regex>,
}

impl SmartRule {
    /// Patterns are matched case-insensitively.
    pub fn new(target_phase: impl Into<String>, reason: impl Into<String>, patterns: &[&str]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|pattern| Regex::new(&format!("(?i){}", pattern)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            target_phase: target_phase.into(),
            reason: reason.into(),
            patterns,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        !self.patterns.is_empty() && self.patterns.iter().all(|pattern| pattern.is_match(text))
    }
}

/// Built-in keyword rules, checked in order.
pub fn default_smart_rules() -> Vec<SmartRule> {
    [
        (
            "security_review",
            "output mentions security risk or impact",
            &[r"\bsecurity\b", r"\b(risk|impact)\b"][..],
        ),
        (
            "tech_spike",
            "output proposes a new library or significant architectural change",
            &[r"new library|significant architectural change"][..],
        ),
        (
            "migration_plan",
            "output mentions a database migration",
            &[r"database migration"][..],
        ),
    ]
    .into_iter()
    .filter_map(|(target, reason, patterns)| SmartRule::new(target, reason, patterns).ok())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_progress_from_counts() {
        assert_eq!(FeatureProgress::from_counts(0, 0, 0), FeatureProgress::Unknown);
        assert_eq!(FeatureProgress::from_counts(2, 0, 0), FeatureProgress::Unknown);
        assert_eq!(FeatureProgress::from_counts(1, 0, 4), FeatureProgress::Pending);
        assert_eq!(FeatureProgress::from_counts(1, 2, 4), FeatureProgress::InProgress);
        assert_eq!(FeatureProgress::from_counts(1, 4, 4), FeatureProgress::Completed);
    }

    #[test]
    fn test_default_rules_compile() {
        let rules = default_smart_rules();
        let targets: Vec<_> = rules.iter().map(|r| r.target_phase.as_str()).collect();
        assert_eq!(targets, vec!["security_review", "tech_spike", "migration_plan"]);
    }

    #[test]
    fn test_security_rule_needs_both_keywords() {
        let rules = default_smart_rules();
        let security = &rules[0];

        assert!(security.matches("This change has a SECURITY risk in the auth layer"));
        assert!(security.matches("Security impact: tokens are logged"));
        assert!(!security.matches("security headers were added"));
        assert!(!security.matches("low risk refactor"));
    }

    #[test]
    fn test_alternation_rules() {
        let rules = default_smart_rules();
        assert!(rules[1].matches("We should adopt a new library for parsing"));
        assert!(rules[2].matches("Requires a Database Migration of the users table"));
        assert!(!rules[2].matches("database schema unchanged"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(SmartRule::new("x", "broken", &["("]).is_err());
    }
}
