//! Findings attached to studies during stages
//!
//! An Issue is a recorded data finding, not a system error. An
//! `Error`-severity issue fails its study (never the run).

use serde::{Deserialize, Serialize};

use super::stage::StageKind;

/// Issue severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Machine-actionable replacement for one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Canonical field name
    pub field: String,
    /// Proposed replacement value
    pub value: String,
}

impl Suggestion {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.field.trim().is_empty() || self.value.trim().is_empty()
    }
}

/// A finding raised by a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub stage: StageKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<Suggestion>,
    #[serde(default)]
    pub requires_manual_review: bool,
    /// Set once auto-fix applied the suggestion
    #[serde(default)]
    pub resolved: bool,
}

impl Issue {
    pub fn new(stage: StageKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            stage,
            severity,
            message: message.into(),
            suggestion: None,
            requires_manual_review: false,
            resolved: false,
        }
    }

    pub fn info(stage: StageKind, message: impl Into<String>) -> Self {
        Self::new(stage, Severity::Info, message)
    }

    pub fn warning(stage: StageKind, message: impl Into<String>) -> Self {
        Self::new(stage, Severity::Warning, message)
    }

    pub fn error(stage: StageKind, message: impl Into<String>) -> Self {
        Self::new(stage, Severity::Error, message)
    }

    pub fn with_suggestion(mut self, suggestion: Suggestion) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    pub fn needing_review(mut self) -> Self {
        self.requires_manual_review = true;
        self
    }

    /// Unresolved and carrying a usable suggestion
    pub fn is_fixable(&self) -> bool {
        !self.resolved && self.suggestion.as_ref().is_some_and(|s| !s.is_empty())
    }
}
