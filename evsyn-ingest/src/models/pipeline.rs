//! Pipeline configuration
//!
//! A Pipeline is immutable after creation. Reconfiguring means creating a
//! new pipeline; runs reference their pipeline by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::stage::StageKind;
use crate::error::{PipelineError, PipelineResult};

/// Optional stages toggled per pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSet {
    pub quality_assessment: bool,
    pub duplicate_detection: bool,
    pub auto_fix: bool,
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self {
            quality_assessment: true,
            duplicate_detection: true,
            auto_fix: true,
        }
    }
}

/// Declared format of submitted study data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    Csv,
    Excel,
    Revman,
    Json,
}

impl InputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            InputFormat::Csv => "csv",
            InputFormat::Excel => "excel",
            InputFormat::Revman => "revman",
            InputFormat::Json => "json",
        }
    }

    /// Parse a format name as reported by format detection
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "csv" | "tsv" | "delimited" => Some(InputFormat::Csv),
            "excel" | "xlsx" | "xls" => Some(InputFormat::Excel),
            "revman" | "rm5" => Some(InputFormat::Revman),
            "json" => Some(InputFormat::Json),
            _ => None,
        }
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration request for a new pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Owning project reference
    pub project_id: String,
    #[serde(default)]
    pub features: FeatureSet,
    /// Inference model; the service default applies when absent
    #[serde(default)]
    pub model_id: Option<String>,
}

/// Configured pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub pipeline_id: Uuid,
    pub project_id: String,
    pub features: FeatureSet,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    /// Validate a configuration request and build the pipeline
    pub fn from_config(config: PipelineConfig, default_model: &str) -> PipelineResult<Self> {
        let project_id = config.project_id.trim().to_string();
        if project_id.is_empty() {
            return Err(PipelineError::InvalidConfiguration(
                "project_id must not be empty".to_string(),
            ));
        }

        let model_id = config
            .model_id
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| default_model.to_string());
        if model_id.is_empty() {
            return Err(PipelineError::InvalidConfiguration(
                "no model_id given and no default model configured".to_string(),
            ));
        }

        Ok(Self {
            pipeline_id: Uuid::new_v4(),
            project_id,
            features: config.features,
            model_id,
            created_at: Utc::now(),
        })
    }

    /// Stages this pipeline executes, in order
    pub fn stage_plan(&self) -> Vec<StageKind> {
        StageKind::plan(&self.features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(project: &str, model: Option<&str>) -> PipelineConfig {
        PipelineConfig {
            project_id: project.to_string(),
            features: FeatureSet::default(),
            model_id: model.map(str::to_string),
        }
    }

    #[test]
    fn test_default_model_applied() {
        let pipeline = Pipeline::from_config(config("proj-1", None), "default-model").unwrap();
        assert_eq!(pipeline.model_id, "default-model");
        assert_eq!(pipeline.project_id, "proj-1");
    }

    #[test]
    fn test_blank_model_falls_back_to_default() {
        let pipeline = Pipeline::from_config(config("proj-1", Some("  ")), "m").unwrap();
        assert_eq!(pipeline.model_id, "m");
    }

    #[test]
    fn test_empty_project_rejected() {
        let err = Pipeline::from_config(config("   ", Some("m")), "m").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_features_default_when_omitted() {
        let parsed: PipelineConfig =
            serde_json::from_str(r#"{"project_id":"p","features":{"auto_fix":false}}"#).unwrap();
        assert!(!parsed.features.auto_fix);
        assert!(parsed.features.duplicate_detection);
        assert!(parsed.features.quality_assessment);
    }

    #[test]
    fn test_format_names() {
        assert_eq!(InputFormat::parse("RevMan"), Some(InputFormat::Revman));
        assert_eq!(InputFormat::parse("xlsx"), Some(InputFormat::Excel));
        assert_eq!(InputFormat::parse("parquet"), None);
    }
}
