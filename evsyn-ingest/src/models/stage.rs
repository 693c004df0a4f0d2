//! Stage identities and the fixed stage order

use serde::{Deserialize, Serialize};
use std::fmt;

use super::pipeline::FeatureSet;

/// One named processing step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    FormatDetect,
    Parse,
    AutoFix,
    Validate,
    Dedup,
    QualityAssess,
}

impl StageKind {
    /// Declared execution order
    pub const ORDER: [StageKind; 6] = [
        StageKind::FormatDetect,
        StageKind::Parse,
        StageKind::AutoFix,
        StageKind::Validate,
        StageKind::Dedup,
        StageKind::QualityAssess,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::FormatDetect => "format-detect",
            StageKind::Parse => "parse",
            StageKind::AutoFix => "auto-fix",
            StageKind::Validate => "validate",
            StageKind::Dedup => "dedup",
            StageKind::QualityAssess => "quality-assess",
        }
    }

    /// Whether the stage runs under the given feature flags
    pub fn is_enabled(self, features: &FeatureSet) -> bool {
        match self {
            StageKind::FormatDetect | StageKind::Parse | StageKind::Validate => true,
            StageKind::AutoFix => features.auto_fix,
            StageKind::Dedup => features.duplicate_detection,
            StageKind::QualityAssess => features.quality_assessment,
        }
    }

    /// Enabled stages in declared order
    pub fn plan(features: &FeatureSet) -> Vec<StageKind> {
        Self::ORDER
            .iter()
            .copied()
            .filter(|stage| stage.is_enabled(features))
            .collect()
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_plan_keeps_declared_order() {
        let plan = StageKind::plan(&FeatureSet::default());
        assert_eq!(plan, StageKind::ORDER.to_vec());
    }

    #[test]
    fn test_disabled_stages_removed() {
        let features = FeatureSet {
            quality_assessment: false,
            duplicate_detection: false,
            auto_fix: false,
        };
        assert_eq!(
            StageKind::plan(&features),
            vec![StageKind::FormatDetect, StageKind::Parse, StageKind::Validate]
        );
    }

    #[test]
    fn test_serde_names_match_display() {
        for stage in StageKind::ORDER {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage));
        }
    }
}
