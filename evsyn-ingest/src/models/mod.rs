//! Data models for evsyn-ingest
//!
//! - Pipeline configuration (immutable once created)
//! - Run state machine and snapshots
//! - Per-study working state and issues
//! - Progress events

pub mod issue;
pub mod pipeline;
pub mod progress;
pub mod run;
pub mod stage;
pub mod study;

pub use issue::{Issue, Severity, Suggestion};
pub use pipeline::{FeatureSet, InputFormat, Pipeline, PipelineConfig};
pub use progress::{ProgressEvent, ProgressKind, StudyDelta};
pub use run::{Run, RunResult, RunSnapshot, RunStatus, StateTransition, StudyFailure, StudyReport};
pub use stage::StageKind;
pub use study::{FieldMap, RawRecord, StudyOutcome, StudyState};
