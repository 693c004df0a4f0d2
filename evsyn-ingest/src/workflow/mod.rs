//! Run orchestration: batch decoding, the run task, progress fan-out and the
//! registry that owns pipelines and runs.

pub mod input;
pub mod pipeline_run;
pub mod progress_channel;
pub mod registry;

pub use input::{build_studies, decode_batch, RawBatch};
pub use pipeline_run::{PipelineRun, RunHandle};
pub use progress_channel::{
    ProgressChannel, ProgressSubscription, ProgressTracker, SubscriptionItem,
};
pub use registry::{EvictionReport, PipelineRegistry, RegistrySettings, RetentionPolicy};
