//! HTTP API handlers

pub mod health;
pub mod pipelines;
pub mod runs;
pub mod sse;

pub use health::health_routes;
pub use pipelines::pipeline_routes;
pub use runs::run_routes;
pub use sse::{run_event_stream, service_event_stream};
