//! Service configuration: maps the shared TOML config onto pipeline settings
//! and selects the inference client.

use evsyn_common::config::{InferenceConfig, TomlConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::inference::{HeuristicInferenceClient, HttpInferenceClient, InferenceClient};
use crate::stages::StageSettings;
use crate::workflow::{RegistrySettings, RetentionPolicy};

/// Config module name (selects `evsyn-ingest.toml`)
pub const MODULE_NAME: &str = "evsyn-ingest";

pub fn registry_settings(config: &TomlConfig) -> RegistrySettings {
    RegistrySettings {
        default_model: config.inference.default_model.clone(),
        stage: StageSettings {
            max_concurrent_calls: config.pipeline.max_concurrent_calls,
            call_timeout: Duration::from_millis(config.inference.call_timeout_ms),
            duplicate_threshold: config.pipeline.duplicate_threshold,
            quality_floor: config.pipeline.quality_floor,
        },
        subscriber_buffer: config.pipeline.subscriber_buffer,
        retention: RetentionPolicy {
            max_retained_runs: config.retention.max_retained_runs,
            run_ttl: Duration::from_secs(config.retention.run_ttl_secs),
            pipeline_ttl: Duration::from_secs(config.retention.pipeline_ttl_secs),
        },
    }
}

/// HTTP client when an endpoint is configured, heuristic rules otherwise
pub fn build_inference_client(
    config: &InferenceConfig,
) -> Result<Arc<dyn InferenceClient>, evsyn_common::Error> {
    match config.endpoint.as_deref().map(str::trim) {
        Some(endpoint) if !endpoint.is_empty() => {
            let client = HttpInferenceClient::from_config(config)?;
            info!(url = %client.url(), "Using remote inference service");
            if config.api_key.is_none() {
                warn!("No inference API key configured; calls are sent unauthenticated");
            }
            Ok(Arc::new(client))
        }
        _ => {
            info!("No inference endpoint configured, using offline heuristic inference");
            Ok(Arc::new(HeuristicInferenceClient::new()))
        }
    }
}
