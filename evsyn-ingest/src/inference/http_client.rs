//! HTTP inference client
//!
//! Posts `{task, model, payload}` to `<endpoint>/v1/infer` and expects
//! `{"result": <task result>}` back. Calls are paced client-side.
//!
//! Failure mapping:
//! - connect error, 5xx → `Unreachable`
//! - request timeout → `Timeout`
//! - 429 → `QuotaExceeded`
//! - other 4xx, undecodable body → `Malformed`

use async_trait::async_trait;
use evsyn_common::config::{get_user_agent, InferenceConfig};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

use super::{InferenceClient, InferenceFailure, TaskType};

const INFER_PATH: &str = "/v1/infer";

#[derive(Debug, Serialize)]
struct InferRequest<'a> {
    task: TaskType,
    model: &'a str,
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    result: serde_json::Value,
}

pub struct HttpInferenceClient {
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl HttpInferenceClient {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        requests_per_second: u32,
        timeout: Duration,
    ) -> Result<Self, evsyn_common::Error> {
        let endpoint = endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(evsyn_common::Error::InferenceSetup(
                "inference endpoint must not be empty".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .user_agent(get_user_agent())
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| evsyn_common::Error::InferenceSetup(format!("HTTP client: {}", e)))?;

        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(rps));

        Ok(Self {
            url: format!("{}{}", endpoint, INFER_PATH),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client,
            rate_limiter,
        })
    }

    /// Build from the `[inference]` config section (endpoint required)
    pub fn from_config(config: &InferenceConfig) -> Result<Self, evsyn_common::Error> {
        let endpoint = config.endpoint.as_deref().ok_or_else(|| {
            evsyn_common::Error::InferenceSetup("inference.endpoint is not set".to_string())
        })?;
        Self::new(
            endpoint,
            config.api_key.clone(),
            config.requests_per_second,
            Duration::from_millis(config.call_timeout_ms),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn map_send_error(err: reqwest::Error) -> InferenceFailure {
    if err.is_timeout() {
        InferenceFailure::timeout(err.to_string())
    } else if err.is_connect() {
        InferenceFailure::unreachable(err.to_string())
    } else {
        InferenceFailure::unreachable(format!("request failed: {}", err))
    }
}

fn map_status(status: StatusCode, body: &str) -> InferenceFailure {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };

    if status == StatusCode::TOO_MANY_REQUESTS {
        InferenceFailure::quota_exceeded(detail)
    } else if status.is_server_error() {
        InferenceFailure::unreachable(detail)
    } else {
        InferenceFailure::malformed(detail)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn infer(
        &self,
        task: TaskType,
        payload: serde_json::Value,
        model_id: &str,
    ) -> Result<serde_json::Value, InferenceFailure> {
        self.rate_limiter.until_ready().await;

        debug!(task = %task, model = %model_id, url = %self.url, "Calling inference service");

        let mut request = self.client.post(&self.url).json(&InferRequest {
            task,
            model: model_id,
            payload,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(map_send_error)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let body: InferResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                InferenceFailure::timeout(e.to_string())
            } else {
                InferenceFailure::malformed(format!("undecodable response: {}", e))
            }
        })?;

        Ok(body.result)
    }
}
