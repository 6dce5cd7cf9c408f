//! HTTP client for the external inference service
//!
//! The service receives a sanitized context snapshot plus a task mode and
//! returns a (status, summary, confidence) judgment. The request carries no
//! state the server needs to remember, so an identical retried request is
//! safe.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;

use crate::config::InferenceConfig;
use crate::error::{Error, Result};
use crate::types::WorkStatus;

use super::{InferenceRequest, InferenceResponse};

/// The seam to the external reasoning service.
///
/// Implementations make exactly one attempt per call; retry/backoff is the
/// caller's explicit state, not the client's.
pub trait InferenceClient: Send + Sync {
    fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse>;
}

/// Raw response shape from the service
#[derive(Debug, Deserialize)]
struct WireResponse {
    status: String,
    summary: String,
    confidence: f64,
    #[serde(default)]
    tools_used: Vec<String>,
}

/// reqwest-backed client with its own single-thread runtime, so callers can
/// stay synchronous at the trait boundary.
pub struct HttpInferenceClient {
    endpoint: String,
    model: String,
    http: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| Error::Config("inference.endpoint is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = config.resolved_api_key() {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                reqwest::header::AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Config(format!("failed to create runtime: {}", e)))?;

        Ok(Self {
            endpoint,
            model: config.model.clone(),
            http,
            runtime,
        })
    }
}

impl InferenceClient for HttpInferenceClient {
    fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        let body = json!({
            "model": self.model,
            "mode": request.mode.as_str(),
            "context": request.snapshot,
            "anomaly": request.anomaly,
        });

        self.runtime.block_on(async {
            let response = self
                .http
                .post(&self.endpoint)
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::Inference(format!("request failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                let text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(Error::Inference(format!(
                    "service error ({}): {}",
                    status, text
                )));
            }

            let wire: WireResponse = response
                .json()
                .await
                .map_err(|e| Error::Inference(format!("malformed response: {}", e)))?;

            let status = WorkStatus::parse_lenient(&wire.status).ok_or_else(|| {
                Error::Inference(format!("unrecognized status: {}", wire.status))
            })?;

            Ok(InferenceResponse {
                status,
                summary: wire.summary,
                confidence: wire.confidence.clamp(0.0, 1.0),
                tools_used: wire.tools_used,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_requires_endpoint() {
        let config = InferenceConfig::default();
        assert!(HttpInferenceClient::new(&config).is_err());
    }

    #[test]
    fn test_client_with_endpoint() {
        let config = InferenceConfig {
            endpoint: Some("http://localhost:9000/classify".to_string()),
            ..Default::default()
        };
        assert!(HttpInferenceClient::new(&config).is_ok());
    }

    #[test]
    fn test_wire_response_parsing() {
        let wire: WireResponse = serde_json::from_str(
            r#"{"status":"Coding","summary":"writing rust","confidence":0.92}"#,
        )
        .unwrap();
        assert_eq!(wire.status, "Coding");
        assert!(wire.tools_used.is_empty());
        assert_eq!(WorkStatus::parse_lenient(&wire.status), Some(WorkStatus::Coding));
    }
}
