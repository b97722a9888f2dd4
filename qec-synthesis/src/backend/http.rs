//! HTTP synthesis backend.
//!
//! Talks JSON to a remote synthesis service:
//! - `GET  {base}/health`
//! - `POST {base}/synthesize`
//! - `POST {base}/validate`

use async_trait::async_trait;
use reqwest::{header, Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use qec_model::ValidationTest;

use super::traits::*;
use crate::request::SynthesisRequest;

/// Remote synthesis service backend.
pub struct HttpSynthesisBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    backend_id: String,
}

impl HttpSynthesisBackend {
    /// Create a new backend for the service at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SynthesisError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| SynthesisError::RequestFailed(format!("Failed to create HTTP client: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            backend_id: format!("http:{}", base_url),
            base_url,
            api_key,
        })
    }

    /// Build a request URL.
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Build authorization header if API key is set.
    fn auth_header(&self) -> Option<String> {
        self.api_key.as_ref().map(|k| format!("Bearer {}", k))
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<Response, SynthesisError> {
        let mut request = self.client.post(self.url(path));
        if let Some(auth) = self.auth_header() {
            request = request.header(header::AUTHORIZATION, auth);
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| SynthesisError::NetworkError(e.to_string()))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(SynthesisError::RateLimited { retry_after_ms });
        }
        if status.as_u16() == 503 {
            return Err(SynthesisError::Unavailable(format!("HTTP {}", status)));
        }

        let body = response.text().await.unwrap_or_default();
        Err(SynthesisError::RequestFailed(format!("HTTP {}: {}", status, body)))
    }
}

/// Synthesis response body.
#[derive(Debug, Deserialize)]
struct SynthesizeResponse {
    content: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Validation request body.
#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    patch: &'a str,
    tests: &'a [ValidationTest],
}

/// Validation response body.
#[derive(Debug, Deserialize)]
struct ValidateResponse {
    passed: bool,
    #[serde(default)]
    executed: usize,
    #[serde(default)]
    skipped: usize,
    #[serde(default)]
    failures: Vec<TestFailure>,
}

#[async_trait]
impl SynthesisBackend for HttpSynthesisBackend {
    fn id(&self) -> &str {
        &self.backend_id
    }

    async fn is_available(&self) -> bool {
        let mut request = self.client.get(self.url("health"));
        if let Some(auth) = self.auth_header() {
            request = request.header(header::AUTHORIZATION, auth);
        }

        request
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesisOutput, SynthesisError> {
        let response = self.post("synthesize", &request).await?;

        let body: SynthesizeResponse = response
            .json()
            .await
            .map_err(|e| SynthesisError::ParseError(e.to_string()))?;

        if body.content.trim().is_empty() {
            return Err(SynthesisError::InvalidPatch(
                "service returned an empty patch".to_string(),
            ));
        }

        Ok(SynthesisOutput {
            request_id: request.request_id,
            content: body.content,
            confidence: body.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            backend_id: self.backend_id.clone(),
            generated_at: chrono::Utc::now(),
        })
    }

    async fn validate(
        &self,
        patch: &str,
        tests: &[ValidationTest],
    ) -> Result<ValidationReport, SynthesisError> {
        let response = self.post("validate", &ValidateRequest { patch, tests }).await?;

        let body: ValidateResponse = response
            .json()
            .await
            .map_err(|e| SynthesisError::ParseError(e.to_string()))?;

        Ok(ValidationReport {
            passed: body.passed && body.failures.is_empty(),
            executed: body.executed,
            skipped: body.skipped,
            failures: body.failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header as header_matcher, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> HttpSynthesisBackend {
        HttpSynthesisBackend::new(server.uri(), Some("secret".to_string()), Duration::from_secs(5))
            .unwrap()
    }

    #[tokio::test]
    async fn test_synthesize() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/synthesize"))
            .and(header_matcher("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": "package policy\nallow if input.consent",
                "confidence": 0.9
            })))
            .mount(&server)
            .await;

        let output = backend(&server)
            .synthesize(SynthesisRequest::new("p-1", "Users must consent"))
            .await
            .unwrap();

        assert!(output.content.contains("input.consent"));
        assert!((output.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/synthesize"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let result = backend(&server)
            .synthesize(SynthesisRequest::new("p-1", "Users must consent"))
            .await;

        match result {
            Err(SynthesisError::RateLimited { retry_after_ms }) => {
                assert_eq!(retry_after_ms, Some(2000))
            }
            other => panic!("expected rate limit, got {:?}", other.map(|o| o.content)),
        }
    }

    #[tokio::test]
    async fn test_validate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/validate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "passed": false,
                "executed": 2,
                "failures": [{"test_id": "t-1", "message": "denied"}]
            })))
            .mount(&server)
            .await;

        let report = backend(&server).validate("allow := true", &[]).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.executed, 2);
        assert_eq!(report.failures[0].test_id, "t-1");
    }

    #[tokio::test]
    async fn test_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        assert!(backend(&server).is_available().await);
    }
}
