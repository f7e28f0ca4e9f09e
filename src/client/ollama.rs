//! Client for an Ollama-style text-completion endpoint.
//!
//! - One synchronous (non-streaming) request per prompt, no automatic retry
//! - The completion is returned exactly as sent by the server
//! - Transport errors, bad statuses and malformed bodies surface as
//!   [`InferenceError`] so the caller can record the row and move on

use crate::models::{
    EndpointConfig, InferenceError, PROMPT_PLACEHOLDER, Result, SurveyorError, TemplateConfig,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// A text-completion backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Complete `prompt`, asking for a rationale when `want_rationale`.
    async fn complete(
        &self,
        prompt: &str,
        want_rationale: bool,
    ) -> std::result::Result<String, InferenceError>;
}

/// The two fixed prompt templates.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    answer_only: String,
    with_reasoning: String,
}

impl PromptTemplates {
    pub fn new(config: &TemplateConfig) -> Self {
        Self {
            answer_only: config.answer_only.clone(),
            with_reasoning: config.with_reasoning.clone(),
        }
    }

    /// Embed the trimmed prompt into the template for this mode.
    pub fn render(&self, prompt: &str, want_rationale: bool) -> String {
        let template = if want_rationale {
            &self.with_reasoning
        } else {
            &self.answer_only
        };
        template.replace(PROMPT_PLACEHOLDER, prompt.trim())
    }
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self::new(&TemplateConfig::default())
    }
}

/// Generate request payload.
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

/// Generate response; only the completion text is used.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Error body returned by Ollama on non-2xx statuses.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: String,
}

/// HTTP client for `POST {base_url}/api/generate`.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Option<Duration>,
    templates: PromptTemplates,
}

impl OllamaClient {
    /// Create a new client.
    pub fn new(endpoint: &EndpointConfig, templates: PromptTemplates) -> Result<Self> {
        let timeout = endpoint.timeout_secs.map(Duration::from_secs);

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(SurveyorError::Network)?;

        Ok(Self {
            client,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            model: endpoint.model.clone(),
            timeout,
            templates,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    /// Ping `GET {base_url}/api/tags`.
    pub async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let url = format!("{}/api/tags", self.base_url);

        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                if response.status().is_success() {
                    HealthCheckResult {
                        endpoint: self.base_url.clone(),
                        status: HealthStatus::Healthy,
                        latency_ms: Some(latency_ms),
                        error: None,
                    }
                } else {
                    HealthCheckResult {
                        endpoint: self.base_url.clone(),
                        status: HealthStatus::Unhealthy,
                        latency_ms: Some(latency_ms),
                        error: Some(format!("HTTP {}", response.status().as_u16())),
                    }
                }
            }
            Err(e) => HealthCheckResult {
                endpoint: self.base_url.clone(),
                status: HealthStatus::Unreachable,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[async_trait]
impl InferenceClient for OllamaClient {
    async fn complete(
        &self,
        prompt: &str,
        want_rationale: bool,
    ) -> std::result::Result<String, InferenceError> {
        let start = Instant::now();
        let request = GenerateRequest {
            model: &self.model,
            prompt: self.templates.render(prompt, want_rationale),
            stream: false,
        };

        let response = self
            .client
            .post(self.generate_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| match self.timeout {
                Some(timeout) if e.is_timeout() => InferenceError::Timeout(timeout),
                _ => InferenceError::Transport(e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(InferenceError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .text()
            .await
            .map_err(InferenceError::Transport)?;
        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| InferenceError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        debug!(
            model = %self.model,
            want_rationale,
            elapsed_ms = start.elapsed().as_millis() as u64,
            chars = parsed.response.len(),
            "Completion received"
        );

        Ok(parsed.response)
    }
}

/// Health check result.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Endpoint base URL
    pub endpoint: String,
    pub status: HealthStatus,
    /// Latency in milliseconds (if reachable)
    pub latency_ms: Option<u64>,
    /// Error message (if unhealthy or unreachable)
    pub error: Option<String>,
}

/// Health status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Endpoint is responding normally
    Healthy,
    /// Endpoint is responding but with errors
    Unhealthy,
    /// Endpoint is not reachable
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                if request_complete(&raw) {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&raw).into_owned()
        });

        (format!("http://{addr}"), handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        raw.len() >= header_end + 4 + content_length
    }

    fn client_for(base_url: String) -> OllamaClient {
        let endpoint = EndpointConfig {
            base_url,
            model: "llama3.1:latest".to_string(),
            timeout_secs: Some(5),
        };
        OllamaClient::new(&endpoint, PromptTemplates::default()).unwrap()
    }

    #[test]
    fn test_render_selects_template_and_trims_prompt() {
        let templates = PromptTemplates::default();

        let bare = templates.render("  How often do you meet?\n", false);
        assert!(bare.starts_with("How often do you meet?\n\n"));
        assert!(!bare.contains("Reasoning:"));

        let reasoned = templates.render("How often do you meet?", true);
        assert!(reasoned.contains("Answer: <a single integer>"));
        assert!(reasoned.contains("Reasoning:"));
    }

    #[tokio::test]
    async fn test_complete_returns_untrimmed_text() {
        let (url, server) = serve_once("200 OK", r#"{"model":"llama3.1","response":"Answer: 4\n","done":true}"#).await;
        let client = client_for(url);

        let text = client.complete("  Rate the team  ", true).await.unwrap();
        assert_eq!(text, "Answer: 4\n");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/generate"));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["model"], "llama3.1:latest");
        assert_eq!(json["stream"], false);
        assert!(json["prompt"].as_str().unwrap().starts_with("Rate the team\n"));
    }

    #[tokio::test]
    async fn test_error_status_is_failure() {
        let (url, _server) = serve_once("500 Internal Server Error", r#"{"error":"model crashed"}"#).await;
        let err = client_for(url).complete("q", false).await.unwrap_err();
        match err {
            InferenceError::Status { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "model crashed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_response_field_is_failure() {
        let (url, _server) = serve_once("200 OK", r#"{"done":true}"#).await;
        let err = client_for(url).complete("q", false).await.unwrap_err();
        assert!(matches!(err, InferenceError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(format!("http://{addr}"));
        let err = client.complete("q", false).await.unwrap_err();
        assert!(err.is_transient());

        let health = client.health_check().await;
        assert_eq!(health.status, HealthStatus::Unreachable);
    }
}
