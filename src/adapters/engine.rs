//! HTTP client for the workflow engine's job submission endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{EngineError, WorkflowEngine};

/// Workflow engine reached over its REST API
pub struct HttpWorkflowEngine {
    /// Base URL, e.g. `http://engine:11000/v1`
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    conf: &'a str,
    /// Idempotency key: the engine returns the existing job for a known parent
    parent_id: &'a str,
    user: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

impl HttpWorkflowEngine {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn jobs_url(&self) -> String {
        format!("{}/jobs?action=start", self.base_url)
    }
}

#[async_trait]
impl WorkflowEngine for HttpWorkflowEngine {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit_and_start(
        &self,
        conf: &str,
        action_id: &str,
        user: &str,
        auth_token: &str,
    ) -> Result<String, EngineError> {
        let url = self.jobs_url();
        debug!(%url, action_id, "Submitting workflow");

        let response = self
            .client
            .post(&url)
            .bearer_auth(auth_token)
            .timeout(self.timeout)
            .json(&SubmitRequest {
                conf,
                parent_id: action_id,
                user,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(self.timeout)
                } else {
                    EngineError::Http(e)
                }
            })?;

        let status = response.status();
        if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Rejected(format!("{}: {}", status, body.trim())));
        }
        if !status.is_success() {
            return Err(EngineError::Unavailable(format!("engine returned {}", status)));
        }

        // The workflow may already run, so an unreadable 2xx body stays retryable
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Unavailable(format!("reading submit response: {}", e)))?;
        parse_submit_response(&body)
    }
}

fn parse_submit_response(body: &str) -> Result<String, EngineError> {
    serde_json::from_str::<SubmitResponse>(body)
        .map(|parsed| parsed.id)
        .map_err(|e| EngineError::Unavailable(format!("undecodable submit response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one request on an ephemeral port, answering with `status` and `body`
    async fn one_shot_engine(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            // Read the headers and the declared body before answering
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    #[test]
    fn test_url_building() {
        let engine = HttpWorkflowEngine::new("http://engine:11000/v1/", Duration::from_secs(5));
        assert_eq!(engine.jobs_url(), "http://engine:11000/v1/jobs?action=start");
        assert_eq!(engine.name(), "http");
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_transient() {
        // Port 9 (discard) on localhost is not expected to accept HTTP
        let engine = HttpWorkflowEngine::new("http://127.0.0.1:9", Duration::from_millis(500));
        let err = engine
            .submit_and_start("", "job@1", "user", "token")
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }

    #[test]
    fn test_submit_response_parsing() {
        assert_eq!(parse_submit_response(r#"{"id":"0000042-W"}"#).unwrap(), "0000042-W");
        let err = parse_submit_response("<html>proxy error</html>").unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_started_workflow_id_is_returned() {
        let url = one_shot_engine("201 Created", r#"{"id":"0000007-W"}"#).await;
        let engine = HttpWorkflowEngine::new(url, Duration::from_secs(5));
        let id = engine.submit_and_start("", "job@1", "user", "token").await.unwrap();
        assert_eq!(id, "0000007-W");
    }

    #[tokio::test]
    async fn test_garbled_success_body_is_transient() {
        let url = one_shot_engine("200 OK", "not json").await;
        let engine = HttpWorkflowEngine::new(url, Duration::from_secs(5));
        let err = engine
            .submit_and_start("", "job@1", "user", "token")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)), "unexpected error: {err}");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_client_error_is_rejection() {
        let url = one_shot_engine("400 Bad Request", r#"{"error":"bad conf"}"#).await;
        let engine = HttpWorkflowEngine::new(url, Duration::from_secs(5));
        let err = engine
            .submit_and_start("", "job@1", "user", "token")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));
        assert!(!err.is_transient());
    }
}
