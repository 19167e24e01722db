use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use regex::Regex;
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::{Client, Response};

use crate::events::ChatEvent;
use crate::models::{AnswerEnvelope, ChatRequest, ChatResponse, ExportRequest, StopStreamResponse};
use crate::ndjson::ndjson_events;

/// Upper bound on the best-effort `/stopStream` call.
const STOP_STREAM_TIMEOUT: Duration = Duration::from_secs(3);

/// Thin wrapper over the Coeus backend HTTP API. The cookie store keeps the
/// server session so `/stopStream` targets the request this client started.
#[derive(Clone)]
pub struct CoeusClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Clone)]
pub struct ExportedFile {
    pub file_name: Option<String>,
    pub bytes: Bytes,
}

impl CoeusClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<AnswerEnvelope> {
        let mut request = request.clone();
        request.stream = false;

        let response = self.post_chat(&request).await?;
        let body = response
            .json::<ChatResponse>()
            .await
            .context("failed to decode /chat response")?;

        body.into_envelope()
            .ok_or_else(|| anyhow::anyhow!("/chat returned no choices"))
    }

    /// Starts a streaming chat request and returns its decoded events.
    pub async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<ChatEvent>>> {
        let mut request = request.clone();
        request.stream = true;

        let response = self.post_chat(&request).await?;
        Ok(ndjson_events(response.bytes_stream()).boxed())
    }

    pub async fn stop_stream(&self) -> Result<String> {
        let url = format!("{}/stopStream", self.base_url);
        let response = self
            .client
            .post(url)
            .timeout(STOP_STREAM_TIMEOUT)
            .send()
            .await
            .context("failed to call /stopStream")?;
        let response = ensure_success(response, "/stopStream").await?;

        // The endpoint answers with a JSON string body but no JSON content type.
        let text = response
            .text()
            .await
            .context("failed to read /stopStream response")?;
        let status = serde_json::from_str::<StopStreamResponse>(&text)
            .context("failed to decode /stopStream response")?;
        Ok(status.status)
    }

    pub async fn export_answer(&self, request: &ExportRequest) -> Result<ExportedFile> {
        let url = format!("{}/exportAnswer", self.base_url);
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .context("failed to call /exportAnswer")?;
        let response = ensure_success(response, "/exportAnswer").await?;

        let file_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(attachment_file_name);
        let bytes = response
            .bytes()
            .await
            .context("failed to read exported answer")?;

        Ok(ExportedFile { file_name, bytes })
    }

    async fn post_chat(&self, request: &ChatRequest) -> Result<Response> {
        let url = format!("{}/chat", self.base_url);
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .context("failed to call /chat")?;
        ensure_success(response, "/chat").await
    }
}

async fn ensure_success(response: Response, route: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("{route} returned {status}: {}", normalize_err_body(&body))
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
    }

    trimmed.to_string()
}

fn attachment_file_name(header: &str) -> Option<String> {
    let re = Regex::new(r#"filename="(.+)""#).ok()?;
    re.captures(header)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_prefers_error_field() {
        assert_eq!(
            normalize_err_body(r#"{"error": "Session timeout"}"#),
            "Session timeout"
        );
        assert_eq!(normalize_err_body("  plain failure "), "plain failure");
        assert_eq!(normalize_err_body(""), "<empty body>");
    }

    #[test]
    fn reads_attachment_file_name() {
        assert_eq!(
            attachment_file_name(r#"attachment; filename="answer-123.docx""#).as_deref(),
            Some("answer-123.docx")
        );
        assert_eq!(attachment_file_name("inline"), None);
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let client = CoeusClient::new("http://localhost:5000/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:5000");
    }
}
