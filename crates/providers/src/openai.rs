use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::agent_api::ChatMessage;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;
use zeroize::Zeroizing;

use crate::sse::{SseEvent, SseParser};

static SHARED_HTTP: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(120))
        .pool_max_idle_per_host(2)
        .build()
        .expect("failed to build HTTP client")
});

const COMPLETIONS_PATH: &str = "chat/completions";
const MAX_ERROR_DETAIL: usize = 800;

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("API error: {0}")]
    StreamAborted(String),

    #[error("Cancelled")]
    Cancelled,
}

// ── Configuration ────────────────────────────────────────────────────

/// Connection parameters for one completion request.
#[derive(Clone)]
pub struct ApiConfig {
    pub endpoint: String,
    pub key: Zeroizing<String>,
    pub model: String,
}

impl ApiConfig {
    pub fn new(endpoint: impl Into<String>, key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            key: Zeroizing::new(key.into()),
            model: model.into(),
        }
    }

    /// Resolve the URL to POST to.
    ///
    /// A base such as `https://api.openai.com/v1` gets `/chat/completions` appended;
    /// a URL that already names the completions route is used unchanged.
    pub fn completions_url(&self) -> Result<Url, CompletionError> {
        let trimmed = self.endpoint.trim().trim_end_matches('/');
        let invalid = |reason: String| CompletionError::InvalidEndpoint {
            endpoint: self.endpoint.clone(),
            reason,
        };

        let base = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", base.scheme())));
        }
        if base.path().ends_with(COMPLETIONS_PATH) {
            return Ok(base);
        }
        Url::parse(&format!("{}/{}", trimmed, COMPLETIONS_PATH)).map_err(|e| invalid(e.to_string()))
    }
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("endpoint", &self.endpoint)
            .field("key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// What one SSE event did to the accumulated reply.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StreamStep {
    Grew,
    Unchanged,
    Done,
}

/// Fold one SSE event into `text`.
///
/// Events that are not valid chunk JSON (keep-alives, vendor extras) are skipped.
pub(crate) fn apply_stream_event(
    event: &SseEvent,
    text: &mut String,
) -> Result<StreamStep, CompletionError> {
    let data = event.data.trim();
    if data == "[DONE]" {
        return Ok(StreamStep::Done);
    }
    let Ok(chunk) = serde_json::from_str::<StreamResponse>(data) else {
        return Ok(StreamStep::Unchanged);
    };
    if let Some(err) = chunk.error {
        return Err(CompletionError::StreamAborted(
            err.message.unwrap_or_else(|| data.to_string()),
        ));
    }
    let delta = chunk
        .choices
        .first()
        .and_then(|c| c.delta.as_ref())
        .and_then(|d| d.content.as_deref())
        .unwrap_or("");
    if delta.is_empty() {
        return Ok(StreamStep::Unchanged);
    }
    text.push_str(delta);
    Ok(StreamStep::Grew)
}

/// Pull a readable message out of a non-2xx response body.
pub(crate) fn upstream_message(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let message = value
            .pointer("/error/message")
            .or_else(|| value.get("message"))
            .and_then(|m| m.as_str());
        if let Some(message) = message {
            return message.to_string();
        }
    }
    let detail: String = body.chars().take(MAX_ERROR_DETAIL).collect();
    if detail.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request rejected")
            .to_string()
    } else {
        detail
    }
}

// ── Client ───────────────────────────────────────────────────────────

/// OpenAI-compatible chat-completions client.
pub struct OpenAIClient {
    http: Client,
    config: ApiConfig,
}

impl OpenAIClient {
    pub fn new(config: ApiConfig) -> Self {
        Self {
            http: SHARED_HTTP.clone(),
            config,
        }
    }

    /// Stream a completion, calling `on_text` with the full text accumulated so far
    /// each time it grows. Returns the final text.
    ///
    /// A server that ignores `stream: true` and answers with one JSON body is
    /// accepted; its content becomes the return value without any `on_text` call.
    pub async fn stream_chat<F>(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        mut on_text: F,
    ) -> Result<String, CompletionError>
    where
        F: FnMut(&str),
    {
        let url = self.config.completions_url()?;
        let req = ChatRequest {
            model: &self.config.model,
            messages,
            temperature,
            stream: true,
        };
        let resp = self
            .http
            .post(url)
            .bearer_auth(self.config.key.as_str())
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Upstream {
                status: status.as_u16(),
                message: upstream_message(status, &body),
            });
        }

        let is_plain_json = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);
        if is_plain_json {
            let body: ChatResponse = resp.json().await?;
            return Ok(body
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default());
        }

        let mut parser = SseParser::new();
        let mut stream = resp.bytes_stream();
        let mut text = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            for event in parser.feed(&bytes) {
                match apply_stream_event(&event, &mut text)? {
                    StreamStep::Grew => on_text(&text),
                    StreamStep::Unchanged => {}
                    StreamStep::Done => return Ok(text),
                }
            }
        }

        if let Some(event) = parser.finish() {
            if apply_stream_event(&event, &mut text)? == StreamStep::Grew {
                on_text(&text);
            }
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: s.to_string(),
        }
    }

    #[test]
    fn test_completions_url_appends_route() {
        let cfg = ApiConfig::new("https://api.openai.com/v1/", "k", "m");
        assert_eq!(
            cfg.completions_url().unwrap().as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_completions_url_keeps_full_route() {
        let cfg = ApiConfig::new("https://proxy.example/v1/chat/completions", "k", "m");
        assert_eq!(
            cfg.completions_url().unwrap().as_str(),
            "https://proxy.example/v1/chat/completions"
        );
    }

    #[test]
    fn test_completions_url_rejects_garbage() {
        let cfg = ApiConfig::new("not a url", "k", "m");
        assert!(matches!(
            cfg.completions_url(),
            Err(CompletionError::InvalidEndpoint { .. })
        ));

        let cfg = ApiConfig::new("ftp://files.example", "k", "m");
        assert!(cfg.completions_url().is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let cfg = ApiConfig::new("https://x", "sk-secret", "m");
        let printed = format!("{:?}", cfg);
        assert!(!printed.contains("sk-secret"));
    }

    #[test]
    fn test_stream_event_accumulates() {
        let mut text = String::new();
        let step = apply_stream_event(
            &data(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            &mut text,
        )
        .unwrap();
        assert_eq!(step, StreamStep::Unchanged);

        apply_stream_event(&data(r#"{"choices":[{"delta":{"content":"He"}}]}"#), &mut text).unwrap();
        let step =
            apply_stream_event(&data(r#"{"choices":[{"delta":{"content":"y"}}]}"#), &mut text)
                .unwrap();
        assert_eq!(step, StreamStep::Grew);
        assert_eq!(text, "Hey");

        assert_eq!(
            apply_stream_event(&data("[DONE]"), &mut text).unwrap(),
            StreamStep::Done
        );
    }

    #[test]
    fn test_stream_event_error_object() {
        let mut text = String::from("partial");
        let err = apply_stream_event(
            &data(r#"{"error":{"message":"context length exceeded"}}"#),
            &mut text,
        )
        .unwrap_err();
        assert!(err.to_string().contains("context length exceeded"));
    }

    #[test]
    fn test_upstream_message_extraction() {
        let status = reqwest::StatusCode::UNAUTHORIZED;
        assert_eq!(
            upstream_message(status, r#"{"error":{"message":"Incorrect API key"}}"#),
            "Incorrect API key"
        );
        assert_eq!(upstream_message(status, r#"{"message":"quota"}"#), "quota");
        assert_eq!(upstream_message(status, "bad gateway page"), "bad gateway page");
        assert_eq!(upstream_message(status, ""), "Unauthorized");
    }
}
