//! Transport to the external LLM text-generation service.
//!
//! Supports the "preferred stream, fallback poll" shape: stream a response
//! and accumulate deltas, or (on transport error) resubmit in the
//! background and poll for a terminal status. Both paths converge on the
//! same [`LlmResponse`] envelope.

use std::env;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use harness_retry::{RetryPolicy, calculate_delay, delay_honoring_retry_after};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::safety::{MAX_JSON_PAYLOAD_BYTES, guard_payload_size};

/// Hard polling deadline: if the background job hasn't reached a terminal
/// status within this window, the transport gives up.
pub const POLL_DEADLINE: Duration = Duration::from_secs(40 * 60);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const TRANSPORT_MAX_RETRIES: u32 = 3;
const MAX_RETRY_TOKEN_BUDGET: u32 = 65_000;

#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    pub model: String,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            input: input.into(),
            reasoning_effort: None,
            temperature: 0.0,
            background: false,
            stream: true,
            max_output_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub incomplete_reason: Option<String>,
    #[serde(default)]
    pub output_text: Option<String>,
    #[serde(default)]
    pub output: Vec<Value>,
}

impl LlmResponse {
    /// Extract the generated text: prefer the top-level `output_text`
    /// field; if absent or whitespace-only, walk `output` for a
    /// `message`-typed entry with `output_text` content.
    pub fn extract_text(&self) -> Option<String> {
        if let Some(t) = &self.output_text
            && !t.trim().is_empty()
        {
            return Some(t.clone());
        }
        for entry in &self.output {
            if entry.get("type").and_then(Value::as_str) == Some("message")
                && let Some(content) = entry.get("content").and_then(Value::as_array)
            {
                for part in content {
                    if part.get("type").and_then(Value::as_str) == Some("output_text")
                        && let Some(text) = part.get("text").and_then(Value::as_str)
                    {
                        return Some(text.to_string());
                    }
                }
            }
        }
        None
    }

    /// Concatenate reasoning-summary text entries, if present.
    pub fn extract_reasoning_summary(&self) -> Option<String> {
        let mut parts = Vec::new();
        for entry in &self.output {
            if entry.get("type").and_then(Value::as_str) == Some("reasoning")
                && let Some(summary) = entry.get("summary").and_then(Value::as_array)
            {
                for s in summary {
                    if let Some(text) = s.get("text").and_then(Value::as_str) {
                        parts.push(text.to_string());
                    }
                }
            }
        }
        if parts.is_empty() { None } else { Some(parts.join("\n")) }
    }

    pub fn is_incomplete_for_max_tokens(&self) -> bool {
        self.status.as_deref() == Some("incomplete")
            && self.incomplete_reason.as_deref() == Some("max_output_tokens")
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("completed") | Some("failed") | Some("incomplete") | Some("cancelled")
        )
    }
}

pub struct LlmClient {
    http: Client,
    base_url: String,
    api_key: String,
}

fn retryable_status(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        429 | 502 | 503 | 504
    )
}

impl LlmClient {
    /// Build a client, reading the API key from process env. A missing or
    /// blank key is a fail-fast error before any network use.
    pub fn from_env(base_url: impl Into<String>) -> Result<Self> {
        let api_key = env::var("HARNESS_LLM_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .context("HARNESS_LLM_API_KEY is not set or blank")?;

        let http = Client::builder()
            .user_agent(format!("harness/{}", env!("CARGO_PKG_VERSION")))
            .timeout(POLL_DEADLINE)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { http, base_url: base_url.into(), api_key })
    }

    fn responses_url(&self) -> String {
        format!("{}/v1/responses", self.base_url.trim_end_matches('/'))
    }

    fn response_by_id_url(&self, id: &str) -> String {
        format!("{}/v1/responses/{id}", self.base_url.trim_end_matches('/'))
    }

    /// Submit `request`, preferring the streaming path; on transport error,
    /// fall back to background submission + polling. Applies the
    /// token-budget incomplete-retry rule once on the terminal response.
    pub fn submit(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let response = self.submit_with_transport_retry(request)?;
        if response.is_incomplete_for_max_tokens() {
            let retried_budget = request
                .max_output_tokens
                .unwrap_or(4096)
                .saturating_mul(2)
                .min(MAX_RETRY_TOKEN_BUDGET);
            let mut retry_request = request.clone();
            retry_request.max_output_tokens = Some(retried_budget);
            return self.submit_with_transport_retry(&retry_request);
        }
        Ok(response)
    }

    fn submit_with_transport_retry(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let retry_config = RetryPolicy::Transport.to_config();
        let mut last_err = None;
        for attempt in 1..=TRANSPORT_MAX_RETRIES {
            match self.try_stream_then_poll(request) {
                Ok(resp) => return Ok(resp),
                Err(TransportError::Retryable { status, retry_after }) => {
                    let delay = match status {
                        Some(_) => delay_honoring_retry_after(&retry_config, attempt, retry_after),
                        None => calculate_delay(&retry_config, attempt),
                    };
                    last_err = Some(format!("transport error on attempt {attempt}: retrying after {delay:?}"));
                    if attempt < TRANSPORT_MAX_RETRIES {
                        std::thread::sleep(delay);
                    }
                }
                Err(TransportError::Fatal(msg)) => bail!("LLM transport error: {msg}"),
            }
        }
        bail!(
            "LLM transport exhausted {TRANSPORT_MAX_RETRIES} retries: {}",
            last_err.unwrap_or_default()
        )
    }

    fn try_stream_then_poll(&self, request: &LlmRequest) -> Result<LlmResponse, TransportError> {
        match self.try_stream(request) {
            Ok(resp) => Ok(resp),
            Err(_) => self.submit_background_and_poll(request),
        }
    }

    fn try_stream(&self, request: &LlmRequest) -> Result<LlmResponse, TransportError> {
        let mut streaming_request = request.clone();
        streaming_request.stream = true;
        streaming_request.background = false;

        let resp = self
            .http
            .post(self.responses_url())
            .bearer_auth(&self.api_key)
            .json(&streaming_request)
            .send()
            .map_err(classify_reqwest_error)?;

        let status = resp.status();
        if retryable_status(status) {
            let retry_after = parse_retry_after(resp.headers());
            return Err(TransportError::Retryable { status: Some(status), retry_after });
        }
        if !status.is_success() {
            return Err(TransportError::Fatal(format!("unexpected status {status}")));
        }

        let bytes = resp.bytes().map_err(classify_reqwest_error)?;
        guard_payload_size(&bytes).map_err(|_| {
            TransportError::Fatal(format!("response exceeds {MAX_JSON_PAYLOAD_BYTES} bytes"))
        })?;

        parse_sse_terminal_frame(&bytes)
            .map_err(|e| TransportError::Fatal(format!("failed to parse stream: {e}")))
    }

    fn submit_background_and_poll(&self, request: &LlmRequest) -> Result<LlmResponse, TransportError> {
        let mut background_request = request.clone();
        background_request.background = true;
        background_request.stream = false;

        let resp = self
            .http
            .post(self.responses_url())
            .bearer_auth(&self.api_key)
            .json(&background_request)
            .send()
            .map_err(classify_reqwest_error)?;

        if !resp.status().is_success() {
            return Err(TransportError::Fatal(format!("background submit failed: {}", resp.status())));
        }

        let bytes = resp.bytes().map_err(classify_reqwest_error)?;
        guard_payload_size(&bytes)
            .map_err(|_| TransportError::Fatal(format!("response exceeds {MAX_JSON_PAYLOAD_BYTES} bytes")))?;
        let initial: LlmResponse = serde_json::from_slice(&bytes)
            .map_err(|e| TransportError::Fatal(format!("failed to parse background response: {e}")))?;
        let id = initial
            .id
            .clone()
            .ok_or_else(|| TransportError::Fatal("background response missing id".to_string()))?;

        let deadline = Instant::now() + POLL_DEADLINE;
        loop {
            if Instant::now() >= deadline {
                return Err(TransportError::Fatal(format!(
                    "polling deadline of {:?} exceeded for response {id}",
                    POLL_DEADLINE
                )));
            }

            let poll_resp = self
                .http
                .get(self.response_by_id_url(&id))
                .bearer_auth(&self.api_key)
                .send()
                .map_err(classify_reqwest_error)?;

            let status = poll_resp.status();
            if retryable_status(status) {
                let retry_after = parse_retry_after(poll_resp.headers());
                return Err(TransportError::Retryable { status: Some(status), retry_after });
            }

            let bytes = poll_resp.bytes().map_err(classify_reqwest_error)?;
            guard_payload_size(&bytes)
                .map_err(|_| TransportError::Fatal(format!("response exceeds {MAX_JSON_PAYLOAD_BYTES} bytes")))?;
            let parsed: LlmResponse = serde_json::from_slice(&bytes)
                .map_err(|e| TransportError::Fatal(format!("failed to parse poll response: {e}")))?;

            if parsed.is_terminal() {
                return Ok(parsed);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

enum TransportError {
    Retryable { status: Option<StatusCode>, retry_after: Option<Duration> },
    Fatal(String),
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() || e.is_connect() {
        TransportError::Retryable { status: None, retry_after: None }
    } else {
        TransportError::Fatal(e.to_string())
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Parse a `text/event-stream` body, accumulating output-text and
/// reasoning-summary deltas, and returning the terminal frame's full
/// response structure.
fn parse_sse_terminal_frame(bytes: &[u8]) -> Result<LlmResponse> {
    let text = String::from_utf8_lossy(bytes);
    let mut terminal: Option<LlmResponse> = None;
    for block in text.split("\n\n") {
        let data_lines: Vec<&str> = block
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect();
        if data_lines.is_empty() {
            continue;
        }
        let joined = data_lines.join("\n");
        if joined.trim() == "[DONE]" {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(&joined)
            && let Some(response_value) = value.get("response")
            && let Ok(resp) = serde_json::from_value::<LlmResponse>(response_value.clone())
        {
            terminal = Some(resp);
        }
    }
    terminal.context("no terminal frame found in stream")
}
