//! Anthropic messages API adapter.

use std::time::Instant;

use serde_json::{json, Value};

use super::{check_http_response, AdapterError, LlmAdapter, LlmOptions, LlmReply};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// LLM adapter backed by the Anthropic `/v1/messages` endpoint.
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    /// Create a new adapter instance.
    ///
    /// `base_url` is the API root without the `/v1/messages` suffix, so
    /// tests and proxies can redirect traffic.
    pub fn new(base_url: String, model: String, api_key: String) -> Self {
        Self {
            base_url,
            model,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl LlmAdapter for AnthropicAdapter {
    async fn invoke(
        &self,
        prompt_text: &str,
        user_text: &str,
        options: &LlmOptions,
    ) -> Result<LlmReply, AdapterError> {
        let body = json!({
            "model": self.model,
            "system": prompt_text,
            "messages": [{"role": "user", "content": user_text}],
            "max_tokens": options.max_tokens,
        });

        let started = Instant::now();
        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let payload = check_http_response(response).await?;
        let latency_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let parsed: Value = serde_json::from_str(&payload)
            .map_err(|e| AdapterError::Fatal(format!("unparseable API response: {e}")))?;

        let text = parse_content_text(&parsed)?;
        let (request_tokens, response_tokens) = parse_usage(&parsed);
        let model_id = parsed
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&self.model)
            .to_owned();

        Ok(LlmReply {
            text,
            request_tokens,
            response_tokens,
            latency_ms,
            model_id,
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

fn parse_content_text(value: &Value) -> Result<String, AdapterError> {
    let Some(content_items) = value.get("content").and_then(Value::as_array) else {
        return Err(AdapterError::Fatal("missing content array".to_owned()));
    };

    let mut text = String::new();
    for item in content_items {
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or_default();
        if item_type == "text" {
            let part = item.get("text").and_then(Value::as_str).unwrap_or_default();
            text.push_str(part);
        }
    }

    Ok(text)
}

fn parse_usage(value: &Value) -> (i64, i64) {
    let usage = value.get("usage");
    let input = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let output = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    (input, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strips_trailing_slash() {
        let adapter = AnthropicAdapter::new(
            "https://api.anthropic.com/".to_owned(),
            "claude-sonnet-4-20250514".to_owned(),
            "sk-test".to_owned(),
        );
        assert_eq!(adapter.endpoint(), "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn parses_content_and_usage() {
        let payload = json!({
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "text", "text": "{\"document_type\":"},
                {"type": "text", "text": " \"bill\"}"}
            ],
            "usage": {"input_tokens": 120, "output_tokens": 8}
        });
        let text = parse_content_text(&payload).expect("content should parse");
        assert_eq!(text, "{\"document_type\": \"bill\"}");
        assert_eq!(parse_usage(&payload), (120, 8));
    }

    #[test]
    fn missing_content_is_fatal() {
        let payload = json!({"usage": {}});
        let err = parse_content_text(&payload).expect_err("should fail");
        assert!(!err.is_retryable());
    }
}
