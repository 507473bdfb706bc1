use super::{Generation, InferenceClient};
use crate::conversation::{ContentPart, Conversation, Turn};
use crate::errors::ProviderError;
use crate::model::MediaRef;
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tracing::debug;

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    base_url: String,
    api_key: String,
    /// Upstream model name sent in the request body.
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub extra_body: Map<String, Value>,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Network {
                message: format!("failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens,
            temperature: None,
            extra_body: Map::new(),
            timeout,
            client,
        })
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_extra_body(mut self, extra_body: Map<String, Value>) -> Self {
        self.extra_body = extra_body;
        self
    }

    async fn request_body(&self, conversation: &Conversation) -> Result<Value, ProviderError> {
        let mut messages = Vec::with_capacity(conversation.turns.len());
        for turn in &conversation.turns {
            messages.push(encode_turn(turn).await?);
        }

        let mut body = Map::new();
        body.insert("model".into(), json!(self.model));
        body.insert("messages".into(), Value::Array(messages));
        body.insert("max_tokens".into(), json!(self.max_tokens));
        if let Some(t) = self.temperature {
            body.insert("temperature".into(), json!(t));
        }
        for (k, v) in &self.extra_body {
            body.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Ok(Value::Object(body))
    }
}

#[async_trait]
impl InferenceClient for OpenAiCompatClient {
    async fn generate(
        &self,
        model_id: &str,
        conversation: &Conversation,
    ) -> Result<Generation, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(conversation).await?;

        debug!(model = model_id, url = %url, turns = conversation.turns.len(), "calling chat API");
        let started = Instant::now();

        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.timeout)
            } else {
                ProviderError::from(e)
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                408 => ProviderError::Timeout(self.timeout),
                429 => ProviderError::RateLimited { body },
                s if s >= 500 => ProviderError::Server { status: s, body },
                s => ProviderError::Client { status: s, body },
            });
        }

        let json: Value = resp.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("response is not JSON: {}", e),
        })?;

        let message = json
            .pointer("/choices/0/message")
            .ok_or_else(|| ProviderError::InvalidResponse {
                message: "response missing choices[0].message".to_string(),
            })?;
        let text = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let reasoning = reasoning_text(message);
        if text.trim().is_empty() && reasoning.is_none() {
            return Err(ProviderError::InvalidResponse {
                message: "response has empty content".to_string(),
            });
        }

        Ok(Generation {
            text,
            reasoning,
            elapsed: started.elapsed(),
            raw: json,
        })
    }

    fn provider_name(&self) -> &'static str {
        "openai-compatible"
    }
}

async fn encode_turn(turn: &Turn) -> Result<Value, ProviderError> {
    if !turn.has_media() {
        return Ok(json!({ "role": turn.role, "content": turn.text() }));
    }
    let mut content = Vec::with_capacity(turn.parts.len());
    for part in &turn.parts {
        match part {
            ContentPart::Media(media) => content.push(json!({
                "type": "image_url",
                "image_url": { "url": media_url(media).await? },
            })),
            ContentPart::Text(text) => content.push(json!({ "type": "text", "text": text })),
        }
    }
    Ok(json!({ "role": turn.role, "content": content }))
}

/// Remote URLs pass through; local files become base64 data URLs.
async fn media_url(media: &MediaRef) -> Result<String, ProviderError> {
    let Some(path) = media.local_path() else {
        return Ok(media.as_str().to_string());
    };
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ProviderError::Media(format!("{}: {}", path.display(), e)))?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:image/{};base64,{}", image_format(media.as_str()), encoded))
}

pub fn image_format(path: &str) -> &'static str {
    let ext = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "png",
        "webp" => "webp",
        "gif" => "gif",
        _ => "jpeg",
    }
}

/// First of `reasoning`, `reasoning_content`, `reasoning_details` that carries text.
pub fn reasoning_text(message: &Value) -> Option<String> {
    let non_blank = |s: &str| {
        let t = s.trim();
        (!t.is_empty()).then(|| t.to_string())
    };
    if let Some(r) = message.get("reasoning").and_then(Value::as_str).and_then(non_blank) {
        return Some(r);
    }
    if let Some(r) = message
        .get("reasoning_content")
        .and_then(Value::as_str)
        .and_then(non_blank)
    {
        return Some(r);
    }
    match message.get("reasoning_details")? {
        Value::String(s) => non_blank(s),
        Value::Array(items) => {
            let texts: Vec<String> = items
                .iter()
                .filter_map(|d| match d {
                    Value::String(s) => non_blank(s),
                    Value::Object(_) => d.get("text").and_then(Value::as_str).and_then(non_blank),
                    _ => None,
                })
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n\n"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, key: &str) -> OpenAiCompatClient {
        OpenAiCompatClient::new(&server.uri(), key, "upstream-model", 64, Duration::from_secs(5))
            .unwrap()
    }

    #[tokio::test]
    async fn posts_chat_request_and_reads_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": {
                    "content": "It is \\boxed{C}",
                    "reasoning_content": "thinking..."
                }}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut extra = Map::new();
        extra.insert("enable_thinking".into(), json!(true));
        let c = client(&server, "sk-test").with_extra_body(extra);
        let out = c
            .generate("m1", &Conversation::single(Turn::user_text("Q?")))
            .await
            .unwrap();
        assert_eq!(out.text, "It is \\boxed{C}");
        assert_eq!(out.reasoning.as_deref(), Some("thinking..."));

        let received = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["model"], "upstream-model");
        assert_eq!(body["enable_thinking"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Q?");
    }

    #[tokio::test]
    async fn maps_status_codes_to_retryability() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let c = client(&server, "");
        let convo = Conversation::single(Turn::user_text("Q?"));
        let first = c.generate("m1", &convo).await.unwrap_err();
        assert!(first.is_retryable());
        let second = c.generate("m1", &convo).await.unwrap_err();
        assert!(matches!(second, ProviderError::Client { status: 401, .. }));
        assert!(!second.is_retryable());
    }

    #[tokio::test]
    async fn local_media_is_inlined_as_data_url() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("chart.PNG");
        std::fs::write(&img, [1u8, 2, 3]).unwrap();

        let turn = Turn::user(vec![
            ContentPart::Media(MediaRef::new(img.to_string_lossy())),
            ContentPart::Media(MediaRef::new("https://cdn.example/x.jpg")),
            ContentPart::Text("describe".into()),
        ]);
        let encoded = encode_turn(&turn).await.unwrap();
        let parts = encoded["content"].as_array().unwrap();
        assert_eq!(parts[0]["image_url"]["url"], "data:image/png;base64,AQID");
        assert_eq!(parts[1]["image_url"]["url"], "https://cdn.example/x.jpg");
        assert_eq!(parts[2]["text"], "describe");
    }

    #[test]
    fn reasoning_details_list_is_joined() {
        let msg = json!({ "reasoning_details": [{ "text": "a" }, "b", { "other": 1 }] });
        assert_eq!(reasoning_text(&msg).as_deref(), Some("a\n\nb"));
        assert_eq!(reasoning_text(&json!({ "reasoning": "  " })), None);
    }
}
