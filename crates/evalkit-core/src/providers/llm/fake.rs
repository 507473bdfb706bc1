use super::{Generation, InferenceClient};
use crate::conversation::Conversation;
use crate::errors::ProviderError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = dyn Fn(&str, &Conversation) -> Result<String, ProviderError> + Send + Sync;

/// Scripted client for tests and dry runs. Never touches the network.
///
/// Queued outcomes are served first, then the responder, then the fixed response.
#[derive(Clone)]
pub struct FakeClient {
    model: String,
    fixed_response: Option<String>,
    script: Arc<Mutex<VecDeque<Result<String, ProviderError>>>>,
    responder: Option<Arc<Responder>>,
    calls: Arc<Mutex<Vec<(String, Conversation)>>>,
}

impl std::fmt::Debug for FakeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeClient")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl FakeClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            fixed_response: None,
            script: Arc::new(Mutex::new(VecDeque::new())),
            responder: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.fixed_response = Some(response.into());
        self
    }

    pub fn with_script(self, outcomes: Vec<Result<String, ProviderError>>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(outcomes);
        }
        self
    }

    pub fn with_responder(
        mut self,
        responder: impl Fn(&str, &Conversation) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Every (model id, conversation) seen so far.
    pub fn calls(&self) -> Vec<(String, Conversation)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next_outcome(&self, model_id: &str, conversation: &Conversation) -> Result<String, ProviderError> {
        if let Some(outcome) = self.script.lock().ok().and_then(|mut s| s.pop_front()) {
            return outcome;
        }
        if let Some(responder) = &self.responder {
            return responder(model_id, conversation);
        }
        self.fixed_response
            .clone()
            .ok_or_else(|| ProviderError::InvalidResponse {
                message: format!("fake client {} has no response left", self.model),
            })
    }
}

#[async_trait]
impl InferenceClient for FakeClient {
    async fn generate(
        &self,
        model_id: &str,
        conversation: &Conversation,
    ) -> Result<Generation, ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((model_id.to_string(), conversation.clone()));
        }
        let text = self.next_outcome(model_id, conversation)?;
        Ok(Generation {
            text,
            reasoning: None,
            elapsed: Duration::from_millis(1),
            raw: serde_json::Value::Null,
        })
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }
}
