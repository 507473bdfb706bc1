pub mod fake;
pub mod openai;

use crate::conversation::Conversation;
use crate::errors::ProviderError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Reasoning trace returned next to the answer, when the provider exposes one.
    pub reasoning: Option<String>,
    pub elapsed: Duration,
    pub raw: serde_json::Value,
}

/// Capability shared by answer models and the judge.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn generate(
        &self,
        model_id: &str,
        conversation: &Conversation,
    ) -> Result<Generation, ProviderError>;

    fn provider_name(&self) -> &'static str;
}

/// Routes each model id to the client configured for it.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    clients: HashMap<String, Arc<dyn InferenceClient>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model_id: impl Into<String>, client: Arc<dyn InferenceClient>) {
        self.clients.insert(model_id.into(), client);
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.clients.contains_key(model_id)
    }
}

#[async_trait]
impl InferenceClient for ModelRegistry {
    async fn generate(
        &self,
        model_id: &str,
        conversation: &Conversation,
    ) -> Result<Generation, ProviderError> {
        let client = self
            .clients
            .get(model_id)
            .ok_or_else(|| ProviderError::UnknownModel(model_id.to_string()))?;
        client.generate(model_id, conversation).await
    }

    fn provider_name(&self) -> &'static str {
        "registry"
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeClient;
    use super::*;
    use crate::conversation::Turn;

    #[tokio::test]
    async fn registry_routes_by_model_id() {
        let mut registry = ModelRegistry::new();
        registry.register("a", Arc::new(FakeClient::new("a").with_response("from a")));
        registry.register("b", Arc::new(FakeClient::new("b").with_response("from b")));

        let convo = Conversation::single(Turn::user_text("hi"));
        assert_eq!(registry.generate("b", &convo).await.unwrap().text, "from b");
        assert!(matches!(
            registry.generate("c", &convo).await,
            Err(ProviderError::UnknownModel(_))
        ));
    }
}
