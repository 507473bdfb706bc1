mod prompt;

use crate::conversation::{Conversation, Turn};
use crate::errors::{JudgeError, ProviderError, RetryError};
use crate::model::OptionMap;
use crate::providers::llm::InferenceClient;
use crate::retry::{invoke_with_retry, RetryPolicy, Sleeper, TokioSleeper};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub correct: bool,
    pub rationale: String,
    /// Wall time across all attempts.
    pub elapsed: Duration,
}

/// One failed judge attempt.
#[derive(Debug, Clone, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("unparseable judge output: {0}")]
    Parse(String),
}

impl AttemptError {
    /// A malformed verdict is worth another sample.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::Parse(_) => true,
        }
    }
}

/// Grades a candidate answer against the reference through a judging model.
#[derive(Clone)]
pub struct JudgeService {
    client: Arc<dyn InferenceClient>,
    model: String,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl JudgeService {
    pub fn new(client: Arc<dyn InferenceClient>, model: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            model: model.into(),
            retry,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Exhausted retries surface as [`JudgeError`]; they never default to a verdict.
    pub async fn judge(
        &self,
        candidate: &str,
        reference: &str,
        question: &str,
        options: Option<&OptionMap>,
    ) -> Result<JudgeVerdict, JudgeError> {
        let conversation = Conversation {
            turns: vec![
                Turn::system(prompt::SYSTEM_PROMPT),
                Turn::user_text(prompt::build_prompt(candidate, reference, question, options)),
            ],
        };

        let started = Instant::now();
        let result = invoke_with_retry(
            &self.retry,
            self.sleeper.as_ref(),
            "judge",
            AttemptError::is_retryable,
            |attempt| {
                let conversation = &conversation;
                async move {
                    debug!(judge_model = %self.model, attempt, "calling judge");
                    let generation = self.client.generate(&self.model, conversation).await?;
                    parse_verdict(&generation.text)
                }
            },
        )
        .await;

        match result {
            Ok((correct, rationale)) => Ok(JudgeVerdict {
                correct,
                rationale,
                elapsed: started.elapsed(),
            }),
            Err(RetryError::Exhausted { attempts, last }) => Err(JudgeError::Exhausted {
                attempts,
                last: last.to_string(),
            }),
            Err(RetryError::Fatal(e)) => Err(JudgeError::Rejected(e.to_string())),
        }
    }
}

/// Reads the first JSON object in the judge output.
fn parse_verdict(text: &str) -> Result<(bool, String), AttemptError> {
    let text = text.trim();
    let start = text
        .find('{')
        .ok_or_else(|| AttemptError::Parse("no JSON object in judge output".into()))?;

    let val: Value = serde_json::Deserializer::from_str(&text[start..])
        .into_iter::<Value>()
        .next()
        .ok_or_else(|| AttemptError::Parse("no JSON object in judge output".into()))?
        .map_err(|e| AttemptError::Parse(format!("invalid JSON: {}", e)))?;

    let correct = ["is_correct", "passed", "match"]
        .iter()
        .find_map(|key| match val.get(*key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => Some(true),
                "false" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        })
        .ok_or_else(|| AttemptError::Parse("judge JSON missing 'is_correct' field".into()))?;

    let rationale = ["reasoning", "rationale"]
        .iter()
        .find_map(|key| val.get(*key).and_then(Value::as_str))
        .unwrap_or("")
        .to_string();

    Ok((correct, rationale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::llm::fake::FakeClient;
    use crate::retry::tests::RecordingSleeper;

    fn service(client: FakeClient, sleeper: Arc<RecordingSleeper>) -> JudgeService {
        JudgeService::new(
            Arc::new(client),
            "judge-model",
            RetryPolicy::new(3, Duration::from_millis(100)),
        )
        .with_sleeper(sleeper)
    }

    #[test]
    fn parses_fenced_and_aliased_verdicts() {
        let (ok, why) =
            parse_verdict("Sure.\n```json\n{\"is_correct\": true, \"reasoning\": \"same letter\"}\n```")
                .unwrap();
        assert!(ok);
        assert_eq!(why, "same letter");

        let (ok, why) = parse_verdict(r#"{"passed": "false", "rationale": "B vs C"}"#).unwrap();
        assert!(!ok);
        assert_eq!(why, "B vs C");

        assert!(parse_verdict("I think it is right").is_err());
        assert!(parse_verdict(r#"{"reasoning": "no flag"}"#).is_err());
    }

    #[tokio::test]
    async fn malformed_output_is_resampled() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = FakeClient::new("judge").with_script(vec![
            Ok("not json".into()),
            Ok(r#"{"is_correct": true, "reasoning": "matches"}"#.into()),
        ]);
        let verdict = service(client, sleeper.clone())
            .judge("C", "C", "Which?", None)
            .await
            .unwrap();
        assert!(verdict.correct);
        assert_eq!(verdict.rationale, "matches");
        assert_eq!(sleeper.delays.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhaustion_is_a_failure_not_a_verdict() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = FakeClient::new("judge").with_responder(|_, _| {
            Err(ProviderError::Server {
                status: 500,
                body: "down".into(),
            })
        });
        let err = service(client, sleeper.clone())
            .judge("C", "C", "Which?", None)
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::Exhausted { attempts: 3, .. }));
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = FakeClient::new("judge").with_script(vec![Err(ProviderError::Client {
            status: 401,
            body: "bad key".into(),
        })]);
        let err = service(client, sleeper.clone())
            .judge("C", "C", "Which?", None)
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::Rejected(_)));
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }
}
