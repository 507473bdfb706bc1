//! Evaluates one (question, model, persona) task.

use crate::config::MissingMediaPolicy;
use crate::conversation::prompt::PersonaSet;
use crate::conversation::{validate_options, Conversation, ConversationBuilder};
use crate::errors::{InputError, ProviderError, RetryError, TaskFailure};
use crate::extract::{extract_answer, strip_boxed, Extraction};
use crate::judge::JudgeService;
use crate::metrics::RunMetrics;
use crate::model::{
    Answer, Combo, Comparison, MediaRef, ModelOutcome, OptionMap, QuestionItem, ResultRecord,
    RoundKey, Verdict,
};
use crate::providers::llm::{Generation, InferenceClient};
use crate::retry::{invoke_with_retry, RetryPolicy, Sleeper, TokioSleeper};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What one task produced: a record to persist, failures to report, or both.
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub record: Option<ResultRecord>,
    pub failures: Vec<TaskFailure>,
}

/// Outcome of one answered round (or of a single-round item).
struct Scored {
    process: String,
    answer: String,
    correct: bool,
    rationale: String,
    response_time: Duration,
    judge_time: Duration,
}

/// Why a round or item has no verdict.
enum Unscored {
    Inference(RetryError<ProviderError>),
    Judge {
        error: String,
        process: String,
        response_time: Duration,
    },
}

impl Unscored {
    fn reason(&self) -> String {
        match self {
            Unscored::Inference(e) => format!("model call failed: {}", e),
            Unscored::Judge { error, .. } => error.clone(),
        }
    }
}

pub struct TaskExecutor {
    client: Arc<dyn InferenceClient>,
    judge: JudgeService,
    personas: PersonaSet,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    missing_media: MissingMediaPolicy,
    metrics: Arc<RunMetrics>,
}

impl TaskExecutor {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        judge: JudgeService,
        personas: PersonaSet,
        retry: RetryPolicy,
        metrics: Arc<RunMetrics>,
    ) -> Self {
        Self {
            client,
            judge,
            personas,
            retry,
            sleeper: Arc::new(TokioSleeper),
            missing_media: MissingMediaPolicy::default(),
            metrics,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_missing_media(mut self, policy: MissingMediaPolicy) -> Self {
        self.missing_media = policy;
        self
    }

    pub async fn execute(&self, item: &QuestionItem, combo: &Combo) -> TaskOutput {
        self.metrics.task_started();
        let output = self.execute_inner(item, combo).await;
        if output.failures.is_empty() {
            self.metrics.task_completed();
        } else {
            self.metrics.task_failed();
        }
        output
    }

    async fn execute_inner(&self, item: &QuestionItem, combo: &Combo) -> TaskOutput {
        let fail = |reason: String| TaskFailure {
            question_id: item.id.clone(),
            model: combo.model.clone(),
            persona: combo.persona.clone(),
            reason,
        };

        if !self.personas.contains(&combo.persona) {
            return TaskOutput {
                record: None,
                failures: vec![fail(format!("unknown persona '{}'", combo.persona))],
            };
        }
        if let Err(e) = validate_options(item) {
            warn!(question_id = %item.id, error = %e, "rejecting item");
            return TaskOutput {
                record: None,
                failures: vec![fail(e.to_string())],
            };
        }
        let media = match self.resolve_media(item).await {
            Ok(media) => media,
            Err(e) => {
                warn!(question_id = %item.id, error = %e, "skipping item");
                return TaskOutput {
                    record: None,
                    failures: vec![fail(e.to_string())],
                };
            }
        };

        let (outcome, errors) = if item.is_multi_round() {
            self.run_rounds(item, combo, media).await
        } else {
            self.run_single(item, combo, media).await
        };

        let mut failures = Vec::new();
        let mut outcome = outcome;
        if !errors.is_empty() {
            let reason = errors.join("; ");
            failures.push(fail(reason.clone()));
            outcome.error = Some(reason);
        }
        TaskOutput {
            record: Some(build_record(item, combo, outcome)),
            failures,
        }
    }

    /// Applies the missing-media policy to local references. Remote URLs are not checked.
    async fn resolve_media(&self, item: &QuestionItem) -> Result<Vec<MediaRef>, InputError> {
        let mut present = Vec::with_capacity(item.media.len());
        let mut missing = Vec::new();
        for media in &item.media {
            let exists = match media.local_path() {
                Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
                None => true,
            };
            if exists {
                present.push(media.clone());
            } else {
                missing.push(media.as_str().to_string());
            }
        }
        if missing.is_empty() {
            return Ok(present);
        }
        match self.missing_media {
            MissingMediaPolicy::SkipItem => Err(InputError::MissingMedia {
                id: item.id.clone(),
                sample: missing.join(", "),
            }),
            MissingMediaPolicy::DropReference => {
                warn!(question_id = %item.id, missing = ?missing, "dropping missing media references");
                Ok(present)
            }
        }
    }

    async fn run_single(
        &self,
        item: &QuestionItem,
        combo: &Combo,
        media: Vec<MediaRef>,
    ) -> (ModelOutcome, Vec<String>) {
        let question = item.question.as_single().unwrap_or_default();
        let reference = item.answer.as_single().unwrap_or_default();
        let options = item.options.flat();
        let mut outcome = ModelOutcome {
            model_name: combo.model.clone(),
            ..ModelOutcome::default()
        };

        let Some(prompt) =
            self.personas
                .render(&combo.persona, question, options, &item.question_type)
        else {
            return (outcome, vec![format!("unknown persona '{}'", combo.persona)]);
        };

        let mut builder = ConversationBuilder::new(media);
        let conversation = match builder.begin_round(RoundKey::nth(1), &prompt) {
            Ok(c) => c,
            Err(e) => return (outcome, vec![e.to_string()]),
        };

        match self
            .score(&combo.model, &conversation, question, reference, options)
            .await
        {
            Ok((scored, _)) => {
                outcome.process = Answer::text(scored.process);
                outcome.answer = Answer::text(scored.answer);
                outcome.match_gt = Verdict::Single(scored.correct);
                outcome.judge_reasoning = Answer::text(scored.rationale);
                outcome.response_time = scored.response_time.as_secs_f64();
                outcome.judge_time = scored.judge_time.as_secs_f64();
                (outcome, Vec::new())
            }
            Err(unscored) => {
                if let Unscored::Judge {
                    process,
                    response_time,
                    ..
                } = &unscored
                {
                    outcome.process = Answer::text(process.clone());
                    outcome.response_time = response_time.as_secs_f64();
                }
                (outcome, vec![unscored.reason()])
            }
        }
    }

    async fn run_rounds(
        &self,
        item: &QuestionItem,
        combo: &Combo,
        media: Vec<MediaRef>,
    ) -> (ModelOutcome, Vec<String>) {
        let mut builder = ConversationBuilder::new(media);
        let mut process = BTreeMap::new();
        let mut answers = BTreeMap::new();
        let mut verdicts = BTreeMap::new();
        let mut rationales = BTreeMap::new();
        let mut response_time = Duration::ZERO;
        let mut judge_time = Duration::ZERO;
        let mut errors = Vec::new();

        for round in item.rounds() {
            let question = item.question.for_round(&round);
            let reference = item.answer.for_round(&round);
            let options = item.options.for_round(&round);

            let Some(prompt) =
                self.personas
                    .render(&combo.persona, question, options, &item.question_type)
            else {
                errors.push(format!("unknown persona '{}'", combo.persona));
                break;
            };
            let conversation = match builder.begin_round(round.clone(), &prompt) {
                Ok(c) => c,
                Err(e) => {
                    errors.push(format!("{}: {}", round, e));
                    break;
                }
            };
            debug!(question_id = %item.id, round = %round, turns = conversation.turns.len(), "starting round");

            match self
                .score(&combo.model, &conversation, question, reference, options)
                .await
            {
                Ok((scored, extraction)) => {
                    let committed =
                        builder.commit_round(question, options, &extraction, scored.correct);
                    if let Err(e) = committed {
                        errors.push(format!("{}: {}", round, e));
                        break;
                    }
                    response_time += scored.response_time;
                    judge_time += scored.judge_time;
                    process.insert(round.clone(), Some(scored.process));
                    answers.insert(round.clone(), Some(scored.answer));
                    verdicts.insert(round.clone(), scored.correct);
                    rationales.insert(round, Some(scored.rationale));
                }
                Err(unscored) => {
                    warn!(question_id = %item.id, round = %round, reason = %unscored.reason(), "round failed");
                    if let Err(e) = builder.abandon_round() {
                        errors.push(format!("{}: {}", round, e));
                        break;
                    }
                    let round_process = match &unscored {
                        Unscored::Judge {
                            process: p,
                            response_time: t,
                            ..
                        } => {
                            response_time += *t;
                            Some(p.clone())
                        }
                        Unscored::Inference(_) => None,
                    };
                    errors.push(format!("{}: {}", round, unscored.reason()));
                    process.insert(round.clone(), round_process);
                    answers.insert(round.clone(), None);
                    verdicts.insert(round.clone(), false);
                    rationales.insert(round, None);
                }
            }
        }

        if let Err(e) = builder.finish() {
            errors.push(e.to_string());
        }

        let outcome = ModelOutcome {
            process: Answer::PerRound(process),
            answer: Answer::PerRound(answers),
            model_name: combo.model.clone(),
            response_time: response_time.as_secs_f64(),
            match_gt: Verdict::PerRound(verdicts),
            judge_reasoning: Answer::PerRound(rationales),
            judge_time: judge_time.as_secs_f64(),
            error: None,
        };
        (outcome, errors)
    }

    /// Model call, extraction and judging for one round.
    async fn score(
        &self,
        model: &str,
        conversation: &Conversation,
        question: &str,
        reference: &str,
        options: Option<&OptionMap>,
    ) -> Result<(Scored, Extraction), Unscored> {
        let generation = self
            .infer(model, conversation)
            .await
            .map_err(Unscored::Inference)?;
        let extraction = extract_answer(&generation.text);
        let process = compose_process(&generation);

        self.metrics.judge_call();
        let verdict = self
            .judge
            .judge(extraction.for_judge(), reference, question, options)
            .await
            .map_err(|e| Unscored::Judge {
                error: e.to_string(),
                process: process.clone(),
                response_time: generation.elapsed,
            })?;

        Ok((
            Scored {
                process,
                answer: extraction.text.clone(),
                correct: verdict.correct,
                rationale: verdict.rationale,
                response_time: generation.elapsed,
                judge_time: verdict.elapsed,
            },
            extraction,
        ))
    }

    async fn infer(
        &self,
        model: &str,
        conversation: &Conversation,
    ) -> Result<Generation, RetryError<ProviderError>> {
        invoke_with_retry(
            &self.retry,
            self.sleeper.as_ref(),
            model,
            ProviderError::is_retryable,
            |attempt| {
                self.metrics.inference_call(attempt);
                self.client.generate(model, conversation)
            },
        )
        .await
    }
}

/// Reasoning trace plus the response body with its boxed spans removed.
pub fn compose_process(generation: &Generation) -> String {
    let reasoning = generation
        .reasoning
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    let body = strip_boxed(&generation.text);
    let body = body.trim();
    match (reasoning.is_empty(), body.is_empty()) {
        (false, false) => format!("{reasoning}\n\n{body}"),
        (false, true) => reasoning.to_string(),
        (true, false) => body.to_string(),
        (true, true) => generation.text.clone(),
    }
}

fn build_record(item: &QuestionItem, combo: &Combo, outcome: ModelOutcome) -> ResultRecord {
    let agreement = outcome.match_gt.all_correct();
    ResultRecord {
        question_id: item.id.clone(),
        question: item.question.clone(),
        answer: item.answer.clone(),
        question_type: item.question_type.as_str().to_string(),
        image_type: item.tag("image_type").unwrap_or_default().to_string(),
        image_path: item.media.iter().map(|m| m.as_str().to_string()).collect(),
        options: item.options.clone(),
        profile: combo.persona.clone(),
        model: outcome,
        comparison: Comparison {
            agreement_with_gt: u8::from(agreement),
        },
        tags: item
            .tags
            .iter()
            .filter(|(k, _)| k.as_str() != "image_type")
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Options, Prompt, QuestionType};
    use crate::providers::llm::fake::FakeClient;
    use crate::retry::tests::RecordingSleeper;

    fn executor(model: FakeClient, judge: FakeClient) -> (TaskExecutor, Arc<RunMetrics>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let metrics = Arc::new(RunMetrics::new());
        let judge = JudgeService::new(
            Arc::new(judge),
            "judge",
            RetryPolicy::new(2, Duration::from_millis(1)),
        )
        .with_sleeper(sleeper.clone());
        let exec = TaskExecutor::new(
            Arc::new(model),
            judge,
            PersonaSet::default(),
            RetryPolicy::new(2, Duration::from_millis(1)),
            metrics.clone(),
        )
        .with_sleeper(sleeper);
        (exec, metrics)
    }

    fn choice_item() -> QuestionItem {
        QuestionItem {
            id: "Q1".into(),
            question: Prompt::Single("Which option?".into()),
            answer: Prompt::Single("C".into()),
            options: Options::Flat(
                [("A", "a"), ("B", "b"), ("C", "c")]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            question_type: QuestionType::SingleChoice,
            media: Vec::new(),
            tags: BTreeMap::from([("scenario".to_string(), "macro".to_string())]),
        }
    }

    fn multi_item(rounds: usize) -> QuestionItem {
        QuestionItem {
            id: "M1".into(),
            question: Prompt::PerRound(
                (1..=rounds).map(|i| (RoundKey::nth(i), format!("question {i}"))).collect(),
            ),
            answer: Prompt::PerRound((1..=rounds).map(|i| (RoundKey::nth(i), "A".to_string())).collect()),
            options: Options::None,
            question_type: QuestionType::Open,
            media: vec![MediaRef::new("https://cdn/x.png")],
            tags: BTreeMap::new(),
        }
    }

    const CORRECT: &str = r#"{"is_correct": true, "reasoning": "ok"}"#;

    #[tokio::test]
    async fn single_round_choice_item_is_scored() {
        let (exec, metrics) = executor(
            FakeClient::new("M1").with_response("Thinking... the answer is \\boxed{C}"),
            FakeClient::new("judge").with_response(CORRECT),
        );
        let out = exec.execute(&choice_item(), &Combo::new("M1", "expert")).await;
        assert!(out.failures.is_empty());
        let record = out.record.unwrap();
        assert_eq!(record.model.answer, Answer::text("C"));
        assert_eq!(record.model.match_gt, Verdict::Single(true));
        assert_eq!(record.model.process, Answer::text("Thinking... the answer is"));
        assert_eq!(record.comparison.agreement_with_gt, 1);
        assert_eq!(record.profile, "expert");
        assert_eq!(record.tags["scenario"], serde_json::json!("macro"));
        assert_eq!(metrics.snapshot().tasks_completed, 1);
    }

    #[tokio::test]
    async fn judge_exhaustion_leaves_the_answer_empty() {
        let (exec, metrics) = executor(
            FakeClient::new("M1").with_response("\\boxed{C}"),
            FakeClient::new("judge").with_response("no verdict here"),
        );
        let out = exec.execute(&choice_item(), &Combo::new("M1", "expert")).await;
        assert_eq!(out.failures.len(), 1);
        assert!(out.failures[0].reason.contains("judge unavailable"));
        let record = out.record.unwrap();
        assert!(!record.has_answer());
        assert!(record.model.error.is_some());
        assert_eq!(record.comparison.agreement_with_gt, 0);
        assert_eq!(metrics.snapshot().tasks_failed, 1);
    }

    #[tokio::test]
    async fn invalid_options_fail_before_any_call() {
        let model = FakeClient::new("M1").with_response("\\boxed{A}");
        let mut item = choice_item();
        item.options = Options::None;
        let (exec, _) = executor(model.clone(), FakeClient::new("judge").with_response(CORRECT));
        let out = exec.execute(&item, &Combo::new("M1", "expert")).await;
        assert!(out.record.is_none());
        assert!(out.failures[0].reason.contains("no usable options"));
        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_local_media_follows_policy() {
        let mut item = choice_item();
        item.media = vec![MediaRef::new("/definitely/not/here.png")];
        let combo = Combo::new("M1", "expert");

        let (skip, _) = executor(
            FakeClient::new("M1").with_response("\\boxed{C}"),
            FakeClient::new("judge").with_response(CORRECT),
        );
        let out = skip.execute(&item, &combo).await;
        assert!(out.record.is_none());
        assert!(out.failures[0].reason.contains("missing media"));

        let model = FakeClient::new("M1").with_response("\\boxed{C}");
        let (lenient, _) = executor(model.clone(), FakeClient::new("judge").with_response(CORRECT));
        let lenient = lenient.with_missing_media(MissingMediaPolicy::DropReference);
        let out = lenient.execute(&item, &combo).await;
        assert!(out.failures.is_empty());
        assert_eq!(model.calls()[0].1.media_count(), 0);
    }

    #[tokio::test]
    async fn rounds_share_history_and_media_once() {
        let model = FakeClient::new("M1").with_script(vec![
            Ok("long reasoning \\boxed{A}".into()),
            Ok("\\boxed{B}".into()),
            Ok("\\boxed{A}".into()),
        ]);
        let judge = FakeClient::new("judge").with_script(vec![
            Ok(CORRECT.into()),
            Ok(r#"{"is_correct": false, "reasoning": "wrong"}"#.into()),
            Ok(CORRECT.into()),
        ]);
        let (exec, _) = executor(model.clone(), judge);
        let out = exec.execute(&multi_item(3), &Combo::new("M1", "beginner")).await;
        assert!(out.failures.is_empty());

        let calls = model.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].1.turns.len(), 5);
        assert_eq!(calls[2].1.media_count(), 1);
        assert_eq!(calls[2].1.turns[1].text(), "A");

        let record = out.record.unwrap();
        assert!(record.has_answer());
        assert!(!record.model.match_gt.all_correct());
        assert_eq!(record.round_units().iter().filter(|u| u.correct).count(), 2);
        assert_eq!(record.comparison.agreement_with_gt, 0);
    }

    #[tokio::test]
    async fn failed_round_is_recorded_and_later_rounds_continue() {
        let model = FakeClient::new("M1").with_script(vec![
            Err(ProviderError::Client {
                status: 400,
                body: "too long".into(),
            }),
            Ok("\\boxed{A}".into()),
        ]);
        let (exec, _) = executor(model.clone(), FakeClient::new("judge").with_response(CORRECT));
        let out = exec.execute(&multi_item(2), &Combo::new("M1", "expert")).await;

        assert_eq!(out.failures.len(), 1);
        assert!(out.failures[0].reason.starts_with("round1"));
        let calls = model.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1.turns.len(), 1);
        assert_eq!(calls[1].1.media_count(), 1);

        let record = out.record.unwrap();
        assert_eq!(record.model.answer.for_round(&RoundKey::nth(1)), None);
        assert_eq!(record.model.answer.for_round(&RoundKey::nth(2)), Some("A"));
        assert!(!record.has_answer());
    }

    #[test]
    fn process_falls_back_to_raw_text() {
        let only_box = Generation {
            text: "\\boxed{A}".into(),
            ..Generation::default()
        };
        assert_eq!(compose_process(&only_box), "\\boxed{A}");

        let with_reasoning = Generation {
            text: "So \\boxed{A}".into(),
            reasoning: Some("step 1".into()),
            ..Generation::default()
        };
        assert_eq!(compose_process(&with_reasoning), "step 1\n\nSo");
    }
}
