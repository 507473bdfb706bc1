//! Multi-round conversation state.
//!
//! A [`ConversationBuilder`] is owned by the single worker executing a task. Each round goes
//! `begin_round` -> (model call, extraction, judge) -> `commit_round` or `abandon_round`;
//! only compacted text reaches the history, never the raw response.

pub mod prompt;

use crate::errors::InputError;
use crate::extract::{tail_chars, Extraction};
use crate::model::{format_options, has_valid_options, MediaRef, OptionMap, QuestionItem};
use crate::model::{QuestionType, RoundKey};
use serde::Serialize;

/// Characters of the raw response kept in history when nothing was extracted.
pub const HISTORY_EXCERPT_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    Media(MediaRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Turn {
    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentPart::Text(text.into())])
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            parts: vec![ContentPart::Text(text.into())],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            parts: vec![ContentPart::Text(text.into())],
        }
    }

    pub fn has_media(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ContentPart::Media(_)))
    }

    pub fn media(&self) -> impl Iterator<Item = &MediaRef> {
        self.parts.iter().filter_map(|p| match p {
            ContentPart::Media(m) => Some(m),
            ContentPart::Text(_) => None,
        })
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.as_str()),
                ContentPart::Media(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Messages sent to a model for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    pub turns: Vec<Turn>,
}

impl Conversation {
    pub fn single(turn: Turn) -> Self {
        Self { turns: vec![turn] }
    }

    pub fn media_count(&self) -> usize {
        self.turns.iter().map(|t| t.media().count()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundState {
    NotStarted,
    InProgress(RoundKey),
    Committed(RoundKey),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} while conversation is {state:?}")]
pub struct TransitionError {
    pub action: &'static str,
    pub state: RoundState,
}

/// Per-task conversation state machine.
#[derive(Debug)]
pub struct ConversationBuilder {
    media: Vec<MediaRef>,
    history: Vec<Turn>,
    state: RoundState,
    outgoing_media: Vec<MediaRef>,
    verdicts: Vec<(RoundKey, bool)>,
}

impl ConversationBuilder {
    pub fn new(media: Vec<MediaRef>) -> Self {
        Self {
            media,
            history: Vec::new(),
            state: RoundState::NotStarted,
            outgoing_media: Vec::new(),
            verdicts: Vec::new(),
        }
    }

    pub fn state(&self) -> &RoundState {
        &self.state
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// Builds the outgoing conversation for `round`: committed history plus the new user turn.
    ///
    /// Media goes on this turn only if no earlier turn carries it.
    pub fn begin_round(
        &mut self,
        round: RoundKey,
        prompt: &str,
    ) -> Result<Conversation, TransitionError> {
        match self.state {
            RoundState::NotStarted | RoundState::Committed(_) => {}
            _ => {
                return Err(TransitionError {
                    action: "begin a round",
                    state: self.state.clone(),
                })
            }
        }

        let attach = !self.history.iter().any(Turn::has_media);
        self.outgoing_media = if attach {
            self.media.clone()
        } else {
            Vec::new()
        };

        let mut parts: Vec<ContentPart> = self
            .outgoing_media
            .iter()
            .cloned()
            .map(ContentPart::Media)
            .collect();
        parts.push(ContentPart::Text(prompt.to_string()));

        let mut turns = self.history.clone();
        turns.push(Turn::user(parts));
        self.state = RoundState::InProgress(round);
        Ok(Conversation { turns })
    }

    /// Appends the compacted (user, assistant) pair for the round in progress.
    pub fn commit_round(
        &mut self,
        question: &str,
        options: Option<&OptionMap>,
        extraction: &Extraction,
        correct: bool,
    ) -> Result<(), TransitionError> {
        let round = self.take_in_progress("commit a round")?;

        let mut parts: Vec<ContentPart> = std::mem::take(&mut self.outgoing_media)
            .into_iter()
            .map(ContentPart::Media)
            .collect();
        parts.push(ContentPart::Text(compact_question(question, options)));
        self.history.push(Turn::user(parts));
        self.history.push(Turn::assistant(compact_answer(extraction)));

        self.verdicts.push((round.clone(), correct));
        self.state = RoundState::Committed(round);
        Ok(())
    }

    /// Closes a failed round: scored incorrect, nothing added to history.
    pub fn abandon_round(&mut self) -> Result<(), TransitionError> {
        let round = self.take_in_progress("abandon a round")?;
        self.outgoing_media.clear();
        self.verdicts.push((round.clone(), false));
        self.state = RoundState::Committed(round);
        Ok(())
    }

    /// Whole-task correctness: every round correct. No rounds means not correct.
    pub fn finish(&mut self) -> Result<bool, TransitionError> {
        if matches!(self.state, RoundState::InProgress(_) | RoundState::Done) {
            return Err(TransitionError {
                action: "finish",
                state: self.state.clone(),
            });
        }
        self.state = RoundState::Done;
        Ok(!self.verdicts.is_empty() && self.verdicts.iter().all(|(_, ok)| *ok))
    }

    fn take_in_progress(&mut self, action: &'static str) -> Result<RoundKey, TransitionError> {
        match &self.state {
            RoundState::InProgress(round) => Ok(round.clone()),
            state => Err(TransitionError {
                action,
                state: state.clone(),
            }),
        }
    }
}

/// Question text plus its options, without any persona template.
pub fn compact_question(question: &str, options: Option<&OptionMap>) -> String {
    match options.filter(|o| has_valid_options(Some(o))) {
        Some(opts) => format!("{question}\n\nOptions:\n{}", format_options(opts)),
        None => question.to_string(),
    }
}

/// Extracted answer, or a short tail of the response when extraction produced nothing.
pub fn compact_answer(extraction: &Extraction) -> String {
    if extraction.text.trim().is_empty() {
        tail_chars(&extraction.original, HISTORY_EXCERPT_CHARS)
    } else {
        extraction.text.clone()
    }
}

/// Rejects choice-type items whose options cannot be presented.
pub fn validate_options(item: &QuestionItem) -> Result<(), InputError> {
    let kind = &item.question_type;
    let needs_options = kind.is_choice();

    if item.is_multi_round() {
        if !needs_options {
            return Ok(());
        }
        if item.options.is_none() {
            return Err(missing(item, kind));
        }
        for round in item.rounds() {
            if !has_valid_options(item.options.for_round(&round)) {
                return Err(InputError::MissingRoundOptions {
                    id: item.id.clone(),
                    kind: kind.as_str().to_string(),
                    round: round.to_string(),
                });
            }
        }
        return Ok(());
    }

    if needs_options && !has_valid_options(item.options.flat()) {
        return Err(missing(item, kind));
    }
    Ok(())
}

fn missing(item: &QuestionItem, kind: &QuestionType) -> InputError {
    InputError::MissingOptions {
        id: item.id.clone(),
        kind: kind.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract_answer;
    use crate::model::{Options, Prompt};
    use std::collections::BTreeMap;

    fn media() -> Vec<MediaRef> {
        vec![MediaRef::new("chart.png"), MediaRef::new("https://x/y.jpg")]
    }

    fn item(question: Prompt, options: Options, kind: QuestionType) -> QuestionItem {
        QuestionItem {
            id: "q1".into(),
            question,
            answer: Prompt::Single("A".into()),
            options,
            question_type: kind,
            media: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn media_attached_once_across_rounds() {
        let mut b = ConversationBuilder::new(media());
        let first = b.begin_round(RoundKey::nth(1), "prompt one").unwrap();
        assert_eq!(first.media_count(), 2);
        b.commit_round("q one", None, &extract_answer(r"\boxed{A}"), true)
            .unwrap();

        let second = b.begin_round(RoundKey::nth(2), "prompt two").unwrap();
        assert_eq!(second.turns.len(), 3);
        assert_eq!(second.media_count(), 2);
        assert!(second.turns[0].has_media());
        assert!(!second.turns[2].has_media());
    }

    #[test]
    fn history_holds_compacted_turns_only() {
        let mut b = ConversationBuilder::new(Vec::new());
        b.begin_round(RoundKey::nth(1), "PERSONA TEMPLATE: what?")
            .unwrap();
        let opts = BTreeMap::from([("B".to_string(), "no".to_string()), ("A".to_string(), "yes".to_string())]);
        let long = format!("{} \\boxed{{A}}", "thinking ".repeat(200));
        b.commit_round("what?", Some(&opts), &extract_answer(&long), true)
            .unwrap();

        let h = b.history();
        assert_eq!(h[0].text(), "what?\n\nOptions:\nA. yes\nB. no");
        assert_eq!(h[1].text(), "A");
        assert!(!h[0].text().contains("PERSONA"));
    }

    #[test]
    fn empty_extraction_keeps_short_tail() {
        let ex = Extraction {
            text: String::new(),
            structured: false,
            original: "y".repeat(1000),
        };
        assert_eq!(compact_answer(&ex).chars().count(), HISTORY_EXCERPT_CHARS);
    }

    #[test]
    fn abandoned_round_leaves_media_for_next_round() {
        let mut b = ConversationBuilder::new(media());
        b.begin_round(RoundKey::nth(1), "one").unwrap();
        b.abandon_round().unwrap();
        let next = b.begin_round(RoundKey::nth(2), "two").unwrap();
        assert_eq!(next.turns.len(), 1);
        assert_eq!(next.media_count(), 2);
        b.commit_round("two", None, &extract_answer("B"), true).unwrap();
        assert!(!b.finish().unwrap());
    }

    #[test]
    fn all_rounds_must_be_correct() {
        let mut b = ConversationBuilder::new(Vec::new());
        for (i, ok) in [(1, true), (2, true), (3, true)] {
            b.begin_round(RoundKey::nth(i), "q").unwrap();
            b.commit_round("q", None, &extract_answer("x"), ok).unwrap();
        }
        assert!(b.finish().unwrap());
        assert_eq!(b.state(), &RoundState::Done);
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let mut b = ConversationBuilder::new(Vec::new());
        assert!(b.commit_round("q", None, &extract_answer("x"), true).is_err());
        b.begin_round(RoundKey::nth(1), "q").unwrap();
        assert!(b.begin_round(RoundKey::nth(2), "q").is_err());
        assert!(b.finish().is_err());
    }

    #[test]
    fn choice_item_without_options_is_rejected() {
        let it = item(Prompt::Single("?".into()), Options::None, QuestionType::SingleChoice);
        assert!(matches!(
            validate_options(&it),
            Err(InputError::MissingOptions { .. })
        ));

        let tf = item(Prompt::Single("?".into()), Options::None, QuestionType::TrueFalse);
        assert!(validate_options(&tf).is_ok());
    }

    #[test]
    fn multi_round_choice_needs_options_for_every_round() {
        let question = Prompt::PerRound(BTreeMap::from([
            (RoundKey::nth(1), "a".to_string()),
            (RoundKey::nth(2), "b".to_string()),
        ]));
        let per_round = Options::PerRound(BTreeMap::from([(
            RoundKey::nth(1),
            BTreeMap::from([("A".to_string(), "x".to_string())]),
        )]));
        let it = item(question.clone(), per_round, QuestionType::MultiRoundSingleChoice);
        assert!(matches!(
            validate_options(&it),
            Err(InputError::MissingRoundOptions { ref round, .. }) if round == "round2"
        ));

        let shared = Options::Flat(BTreeMap::from([("A".to_string(), "x".to_string())]));
        let ok = item(question, shared, QuestionType::MultiRoundSingleChoice);
        assert!(validate_options(&ok).is_ok());
    }
}
