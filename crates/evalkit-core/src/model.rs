use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Classification fields that feed the `by_category` breakdown.
pub const CATEGORY_FIELDS: &[&str] = &[
    "question_type",
    "fintype",
    "image_type",
    "scenario",
    "capability",
    "difficulty",
    "source",
    "language",
];

/// Sort position for round keys without a numeric suffix.
const UNNUMBERED_ROUND: u32 = 999;

/// Null, or a string with no non-whitespace characters.
///
/// This is the only emptiness rule in the crate: resume, dedup and scoring all go through it.
pub fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |s| s.trim().is_empty())
}

/// Round identifier (`round1`, `round2`, ...), ordered by its numeric suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoundKey(String);

impl RoundKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn nth(n: usize) -> Self {
        Self(format!("round{n}"))
    }

    pub fn is_round_key(key: &str) -> bool {
        key.starts_with("round")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn ordinal(&self) -> u32 {
        self.0
            .strip_prefix("round")
            .and_then(|n| n.parse().ok())
            .unwrap_or(UNNUMBERED_ROUND)
    }
}

impl Ord for RoundKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordinal()
            .cmp(&other.ordinal())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for RoundKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RoundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RoundKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RoundKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        String::deserialize(d).map(RoundKey)
    }
}

/// Question text or reference answer: one block, or one block per round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    PerRound(BTreeMap<RoundKey, String>),
    Single(String),
}

impl Default for Prompt {
    fn default() -> Self {
        Prompt::Single(String::new())
    }
}

impl Prompt {
    /// Text for a round. A single block answers every round.
    pub fn for_round(&self, round: &RoundKey) -> &str {
        match self {
            Prompt::Single(text) => text,
            Prompt::PerRound(map) => map.get(round).map(String::as_str).unwrap_or(""),
        }
    }

    pub fn as_single(&self) -> Option<&str> {
        match self {
            Prompt::Single(text) => Some(text),
            Prompt::PerRound(_) => None,
        }
    }
}

pub type OptionMap = BTreeMap<String, String>;

/// Choice set attached to an item.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Options {
    #[default]
    None,
    Flat(OptionMap),
    PerRound(BTreeMap<RoundKey, OptionMap>),
}

impl Options {
    /// Options that apply to `round`. A flat map is shared by every round.
    pub fn for_round(&self, round: &RoundKey) -> Option<&OptionMap> {
        match self {
            Options::None => None,
            Options::Flat(map) => Some(map),
            Options::PerRound(rounds) => rounds.get(round),
        }
    }

    pub fn flat(&self) -> Option<&OptionMap> {
        match self {
            Options::Flat(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Options::None)
    }
}

/// At least one option carries non-blank text.
pub fn has_valid_options(options: Option<&OptionMap>) -> bool {
    options.is_some_and(|map| map.values().any(|v| !is_blank(Some(v))))
}

/// `key. value` lines in key order; blank values are skipped.
pub fn format_options(options: &OptionMap) -> String {
    options
        .iter()
        .filter(|(_, v)| !is_blank(Some(v.as_str())))
        .map(|(k, v)| format!("{k}. {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl Serialize for Options {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Options::None => s.serialize_none(),
            Options::Flat(map) => map.serialize(s),
            Options::PerRound(map) => map.serialize(s),
        }
    }
}

impl<'de> Deserialize<'de> for Options {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            PerRound(BTreeMap<RoundKey, OptionMap>),
            Flat(OptionMap),
        }
        Ok(match Option::<Repr>::deserialize(d)? {
            None => Options::None,
            Some(Repr::PerRound(map)) => Options::PerRound(map),
            Some(Repr::Flat(map)) => Options::Flat(map),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum QuestionType {
    SingleChoice,
    MultiChoice,
    MultiRoundSingleChoice,
    TrueFalse,
    Open,
    #[default]
    Unspecified,
    Other(String),
}

impl QuestionType {
    /// Normalises the labels found in question banks (English and Chinese).
    pub fn parse(raw: &str) -> Self {
        let key = raw.trim().to_lowercase().replace(['-', ' '], "_");
        match key.as_str() {
            "" => QuestionType::Unspecified,
            "single_choice" | "single" | "单选题" | "单选" => QuestionType::SingleChoice,
            "multi_choice" | "multiple_choice" | "multi" | "多选题" | "多选" => {
                QuestionType::MultiChoice
            }
            "multi_round_single_choice" | "多轮单选题" => QuestionType::MultiRoundSingleChoice,
            "true_false" | "judgement" | "judgment" | "判断题" => QuestionType::TrueFalse,
            "open" | "open_ended" | "qa" | "问答题" | "简答题" | "多轮问答题" => {
                QuestionType::Open
            }
            _ => QuestionType::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            QuestionType::SingleChoice => "single_choice",
            QuestionType::MultiChoice => "multi_choice",
            QuestionType::MultiRoundSingleChoice => "multi_round_single_choice",
            QuestionType::TrueFalse => "true_false",
            QuestionType::Open => "open",
            QuestionType::Unspecified => "",
            QuestionType::Other(raw) => raw,
        }
    }

    /// True/false questions are not choice questions.
    pub fn is_choice(&self) -> bool {
        matches!(
            self,
            QuestionType::SingleChoice
                | QuestionType::MultiChoice
                | QuestionType::MultiRoundSingleChoice
        )
    }
}

/// A local path or an `http(s)` URL pointing at an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(String);

impl MediaRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_remote(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }

    pub fn local_path(&self) -> Option<&Path> {
        (!self.is_remote()).then(|| Path::new(&self.0))
    }
}

/// One normalised benchmark question. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionItem {
    pub id: String,
    pub question: Prompt,
    pub answer: Prompt,
    pub options: Options,
    pub question_type: QuestionType,
    pub media: Vec<MediaRef>,
    /// Classification tags (`image_type`, `scenario`, ...). Free-form.
    pub tags: BTreeMap<String, String>,
}

impl QuestionItem {
    pub fn is_multi_round(&self) -> bool {
        matches!(self.question, Prompt::PerRound(_))
    }

    /// Rounds in conversation order. Single-round items have none.
    pub fn rounds(&self) -> Vec<RoundKey> {
        match &self.question {
            Prompt::PerRound(map) => map.keys().cloned().collect(),
            Prompt::Single(_) => Vec::new(),
        }
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }
}

/// Identity of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub question_id: String,
    pub model: String,
    pub persona: String,
}

/// A (model, persona) pair; one output artifact each.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Combo {
    pub model: String,
    pub persona: String,
}

impl Combo {
    pub fn new(model: impl Into<String>, persona: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            persona: persona.into(),
        }
    }

    pub fn task(&self, question_id: &str) -> TaskId {
        TaskId {
            question_id: question_id.to_string(),
            model: self.model.clone(),
            persona: self.persona.clone(),
        }
    }
}

impl fmt::Display for Combo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.persona)
    }
}

/// Model-produced text: one value, or one per round. `null` is kept distinct from "".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Answer {
    PerRound(BTreeMap<RoundKey, Option<String>>),
    Single(Option<String>),
}

impl Default for Answer {
    fn default() -> Self {
        Answer::Single(None)
    }
}

impl Answer {
    pub fn text(value: impl Into<String>) -> Self {
        Answer::Single(Some(value.into()))
    }

    pub fn rounds<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (RoundKey, S)>,
        S: Into<String>,
    {
        Answer::PerRound(
            entries
                .into_iter()
                .map(|(k, v)| (k, Some(v.into())))
                .collect(),
        )
    }

    pub fn for_round(&self, round: &RoundKey) -> Option<&str> {
        match self {
            Answer::PerRound(map) => map.get(round).and_then(|v| v.as_deref()),
            Answer::Single(v) => v.as_deref(),
        }
    }
}

/// Judge outcome: one flag, or one per round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Verdict {
    PerRound(BTreeMap<RoundKey, bool>),
    Single(bool),
}

impl Default for Verdict {
    fn default() -> Self {
        Verdict::Single(false)
    }
}

impl Verdict {
    /// Logical AND over rounds. An empty round map is not correct.
    pub fn all_correct(&self) -> bool {
        match self {
            Verdict::Single(v) => *v,
            Verdict::PerRound(map) => !map.is_empty() && map.values().all(|v| *v),
        }
    }

    pub fn for_round(&self, round: &RoundKey) -> bool {
        match self {
            Verdict::Single(v) => *v,
            Verdict::PerRound(map) => map.get(round).copied().unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelOutcome {
    #[serde(default)]
    pub process: Answer,
    #[serde(default)]
    pub answer: Answer,
    pub model_name: String,
    #[serde(default)]
    pub response_time: f64,
    #[serde(default)]
    pub match_gt: Verdict,
    #[serde(default)]
    pub judge_reasoning: Answer,
    #[serde(default)]
    pub judge_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Comparison {
    pub agreement_with_gt: u8,
}

/// Outcome of one task as persisted in an artifact. Never edited once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub question_id: String,
    #[serde(default)]
    pub question: Prompt,
    #[serde(default)]
    pub answer: Prompt,
    #[serde(default)]
    pub question_type: String,
    #[serde(default)]
    pub image_type: String,
    #[serde(default)]
    pub image_path: Vec<String>,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub profile: String,
    pub model: ModelOutcome,
    #[serde(default)]
    pub comparison: Comparison,
    /// Remaining classification tags and any field this version does not know about.
    #[serde(flatten)]
    pub tags: BTreeMap<String, serde_json::Value>,
}

/// One scoring unit of a record: the whole item, or a single round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub round: Option<RoundKey>,
    pub answered: bool,
    pub correct: bool,
}

impl ResultRecord {
    /// Per-round units (or the single unit of a single-round record).
    ///
    /// A round listed by the verdict but missing from the answer map counts as unanswered.
    pub fn round_units(&self) -> Vec<Unit> {
        match &self.model.answer {
            Answer::Single(text) => vec![Unit {
                round: None,
                answered: !is_blank(text.as_deref()),
                correct: self.model.match_gt.all_correct(),
            }],
            Answer::PerRound(answers) => {
                let mut keys: BTreeSet<&RoundKey> = answers.keys().collect();
                if let Verdict::PerRound(verdicts) = &self.model.match_gt {
                    keys.extend(verdicts.keys());
                }
                keys.into_iter()
                    .map(|round| Unit {
                        round: Some(round.clone()),
                        answered: !is_blank(answers.get(round).and_then(|v| v.as_deref())),
                        correct: self.model.match_gt.for_round(round),
                    })
                    .collect()
            }
        }
    }

    /// The whole item as one unit: answered only if every round is, correct only if every round is.
    pub fn item_unit(&self) -> Unit {
        let rounds = self.round_units();
        Unit {
            round: None,
            answered: !rounds.is_empty() && rounds.iter().all(|u| u.answered),
            correct: !rounds.is_empty() && rounds.iter().all(|u| u.correct),
        }
    }

    /// Whether this record can be authoritative for its question id.
    pub fn has_answer(&self) -> bool {
        self.item_unit().answered
    }

    /// Category value for `field`, if present and non-blank.
    pub fn category(&self, field: &str) -> Option<String> {
        let value = match field {
            "question_type" => Some(self.question_type.clone()),
            "image_type" => Some(self.image_type.clone()),
            other => self.tags.get(other).and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                serde_json::Value::Bool(b) => Some(b.to_string()),
                _ => None,
            }),
        }?;
        (!is_blank(Some(&value))).then_some(value)
    }
}
