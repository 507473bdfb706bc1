//! Question ingestion: JSON array or JSONL files, normalised into [`QuestionItem`]s.
//!
//! Every shape decision (single vs per-round prompt, flat vs per-round options) is made
//! here once; nothing downstream sniffs keys again.

use crate::errors::InputError;
use crate::model::{
    MediaRef, OptionMap, Options, Prompt, QuestionItem, QuestionType, RoundKey, CATEGORY_FIELDS,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

/// Items that normalised cleanly plus the ones that were rejected.
#[derive(Debug, Clone, Default)]
pub struct LoadedQuestions {
    pub items: Vec<QuestionItem>,
    pub rejected: Vec<InputError>,
}

/// How many items to evaluate and in which order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Selection {
    pub limit: Option<usize>,
    pub random: bool,
    pub seed: Option<u64>,
}

pub fn load_questions(path: &Path) -> Result<LoadedQuestions, InputError> {
    let unreadable = |reason: String| InputError::Unreadable {
        path: path.to_path_buf(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
    let is_jsonl = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jsonl"));

    let raw: Vec<Value> = if is_jsonl {
        text.lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(i, l)| {
                serde_json::from_str(l).map_err(|e| unreadable(format!("line {}: {}", i + 1, e)))
            })
            .collect::<Result<_, _>>()?
    } else {
        match serde_json::from_str(&text).map_err(|e| unreadable(e.to_string()))? {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("questions").or_else(|| map.remove("data")) {
                Some(Value::Array(items)) => items,
                _ => vec![Value::Object(map)],
            },
            _ => return Err(unreadable("expected an array of question objects".into())),
        }
    };

    let loaded = normalize_all(raw);
    info!(
        path = %path.display(),
        items = loaded.items.len(),
        rejected = loaded.rejected.len(),
        "loaded questions"
    );
    Ok(loaded)
}

/// Normalises raw items, keeping the first occurrence of each id.
pub fn normalize_all(raw: Vec<Value>) -> LoadedQuestions {
    let mut loaded = LoadedQuestions::default();
    let mut seen = HashSet::new();
    for (index, value) in raw.into_iter().enumerate() {
        match normalize(index, &value) {
            Ok(item) => {
                if seen.insert(item.id.clone()) {
                    loaded.items.push(item);
                } else {
                    warn!(question_id = %item.id, "duplicate question id; keeping the first");
                }
            }
            Err(e) => loaded.rejected.push(e),
        }
    }
    loaded
}

pub fn normalize(index: usize, value: &Value) -> Result<QuestionItem, InputError> {
    let obj = value.as_object().ok_or(InputError::MissingId { index })?;
    let id = ["question_id", "id"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(scalar_text))
        .filter(|s| !s.trim().is_empty())
        .ok_or(InputError::MissingId { index })?;
    let malformed = |reason: &str| InputError::Malformed {
        id: id.clone(),
        reason: reason.to_string(),
    };

    let question_raw = obj.get("question").unwrap_or(&Value::Null);
    let answer_raw = obj.get("answer").unwrap_or(&Value::Null);
    let multi_round = is_multi_round(&id, obj, question_raw, answer_raw);

    let (question, answer) = if multi_round {
        let rounds = round_map(question_raw)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| malformed("multi-round item without round1.. question keys"))?;
        let answer = match round_map(answer_raw).filter(|m| !m.is_empty()) {
            Some(map) => Prompt::PerRound(map),
            None => Prompt::Single(text_of(answer_raw)),
        };
        (Prompt::PerRound(rounds), answer)
    } else {
        if question_raw.is_object() {
            return Err(malformed("question is an object without round keys"));
        }
        (
            Prompt::Single(text_of(question_raw)),
            Prompt::Single(text_of(answer_raw)),
        )
    };

    let question_type = obj
        .get("question_type")
        .and_then(scalar_text)
        .map(|s| QuestionType::parse(&s))
        .unwrap_or_default();

    let mut tags = BTreeMap::new();
    for field in CATEGORY_FIELDS.iter().filter(|f| **f != "question_type") {
        if let Some(v) = obj.get(*field).and_then(scalar_text) {
            if !v.trim().is_empty() {
                tags.insert(field.to_string(), v);
            }
        }
    }

    Ok(QuestionItem {
        options: options_of(obj.get("options")),
        media: media_of(obj),
        id,
        question,
        answer,
        question_type,
        tags,
    })
}

fn is_multi_round(id: &str, obj: &Map<String, Value>, question: &Value, answer: &Value) -> bool {
    if obj.get("is_multi_round").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    let Some(q_rounds) = question.as_object().map(round_keys).filter(|k| !k.is_empty()) else {
        return false;
    };
    match answer.as_object().map(round_keys).filter(|k| !k.is_empty()) {
        Some(a_rounds) => q_rounds.iter().any(|k| a_rounds.contains(k)),
        None => {
            warn!(question_id = %id, "per-round question with a single answer; sharing it across rounds");
            true
        }
    }
}

fn round_keys(map: &Map<String, Value>) -> Vec<&str> {
    map.keys()
        .map(String::as_str)
        .filter(|k| RoundKey::is_round_key(k))
        .collect()
}

fn round_map(value: &Value) -> Option<BTreeMap<RoundKey, String>> {
    let map = value.as_object()?;
    Some(
        map.iter()
            .filter(|(k, _)| RoundKey::is_round_key(k))
            .map(|(k, v)| (RoundKey::new(k.as_str()), text_of(v)))
            .collect(),
    )
}

fn options_of(value: Option<&Value>) -> Options {
    match value {
        Some(Value::Object(map)) if !map.is_empty() => {
            let per_round = map
                .iter()
                .all(|(k, v)| RoundKey::is_round_key(k) && v.is_object());
            if per_round {
                Options::PerRound(
                    map.iter()
                        .filter_map(|(k, v)| Some((RoundKey::new(k.as_str()), option_map(v.as_object()?))))
                        .collect(),
                )
            } else {
                Options::Flat(option_map(map))
            }
        }
        Some(Value::Array(list)) if !list.is_empty() => Options::Flat(
            list.iter()
                .zip('A'..='Z')
                .map(|(v, letter)| (letter.to_string(), text_of(v)))
                .collect(),
        ),
        _ => Options::None,
    }
}

fn option_map(map: &Map<String, Value>) -> OptionMap {
    map.iter()
        .map(|(k, v)| (k.trim().to_string(), text_of(v)))
        .collect()
}

fn media_of(obj: &Map<String, Value>) -> Vec<MediaRef> {
    let mut refs = Vec::new();
    for key in ["image_path", "image_urls"] {
        match obj.get(key) {
            Some(Value::String(s)) => refs.extend(split_paths(s)),
            Some(Value::Array(list)) => refs.extend(list.iter().filter_map(Value::as_str).map(str::to_string)),
            _ => {}
        }
    }
    refs.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(MediaRef::new)
        .collect()
}

/// Splits on `;` when present, otherwise on `,`.
fn split_paths(raw: &str) -> Vec<String> {
    let sep = if raw.contains(';') { ';' } else { ',' };
    raw.split(sep).map(str::to_string).collect()
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Text form of an answer or prompt value. Lists of choices are concatenated (`["A","C"]` -> `AC`).
fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(text_of).collect::<Vec<_>>().join(""),
        Value::Object(_) => value.to_string(),
        other => scalar_text(other).unwrap_or_default(),
    }
}

/// Applies the optional seeded shuffle, then the limit.
pub fn select(mut items: Vec<QuestionItem>, selection: Selection) -> Vec<QuestionItem> {
    if selection.random {
        let seed = selection.seed.unwrap_or_else(rand::random);
        info!(seed, "shuffling questions");
        let mut rng = StdRng::seed_from_u64(seed);
        items.shuffle(&mut rng);
    }
    if let Some(limit) = selection.limit {
        items.truncate(limit);
    }
    items
}
