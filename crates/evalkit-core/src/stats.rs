//! Accuracy statistics over the authoritative record set.
//!
//! Authority is first-non-empty-wins per (model, persona, question id), in storage order.
//! Units with an empty answer are left out of the denominator; they are unfinished, not wrong.
//! In per-round mode a question with no fully answered record is still scored on the answered
//! rounds of its first partial record.

use crate::model::{ResultRecord, Unit, CATEGORY_FIELDS};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    /// One unit per question id, correct iff every round is.
    WholeItem,
    /// One unit per round.
    #[default]
    PerRound,
}

impl ScoringMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoringMode::WholeItem => "whole_item",
            ScoringMode::PerRound => "per_round",
        }
    }

    fn units(&self, record: &ResultRecord) -> Vec<Unit> {
        match self {
            ScoringMode::WholeItem => vec![record.item_unit()],
            ScoringMode::PerRound => record.round_units(),
        }
    }
}

impl fmt::Display for ScoringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScoringMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "whole_item" | "whole" | "item" => Ok(ScoringMode::WholeItem),
            "per_round" | "round" => Ok(ScoringMode::PerRound),
            other => Err(format!("unknown scoring mode: {other} (expected whole_item or per_round)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Tally {
    pub total_count: u64,
    pub correct_count: u64,
    pub accuracy: f64,
}

impl Tally {
    /// Counts an answered unit; unanswered units are ignored.
    fn add(&mut self, unit: &Unit) {
        if !unit.answered {
            return;
        }
        self.total_count += 1;
        if unit.correct {
            self.correct_count += 1;
        }
        self.accuracy = self.correct_count as f64 / self.total_count as f64;
    }
}

/// The statistics header stored at the top of every artifact.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub total: Tally,
    #[serde(default)]
    pub by_model: BTreeMap<String, Tally>,
    #[serde(default)]
    pub by_profile: BTreeMap<String, Tally>,
    #[serde(default)]
    pub by_category: BTreeMap<String, BTreeMap<String, Tally>>,
    #[serde(default)]
    pub scoring_method: ScoringMode,
}

/// The authoritative record of each (model, persona, question id), in storage order.
pub fn authoritative<'a, I>(records: I) -> Vec<&'a ResultRecord>
where
    I: IntoIterator<Item = &'a ResultRecord>,
{
    let mut seen: HashSet<RecordKey<'a>> = HashSet::new();
    records
        .into_iter()
        .filter(|r| r.has_answer())
        .filter(|r| seen.insert(record_key(*r)))
        .collect()
}

type RecordKey<'a> = (&'a str, &'a str, &'a str);

fn record_key(r: &ResultRecord) -> RecordKey<'_> {
    (
        r.model.model_name.as_str(),
        r.profile.as_str(),
        r.question_id.as_str(),
    )
}

/// The record each (model, persona, question id) is scored on.
///
/// A fully answered record always wins. Per-round scoring falls back to the first record with
/// at least one answered round; its blank rounds stay out of the denominator.
fn scored<'a, I>(records: I, mode: ScoringMode) -> Vec<&'a ResultRecord>
where
    I: IntoIterator<Item = &'a ResultRecord>,
{
    let mut chosen: Vec<&'a ResultRecord> = Vec::new();
    let mut slots: HashMap<RecordKey<'a>, (usize, bool)> = HashMap::new();
    for record in records {
        let complete = record.has_answer();
        let partial = mode == ScoringMode::PerRound
            && record.round_units().iter().any(|u| u.answered);
        if !complete && !partial {
            continue;
        }
        match slots.entry(record_key(record)) {
            Entry::Vacant(slot) => {
                slot.insert((chosen.len(), complete));
                chosen.push(record);
            }
            Entry::Occupied(mut slot) => {
                let (idx, settled) = *slot.get();
                if complete && !settled {
                    chosen[idx] = record;
                    slot.insert((idx, true));
                }
            }
        }
    }
    chosen
}

/// Recomputes every breakdown from scratch.
pub fn compute<'a, I>(records: I, mode: ScoringMode) -> Statistics
where
    I: IntoIterator<Item = &'a ResultRecord>,
{
    let mut stats = Statistics {
        scoring_method: mode,
        ..Statistics::default()
    };

    for record in scored(records, mode) {
        let categories: Vec<(&str, String)> = CATEGORY_FIELDS
            .iter()
            .filter_map(|field| record.category(field).map(|v| (*field, v)))
            .collect();

        for unit in mode.units(record) {
            stats.total.add(&unit);
            stats
                .by_model
                .entry(record.model.model_name.clone())
                .or_default()
                .add(&unit);
            stats
                .by_profile
                .entry(record.profile.clone())
                .or_default()
                .add(&unit);
            for (field, value) in &categories {
                stats
                    .by_category
                    .entry(field.to_string())
                    .or_default()
                    .entry(value.clone())
                    .or_default()
                    .add(&unit);
            }
        }
    }

    // Groups whose every unit was unanswered carry no information.
    stats.by_model.retain(|_, t| t.total_count > 0);
    stats.by_profile.retain(|_, t| t.total_count > 0);
    for values in stats.by_category.values_mut() {
        values.retain(|_, t| t.total_count > 0);
    }
    stats.by_category.retain(|_, v| !v.is_empty());
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(qid: &str, answer: serde_json::Value, match_gt: serde_json::Value) -> ResultRecord {
        serde_json::from_value(json!({
            "question_id": qid,
            "question_type": "single_choice",
            "profile": "P1",
            "scenario": "trading",
            "model": { "model_name": "M1", "answer": answer, "match_gt": match_gt },
        }))
        .unwrap()
    }

    #[test]
    fn single_correct_item_scores_one() {
        let records = vec![record("Q1", json!("C"), json!(true))];
        let stats = compute(&records, ScoringMode::PerRound);
        assert_eq!(stats.total.total_count, 1);
        assert_eq!(stats.total.correct_count, 1);
        assert_eq!(stats.total.accuracy, 1.0);
        assert_eq!(stats.by_model["M1"].total_count, 1);
        assert_eq!(stats.by_profile["P1"].correct_count, 1);
        assert_eq!(stats.by_category["scenario"]["trading"].total_count, 1);
        assert_eq!(stats.by_category["question_type"]["single_choice"].total_count, 1);
    }

    #[test]
    fn non_empty_record_wins_in_either_order() {
        let empty = record("Q1", json!(""), json!(false));
        let full = record("Q1", json!("B"), json!(true));

        for records in [vec![empty.clone(), full.clone()], vec![full.clone(), empty.clone()]] {
            let auth = authoritative(&records);
            assert_eq!(auth.len(), 1);
            assert_eq!(auth[0], &full);
        }
    }

    #[test]
    fn first_non_empty_wins_among_duplicates() {
        let first = record("Q1", json!("A"), json!(false));
        let second = record("Q1", json!("B"), json!(true));
        let records = vec![record("Q1", json!(null), json!(false)), first.clone(), second];
        assert_eq!(authoritative(&records), vec![&first]);
    }

    #[test]
    fn remerging_authoritative_records_is_idempotent() {
        let records = vec![
            record("Q1", json!("C"), json!(true)),
            record("Q2", json!("A"), json!(false)),
        ];
        let once = compute(&records, ScoringMode::WholeItem);
        let mut twice_input = records.clone();
        twice_input.extend(records.iter().cloned());
        assert_eq!(compute(&twice_input, ScoringMode::WholeItem), once);
    }

    #[test]
    fn empty_answers_leave_the_denominator() {
        let records = vec![
            record("Q1", json!("C"), json!(true)),
            record("Q2", json!("   "), json!(false)),
        ];
        let stats = compute(&records, ScoringMode::PerRound);
        assert_eq!(stats.total.total_count, 1);
        assert_eq!(stats.total.accuracy, 1.0);
    }

    #[test]
    fn three_rounds_score_per_mode() {
        let answers = json!({"round1": "A", "round2": "B", "round3": "C"});
        let mixed = vec![record(
            "Q1",
            answers.clone(),
            json!({"round1": true, "round2": false, "round3": true}),
        )];
        let whole = compute(&mixed, ScoringMode::WholeItem);
        assert_eq!((whole.total.total_count, whole.total.correct_count), (1, 0));
        let per_round = compute(&mixed, ScoringMode::PerRound);
        assert_eq!((per_round.total.total_count, per_round.total.correct_count), (3, 2));

        let all_true = vec![record(
            "Q1",
            answers,
            json!({"round1": true, "round2": true, "round3": true}),
        )];
        let whole = compute(&all_true, ScoringMode::WholeItem);
        assert_eq!((whole.total.total_count, whole.total.correct_count), (1, 1));
    }

    #[test]
    fn partially_answered_rounds_still_count_per_round() {
        let partial = record(
            "Q1",
            json!({"round1": "A", "round2": "B", "round3": null}),
            json!({"round1": true, "round2": true, "round3": false}),
        );
        let records = vec![partial.clone()];

        let per_round = compute(&records, ScoringMode::PerRound);
        assert_eq!((per_round.total.total_count, per_round.total.correct_count), (2, 2));
        assert_eq!(per_round.by_model["M1"].total_count, 2);

        let whole = compute(&records, ScoringMode::WholeItem);
        assert_eq!(whole.total.total_count, 0);
        // Still unfinished for resume.
        assert!(authoritative(&records).is_empty());

        let complete = record(
            "Q1",
            json!({"round1": "A", "round2": "C", "round3": "D"}),
            json!({"round1": true, "round2": false, "round3": false}),
        );
        let stats = compute(&[partial, complete], ScoringMode::PerRound);
        assert_eq!((stats.total.total_count, stats.total.correct_count), (3, 1));
    }

    #[test]
    fn scoring_mode_parses_and_serializes_snake_case() {
        assert_eq!("whole-item".parse::<ScoringMode>().unwrap(), ScoringMode::WholeItem);
        assert!("sometimes".parse::<ScoringMode>().is_err());
        assert_eq!(
            serde_json::to_value(ScoringMode::PerRound).unwrap(),
            json!("per_round")
        );
    }
}
