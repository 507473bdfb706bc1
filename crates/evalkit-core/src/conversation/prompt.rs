use crate::model::{format_options, has_valid_options, OptionMap, QuestionType};
use std::collections::BTreeMap;

pub const QUESTION_SLOT: &str = "{question}";
pub const OPTIONS_SLOT: &str = "{options}";
pub const INSTRUCTIONS_SLOT: &str = "{instructions}";

const BEGINNER: &str = "I am new to finance and trying to understand this.\n\n{question}\n\n{options}\n\n{instructions}";
const RETAIL: &str = "I trade with my own savings and need a clear answer.\n\n{question}\n\n{options}\n\n{instructions}";
const EXPERT: &str = "As a financial analyst, answer precisely.\n\n{question}\n\n{options}\n\n{instructions}";
const EXPERT_COT: &str = "As a financial analyst, reason step by step before answering.\n\n{question}\n\n{options}\n\n{instructions}";

/// Named prompt templates. Persona names double as artifact directory names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaSet {
    templates: BTreeMap<String, String>,
}

impl Default for PersonaSet {
    fn default() -> Self {
        Self::new(
            [
                ("beginner", BEGINNER),
                ("retail", RETAIL),
                ("expert", EXPERT),
                ("expert_cot", EXPERT_COT),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        )
    }
}

impl PersonaSet {
    pub fn new(templates: BTreeMap<String, String>) -> Self {
        Self { templates }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn render(
        &self,
        persona: &str,
        question: &str,
        options: Option<&OptionMap>,
        kind: &QuestionType,
    ) -> Option<String> {
        self.templates
            .get(persona)
            .map(|template| render(template, question, options, kind))
    }
}

pub fn instructions(kind: &QuestionType) -> &'static str {
    match kind {
        QuestionType::SingleChoice | QuestionType::MultiRoundSingleChoice => {
            "Choose exactly one option and put its letter in \\boxed{}, for example \\boxed{A}."
        }
        QuestionType::MultiChoice => {
            "Choose every correct option and put the letters in \\boxed{}, for example \\boxed{AC}."
        }
        QuestionType::TrueFalse => {
            "Answer true or false and put the verdict in \\boxed{}, for example \\boxed{True}."
        }
        _ => "Put your final answer in \\boxed{}.",
    }
}

/// Fills the template slots. Blank lines left by an empty options block are collapsed.
pub fn render(
    template: &str,
    question: &str,
    options: Option<&OptionMap>,
    kind: &QuestionType,
) -> String {
    let options_block = options
        .filter(|o| has_valid_options(Some(o)))
        .map(|o| format!("Options:\n{}", format_options(o)))
        .unwrap_or_default();

    let rendered = template
        .replace(OPTIONS_SLOT, &options_block)
        .replace(INSTRUCTIONS_SLOT, instructions(kind))
        .replace(QUESTION_SLOT, question);

    let mut out = String::with_capacity(rendered.len());
    let mut blank_run = 0;
    for line in rendered.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}
