//! Answer extraction: turns a raw model response into the text that gets judged.
//!
//! Stages run in order and stop at the first one that yields text:
//! boxed marker, embedded JSON `answer` field, trailing window, full text.

use lazy_static::lazy_static;
use regex::Regex;

const BOXED_OPEN: &str = "\\boxed{";

/// Token budget of the trailing-window fallback.
pub const TRAILING_WINDOW_TOKENS: usize = 100;

lazy_static! {
    static ref JSON_BLOCK: Regex =
        Regex::new(r"(?s)```json\s*(\{.*?\})\s*```|(\{.*\})").expect("static regex");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub text: String,
    /// The text came from an explicit answer marker.
    pub structured: bool,
    /// The trimmed response.
    pub original: String,
}

impl Extraction {
    /// What the judge should see: the marked answer, or the whole response otherwise.
    pub fn for_judge(&self) -> &str {
        if self.structured {
            &self.text
        } else {
            &self.original
        }
    }
}

pub fn extract_answer(response: &str) -> Extraction {
    let original = response.trim().to_string();

    if let Some(text) = last_boxed(&original) {
        return Extraction {
            text,
            structured: true,
            original,
        };
    }

    if let Some(answer) = json_answer_field(&original) {
        if let Some(text) = last_boxed(&answer) {
            return Extraction {
                text,
                structured: true,
                original,
            };
        }
        let trimmed = answer.trim();
        if !trimmed.is_empty() {
            return Extraction {
                text: trimmed.to_string(),
                structured: false,
                original,
            };
        }
    }

    let window = trailing_window(&original, TRAILING_WINDOW_TOKENS);
    if !window.trim().is_empty() {
        return Extraction {
            text: window,
            structured: false,
            original,
        };
    }

    Extraction {
        text: original.clone(),
        structured: false,
        original,
    }
}

/// Content of the last `\boxed{...}` with balanced braces and non-blank content.
pub fn last_boxed(text: &str) -> Option<String> {
    boxed_spans(text)
        .into_iter()
        .filter_map(|(_, inner)| {
            let content = text[inner].trim();
            (!content.is_empty()).then(|| content.to_string())
        })
        .last()
}

/// Byte ranges of every closed marker: (whole span, inner content).
fn boxed_spans(text: &str) -> Vec<(std::ops::Range<usize>, std::ops::Range<usize>)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut pos = 0;
    while let Some(offset) = text[pos..].find(BOXED_OPEN) {
        let start = pos + offset;
        let inner_start = start + BOXED_OPEN.len();
        let mut depth = 0usize;
        let mut close = None;
        for (i, b) in bytes.iter().enumerate().skip(inner_start) {
            match b {
                b'{' => depth += 1,
                b'}' if depth == 0 => {
                    close = Some(i);
                    break;
                }
                b'}' => depth -= 1,
                _ => {}
            }
        }
        match close {
            Some(end) => {
                spans.push((start..end + 1, inner_start..end));
                pos = end + 1;
            }
            // Unclosed: continue scanning inside it.
            None => pos = inner_start,
        }
    }
    spans
}

/// Removes every closed `\boxed{...}` span, leaving the surrounding prose.
pub fn strip_boxed(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (span, _) in boxed_spans(text) {
        if span.start >= last {
            out.push_str(&text[last..span.start]);
            last = span.end;
        }
    }
    out.push_str(&text[last..]);
    out.trim().to_string()
}

/// `answer` field of a fenced or bare JSON object embedded in the text.
fn json_answer_field(text: &str) -> Option<String> {
    let candidate = JSON_BLOCK
        .captures(text)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .and_then(|m| serde_json::from_str::<serde_json::Value>(m.as_str()).ok())
        .or_else(|| {
            let start = text.find('{')?;
            let end = text.rfind('}')?;
            (start < end)
                .then(|| serde_json::from_str::<serde_json::Value>(&text[start..=end]).ok())
                .flatten()
        })?;

    match candidate.get("answer")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Coarse token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        text.chars().count() / 4 + 1
    }
}

/// Trailing slice of `text` within roughly `max_tokens`, shrinking 10% per step.
pub fn trailing_window(text: &str, max_tokens: usize) -> String {
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    let mut start = chars.len().saturating_sub(max_tokens * 4);
    loop {
        let len = chars.len() - start;
        let window: String = chars[start..].iter().collect();
        if len == 0 || estimate_tokens(&window) <= max_tokens {
            return window;
        }
        start += (len / 10).max(1);
    }
}

/// Last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_marker_keeps_inner_braces() {
        let out = extract_answer(r"so \boxed{A\boxed{B}C}");
        assert_eq!(out.text, r"A\boxed{B}C");
        assert!(out.structured);
    }

    #[test]
    fn last_marker_wins() {
        let out = extract_answer(r"first \boxed{A} then \boxed{ D }");
        assert_eq!(out.text, "D");
        assert!(out.structured);
        assert_eq!(out.for_judge(), "D");
    }

    #[test]
    fn empty_marker_is_ignored() {
        let out = extract_answer(r"\boxed{B} and later \boxed{  }");
        assert_eq!(out.text, "B");
    }

    #[test]
    fn unclosed_marker_still_finds_inner_match() {
        assert_eq!(last_boxed(r"\boxed{oops \boxed{C}").as_deref(), Some("C"));
        assert_eq!(last_boxed(r"\boxed{never closed"), None);
    }

    #[test]
    fn bare_json_answer_is_unstructured() {
        let out = extract_answer(r#"Result: {"answer": "42"}"#);
        assert_eq!(out.text, "42");
        assert!(!out.structured);
        assert_eq!(out.for_judge(), out.original);
    }

    #[test]
    fn fenced_json_with_marker_is_structured() {
        let response = "```json\n{\"answer\": \"\\\\boxed{B}\"}\n```";
        let out = extract_answer(response);
        assert_eq!(out.text, "B");
        assert!(out.structured);
    }

    #[test]
    fn long_text_falls_back_to_trailing_window() {
        let response = "x".repeat(2000) + " final answer is 7";
        let out = extract_answer(&response);
        assert!(!out.structured);
        assert!(out.text.ends_with("final answer is 7"));
        assert!(estimate_tokens(&out.text) <= TRAILING_WINDOW_TOKENS);
        assert_eq!(out.original.len(), response.len());
    }

    #[test]
    fn short_text_is_returned_whole() {
        let out = extract_answer("  plain answer  ");
        assert_eq!(out.text, "plain answer");
        assert_eq!(out.original, "plain answer");
    }

    #[test]
    fn trailing_window_handles_multibyte_text() {
        let text = "答".repeat(1000);
        let window = trailing_window(&text, 100);
        assert!(estimate_tokens(&window) <= 100);
        assert!(window.chars().all(|c| c == '答'));
    }

    #[test]
    fn strip_boxed_keeps_prose() {
        assert_eq!(strip_boxed(r"Because X. \boxed{A\boxed{B}} Done."), "Because X.  Done.");
    }

    #[test]
    fn tail_chars_counts_characters() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }
}
