//! Run-level failure summary.

use crate::errors::TaskFailure;
use serde::Serialize;

/// Failures collected across every task of a run. A failure never aborts the run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FailureSummary {
    failures: Vec<TaskFailure>,
}

impl FailureSummary {
    pub fn push(&mut self, failure: TaskFailure) {
        self.failures.push(failure);
    }

    pub fn extend(&mut self, failures: impl IntoIterator<Item = TaskFailure>) {
        self.failures.extend(failures);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures sorted by (model, persona, question id) for stable output.
    pub fn sorted(&self) -> Vec<&TaskFailure> {
        let mut out: Vec<&TaskFailure> = self.failures.iter().collect();
        out.sort_by(|a, b| {
            (&a.model, &a.persona, &a.question_id).cmp(&(&b.model, &b.persona, &b.question_id))
        });
        out
    }

    /// Human-readable block; empty when nothing failed.
    pub fn render(&self) -> String {
        if self.failures.is_empty() {
            return String::new();
        }
        let mut out = format!("{} task(s) failed:\n", self.failures.len());
        for f in self.sorted() {
            out.push_str("  ");
            out.push_str(&f.to_string());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(qid: &str, model: &str) -> TaskFailure {
        TaskFailure {
            question_id: qid.into(),
            model: model.into(),
            persona: "expert".into(),
            reason: "judge unavailable".into(),
        }
    }

    #[test]
    fn render_is_sorted_and_counted() {
        let mut summary = FailureSummary::default();
        summary.push(failure("q2", "m2"));
        summary.push(failure("q1", "m1"));
        summary.push(failure("q3", "m1"));

        let text = summary.render();
        assert!(text.starts_with("3 task(s) failed:"));
        let q1 = text.find("question_id: q1").unwrap();
        let q2 = text.find("question_id: q2").unwrap();
        assert!(q1 < q2);
        assert!(FailureSummary::default().render().is_empty());
    }
}
