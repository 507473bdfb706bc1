use crate::report::progress::{ProgressEvent, ProgressSink};
use crate::stats::Tally;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Minimum interval between two progress lines of the same combination.
const PROGRESS_MIN_INTERVAL_MS: u64 = 500;

#[must_use]
pub fn format_progress_line(ev: &ProgressEvent) -> String {
    format!("[{}] {}/{} tasks done", ev.combo, ev.done, ev.total)
}

/// Emit every this many tasks (roughly 10% steps on large sets).
pub(crate) fn progress_step(total: usize) -> usize {
    if total <= 10 {
        1
    } else {
        std::cmp::max(1, total / 10)
    }
}

/// Throttled stderr sink, tracked per combination. Always emits the final event.
pub fn default_progress_sink() -> ProgressSink {
    let last_emit: Arc<Mutex<HashMap<String, Instant>>> = Arc::new(Mutex::new(HashMap::new()));
    Arc::new(move |ev: ProgressEvent| {
        if ev.total == 0 {
            return;
        }
        let now = Instant::now();
        let emit = match last_emit.lock() {
            Ok(mut seen) => {
                let key = ev.combo.to_string();
                let interval_ok = seen.get(&key).map_or(true, |t| {
                    now.saturating_duration_since(*t)
                        >= Duration::from_millis(PROGRESS_MIN_INTERVAL_MS)
                });
                let step_ok = ev.done % progress_step(ev.total) == 0 || ev.done == 1;
                let ok = ev.done == ev.total || (step_ok && interval_ok);
                if ok {
                    seen.insert(key, now);
                }
                ok
            }
            Err(_) => ev.done == ev.total,
        };
        if emit {
            eprintln!("{}", format_progress_line(&ev));
        }
    })
}

#[must_use]
pub fn format_accuracy_line(artifact: &Path, tally: &Tally) -> String {
    format!(
        "{}: {}/{} correct (accuracy {:.4})",
        artifact.display(),
        tally.correct_count,
        tally.total_count,
        tally.accuracy
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Combo;

    #[test]
    fn progress_line_names_the_combo() {
        let ev = ProgressEvent {
            combo: Combo::new("m1", "expert"),
            done: 3,
            total: 7,
        };
        assert_eq!(format_progress_line(&ev), "[m1/expert] 3/7 tasks done");
    }

    #[test]
    fn step_scales_with_total() {
        assert_eq!(progress_step(5), 1);
        assert_eq!(progress_step(250), 25);
    }
}
