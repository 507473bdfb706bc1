//! Where artifacts live: `{output_dir}/{persona}/{model}/{file_name}`.

use super::codec::OutputFormat;
use crate::model::Combo;
use chrono::{DateTime, TimeZone};
use std::path::{Path, PathBuf};

/// Path segments may not contain separators; model ids such as `org/model` are flattened.
fn segment(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

pub fn artifact_dir(output_dir: &Path, combo: &Combo) -> PathBuf {
    output_dir
        .join(segment(&combo.persona))
        .join(segment(&combo.model))
}

/// `eval_{input_stem}_{limit|all}_{YYYYmmdd_HHMMSS}.{ext}`
pub fn generated_file_name<Tz: TimeZone>(
    input: &Path,
    limit: Option<usize>,
    format: OutputFormat,
    now: &DateTime<Tz>,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("questions");
    let count = limit.map_or_else(|| "all".to_string(), |n| n.to_string());
    format!(
        "eval_{}_{}_{}.{}",
        stem,
        count,
        now.format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

/// First of `path`, `stem_v2.ext`, `stem_v3.ext`, ... that does not exist yet.
pub fn next_free_version(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut version = 2u32;
    loop {
        let candidate = path.with_file_name(format!("{stem}_v{version}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn model_ids_are_flattened_into_one_segment() {
        let dir = artifact_dir(Path::new("outputs"), &Combo::new("org/model:v1", "expert"));
        assert_eq!(dir, PathBuf::from("outputs/expert/org_model_v1"));
    }

    #[test]
    fn generated_name_encodes_input_limit_and_time() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            generated_file_name(Path::new("data/bench.jsonl"), Some(50), OutputFormat::Jsonl, &now),
            "eval_bench_50_20240309_140507.jsonl"
        );
        assert_eq!(
            generated_file_name(Path::new("bench.json"), None, OutputFormat::Json, &now),
            "eval_bench_all_20240309_140507.json"
        );
    }

    #[test]
    fn existing_files_get_versioned_names() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("out.json");
        assert_eq!(next_free_version(&base), base);

        std::fs::write(&base, "{}").unwrap();
        assert_eq!(next_free_version(&base), dir.path().join("out_v2.json"));
        std::fs::write(dir.path().join("out_v2.json"), "{}").unwrap();
        assert_eq!(next_free_version(&base), dir.path().join("out_v3.json"));
    }
}
