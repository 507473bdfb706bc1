//! The two artifact encodings.
//!
//! `json`: one pretty-printed document `{"statistics": ..., "results": [...]}`.
//! `jsonl`: a `{"statistics": ...}` header line followed by one record per line.

use crate::errors::StoreError;
use crate::stats::Statistics;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Jsonl,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Jsonl => "jsonl",
        }
    }

    /// `.jsonl` files are line-oriented; everything else is read as one document.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("jsonl") => OutputFormat::Jsonl,
            _ => OutputFormat::Json,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "jsonl" => Ok(OutputFormat::Jsonl),
            other => Err(format!("unknown output format: {other} (expected json or jsonl)")),
        }
    }
}

/// Decoded artifact: the stored header, if readable, and the raw records in storage order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub statistics: Option<Statistics>,
    pub records: Vec<Value>,
}

pub fn decode(format: OutputFormat, path: &Path, text: &str) -> Result<Decoded, StoreError> {
    match format {
        OutputFormat::Json => decode_document(path, text),
        OutputFormat::Jsonl => decode_lines(path, text),
    }
}

fn decode_document(path: &Path, text: &str) -> Result<Decoded, StoreError> {
    if text.trim().is_empty() {
        return Ok(Decoded::default());
    }
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let doc: Value = serde_json::from_str(text).map_err(|e| corrupt(e.to_string()))?;
    match doc {
        Value::Object(mut map) => {
            let records = match map.remove("results") {
                Some(Value::Array(items)) => items,
                Some(Value::Null) | None => Vec::new(),
                Some(_) => return Err(corrupt("`results` is not an array".into())),
            };
            let statistics = map
                .remove("statistics")
                .and_then(|v| serde_json::from_value(v).ok());
            Ok(Decoded {
                statistics,
                records,
            })
        }
        // Bare arrays of records are accepted on read.
        Value::Array(records) => Ok(Decoded {
            statistics: None,
            records,
        }),
        _ => Err(corrupt("expected an object or an array".into())),
    }
}

fn decode_lines(path: &Path, text: &str) -> Result<Decoded, StoreError> {
    let mut decoded = Decoded::default();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("line {}: {}", idx + 1, e),
        })?;
        if value.get("question_id").is_some() {
            decoded.records.push(value);
        } else if let Some(stats) = value.get("statistics") {
            decoded.statistics = serde_json::from_value(stats.clone()).ok();
        } else {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("line {}: neither a record nor a statistics header", idx + 1),
            });
        }
    }
    Ok(decoded)
}

pub fn encode(
    format: OutputFormat,
    statistics: &Statistics,
    records: &[Value],
) -> Result<String, StoreError> {
    match format {
        OutputFormat::Json => {
            let doc = json!({ "statistics": statistics, "results": records });
            Ok(serde_json::to_string_pretty(&doc)?)
        }
        OutputFormat::Jsonl => {
            let mut out = serde_json::to_string(&json!({ "statistics": statistics }))?;
            out.push('\n');
            for record in records {
                out.push_str(&serde_json::to_string(record)?);
                out.push('\n');
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<Value> {
        vec![
            json!({"question_id": "q1", "model": {"model_name": "m", "answer": "A"}}),
            json!({"question_id": "q2", "model": {"model_name": "m", "answer": null}}),
        ]
    }

    #[test]
    fn jsonl_header_is_first_line_and_skipped_on_read() {
        let text = encode(OutputFormat::Jsonl, &Statistics::default(), &records()).unwrap();
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("{\"statistics\""));

        let back = decode(OutputFormat::Jsonl, Path::new("a.jsonl"), &text).unwrap();
        assert_eq!(back.records, records());
        assert!(back.statistics.is_some());
    }

    #[test]
    fn json_document_keeps_unknown_record_fields() {
        let mut recs = records();
        recs[0]["legacy"] = json!({"nested": true});
        let text = encode(OutputFormat::Json, &Statistics::default(), &recs).unwrap();
        let back = decode(OutputFormat::Json, Path::new("a.json"), &text).unwrap();
        assert_eq!(back.records[0]["legacy"]["nested"], json!(true));
    }

    #[test]
    fn broken_line_is_corrupt_not_skipped() {
        let text = "{\"statistics\": {}}\n{\"question_id\": \"q1\"}\n{\"question_id\": \"q2\", \n";
        assert!(matches!(
            decode(OutputFormat::Jsonl, Path::new("a.jsonl"), text),
            Err(StoreError::Corrupt { ref reason, .. }) if reason.starts_with("line 3")
        ));
    }

    #[test]
    fn empty_document_has_no_records() {
        let back = decode(OutputFormat::Json, Path::new("a.json"), "  \n").unwrap();
        assert!(back.records.is_empty());
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(OutputFormat::from_path(Path::new("x/out.JSONL")), OutputFormat::Jsonl);
        assert_eq!(OutputFormat::from_path(Path::new("x/out.json")), OutputFormat::Json);
        assert_eq!("jsonl".parse::<OutputFormat>().unwrap(), OutputFormat::Jsonl);
    }
}
