//! The progress-file contract.
//!
//! `progress.json` is the only channel by which a worker signals liveness
//! and escalation. Recognized top-level fields: `run_id`, `heartbeat`
//! (ISO-8601), `timestamp`, `task_id`, `step`, `human_blocking_issues`,
//! `human_next_steps`. Everything is parsed tolerantly; a worker that
//! writes garbage simply reports no heartbeat.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;

use foreman_store::models::HumanBlockingIssue;

/// Escalations are capped so a runaway worker cannot flood task metadata.
const MAX_BLOCKING_ISSUES: usize = 20;

fn parse_iso(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Read the heartbeat timestamp from a progress file.
///
/// When `expected_run_id` is set and the file carries a different `run_id`,
/// the heartbeat is ignored (it belongs to another run). Falls back to the
/// `timestamp` field, then to the file's mtime.
pub fn read_heartbeat(path: &Path, expected_run_id: Option<&str>) -> Option<DateTime<Utc>> {
    if !path.exists() {
        return None;
    }
    let text = std::fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

    if let Some(expected) = expected_run_id {
        if let Some(run_id) = value.get("run_id").and_then(Value::as_str) {
            if run_id != expected {
                return None;
            }
        }
    }

    if let Some(heartbeat) =
        parse_iso(value.get("heartbeat")).or_else(|| parse_iso(value.get("timestamp")))
    {
        return Some(heartbeat);
    }

    let mtime = path.metadata().ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(mtime))
}

/// Extract and normalize `human_blocking_issues` from a progress file.
///
/// Free-text entries are promoted to `{summary}`; entries without a usable
/// summary take the first line of their details; at most
/// [`MAX_BLOCKING_ISSUES`] survive.
pub fn read_human_blocking_issues(path: &Path) -> Vec<HumanBlockingIssue> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let Ok(value) = serde_json::from_str::<Value>(&text) else {
        return Vec::new();
    };
    let Some(items) = value.get("human_blocking_issues").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut normalized = Vec::new();
    for item in items {
        match item {
            Value::String(s) => {
                let summary = s.trim();
                if !summary.is_empty() {
                    normalized.push(HumanBlockingIssue::from_summary(summary));
                }
            }
            Value::Object(map) => {
                let text_of = |key: &str| -> Option<String> {
                    map.get(key)
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                };
                let details = text_of("details").or_else(|| text_of("rationale"));
                let mut summary = text_of("summary").or_else(|| text_of("issue"));
                if summary.is_none() {
                    summary = details.as_deref().and_then(|d| {
                        let first = d.lines().next().unwrap_or("").trim();
                        if first.is_empty() {
                            None
                        } else {
                            Some(first.chars().take(200).collect())
                        }
                    });
                }
                let Some(summary) = summary else { continue };
                normalized.push(HumanBlockingIssue {
                    summary,
                    details,
                    category: text_of("category"),
                    action: text_of("action"),
                    blocking_on: text_of("blocking_on"),
                    severity: text_of("severity"),
                });
            }
            _ => {}
        }
        if normalized.len() >= MAX_BLOCKING_ISSUES {
            break;
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn write(dir: &TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("progress.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn heartbeat_parsed_from_field() {
        let dir = TempDir::new().unwrap();
        let ts = Utc::now() - Duration::seconds(5);
        let path = write(
            &dir,
            &format!("{{\"run_id\": \"run-1\", \"heartbeat\": \"{}\"}}", ts.to_rfc3339()),
        );

        let heartbeat = read_heartbeat(&path, Some("run-1")).expect("heartbeat");
        assert!((heartbeat - ts).num_seconds().abs() < 2);
    }

    #[test]
    fn heartbeat_falls_back_to_timestamp_field() {
        let dir = TempDir::new().unwrap();
        let ts = Utc::now();
        let path = write(&dir, &format!("{{\"timestamp\": \"{}\"}}", ts.to_rfc3339()));
        assert!(read_heartbeat(&path, None).is_some());
    }

    #[test]
    fn mismatched_run_id_is_ignored() {
        let dir = TempDir::new().unwrap();
        let ts = Utc::now();
        let path = write(
            &dir,
            &format!("{{\"run_id\": \"run-other\", \"heartbeat\": \"{}\"}}", ts.to_rfc3339()),
        );
        assert!(read_heartbeat(&path, Some("run-1")).is_none());
    }

    #[test]
    fn malformed_json_falls_back_to_mtime() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "not json at all");
        // mtime of a just-written file is "now".
        let heartbeat = read_heartbeat(&path, None).expect("mtime fallback");
        assert!((Utc::now() - heartbeat).num_seconds().abs() < 10);
    }

    #[test]
    fn missing_file_has_no_heartbeat() {
        let dir = TempDir::new().unwrap();
        assert!(read_heartbeat(&dir.path().join("absent.json"), None).is_none());
    }

    #[test]
    fn issues_promote_strings_to_summaries() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"{"human_blocking_issues": ["need an API key", "  ", {"summary": "spec is contradictory", "details": "section 3 vs 5", "severity": "high"}]}"#,
        );
        let issues = read_human_blocking_issues(&path);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].summary, "need an API key");
        assert_eq!(issues[1].summary, "spec is contradictory");
        assert_eq!(issues[1].details.as_deref(), Some("section 3 vs 5"));
        assert_eq!(issues[1].severity.as_deref(), Some("high"));
    }

    #[test]
    fn issues_derive_summary_from_details() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"{"human_blocking_issues": [{"details": "first line matters\nsecond line"}]}"#,
        );
        let issues = read_human_blocking_issues(&path);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].summary, "first line matters");
    }

    #[test]
    fn issues_are_capped_at_twenty() {
        let dir = TempDir::new().unwrap();
        let entries: Vec<String> = (0..30).map(|i| format!("\"issue {i}\"")).collect();
        let path = write(
            &dir,
            &format!("{{\"human_blocking_issues\": [{}]}}", entries.join(",")),
        );
        assert_eq!(read_human_blocking_issues(&path).len(), 20);
    }

    #[test]
    fn entries_without_summary_are_dropped() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"{"human_blocking_issues": [{"category": "access"}, 42, null]}"#,
        );
        assert!(read_human_blocking_issues(&path).is_empty());
    }
}
