//! Tabular bug export (`bugs.csv`).

use std::path::Path;

use uiqa_core::qa::BugRecord;

pub const CSV_FILENAME: &str = "bugs.csv";

pub const CSV_COLUMNS: [&str; 19] = [
    "bug_id",
    "timestamp",
    "test_type",
    "workflow",
    "severity",
    "title",
    "expected",
    "actual",
    "repro_steps",
    "page_url",
    "console_errors",
    "network_failures",
    "trace_path",
    "screenshot_path",
    "video_path",
    "suspected_root_cause",
    "code_location_guess",
    "confidence",
    "github_issue_url",
];

/// RFC 4180 field quoting.
fn field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn row(bug: &BugRecord) -> [String; 19] {
    [
        bug.bug_id.clone(),
        bug.created_at.to_rfc3339(),
        bug.suite.to_string(),
        bug.workflow.clone(),
        bug.severity.to_string(),
        bug.title.clone(),
        bug.expected.clone(),
        bug.actual.clone(),
        bug.repro_steps.clone(),
        String::new(),
        String::new(),
        String::new(),
        bug.trace_path.clone(),
        bug.screenshot_path.clone(),
        bug.video_path.clone(),
        bug.root_cause_guess.clone(),
        bug.code_location_guess.clone(),
        bug.confidence.to_string(),
        bug.issue_url.clone().unwrap_or_default(),
    ]
}

/// Render the export; header plus one CRLF-terminated record per bug.
pub fn render_bugs_csv(bugs: &[BugRecord]) -> String {
    let mut out = CSV_COLUMNS.join(",");
    out.push_str("\r\n");
    for bug in bugs {
        let fields: Vec<String> = row(bug).iter().map(|v| field(v.as_str())).collect();
        out.push_str(&fields.join(","));
        out.push_str("\r\n");
    }
    out
}

/// Write the export atomically to `path`.
pub fn write_bugs_csv(path: &Path, bugs: &[BugRecord]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("csv.tmp");
    std::fs::write(&tmp, render_bugs_csv(bugs))?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use uiqa_core::qa::{RawBug, SuiteKind};

    #[test]
    fn quoting_follows_rfc4180() {
        assert_eq!(field("plain"), "plain");
        assert_eq!(field("a,b"), "\"a,b\"");
        assert_eq!(field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(field("line1\nline2"), "\"line1\nline2\"");
    }

    #[test]
    fn header_only_for_no_bugs() {
        let csv = render_bugs_csv(&[]);
        assert_eq!(csv.lines().count(), 1);
        assert!(csv.starts_with("bug_id,timestamp,test_type,"));
        assert!(csv.trim_end().ends_with("confidence,github_issue_url"));
    }

    #[test]
    fn multi_line_fields_stay_in_one_record() {
        let bug = BugRecord::from_raw(
            RawBug {
                title: "Cart, total wrong".to_string(),
                repro_steps: vec!["open cart".to_string(), "add item".to_string()],
                ..RawBug::default()
            },
            "run-1",
            SuiteKind::Regression,
            Utc::now(),
        );
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("art").join(CSV_FILENAME);
        write_bugs_csv(&path, &[bug.clone()]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let records: Vec<_> = text.split("\r\n").filter(|r| !r.is_empty()).collect();
        assert_eq!(records.len(), 2);
        assert!(records[1].starts_with(&bug.bug_id));
        assert!(records[1].contains("\"Cart, total wrong\""));
        assert!(records[1].contains("\"open cart\nadd item\""));
        assert!(records[1].contains(",regression,"));
    }
}
