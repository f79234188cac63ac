//! JSON extraction from free-form collaborator output.
//!
//! Ordered cascade, first success wins:
//! 1. direct parse of the whole response
//! 2. first markdown code fence (```json ... ```)
//! 3. first balanced `{...}` / `[...]` region that parses
//!
//! Total failure names every strategy that was attempted.

use std::sync::LazyLock;

use regex_lite::Regex;
use serde_json::Value;

#[allow(clippy::expect_used)]
static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?:json)?\s*\n?([\s\S]*?)\n?```").expect("valid fence regex")
});

/// Extraction method used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Direct,
    Fenced,
    Balanced,
}

impl ParseStrategy {
    pub const CHAIN: [ParseStrategy; 3] = [
        ParseStrategy::Direct,
        ParseStrategy::Fenced,
        ParseStrategy::Balanced,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ParseStrategy::Direct => "direct",
            ParseStrategy::Fenced => "fenced-block",
            ParseStrategy::Balanced => "balanced-braces",
        }
    }

    fn attempt(self, raw: &str) -> Result<Value, String> {
        match self {
            ParseStrategy::Direct => serde_json::from_str(raw.trim()).map_err(|e| e.to_string()),
            ParseStrategy::Fenced => {
                let captures = FENCE_RE
                    .captures(raw)
                    .ok_or_else(|| "no code fence".to_string())?;
                let body = captures.get(1).map_or("", |m| m.as_str());
                serde_json::from_str(body.trim()).map_err(|e| e.to_string())
            }
            ParseStrategy::Balanced => first_balanced_value(raw),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Empty response for {operation}")]
    Empty { operation: String },

    #[error(
        "Could not parse JSON for {operation} (tried {}). Raw: {excerpt}",
        describe_attempts(.attempts)
    )]
    Exhausted {
        operation: String,
        attempts: Vec<(ParseStrategy, String)>,
        excerpt: String,
    },
}

fn describe_attempts(attempts: &[(ParseStrategy, String)]) -> String {
    attempts
        .iter()
        .map(|(strategy, reason)| format!("{}: {reason}", strategy.name()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parse a collaborator response into JSON, trying each strategy in order.
pub fn parse_json_response(raw: &str, operation: &str) -> Result<(Value, ParseStrategy), ParseError> {
    tracing::debug!(operation, len = raw.len(), "parsing collaborator response");
    if raw.trim().is_empty() {
        return Err(ParseError::Empty {
            operation: operation.to_string(),
        });
    }

    let mut attempts = Vec::new();
    for strategy in ParseStrategy::CHAIN {
        match strategy.attempt(raw) {
            Ok(value) => {
                if !attempts.is_empty() {
                    tracing::debug!(operation, strategy = strategy.name(), "fallback parse succeeded");
                }
                return Ok((value, strategy));
            }
            Err(reason) => attempts.push((strategy, reason)),
        }
    }

    Err(ParseError::Exhausted {
        operation: operation.to_string(),
        attempts,
        excerpt: raw.chars().take(500).collect(),
    })
}

/// First balanced `{...}` / `[...]` region that parses as JSON.
fn first_balanced_value(raw: &str) -> Result<Value, String> {
    let mut last_error = "no JSON object or array".to_string();
    for (start, end) in balanced_regions(raw) {
        match serde_json::from_str(&raw[start..end]) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(last_error)
}

struct OpenBracket {
    start: usize,
    close: char,
    /// Closed regions directly inside this bracket.
    inner: Vec<(usize, usize)>,
}

/// Byte ranges of the outermost balanced regions, ordered by start.
///
/// Single pass over a bracket stack. A closed region is kept when nothing
/// encloses it or its enclosing bracket never closes, so the ranges are
/// disjoint. Brackets inside string literals are ignored, and so is a
/// closer that does not match the innermost opener.
fn balanced_regions(raw: &str) -> Vec<(usize, usize)> {
    let mut stack: Vec<OpenBracket> = Vec::new();
    let mut regions = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in raw.char_indices() {
        if in_string {
            if escape_next {
                escape_next = false;
            } else if ch == '\\' {
                escape_next = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' if !stack.is_empty() => in_string = true,
            '{' | '[' => stack.push(OpenBracket {
                start: i,
                close: if ch == '{' { '}' } else { ']' },
                inner: Vec::new(),
            }),
            '}' | ']' if stack.last().is_some_and(|open| open.close == ch) => {
                if let Some(open) = stack.pop() {
                    let region = (open.start, i + ch.len_utf8());
                    match stack.last_mut() {
                        Some(parent) => parent.inner.push(region),
                        None => regions.push(region),
                    }
                }
            }
            _ => {}
        }
    }

    // Brackets left open release whatever closed inside them.
    for open in stack {
        regions.extend(open.inner);
    }
    regions.sort_unstable();
    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn clean_json_uses_direct_parse() {
        let (value, strategy) = parse_json_response(r#"{"bugs": []}"#, "triage").unwrap();
        assert_eq!(value, json!({"bugs": []}));
        assert_eq!(strategy, ParseStrategy::Direct);
    }

    #[test]
    fn fenced_block_is_extracted() {
        let raw = "Here is the analysis:\n```json\n{\"start\": {\"command\": \"npm run dev\"}}\n```\nDone.";
        let (value, strategy) = parse_json_response(raw, "analyze_repo").unwrap();
        assert_eq!(value["start"]["command"], "npm run dev");
        assert_eq!(strategy, ParseStrategy::Fenced);
    }

    #[test]
    fn prose_wrapped_object_uses_balanced_scan() {
        let raw = r#"Sure! The result is {"created": {"files": ["a.spec.ts", "b}.ts"]}} hope it helps {"#;
        let (value, strategy) = parse_json_response(raw, "generate_tests").unwrap();
        assert_eq!(value, json!({"created": {"files": ["a.spec.ts", "b}.ts"]}}));
        assert_eq!(strategy, ParseStrategy::Balanced);
    }

    #[test]
    fn balanced_scan_skips_unparsable_candidates() {
        let raw = r#"see {not json} then [1, 2, {"x": "\"]"}]"#;
        let (value, _) = parse_json_response(raw, "triage").unwrap();
        assert_eq!(value, json!([1, 2, {"x": "\"]"}]));
    }

    #[test]
    fn region_inside_an_unclosed_bracket_is_found() {
        let raw = r#"Notes [draft, see {"start": {"command": "npm start"}} and more"#;
        let (value, strategy) = parse_json_response(raw, "analyze_repo").unwrap();
        assert_eq!(value, json!({"start": {"command": "npm start"}}));
        assert_eq!(strategy, ParseStrategy::Balanced);
    }

    #[test]
    fn many_unclosed_brackets_do_not_rescan() {
        let raw = format!("{}{{\"ok\": true}}", "{ [".repeat(50_000));
        let started = std::time::Instant::now();
        let (value, _) = parse_json_response(&raw, "triage").unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[test]
    fn outermost_regions_are_disjoint_and_ordered() {
        let raw = r#"x {"a": [1, {"b": 2}]} y [3] z {"#;
        assert_eq!(balanced_regions(raw), vec![(2, 22), (25, 28)]);
    }

    #[test]
    fn empty_response_is_an_error() {
        assert!(matches!(
            parse_json_response("  \n", "triage"),
            Err(ParseError::Empty { .. })
        ));
    }

    #[test]
    fn exhausted_error_names_every_strategy() {
        let err = parse_json_response("no json here at all", "analyze_repo").unwrap_err();
        let message = err.to_string();
        for strategy in ParseStrategy::CHAIN {
            assert!(message.contains(strategy.name()), "{message}");
        }
        assert!(message.contains("analyze_repo"));
    }
}
