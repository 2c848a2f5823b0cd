//! Post-processing: recover a findings list from the model's raw answer.
//!
//! ## Why is post-processing necessary?
//!
//! Even a well-prompted model occasionally wraps an otherwise valid answer in
//! something that is not JSON:
//!
//! - ` ```json ... ``` ` fences despite the prompt saying not to
//! - a sentence of prose before or after the array
//! - an object such as `{"findings": [...]}` instead of a bare array
//! - an array cut off mid-object because `max_tokens` was reached
//!
//! The rules below strip that wrapping deterministically. An answer from
//! which no array can be recovered at all is an error; individual malformed
//! items are skipped so one bad entry does not discard the whole review.
//!
//! ## Rule Order
//!
//! Invisible characters go first (a BOM defeats every other rule), then
//! fences, then the increasingly lossy extraction attempts.

use crate::error::LlmError;
use crate::model::{Finding, LocationRef, Severity};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

/// One finding as the model wrote it, before normalisation.
///
/// Field names follow the output contract of the system prompt; the aliases
/// cover the names models drift to when they ignore it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawFinding {
    #[serde(default, alias = "id", alias = "span_id", alias = "element", alias = "location")]
    pub element_id: Option<Value>,

    #[serde(
        default,
        deserialize_with = "lenient_string",
        alias = "quote",
        alias = "text",
        alias = "snippet"
    )]
    pub original_text: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_string",
        alias = "severity",
        alias = "level"
    )]
    pub issue_type: Option<String>,

    #[serde(default, deserialize_with = "lenient_string", alias = "type")]
    pub category: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_string",
        alias = "explanation",
        alias = "issue",
        alias = "problem"
    )]
    pub description: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_string",
        alias = "correction",
        alias = "fix",
        alias = "recommendation"
    )]
    pub suggestion: Option<String>,
}

/// Accept strings, numbers and lists where a string is expected.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| value_to_string(&v)))
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(value_to_string).collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        }
        other => Some(other.to_string()),
    }
}

/// Extract the raw findings from the model's answer.
///
/// Returns [`LlmError::InvalidResponse`] when no findings array can be
/// recovered. An empty array is a valid "no issues" answer.
pub fn parse_findings(content: &str) -> Result<Vec<RawFinding>, LlmError> {
    let s = remove_invisible_chars(content);
    let s = strip_code_fences(&s);

    let items = extract_items(&s).ok_or_else(|| LlmError::InvalidResponse {
        detail: format!(
            "no findings array in answer: {:?}",
            s.chars().take(200).collect::<String>()
        ),
    })?;

    let total = items.len();
    let findings: Vec<RawFinding> = items
        .into_iter()
        .enumerate()
        .filter_map(|(i, item)| {
            if !item.is_object() {
                warn!("Skipping finding {}: not a JSON object", i);
                return None;
            }
            match serde_json::from_value::<RawFinding>(item) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!("Skipping malformed finding {}: {}", i, e);
                    None
                }
            }
        })
        .collect();
    debug!("Recovered {}/{} findings", findings.len(), total);
    Ok(findings)
}

// ── Rule 1: Strip invisible characters ───────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|&c| !matches!(c, '\u{feff}' | '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{2060}'))
        .collect()
}

// ── Rule 2: Strip code fences ────────────────────────────────────────────────

static RE_OPEN_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^```[A-Za-z0-9_-]*[ \t]*\r?\n?").unwrap());

static RE_CLOSE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r?\n?```\s*$").unwrap());

/// Remove one pair of outer fences. An unterminated opening fence (answer
/// truncated before the closing one) is removed too.
fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    let Some(m) = RE_OPEN_FENCE.find(trimmed) else {
        return trimmed.to_string();
    };
    let body = &trimmed[m.end()..];
    RE_CLOSE_FENCE.replace(body, "").trim().to_string()
}

// ── Rule 3: Locate the findings array ────────────────────────────────────────

/// Keys under which models nest the array when they answer with an object.
const WRAPPER_KEYS: [&str; 4] = ["findings", "issues", "results", "errors"];

fn extract_items(s: &str) -> Option<Vec<Value>> {
    if let Ok(v) = serde_json::from_str::<Value>(s) {
        if let Some(items) = items_of(v) {
            return Some(items);
        }
    }

    let start = s.find('[')?;
    if let Some(end) = s.rfind(']') {
        if end > start {
            if let Ok(Value::Array(items)) = serde_json::from_str(&s[start..=end]) {
                return Some(items);
            }
        }
    }

    salvage_truncated(&s[start..])
}

fn items_of(v: Value) -> Option<Vec<Value>> {
    match v {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => {
            for key in WRAPPER_KEYS {
                if let Some(Value::Array(items)) = map.remove(key) {
                    return Some(items);
                }
            }
            // A lone finding instead of a one-element array.
            let looks_like_finding = ["description", "issue_type", "element_id", "original_text"]
                .iter()
                .any(|k| map.contains_key(*k));
            looks_like_finding.then(|| vec![Value::Object(map)])
        }
        _ => None,
    }
}

// ── Rule 4: Salvage a truncated array ────────────────────────────────────────

/// Close the array after the last complete object.
///
/// `s` starts at the opening `[`. Each `}` from the end backwards is tried as
/// the end of the last complete element, so a nested object cut in half does
/// not hide the complete findings before it.
fn salvage_truncated(s: &str) -> Option<Vec<Value>> {
    const MAX_ATTEMPTS: usize = 64;

    let candidates = s.rmatch_indices('}').take(MAX_ATTEMPTS);
    for (pos, _) in candidates {
        let attempt = format!("{}]", &s[..=pos]);
        if let Ok(Value::Array(items)) = serde_json::from_str(&attempt) {
            warn!(
                "Model answer was truncated; salvaged {} complete findings",
                items.len()
            );
            return Some(items);
        }
    }
    None
}

// ── Normalisation into findings ──────────────────────────────────────────────

static RE_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// Turn raw findings into [`Finding`]s for `document_id`.
///
/// `index` is the position in the model's answer, after malformed items
/// were dropped.
pub fn to_findings(raws: Vec<RawFinding>, document_id: Uuid) -> Vec<Finding> {
    raws.into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let mut element_ids = Vec::new();
            if let Some(v) = &raw.element_id {
                collect_ids(v, &mut element_ids);
            }
            // Kept verbatim: the mapper tries the snippet as written first.
            let quote = raw
                .original_text
                .filter(|q| !crate::mapper::bare_quote(q).is_empty());

            Finding {
                document_id,
                index,
                category: non_empty(raw.category).unwrap_or_else(|| "unspecified".to_string()),
                severity: raw
                    .issue_type
                    .as_deref()
                    .map_or(Severity::Medium, Severity::parse_lenient),
                explanation: non_empty(raw.description).unwrap_or_default(),
                suggestion: non_empty(raw.suggestion),
                location: LocationRef { element_ids, quote },
            }
        })
        .collect()
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn collect_ids(v: &Value, out: &mut Vec<u32>) {
    match v {
        Value::Number(n) => {
            if let Some(id) = n.as_u64().and_then(|n| u32::try_from(n).ok()) {
                push_unique(out, id);
            }
        }
        Value::String(s) => {
            for m in RE_DIGITS.find_iter(s) {
                if let Ok(id) = m.as_str().parse::<u32>() {
                    push_unique(out, id);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_ids(item, out);
            }
        }
        _ => {}
    }
}

fn push_unique(out: &mut Vec<u32>, id: u32) {
    if !out.contains(&id) {
        out.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE: &str = r#"[{"element_id": 1, "original_text": "2.3%", "issue_type": "Critical", "category": "calculation", "description": "RSD wrong", "suggestion": "Recalculate"}]"#;

    #[test]
    fn test_plain_array() {
        let f = parse_findings(ONE).unwrap();
        assert_eq!(f.len(), 1);
        assert_eq!(f[0].original_text.as_deref(), Some("2.3%"));
        assert_eq!(f[0].issue_type.as_deref(), Some("Critical"));
    }

    #[test]
    fn test_empty_array_is_valid() {
        assert!(parse_findings("[]").unwrap().is_empty());
        assert!(parse_findings("```json\n[]\n```").unwrap().is_empty());
    }

    #[test]
    fn test_strip_fences() {
        let f = parse_findings(&format!("```json\n{ONE}\n```")).unwrap();
        assert_eq!(f.len(), 1);
    }

    #[test]
    fn test_unterminated_fence() {
        assert_eq!(strip_code_fences("```json\n[1]"), "[1]");
    }

    #[test]
    fn test_prose_around_array() {
        let s = format!("Here are the issues I found:\n{ONE}\nLet me know if you need more.");
        assert_eq!(parse_findings(&s).unwrap().len(), 1);
    }

    #[test]
    fn test_wrapper_object() {
        let s = format!(r#"{{"findings": {ONE}}}"#);
        assert_eq!(parse_findings(&s).unwrap().len(), 1);
        let s = format!(r#"{{"issues": {ONE}}}"#);
        assert_eq!(parse_findings(&s).unwrap().len(), 1);
    }

    #[test]
    fn test_single_object() {
        let s = r#"{"element_id": 3, "description": "Date order wrong"}"#;
        let f = parse_findings(s).unwrap();
        assert_eq!(f.len(), 1);
        assert_eq!(f[0].description.as_deref(), Some("Date order wrong"));
    }

    #[test]
    fn test_truncated_array_is_salvaged() {
        let s = r#"[{"element_id": 1, "description": "a"}, {"element_id": 2, "description": "b", "detail": {"x": 1}}, {"element_id": 3, "descr"#;
        let f = parse_findings(s).unwrap();
        assert_eq!(f.len(), 2);
    }

    #[test]
    fn test_prose_only_is_error() {
        let err = parse_findings("The report looks fine to me.").unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }

    #[test]
    fn test_malformed_items_skipped() {
        let s = r#"[{"element_id": 1, "description": "ok"}, "just a string", 42, {"description": "also ok"}]"#;
        assert_eq!(parse_findings(s).unwrap().len(), 2);
    }

    #[test]
    fn test_bom_is_ignored() {
        assert_eq!(parse_findings(&format!("\u{feff}{ONE}")).unwrap().len(), 1);
    }

    #[test]
    fn test_aliases_and_lenient_strings() {
        let s = r#"[{"span_id": "5", "quote": 2.3, "severity": "high", "type": "numeric", "explanation": ["a", "b"], "fix": "c"}]"#;
        let f = parse_findings(s).unwrap();
        assert_eq!(f[0].original_text.as_deref(), Some("2.3"));
        assert_eq!(f[0].issue_type.as_deref(), Some("high"));
        assert_eq!(f[0].category.as_deref(), Some("numeric"));
        assert_eq!(f[0].description.as_deref(), Some("a; b"));
        assert_eq!(f[0].suggestion.as_deref(), Some("c"));
    }

    #[test]
    fn test_to_findings_normalises() {
        let doc = Uuid::new_v4();
        let raws = vec![
            RawFinding {
                element_id: Some(serde_json::json!("ID: 4, 7, 4")),
                original_text: Some("“RSD = 2.3%”".into()),
                issue_type: Some("Major".into()),
                description: Some("  wrong  ".into()),
                ..Default::default()
            },
            RawFinding {
                element_id: Some(serde_json::json!([2, "9"])),
                original_text: Some("  ''  ".into()),
                ..Default::default()
            },
        ];
        let f = to_findings(raws, doc);
        assert_eq!(f[0].location.element_ids, vec![4, 7]);
        assert_eq!(f[0].location.quote.as_deref(), Some("“RSD = 2.3%”"));
        assert_eq!(f[0].severity, Severity::Medium);
        assert_eq!(f[0].explanation, "wrong");
        assert_eq!(f[0].category, "unspecified");
        assert_eq!(f[1].index, 1);
        assert_eq!(f[1].location.element_ids, vec![2, 9]);
        assert_eq!(f[1].location.quote, None);
        assert_eq!(f[1].severity, Severity::Medium);
    }

    #[test]
    fn test_severity_mapping() {
        let doc = Uuid::nil();
        let raw = |label: &str| RawFinding {
            issue_type: Some(label.into()),
            ..Default::default()
        };
        let f = to_findings(vec![raw("Critical"), raw("Minor"), raw("严重")], doc);
        assert_eq!(f[0].severity, Severity::High);
        assert_eq!(f[1].severity, Severity::Low);
        assert_eq!(f[2].severity, Severity::High);
    }

    #[test]
    fn test_padded_quote_anchors_where_it_occurs_verbatim() {
        use crate::mapper::map_findings;
        use crate::model::{Span, SpanKind, SpanPosition};

        let spans: Vec<Span> = ["n = 5 replicates", "primer at the 5' end"]
            .iter()
            .enumerate()
            .map(|(i, t)| Span {
                id: i as u32,
                kind: SpanKind::Text,
                content: t.to_string(),
                position: SpanPosition::default(),
                image: None,
            })
            .collect();
        let raws = parse_findings(r#"[{"original_text": "5'", "description": "primer end"}]"#).unwrap();
        let out = map_findings(&spans, to_findings(raws, Uuid::nil()));
        let a = out.anchored[0].anchors[0];
        assert_eq!((a.span_id, a.start, a.end), (1, 14, 16));
    }
}
