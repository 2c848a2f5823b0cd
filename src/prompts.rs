//! Prompts for LLM-based CRO report review.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — changing what the model is asked to check
//!    or how it must answer requires editing exactly one place.
//!
//! 2. **Testability** — unit tests can inspect the rendered prompt and the
//!    per-span markers without calling a real model.
//!
//! Callers can override the whole system prompt via
//! [`crate::config::ReviewConfig::system_prompt`] or only the rule list via
//! [`crate::config::ReviewConfig::review_rules`].

use crate::model::{Span, SpanKind};

/// Review rules used when no rules file is configured.
pub const DEFAULT_REVIEW_RULES: &str = r#"Review the supplied clinical / laboratory report in depth and find data contradictions and logic errors:

1. NUMERIC CONSISTENCY
   - Values repeated in text, tables and conclusions must agree
   - Derived values (means, RSD, recovery, ratios) must match their inputs
   - Units must be consistent and plausible for the analyte

2. ACCEPTANCE CRITERIA
   - Every reported result must be compared to its stated criterion
   - A result outside its criterion must not be reported as "pass"

3. TRACEABILITY
   - Sample ids, batch numbers, dates and instrument ids must be consistent
   - Dates must be in a plausible order (preparation before analysis, etc.)

4. COMPLETENESS
   - Referenced tables, figures and appendices must exist
   - Conclusions must be supported by the presented data"#;

/// Default system prompt. `{rules}` and `{language}` are substituted by
/// [`system_prompt`].
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert reviewer of CRO (Contract Research Organization) reports.
Review the report provided by the user according to these rules:

{rules}

OUTPUT REQUIREMENTS
Answer with a strict JSON array of objects. Every object must contain:
- "element_id": the number n of the [ID: n] marker of the element where the issue is.
- "original_text": the exact text snippet the issue is about, copied verbatim from that element. Never longer than 50 characters; never paste whole tables.
- "issue_type": one of "Critical", "Major" or "Minor".
- "category": a short issue category, e.g. "data inconsistency", "calculation", "traceability".
- "description": a detailed description of the issue in {language}.
- "suggestion": how to fix the issue, in {language}.

NOTES
- Ignore purely cosmetic formatting issues.
- Output ONLY the JSON array. Do NOT wrap it in ```json fences and do NOT add commentary.
- If there are no issues, output []."#;

/// Render the system prompt for the given rules and response language.
pub fn system_prompt(rules: &str, language: &str) -> String {
    DEFAULT_SYSTEM_PROMPT
        .replace("{rules}", rules.trim())
        .replace("{language}", language)
}

/// Text that introduces one span in the user message.
///
/// Every span is prefixed with `[ID: n]` so the model can point back at it;
/// table cells also carry their coordinates so the model can tell rows and
/// columns apart.
pub fn render_span(span: &Span) -> String {
    let prefix = format!("[ID: {}]", span.id);
    match span.kind {
        SpanKind::Text => format!("{prefix} {}", span.content),
        SpanKind::TableCell => {
            let p = &span.position;
            let coords = match (&p.sheet, &p.cell) {
                (Some(sheet), Some(cell)) => format!("sheet {sheet}, cell {cell}"),
                _ => format!(
                    "table {}, row {}, col {}",
                    p.table.map_or(0, |t| t + 1),
                    p.row.map_or(0, |r| r + 1),
                    p.col.map_or(0, |c| c + 1)
                ),
            };
            format!("{prefix} Table cell ({coords}):\n{}", span.content)
        }
        SpanKind::Image => format!("{prefix} Image:"),
    }
}

/// Placeholder for an image span that is not attached to the request.
pub fn omitted_image_note(span: &Span) -> String {
    format!("[ID: {}] Image (not attached)", span.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SpanPosition;

    fn span(kind: SpanKind, content: &str, position: SpanPosition) -> Span {
        Span {
            id: 4,
            kind,
            content: content.into(),
            position,
            image: None,
        }
    }

    #[test]
    fn system_prompt_substitutes_placeholders() {
        let p = system_prompt("  Check RSD.  ", "Chinese");
        assert!(p.contains("Check RSD."));
        assert!(p.contains("description of the issue in Chinese"));
        assert!(!p.contains("{rules}"));
        assert!(!p.contains("{language}"));
    }

    #[test]
    fn text_span_has_id_marker() {
        let s = span(SpanKind::Text, "RSD = 2.3%", SpanPosition::default());
        assert_eq!(render_span(&s), "[ID: 4] RSD = 2.3%");
    }

    #[test]
    fn table_cell_is_one_based() {
        let s = span(
            SpanKind::TableCell,
            "98%",
            SpanPosition {
                table: Some(0),
                row: Some(2),
                col: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(render_span(&s), "[ID: 4] Table cell (table 1, row 3, col 2):\n98%");
    }

    #[test]
    fn spreadsheet_cell_uses_reference() {
        let s = span(
            SpanKind::TableCell,
            "2.3",
            SpanPosition {
                sheet: Some("Results".into()),
                cell: Some("B3".into()),
                ..Default::default()
            },
        );
        assert!(render_span(&s).contains("sheet Results, cell B3"));
    }
}
