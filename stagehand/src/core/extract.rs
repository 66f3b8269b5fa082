//! Defensive extraction of a JSON payload from free-form generator output.
//!
//! Generators answer with bare JSON, JSON inside Markdown code fences, JSON
//! surrounded by prose, or nothing usable at all. [`extract`] walks a fixed
//! ladder of strategies and stops at the first one that yields a JSON object
//! or array:
//!
//! 1. the whole trimmed text,
//! 2. fenced code blocks (language-tagged blocks before untagged ones),
//! 3. balanced `{...}` / `[...]` spans in the raw text, longest first.
//!
//! Failure is a value, not an error: the caller decides whether a missing
//! payload is fatal for its stage.

use std::cmp::Reverse;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Characters of the original text kept in a failure preview.
pub const PREVIEW_CHARS: usize = 200;

/// Upper bound on bracket spans considered by the pattern scan.
const MAX_SCAN_CANDIDATES: usize = 256;

/// Upper bound on linear passes over the text by the pattern scan.
const MAX_SCAN_PASSES: usize = 8;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+.\-]*)[^\n]*\n(.*?)```").expect("fence regex is valid")
});

/// Which rung of the ladder produced the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionMethod {
    Direct,
    FencedBlock,
    PatternScan,
    Failed,
}

/// Outcome of parsing one generator response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub payload: Option<Value>,
    pub method: ExtractionMethod,
    /// Original response text, kept for diagnostics.
    pub raw: String,
    /// Bounded excerpt of `raw`, set only when extraction failed.
    pub preview: Option<String>,
}

impl ExtractionResult {
    fn found(payload: Value, method: ExtractionMethod, raw: &str) -> Self {
        Self {
            payload: Some(payload),
            method,
            raw: raw.to_string(),
            preview: None,
        }
    }

    fn failed(raw: &str) -> Self {
        Self {
            payload: None,
            method: ExtractionMethod::Failed,
            raw: raw.to_string(),
            preview: Some(preview(raw)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.payload.is_some()
    }

    /// Take the payload, leaving the diagnostics behind.
    pub fn into_payload(self) -> Option<Value> {
        self.payload
    }
}

/// Run the extraction ladder over `text`.
pub fn extract(text: &str) -> ExtractionResult {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        debug!("empty response, skipping extraction");
        return ExtractionResult::failed(text);
    }

    if let Some(value) = parse_structured(trimmed) {
        return ExtractionResult::found(value, ExtractionMethod::Direct, text);
    }

    for block in fenced_blocks(text) {
        if let Some(value) = parse_structured(block.trim()) {
            return ExtractionResult::found(value, ExtractionMethod::FencedBlock, text);
        }
    }

    for span in bracket_spans(text) {
        if let Some(value) = parse_structured(span) {
            return ExtractionResult::found(value, ExtractionMethod::PatternScan, text);
        }
    }

    debug!(len = text.len(), "no structured payload found");
    ExtractionResult::failed(text)
}

/// First [`PREVIEW_CHARS`] characters of `text`, with a marker when cut.
pub fn preview(text: &str) -> String {
    let total = text.chars().count();
    if total <= PREVIEW_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{head}... [truncated {} chars]", total - PREVIEW_CHARS)
}

/// Parse `text` as JSON, accepting only objects and arrays.
fn parse_structured(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        _ => None,
    }
}

/// Bodies of fenced code blocks, tagged blocks first, each group in document order.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut tagged = Vec::new();
    let mut untagged = Vec::new();
    for caps in FENCE_RE.captures_iter(text) {
        let (Some(tag), Some(body)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        if tag.as_str().is_empty() {
            untagged.push(body.as_str());
        } else {
            tagged.push(body.as_str());
        }
    }
    tagged.extend(untagged);
    tagged
}

/// Balanced bracket spans ordered longest first; equal lengths keep document order.
///
/// Brackets inside JSON string literals are ignored, so prose like
/// `"see {x}"` inside a value does not break the match. Each pass is linear in
/// the text; an opener left unclosed by one pass (typically a stray `{` in
/// prose) is skipped by the next, up to [`MAX_SCAN_PASSES`] passes.
fn bracket_spans(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut from = 0;
    for _ in 0..MAX_SCAN_PASSES {
        let Some(unclosed) = scan_pass(bytes, from, &mut spans) else {
            break;
        };
        from = unclosed + 1;
    }

    spans.sort_unstable_by_key(|&(start, end)| (Reverse(end - start), start));
    spans.dedup();
    spans.truncate(MAX_SCAN_CANDIDATES);
    spans.into_iter().map(|(s, e)| &text[s..=e]).collect()
}

/// One left-to-right pass from `from`, pushing every balanced span onto `spans`.
///
/// Quotes only open strings inside an open bracket; at top level they are
/// prose. A mismatched closer discards every opener still pending. Returns
/// the position of the outermost opener that never closed, if any.
fn scan_pass(bytes: &[u8], from: usize, spans: &mut Vec<(usize, usize)>) -> Option<usize> {
    let mut stack: Vec<(usize, u8)> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[from..].iter().enumerate() {
        let pos = from + offset;
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' if !stack.is_empty() => in_string = true,
            b'{' => stack.push((pos, b'}')),
            b'[' => stack.push((pos, b']')),
            b'}' | b']' => match stack.pop() {
                Some((open, close)) if close == b => spans.push((open, pos)),
                _ => stack.clear(),
            },
            _ => {}
        }
    }
    stack.first().map(|&(open, _)| open)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_json_is_direct() {
        let result = extract("  {\"status\": \"ok\", \"items\": [1, 2]}\n");
        assert_eq!(result.method, ExtractionMethod::Direct);
        assert_eq!(result.payload, Some(json!({"status": "ok", "items": [1, 2]})));
        assert!(result.preview.is_none());
    }

    #[test]
    fn tagged_fence_between_prose() {
        let text = "prefix text\n```json\n{\"a\":1}\n```\nsuffix";
        let result = extract(text);
        assert_eq!(result.method, ExtractionMethod::FencedBlock);
        assert_eq!(result.payload, Some(json!({"a": 1})));
        assert_eq!(result.raw, text);
    }

    #[test]
    fn whitespace_only_fails_immediately() {
        let result = extract("  ");
        assert_eq!(result.method, ExtractionMethod::Failed);
        assert!(result.payload.is_none());
        assert_eq!(result.preview.as_deref(), Some("  "));
    }

    #[test]
    fn direct_parse_wins_over_fences() {
        // A JSON string value that itself contains a fence: the whole text parses directly.
        let text = r#"{"note": "```json\n{\"inner\": true}\n```"}"#;
        let result = extract(text);
        assert_eq!(result.method, ExtractionMethod::Direct);
        assert!(result.payload.expect("payload").get("note").is_some());
    }

    #[test]
    fn tagged_fences_are_tried_before_untagged() {
        let text = "```\n[\"untagged\"]\n```\nand\n```json\n[\"tagged\"]\n```";
        let result = extract(text);
        assert_eq!(result.method, ExtractionMethod::FencedBlock);
        assert_eq!(result.payload, Some(json!(["tagged"])));
    }

    #[test]
    fn malformed_tagged_fence_falls_back_to_untagged() {
        let text = "```json\n{not json}\n```\n```\n{\"ok\": true}\n```";
        let result = extract(text);
        assert_eq!(result.method, ExtractionMethod::FencedBlock);
        assert_eq!(result.payload, Some(json!({"ok": true})));
    }

    #[test]
    fn prose_wrapped_object_uses_pattern_scan() {
        let text = "Here is the result: {\"outer\": {\"inner\": {\"deep\": [1, {\"x\": 2}]}}} hope it helps";
        let result = extract(text);
        assert_eq!(result.method, ExtractionMethod::PatternScan);
        assert_eq!(
            result.payload,
            Some(json!({"outer": {"inner": {"deep": [1, {"x": 2}]}}}))
        );
    }

    #[test]
    fn pattern_scan_ignores_brackets_inside_strings() {
        let text = "Answer: {\"msg\": \"use } and { freely\", \"n\": 1}.";
        let result = extract(text);
        assert_eq!(result.method, ExtractionMethod::PatternScan);
        assert_eq!(result.payload, Some(json!({"msg": "use } and { freely", "n": 1})));
    }

    #[test]
    fn pattern_scan_falls_back_to_shorter_span() {
        // The outer span is balanced but not valid JSON; the inner object is.
        let text = "note {broken: {\"k\": \"v\"} trailing}";
        let result = extract(text);
        assert_eq!(result.method, ExtractionMethod::PatternScan);
        assert_eq!(result.payload, Some(json!({"k": "v"})));
    }

    #[test]
    fn equal_length_spans_prefer_first_occurrence() {
        let text = "first {\"a\":1} then {\"b\":2}";
        let result = extract(text);
        assert_eq!(result.payload, Some(json!({"a": 1})));
    }

    #[test]
    fn stray_opener_in_prose_does_not_hide_later_object() {
        let text = "Draft: {incomplete \"note\n Final: {\"a\": 1}";
        let result = extract(text);
        assert_eq!(result.method, ExtractionMethod::PatternScan);
        assert_eq!(result.payload, Some(json!({"a": 1})));
    }

    #[test]
    fn unbalanced_brackets_scan_in_linear_time() {
        let started = std::time::Instant::now();
        for text in [
            format!("prose {}", "{".repeat(200_000)),
            format!("prose {}", "}".repeat(200_000)),
            format!("prose {}", "{[".repeat(100_000)),
            format!("prose {}", "{\"".repeat(100_000)),
        ] {
            let result = extract(&text);
            assert_eq!(result.method, ExtractionMethod::Failed);
        }
        assert!(
            started.elapsed() < std::time::Duration::from_secs(5),
            "took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn scalars_are_not_payloads() {
        let result = extract("42");
        assert_eq!(result.method, ExtractionMethod::Failed);
    }

    #[test]
    fn long_failure_preview_is_truncated() {
        let text = "x".repeat(500);
        let result = extract(&text);
        assert_eq!(result.method, ExtractionMethod::Failed);
        let preview = result.preview.expect("preview");
        assert!(preview.starts_with(&"x".repeat(PREVIEW_CHARS)));
        assert!(preview.ends_with("[truncated 300 chars]"));
        assert_eq!(result.raw.len(), 500);
    }

    #[test]
    fn preview_counts_characters_not_bytes() {
        let text = "é".repeat(PREVIEW_CHARS);
        assert_eq!(preview(&text), text);
    }
}
