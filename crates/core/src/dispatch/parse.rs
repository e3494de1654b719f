use serde_json::Value;

/// What the dispatcher understood from a free-form LLM reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// The spec is already satisfied; nothing to apply.
    Complete,
    /// A structured, actionable object.
    Object(Value),
    /// Nothing usable; the original payload is retained for diagnostics.
    Queue { reason: String, raw: String },
}

const STRUCTURAL_KEYS: &[&str] = &["status", "filePath", "oldCode", "content"];
const COMPLETION_SCAN_CHARS: usize = 1500;

/// Fixed fallback order:
/// 1. exact SPEC_COMPLETE token
/// 2. first balanced JSON object inside a fenced code block
/// 3. smallest balanced object with a top-level "status" key
/// 4. any balanced object with a known structural key
/// 5. repair pass (trailing commas, unquoted keys), then 2-4 again
/// 6. natural-language completion detection over the first 1500 chars
/// 7. queue as parse-failed
pub fn parse_response(raw: &str, completion_patterns: &[String]) -> Parsed {
    if raw.lines().any(|l| l.trim() == "SPEC_COMPLETE") {
        return Parsed::Complete;
    }

    if let Some(value) = parse_structured(raw) {
        return Parsed::Object(value);
    }

    let repaired = repair_json(raw);
    if repaired != raw {
        if let Some(value) = parse_structured(&repaired) {
            return Parsed::Object(value);
        }
    }

    let head: String = raw.chars().take(COMPLETION_SCAN_CHARS).collect();
    let head = head.to_lowercase();
    if let Some(pattern) = completion_patterns.iter().find(|p| head.contains(p.to_lowercase().as_str())) {
        tracing::info!(pattern, "Natural-language completion detected");
        return Parsed::Complete;
    }

    Parsed::Queue {
        reason: "parse-failed".to_string(),
        raw: raw.to_string(),
    }
}

fn parse_structured(raw: &str) -> Option<Value> {
    if let Some(value) = from_fenced_block(raw) {
        return Some(value);
    }
    if let Some(value) = smallest_status_object(raw) {
        return Some(value);
    }
    structural_object(raw)
}

/// Extract the first balanced object inside a ``` fence.
fn from_fenced_block(raw: &str) -> Option<Value> {
    let mut rest = raw;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        // Skip the info string (e.g. "json") up to the newline.
        let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_open[body_start..];
        let close = body.find("```").unwrap_or(body.len());
        let fenced = &body[..close];
        if let Some(start) = fenced.find('{') {
            if let Some(object) = extract_balanced(fenced, start) {
                if let Ok(value) = serde_json::from_str::<Value>(object) {
                    if value.is_object() {
                        return Some(value);
                    }
                }
            }
        }
        rest = &body[close.min(body.len())..];
        if rest.len() < 3 {
            break;
        }
        rest = &rest[3..];
    }
    None
}

/// The smallest balanced object whose outermost braces enclose a top-level
/// "status" key. Scanning every opening brace handles nested wrappers in
/// both directions.
fn smallest_status_object(raw: &str) -> Option<Value> {
    let mut best: Option<(usize, Value)> = None;
    for (pos, _) in raw.match_indices('{') {
        if let Some(object) = extract_balanced(raw, pos) {
            if let Ok(value) = serde_json::from_str::<Value>(object) {
                if value.get("status").is_some() {
                    let len = object.len();
                    if best.as_ref().map(|(l, _)| len < *l).unwrap_or(true) {
                        best = Some((len, value));
                    }
                }
            }
        }
    }
    best.map(|(_, v)| v)
}

/// Any balanced object containing one of the known structural keys.
fn structural_object(raw: &str) -> Option<Value> {
    for (pos, _) in raw.match_indices('{') {
        if let Some(object) = extract_balanced(raw, pos) {
            if let Ok(value) = serde_json::from_str::<Value>(object) {
                if STRUCTURAL_KEYS.iter().any(|k| value.get(k).is_some()) {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// String-aware balanced-brace extraction starting at `start` (which must
/// point at '{').
fn extract_balanced(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Best-effort repair: strip trailing commas and quote bare keys.
fn repair_json(raw: &str) -> String {
    let trailing_commas = regex::Regex::new(r",\s*([}\]])").unwrap();
    let repaired = trailing_commas.replace_all(raw, "$1");
    let bare_keys = regex::Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap();
    bare_keys.replace_all(&repaired, "$1\"$2\":").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> Vec<String> {
        sneebly_config::Config::default().parser.completion_patterns
    }

    #[test]
    fn test_spec_complete_token() {
        assert_eq!(
            parse_response("SPEC_COMPLETE", &patterns()),
            Parsed::Complete
        );
        assert_eq!(
            parse_response("Done with the work.\nSPEC_COMPLETE\n", &patterns()),
            Parsed::Complete
        );
    }

    #[test]
    fn test_fenced_json_block() {
        let raw = "Here is my change:\n```json\n{\"status\": \"change\", \"filePath\": \"a.js\"}\n```\nThanks.";
        match parse_response(raw, &patterns()) {
            Parsed::Object(v) => assert_eq!(v["status"], "change"),
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_prose_then_fenced_block() {
        let raw = "I analysed the file and decided on a fix.\n\n```\n{\"status\": \"stuck\", \"reason\": \"missing context\"}\n```";
        match parse_response(raw, &patterns()) {
            Parsed::Object(v) => assert_eq!(v["status"], "stuck"),
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_smallest_status_object_in_nested_wrapper() {
        let raw = r#"{"result": {"status": "change", "filePath": "a.js", "oldCode": "x", "newCode": "y"}}"#;
        match parse_response(raw, &patterns()) {
            Parsed::Object(v) => {
                // The inner object is smaller and carries the status key.
                assert_eq!(v["status"], "change");
                assert_eq!(v["filePath"], "a.js");
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_bare_structural_object() {
        let raw = "Proposed edit: {\"filePath\": \"a.js\", \"oldCode\": \"1\", \"newCode\": \"2\"} end";
        match parse_response(raw, &patterns()) {
            Parsed::Object(v) => assert_eq!(v["filePath"], "a.js"),
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_repair_trailing_comma_and_bare_keys() {
        let raw = "```\n{status: \"change\", filePath: \"a.js\",}\n```";
        match parse_response(raw, &patterns()) {
            Parsed::Object(v) => {
                assert_eq!(v["status"], "change");
                assert_eq!(v["filePath"], "a.js");
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_natural_language_completion() {
        let raw = "Looking at the file, the requirement is already implemented by the existing middleware, so no edit is required.";
        assert_eq!(parse_response(raw, &patterns()), Parsed::Complete);
    }

    #[test]
    fn test_completion_pattern_beyond_window_ignored() {
        let mut raw = "word ".repeat(400);
        raw.push_str("no changes needed");
        match parse_response(&raw, &patterns()) {
            Parsed::Queue { reason, .. } => assert_eq!(reason, "parse-failed"),
            other => panic!("expected queue, got {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_queues_with_raw() {
        let raw = "I am not sure what to do here.";
        match parse_response(raw, &patterns()) {
            Parsed::Queue { reason, raw: kept } => {
                assert_eq!(reason, "parse-failed");
                assert_eq!(kept, raw);
            }
            other => panic!("expected queue, got {other:?}"),
        }
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse() {
        let raw = r#"{"status": "change", "newCode": "if (a) { b(); }"}"#;
        match parse_response(raw, &patterns()) {
            Parsed::Object(v) => assert_eq!(v["newCode"], "if (a) { b(); }"),
            other => panic!("expected object, got {other:?}"),
        }
    }
}
