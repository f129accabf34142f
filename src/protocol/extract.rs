//! Embedded-JSON extraction from free-form model text.
//!
//! Models rarely answer with bare JSON: payloads arrive inside markdown
//! fences, after prose, or surrounded by commentary. The scanner walks the
//! text for balanced `{...}` regions (string- and escape-aware, so braces
//! inside string literals do not end an object) and keeps every region that
//! parses as a JSON object, in document order.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Upper bound on extracted objects per response. Anything past this is
/// commentary, not payload.
const MAX_OBJECTS: usize = 16;

/// All balanced top-level JSON objects in `text`, in document order.
///
/// Nested objects are consumed by their parent; regions that do not parse
/// are re-scanned one byte further in, so pseudo-JSON prose around a real
/// payload does not hide it.
pub fn json_objects(text: &str) -> Vec<Value> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() && found.len() < MAX_OBJECTS {
        if bytes[pos] != b'{' {
            pos += 1;
            continue;
        }
        match find_balanced(bytes, pos) {
            Some(end) => {
                // `{` and `}` are ASCII, so these offsets are char boundaries.
                let slice = &text[pos..end];
                match serde_json::from_str::<Value>(slice) {
                    Ok(Value::Object(map)) => {
                        found.push(Value::Object(map));
                        pos = end;
                    }
                    _ => pos += 1,
                }
            }
            None => pos += 1,
        }
    }

    found
}

/// The first embedded object that deserializes as `T`.
pub fn first_payload<T: DeserializeOwned>(text: &str) -> Option<T> {
    json_objects(text)
        .into_iter()
        .find_map(|v| serde_json::from_value(v).ok())
}

/// Find the end (exclusive) of the balanced object opening at `start`.
fn find_balanced(bytes: &[u8], start: usize) -> Option<usize> {
    debug_assert_eq!(bytes[start], b'{');
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_bare_object() {
        let objects = json_objects(r#"{"a": 1}"#);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["a"], 1);
    }

    #[test]
    fn test_object_inside_markdown_fence() {
        let text = "Here is my plan:\n```json\n{\"action\": \"final\", \"content\": \"done\"}\n```\nThanks!";
        let objects = json_objects(text);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["action"], "final");
    }

    #[test]
    fn test_object_after_prose() {
        let text = "I will now run a command. {\"action\": \"run_command\", \"command\": \"ls\", \"reason\": \"inspect\"}";
        let objects = json_objects(text);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["command"], "ls");
    }

    #[test]
    fn test_braces_inside_strings_do_not_terminate() {
        let text = r#"{"command": "echo '{not a close}'", "action": "run_command"}"#;
        let objects = json_objects(text);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["command"], "echo '{not a close}'");
    }

    #[test]
    fn test_escaped_quotes_inside_strings() {
        let text = r#"{"content": "she said \"hi\" and left"}"#;
        let objects = json_objects(text);
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn test_nested_objects_consumed_by_parent() {
        let text = r#"{"outer": {"inner": 1}}"#;
        let objects = json_objects(text);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["outer"]["inner"], 1);
    }

    #[test]
    fn test_multiple_objects_in_document_order() {
        let text = r#"first {"n": 1} then {"n": 2}"#;
        let objects = json_objects(text);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0]["n"], 1);
        assert_eq!(objects[1]["n"], 2);
    }

    #[test]
    fn test_pseudo_json_does_not_hide_real_payload() {
        let text = r#"pseudo {oops not json} real {"ok": true}"#;
        let objects = json_objects(text);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["ok"], true);
    }

    #[test]
    fn test_unterminated_object_found_nothing() {
        assert!(json_objects(r#"{"a": 1"#).is_empty());
        assert!(json_objects("no json here").is_empty());
        assert!(json_objects("").is_empty());
    }

    #[test]
    fn test_unicode_text_around_payload() {
        let text = "结论如下:\n{\"decision\": \"通过\"}\n完";
        let objects = json_objects(text);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["decision"], "通过");
    }

    #[test]
    fn test_first_payload_skips_non_matching_shapes() {
        #[derive(Deserialize)]
        struct Shape {
            decision: String,
        }
        let text = r#"{"other": 1} {"decision": "PASS"}"#;
        let shape: Shape = first_payload(text).unwrap();
        assert_eq!(shape.decision, "PASS");
    }
}
