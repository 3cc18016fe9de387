//! Total JSON path lookup over node outputs.
//!
//! Node outputs are often generated text wrapping a JSON document in a
//! Markdown fence. Resolution unwraps such strings on the way down, and every
//! failure mode (bad path, missing key, unparsable text) is just `None`.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn fence() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"```(?:json|JSON)?\s*\n?([\s\S]*?)```").ok())
        .as_ref()
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parse `$.a.b[0]`, `a.b.0` or `a["b c"]` into segments. `None` on malformed
/// brackets.
fn parse(path: &str) -> Option<Vec<Segment>> {
    let trimmed = path.trim();
    let body = trimmed
        .strip_prefix('$')
        .unwrap_or(trimmed)
        .trim_start_matches('.');

    let mut segments = Vec::new();
    let mut chars = body.chars();
    let mut current = String::new();

    let flush = |current: &mut String, segments: &mut Vec<Segment>| {
        if current.is_empty() {
            return;
        }
        let seg = match current.parse::<usize>() {
            Ok(i) => Segment::Index(i),
            Err(_) => Segment::Key(current.clone()),
        };
        segments.push(seg);
        current.clear();
    };

    while let Some(c) = chars.next() {
        match c {
            '.' => flush(&mut current, &mut segments),
            '[' => {
                flush(&mut current, &mut segments);
                let mut inner = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    return None;
                }
                let inner = inner.trim();
                let quoted = inner
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
                match quoted {
                    Some(key) => segments.push(Segment::Key(key.to_string())),
                    None => segments.push(Segment::Index(inner.parse().ok()?)),
                }
            }
            _ => current.push(c),
        }
    }
    flush(&mut current, &mut segments);
    Some(segments)
}

/// Parse JSON out of text, unwrapping a ```` ```json ```` fence if present.
pub fn parse_embedded_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let inner = fence()?.captures(trimmed)?.get(1)?.as_str().trim();
    serde_json::from_str(inner).ok()
}

/// Look up `path` in `value`. An empty path or `$` yields the value itself.
pub fn resolve(value: &Value, path: &str) -> Option<Value> {
    let segments = parse(path)?;
    let mut current = value.clone();

    for segment in segments {
        // Step into JSON carried as text
        if let Value::String(text) = &current {
            current = parse_embedded_json(text)?;
        }
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(mut map)) => map.remove(&key)?,
            (Segment::Index(i), Value::Array(mut items)) if i < items.len() => items.swap_remove(i),
            // Numeric keys are valid object keys too
            (Segment::Index(i), Value::Object(mut map)) => map.remove(&i.to_string())?,
            _ => return None,
        };
    }
    Some(current)
}

/// [`resolve`] with an optional path; `None` means the whole value.
pub fn select(value: &Value, path: Option<&str>) -> Option<Value> {
    match path {
        Some(p) if !p.trim().is_empty() => resolve(value, p),
        _ => Some(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dollar_and_dotted_forms_agree() {
        let v = json!({"company": {"officers": [{"name": "Ann"}, {"name": "Bob"}]}});
        assert_eq!(resolve(&v, "$.company.officers[1].name"), Some(json!("Bob")));
        assert_eq!(resolve(&v, "company.officers.0.name"), Some(json!("Ann")));
        assert_eq!(resolve(&v, "company['officers'][0]"), Some(json!({"name": "Ann"})));
    }

    #[test]
    fn empty_path_is_identity() {
        let v = json!([1, 2]);
        assert_eq!(resolve(&v, "$"), Some(v.clone()));
        assert_eq!(resolve(&v, ""), Some(v.clone()));
        assert_eq!(select(&v, None), Some(v));
    }

    #[test]
    fn absent_never_panics() {
        let v = json!({"a": [1]});
        assert_eq!(resolve(&v, "a[5]"), None);
        assert_eq!(resolve(&v, "b.c"), None);
        assert_eq!(resolve(&v, "a[x]"), None);
        assert_eq!(resolve(&v, "a[0"), None);
        assert_eq!(resolve(&json!(3), "a"), None);
    }

    #[test]
    fn unwraps_fenced_text() {
        let v = json!({
            "text": "Here you go:\n```json\n{\"changes\": [{\"target_path\": \"a.b\"}]}\n```\nDone."
        });
        assert_eq!(
            resolve(&v, "text.changes[0].target_path"),
            Some(json!("a.b"))
        );
        assert_eq!(resolve(&json!("not json"), "a"), None);
    }

    #[test]
    fn embedded_json_plain_and_fenced() {
        assert_eq!(parse_embedded_json(" {\"a\":1} "), Some(json!({"a": 1})));
        assert_eq!(parse_embedded_json("```\n[1]\n```"), Some(json!([1])));
        assert_eq!(parse_embedded_json("no json here"), None);
    }

    #[test]
    fn fence_pattern_is_compiled_once() {
        let first = fence().unwrap();
        assert!(std::ptr::eq(first, fence().unwrap()));
        assert_eq!(
            parse_embedded_json("```JSON\n{\"b\": 2}\n```"),
            Some(json!({"b": 2}))
        );
    }
}
