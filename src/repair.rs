//! Best-effort recovery of malformed model output into parseable JSON.
//!
//! Models wrap answers in markdown fences, add commentary around the object,
//! leave keys unquoted, or stop mid-object at a token limit. Repair applies a
//! fixed set of syntactic fixups and re-parses once:
//!
//! 1. strip markdown code fences
//! 2. trim commentary before the first `{` and after the last `}`
//! 3. quote bare object keys
//! 4. close unbalanced braces and brackets
//!
//! Repair never invents field values: it only restores the syntax of content
//! that is already present. Already-valid JSON passes through unchanged.

/// Try to turn `raw` into parseable JSON.
///
/// Returns the (possibly fixed) JSON text, or `None` when the fixups still do
/// not produce something `serde_json` accepts.
pub fn repair_json(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if parses(trimmed) {
        return Some(trimmed.to_string());
    }

    let unfenced = strip_code_fences(trimmed);
    let window = extract_object_window(unfenced);
    let keyed = quote_bare_keys(window);
    let balanced = balance_delimiters(&keyed);

    if parses(&balanced) { Some(balanced) } else { None }
}

fn parses(s: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(s).is_ok()
}

/// Drop a surrounding ``` or ```json fence, keeping the body
fn strip_code_fences(s: &str) -> &str {
    let Some(open) = s.find("```") else {
        return s;
    };
    let after_open = &s[open + 3..];
    // Skip an optional language tag up to the end of the fence line.
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Keep the region from the first `{` through the last `}` (or to the end
/// when no closing brace survived truncation)
fn extract_object_window(s: &str) -> &str {
    let Some(start) = s.find('{') else {
        return s;
    };
    match s.rfind('}') {
        Some(end) if end > start => &s[start..=end],
        _ => &s[start..],
    }
}

/// Quote bare identifiers in key position (`{thought: "x"}` -> `{"thought": "x"}`)
fn quote_bare_keys(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    let mut expect_key = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                expect_key = false;
                out.push(c);
                i += 1;
            }
            '{' | ',' => {
                expect_key = true;
                out.push(c);
                i += 1;
            }
            '[' | ':' => {
                expect_key = false;
                out.push(c);
                i += 1;
            }
            c if c.is_whitespace() => {
                out.push(c);
                i += 1;
            }
            c if expect_key && (c.is_alphabetic() || c == '_') => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ':' {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else {
                    out.push_str(&ident);
                }
                expect_key = false;
            }
            _ => {
                expect_key = false;
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Append the closers for any braces/brackets left open outside strings
fn balance_delimiters(s: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = s.to_string();
    // A string cut off mid-way needs its quote closed before the delimiters.
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const VALID: &str = r#"{"thought":"t","action":"back","action_args":{}}"#;

    #[test]
    fn valid_json_passes_through_unchanged() {
        assert_eq!(repair_json(VALID).unwrap(), VALID);
        // Idempotence: repairing a repaired output changes nothing.
        let once = repair_json(VALID).unwrap();
        assert_eq!(repair_json(&once).unwrap(), once);
    }

    #[test]
    fn strips_markdown_fences() {
        let fenced = format!("```json\n{}\n```", VALID);
        assert_eq!(repair_json(&fenced).unwrap(), VALID);
        let bare_fence = format!("```\n{}\n```", VALID);
        assert_eq!(repair_json(&bare_fence).unwrap(), VALID);
    }

    #[test]
    fn trims_surrounding_commentary() {
        let chatty = format!("Sure! Here is the action:\n{}\nLet me know how it goes.", VALID);
        assert_eq!(repair_json(&chatty).unwrap(), VALID);
    }

    #[test]
    fn quotes_bare_keys() {
        let bare = r#"{thought: "t", action: "back", action_args: {}}"#;
        let fixed = repair_json(bare).unwrap();
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["action"], "back");
    }

    #[test]
    fn closes_truncated_object() {
        let cut = r#"{"thought":"t","action":"back","action_args":{"#;
        let fixed = repair_json(cut).unwrap();
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["action"], "back");
    }

    #[test]
    fn closes_string_cut_mid_way() {
        let cut = r#"{"thought":"half a tho"#;
        let fixed = repair_json(cut).unwrap();
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["thought"], "half a tho");
    }

    #[test]
    fn does_not_fabricate_values() {
        // Repair restores syntax only; missing fields stay missing.
        let cut = r#"{"thought":"t""#;
        let fixed = repair_json(cut).unwrap();
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert!(v.get("action").is_none());
    }

    #[test]
    fn gives_up_on_hopeless_input() {
        assert_eq!(repair_json("no json here at all"), None);
        assert_eq!(repair_json(""), None);
    }

    #[test]
    fn bare_words_inside_arrays_stay_untouched() {
        let s = r#"{"items": [true, false, null], "n": 3}"#;
        assert_eq!(repair_json(s).unwrap(), s);
    }
}
