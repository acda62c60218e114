//! Raw-text interpretation: echo stripping, silence detection, and JSON
//! extraction with a conservative repair pass.

use ei_prompt::NO_MESSAGE;

/// Remove a leading echo of the final human message.
///
/// The raw text is only touched when it *begins* with the echo — either the
/// whole trimmed text starts with it, or the first line equals it. A quoted
/// occurrence anywhere else in the body is preserved byte for byte.
pub fn strip_echo(raw: &str, user_final: &str) -> String {
    let guard = user_final.trim();
    let text = raw.trim();
    if guard.is_empty() || text.is_empty() {
        return text.to_string();
    }

    if let Some(rest) = text.strip_prefix(guard) {
        // Only treat it as an echo when the prefix ends cleanly — at a line
        // break, or at the very start of the remaining text after
        // whitespace. "Hithere" must not lose "Hi".
        if rest.is_empty() {
            return String::new();
        }
        if rest.starts_with('\n') || rest.starts_with("\r\n") || rest.starts_with(' ') {
            return rest.trim_start().to_string();
        }
    }

    if let Some((first_line, rest)) = text.split_once('\n') {
        if first_line.trim() == guard {
            return rest.trim_start().to_string();
        }
    }

    text.to_string()
}

/// A short sanitized excerpt of an unparseable reply, for error events.
pub fn parse_error_snippet(raw: &str) -> String {
    let flat = raw.replace(['\n', '\r'], " ");
    let snippet: String = flat.chars().take(120).collect();
    snippet.trim().to_string()
}

/// Exact "No Message" token (after trim) — the persona chose silence.
pub fn is_no_message(raw: &str) -> bool {
    raw.trim() == NO_MESSAGE
}

/// Extract the first balanced JSON value from LLM output, ignoring fences
/// and surrounding prose.
pub fn extract_json(raw: &str) -> Option<serde_json::Value> {
    // Fenced ```json blocks take precedence — they are unambiguous.
    if let Some(fence_start) = raw.find("```json").or_else(|| raw.find("```")) {
        let after = raw[fence_start..]
            .trim_start_matches("```json")
            .trim_start_matches("```");
        if let Some(fence_end) = after.find("```") {
            let body = after[..fence_end].trim();
            if let Ok(value) = serde_json::from_str(body) {
                return Some(value);
            }
        }
    }

    let candidate = balanced_slice(raw)?;
    serde_json::from_str(candidate).ok()
}

/// Extract with a repair pass: when a clean parse fails, trim the candidate
/// to its last balanced point, close any unterminated string, and append the
/// missing closers. Conservative by design — anything beyond bracket
/// balancing fails closed.
pub fn extract_json_with_repair(raw: &str) -> Option<serde_json::Value> {
    if let Some(value) = extract_json(raw) {
        return Some(value);
    }
    let start = raw.find(['{', '['])?;
    repair_json(&raw[start..])
}

/// Best-effort repair of a truncated JSON fragment starting at `{` or `[`.
///
/// Walks the fragment recording every position where a value just ended
/// (closing quote, closing bracket, digit, `e`/`l` of true/false/null)
/// together with the open-bracket stack at that point. Candidate cuts are
/// then tried newest-first: truncate, drop a dangling comma, append the
/// missing closers, parse. A cut that lands after an object key simply fails
/// to parse and the next older cut is tried.
fn repair_json(fragment: &str) -> Option<serde_json::Value> {
    const MAX_CUT_ATTEMPTS: usize = 50;

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut cuts: Vec<(usize, Vec<char>)> = Vec::new();

    for (idx, ch) in fragment.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                cuts.push((idx + 1, stack.clone()));
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    // Fully balanced — the fragment itself should parse.
                    return serde_json::from_str(&fragment[..=idx]).ok();
                }
                cuts.push((idx + 1, stack.clone()));
            }
            c if c.is_ascii_digit() || c == 'e' || c == 'l' => {
                cuts.push((idx + ch.len_utf8(), stack.clone()));
            }
            _ => {}
        }
    }

    for (cut, open) in cuts.into_iter().rev().take(MAX_CUT_ATTEMPTS) {
        let mut repaired = fragment[..cut].trim_end().trim_end_matches(',').to_string();
        for closer in open.iter().rev() {
            repaired.push(*closer);
        }
        if let Ok(value) = serde_json::from_str(&repaired) {
            return Some(value);
        }
    }
    None
}

fn balanced_slice(raw: &str) -> Option<&str> {
    let start = raw.find(['{', '['])?;
    let bytes = raw[start..].char_indices();
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in bytes {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(&raw[start..start + idx + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── echo stripping ──────────────────────────────────────────────────────

    #[test]
    fn strips_exact_leading_echo() {
        assert_eq!(strip_echo("Hi\n\nGreat to see you.", "Hi"), "Great to see you.");
    }

    #[test]
    fn strips_first_line_echo_with_whitespace() {
        assert_eq!(strip_echo("  Hi  \nHello there", "Hi"), "Hello there");
    }

    #[test]
    fn preserves_mid_body_occurrence() {
        let raw = "Sure — when you said \"Hi\" earlier I smiled.";
        assert_eq!(strip_echo(raw, "Hi"), raw);
    }

    #[test]
    fn does_not_strip_partial_word_prefix() {
        assert_eq!(strip_echo("Hithere friend", "Hi"), "Hithere friend");
    }

    #[test]
    fn echo_only_reply_becomes_empty() {
        assert_eq!(strip_echo("Hi", "Hi"), "");
    }

    #[test]
    fn no_message_detection_is_exact() {
        assert!(is_no_message("No Message"));
        assert!(is_no_message("  No Message \n"));
        assert!(!is_no_message("No message"));
        assert!(!is_no_message("No Message."));
        assert!(!is_no_message("There is No Message here"));
    }

    // ── JSON extraction ─────────────────────────────────────────────────────

    #[test]
    fn extracts_bare_json() {
        let value = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn extracts_from_fences_and_prose() {
        let raw = "Here you go:\n```json\n{\"mentioned\": [], \"new_items\": []}\n```\nHope it helps!";
        let value = extract_json(raw).unwrap();
        assert_eq!(value["mentioned"], json!([]));
    }

    #[test]
    fn extracts_first_balanced_value_amid_prose() {
        let raw = "prefix {\"a\": {\"b\": 2}} suffix {\"c\": 3}";
        let value = extract_json(raw).unwrap();
        assert_eq!(value, json!({"a": {"b": 2}}));
    }

    #[test]
    fn handles_braces_inside_strings() {
        let raw = r#"{"cmd": "echo {}", "n": 1}"#;
        let value = extract_json(raw).unwrap();
        assert_eq!(value["cmd"], "echo {}");
    }

    #[test]
    fn plain_text_yields_none() {
        assert!(extract_json("just words, no json").is_none());
    }

    // ── repair ──────────────────────────────────────────────────────────────

    #[test]
    fn repairs_truncated_object() {
        let raw = r#"{"name": "Birthday", "confidence": 0.9, "descri"#;
        let value = extract_json_with_repair(raw).unwrap();
        assert_eq!(value["name"], "Birthday");
        assert_eq!(value["confidence"], 0.9);
    }

    #[test]
    fn repairs_truncated_array_of_objects() {
        let raw = r#"{"new_items": [{"name": "Kate"}, {"name": "Jo"#;
        let value = extract_json_with_repair(raw).unwrap();
        assert_eq!(value["new_items"][0]["name"], "Kate");
    }

    #[test]
    fn repairs_unclosed_string_by_cutting_it() {
        let raw = r#"{"items": ["alpha", "bet"#;
        let value = extract_json_with_repair(raw).unwrap();
        assert_eq!(value["items"][0], "alpha");
    }

    #[test]
    fn garbage_fails_closed() {
        assert!(extract_json_with_repair("}}{{ not json").is_none());
        assert!(extract_json_with_repair("no braces at all").is_none());
    }

    #[test]
    fn intact_json_survives_repair_path() {
        let raw = r#"{"done": true}"#;
        let value = extract_json_with_repair(raw).unwrap();
        assert_eq!(value["done"], true);
    }
}
