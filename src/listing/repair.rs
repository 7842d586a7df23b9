//! Recovery of structurally damaged JSON objects emitted by the model.
//!
//! Each step runs only when the previous one still fails to parse:
//! plain parse, markdown fence removal (closed or truncated), object span
//! extraction, escaping of raw line breaks inside strings, and closing of a
//! truncated tail.

use crate::listing::attributes::RawObject;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RepairError {
    #[error("model output could not be recovered as a JSON object")]
    Unparseable,
}

pub fn repair(raw: &str) -> Result<RawObject, RepairError> {
    if let Some(obj) = parse_object(raw) {
        return Ok(obj);
    }

    let unfenced = strip_fence(raw);
    if let Some(obj) = parse_object(&unfenced) {
        return Ok(obj);
    }

    let Some(start) = unfenced.find('{') else {
        return Err(RepairError::Unparseable);
    };
    let tail = &unfenced[start..];
    let mut spans = Vec::with_capacity(2);
    if let Some(end) = tail.rfind('}') {
        spans.push(&tail[..=end]);
    }
    spans.push(tail);

    for span in spans {
        if let Some(obj) = parse_object(span) {
            return Ok(obj);
        }
        let escaped = escape_raw_line_breaks(span);
        if let Some(obj) = parse_object(&escaped) {
            return Ok(obj);
        }
        if let Some(obj) = parse_object(&close_truncated(&escaped)) {
            return Ok(obj);
        }
    }
    Err(RepairError::Unparseable)
}

fn parse_object(input: &str) -> Option<RawObject> {
    match serde_json::from_str::<Value>(input.trim()) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

/// Removes a ```` ``` ```` fence. A missing closing fence (truncated output)
/// keeps everything after the opening one.
pub fn strip_fence(raw: &str) -> String {
    let Some(open) = raw.find("```") else {
        return raw.trim().to_string();
    };
    let after = &raw[open + 3..];
    let body = match after.find('\n') {
        Some(newline)
            if after[..newline]
                .trim()
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric()) =>
        {
            &after[newline + 1..]
        }
        _ => after,
    };
    let body = match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    };
    body.trim().to_string()
}

/// Escapes raw `\n`, `\r` and `\t` that appear inside string literals.
pub fn escape_raw_line_breaks(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 16);
    let mut in_string = false;
    let mut escape_next = false;
    for ch in input.chars() {
        if in_string {
            if escape_next {
                escape_next = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escape_next = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(ch),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }
    out
}

#[derive(Default)]
struct Scan {
    openers: Vec<char>,
    in_string: bool,
    escape_next: bool,
    string_start: usize,
    string_is_key: bool,
    last_string_start: usize,
    last_string_was_key: bool,
    last_significant: Option<char>,
}

fn scan(input: &str) -> Scan {
    let mut state = Scan::default();
    for (idx, ch) in input.char_indices() {
        if state.in_string {
            if state.escape_next {
                state.escape_next = false;
            } else if ch == '\\' {
                state.escape_next = true;
            } else if ch == '"' {
                state.in_string = false;
                state.last_string_start = state.string_start;
                state.last_string_was_key = state.string_is_key;
                state.last_significant = Some('"');
            }
            continue;
        }
        if ch.is_whitespace() {
            continue;
        }
        match ch {
            '"' => {
                state.in_string = true;
                state.string_start = idx;
                state.string_is_key = state.openers.last() == Some(&'{')
                    && matches!(state.last_significant, Some('{') | Some(','));
            }
            '{' | '[' => state.openers.push(ch),
            '}' | ']' => {
                state.openers.pop();
            }
            _ => {}
        }
        if ch != '"' {
            state.last_significant = Some(ch);
        }
    }
    state
}

/// Closes an open string, drops a dangling member and appends one closer
/// per unmatched `{` / `[`.
pub fn close_truncated(input: &str) -> String {
    let state = scan(input);
    let mut out = input.to_string();

    if state.in_string {
        if state.string_is_key {
            out.truncate(state.string_start);
        } else {
            if state.escape_next {
                out.pop();
            }
            out.push('"');
        }
    } else if state.last_significant == Some('"') && state.last_string_was_key {
        out.truncate(state.last_string_start);
    }

    trim_end_in_place(&mut out);
    if out.ends_with(':') {
        out.pop();
        trim_end_in_place(&mut out);
        if out.ends_with('"') {
            let key_start = out[..out.len() - 1].rfind('"');
            if let Some(start) = key_start {
                out.truncate(start);
            }
        }
        trim_end_in_place(&mut out);
    }
    if out.ends_with(',') {
        out.pop();
    }

    for opener in state.openers.iter().rev() {
        out.push(if *opener == '{' { '}' } else { ']' });
    }
    out
}

fn trim_end_in_place(text: &mut String) {
    let len = text.trim_end().len();
    text.truncate(len);
}
