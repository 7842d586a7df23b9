//! Normalization of model and caller values before they are stored.
//!
//! A field is either a meaningful value or unset; placeholder words the
//! model likes to emit ("null", "N/A", ...) never survive as values.

use once_cell::sync::Lazy;
use regex::Regex;

const PLACEHOLDERS: &[&str] = &[
    "null",
    "undefined",
    "n/a",
    "na",
    "not available",
    "not specified",
    "none specified",
    "unknown",
];

/// Labels of the trailing attribute block in each description.
const STRUCTURED_LABELS: &[&str] = &[
    "brand",
    "label size",
    "pit to pit",
    "material",
    "era",
    "made in",
    "colour",
    "pattern",
    "style",
    "flaws",
];

const CONDITIONS: &[&str] = &["Excellent", "Very good", "Good", "Fair"];

static PLACEHOLDER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:null|undefined)\b").expect("placeholder regex"));
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static INLINE_SPACE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+").expect("inline space regex"));
static LABELLED_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z][A-Za-z ]{0,30}?)\s*:\s*(.*)$").expect("labelled line regex")
});

pub fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || PLACEHOLDERS
            .iter()
            .any(|placeholder| trimmed.eq_ignore_ascii_case(placeholder))
}

/// Trims the value, or returns `None` for placeholder-like input.
pub fn sanitize_value(value: &str) -> Option<String> {
    if is_placeholder(value) {
        None
    } else {
        Some(value.trim().to_string())
    }
}

pub fn sanitize_opt(value: Option<&str>) -> Option<String> {
    value.and_then(sanitize_value)
}

/// Trims every tag, drops placeholders and case-insensitive duplicates.
/// An empty result is unset.
pub fn sanitize_tags<I>(tags: I) -> Option<Vec<String>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut clean: Vec<String> = Vec::new();
    for tag in tags {
        let Some(tag) = sanitize_value(tag.as_ref()) else {
            continue;
        };
        if !clean.iter().any(|seen| seen.eq_ignore_ascii_case(&tag)) {
            clean.push(tag);
        }
    }
    (!clean.is_empty()).then_some(clean)
}

/// Drops literal `null`/`undefined` words and collapses whitespace.
pub fn sanitize_text(text: &str) -> String {
    let stripped = PLACEHOLDER_TOKEN.replace_all(text, "");
    WHITESPACE_RUN.replace_all(&stripped, " ").trim().to_string()
}

/// Same token removal as [`sanitize_text`] but keeps line structure.
fn sanitize_line(line: &str) -> String {
    let stripped = PLACEHOLDER_TOKEN.replace_all(line, "");
    INLINE_SPACE_RUN
        .replace_all(&stripped, " ")
        .trim_end()
        .to_string()
}

/// Maps size words to a canonical abbreviation. Unknown sizes pass through.
pub fn normalize_size(size: Option<&str>) -> Option<String> {
    let raw = sanitize_opt(size)?;
    let key: String = raw
        .to_lowercase()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == ' ')
        .collect();
    let canonical = match key.split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
        "xxs" | "extra extra small" | "2xs" => "XXS",
        "xs" | "extra small" | "x small" | "xsmall" => "XS",
        "s" | "small" | "sm" => "S",
        "m" | "medium" | "med" | "md" => "M",
        "l" | "large" | "lg" => "L",
        "xl" | "extra large" | "x large" | "xlarge" => "XL",
        "xxl" | "2xl" | "extra extra large" | "xx large" | "xxlarge" | "double extra large" => {
            "XXL"
        }
        "xxxl" | "3xl" | "extra extra extra large" | "xxx large" | "xxxlarge"
        | "triple extra large" => "XXXL",
        _ => return Some(raw),
    };
    Some(canonical.to_string())
}

/// Snaps free-form condition text onto the canonical grades by prefix,
/// keeping a trailing parenthetical note.
pub fn snap_condition(value: &str) -> Option<String> {
    let raw = sanitize_value(value)?;
    let (base, note) = split_note(&raw);
    let lowered = base.to_lowercase();
    let grade = CONDITIONS
        .iter()
        .find(|grade| lowered.starts_with(&grade.to_lowercase()))
        .or_else(|| match lowered.as_str() {
            l if ["mint", "like new", "near mint"]
                .iter()
                .any(|prefix| l.starts_with(prefix)) =>
            {
                Some(&"Excellent")
            }
            l if l.starts_with("great") => Some(&"Very good"),
            l if l.starts_with("ok") || l.starts_with("poor") || l.starts_with("worn") => {
                Some(&"Fair")
            }
            _ => None,
        });
    let base = grade.map(|g| g.to_string()).unwrap_or(base);
    Some(match note {
        Some(note) => format!("{base} ({note})"),
        None => base,
    })
}

/// Splits `Good (small stain)` into `("Good", Some("small stain"))`.
pub fn split_note(value: &str) -> (String, Option<String>) {
    let trimmed = value.trim();
    if trimmed.ends_with(')')
        && let Some(open) = trimmed.find('(')
    {
        let base = trimmed[..open].trim().to_string();
        let note = trimmed[open + 1..trimmed.len() - 1].trim().to_string();
        let note = (!note.is_empty()).then_some(note);
        return (base, note);
    }
    (trimmed.to_string(), None)
}

/// Cleans a generated description line by line. Structured-block lines
/// whose value is empty after sanitizing are removed entirely.
pub fn sanitize_description(text: &str) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let cleaned = match LABELLED_LINE.captures(line) {
            Some(caps) => {
                let label = caps[1].trim();
                let value = sanitize_value(&sanitize_text(&caps[2]));
                match value {
                    Some(value) => format!("{label}: {value}"),
                    None if is_structured_label(label) => continue,
                    None => format!("{label}:"),
                }
            }
            None => sanitize_line(line),
        };
        let blank = cleaned.trim().is_empty();
        let previous_blank = lines.last().is_some_and(|prev| prev.trim().is_empty());
        if blank && (previous_blank || lines.is_empty()) {
            continue;
        }
        lines.push(if blank { String::new() } else { cleaned });
    }
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    let joined = lines.join("\n");
    sanitize_value(&joined)
}

fn is_structured_label(label: &str) -> bool {
    let lowered = label.to_lowercase();
    STRUCTURED_LABELS.iter().any(|known| *known == lowered)
}
