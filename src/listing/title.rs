//! Marketplace title composition under a hard character budget.

use crate::listing::attributes::ProductAttributes;
use crate::listing::sanitize::{normalize_size, sanitize_opt, sanitize_text, sanitize_value};
use once_cell::sync::Lazy;
use regex::Regex;

pub const MAX_TITLE_CHARS: usize = 80;
/// Model titles shorter than this are padded out by the build path.
pub const SPARSE_TITLE_CHARS: usize = 50;
const MAX_SIZE_CHARS: usize = 12;
const MAX_MATERIAL_CHARS: usize = 15;

pub const BANNED_CHARS: [char; 6] = [',', '-', '–', '—', ':', ';'];

static DANGLING_SIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bsize\s+(?:null|undefined)\b").expect("dangling size regex")
});
static TRAILING_SIZE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)\s*\bsize\s+(?:x{0,3}[sml]|\dxl|\d{1,2}(?:\.\d)?|os|one\s+size",
        r"|small|medium|large|extra\s+(?:small|large))\s*$",
    ))
    .expect("trailing size regex")
});
static SIZE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^size\s+").expect("size prefix regex"));
static MATERIAL_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)100\s*%|\bblend(?:ed)?\b").expect("material noise regex"));

const NO_OP_PATTERNS: &[&str] = &["solid", "plain", "basic", "none", "no pattern"];
const FITS: &[(&str, &str)] = &[
    ("oversized", "Oversized"),
    ("slim", "Slim"),
    ("boxy", "Boxy"),
    ("relaxed", "Relaxed"),
];
/// Keyword needles and the title word each one produces.
const NECKLINES: &[(&[&str], &str)] = &[
    (&["quarter zip", "1/4 zip", "quarter-zip"], "Quarter Zip"),
    (&["half zip", "1/2 zip", "half-zip"], "Half Zip"),
    (&["mock neck", "mockneck", "mock-neck"], "Mock Neck"),
    (&["turtleneck", "turtle neck"], "Turtleneck"),
    (&["v-neck", "v neck", "vneck"], "V Neck"),
    (&["crewneck", "crew neck", "crew-neck"], "Crewneck"),
    (&["collared", "collar"], "Collared"),
    (&["hooded", "hoodie"], "Hooded"),
    (&["polo"], "Polo"),
];

/// Builds the final title from an optional model title and the resolved
/// fields. Returns `None` when nothing usable is left.
pub fn compose(model_title: Option<&str>, fields: &ProductAttributes) -> Option<String> {
    let suffix = resolved_size(fields).map(|size| format!("Size {size}"));
    let built = fit(&build_body(fields), suffix.as_deref());

    let title = match model_title.map(repair_body) {
        Some(body) if !body.is_empty() => {
            let repaired = fit(&body, suffix.as_deref());
            if char_len(&repaired) < SPARSE_TITLE_CHARS && char_len(&built) > char_len(&repaired) {
                built
            } else {
                repaired
            }
        }
        _ => built,
    };
    let title = sanitize_text(&title);
    (!title.is_empty()).then_some(title)
}

/// Label size first, then recommended size. Anything long enough to be a
/// sentence rather than a size is ignored.
pub fn resolved_size(fields: &ProductAttributes) -> Option<String> {
    [fields.size_label.as_deref(), fields.size_recommended.as_deref()]
        .into_iter()
        .find_map(|raw| {
            let raw = raw.map(|value| SIZE_PREFIX.replace(value.trim(), "").into_owned());
            let size = normalize_size(raw.as_deref())?;
            let size = sanitize_text(&strip_banned(&size));
            (!size.is_empty() && char_len(&size) <= MAX_SIZE_CHARS).then_some(size)
        })
}

fn repair_body(title: &str) -> String {
    let without_dangling = DANGLING_SIZE.replace_all(title, "");
    let cleaned = sanitize_text(&strip_banned(&without_dangling));
    TRAILING_SIZE.replace(&cleaned, "").trim().to_string()
}

fn build_body(fields: &ProductAttributes) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut push = |value: Option<String>| {
        if let Some(value) = value.map(|v| sanitize_text(&strip_banned(&v)))
            && !value.is_empty()
            && !parts.iter().any(|seen| seen.eq_ignore_ascii_case(&value))
        {
            parts.push(value);
        }
    };

    push(sanitize_opt(fields.brand.as_deref()));
    push(fields.era.as_deref().and_then(era_word));
    push(fields.department.as_deref().and_then(department_word));
    push(sanitize_opt(fields.colour_main.as_deref()));
    push(sanitize_opt(fields.colour_secondary.as_deref()));
    push(
        sanitize_opt(fields.pattern.as_deref())
            .filter(|pattern| !NO_OP_PATTERNS.contains(&pattern.to_lowercase().as_str())),
    );
    push(neckline_word(fields));
    push(fields.material.as_deref().and_then(material_word));
    push(fields.fit.as_deref().and_then(fit_word));
    push(sanitize_opt(fields.garment_type.as_deref()));
    parts.join(" ")
}

fn era_word(era: &str) -> Option<String> {
    let lowered = era.to_lowercase();
    let word = if lowered.contains("y2k") || lowered.contains("2000") {
        "Y2K"
    } else if lowered.contains("90") || lowered.contains("nineties") {
        "90s"
    } else if lowered.contains("80") || lowered.contains("eighties") {
        "80s"
    } else if lowered.contains("vintage") {
        "Vintage"
    } else {
        return None;
    };
    Some(word.to_string())
}

fn department_word(department: &str) -> Option<String> {
    let lowered = department.trim().to_lowercase();
    let word = if ["women", "woman", "ladies", "female"]
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        "Womens"
    } else if ["men", "man", "male"]
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        "Mens"
    } else if lowered.starts_with("unisex") {
        "Unisex"
    } else {
        return None;
    };
    Some(word.to_string())
}

fn neckline_word(fields: &ProductAttributes) -> Option<String> {
    let garment = fields
        .garment_type
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    let haystack = [
        fields.pattern.as_deref(),
        fields.style.as_deref(),
        fields.garment_type.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ")
    .to_lowercase();

    NECKLINES
        .iter()
        .find(|(needles, _)| needles.iter().any(|needle| haystack.contains(needle)))
        .filter(|(needles, _)| !needles.iter().any(|needle| garment.contains(needle)))
        .map(|(_, word)| word.to_string())
}

fn material_word(material: &str) -> Option<String> {
    let stripped = MATERIAL_NOISE.replace_all(material, "");
    let cleaned = sanitize_value(&sanitize_text(&stripped))?;
    (char_len(&cleaned) <= MAX_MATERIAL_CHARS).then_some(cleaned)
}

fn fit_word(fit: &str) -> Option<String> {
    let lowered = fit.to_lowercase();
    FITS.iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, word)| word.to_string())
}

/// Joins body and size suffix within the budget, dropping trailing body
/// words first.
fn fit(body: &str, suffix: Option<&str>) -> String {
    let reserved = suffix.map(|s| char_len(s) + 1).unwrap_or(0);
    let budget = MAX_TITLE_CHARS.saturating_sub(reserved);
    let body = truncate_words(body, budget);
    match (body.is_empty(), suffix) {
        (_, None) => body,
        (true, Some(suffix)) => suffix.to_string(),
        (false, Some(suffix)) => format!("{body} {suffix}"),
    }
}

fn truncate_words(text: &str, budget: usize) -> String {
    let mut words: Vec<&str> = text.split_whitespace().collect();
    while words.len() > 1 && char_len(&words.join(" ")) > budget {
        words.pop();
    }
    let joined = words.join(" ");
    if char_len(&joined) <= budget {
        joined
    } else {
        joined.chars().take(budget).collect::<String>().trim_end().to_string()
    }
}

fn strip_banned(text: &str) -> String {
    text.chars()
        .map(|ch| if BANNED_CHARS.contains(&ch) { ' ' } else { ch })
        .collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
