use crate::listing::attributes::{Field, OcrText, ProductAttributes, TagKind, format_number};
use crate::listing::sanitize::sanitize_value;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

pub const OCR_SYSTEM: &str = "You transcribe text from photos of vintage clothing. \
Reply with a single JSON object and nothing else.";

pub const OCR_INSTRUCTION: &str = "Read every sewn-in label, care tag and handwritten or printed \
measurement sign in these photos. Return {\"label_text\": string, \"measurement_text\": string}. \
Copy the text exactly as written. Use \"not visible\" for a blob you cannot see.";

pub const LISTING_SYSTEM: &str = "You write resale listings for vintage clothing. \
Reply with a single JSON object using exactly the requested keys. \
Use null for anything you cannot determine; never guess brands or sizes.";

pub const VOICE_SYSTEM: &str = "You turn a seller's spoken notes about one vintage garment into \
structured fields. The transcript comes from speech recognition and is often garbled. \
Reply with a single JSON object containing only the fields the seller actually mentioned.";

const VOICE_RULES: &str = "\
Rules:
- Infer intent from near-miss words: \"common\" or \"condish\" means condition, \
\"pit\" or \"pits\" followed by a number means pit_to_pit, \"tag says\" introduces size_label.
- A number followed by \"inches\" with no other context is pit_to_pit.
- condition must be one of Excellent, Very good, Good, Fair.
- New damage (stains, holes, fading) goes in flaws. Do not rewrite the existing condition.
- \"use style A\" or \"use style B\" sets active_style to \"A\" or \"B\".
- Anything after \"for the description\" goes verbatim in description_append.
- price is a number without currency symbols.
- Allowed keys: brand, garment_type, department, era, condition, flaws, colour_main, \
colour_secondary, pattern, material, made_in, fit, size_label, size_recommended, pit_to_pit, \
style, price, active_style, description_append.";

const STRUCTURED_BLOCK: &str = "\
End each description with this block, one line each, omitting lines you have no value for:
Brand: / Label Size: / Pit to Pit: / Material: / Era: / Made in: / Colour: \
/ Pattern: / Style: / Flaws:";

const TITLE_RULES: &str = "\
The title must be at most 80 characters, contain no commas, hyphens, dashes, colons or \
semicolons, and end with \"Size <size>\" when the size is known.";

/// Narrows a generation to marketplace copy only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegenerateOnly {
    Title,
    StyleA,
    StyleB,
    All,
}

impl RegenerateOnly {
    pub fn fields(self) -> &'static [Field] {
        match self {
            RegenerateOnly::Title => &[Field::Title],
            RegenerateOnly::StyleA => &[Field::DescriptionStyleA],
            RegenerateOnly::StyleB => &[Field::DescriptionStyleB],
            RegenerateOnly::All => &[
                Field::Title,
                Field::DescriptionStyleA,
                Field::DescriptionStyleB,
            ],
        }
    }

    pub fn includes_tags(self) -> bool {
        matches!(self, RegenerateOnly::All)
    }
}

/// Known caller values, one line per set field. Never emits placeholders.
pub fn context_block(attributes: &ProductAttributes) -> Option<String> {
    let mut lines: Vec<String> = attributes
        .set_fields()
        .filter(|(field, _)| !field.is_copy())
        .filter_map(|(field, value)| {
            sanitize_value(value).map(|value| format!("- {}: {value}", field.label()))
        })
        .collect();
    if let Some(price) = attributes.price.filter(|price| *price > 0.0) {
        lines.push(format!("- Price: {}", format_number(price)));
    }
    if lines.is_empty() {
        None
    } else {
        Some(format!("Known details from the seller:\n{}", lines.join("\n")))
    }
}

pub fn generation_prompt(
    attributes: &ProductAttributes,
    regenerate_only: Option<RegenerateOnly>,
    ocr: &OcrText,
    transcribe_in_call: bool,
) -> String {
    let mut prompt = String::new();
    if let Some(context) = context_block(attributes) {
        let _ = writeln!(prompt, "{context}\n");
    }
    if let Some(label) = ocr.label_text.as_deref() {
        let _ = writeln!(prompt, "Label transcription: {label}");
    }
    if let Some(measurement) = ocr.measurement_text.as_deref() {
        let _ = writeln!(prompt, "Measurement transcription: {measurement}");
    }
    if !ocr.is_empty() {
        prompt.push('\n');
    }

    match regenerate_only {
        Some(target) => {
            let mut keys: Vec<&str> = target.fields().iter().map(|field| field.key()).collect();
            if target.includes_tags() {
                keys.extend(TagKind::ALL.iter().map(|kind| kind.key()));
            }
            let _ = writeln!(
                prompt,
                "Rewrite only the following keys and return them as JSON: {}.",
                keys.join(", ")
            );
            if target.fields().contains(&Field::Title) {
                let _ = writeln!(prompt, "{TITLE_RULES}");
            }
            if target.fields().iter().any(|field| field.is_description()) {
                let _ = writeln!(prompt, "{STRUCTURED_BLOCK}");
            }
        }
        None => {
            let mut keys: Vec<&str> = Field::ALL.iter().map(|field| field.key()).collect();
            keys.push("price");
            keys.extend(TagKind::ALL.iter().map(|kind| kind.key()));
            if transcribe_in_call {
                keys.push("ocr_text");
            }
            let _ = writeln!(
                prompt,
                "Describe the garment in the photos. Return JSON with these keys: {}.",
                keys.join(", ")
            );
            if transcribe_in_call {
                let _ = writeln!(
                    prompt,
                    "ocr_text is {{\"label_text\": string, \"measurement_text\": string}} with the \
                     raw text of any labels and measurement signs, or \"not visible\"."
                );
            }
            let _ = writeln!(
                prompt,
                "condition is one of Excellent, Very good, Good, Fair. \
                 Tags are arrays of short strings."
            );
            let _ = writeln!(
                prompt,
                "description_style_a is warm and story-led; \
                 description_style_b is brief and factual."
            );
            let _ = writeln!(prompt, "{TITLE_RULES}");
            let _ = writeln!(prompt, "{STRUCTURED_BLOCK}");
        }
    }
    prompt
}

pub fn voice_prompt(transcript: &str, existing_condition: Option<&str>) -> String {
    let mut prompt = String::from(VOICE_RULES);
    if let Some(condition) = existing_condition {
        let _ = write!(prompt, "\n\nCurrent condition on record: {condition}");
    }
    let _ = write!(prompt, "\n\nTranscript:\n{transcript}");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_lists_only_set_fields() {
        let attrs = ProductAttributes {
            brand: Some("Levi's".into()),
            material: Some("Unknown".into()),
            made_in: Some("N/A".into()),
            era: Some("  ".into()),
            title: Some("Old title".into()),
            price: Some(40.0),
            ..Default::default()
        };
        let block = context_block(&attrs).expect("context");
        assert!(block.contains("- Brand: Levi's"));
        assert!(block.contains("- Price: 40"));
        assert!(!block.contains("Era"));
        assert!(!block.contains("Old title"));
        assert!(!block.to_lowercase().contains("unknown"));
        assert!(!block.contains("Material"));
        assert!(!block.contains("Made in"));
        assert_eq!(context_block(&ProductAttributes::default()), None);
    }

    #[test]
    fn narrowed_prompt_requests_only_target_keys() {
        let prompt = generation_prompt(
            &ProductAttributes::default(),
            Some(RegenerateOnly::StyleB),
            &OcrText::default(),
            false,
        );
        assert!(prompt.contains(
            "Rewrite only the following keys and return them as JSON: description_style_b."
        ));
        assert!(!prompt.contains("ocr_text"));
    }

    #[test]
    fn single_call_prompt_asks_for_transcription() {
        let prompt =
            generation_prompt(&ProductAttributes::default(), None, &OcrText::default(), true);
        assert!(prompt.contains("ocr_text"));
        assert!(prompt.contains("pit_to_pit"));
    }
}
