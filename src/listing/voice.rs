//! Spoken notes to partial attributes.
//!
//! The phonetic guesswork stays with the model; this side bounds the input,
//! cleans the reply and merges flaws into the condition note.

use crate::listing::attributes::{
    Field, ProductAttributes, RawObject, price_from_value, text_from_value,
};
use crate::listing::ocr::pit_to_pit_from;
use crate::listing::prompts;
use crate::listing::repair::repair;
use crate::listing::sanitize::{normalize_size, sanitize_value, snap_condition, split_note};
use crate::llm::{CompletionOptions, ContentPart, ModelClient};
use crate::pipeline::PipelineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const MIN_TRANSCRIPT_CHARS: usize = 2;
pub const MAX_TRANSCRIPT_CHARS: usize = 2000;

/// Fields a seller can set by voice. Copy fields are regenerated instead.
const VOICE_FIELDS: [Field; 15] = [
    Field::Brand,
    Field::GarmentType,
    Field::Department,
    Field::Era,
    Field::Condition,
    Field::ColourMain,
    Field::ColourSecondary,
    Field::Pattern,
    Field::Material,
    Field::MadeIn,
    Field::Fit,
    Field::SizeLabel,
    Field::SizeRecommended,
    Field::PitToPit,
    Field::Style,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DescriptionStyle {
    #[default]
    A,
    B,
}

impl DescriptionStyle {
    pub fn field(self) -> Field {
        match self {
            DescriptionStyle::A => Field::DescriptionStyleA,
            DescriptionStyle::B => Field::DescriptionStyleB,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_lowercase();
        match lowered.trim_start_matches("style").trim_start_matches(['_', ' ']) {
            "a" => Some(DescriptionStyle::A),
            "b" => Some(DescriptionStyle::B),
            _ => None,
        }
    }
}

/// Only keys the seller actually mentioned are present.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VoiceUpdate {
    #[serde(flatten)]
    pub fields: BTreeMap<Field, String>,
    pub flaws: Option<String>,
    pub price: Option<f64>,
    pub active_style: Option<DescriptionStyle>,
    pub description_append: Option<String>,
}

impl VoiceUpdate {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
            && self.flaws.is_none()
            && self.price.is_none()
            && self.active_style.is_none()
            && self.description_append.is_none()
    }

    /// Writes the detected values onto a record. Appended description text
    /// goes to the style selected in this update, else `active_style`.
    /// Returns the style that ends up active.
    pub fn apply_to(
        &self,
        attributes: &mut ProductAttributes,
        active_style: DescriptionStyle,
    ) -> DescriptionStyle {
        for (field, value) in &self.fields {
            attributes.set(*field, Some(value.clone()));
        }
        if let Some(flaws) = &self.flaws {
            attributes.flaws = Some(flaws.clone());
        }
        if let Some(price) = self.price {
            attributes.price = Some(price);
        }
        let style = self.active_style.unwrap_or(active_style);
        if let Some(append) = &self.description_append {
            let merged = match attributes.get(style.field()) {
                Some(existing) if !existing.trim().is_empty() => {
                    format!("{}\n\n{append}", existing.trim_end())
                }
                _ => append.clone(),
            };
            attributes.set(style.field(), Some(merged));
        }
        style
    }
}

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub max_tokens: u32,
    pub model: Option<String>,
}

impl VoiceConfig {
    pub fn from_env() -> Self {
        Self {
            max_tokens: 500,
            model: std::env::var("VOICE_MODEL").ok(),
        }
    }
}

pub struct VoiceFieldParser<'a> {
    model: &'a dyn ModelClient,
    config: &'a VoiceConfig,
}

impl<'a> VoiceFieldParser<'a> {
    pub fn new(model: &'a dyn ModelClient, config: &'a VoiceConfig) -> Self {
        Self { model, config }
    }

    pub async fn parse(
        &self,
        transcript: &str,
        existing_condition: Option<&str>,
    ) -> Result<VoiceUpdate, PipelineError> {
        let transcript = transcript.trim();
        let len = transcript.chars().count();
        if !(MIN_TRANSCRIPT_CHARS..=MAX_TRANSCRIPT_CHARS).contains(&len) {
            return Err(PipelineError::invalid_input(
                "voice_parse",
                format!(
                    "transcript must be {MIN_TRANSCRIPT_CHARS} to {MAX_TRANSCRIPT_CHARS} characters"
                ),
            ));
        }
        let existing_condition = existing_condition.and_then(sanitize_value);

        let content = [ContentPart::text(prompts::voice_prompt(
            transcript,
            existing_condition.as_deref(),
        ))];
        let options = CompletionOptions::json(self.config.max_tokens, self.config.model.clone());
        let reply = self
            .model
            .complete(prompts::VOICE_SYSTEM, &content, &options)
            .await;
        crate::metrics::model_call("voice", reply.is_ok());
        let raw = reply.map_err(|err| PipelineError::from_model("voice_parse", &err))?;

        let Ok(object) = repair(&raw) else {
            warn!(target = "relist.voice", "voice_reply_unparseable");
            return Ok(VoiceUpdate::default());
        };
        let update = read_update(&object, existing_condition.as_deref());
        info!(
            target = "relist.voice",
            fields = update.fields.len(),
            append = update.description_append.is_some(),
            "voice_parsed"
        );
        Ok(update)
    }
}

fn read_update(object: &RawObject, existing_condition: Option<&str>) -> VoiceUpdate {
    let mut update = VoiceUpdate::default();
    for field in VOICE_FIELDS {
        let Some(value) = text_from_value(object.get(field.key())).and_then(|v| sanitize_value(&v))
        else {
            continue;
        };
        let value = match field {
            Field::Condition => snap_condition(&value),
            Field::SizeLabel | Field::SizeRecommended => normalize_size(Some(&value)),
            Field::PitToPit => pit_to_pit_from(&value),
            _ => Some(value),
        };
        if let Some(value) = value {
            update.fields.insert(field, value);
        }
    }

    update.flaws = text_from_value(object.get(Field::Flaws.key())).and_then(|v| sanitize_value(&v));
    if let Some(flaws) = &update.flaws {
        let base = update
            .fields
            .get(&Field::Condition)
            .map(String::as_str)
            .or(existing_condition);
        if let Some(merged) = base.map(|base| with_flaw_note(base, flaws)) {
            update.fields.insert(Field::Condition, merged);
        }
    }

    update.price = price_from_value(object.get("price")).filter(|price| *price > 0.0);
    update.active_style = object
        .get("active_style")
        .and_then(Value::as_str)
        .and_then(DescriptionStyle::parse);
    update.description_append = object
        .get("description_append")
        .and_then(Value::as_str)
        .and_then(sanitize_value);
    update
}

/// `Good` + `small stain` -> `Good (small stain)`; an existing note is
/// extended rather than replaced.
fn with_flaw_note(condition: &str, flaws: &str) -> String {
    let (grade, note) = split_note(condition);
    match note {
        Some(note) if note.to_lowercase().contains(&flaws.to_lowercase()) => {
            format!("{grade} ({note})")
        }
        Some(note) => format!("{grade} ({note}, {flaws})"),
        None => format!("{grade} ({flaws})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelError;
    use crate::llm::scripted::ScriptedModel;
    use crate::pipeline::PipelineErrorKind;

    fn config() -> VoiceConfig {
        VoiceConfig {
            max_tokens: 500,
            model: None,
        }
    }

    #[tokio::test]
    async fn rejects_out_of_range_transcripts_before_calling_model() {
        let model = ScriptedModel::always("{}");
        let config = config();
        let parser = VoiceFieldParser::new(&model, &config);

        let short = parser.parse("  a ", None).await.expect_err("too short");
        assert_eq!(short.kind(), PipelineErrorKind::InvalidInput);
        let long = parser
            .parse(&"x".repeat(MAX_TRANSCRIPT_CHARS + 1), None)
            .await
            .expect_err("too long");
        assert_eq!(long.kind(), PipelineErrorKind::InvalidInput);
        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    async fn detected_fields_are_cleaned_and_flaws_merged() {
        let model = ScriptedModel::always(
            r#"{"condition": "very good", "pit_to_pit": "23", "size_label": "large",
                "brand": null, "flaws": "small hole on sleeve", "active_style": "B",
                "description_append": "Great for layering", "price": "$45"}"#,
        );
        let config = config();
        let update = VoiceFieldParser::new(&model, &config)
            .parse("common very good pits twenty three tag says large", Some("Good"))
            .await
            .expect("parsed");

        assert_eq!(
            update.fields.get(&Field::Condition).map(String::as_str),
            Some("Very good (small hole on sleeve)")
        );
        assert_eq!(update.fields.get(&Field::PitToPit).map(String::as_str), Some("23 inches"));
        assert_eq!(update.fields.get(&Field::SizeLabel).map(String::as_str), Some("L"));
        assert!(!update.fields.contains_key(&Field::Brand));
        assert_eq!(update.price, Some(45.0));
        assert_eq!(update.active_style, Some(DescriptionStyle::B));

        let json = serde_json::to_value(&update).expect("serialize");
        assert_eq!(json["pit_to_pit"], "23 inches");
        assert!(json.get("brand").is_none());
        assert!(json.get("era").is_none());

        let call = &model.calls()[0];
        assert!(call.text.contains("Current condition on record: Good"));
        assert!(call.options.json_mode);
        assert_eq!(call.options.max_tokens, 500);
    }

    #[tokio::test]
    async fn flaws_extend_an_existing_note() {
        let model = ScriptedModel::always(r#"{"flaws": "small hole"}"#);
        let config = config();
        let update = VoiceFieldParser::new(&model, &config)
            .parse("there's a small hole", Some("Good (faded)"))
            .await
            .expect("parsed");
        assert_eq!(
            update.fields.get(&Field::Condition).map(String::as_str),
            Some("Good (faded, small hole)")
        );
    }

    #[tokio::test]
    async fn unparseable_reply_detects_nothing() {
        let model = ScriptedModel::always("sorry, I could not hear that");
        let config = config();
        let update = VoiceFieldParser::new(&model, &config)
            .parse("mumble mumble", None)
            .await
            .expect("parsed");
        assert!(update.is_empty());
    }

    #[tokio::test]
    async fn rate_limit_is_surfaced() {
        let model = ScriptedModel::failing(ModelError::RateLimited {
            retry_after_secs: Some(3),
        });
        let config = config();
        let err = VoiceFieldParser::new(&model, &config)
            .parse("brand levis", None)
            .await
            .expect_err("rate limited");
        assert_eq!(err.kind(), PipelineErrorKind::RateLimited);
    }

    #[test]
    fn apply_appends_to_the_active_style() {
        let mut attrs = ProductAttributes {
            description_style_a: Some("Story copy.".into()),
            description_style_b: Some("Short copy.".into()),
            ..Default::default()
        };
        let update = VoiceUpdate {
            description_append: Some("Great for layering.".into()),
            ..Default::default()
        };
        let style = update.apply_to(&mut attrs, DescriptionStyle::B);
        assert_eq!(style, DescriptionStyle::B);
        assert_eq!(
            attrs.description_style_b.as_deref(),
            Some("Short copy.\n\nGreat for layering.")
        );
        assert_eq!(attrs.description_style_a.as_deref(), Some("Story copy."));

        let switch = VoiceUpdate {
            active_style: Some(DescriptionStyle::A),
            description_append: Some("Fits boxy.".into()),
            ..Default::default()
        };
        assert_eq!(switch.apply_to(&mut attrs, style), DescriptionStyle::A);
        assert_eq!(
            attrs.description_style_a.as_deref(),
            Some("Story copy.\n\nFits boxy.")
        );
    }
}
