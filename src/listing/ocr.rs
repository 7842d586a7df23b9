//! Label and measurement transcription.
//!
//! Small image sets ride along with the main generation call. Large sets
//! go through a chunked OCR-only pre-pass that stops as soon as both blobs
//! have been seen.

use crate::listing::attributes::{OcrText, format_number};
use crate::listing::images::{ImageHints, ImageRef};
use crate::listing::prompts;
use crate::listing::repair::repair;
use crate::listing::sanitize::normalize_size;
use crate::llm::{CompletionOptions, ContentPart, ModelClient};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

pub const NOT_VISIBLE: &str = "not visible";

static PIT_PREFIXED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)(?:pit\s*(?:to|2|-)?\s*pit|p2p|ptp)\s*[:=\-]?\s*",
        r#"(\d{1,3}(?:[.,]\d{1,2})?)\s*(?:inches|inch|in\b|"|”)?"#,
    ))
    .expect("pit prefixed regex")
});
static PIT_BARE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(\d{1,3}(?:[.,]\d{1,2})?)\s*(?:inches|inch|in\b|"|”)?"#)
        .expect("pit bare regex")
});
static SIZE_PREFIXED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bsize\s*[:\-]?\s*(XXXL|XXL|XL|XXS|XS|2XL|3XL|S|M|L|\d{1,2})\b")
        .expect("size prefixed regex")
});
static SIZE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(XXXL|XXL|XL|XXS|XS|2XL|3XL|S|M|L)\b").expect("size token regex")
});
static SIZE_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(extra\s+small|extra\s+large|small|medium|large)\b")
        .expect("size word regex")
});
static SIZE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})\b").expect("size number regex"));

/// The whole blob says nothing was readable, e.g. `not visible` or
/// `label not visible.`; a real transcription mentioning it is kept.
pub fn is_not_visible(text: &str) -> bool {
    let lowered = text.trim().trim_end_matches('.').trim().to_lowercase();
    lowered.starts_with(NOT_VISIBLE)
        || (lowered.ends_with(NOT_VISIBLE) && lowered.split_whitespace().count() <= 4)
}

fn has_content(blob: Option<&str>) -> bool {
    blob.is_some_and(|text| !text.trim().is_empty() && !is_not_visible(text))
}

#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub images_per_call: usize,
    pub single_call_max: usize,
    pub max_tokens: u32,
    pub model: Option<String>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            images_per_call: 4,
            single_call_max: 9,
            max_tokens: 600,
            model: None,
        }
    }
}

impl OcrConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            images_per_call: env_usize("IMAGES_PER_CALL").unwrap_or(defaults.images_per_call),
            single_call_max: env_usize("OCR_SINGLE_CALL_MAX").unwrap_or(defaults.single_call_max),
            max_tokens: defaults.max_tokens,
            model: std::env::var("LISTING_MODEL").ok(),
        }
    }

    pub fn mode_for(&self, image_count: usize) -> OcrMode {
        if image_count > self.single_call_max {
            OcrMode::Chunked
        } else {
            OcrMode::SingleCall
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v >= 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrMode {
    SingleCall,
    Chunked,
}

/// Outcome of a chunked pre-pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OcrPass {
    pub text: OcrText,
    pub hints: ImageHints,
    pub chunks_run: usize,
    pub chunks_failed: usize,
}

impl OcrPass {
    pub fn complete(&self) -> bool {
        has_content(self.text.label_text.as_deref())
            && has_content(self.text.measurement_text.as_deref())
    }
}

pub struct OcrExtractor<'a> {
    model: &'a dyn ModelClient,
    config: &'a OcrConfig,
}

impl<'a> OcrExtractor<'a> {
    pub fn new(model: &'a dyn ModelClient, config: &'a OcrConfig) -> Self {
        Self { model, config }
    }

    /// Runs the OCR-only prompt over fixed-size image groups in order.
    /// Failed chunks are skipped; the pass never fails as a whole.
    pub async fn extract(&self, images: &[ImageRef]) -> OcrPass {
        let per_call = self.config.images_per_call.max(1);
        let options = CompletionOptions::json(self.config.max_tokens, self.config.model.clone());
        let mut labels: Vec<String> = Vec::new();
        let mut measurements: Vec<String> = Vec::new();
        let mut pass = OcrPass::default();

        for (chunk_index, chunk) in images.chunks(per_call).enumerate() {
            pass.chunks_run += 1;
            let mut content = vec![ContentPart::text(prompts::OCR_INSTRUCTION)];
            content.extend(chunk.iter().map(|image| ContentPart::image(image.url())));

            let reply = self
                .model
                .complete(prompts::OCR_SYSTEM, &content, &options)
                .await;
            crate::metrics::model_call("ocr", reply.is_ok());
            let raw = match reply {
                Ok(raw) => raw,
                Err(err) => {
                    pass.chunks_failed += 1;
                    warn!(
                        target = "relist.ocr",
                        chunk = chunk_index,
                        error = %err,
                        "ocr_chunk_failed"
                    );
                    continue;
                }
            };
            let Ok(object) = repair(&raw) else {
                pass.chunks_failed += 1;
                warn!(target = "relist.ocr", chunk = chunk_index, "ocr_chunk_unparseable");
                continue;
            };

            let found = OcrText::from_object(&object);
            let first_image = chunk_index * per_call;
            if let Some(label) = found.label_text {
                pass.hints.label_index.get_or_insert(first_image);
                labels.push(label);
            }
            if let Some(measurement) = found.measurement_text {
                pass.hints.measurement_index.get_or_insert(first_image);
                measurements.push(measurement);
            }

            pass.text = OcrText {
                label_text: join_blobs(&labels),
                measurement_text: join_blobs(&measurements),
            };
            if pass.complete() {
                debug!(target = "relist.ocr", chunk = chunk_index, "ocr_early_exit");
                break;
            }
        }
        pass
    }
}

fn join_blobs(parts: &[String]) -> Option<String> {
    (!parts.is_empty()).then(|| parts.join(" | "))
}

/// Pit-to-pit from a measurement blob, as `"<n> inches"`.
pub fn pit_to_pit_from(text: &str) -> Option<String> {
    let caps = PIT_PREFIXED
        .captures(text)
        .or_else(|| PIT_BARE.captures(text))?;
    let number = caps[1].replace(',', ".").parse::<f64>().ok()?;
    (number > 0.0).then(|| format!("{} inches", format_number(number)))
}

/// Label size from a label blob, uppercased. A `size`-prefixed token wins.
pub fn size_label_from(text: &str) -> Option<String> {
    if let Some(caps) = SIZE_PREFIXED.captures(text) {
        return Some(caps[1].to_uppercase());
    }
    if let Some(found) = SIZE_TOKEN
        .find_iter(text)
        .find(|m| standalone(text, m.start(), m.end()))
    {
        return Some(found.as_str().to_uppercase());
    }
    if let Some(found) = SIZE_WORD.find(text) {
        return normalize_size(Some(found.as_str()));
    }
    SIZE_NUMBER
        .find_iter(text)
        .find(|m| standalone(text, m.start(), m.end()))
        .map(|m| m.as_str().to_string())
}

/// Rejects matches glued to an apostrophe, a decimal point or a percent
/// sign, e.g. the `s` in `Levi's` or the `60` in `60% cotton`.
fn standalone(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !matches!(before, Some('\'' | '’' | '.'))
        && !matches!(after, Some('\'' | '’' | '.' | '%'))
        && !text[end..].trim_start().starts_with('%')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelError;
    use crate::llm::scripted::ScriptedModel;

    fn images(count: usize) -> Vec<ImageRef> {
        (0..count)
            .map(|i| ImageRef::Url(format!("https://img.test/{i}.jpg")))
            .collect()
    }

    #[test]
    fn mode_switches_above_threshold() {
        let config = OcrConfig::default();
        assert_eq!(config.mode_for(9), OcrMode::SingleCall);
        assert_eq!(config.mode_for(10), OcrMode::Chunked);
    }

    #[test]
    fn pit_to_pit_examples() {
        assert_eq!(pit_to_pit_from("Pit to Pit: 24").as_deref(), Some("24 inches"));
        assert_eq!(pit_to_pit_from("PTP 22.5\"").as_deref(), Some("22.5 inches"));
        assert_eq!(pit_to_pit_from("p2p=21 in").as_deref(), Some("21 inches"));
        assert_eq!(pit_to_pit_from("23 inches").as_deref(), Some("23 inches"));
        assert_eq!(pit_to_pit_from("no digits here"), None);
    }

    #[test]
    fn size_label_examples() {
        assert_eq!(size_label_from("Levi's | Made in USA | Size: l").as_deref(), Some("L"));
        assert_eq!(size_label_from("RN 1234 XL 100% cotton").as_deref(), Some("XL"));
        assert_eq!(size_label_from("Levi's 60% cotton Medium").as_deref(), Some("M"));
        assert_eq!(size_label_from("60% cotton 40% poly 12").as_deref(), Some("12"));
        assert_eq!(size_label_from("100% wool"), None);
    }

    #[test]
    fn not_visible_matches_the_whole_blob() {
        assert!(is_not_visible("Label NOT VISIBLE"));
        assert!(is_not_visible(" not visible. "));
        assert!(is_not_visible("Not visible in these photos"));
        assert!(!is_not_visible("Wrangler"));
        assert!(!is_not_visible("Levi's size M (care tag not visible)"));
        assert!(!is_not_visible("Levi's size M, care tag not visible"));
    }

    #[tokio::test]
    async fn chunked_pass_exits_early_once_both_blobs_found() {
        let model = ScriptedModel::new(|call| {
            if call.images[0].ends_with("/0.jpg") {
                Ok(r#"{"label_text": "Wrangler size M", "measurement_text": "not visible"}"#.into())
            } else {
                Ok(r#"{"label_text": "care tag", "measurement_text": "Pit to Pit: 24"}"#.into())
            }
        });
        let config = OcrConfig::default();
        let pass = OcrExtractor::new(&model, &config).extract(&images(12)).await;

        assert_eq!(model.calls().len(), 2);
        assert_eq!(pass.chunks_run, 2);
        assert_eq!(
            pass.text.label_text.as_deref(),
            Some("Wrangler size M | care tag")
        );
        assert_eq!(pass.text.measurement_text.as_deref(), Some("Pit to Pit: 24"));
        assert_eq!(pass.hints.label_index, Some(0));
        assert_eq!(pass.hints.measurement_index, Some(4));
    }

    #[tokio::test]
    async fn failed_chunks_are_skipped() {
        let model = ScriptedModel::new(|call| {
            if call.images[0].ends_with("/4.jpg") {
                Err(ModelError::Http("HTTP 502".into()))
            } else {
                Ok("not json at all".into())
            }
        });
        let config = OcrConfig::default();
        let pass = OcrExtractor::new(&model, &config).extract(&images(10)).await;
        assert_eq!(pass.chunks_run, 3);
        assert_eq!(pass.chunks_failed, 3);
        assert!(pass.text.is_empty());
    }
}
