use crate::listing::attributes::{
    Field, OcrText, ProductAttributes, TagKind, format_number, price_from_value, tags_from_value,
    text_from_value,
};
use crate::listing::images::{ImageRef, select_priority};
use crate::listing::ocr::{
    OcrConfig, OcrExtractor, OcrMode, OcrPass, pit_to_pit_from, size_label_from,
};
use crate::listing::prompts::{self, RegenerateOnly};
use crate::listing::provenance::{Candidates, Source, resolve};
use crate::listing::repair::repair;
use crate::listing::sanitize::{
    normalize_size, sanitize_description, sanitize_tags, sanitize_text, sanitize_value,
    snap_condition,
};
use crate::listing::title;
use crate::llm::{CompletionOptions, ContentPart, ModelClient, ModelError};
use crate::models::StageReport;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, env, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};

pub const MAX_URL_CHARS: usize = 2048;
pub const MAX_FIELD_CHARS: usize = 500;
pub const MAX_DESCRIPTION_CHARS: usize = 5000;
pub const MAX_TAGS: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub attributes: ProductAttributes,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub regenerate_only: Option<RegenerateOnly>,
}

/// Why a generation fell back to the all-unset bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Degraded {
    ModelUnavailable,
    Unparseable,
}

/// Diagnostics that travel with a result but are not part of the bundle.
#[derive(Debug, Clone, Default)]
pub struct GenerationReport {
    pub stages: Vec<StageReport>,
    pub sources: BTreeMap<Field, Source>,
    pub degraded: Option<Degraded>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    #[serde(flatten)]
    pub attributes: ProductAttributes,
    #[serde(skip)]
    pub report: GenerationReport,
}

impl GenerationResult {
    fn stub(ocr_text: OcrText, degraded: Degraded, stages: Vec<StageReport>) -> Self {
        Self {
            attributes: ProductAttributes {
                ocr_text,
                ..Default::default()
            },
            report: GenerationReport {
                stages,
                sources: BTreeMap::new(),
                degraded: Some(degraded),
            },
        }
    }

    pub fn source(&self, field: Field) -> Option<Source> {
        self.report.sources.get(&field).copied()
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub max_images: usize,
    pub max_tokens: u32,
    pub model: Option<String>,
    pub ocr: OcrConfig,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            max_images: 500,
            max_tokens: 2500,
            model: None,
            ocr: OcrConfig::default(),
        }
    }
}

impl GeneratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_images: env_number("MAX_IMAGES").unwrap_or(defaults.max_images),
            max_tokens: env_number("GENERATION_MAX_TOKENS").unwrap_or(defaults.max_tokens),
            model: env::var("LISTING_MODEL").ok(),
            ocr: OcrConfig::from_env(),
        }
    }
}

fn env_number<T: std::str::FromStr + PartialOrd + Default>(key: &str) -> Option<T> {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .filter(|v| *v > T::default())
}

#[derive(Clone)]
pub struct ListingGenerator {
    model: Arc<dyn ModelClient>,
    config: Arc<GeneratorConfig>,
}

impl ListingGenerator {
    pub fn new(model: Arc<dyn ModelClient>, config: GeneratorConfig) -> Self {
        Self {
            model,
            config: Arc::new(config),
        }
    }

    /// Produces a full bundle. Only shape violations and provider
    /// rate-limit or quota signals are returned as errors; every other
    /// failure degrades to the all-unset bundle.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, PipelineError> {
        validate(request, self.config.max_images)?;
        let mut stages = Vec::new();
        let images = &request.images;
        let mode = self.config.ocr.mode_for(images.len());
        let full = request.regenerate_only.is_none();

        let mut pass = OcrPass::default();
        if full && mode == OcrMode::Chunked {
            let started = Instant::now();
            pass = OcrExtractor::new(self.model.as_ref(), &self.config.ocr)
                .extract(images)
                .await;
            record_stage(
                &mut stages,
                "ocr",
                started,
                json!({
                    "chunks_run": pass.chunks_run,
                    "chunks_failed": pass.chunks_failed,
                    "complete": pass.complete(),
                }),
            );
        }

        let selected: Vec<String> = match mode {
            OcrMode::SingleCall => images
                .iter()
                .map(|image| image.url().to_string())
                .collect(),
            OcrMode::Chunked => {
                select_priority(images, self.config.ocr.images_per_call, pass.hints)
            }
        };
        let transcribe_in_call = full && mode == OcrMode::SingleCall && !images.is_empty();
        let prompt = prompts::generation_prompt(
            &request.attributes,
            request.regenerate_only,
            &pass.text,
            transcribe_in_call,
        );
        let mut content = vec![ContentPart::text(prompt)];
        content.extend(selected.iter().map(ContentPart::image));

        let started = Instant::now();
        let options = CompletionOptions::json(self.config.max_tokens, self.config.model.clone());
        let reply = self
            .model
            .complete(prompts::LISTING_SYSTEM, &content, &options)
            .await;
        crate::metrics::model_call("generate", reply.is_ok());
        let raw = match reply {
            Ok(raw) => raw,
            Err(err @ (ModelError::RateLimited { .. } | ModelError::QuotaExhausted)) => {
                return Err(PipelineError::from_model("generate", &err));
            }
            Err(err) => {
                warn!(target = "relist.pipeline", error = %err, "generation_degraded");
                return Ok(GenerationResult::stub(
                    pass.text,
                    Degraded::ModelUnavailable,
                    stages,
                ));
            }
        };
        record_stage(
            &mut stages,
            "generate",
            started,
            json!({ "images": selected.len(), "chars": raw.len() }),
        );

        let Ok(object) = repair(&raw) else {
            warn!(target = "relist.pipeline", chars = raw.len(), "generation_unparseable");
            return Ok(GenerationResult::stub(pass.text, Degraded::Unparseable, stages));
        };

        let ocr_text = if transcribe_in_call {
            OcrText::from_value(object.get("ocr_text"))
        } else {
            pass.text
        };

        let started = Instant::now();
        let (attributes, sources) = reconcile(request, &object, ocr_text);
        record_stage(
            &mut stages,
            "reconcile",
            started,
            json!({ "fields_set": sources.len() }),
        );
        info!(
            target = "relist.pipeline",
            images = images.len(),
            chunked = mode == OcrMode::Chunked,
            regenerate_only = ?request.regenerate_only,
            fields_set = sources.len(),
            "listing_generated"
        );

        Ok(GenerationResult {
            attributes,
            report: GenerationReport {
                stages,
                sources,
                degraded: None,
            },
        })
    }
}

/// Resolves every field through the provenance table, applies the regex
/// fallback, cleans values and composes the title.
fn reconcile(
    request: &GenerationRequest,
    object: &serde_json::Map<String, serde_json::Value>,
    ocr_text: OcrText,
) -> (ProductAttributes, BTreeMap<Field, Source>) {
    let caller = &request.attributes;
    let requested = |field: Field| {
        request
            .regenerate_only
            .is_none_or(|target| target.fields().contains(&field))
    };
    let regenerating = |field: Field| {
        request
            .regenerate_only
            .is_some_and(|target| target.fields().contains(&field))
    };

    let label = ocr_text.label_text.as_deref();
    let measurement = ocr_text.measurement_text.as_deref();
    let mut attributes = ProductAttributes::default();
    let mut sources = BTreeMap::new();

    for field in Field::ALL {
        let model_value = requested(field)
            .then(|| text_from_value(object.get(field.key())))
            .flatten()
            .and_then(|value| sanitize_value(&value));
        let caller_value = caller.get(field).and_then(sanitize_value);
        let caller_value = if regenerating(field) && model_value.is_some() {
            None
        } else {
            caller_value
        };
        let regex = match field {
            Field::PitToPit => measurement.and_then(pit_to_pit_from),
            Field::SizeLabel => label.and_then(size_label_from),
            _ => None,
        };
        let candidates = Candidates {
            caller: caller_value,
            regex,
            ..Default::default()
        }
        .with_model_value(field, model_value, label.is_some(), measurement.is_some());

        if let Some(resolved) = resolve(&candidates)
            && let Some(value) = clean(field, &resolved.value)
        {
            attributes.set(field, Some(value));
            sources.insert(field, resolved.source);
        }
    }

    let model_price = price_from_value(object.get("price")).filter(|price| *price > 0.0);
    attributes.price = caller.price.filter(|price| *price > 0.0).or(model_price);

    let tags_regenerated = request.regenerate_only.is_some_and(RegenerateOnly::includes_tags);
    for kind in TagKind::ALL {
        let model_tags = (request.regenerate_only.is_none() || tags_regenerated)
            .then(|| tags_from_value(object.get(kind.key())))
            .flatten();
        let caller_tags = caller.tags(kind).and_then(sanitize_tags);
        let tags = if tags_regenerated {
            model_tags.or(caller_tags)
        } else {
            caller_tags.or(model_tags)
        };
        attributes.set_tags(kind, tags);
    }

    attributes.title = title::compose(attributes.title.as_deref(), &attributes);
    if attributes.title.is_none() {
        sources.remove(&Field::Title);
    }
    attributes.ocr_text = ocr_text;
    (attributes, sources)
}

/// Field-specific cleanup shared by generation and the batch merge.
pub(crate) fn clean(field: Field, value: &str) -> Option<String> {
    match field {
        Field::DescriptionStyleA | Field::DescriptionStyleB => sanitize_description(value),
        // The title composer strips placeholders itself and needs them to
        // spot a dangling `Size null`.
        Field::Title => sanitize_value(value),
        Field::Condition => snap_condition(&sanitize_text(value)),
        Field::SizeLabel | Field::SizeRecommended => {
            normalize_size(Some(&sanitize_text(value)))
        }
        Field::PitToPit => {
            let text = sanitize_text(value);
            match text.parse::<f64>() {
                Ok(number) if number > 0.0 => Some(format!("{} inches", format_number(number))),
                _ => sanitize_value(&text),
            }
        }
        _ => sanitize_value(&sanitize_text(value)),
    }
}

fn validate(request: &GenerationRequest, max_images: usize) -> Result<(), PipelineError> {
    if request.images.len() > max_images {
        return Err(PipelineError::invalid_input("validate", "too_many_images"));
    }
    if request.images.is_empty() && !request.attributes.has_any_value() {
        return Err(PipelineError::invalid_input(
            "validate",
            "nothing to describe: provide images or product fields",
        ));
    }

    let allowlist = image_domain_allowlist();
    for image in &request.images {
        let url = image.url().trim();
        if url.is_empty() || url.chars().count() > MAX_URL_CHARS {
            return Err(PipelineError::invalid_input(
                "validate",
                "image url must be 1 to 2048 characters",
            ));
        }
        let parsed = reqwest::Url::parse(url).map_err(|_| {
            PipelineError::invalid_input("validate", format!("invalid_image_url: {url}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PipelineError::invalid_input(
                "validate",
                format!("unsupported_url_scheme: {url}"),
            ));
        }
        if let Some(allowed) = &allowlist
            && let Some(host) = parsed.host_str()
            && !host_allowed(host, allowed)
        {
            return Err(PipelineError::invalid_input(
                "validate",
                format!("domain_not_allowed: {host}"),
            ));
        }
    }

    for (field, value) in request.attributes.set_fields() {
        let cap = if field.is_description() {
            MAX_DESCRIPTION_CHARS
        } else {
            MAX_FIELD_CHARS
        };
        if value.chars().count() > cap {
            return Err(PipelineError::invalid_input(
                "validate",
                format!("{} exceeds {cap} characters", field.key()),
            ));
        }
    }
    for kind in TagKind::ALL {
        if let Some(tags) = request.attributes.tags(kind)
            && (tags.len() > MAX_TAGS
                || tags.iter().any(|tag| tag.chars().count() > MAX_FIELD_CHARS))
        {
            return Err(PipelineError::invalid_input(
                "validate",
                format!("{} has too many or oversized entries", kind.key()),
            ));
        }
    }
    if let Some(price) = request.attributes.price
        && !price.is_finite()
    {
        return Err(PipelineError::invalid_input("validate", "price must be a number"));
    }
    Ok(())
}

fn image_domain_allowlist() -> Option<Vec<String>> {
    env::var("IMAGE_DOMAIN_ALLOWLIST")
        .ok()
        .map(|v| {
            v.split([',', ' ', '\n', '\t'])
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
}

fn host_allowed(host: &str, allowed: &[String]) -> bool {
    let host = host.to_lowercase();
    allowed
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")))
}

fn record_stage(
    stages: &mut Vec<StageReport>,
    name: &'static str,
    started: Instant,
    output: serde_json::Value,
) {
    let elapsed_ms = started.elapsed().as_millis();
    crate::metrics::stage_elapsed(name, elapsed_ms);
    stages.push(StageReport::new(name, elapsed_ms, output));
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    NotFound,
    RateLimited,
    QuotaExhausted,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Internal)
    }

    pub fn from_model(stage: &'static str, err: &ModelError) -> Self {
        let kind = match err {
            ModelError::RateLimited { .. } => PipelineErrorKind::RateLimited,
            ModelError::QuotaExhausted => PipelineErrorKind::QuotaExhausted,
            _ => PipelineErrorKind::Internal,
        };
        Self::new(stage, err.to_string(), kind)
    }

    fn new(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::images::ImageRole;
    use crate::llm::scripted::ScriptedModel;
    use serde_json::Value;

    fn generator(model: Arc<ScriptedModel>) -> ListingGenerator {
        ListingGenerator::new(model, GeneratorConfig::default())
    }

    fn images(count: usize) -> Vec<ImageRef> {
        (0..count)
            .map(|i| ImageRef::Url(format!("https://img.test/{i}.jpg")))
            .collect()
    }

    fn request(count: usize) -> GenerationRequest {
        GenerationRequest {
            images: images(count),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn measurement_blob_fills_missing_pit_to_pit() {
        let model = Arc::new(ScriptedModel::always(
            r#"{"garment_type": "Denim Jacket", "pit_to_pit": null,
                "ocr_text": {"label_text": "not visible", "measurement_text": "Pit to Pit: 24"}}"#,
        ));
        let result = generator(model.clone())
            .generate(&request(2))
            .await
            .expect("generated");

        assert_eq!(result.attributes.pit_to_pit.as_deref(), Some("24 inches"));
        assert_eq!(result.source(Field::PitToPit), Some(Source::RegexFallback));
        assert_eq!(result.attributes.ocr_text.label_text, None);
        assert_eq!(model.calls().len(), 1);
        assert_eq!(model.calls()[0].images.len(), 2);
    }

    #[tokio::test]
    async fn truncated_reply_is_repaired() {
        let model = Arc::new(ScriptedModel::always(
            r#"{"brand": "Levi's", "garment_type": "Trucker Jacket",
                "description_style_a": "Faded denim"#,
        ));
        let result = generator(model).generate(&request(1)).await.expect("generated");
        assert_eq!(result.attributes.brand.as_deref(), Some("Levi's"));
        assert_eq!(
            result.attributes.description_style_a.as_deref(),
            Some("Faded denim")
        );
        assert_eq!(result.attributes.title.as_deref(), Some("Levi's Trucker Jacket"));
        assert!(result.report.degraded.is_none());
    }

    #[tokio::test]
    async fn unparseable_reply_degrades_to_stub() {
        let model = Arc::new(ScriptedModel::always("I cannot help with that."));
        let mut req = request(1);
        req.attributes.brand = Some("Wrangler".into());
        let result = generator(model).generate(&req).await.expect("stub");

        assert_eq!(result.report.degraded, Some(Degraded::Unparseable));
        assert_eq!(result.attributes, ProductAttributes::default());
        let value = serde_json::to_value(&result).expect("serialize");
        assert!(value["brand"].is_null());
        assert!(value.get("report").is_none());
    }

    #[tokio::test]
    async fn provider_errors_split_between_surface_and_stub() {
        let limited = Arc::new(ScriptedModel::failing(ModelError::RateLimited {
            retry_after_secs: None,
        }));
        let err = generator(limited)
            .generate(&request(1))
            .await
            .expect_err("surfaced");
        assert_eq!(err.kind(), PipelineErrorKind::RateLimited);

        let quota = Arc::new(ScriptedModel::failing(ModelError::QuotaExhausted));
        let err = generator(quota)
            .generate(&request(1))
            .await
            .expect_err("surfaced");
        assert_eq!(err.kind(), PipelineErrorKind::QuotaExhausted);

        let broken = Arc::new(ScriptedModel::failing(ModelError::Http("HTTP 500".into())));
        let result = generator(broken)
            .generate(&request(1))
            .await
            .expect("stub");
        assert_eq!(result.report.degraded, Some(Degraded::ModelUnavailable));
    }

    #[tokio::test]
    async fn caller_beats_model_unless_label_backs_the_model() {
        let reply = r#"{"brand": "Levi's", "era": "80s",
            "ocr_text": {"label_text": "LEVI STRAUSS & CO size M"}}"#;
        let mut req = request(1);
        req.attributes.brand = Some("Wrangler".into());
        req.attributes.era = Some("90s".into());
        let model = Arc::new(ScriptedModel::always(reply));
        let result = generator(model).generate(&req).await.expect("generated");

        assert_eq!(result.attributes.brand.as_deref(), Some("Levi's"));
        assert_eq!(result.source(Field::Brand), Some(Source::Ocr));
        assert_eq!(result.attributes.era.as_deref(), Some("90s"));
        assert_eq!(result.source(Field::Era), Some(Source::Caller));
        assert_eq!(result.attributes.size_label.as_deref(), Some("M"));
        assert_eq!(result.source(Field::SizeLabel), Some(Source::RegexFallback));

        let no_label = Arc::new(ScriptedModel::always(r#"{"brand": "Levi's"}"#));
        let result = generator(no_label).generate(&req).await.expect("generated");
        assert_eq!(result.attributes.brand.as_deref(), Some("Wrangler"));
    }

    #[tokio::test]
    async fn chunked_mode_runs_ocr_first_and_prioritises_images() {
        let model = Arc::new(ScriptedModel::new(|call| {
            if call.system == prompts::OCR_SYSTEM {
                if call.images[0].ends_with("/8.jpg") {
                    Ok(r#"{"label_text": "Pendleton 100% virgin wool size L",
                        "measurement_text": "ptp 23"}"#
                        .into())
                } else {
                    Ok(r#"{"label_text": "not visible", "measurement_text": "not visible"}"#.into())
                }
            } else {
                Ok(r#"{"garment_type": "Board Shirt", "condition": "good"}"#.into())
            }
        }));
        let result = generator(model.clone())
            .generate(&request(14))
            .await
            .expect("generated");

        let calls = model.calls();
        let ocr_calls: Vec<_> = calls
            .iter()
            .filter(|c| c.system == prompts::OCR_SYSTEM)
            .collect();
        assert_eq!(ocr_calls.len(), 3);
        assert!(ocr_calls.iter().all(|c| c.options.json_mode && c.options.max_tokens == 600));
        let main = calls.last().expect("main call");
        assert_eq!(main.options.max_tokens, 2500);
        assert_eq!(main.images.len(), 4);
        assert!(main.images.contains(&"https://img.test/8.jpg".to_string()));
        assert!(main.text.contains("Label transcription: Pendleton"));

        let attrs = &result.attributes;
        assert_eq!(attrs.size_label.as_deref(), Some("L"));
        assert_eq!(attrs.pit_to_pit.as_deref(), Some("23 inches"));
        assert_eq!(attrs.condition.as_deref(), Some("Good"));
        assert_eq!(attrs.title.as_deref(), Some("Board Shirt Size L"));
    }

    #[tokio::test]
    async fn regenerating_title_skips_ocr_and_keeps_other_fields() {
        let model = Arc::new(ScriptedModel::always(
            r#"{"title": "Pendleton Wool Board Shirt Plaid Red Black Loop Collar Flannel Size M",
                "brand": "Ignored"}"#,
        ));
        let mut req = request(14);
        req.regenerate_only = Some(RegenerateOnly::Title);
        req.attributes.brand = Some("Pendleton".into());
        req.attributes.title = Some("Old title".into());
        req.attributes.size_label = Some("M".into());
        req.attributes.description_style_a = Some("Kept as is.".into());

        let result = generator(model.clone()).generate(&req).await.expect("generated");
        assert_eq!(model.calls().len(), 1);
        assert_eq!(
            result.attributes.title.as_deref(),
            Some("Pendleton Wool Board Shirt Plaid Red Black Loop Collar Flannel Size M")
        );
        assert_eq!(result.attributes.brand.as_deref(), Some("Pendleton"));
        assert_eq!(
            result.attributes.description_style_a.as_deref(),
            Some("Kept as is.")
        );
    }

    #[tokio::test]
    async fn placeholders_never_survive() {
        let model = Arc::new(ScriptedModel::always(
            r#"{"brand": "N/A", "era": "null", "material": "Unknown", "made_in": "undefined",
                "garment_type": "Cardigan", "title": "Cardigan Size null",
                "description_style_a": "Soft knit.\nBrand: null\nMaterial: N/A",
                "etsy_tags": ["null", "knitwear"]}"#,
        ));
        let result = generator(model).generate(&request(1)).await.expect("generated");
        let value = serde_json::to_value(&result).expect("serialize");
        let Value::Object(map) = &value else {
            panic!("object expected");
        };
        for (key, value) in map {
            if let Some(text) = value.as_str() {
                for banned in ["null", "undefined", "n/a"] {
                    assert!(
                        !text.to_lowercase().split_whitespace().any(|w| w == banned),
                        "{key} = {text}"
                    );
                }
            }
        }
        assert!(value["brand"].is_null());
        assert_eq!(value["description_style_a"], "Soft knit.");
        assert_eq!(value["title"], "Cardigan");
        assert_eq!(value["etsy_tags"], json!(["knitwear"]));
        assert!(value["price"].is_null());
    }

    #[tokio::test]
    async fn caller_placeholders_are_neither_prompted_nor_kept() {
        let model = Arc::new(ScriptedModel::always(
            r#"{"garment_type": "Cardigan", "brand": "Pendleton"}"#,
        ));
        let mut req = request(1);
        req.attributes.brand = Some("Unknown".into());
        req.attributes.material = Some("Wool".into());
        req.attributes.etsy_tags = Some(vec!["N/A".into(), "null".into()]);
        req.attributes.shopify_tags = Some(vec!["knitwear".into(), "null".into()]);

        let result = generator(model.clone()).generate(&req).await.expect("generated");
        let attrs = &result.attributes;
        assert_eq!(attrs.brand.as_deref(), Some("Pendleton"));
        assert_eq!(attrs.material.as_deref(), Some("Wool"));
        assert_eq!(attrs.etsy_tags, None);
        assert_eq!(attrs.shopify_tags, Some(vec!["knitwear".to_string()]));

        let call = &model.calls()[0];
        assert!(!call.text.contains("Brand: Unknown"));
        assert!(call.text.contains("Material: Wool"));
        assert!(call.options.json_mode);
        assert_eq!(call.options.max_tokens, GeneratorConfig::default().max_tokens);
    }

    #[tokio::test]
    async fn shape_violations_are_rejected_before_any_call() {
        let model = Arc::new(ScriptedModel::always("{}"));
        let listing = generator(model.clone());

        let empty = listing.generate(&GenerationRequest::default()).await.expect_err("empty");
        assert_eq!(empty.kind(), PipelineErrorKind::InvalidInput);

        let too_many = listing.generate(&request(501)).await.expect_err("too many");
        assert_eq!(too_many.detail(), "too_many_images");

        let bad_scheme = GenerationRequest {
            images: vec![ImageRef::Tagged {
                url: "ftp://img.test/a.jpg".into(),
                role: Some(ImageRole::Front),
            }],
            ..Default::default()
        };
        let err = listing.generate(&bad_scheme).await.expect_err("scheme");
        assert!(err.detail().starts_with("unsupported_url_scheme"));

        let mut long_brand = request(1);
        long_brand.attributes.brand = Some("x".repeat(MAX_FIELD_CHARS + 1));
        assert!(listing.generate(&long_brand).await.is_err());

        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    async fn every_key_is_present_in_the_bundle() {
        let model = Arc::new(ScriptedModel::always(r#"{"garment_type": "Tee"}"#));
        let result = generator(model).generate(&request(1)).await.expect("generated");
        let value = serde_json::to_value(&result).expect("serialize");
        for field in Field::ALL {
            assert!(value.get(field.key()).is_some(), "missing {}", field.key());
        }
        for key in ["price", "shopify_tags", "etsy_tags", "collections_tags", "ocr_text"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }
}
