use crate::autopilot::{DraftProduct, RunStatus};
use crate::listing::attributes::{Field, ProductAttributes};
use crate::listing::provenance::Source;
use crate::listing::voice::{DescriptionStyle, VoiceUpdate};
use crate::pipeline::{Degraded, GenerationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;

/// Body of `POST /listings/generate`: the bundle plus how it was reached.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ListingResponse {
    #[serde(flatten)]
    pub listing: ProductAttributes,
    pub meta: GenerationMeta,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GenerationMeta {
    pub sources: BTreeMap<Field, Source>,
    pub degraded: Option<Degraded>,
    pub stages: Vec<StageReport>,
}

impl From<GenerationResult> for ListingResponse {
    fn from(result: GenerationResult) -> Self {
        Self {
            listing: result.attributes,
            meta: GenerationMeta {
                sources: result.report.sources,
                degraded: result.report.degraded,
                stages: result.report.stages,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceParseRequest {
    pub transcript: String,
    #[serde(default)]
    pub existing_condition: Option<String>,
    /// The record being edited. When present the response carries it with
    /// the update applied.
    #[serde(default)]
    pub attributes: Option<ProductAttributes>,
    #[serde(default)]
    pub active_style: DescriptionStyle,
}

impl VoiceParseRequest {
    /// The explicit condition, else the one on the record being edited.
    pub fn condition(&self) -> Option<&str> {
        self.existing_condition.as_deref().or_else(|| {
            self.attributes
                .as_ref()
                .and_then(|attributes| attributes.condition.as_deref())
        })
    }
}

/// The detected keys at the top level; `record` and `record_style` only
/// when a record was sent along.
#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct VoiceParseResponse {
    #[serde(flatten)]
    pub update: VoiceUpdate,
    pub record: Option<ProductAttributes>,
    pub record_style: Option<DescriptionStyle>,
}

impl VoiceParseResponse {
    pub fn new(update: VoiceUpdate, request: VoiceParseRequest) -> Self {
        let (record, record_style) = match request.attributes {
            Some(mut attributes) => {
                let style = update.apply_to(&mut attributes, request.active_style);
                (Some(attributes), Some(style))
            }
            None => (None, None),
        };
        Self {
            update,
            record,
            record_style,
        }
    }
}

fn default_batch_size() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    pub products: Vec<DraftProduct>,
}

#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub run_id: String,
    pub products: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunStatusRequest {
    pub status: RunStatus,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
