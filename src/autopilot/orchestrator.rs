use crate::autopilot::store::{
    AutopilotRun, DraftProduct, ProductOutcome, ProductRecord, ProductStore, RunStatus, RunStore,
    StoreError,
};
use crate::listing::attributes::{Field, ProductAttributes, TagKind};
use crate::listing::images::ImageRef;
use crate::listing::provenance::{Candidates, Source, resolve_value};
use crate::listing::sanitize::sanitize_tags;
use crate::listing::{qc, title};
use crate::pipeline::{
    GenerationRequest, GenerationResult, ListingGenerator, PipelineError, clean,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const MAX_BATCH_SIZE: u32 = 50;
pub const MAX_RUN_PRODUCTS: usize = 500;

/// Fire-and-forget dispatch of "process the next batch of this run".
#[async_trait]
pub trait BatchTrigger: Send + Sync {
    async fn schedule(&self, run_id: Uuid);
}

#[derive(Debug, Clone)]
pub struct AutopilotConfig {
    /// Attempts before a failing product stops being claimable. 0 = never.
    pub max_attempts: u32,
    pub images_per_product: usize,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            images_per_product: 2,
        }
    }
}

impl AutopilotConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: std::env::var("AUTOPILOT_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(defaults.max_attempts),
            images_per_product: std::env::var("AUTOPILOT_IMAGES")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v >= 1)
                .unwrap_or(defaults.images_per_product),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// A batch was claimed and worked through.
    Processed,
    /// Nothing left to claim; the run moved to `awaiting_qc`.
    Finished,
    /// The run is not `running`; nothing was touched.
    NotRunning,
    /// Another invocation advanced the batch counter first.
    Contended,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub outcome: BatchOutcome,
    pub batch_number: Option<u32>,
    pub processed: u32,
    pub errors: Vec<String>,
}

impl BatchReport {
    fn idle(run_id: Uuid, outcome: BatchOutcome) -> Self {
        Self {
            run_id,
            outcome,
            batch_number: None,
            processed: 0,
            errors: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    generator: ListingGenerator,
    products: Arc<dyn ProductStore>,
    runs: Arc<dyn RunStore>,
    trigger: Option<Arc<dyn BatchTrigger>>,
    config: AutopilotConfig,
}

impl BatchOrchestrator {
    pub fn new(
        generator: ListingGenerator,
        products: Arc<dyn ProductStore>,
        runs: Arc<dyn RunStore>,
        config: AutopilotConfig,
    ) -> Self {
        Self {
            generator,
            products,
            runs,
            trigger: None,
            config,
        }
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn BatchTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Creates a `running` run over the drafts. Claim order follows the
    /// order the drafts were given in.
    pub async fn start_run(
        &self,
        batch_size: u32,
        drafts: Vec<DraftProduct>,
    ) -> Result<AutopilotRun, PipelineError> {
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(PipelineError::invalid_input("start_run", "invalid_batch_size"));
        }
        if drafts.is_empty() {
            return Err(PipelineError::invalid_input("start_run", "no_products"));
        }
        if drafts.len() > MAX_RUN_PRODUCTS {
            return Err(PipelineError::invalid_input("start_run", "too_many_products"));
        }

        let run = AutopilotRun::new(batch_size);
        let base = Utc::now();
        let products: Vec<ProductRecord> = drafts
            .into_iter()
            .enumerate()
            .map(|(i, draft)| {
                let mut product = ProductRecord::draft(run.id, draft.attributes, draft.images);
                product.created_at = base + chrono::Duration::milliseconds(i as i64);
                product
            })
            .collect();
        self.runs
            .create_run(&run, &products)
            .await
            .map_err(store_error)?;
        info!(
            target = "relist.autopilot",
            run_id = %run.id,
            products = products.len(),
            batch_size,
            "run_started"
        );
        Ok(run)
    }

    /// Pause, resume or cancel. `awaiting_qc` is only reached by draining,
    /// and a drained or cancelled run stays put.
    pub async fn set_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
    ) -> Result<AutopilotRun, PipelineError> {
        if status == RunStatus::AwaitingQc {
            return Err(PipelineError::invalid_input("set_run_status", "invalid_run_status"));
        }
        let updated = self
            .runs
            .set_status(run_id, status)
            .await
            .map_err(store_error)?;
        let run = self
            .runs
            .get_run(run_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| PipelineError::not_found("set_run_status", format!("run {run_id}")))?;
        if !updated {
            return Err(PipelineError::invalid_input("set_run_status", "run_not_adjustable"));
        }
        info!(
            target = "relist.autopilot",
            run_id = %run_id,
            status = ?status,
            "run_status_changed"
        );
        Ok(run)
    }

    /// Runs one batch step. Store failures while reading or claiming the
    /// queue are returned; per-product failures never are.
    pub async fn run_batch(&self, run_id: Uuid) -> Result<BatchReport, PipelineError> {
        let run = self
            .runs
            .get_run(run_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| PipelineError::not_found("run_batch", format!("run {run_id}")))?;
        if run.status != RunStatus::Running {
            info!(
                target = "relist.autopilot",
                run_id = %run_id,
                status = ?run.status,
                "batch_skipped"
            );
            return Ok(BatchReport::idle(run_id, BatchOutcome::NotRunning));
        }

        let candidates = self
            .products
            .claimable(run_id, run.batch_size as usize, self.config.max_attempts)
            .await
            .map_err(store_error)?;
        if candidates.is_empty() {
            let finished = self.runs.finish(run_id).await.map_err(store_error)?;
            info!(
                target = "relist.autopilot",
                run_id = %run_id,
                finished,
                processed_cards = run.processed_cards,
                "run_drained"
            );
            let outcome = if finished {
                BatchOutcome::Finished
            } else {
                BatchOutcome::NotRunning
            };
            return Ok(BatchReport::idle(run_id, outcome));
        }

        if !self
            .runs
            .advance_batch(run_id, run.current_batch)
            .await
            .map_err(store_error)?
        {
            warn!(
                target = "relist.autopilot",
                run_id = %run_id,
                batch = run.current_batch,
                "batch_contended"
            );
            return Ok(BatchReport::idle(run_id, BatchOutcome::Contended));
        }
        let batch_number = run.current_batch + 1;
        let ids: Vec<Uuid> = candidates.iter().map(|product| product.id).collect();
        let claimed = self
            .products
            .claim(run_id, &ids, batch_number)
            .await
            .map_err(store_error)?;

        let mut processed = 0u32;
        let mut errors = Vec::new();
        for product in candidates.iter().filter(|p| claimed.contains(&p.id)) {
            match self.process(product).await {
                Ok(()) => processed += 1,
                Err(message) => {
                    warn!(
                        target = "relist.autopilot",
                        run_id = %run_id,
                        product_id = %product.id,
                        error = %message,
                        "product_failed"
                    );
                    if let Err(err) = self.products.mark_failed(product.id, &message).await {
                        warn!(
                            target = "relist.autopilot",
                            product_id = %product.id,
                            error = %err,
                            "mark_failed_failed"
                        );
                    }
                    errors.push(format!("{}: {message}", product.id));
                }
            }
        }

        self.finish_batch(&run, batch_number, processed, &errors).await;
        crate::metrics::batch_processed(processed, errors.len());

        if let Some(trigger) = &self.trigger {
            trigger.schedule(run_id).await;
        }
        Ok(BatchReport {
            run_id,
            outcome: BatchOutcome::Processed,
            batch_number: Some(batch_number),
            processed,
            errors,
        })
    }

    async fn finish_batch(
        &self,
        run: &AutopilotRun,
        batch: u32,
        processed: u32,
        errors: &[String],
    ) {
        let summary = (!errors.is_empty()).then(|| {
            format!(
                "batch {batch}: {} of {} products failed; first: {}",
                errors.len(),
                errors.len() as u32 + processed,
                errors[0]
            )
        });
        match self
            .runs
            .record_progress(run.id, batch, run.processed_cards + processed, summary.as_deref())
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                target = "relist.autopilot",
                run_id = %run.id,
                batch,
                "progress_precondition_failed"
            ),
            Err(err) => warn!(
                target = "relist.autopilot",
                run_id = %run.id,
                batch,
                error = %err,
                "progress_write_failed"
            ),
        }
        info!(
            target = "relist.autopilot",
            run_id = %run.id,
            batch,
            processed,
            failed = errors.len(),
            "batch_processed"
        );
    }

    async fn process(&self, product: &ProductRecord) -> Result<(), String> {
        let images = self
            .products
            .images(product.id, self.config.images_per_product)
            .await
            .map_err(|err| err.to_string())?;
        let request = GenerationRequest {
            attributes: product.attributes.clone(),
            images: images.into_iter().map(ImageRef::Url).collect(),
            regenerate_only: None,
        };
        let result = self
            .generator
            .generate(&request)
            .await
            .map_err(|err| err.to_string())?;
        if let Some(degraded) = result.report.degraded {
            return Err(format!("generation degraded: {degraded:?}"));
        }

        let attributes = merge_generated(&product.attributes, &result);
        let report = qc::score(&attributes);
        let outcome = ProductOutcome {
            attributes,
            qc: report,
            generated_at: Utc::now(),
        };
        self.products
            .save_outcome(product.id, &outcome)
            .await
            .map_err(|err| err.to_string())
    }
}

/// Existing values win over inferred ones once they survive the same field
/// cleanup as generated values; label and measurement readings still
/// outrank the record.
pub fn merge_generated(
    existing: &ProductAttributes,
    generated: &GenerationResult,
) -> ProductAttributes {
    let mut merged = generated.attributes.clone();
    for field in Field::ALL {
        let value = generated.attributes.get(field).map(str::to_string);
        let caller = existing.get(field).and_then(|value| clean(field, value));
        let candidates = if generated.source(field) == Some(Source::Ocr) {
            Candidates {
                ocr: value,
                caller,
                ..Default::default()
            }
        } else {
            Candidates {
                caller,
                model: value,
                ..Default::default()
            }
        };
        merged.set(field, resolve_value(&candidates));
    }
    merged.title = title::compose(merged.title.as_deref(), &merged);
    merged.price = existing
        .price
        .filter(|price| *price > 0.0)
        .or(generated.attributes.price);
    for kind in TagKind::ALL {
        let tags = existing
            .tags(kind)
            .and_then(sanitize_tags)
            .or_else(|| generated.attributes.tags(kind).cloned());
        merged.set_tags(kind, tags);
    }
    merged
}

fn store_error(err: StoreError) -> PipelineError {
    match err {
        StoreError::NotFound { .. } => {
            PipelineError::not_found("autopilot_store", err.to_string())
        }
        _ => PipelineError::internal("autopilot_store", err.to_string()),
    }
}
