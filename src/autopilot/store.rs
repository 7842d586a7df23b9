//! Persistence seams for unattended runs.
//!
//! Every state change that guards the one-batch-in-flight rule is a
//! conditional update: it only applies when the row still has the
//! expected status or counter, and reports whether it did.

use crate::listing::attributes::ProductAttributes;
use crate::listing::qc::{QcFlag, QcReport, QcStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    AwaitingQc,
    Cancelled,
}

impl RunStatus {
    /// States a run can still be moved between from outside.
    pub const ADJUSTABLE: [RunStatus; 2] = [RunStatus::Running, RunStatus::Paused];

    pub fn is_adjustable(self) -> bool {
        Self::ADJUSTABLE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::AwaitingQc => "awaiting_qc",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub batch_size: u32,
    #[serde(default)]
    pub current_batch: u32,
    #[serde(default)]
    pub processed_cards: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AutopilotRun {
    pub fn new(batch_size: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Running,
            batch_size: batch_size.max(1),
            current_batch: 0,
            processed_cards: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Draft,
    Generated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QcState {
    Draft,
    Generating,
    Generated,
    Failed,
    Ready,
    NeedsReview,
    Blocked,
}

impl QcState {
    pub const CLAIMABLE: [QcState; 2] = [QcState::Draft, QcState::Failed];

    pub fn is_claimable(self) -> bool {
        Self::CLAIMABLE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QcState::Draft => "draft",
            QcState::Generating => "generating",
            QcState::Generated => "generated",
            QcState::Failed => "failed",
            QcState::Ready => "ready",
            QcState::NeedsReview => "needs_review",
            QcState::Blocked => "blocked",
        }
    }
}

impl From<QcStatus> for QcState {
    fn from(status: QcStatus) -> Self {
        match status {
            QcStatus::Ready => QcState::Ready,
            QcStatus::NeedsReview => QcState::NeedsReview,
            QcStatus::Blocked => QcState::Blocked,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub attributes: ProductAttributes,
    #[serde(default)]
    pub images: Vec<String>,
    pub status: ProductStatus,
    pub qc_status: QcState,
    #[serde(default)]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub flags: BTreeSet<QcFlag>,
    #[serde(default)]
    pub batch_number: Option<u32>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ProductRecord {
    pub fn draft(run_id: Uuid, attributes: ProductAttributes, images: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            created_at: Utc::now(),
            attributes,
            images,
            status: ProductStatus::Draft,
            qc_status: QcState::Draft,
            confidence: None,
            flags: BTreeSet::new(),
            batch_number: None,
            attempts: 0,
            generated_at: None,
            last_error: None,
        }
    }

    /// `max_attempts == 0` means failed products are retried forever.
    pub fn is_claimable(&self, max_attempts: u32) -> bool {
        self.qc_status.is_claimable() && (max_attempts == 0 || self.attempts < max_attempts)
    }
}

/// A product handed in when a run is started.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DraftProduct {
    #[serde(flatten)]
    pub attributes: ProductAttributes,
    #[serde(default)]
    pub images: Vec<String>,
}

/// What gets written back for a successfully generated product.
#[derive(Debug, Clone)]
pub struct ProductOutcome {
    pub attributes: ProductAttributes,
    pub qc: QcReport,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Draft or failed products of the run under the attempt cap, oldest
    /// first.
    async fn claimable(
        &self,
        run_id: Uuid,
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<ProductRecord>, StoreError>;

    /// Moves still-claimable products to `generating` with the batch number
    /// and one more attempt. Returns the ids that were actually claimed.
    async fn claim(
        &self,
        run_id: Uuid,
        ids: &[Uuid],
        batch_number: u32,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn save_outcome(&self, id: Uuid, outcome: &ProductOutcome) -> Result<(), StoreError>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    async fn images(&self, id: Uuid, limit: usize) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get_run(&self, run_id: Uuid) -> Result<Option<AutopilotRun>, StoreError>;

    /// `current_batch: expected -> expected + 1` while the run is running.
    async fn advance_batch(&self, run_id: Uuid, expected: u32) -> Result<bool, StoreError>;

    /// Writes the processed counter for `batch`; `last_error` is only
    /// replaced when a summary is given.
    async fn record_progress(
        &self,
        run_id: Uuid,
        batch: u32,
        processed_cards: u32,
        last_error: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// `running -> awaiting_qc`.
    async fn finish(&self, run_id: Uuid) -> Result<bool, StoreError>;

    /// Inserts a new run together with its draft products.
    async fn create_run(
        &self,
        run: &AutopilotRun,
        products: &[ProductRecord],
    ) -> Result<(), StoreError>;

    /// External pause, resume or cancel. Only applies while the run is
    /// `running` or `paused`.
    async fn set_status(&self, run_id: Uuid, status: RunStatus) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimability_respects_state_and_attempt_cap() {
        let mut product =
            ProductRecord::draft(Uuid::new_v4(), ProductAttributes::default(), vec![]);
        assert!(product.is_claimable(3));

        product.qc_status = QcState::Failed;
        product.attempts = 2;
        assert!(product.is_claimable(3));
        product.attempts = 3;
        assert!(!product.is_claimable(3));
        assert!(product.is_claimable(0));

        product.qc_status = QcState::Generating;
        assert!(!product.is_claimable(0));
    }

    #[test]
    fn record_serializes_flat_with_snake_case_states() {
        let mut product = ProductRecord::draft(
            Uuid::new_v4(),
            ProductAttributes {
                brand: Some("Levi's".into()),
                ..Default::default()
            },
            vec!["https://img.test/a.jpg".into()],
        );
        product.qc_status = QcState::NeedsReview;
        let value = serde_json::to_value(&product).expect("serialize");
        assert_eq!(value["brand"], "Levi's");
        assert_eq!(value["qc_status"], "needs_review");
        assert_eq!(value["status"], "draft");

        let back: ProductRecord = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back.attributes.brand.as_deref(), Some("Levi's"));
        assert_eq!(back.qc_status, QcState::NeedsReview);
    }
}
