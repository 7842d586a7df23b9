//! Process-local store used when no database is configured, and by tests.

use crate::autopilot::store::{
    AutopilotRun, ProductOutcome, ProductRecord, ProductStore, ProductStatus, QcState, RunStatus,
    RunStore, StoreError,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    runs: HashMap<Uuid, AutopilotRun>,
    products: HashMap<Uuid, ProductRecord>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_run(&self, run: AutopilotRun) {
        self.tables.lock().await.runs.insert(run.id, run);
    }

    pub async fn insert_product(&self, product: ProductRecord) {
        self.tables.lock().await.products.insert(product.id, product);
    }

    #[cfg(test)]
    pub async fn run(&self, id: Uuid) -> Option<AutopilotRun> {
        self.tables.lock().await.runs.get(&id).cloned()
    }

    #[cfg(test)]
    pub async fn product(&self, id: Uuid) -> Option<ProductRecord> {
        self.tables.lock().await.products.get(&id).cloned()
    }
}

#[async_trait]
impl ProductStore for InMemoryStore {
    async fn claimable(
        &self,
        run_id: Uuid,
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<ProductRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let mut found: Vec<ProductRecord> = tables
            .products
            .values()
            .filter(|product| product.run_id == run_id && product.is_claimable(max_attempts))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        found.truncate(limit);
        Ok(found)
    }

    async fn claim(
        &self,
        run_id: Uuid,
        ids: &[Uuid],
        batch_number: u32,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(product) = tables.products.get_mut(id)
                && product.run_id == run_id
                && product.qc_status.is_claimable()
            {
                product.qc_status = QcState::Generating;
                product.batch_number = Some(batch_number);
                product.attempts += 1;
                claimed.push(*id);
            }
        }
        Ok(claimed)
    }

    async fn save_outcome(&self, id: Uuid, outcome: &ProductOutcome) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let product = tables.products.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "product",
            id,
        })?;
        product.attributes = outcome.attributes.clone();
        product.qc_status = outcome.qc.status.into();
        product.confidence = Some(outcome.qc.confidence);
        product.flags = outcome.qc.flags.clone();
        product.status = ProductStatus::Generated;
        product.generated_at = Some(outcome.generated_at);
        product.last_error = None;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let product = tables.products.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "product",
            id,
        })?;
        product.qc_status = QcState::Failed;
        product.last_error = Some(error.to_string());
        Ok(())
    }

    async fn images(&self, id: Uuid, limit: usize) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.lock().await;
        let product = tables.products.get(&id).ok_or(StoreError::NotFound {
            entity: "product",
            id,
        })?;
        Ok(product.images.iter().take(limit).cloned().collect())
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn get_run(&self, run_id: Uuid) -> Result<Option<AutopilotRun>, StoreError> {
        Ok(self.tables.lock().await.runs.get(&run_id).cloned())
    }

    async fn advance_batch(&self, run_id: Uuid, expected: u32) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Running && run.current_batch == expected => {
                run.current_batch = expected + 1;
                run.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_progress(
        &self,
        run_id: Uuid,
        batch: u32,
        processed_cards: u32,
        last_error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.runs.get_mut(&run_id) {
            Some(run) if run.current_batch == batch => {
                run.processed_cards = processed_cards;
                if let Some(summary) = last_error {
                    run.last_error = Some(summary.to_string());
                }
                run.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Running => {
                run.status = RunStatus::AwaitingQc;
                run.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_run(
        &self,
        run: &AutopilotRun,
        products: &[ProductRecord],
    ) -> Result<(), StoreError> {
        for product in products {
            self.insert_product(product.clone()).await;
        }
        self.insert_run(run.clone()).await;
        Ok(())
    }

    async fn set_status(&self, run_id: Uuid, status: RunStatus) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.runs.get_mut(&run_id) {
            Some(run) if run.status.is_adjustable() => {
                run.status = status;
                run.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
