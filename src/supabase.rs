use crate::autopilot::store::{
    AutopilotRun, ProductOutcome, ProductRecord, ProductStatus, ProductStore, QcState, RunStatus,
    RunStore, StoreError,
};
use crate::http::build_client;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;
use urlencoding::encode;
use uuid::Uuid;

const PRODUCTS: &str = "products";
const PRODUCT_IMAGES: &str = "product_images";
const RUNS: &str = "autopilot_runs";

/// PostgREST-backed product and run store.
///
/// Conditional transitions are PATCHes whose filters carry the expected
/// state; `Prefer: return=representation` tells us whether a row matched.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct AttemptRow {
    id: Uuid,
    #[serde(default)]
    attempts: u32,
}

#[derive(Debug, Deserialize)]
struct ImageRow {
    url: String,
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/rest/v1/{}", self.base_url, path))
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn select<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, StoreError> {
        let response = self
            .request(Method::GET, path)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    /// Returns how many rows the filter matched.
    async fn update(&self, path: &str, body: Value) -> Result<usize, StoreError> {
        let response = self
            .request(Method::PATCH, path)
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        let rows: Vec<Value> = response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        debug!(target = "relist.store", path, rows = rows.len(), "conditional_update");
        Ok(rows.len())
    }

    async fn insert(&self, table: &str, body: Value) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn update_product(&self, id: Uuid, body: Value) -> Result<(), StoreError> {
        let path = format!("{PRODUCTS}?id=eq.{id}");
        match self.update(&path, body).await? {
            0 => Err(StoreError::NotFound {
                entity: "product",
                id,
            }),
            _ => Ok(()),
        }
    }
}

fn claimable_filter() -> String {
    let states: Vec<&str> = QcState::CLAIMABLE.iter().map(|state| state.as_str()).collect();
    format!("qc_status=in.{}", encode(&format!("({})", states.join(","))))
}

fn adjustable_filter() -> String {
    let states: Vec<&str> = RunStatus::ADJUSTABLE
        .iter()
        .map(|status| status.as_str())
        .collect();
    format!("status=in.{}", encode(&format!("({})", states.join(","))))
}

fn claimable_query(run_id: Uuid, limit: usize, max_attempts: u32) -> String {
    let mut query = format!(
        "{PRODUCTS}?select=*&run_id=eq.{run_id}&{}&order=created_at.asc,id.asc&limit={limit}",
        claimable_filter()
    );
    if max_attempts > 0 {
        query.push_str(&format!("&attempts=lt.{max_attempts}"));
    }
    query
}

fn id_list(ids: &[Uuid]) -> String {
    let joined: Vec<String> = ids.iter().map(Uuid::to_string).collect();
    encode(&format!("({})", joined.join(","))).into_owned()
}

/// Product columns without the image list, which lives in its own table.
fn product_row(product: &ProductRecord) -> Result<Value, StoreError> {
    let mut row =
        serde_json::to_value(product).map_err(|err| StoreError::Deserialize(err.to_string()))?;
    if let Value::Object(map) = &mut row {
        map.remove("images");
    }
    Ok(row)
}

fn image_rows(products: &[ProductRecord]) -> Vec<Value> {
    products
        .iter()
        .flat_map(|product| {
            product.images.iter().enumerate().map(|(position, url)| {
                json!({ "product_id": product.id, "url": url, "position": position })
            })
        })
        .collect()
}

fn outcome_body(outcome: &ProductOutcome) -> Result<Value, StoreError> {
    let mut body = serde_json::to_value(&outcome.attributes)
        .map_err(|err| StoreError::Deserialize(err.to_string()))?;
    if let Value::Object(map) = &mut body {
        map.insert(
            "qc_status".into(),
            json!(QcState::from(outcome.qc.status).as_str()),
        );
        map.insert("confidence".into(), json!(outcome.qc.confidence));
        map.insert("flags".into(), json!(outcome.qc.flags));
        map.insert("status".into(), json!(ProductStatus::Generated));
        map.insert("generated_at".into(), json!(outcome.generated_at));
        map.insert("last_error".into(), Value::Null);
    }
    Ok(body)
}

#[async_trait]
impl ProductStore for SupabaseClient {
    async fn claimable(
        &self,
        run_id: Uuid,
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<ProductRecord>, StoreError> {
        self.select(&claimable_query(run_id, limit, max_attempts))
            .await
    }

    async fn claim(
        &self,
        run_id: Uuid,
        ids: &[Uuid],
        batch_number: u32,
    ) -> Result<Vec<Uuid>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<AttemptRow> = self
            .select(&format!(
                "{PRODUCTS}?select=id,attempts&run_id=eq.{run_id}&id=in.{}&{}",
                id_list(ids),
                claimable_filter()
            ))
            .await?;

        // The attempts filter makes each claim a compare-and-swap.
        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let path = format!(
                "{PRODUCTS}?id=eq.{}&{}&attempts=eq.{}",
                row.id,
                claimable_filter(),
                row.attempts
            );
            let body = json!({
                "qc_status": QcState::Generating.as_str(),
                "batch_number": batch_number,
                "attempts": row.attempts + 1,
            });
            if self.update(&path, body).await? > 0 {
                claimed.push(row.id);
            }
        }
        Ok(claimed)
    }

    async fn save_outcome(&self, id: Uuid, outcome: &ProductOutcome) -> Result<(), StoreError> {
        self.update_product(id, outcome_body(outcome)?).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        self.update_product(
            id,
            json!({ "qc_status": QcState::Failed.as_str(), "last_error": error }),
        )
        .await
    }

    async fn images(&self, id: Uuid, limit: usize) -> Result<Vec<String>, StoreError> {
        let rows: Vec<ImageRow> = self
            .select(&format!(
                "{PRODUCT_IMAGES}?select=url&product_id=eq.{id}&order=position.asc&limit={limit}"
            ))
            .await?;
        Ok(rows.into_iter().map(|row| row.url).collect())
    }
}

#[async_trait]
impl RunStore for SupabaseClient {
    async fn get_run(&self, run_id: Uuid) -> Result<Option<AutopilotRun>, StoreError> {
        let mut rows: Vec<AutopilotRun> = self
            .select(&format!("{RUNS}?id=eq.{run_id}&select=*&limit=1"))
            .await?;
        Ok(rows.pop())
    }

    async fn advance_batch(&self, run_id: Uuid, expected: u32) -> Result<bool, StoreError> {
        let path = format!("{RUNS}?id=eq.{run_id}&status=eq.running&current_batch=eq.{expected}");
        let body = json!({ "current_batch": expected + 1, "updated_at": Utc::now() });
        Ok(self.update(&path, body).await? > 0)
    }

    async fn record_progress(
        &self,
        run_id: Uuid,
        batch: u32,
        processed_cards: u32,
        last_error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let path = format!("{RUNS}?id=eq.{run_id}&current_batch=eq.{batch}");
        let mut body = json!({ "processed_cards": processed_cards, "updated_at": Utc::now() });
        if let (Some(summary), Value::Object(map)) = (last_error, &mut body) {
            map.insert("last_error".into(), json!(summary));
        }
        Ok(self.update(&path, body).await? > 0)
    }

    async fn finish(&self, run_id: Uuid) -> Result<bool, StoreError> {
        let path = format!("{RUNS}?id=eq.{run_id}&status=eq.running");
        let body = json!({ "status": RunStatus::AwaitingQc, "updated_at": Utc::now() });
        Ok(self.update(&path, body).await? > 0)
    }

    async fn create_run(
        &self,
        run: &AutopilotRun,
        products: &[ProductRecord],
    ) -> Result<(), StoreError> {
        let run_row =
            serde_json::to_value(run).map_err(|err| StoreError::Deserialize(err.to_string()))?;
        self.insert(RUNS, run_row).await?;
        let rows = products
            .iter()
            .map(product_row)
            .collect::<Result<Vec<_>, _>>()?;
        self.insert(PRODUCTS, Value::Array(rows)).await?;
        let images = image_rows(products);
        if !images.is_empty() {
            self.insert(PRODUCT_IMAGES, Value::Array(images)).await?;
        }
        debug!(
            target = "relist.store",
            run_id = %run.id,
            products = products.len(),
            "run_created"
        );
        Ok(())
    }

    async fn set_status(&self, run_id: Uuid, status: RunStatus) -> Result<bool, StoreError> {
        let path = format!("{RUNS}?id=eq.{run_id}&{}", adjustable_filter());
        let body = json!({ "status": status, "updated_at": Utc::now() });
        Ok(self.update(&path, body).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::attributes::ProductAttributes;
    use crate::listing::qc::{QcFlag, QcReport, QcStatus};
    use std::collections::BTreeSet;

    #[test]
    fn claimable_query_orders_oldest_first_and_caps_attempts() {
        let run_id = Uuid::nil();
        let query = claimable_query(run_id, 2, 3);
        assert!(query.starts_with(
            "products?select=*&run_id=eq.00000000-0000-0000-0000-000000000000"
        ));
        assert!(query.contains("qc_status=in.%28draft%2Cfailed%29"));
        assert!(query.contains("order=created_at.asc,id.asc&limit=2"));
        assert!(query.ends_with("&attempts=lt.3"));

        assert!(!claimable_query(run_id, 2, 0).contains("attempts"));
    }

    #[test]
    fn outcome_body_is_flat_with_qc_columns() {
        let outcome = ProductOutcome {
            attributes: ProductAttributes {
                brand: Some("Levi's".into()),
                ..Default::default()
            },
            qc: QcReport {
                status: QcStatus::NeedsReview,
                confidence: 70,
                flags: BTreeSet::from([QcFlag::MissingSize]),
            },
            generated_at: Utc::now(),
        };
        let body = outcome_body(&outcome).expect("body");
        assert_eq!(body["brand"], "Levi's");
        assert_eq!(body["qc_status"], "needs_review");
        assert_eq!(body["confidence"], 70);
        assert_eq!(body["flags"], json!(["missing_size"]));
        assert_eq!(body["status"], "generated");
        assert!(body["last_error"].is_null());
    }

    #[test]
    fn id_lists_are_encoded() {
        let list = id_list(&[Uuid::nil()]);
        assert_eq!(list, "%2800000000-0000-0000-0000-000000000000%29");
    }

    #[test]
    fn new_products_split_into_rows_and_ordered_images() {
        let product = ProductRecord::draft(
            Uuid::nil(),
            ProductAttributes {
                brand: Some("Pendleton".into()),
                ..Default::default()
            },
            vec!["https://img.test/front.jpg".into(), "https://img.test/label.jpg".into()],
        );
        let row = product_row(&product).expect("row");
        assert_eq!(row["brand"], "Pendleton");
        assert_eq!(row["qc_status"], "draft");
        assert!(row.get("images").is_none());

        let images = image_rows(&[product]);
        assert_eq!(images.len(), 2);
        assert_eq!(images[1]["url"], "https://img.test/label.jpg");
        assert_eq!(images[1]["position"], 1);
    }

    #[test]
    fn only_running_or_paused_runs_are_adjustable() {
        assert_eq!(adjustable_filter(), "status=in.%28running%2Cpaused%29");
    }
}
