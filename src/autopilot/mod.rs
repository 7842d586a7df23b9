//! Unattended batch generation over a persisted run.

pub mod memory;
pub mod orchestrator;
pub mod store;

pub use memory::InMemoryStore;
pub use orchestrator::{AutopilotConfig, BatchOrchestrator, BatchReport, BatchTrigger};
pub use store::{DraftProduct, ProductStore, RunStatus, RunStore};
