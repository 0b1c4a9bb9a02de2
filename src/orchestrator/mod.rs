pub mod health;
pub mod invitations;
pub mod push;
pub mod tasks;

use std::sync::Arc;

use crate::adapters::{CrashSink, EdgeClient, Store, WalletClient};
use crate::config::AppConfig;

/// Everything the three entry flows (`send_invitations`, `push_relations`,
/// `process_pending_tasks`) need, replacing the module-level globals the
/// edge fleet's original controllers relied on. `store` is the trait object
/// rather than the concrete `PostgresStore` so tests can swap in
/// `adapters::postgres::test_support::FakeStore`.
#[derive(Clone)]
pub struct OrchestratorContext {
    pub store: Arc<dyn Store>,
    pub edge: EdgeClient,
    pub wallet: Arc<dyn WalletClient>,
    pub crash_sink: Arc<dyn CrashSink>,
    pub config: AppConfig,
}

impl OrchestratorContext {
    pub fn owner_id(&self) -> i64 {
        self.config.owner_id
    }
}
