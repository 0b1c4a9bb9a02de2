use async_trait::async_trait;

use crate::domain::{BotStatus, BotType, Candidate, EdgeBot, EdgeServer, CommitmentLevel, RelationEffect, RequestKind, TaskStatus};
use crate::error::Result;

/// A pending task joined with the bot/server it runs against, everything
/// `process_pending_tasks` needs to poll and dispatch follow-ups without a
/// second round trip per task.
#[derive(Debug, Clone)]
pub struct PendingTaskContext {
    pub edge_task_row_id: i64,
    pub task_id: i64,
    pub task_name: String,
    pub bot: EdgeBot,
    pub server: EdgeServer,
    pub correlation: Option<String>,
}

/// Persistence gateway contract the orchestrator depends on, replacing the
/// concrete `PostgresStore` type at the call sites so tests can swap in
/// `adapters::postgres::test_support::FakeStore` (see DESIGN.md).
#[async_trait]
pub trait Store: Send + Sync {
    /// `anticheat_policy`, when `Some`, restricts the fetch to products whose
    /// `has_anticheat` flag matches; `None` fetches regardless of the flag
    /// (used by the committed-sub-id dedup query, which must see every pool).
    async fn get_relations_at_level(
        &self,
        kind: RequestKind,
        owner_id: i64,
        level: CommitmentLevel,
        informed: bool,
        anticheat_policy: Option<bool>,
    ) -> Result<Vec<Candidate>>;

    async fn set_relation_commitment(
        &self,
        kind: RequestKind,
        relation_id: i64,
        level: CommitmentLevel,
        task_id: Option<i64>,
        committed_on_bot: Option<i64>,
        shopping_cart_gid: Option<&str>,
    ) -> Result<()>;

    async fn rollback_pushed_relations(&self, task_id: i64) -> Result<()>;
    async fn rollback_failed_relations(&self, shopping_cart_gid: &str) -> Result<()>;
    async fn apply_relation_effect(&self, effect: &RelationEffect) -> Result<()>;

    /// Marks every relation carrying `shopping_cart_gid` `Purchased`,
    /// assigns their owning requests to `owner_id`, and accepts any request
    /// that is now fully sent and assigned to `owner_id` (§4.4 assignment
    /// cascade). Idempotent: rows already `Purchased`/accepted are no-ops.
    async fn commit_purchased_relations(&self, shopping_cart_gid: &str, owner_id: i64) -> Result<()>;

    async fn assign_request_for_item(&self, kind: RequestKind, relation_id: i64, owner_id: i64) -> Result<()>;
    async fn assign_request(&self, kind: RequestKind, request_id: i64, owner_id: i64) -> Result<()>;

    async fn get_edge_server_for_currency(&self, currency_code: &str) -> Result<Option<EdgeServer>>;
    async fn get_edge_bot_for_currency(&self, currency_code: &str, bot_type: BotType) -> Result<Option<EdgeBot>>;
    async fn get_edge_bot_by_network_id(&self, network_id: i64) -> Result<Option<EdgeBot>>;
    async fn set_edge_bot_status(&self, network_id: i64, status: BotStatus) -> Result<()>;
    async fn update_edge_server_health_check(&self, edge_server_id: i64) -> Result<()>;

    async fn create_edge_task(
        &self,
        edge_bot_id: i64,
        edge_server_id: i64,
        task_id: i64,
        task_name: &str,
        correlation: Option<&str>,
    ) -> Result<i64>;
    async fn update_edge_task_status(&self, task_id: i64, status: TaskStatus) -> Result<()>;
    async fn get_pending_tasks(&self) -> Result<Vec<PendingTaskContext>>;

    /// The external storefront account id for a customer, used to derive
    /// `giftee_account_id` for checkout and as the target of friend invites.
    async fn get_user_external_account_id(&self, user_id: i64) -> Result<Option<String>>;
}
