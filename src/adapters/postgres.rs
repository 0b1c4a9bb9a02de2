use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::instrument;

use crate::adapters::cache::{relation_key, wildcard_relation_keys, CacheInvalidator};
use crate::adapters::store::{PendingTaskContext, Store};
use crate::domain::{
    should_accept_request, BotStatus, BotType, Candidate, CartItem, CommitmentLevel, EdgeBot,
    EdgeServer, EdgeServerStatus, Product, Relation, RelationEffect, Request, RequestKind,
    TaskStatus,
};
use crate::error::Result;

/// Persistence gateway over the relation/request/product/edge-fleet tables.
/// Every write that changes a relation's visible state purges the matching
/// cache key(s) before returning, so a reader never observes a stale
/// commitment level.
pub struct PostgresStore {
    pool: PgPool,
    cache: Arc<dyn CacheInvalidator>,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32, cache: Arc<dyn CacheInvalidator>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool, cache })
    }

    pub fn from_pool(pool: PgPool, cache: Arc<dyn CacheInvalidator>) -> Self {
        Self { pool, cache }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates every table this gateway reads or writes if it doesn't
    /// already exist. Follows the fleet's inline-bootstrap convention
    /// rather than a separate migrations directory: this schema is small
    /// and stable enough that a versioned migration chain is more ceremony
    /// than it's worth.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                id BIGINT PRIMARY KEY,
                external_account_id TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS products (
                id BIGINT PRIMARY KEY,
                sub_id BIGINT,
                store_sub_id BIGINT,
                price_currency TEXT,
                has_anticheat BOOLEAN NOT NULL DEFAULT false
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_requests (
                id BIGINT PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES users(id),
                visible BOOLEAN NOT NULL DEFAULT true,
                accepted BOOLEAN NOT NULL DEFAULT false,
                assigned BIGINT,
                informed BOOLEAN NOT NULL DEFAULT false,
                paid BOOLEAN NOT NULL DEFAULT false,
                promotion BOOLEAN NOT NULL DEFAULT false,
                paid_before_promotion_end_date BOOLEAN NOT NULL DEFAULT false,
                expiration_date TIMESTAMPTZ
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS paid_requests (
                id BIGINT PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES users(id),
                visible BOOLEAN NOT NULL DEFAULT true,
                accepted BOOLEAN NOT NULL DEFAULT false,
                assigned BIGINT,
                authed BOOLEAN NOT NULL DEFAULT false
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS product_user_request_relations (
                id BIGINT PRIMARY KEY,
                request_id BIGINT NOT NULL REFERENCES user_requests(id),
                product_id BIGINT NOT NULL REFERENCES products(id),
                commitment_level INT NOT NULL DEFAULT 0,
                sent BOOLEAN NOT NULL DEFAULT false,
                task_id BIGINT,
                committed_on_bot BIGINT,
                shopping_cart_gid TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS product_paid_request_relations (
                id BIGINT PRIMARY KEY,
                request_id BIGINT NOT NULL REFERENCES paid_requests(id),
                product_id BIGINT NOT NULL REFERENCES products(id),
                commitment_level INT NOT NULL DEFAULT 0,
                sent BOOLEAN NOT NULL DEFAULT false,
                task_id BIGINT,
                committed_on_bot BIGINT,
                shopping_cart_gid TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS edge_servers (
                id BIGINT PRIMARY KEY,
                ip_address TEXT NOT NULL,
                currency_code TEXT NOT NULL,
                status INT NOT NULL DEFAULT 1,
                last_health_check TIMESTAMPTZ
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS edge_bots (
                id BIGINT PRIMARY KEY,
                network_id BIGINT NOT NULL UNIQUE,
                currency_code TEXT NOT NULL,
                bot_type INT NOT NULL,
                status INT NOT NULL DEFAULT 1
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS edge_tasks (
                id BIGSERIAL PRIMARY KEY,
                edge_bot_id BIGINT NOT NULL REFERENCES edge_bots(id),
                edge_server_id BIGINT NOT NULL REFERENCES edge_servers(id),
                task_id BIGINT NOT NULL,
                task_name TEXT NOT NULL,
                task_status TEXT NOT NULL DEFAULT 'PENDING',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                correlation TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn relation_table(kind: RequestKind) -> &'static str {
        match kind {
            RequestKind::UserRequest => "product_user_request_relations",
            RequestKind::PaidRequest => "product_paid_request_relations",
        }
    }

    fn request_table(kind: RequestKind) -> &'static str {
        match kind {
            RequestKind::UserRequest => "user_requests",
            RequestKind::PaidRequest => "paid_requests",
        }
    }

    #[instrument(skip(self))]
    async fn count_unsent_products_for_request(&self, kind: RequestKind, request_id: i64) -> Result<i64> {
        let table = Self::relation_table(kind);
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS unsent FROM {table} WHERE request_id = $1 AND sent = false"
        ))
        .bind(request_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("unsent")?)
    }

    #[instrument(skip(self))]
    async fn accept_request(&self, kind: RequestKind, request_id: i64) -> Result<()> {
        let table = Self::request_table(kind);
        sqlx::query(&format!("UPDATE {table} SET accepted = true WHERE id = $1"))
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn assigned_for_request(&self, kind: RequestKind, request_id: i64) -> Result<Option<i64>> {
        let table = Self::request_table(kind);
        let row = sqlx::query(&format!("SELECT assigned FROM {table} WHERE id = $1"))
            .bind(request_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("assigned")?)
    }
}

#[async_trait]
impl Store for PostgresStore {
    /// Fetches relations at the given commitment level for relations whose
    /// request is unassigned or assigned to `owner_id`, joined with their
    /// owning request, product, and customer, applying the kind-specific
    /// visibility/accepted/assigned(/informed) filters the selector expects
    /// to already be satisfied.
    #[instrument(skip(self))]
    async fn get_relations_at_level(
        &self,
        kind: RequestKind,
        owner_id: i64,
        level: CommitmentLevel,
        informed: bool,
        anticheat_policy: Option<bool>,
    ) -> Result<Vec<Candidate>> {
        let relation_table = Self::relation_table(kind);
        let request_table = Self::request_table(kind);

        // `UserRequest` binds an extra `paid_flag` parameter the `PaidRequest`
        // branch has no clause for (it hardcodes `q.authed = true` instead),
        // so the anticheat placeholder's number shifts per kind rather than
        // always being `$4`.
        let (query, bind_paid_flag) = match kind {
            RequestKind::UserRequest => {
                let anticheat_clause = if anticheat_policy.is_some() { " AND p.has_anticheat = $4" } else { "" };
                (
                    format!(
                        "SELECT r.id, r.request_id, r.task_id, r.committed_on_bot, r.shopping_cart_gid, \
                                r.sent, r.commitment_level, \
                                p.id as product_id, p.sub_id, p.store_sub_id, p.price_currency, p.has_anticheat, \
                                q.visible, q.accepted, q.assigned, q.informed, q.paid, \
                                q.promotion, q.paid_before_promotion_end_date, q.expiration_date, \
                                q.user_id, u.external_account_id \
                         FROM {relation_table} r \
                         JOIN {request_table} q ON q.id = r.request_id \
                         JOIN products p ON p.id = r.product_id \
                         JOIN users u ON u.id = q.user_id \
                         WHERE r.commitment_level = $1 AND r.sent = false \
                           AND q.visible = true AND q.accepted = false \
                           AND (q.assigned IS NULL OR q.assigned = $2) \
                           AND q.paid = $3{anticheat_clause}"
                    ),
                    true,
                )
            }
            RequestKind::PaidRequest => {
                let anticheat_clause = if anticheat_policy.is_some() { " AND p.has_anticheat = $3" } else { "" };
                (
                    format!(
                        "SELECT r.id, r.request_id, r.task_id, r.committed_on_bot, r.shopping_cart_gid, \
                                r.sent, r.commitment_level, \
                                p.id as product_id, p.sub_id, p.store_sub_id, p.price_currency, p.has_anticheat, \
                                q.visible, q.accepted, q.assigned, false as informed, true as paid, \
                                false as promotion, false as paid_before_promotion_end_date, \
                                NULL::timestamptz as expiration_date, \
                                q.user_id, u.external_account_id \
                         FROM {relation_table} r \
                         JOIN {request_table} q ON q.id = r.request_id \
                         JOIN products p ON p.id = r.product_id \
                         JOIN users u ON u.id = q.user_id \
                         WHERE r.commitment_level = $1 AND r.sent = false \
                           AND q.authed = true AND q.visible = true AND q.accepted = false \
                           AND (q.assigned IS NULL OR q.assigned = $2){anticheat_clause}"
                    ),
                    false,
                )
            }
        };

        let mut built = sqlx::query(&query).bind(level.code()).bind(owner_id);
        if bind_paid_flag {
            built = built.bind(!informed);
        }
        if let Some(flag) = anticheat_policy {
            built = built.bind(flag);
        }
        let rows = built.fetch_all(&self.pool).await?;

        rows.into_iter().map(|row| row_to_candidate(kind, row)).collect()
    }

    #[instrument(skip(self))]
    async fn set_relation_commitment(
        &self,
        kind: RequestKind,
        relation_id: i64,
        level: CommitmentLevel,
        task_id: Option<i64>,
        committed_on_bot: Option<i64>,
        shopping_cart_gid: Option<&str>,
    ) -> Result<()> {
        let table = Self::relation_table(kind);
        sqlx::query(&format!(
            "UPDATE {table} SET commitment_level = $1, \
             task_id = COALESCE($2, task_id), \
             committed_on_bot = COALESCE($3, committed_on_bot), \
             shopping_cart_gid = COALESCE($4, shopping_cart_gid) \
             WHERE id = $5"
        ))
        .bind(level.code())
        .bind(task_id)
        .bind(committed_on_bot)
        .bind(shopping_cart_gid)
        .bind(relation_id)
        .execute(&self.pool)
        .await?;

        self.cache.purge(&[relation_key(kind, relation_id)]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn rollback_pushed_relations(&self, task_id: i64) -> Result<()> {
        for kind in [RequestKind::UserRequest, RequestKind::PaidRequest] {
            let table = Self::relation_table(kind);
            sqlx::query(&format!(
                "UPDATE {table} SET commitment_level = $1, task_id = NULL, \
                 committed_on_bot = NULL, shopping_cart_gid = NULL WHERE task_id = $2"
            ))
            .bind(CommitmentLevel::Uncommitted.code())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        }
        self.cache.purge(&wildcard_relation_keys()).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn rollback_failed_relations(&self, shopping_cart_gid: &str) -> Result<()> {
        for kind in [RequestKind::UserRequest, RequestKind::PaidRequest] {
            let table = Self::relation_table(kind);
            sqlx::query(&format!(
                "UPDATE {table} SET task_id = NULL, committed_on_bot = NULL, \
                 shopping_cart_gid = NULL, commitment_level = $1 \
                 WHERE shopping_cart_gid = $2"
            ))
            .bind(CommitmentLevel::Uncommitted.code())
            .bind(shopping_cart_gid)
            .execute(&self.pool)
            .await?;
        }
        self.cache.purge(&wildcard_relation_keys()).await?;
        Ok(())
    }

    /// Applies a single precomputed `RelationEffect` (see
    /// `domain::reconciler::process_cart_result`).
    #[instrument(skip(self, effect))]
    async fn apply_relation_effect(&self, effect: &RelationEffect) -> Result<()> {
        match effect {
            RelationEffect::RollbackPushedForTask { task_id } => self.rollback_pushed_relations(*task_id).await,
            RelationEffect::RollbackFailedForGid { shopping_cart_gid } => {
                self.rollback_failed_relations(shopping_cart_gid).await
            }
            RelationEffect::SetFailedToAddCart {
                relation_type,
                relation_id,
                task_id,
                committed_on_bot,
            } => {
                let kind = RequestKind::from_letter(*relation_type)?;
                self.set_relation_commitment(
                    kind,
                    *relation_id,
                    CommitmentLevel::FailedToAddCart,
                    Some(*task_id),
                    Some(*committed_on_bot),
                    None,
                )
                .await
            }
            RelationEffect::SetAddedToCart {
                relation_type,
                relation_id,
                shopping_cart_gid,
            } => {
                let kind = RequestKind::from_letter(*relation_type)?;
                self.set_relation_commitment(
                    kind,
                    *relation_id,
                    CommitmentLevel::AddedToCart,
                    None,
                    None,
                    Some(shopping_cart_gid.as_str()),
                )
                .await
            }
        }
    }

    /// Marks every relation carrying `shopping_cart_gid` `Purchased`, assigns
    /// the owning request to `owner_id`, then accepts any touched request
    /// that is now fully sent and assigned to `owner_id`. A second call
    /// against the same gid finds no non-`Purchased` rows and no unaccepted
    /// fully-sent request left, so it's a no-op.
    #[instrument(skip(self))]
    async fn commit_purchased_relations(&self, shopping_cart_gid: &str, owner_id: i64) -> Result<()> {
        let mut touched_requests: Vec<(RequestKind, i64)> = Vec::new();

        for kind in [RequestKind::UserRequest, RequestKind::PaidRequest] {
            let relation_table = Self::relation_table(kind);
            let rows = sqlx::query(&format!(
                "SELECT id, request_id FROM {relation_table} \
                 WHERE shopping_cart_gid = $1 AND commitment_level != $2"
            ))
            .bind(shopping_cart_gid)
            .bind(CommitmentLevel::Purchased.code())
            .fetch_all(&self.pool)
            .await?;

            for row in rows {
                let relation_id: i64 = row.try_get("id")?;
                let request_id: i64 = row.try_get("request_id")?;

                sqlx::query(&format!(
                    "UPDATE {relation_table} SET commitment_level = $1, sent = true WHERE id = $2"
                ))
                .bind(CommitmentLevel::Purchased.code())
                .bind(relation_id)
                .execute(&self.pool)
                .await?;
                self.cache.purge(&[relation_key(kind, relation_id)]).await?;

                self.assign_request(kind, request_id, owner_id).await?;
                touched_requests.push((kind, request_id));
            }
        }

        for (kind, request_id) in touched_requests {
            let assigned = self.assigned_for_request(kind, request_id).await?;
            let unsent = self.count_unsent_products_for_request(kind, request_id).await?;
            if should_accept_request(unsent, assigned, owner_id) {
                self.accept_request(kind, request_id).await?;
            }
        }

        Ok(())
    }

    /// Looks up the request a relation belongs to and assigns it, for
    /// callers that only have a relation id on hand (e.g. the push loop,
    /// which is iterating `CartItem`s rather than joined rows).
    #[instrument(skip(self))]
    async fn assign_request_for_item(&self, kind: RequestKind, relation_id: i64, owner_id: i64) -> Result<()> {
        let relation_table = Self::relation_table(kind);
        let row = sqlx::query(&format!("SELECT request_id FROM {relation_table} WHERE id = $1"))
            .bind(relation_id)
            .fetch_one(&self.pool)
            .await?;
        let request_id: i64 = row.try_get("request_id")?;
        self.assign_request(kind, request_id, owner_id).await
    }

    #[instrument(skip(self))]
    async fn assign_request(&self, kind: RequestKind, request_id: i64, owner_id: i64) -> Result<()> {
        let table = Self::request_table(kind);
        sqlx::query(&format!(
            "UPDATE {table} SET assigned = COALESCE(assigned, $1) WHERE id = $2"
        ))
        .bind(owner_id)
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_edge_server_for_currency(&self, currency_code: &str) -> Result<Option<EdgeServer>> {
        let row = sqlx::query(
            "SELECT id, ip_address, currency_code, status, last_health_check \
             FROM edge_servers WHERE currency_code = $1 AND status = $2",
        )
        .bind(currency_code)
        .bind(EdgeServerStatus::Enabled.code())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(EdgeServer {
                id: r.try_get("id")?,
                ip_address: r.try_get("ip_address")?,
                currency_code: r.try_get("currency_code")?,
                status: EdgeServerStatus::Enabled,
                last_health_check: r.try_get("last_health_check")?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn get_edge_bot_for_currency(&self, currency_code: &str, bot_type: BotType) -> Result<Option<EdgeBot>> {
        let row = sqlx::query(
            "SELECT id, network_id, currency_code, bot_type, status \
             FROM edge_bots WHERE currency_code = $1 AND bot_type = $2 AND status = $3",
        )
        .bind(currency_code)
        .bind(bot_type.code())
        .bind(BotStatus::StandingBy.code())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_bot).transpose()
    }

    #[instrument(skip(self))]
    async fn get_edge_bot_by_network_id(&self, network_id: i64) -> Result<Option<EdgeBot>> {
        let row = sqlx::query(
            "SELECT id, network_id, currency_code, bot_type, status FROM edge_bots WHERE network_id = $1",
        )
        .bind(network_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_bot).transpose()
    }

    #[instrument(skip(self))]
    async fn set_edge_bot_status(&self, network_id: i64, status: BotStatus) -> Result<()> {
        sqlx::query("UPDATE edge_bots SET status = $1 WHERE network_id = $2")
            .bind(status.code())
            .bind(network_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_edge_server_health_check(&self, edge_server_id: i64) -> Result<()> {
        sqlx::query("UPDATE edge_servers SET last_health_check = now() WHERE id = $1")
            .bind(edge_server_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_edge_task(
        &self,
        edge_bot_id: i64,
        edge_server_id: i64,
        task_id: i64,
        task_name: &str,
        correlation: Option<&str>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO edge_tasks (edge_bot_id, edge_server_id, task_id, task_name, task_status, created_at, correlation) \
             VALUES ($1, $2, $3, $4, $5, now(), $6) RETURNING id",
        )
        .bind(edge_bot_id)
        .bind(edge_server_id)
        .bind(task_id)
        .bind(task_name)
        .bind(TaskStatus::Pending.as_str())
        .bind(correlation)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    #[instrument(skip(self))]
    async fn update_edge_task_status(&self, task_id: i64, status: TaskStatus) -> Result<()> {
        sqlx::query("UPDATE edge_tasks SET task_status = $1 WHERE task_id = $2")
            .bind(status.as_str())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_pending_tasks(&self) -> Result<Vec<PendingTaskContext>> {
        let rows = sqlx::query(
            "SELECT t.id as row_id, t.task_id, t.task_name, t.correlation, \
                    b.id as bot_id, b.network_id, b.currency_code as bot_currency, b.bot_type, b.status as bot_status, \
                    s.id as server_id, s.ip_address, s.currency_code as server_currency, s.status as server_status, s.last_health_check \
             FROM edge_tasks t \
             JOIN edge_bots b ON b.id = t.edge_bot_id \
             JOIN edge_servers s ON s.id = t.edge_server_id \
             WHERE t.task_status = $1",
        )
        .bind(TaskStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let bot_status_code: i32 = r.try_get("bot_status")?;
                let bot_type_code: i32 = r.try_get("bot_type")?;
                let server_status_code: i32 = r.try_get("server_status")?;
                Ok(PendingTaskContext {
                    edge_task_row_id: r.try_get("row_id")?,
                    task_id: r.try_get("task_id")?,
                    task_name: r.try_get("task_name")?,
                    correlation: r.try_get("correlation")?,
                    bot: EdgeBot {
                        id: r.try_get("bot_id")?,
                        network_id: r.try_get("network_id")?,
                        currency_code: r.try_get("bot_currency")?,
                        bot_type: BotType::from_code(bot_type_code)?,
                        status: BotStatus::from_code(bot_status_code)?,
                    },
                    server: EdgeServer {
                        id: r.try_get("server_id")?,
                        ip_address: r.try_get("ip_address")?,
                        currency_code: r.try_get("server_currency")?,
                        status: if server_status_code == EdgeServerStatus::Enabled.code() {
                            EdgeServerStatus::Enabled
                        } else {
                            EdgeServerStatus::Disabled
                        },
                        last_health_check: r.try_get("last_health_check")?,
                    },
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn get_user_external_account_id(&self, user_id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT external_account_id FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get("external_account_id")).transpose().map_err(Into::into)
    }
}

fn row_to_bot(r: sqlx::postgres::PgRow) -> Result<EdgeBot> {
    let status_code: i32 = r.try_get("status")?;
    let bot_type_code: i32 = r.try_get("bot_type")?;
    Ok(EdgeBot {
        id: r.try_get("id")?,
        network_id: r.try_get("network_id")?,
        currency_code: r.try_get("currency_code")?,
        bot_type: BotType::from_code(bot_type_code)?,
        status: BotStatus::from_code(status_code)?,
    })
}

fn row_to_candidate(kind: RequestKind, row: sqlx::postgres::PgRow) -> Result<Candidate> {
    let commitment_level_code: i32 = row.try_get("commitment_level")?;
    let product = Product {
        id: row.try_get("product_id")?,
        sub_id: row.try_get("sub_id")?,
        store_sub_id: row.try_get("store_sub_id")?,
        price_currency: row.try_get("price_currency")?,
        has_anticheat: row.try_get("has_anticheat")?,
    };

    let relation = Relation {
        id: row.try_get("id")?,
        kind,
        request_id: row.try_get("request_id")?,
        product,
        commitment_level: CommitmentLevel::from_code(commitment_level_code)?,
        task_id: row.try_get("task_id")?,
        committed_on_bot: row.try_get("committed_on_bot")?,
        shopping_cart_gid: row.try_get("shopping_cart_gid")?,
        sent: row.try_get("sent")?,
    };

    let request = Request {
        id: relation.request_id,
        kind,
        visible: row.try_get("visible")?,
        accepted: row.try_get("accepted")?,
        sent: relation.sent,
        assigned: row.try_get("assigned")?,
        informed: row.try_get("informed")?,
        paid: row.try_get("paid")?,
        authed: true,
        promotion: row.try_get("promotion")?,
        paid_before_promotion_end_date: row.try_get("paid_before_promotion_end_date")?,
        expiration_date: row.try_get::<Option<DateTime<Utc>>, _>("expiration_date")?,
        user_id: row.try_get("user_id")?,
        user_external_account_id: row.try_get("external_account_id")?,
    };

    Ok(Candidate { relation, request })
}

/// Lightweight helper the orchestrator uses to total up a nested
/// `{user_id -> {currency -> items}}` selection batch for logging.
pub fn total_item_count(
    batches: &std::collections::BTreeMap<i64, std::collections::BTreeMap<String, Vec<CartItem>>>,
) -> usize {
    batches.values().flat_map(|by_currency| by_currency.values()).map(Vec::len).sum()
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

/// In-memory `Store` implementation backing the round-trip scenario tests
/// in `tests/` without a live Postgres instance.
pub mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Debug, Clone)]
    struct RelationRow {
        relation: Relation,
        request_id: i64,
    }

    #[derive(Default)]
    struct FakeState {
        user_relations: HashMap<i64, RelationRow>,
        paid_relations: HashMap<i64, RelationRow>,
        user_requests: HashMap<i64, Request>,
        paid_requests: HashMap<i64, Request>,
        servers: HashMap<i64, EdgeServer>,
        bots: HashMap<i64, EdgeBot>,
        bots_by_network: HashMap<i64, i64>,
        tasks: HashMap<i64, (i64, i64, i64, String, TaskStatus, Option<String>)>,
        next_task_row_id: i64,
        users: HashMap<i64, String>,
    }

    /// Plain in-memory fake implementing [`Store`]. Seed it via the
    /// `seed_*` helpers, then drive it through `orchestrator` entry points
    /// exactly as `PostgresStore` would be driven in production.
    #[derive(Default)]
    pub struct FakeStore {
        state: Mutex<FakeState>,
    }

    impl FakeStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed_user(&self, id: i64, external_account_id: &str) {
            self.state.lock().unwrap().users.insert(id, external_account_id.to_string());
        }

        pub fn seed_server(&self, server: EdgeServer) {
            self.state.lock().unwrap().servers.insert(server.id, server);
        }

        pub fn seed_bot(&self, bot: EdgeBot) {
            let mut state = self.state.lock().unwrap();
            state.bots_by_network.insert(bot.network_id, bot.id);
            state.bots.insert(bot.id, bot);
        }

        pub fn seed_user_request(&self, request: Request, relation: Relation) {
            let mut state = self.state.lock().unwrap();
            state.user_requests.insert(request.id, request.clone());
            state.user_relations.insert(
                relation.id,
                RelationRow {
                    relation,
                    request_id: request.id,
                },
            );
        }

        pub fn seed_paid_request(&self, request: Request, relation: Relation) {
            let mut state = self.state.lock().unwrap();
            state.paid_requests.insert(request.id, request.clone());
            state.paid_relations.insert(
                relation.id,
                RelationRow {
                    relation,
                    request_id: request.id,
                },
            );
        }

        pub fn relation(&self, kind: RequestKind, relation_id: i64) -> Relation {
            let state = self.state.lock().unwrap();
            let table = match kind {
                RequestKind::UserRequest => &state.user_relations,
                RequestKind::PaidRequest => &state.paid_relations,
            };
            table.get(&relation_id).expect("relation seeded").relation.clone()
        }

        pub fn request(&self, kind: RequestKind, request_id: i64) -> Request {
            let state = self.state.lock().unwrap();
            let table = match kind {
                RequestKind::UserRequest => &state.user_requests,
                RequestKind::PaidRequest => &state.paid_requests,
            };
            table.get(&request_id).expect("request seeded").clone()
        }

        pub fn bot(&self, network_id: i64) -> EdgeBot {
            let state = self.state.lock().unwrap();
            let id = state.bots_by_network[&network_id];
            state.bots[&id].clone()
        }

        fn relations_mut(state: &mut FakeState, kind: RequestKind) -> &mut HashMap<i64, RelationRow> {
            match kind {
                RequestKind::UserRequest => &mut state.user_relations,
                RequestKind::PaidRequest => &mut state.paid_relations,
            }
        }

        fn requests_mut(state: &mut FakeState, kind: RequestKind) -> &mut HashMap<i64, Request> {
            match kind {
                RequestKind::UserRequest => &mut state.user_requests,
                RequestKind::PaidRequest => &mut state.paid_requests,
            }
        }
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn get_relations_at_level(
            &self,
            kind: RequestKind,
            owner_id: i64,
            level: CommitmentLevel,
            informed: bool,
            anticheat_policy: Option<bool>,
        ) -> Result<Vec<Candidate>> {
            let state = self.state.lock().unwrap();
            let relations = match kind {
                RequestKind::UserRequest => &state.user_relations,
                RequestKind::PaidRequest => &state.paid_relations,
            };
            let requests = match kind {
                RequestKind::UserRequest => &state.user_requests,
                RequestKind::PaidRequest => &state.paid_requests,
            };

            let mut out = Vec::new();
            for row in relations.values() {
                if row.relation.commitment_level != level || row.relation.sent {
                    continue;
                }
                let Some(request) = requests.get(&row.request_id) else { continue };
                if !request.visible || request.accepted {
                    continue;
                }
                if !(request.assigned.is_none() || request.assigned == Some(owner_id)) {
                    continue;
                }
                if let Some(flag) = anticheat_policy {
                    if row.relation.product.has_anticheat != flag {
                        continue;
                    }
                }
                match kind {
                    RequestKind::UserRequest => {
                        if request.paid != !informed {
                            continue;
                        }
                    }
                    RequestKind::PaidRequest => {
                        if !request.authed {
                            continue;
                        }
                    }
                }
                out.push(Candidate {
                    relation: row.relation.clone(),
                    request: request.clone(),
                });
            }
            Ok(out)
        }

        async fn set_relation_commitment(
            &self,
            kind: RequestKind,
            relation_id: i64,
            level: CommitmentLevel,
            task_id: Option<i64>,
            committed_on_bot: Option<i64>,
            shopping_cart_gid: Option<&str>,
        ) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let row = Self::relations_mut(&mut state, kind)
                .get_mut(&relation_id)
                .expect("relation seeded");
            row.relation.commitment_level = level;
            if let Some(t) = task_id {
                row.relation.task_id = Some(t);
            }
            if let Some(b) = committed_on_bot {
                row.relation.committed_on_bot = Some(b);
            }
            if let Some(g) = shopping_cart_gid {
                row.relation.shopping_cart_gid = Some(g.to_string());
            }
            Ok(())
        }

        async fn rollback_pushed_relations(&self, task_id: i64) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            for table in [&mut state.user_relations, &mut state.paid_relations] {
                for row in table.values_mut() {
                    if row.relation.task_id == Some(task_id) {
                        row.relation.commitment_level = CommitmentLevel::Uncommitted;
                        row.relation.task_id = None;
                        row.relation.committed_on_bot = None;
                        row.relation.shopping_cart_gid = None;
                    }
                }
            }
            Ok(())
        }

        async fn rollback_failed_relations(&self, shopping_cart_gid: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            for table in [&mut state.user_relations, &mut state.paid_relations] {
                for row in table.values_mut() {
                    if row.relation.shopping_cart_gid.as_deref() == Some(shopping_cart_gid) {
                        row.relation.commitment_level = CommitmentLevel::Uncommitted;
                        row.relation.task_id = None;
                        row.relation.committed_on_bot = None;
                        row.relation.shopping_cart_gid = None;
                    }
                }
            }
            Ok(())
        }

        async fn apply_relation_effect(&self, effect: &RelationEffect) -> Result<()> {
            match effect {
                RelationEffect::RollbackPushedForTask { task_id } => self.rollback_pushed_relations(*task_id).await,
                RelationEffect::RollbackFailedForGid { shopping_cart_gid } => {
                    self.rollback_failed_relations(shopping_cart_gid).await
                }
                RelationEffect::SetFailedToAddCart {
                    relation_type,
                    relation_id,
                    task_id,
                    committed_on_bot,
                } => {
                    let kind = RequestKind::from_letter(*relation_type)?;
                    self.set_relation_commitment(
                        kind,
                        *relation_id,
                        CommitmentLevel::FailedToAddCart,
                        Some(*task_id),
                        Some(*committed_on_bot),
                        None,
                    )
                    .await
                }
                RelationEffect::SetAddedToCart {
                    relation_type,
                    relation_id,
                    shopping_cart_gid,
                } => {
                    let kind = RequestKind::from_letter(*relation_type)?;
                    self.set_relation_commitment(
                        kind,
                        *relation_id,
                        CommitmentLevel::AddedToCart,
                        None,
                        None,
                        Some(shopping_cart_gid.as_str()),
                    )
                    .await
                }
            }
        }

        async fn commit_purchased_relations(&self, shopping_cart_gid: &str, owner_id: i64) -> Result<()> {
            let mut touched: Vec<(RequestKind, i64)> = Vec::new();
            {
                let mut state = self.state.lock().unwrap();
                for kind in [RequestKind::UserRequest, RequestKind::PaidRequest] {
                    let relation_ids: Vec<i64> = Self::relations_mut(&mut state, kind)
                        .values()
                        .filter(|r| {
                            r.relation.shopping_cart_gid.as_deref() == Some(shopping_cart_gid)
                                && r.relation.commitment_level != CommitmentLevel::Purchased
                        })
                        .map(|r| r.relation.id)
                        .collect();

                    for relation_id in relation_ids {
                        let request_id = {
                            let row = Self::relations_mut(&mut state, kind).get_mut(&relation_id).unwrap();
                            row.relation.commitment_level = CommitmentLevel::Purchased;
                            row.relation.sent = true;
                            row.request_id
                        };
                        {
                            let request = Self::requests_mut(&mut state, kind).get_mut(&request_id).unwrap();
                            request.sent = true;
                            if request.assigned.is_none() {
                                request.assigned = Some(owner_id);
                            }
                        }
                        touched.push((kind, request_id));
                    }
                }
            }

            for (kind, request_id) in touched {
                let mut state = self.state.lock().unwrap();
                let unsent = {
                    let relations = match kind {
                        RequestKind::UserRequest => &state.user_relations,
                        RequestKind::PaidRequest => &state.paid_relations,
                    };
                    relations
                        .values()
                        .filter(|r| r.request_id == request_id && !r.relation.sent)
                        .count() as i64
                };
                let requests = Self::requests_mut(&mut state, kind);
                let request = requests.get_mut(&request_id).unwrap();
                if should_accept_request(unsent, request.assigned, owner_id) {
                    request.accepted = true;
                }
            }
            Ok(())
        }

        async fn assign_request_for_item(&self, kind: RequestKind, relation_id: i64, owner_id: i64) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let request_id = Self::relations_mut(&mut state, kind).get(&relation_id).unwrap().request_id;
            let request = Self::requests_mut(&mut state, kind).get_mut(&request_id).unwrap();
            if request.assigned.is_none() {
                request.assigned = Some(owner_id);
            }
            Ok(())
        }

        async fn assign_request(&self, kind: RequestKind, request_id: i64, owner_id: i64) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let request = Self::requests_mut(&mut state, kind).get_mut(&request_id).unwrap();
            if request.assigned.is_none() {
                request.assigned = Some(owner_id);
            }
            Ok(())
        }

        async fn get_edge_server_for_currency(&self, currency_code: &str) -> Result<Option<EdgeServer>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .servers
                .values()
                .find(|s| s.currency_code == currency_code && s.status == EdgeServerStatus::Enabled)
                .cloned())
        }

        async fn get_edge_bot_for_currency(&self, currency_code: &str, bot_type: BotType) -> Result<Option<EdgeBot>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .bots
                .values()
                .find(|b| b.currency_code == currency_code && b.bot_type == bot_type && b.status == BotStatus::StandingBy)
                .cloned())
        }

        async fn get_edge_bot_by_network_id(&self, network_id: i64) -> Result<Option<EdgeBot>> {
            let state = self.state.lock().unwrap();
            Ok(state.bots_by_network.get(&network_id).and_then(|id| state.bots.get(id)).cloned())
        }

        async fn set_edge_bot_status(&self, network_id: i64, status: BotStatus) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let id = state.bots_by_network[&network_id];
            state.bots.get_mut(&id).unwrap().status = status;
            Ok(())
        }

        async fn update_edge_server_health_check(&self, edge_server_id: i64) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(server) = state.servers.get_mut(&edge_server_id) {
                server.last_health_check = Some(chrono::Utc::now());
            }
            Ok(())
        }

        async fn create_edge_task(
            &self,
            edge_bot_id: i64,
            edge_server_id: i64,
            task_id: i64,
            task_name: &str,
            correlation: Option<&str>,
        ) -> Result<i64> {
            let mut state = self.state.lock().unwrap();
            state.next_task_row_id += 1;
            let row_id = state.next_task_row_id;
            state.tasks.insert(
                row_id,
                (
                    edge_bot_id,
                    edge_server_id,
                    task_id,
                    task_name.to_string(),
                    TaskStatus::Pending,
                    correlation.map(str::to_string),
                ),
            );
            Ok(row_id)
        }

        async fn update_edge_task_status(&self, task_id: i64, status: TaskStatus) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            for entry in state.tasks.values_mut() {
                if entry.2 == task_id {
                    entry.4 = status;
                }
            }
            Ok(())
        }

        async fn get_pending_tasks(&self) -> Result<Vec<PendingTaskContext>> {
            let state = self.state.lock().unwrap();
            let mut out = Vec::new();
            for (row_id, (bot_id, server_id, task_id, task_name, status, correlation)) in state.tasks.iter() {
                if *status != TaskStatus::Pending {
                    continue;
                }
                let bot = state.bots[bot_id].clone();
                let server = state.servers[server_id].clone();
                out.push(PendingTaskContext {
                    edge_task_row_id: *row_id,
                    task_id: *task_id,
                    correlation: correlation.clone(),
                    task_name: task_name.clone(),
                    bot,
                    server,
                });
            }
            Ok(out)
        }

        async fn get_user_external_account_id(&self, user_id: i64) -> Result<Option<String>> {
            Ok(self.state.lock().unwrap().users.get(&user_id).cloned())
        }
    }
}
