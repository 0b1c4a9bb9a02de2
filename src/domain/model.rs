use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::state::{BotStatus, BotType, CommitmentLevel, RequestKind, TaskStatus};

/// A product catalog entry. `sub_id` is the canonical Steam package sub id;
/// `store_sub_id` is a secondary, store-crawled fallback used when `sub_id`
/// hasn't been resolved yet.
#[derive(Debug, Clone)]
pub struct Product {
    pub id: i64,
    pub sub_id: Option<i64>,
    pub store_sub_id: Option<i64>,
    pub price_currency: Option<String>,
    /// Whether this product requires a segregated anticheat-purchases bot
    /// pool rather than the ordinary purchases pool.
    pub has_anticheat: bool,
}

impl Product {
    /// Effective sub id used for cart operations: prefer the resolved
    /// `sub_id`, fall back to the store-crawled one.
    pub fn effective_sub_id(&self) -> Option<i64> {
        self.sub_id.or(self.store_sub_id)
    }
}

/// A request row (either a user-gifted request or a paid request),
/// independent of which relation table it's joined through.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: i64,
    pub kind: RequestKind,
    pub visible: bool,
    pub accepted: bool,
    pub sent: bool,
    pub assigned: Option<i64>,
    /// User-request only: whether the steam friend invite has been accepted.
    pub informed: bool,
    pub paid: bool,
    /// Paid-request only: whether payment has cleared on our side.
    pub authed: bool,
    pub promotion: bool,
    pub paid_before_promotion_end_date: bool,
    pub expiration_date: Option<DateTime<Utc>>,
    /// The customer this request belongs to, distinct from `assigned`
    /// (the operator who performs the purchase on the customer's behalf).
    pub user_id: i64,
    /// The customer's external storefront account id, used to add them as
    /// a bot friend and to derive `giftee_account_id` for checkout.
    pub user_external_account_id: String,
}

/// A relation between a request and a product, carrying the commitment
/// state machine described in `domain::state::CommitmentLevel`.
#[derive(Debug, Clone)]
pub struct Relation {
    pub id: i64,
    pub kind: RequestKind,
    pub request_id: i64,
    pub product: Product,
    pub commitment_level: CommitmentLevel,
    pub task_id: Option<i64>,
    pub committed_on_bot: Option<i64>,
    pub shopping_cart_gid: Option<String>,
    pub sent: bool,
}

/// An item queued for cart dispatch, the unit `push_relations` groups by
/// currency and sends to the edge client. Carries `user_id` because a
/// single cart push can mix relations whose requests belong to different
/// customers; the edge bot needs it to know who each gift is for.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CartItem {
    pub sub_id: i64,
    pub user_id: i64,
    pub relation_type: char,
    pub relation_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeServerStatus {
    Enabled,
    Disabled,
}

impl EdgeServerStatus {
    pub fn code(&self) -> i32 {
        match self {
            EdgeServerStatus::Enabled => 1,
            EdgeServerStatus::Disabled => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EdgeServer {
    pub id: i64,
    pub ip_address: String,
    pub currency_code: String,
    pub status: EdgeServerStatus,
    pub last_health_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct EdgeBot {
    pub id: i64,
    pub network_id: i64,
    pub currency_code: String,
    pub bot_type: BotType,
    pub status: BotStatus,
}

#[derive(Debug, Clone)]
pub struct EdgeTask {
    pub id: i64,
    pub edge_bot_id: i64,
    pub edge_server_id: i64,
    pub task_id: i64,
    pub task_name: String,
    pub task_status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// Arbitrary correlation payload the task's creator stashes for its own
    /// result handler — e.g. the `shopping_cart_gid` a `checkout_cart` task
    /// must commit against, carried forward without a second query.
    pub correlation: Option<String>,
}

/// A single item carried through the push/push-result pipeline, tying a
/// `CartItem` back to its owning user for the assignment cascade.
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub item: CartItem,
    pub owner_id: i64,
}

/// Correlates an idempotency key with the wallet send it protects.
#[derive(Debug, Clone)]
pub struct PaymentIdempotencyKey(pub Uuid);

impl PaymentIdempotencyKey {
    pub fn from_shopping_cart_gid(gid: &str) -> Self {
        // The gid is already globally unique; derive a stable UUID from it
        // rather than minting a fresh random key per attempt, so retries of
        // the same cart never double-spend.
        PaymentIdempotencyKey(Uuid::new_v5(&Uuid::NAMESPACE_OID, gid.as_bytes()))
    }
}
