pub mod model;
pub mod reconciler;
pub mod selector;
pub mod state;

pub use model::{
    CartItem, EdgeBot, EdgeServer, EdgeServerStatus, EdgeTask, PaymentIdempotencyKey,
    PendingItem, Product, Relation, Request,
};
pub use reconciler::{effect_target_level, process_cart_result, should_accept_request, CartResult, RelationEffect};
pub use selector::{committed_sub_ids_by_user, select_uncommitted, Candidate, SelectionBatches};
pub use state::{
    BotStatus, BotType, CommitmentLevel, RequestKind, TaskKind, TaskStatus, TransactionResult,
};
