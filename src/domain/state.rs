use std::fmt;

use crate::error::{DispatchError, Result};

/// Commitment level of a single relation (user-request or paid-request) row
/// toward an edge bot's shopping cart. Integer values are persisted as-is and
/// must never be renumbered; they mirror the values the edge fleet has
/// written to disk for years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitmentLevel {
    Uncommitted,
    AddedToCart,
    Purchased,
    FailedToAddCart,
    PushedToCart,
    WaitingForInvite,
}

impl CommitmentLevel {
    pub fn code(&self) -> i32 {
        match self {
            CommitmentLevel::Uncommitted => 0,
            CommitmentLevel::AddedToCart => 1,
            CommitmentLevel::Purchased => 2,
            CommitmentLevel::FailedToAddCart => 3,
            CommitmentLevel::PushedToCart => 4,
            CommitmentLevel::WaitingForInvite => 5,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            0 => CommitmentLevel::Uncommitted,
            1 => CommitmentLevel::AddedToCart,
            2 => CommitmentLevel::Purchased,
            3 => CommitmentLevel::FailedToAddCart,
            4 => CommitmentLevel::PushedToCart,
            5 => CommitmentLevel::WaitingForInvite,
            other => return Err(DispatchError::UnknownCommitmentLevel(other)),
        })
    }

    /// Whether `self -> target` is a transition the orchestrator is allowed
    /// to perform. Rollbacks to `Uncommitted` are always legal from any
    /// state; everything else follows the forward pipeline.
    pub fn can_transition_to(&self, target: CommitmentLevel) -> bool {
        use CommitmentLevel::*;
        if target == Uncommitted {
            return true;
        }
        matches!(
            (self, target),
            (Uncommitted, WaitingForInvite)
                | (Uncommitted, PushedToCart)
                | (WaitingForInvite, PushedToCart)
                | (PushedToCart, AddedToCart)
                | (PushedToCart, FailedToAddCart)
                | (AddedToCart, Purchased)
        )
    }
}

impl fmt::Display for CommitmentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommitmentLevel::Uncommitted => "uncommitted",
            CommitmentLevel::AddedToCart => "added_to_cart",
            CommitmentLevel::Purchased => "purchased",
            CommitmentLevel::FailedToAddCart => "failed_to_add_cart",
            CommitmentLevel::PushedToCart => "pushed_to_cart",
            CommitmentLevel::WaitingForInvite => "waiting_for_invite",
        };
        write!(f, "{s}")
    }
}

/// Status of an edge bot. Integers match the edge fleet's own enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BotStatus {
    StandingBy,
    PushingItemsToCart,
    PurchasingCart,
    WaitingForSufficientFunds,
    BlockedForTooManyPurchases,
    BlockedForUnknownReason,
}

impl BotStatus {
    pub fn code(&self) -> i32 {
        match self {
            BotStatus::StandingBy => 1,
            BotStatus::PushingItemsToCart => 2,
            BotStatus::PurchasingCart => 3,
            BotStatus::WaitingForSufficientFunds => 4,
            BotStatus::BlockedForTooManyPurchases => 5,
            BotStatus::BlockedForUnknownReason => 6,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            1 => BotStatus::StandingBy,
            2 => BotStatus::PushingItemsToCart,
            3 => BotStatus::PurchasingCart,
            4 => BotStatus::WaitingForSufficientFunds,
            5 => BotStatus::BlockedForTooManyPurchases,
            6 => BotStatus::BlockedForUnknownReason,
            other => return Err(DispatchError::UnknownBotStatus(other)),
        })
    }

    pub fn is_available(&self) -> bool {
        matches!(self, BotStatus::StandingBy)
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BotStatus::StandingBy => "standing_by",
            BotStatus::PushingItemsToCart => "pushing_items_to_cart",
            BotStatus::PurchasingCart => "purchasing_cart",
            BotStatus::WaitingForSufficientFunds => "waiting_for_sufficient_funds",
            BotStatus::BlockedForTooManyPurchases => "blocked_for_too_many_purchases",
            BotStatus::BlockedForUnknownReason => "blocked_for_unknown_reason",
        };
        write!(f, "{s}")
    }
}

/// Type of edge bot a task can be dispatched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BotType {
    Purchases,
    Delivery,
    AntiCheatPurchases,
    Notification,
}

impl BotType {
    pub fn code(&self) -> i32 {
        match self {
            BotType::Purchases => 1,
            BotType::Delivery => 2,
            BotType::AntiCheatPurchases => 3,
            BotType::Notification => 4,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            1 => BotType::Purchases,
            2 => BotType::Delivery,
            3 => BotType::AntiCheatPurchases,
            4 => BotType::Notification,
            other => return Err(DispatchError::Internal(format!("unknown bot type: {other}"))),
        })
    }
}

/// Which relation table a row belongs to. Collapses the two historically
/// near-identical tables (user-request vs paid-request relations) into one
/// discriminator so the persistence gateway can carry a single parametric
/// implementation instead of duplicating every query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    UserRequest,
    PaidRequest,
}

impl RequestKind {
    /// Single-letter code used on the wire and in legacy log lines ("A-123", "C-456").
    pub fn letter(&self) -> char {
        match self {
            RequestKind::UserRequest => 'A',
            RequestKind::PaidRequest => 'C',
        }
    }

    pub fn from_letter(letter: char) -> Result<Self> {
        match letter {
            'A' => Ok(RequestKind::UserRequest),
            'C' => Ok(RequestKind::PaidRequest),
            other => Err(DispatchError::Validation(format!(
                "unknown relation type letter: {other}"
            ))),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Status of an `EdgeTask` row, as reported by `task/state/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
        }
    }

    /// Whether the task is still in flight on the bot and the local row
    /// should be left untouched this pass.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = DispatchError;

    fn try_from(value: &str) -> Result<Self> {
        Ok(match value {
            "PENDING" => TaskStatus::Pending,
            "RUNNING" => TaskStatus::Running,
            "SUCCESS" => TaskStatus::Success,
            "FAILURE" => TaskStatus::Failure,
            other => {
                return Err(DispatchError::Validation(format!(
                    "unknown task status: {other}"
                )))
            }
        })
    }
}

/// Which remote operation an `EdgeTask` represents, replacing a dynamic
/// string-keyed dispatch table with an exhaustively-matched enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    AddSubidsToCart,
    CheckoutCart,
    GetExternalLinkFromTransId,
    CartReset,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::AddSubidsToCart => "add_subids_to_cart",
            TaskKind::CheckoutCart => "checkout_cart",
            TaskKind::GetExternalLinkFromTransId => "get_external_link_from_transid",
            TaskKind::CartReset => "cart_reset",
        }
    }
}

impl TryFrom<&str> for TaskKind {
    type Error = DispatchError;

    fn try_from(value: &str) -> Result<Self> {
        Ok(match value {
            "add_subids_to_cart" => TaskKind::AddSubidsToCart,
            "checkout_cart" => TaskKind::CheckoutCart,
            "get_external_link_from_transid" => TaskKind::GetExternalLinkFromTransId,
            "cart_reset" => TaskKind::CartReset,
            other => {
                return Err(DispatchError::Validation(format!(
                    "unknown task kind: {other}"
                )))
            }
        })
    }
}

/// Outcome of a completed edge transaction, mirroring the edge fleet's own
/// result codes. Used to interpret `checkout_cart` task results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionResult {
    Success,
    Fail,
    ShoppingCartGidNotFound,
    TransIdNotFound,
    InsufficientFunds,
    TooManyPurchases,
}

impl TransactionResult {
    pub fn from_code(code: i64) -> Result<Self> {
        Ok(match code {
            1 => TransactionResult::Success,
            2 => TransactionResult::Fail,
            3 => TransactionResult::ShoppingCartGidNotFound,
            4 => TransactionResult::TransIdNotFound,
            5 => TransactionResult::InsufficientFunds,
            6 => TransactionResult::TooManyPurchases,
            other => {
                return Err(DispatchError::Internal(format!(
                    "unknown transaction result code: {other}"
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commitment_level_round_trips_through_code() {
        for level in [
            CommitmentLevel::Uncommitted,
            CommitmentLevel::AddedToCart,
            CommitmentLevel::Purchased,
            CommitmentLevel::FailedToAddCart,
            CommitmentLevel::PushedToCart,
            CommitmentLevel::WaitingForInvite,
        ] {
            assert_eq!(CommitmentLevel::from_code(level.code()).unwrap(), level);
        }
    }

    #[test]
    fn commitment_level_codes_match_the_on_disk_contract() {
        assert_eq!(CommitmentLevel::Uncommitted.code(), 0);
        assert_eq!(CommitmentLevel::AddedToCart.code(), 1);
        assert_eq!(CommitmentLevel::Purchased.code(), 2);
        assert_eq!(CommitmentLevel::FailedToAddCart.code(), 3);
        assert_eq!(CommitmentLevel::PushedToCart.code(), 4);
        assert_eq!(CommitmentLevel::WaitingForInvite.code(), 5);
    }

    #[test]
    fn rollback_to_uncommitted_is_always_legal() {
        assert!(CommitmentLevel::PushedToCart.can_transition_to(CommitmentLevel::Uncommitted));
        assert!(CommitmentLevel::Purchased.can_transition_to(CommitmentLevel::Uncommitted));
    }

    #[test]
    fn purchased_is_a_terminal_forward_state() {
        assert!(!CommitmentLevel::Purchased.can_transition_to(CommitmentLevel::AddedToCart));
        assert!(!CommitmentLevel::Purchased.can_transition_to(CommitmentLevel::PushedToCart));
    }

    #[test]
    fn bot_status_round_trips_through_code() {
        for status in [
            BotStatus::StandingBy,
            BotStatus::PushingItemsToCart,
            BotStatus::PurchasingCart,
            BotStatus::WaitingForSufficientFunds,
            BotStatus::BlockedForTooManyPurchases,
            BotStatus::BlockedForUnknownReason,
        ] {
            assert_eq!(BotStatus::from_code(status.code()).unwrap(), status);
        }
    }

    #[test]
    fn blocked_for_unknown_reason_is_always_the_integer_six() {
        // The edge fleet's legacy controller sometimes wrote an unrelated
        // enum member's value here instead of this status's own code. This
        // implementation only ever has one code path, so the mismatch can't
        // recur: the serialized value is always `code()`, never a `Display`
        // string or a foreign enum's discriminant.
        assert_eq!(BotStatus::BlockedForUnknownReason.code(), 6);
    }

    #[test]
    fn request_kind_letters_round_trip() {
        assert_eq!(RequestKind::from_letter('A').unwrap(), RequestKind::UserRequest);
        assert_eq!(RequestKind::from_letter('C').unwrap(), RequestKind::PaidRequest);
        assert!(RequestKind::from_letter('Z').is_err());
    }
}
