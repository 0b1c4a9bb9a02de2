use crate::domain::model::CartItem;
use crate::domain::state::CommitmentLevel;

/// Decoded payload of an `add_subids_to_cart` task result.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CartResult {
    pub successful_items: Vec<CartItem>,
    pub failed_items: Vec<CartItem>,
    pub failed_shopping_cart_gids: Vec<String>,
    #[serde(rename = "shoppingCartGID")]
    pub shopping_cart_gid: Option<String>,
}

/// A single relation write the orchestrator must apply, decoupled from the
/// persistence gateway so the ordering rules can be unit tested without a
/// database.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationEffect {
    /// Rollback every relation carrying this `task_id` back to `Uncommitted`,
    /// clearing `task_id`/`committed_on_bot`/`shopping_cart_gid`.
    RollbackPushedForTask { task_id: i64 },
    /// Rollback every relation carrying this `shopping_cart_gid` back to
    /// `Uncommitted`, clearing the same fields.
    RollbackFailedForGid { shopping_cart_gid: String },
    /// Mark one relation as failed to add to cart.
    SetFailedToAddCart {
        relation_type: char,
        relation_id: i64,
        task_id: i64,
        committed_on_bot: i64,
    },
    /// Mark one relation as added to cart, recording the cart gid the item
    /// actually landed in.
    SetAddedToCart {
        relation_type: char,
        relation_id: i64,
        shopping_cart_gid: String,
    },
}

/// Computes the effects of a completed `add_subids_to_cart` task, in the
/// exact order they must be applied. Per-relation writes that happen later
/// in this list override any earlier blanket rollback touching the same
/// row — step 1's rollback is unconditional and always runs first, and
/// steps 2-4 may then re-commit some of the same relations forward.
pub fn process_cart_result(
    task_id: i64,
    edge_bot_network_id: i64,
    result: &CartResult,
) -> Vec<RelationEffect> {
    let mut effects = Vec::new();

    // 1. Always roll back every relation pushed under this task first.
    effects.push(RelationEffect::RollbackPushedForTask { task_id });

    // 2. Any cart gid the bot reports as entirely failed gets its own rollback.
    for gid in &result.failed_shopping_cart_gids {
        effects.push(RelationEffect::RollbackFailedForGid {
            shopping_cart_gid: gid.clone(),
        });
    }

    // 3. Individually failed items move to FailedToAddCart.
    for item in &result.failed_items {
        effects.push(RelationEffect::SetFailedToAddCart {
            relation_type: item.relation_type,
            relation_id: item.relation_id,
            task_id,
            committed_on_bot: edge_bot_network_id,
        });
    }

    // 4. Successful items move to AddedToCart, carrying the gid they landed in.
    if let Some(gid) = &result.shopping_cart_gid {
        for item in &result.successful_items {
            effects.push(RelationEffect::SetAddedToCart {
                relation_type: item.relation_type,
                relation_id: item.relation_id,
                shopping_cart_gid: gid.clone(),
            });
        }
    }

    effects
}

/// Target commitment level each effect ultimately writes, exposed so
/// callers that want to assert invariants without caring about the
/// persistence-layer field list can do so directly.
pub fn effect_target_level(effect: &RelationEffect) -> CommitmentLevel {
    match effect {
        RelationEffect::RollbackPushedForTask { .. }
        | RelationEffect::RollbackFailedForGid { .. } => CommitmentLevel::Uncommitted,
        RelationEffect::SetFailedToAddCart { .. } => CommitmentLevel::FailedToAddCart,
        RelationEffect::SetAddedToCart { .. } => CommitmentLevel::AddedToCart,
    }
}

/// Whether `commit_purchased_relations`'s assignment cascade should mark a
/// request accepted: it must be assigned to the owner performing the
/// cascade, and have zero unsent products left. Pure predicate so the
/// idempotency property (§8 invariant 3 — a second application of the
/// cascade never double-accepts) is testable without a database: a request
/// that is already accepted simply fails the "not yet accepted" check the
/// persistence layer applies before calling this, and re-evaluating the
/// predicate against the same inputs yields the same answer every time.
pub fn should_accept_request(unsent_product_count: i64, assigned: Option<i64>, owner_id: i64) -> bool {
    unsent_product_count == 0 && assigned == Some(owner_id)
}

#[cfg(test)]
mod accept_cascade_tests {
    use super::should_accept_request;

    #[test]
    fn accepts_only_when_fully_sent_and_assigned_to_the_acting_owner() {
        assert!(should_accept_request(0, Some(5), 5));
        assert!(!should_accept_request(1, Some(5), 5));
        assert!(!should_accept_request(0, Some(6), 5));
        assert!(!should_accept_request(0, None, 5));
    }

    #[test]
    fn predicate_is_idempotent_across_repeated_evaluation() {
        let first = should_accept_request(0, Some(5), 5);
        let second = should_accept_request(0, Some(5), 5);
        assert_eq!(first, second);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(relation_type: char, relation_id: i64) -> CartItem {
        CartItem {
            sub_id: relation_id,
            user_id: 1,
            relation_type,
            relation_id,
        }
    }

    #[test]
    fn ordering_is_rollback_then_failed_gids_then_failed_items_then_success() {
        let result = CartResult {
            successful_items: vec![item('A', 1)],
            failed_items: vec![item('C', 2)],
            failed_shopping_cart_gids: vec!["gid-failed".to_string()],
            shopping_cart_gid: Some("gid-ok".to_string()),
        };

        let effects = process_cart_result(99, 7, &result);

        assert_eq!(
            effects,
            vec![
                RelationEffect::RollbackPushedForTask { task_id: 99 },
                RelationEffect::RollbackFailedForGid {
                    shopping_cart_gid: "gid-failed".to_string()
                },
                RelationEffect::SetFailedToAddCart {
                    relation_type: 'C',
                    relation_id: 2,
                    task_id: 99,
                    committed_on_bot: 7,
                },
                RelationEffect::SetAddedToCart {
                    relation_type: 'A',
                    relation_id: 1,
                    shopping_cart_gid: "gid-ok".to_string(),
                },
            ]
        );
    }

    #[test]
    fn successful_items_are_dropped_without_a_gid() {
        let result = CartResult {
            successful_items: vec![item('A', 1)],
            shopping_cart_gid: None,
            ..Default::default()
        };

        let effects = process_cart_result(1, 1, &result);
        assert_eq!(effects, vec![RelationEffect::RollbackPushedForTask { task_id: 1 }]);
    }

    #[test]
    fn blanket_rollback_always_comes_first_even_with_nothing_else_to_apply() {
        let effects = process_cart_result(5, 1, &CartResult::default());
        assert_eq!(effects, vec![RelationEffect::RollbackPushedForTask { task_id: 5 }]);
    }
}
