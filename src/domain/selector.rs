use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::domain::model::{CartItem, Relation, Request};
use crate::domain::state::RequestKind;

/// Candidate relation paired with its owning request, as handed to the
/// selector after the persistence gateway has already applied the
/// commitment-level and visibility/accepted/assigned filters.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub relation: Relation,
    pub request: Request,
}

/// Cart items selected for dispatch, grouped `user_id -> currency_code ->
/// items` per spec §4.1, kept separate by relation kind since paid- and
/// user-request relations follow different bot-binding policies downstream
/// (paid relations pick a fresh bot; user relations reuse the bot they were
/// invited through).
#[derive(Debug, Clone, Default)]
pub struct SelectionBatches {
    pub paid: BTreeMap<i64, BTreeMap<String, Vec<CartItem>>>,
    pub user: BTreeMap<i64, BTreeMap<String, Vec<CartItem>>>,
}

/// Groups candidate relations into per-user, per-currency cart batches,
/// deduplicating by effective sub id (scoped to each customer) and skipping
/// sub ids already sitting in that customer's cart.
///
/// Paid-request candidates are folded in before user-request candidates, so
/// when both kinds would otherwise claim the same sub id for the same
/// customer, the paid-request relation wins — it is considered first and
/// reserves the sub id.
pub fn select_uncommitted(
    paid_candidates: &[Candidate],
    user_candidates: &[Candidate],
    already_committed_sub_ids: &BTreeMap<i64, Vec<i64>>,
    now: DateTime<Utc>,
) -> SelectionBatches {
    let mut batches = SelectionBatches::default();
    let mut seen_sub_ids: BTreeMap<i64, Vec<i64>> = already_committed_sub_ids.clone();

    for candidate in paid_candidates {
        push_candidate(
            candidate,
            RequestKind::PaidRequest,
            &mut batches.paid,
            &mut seen_sub_ids,
        );
    }

    for candidate in user_candidates {
        if skip_expired_unaccepted_promotion(&candidate.request, now) {
            continue;
        }
        push_candidate(
            candidate,
            RequestKind::UserRequest,
            &mut batches.user,
            &mut seen_sub_ids,
        );
    }

    batches
}

fn push_candidate(
    candidate: &Candidate,
    kind: RequestKind,
    items: &mut BTreeMap<i64, BTreeMap<String, Vec<CartItem>>>,
    seen_sub_ids: &mut BTreeMap<i64, Vec<i64>>,
) {
    let Some(sub_id) = candidate.relation.product.effective_sub_id() else {
        return;
    };
    let user_id = candidate.request.user_id;
    let seen = seen_sub_ids.entry(user_id).or_default();
    if seen.contains(&sub_id) {
        return;
    }
    let Some(currency_code) = candidate.relation.product.price_currency.clone() else {
        return;
    };

    seen.push(sub_id);
    items
        .entry(user_id)
        .or_default()
        .entry(currency_code)
        .or_default()
        .push(CartItem {
            sub_id,
            user_id,
            relation_type: kind.letter(),
            relation_id: candidate.relation.id,
        });
}

/// A promotional user request whose invite window has lapsed without the
/// invitee accepting (and without having paid before the window closed) is
/// left behind rather than pushed to cart.
fn skip_expired_unaccepted_promotion(request: &Request, now: DateTime<Utc>) -> bool {
    request.promotion
        && !request.paid_before_promotion_end_date
        && !request.informed
        && request
            .expiration_date
            .map(|expiry| expiry < now)
            .unwrap_or(false)
}

/// Collects the effective sub ids already sitting in `AddedToCart`, grouped
/// by owning customer across both relation kinds, so a fresh selection pass
/// doesn't re-queue something already in that customer's cart.
pub fn committed_sub_ids_by_user(added_to_cart: &[Candidate]) -> BTreeMap<i64, Vec<i64>> {
    let mut by_user: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for candidate in added_to_cart {
        if let Some(sub_id) = candidate.relation.product.effective_sub_id() {
            let subids = by_user.entry(candidate.request.user_id).or_default();
            if !subids.contains(&sub_id) {
                subids.push(sub_id);
            }
        }
    }
    by_user
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::Product;
    use crate::domain::state::CommitmentLevel;
    use chrono::Duration;

    fn relation(id: i64, kind: RequestKind, sub_id: i64, currency: &str) -> Relation {
        Relation {
            id,
            kind,
            request_id: id,
            product: Product {
                id,
                sub_id: Some(sub_id),
                store_sub_id: None,
                price_currency: Some(currency.to_string()),
                has_anticheat: false,
            },
            commitment_level: CommitmentLevel::Uncommitted,
            task_id: None,
            committed_on_bot: None,
            shopping_cart_gid: None,
            sent: false,
        }
    }

    fn plain_request(id: i64, kind: RequestKind, user_id: i64) -> Request {
        Request {
            id,
            kind,
            visible: true,
            accepted: false,
            sent: false,
            assigned: None,
            informed: false,
            paid: true,
            authed: true,
            promotion: false,
            paid_before_promotion_end_date: false,
            expiration_date: None,
            user_id,
            user_external_account_id: format!("steam-{user_id}"),
        }
    }

    #[test]
    fn paid_relation_wins_when_both_kinds_share_a_sub_id_for_the_same_user() {
        let paid = vec![Candidate {
            relation: relation(1, RequestKind::PaidRequest, 42, "USD"),
            request: plain_request(1, RequestKind::PaidRequest, 9),
        }];
        let user = vec![Candidate {
            relation: relation(2, RequestKind::UserRequest, 42, "USD"),
            request: plain_request(2, RequestKind::UserRequest, 9),
        }];

        let batches = select_uncommitted(&paid, &user, &BTreeMap::new(), Utc::now());
        let usd = batches.paid.get(&9).and_then(|m| m.get("USD")).expect("usd bucket");
        assert_eq!(usd.len(), 1);
        assert_eq!(usd[0].relation_type, 'C');
        assert_eq!(usd[0].relation_id, 1);
        assert!(batches.user.get(&9).and_then(|m| m.get("USD")).is_none());
    }

    #[test]
    fn dedup_is_scoped_per_user_not_global() {
        let paid = vec![
            Candidate {
                relation: relation(1, RequestKind::PaidRequest, 42, "USD"),
                request: plain_request(1, RequestKind::PaidRequest, 9),
            },
            Candidate {
                relation: relation(2, RequestKind::PaidRequest, 42, "USD"),
                request: plain_request(2, RequestKind::PaidRequest, 10),
            },
        ];

        let batches = select_uncommitted(&paid, &[], &BTreeMap::new(), Utc::now());
        assert_eq!(batches.paid.get(&9).and_then(|m| m.get("USD")).map(Vec::len), Some(1));
        assert_eq!(batches.paid.get(&10).and_then(|m| m.get("USD")).map(Vec::len), Some(1));
    }

    #[test]
    fn already_committed_sub_ids_are_skipped_for_that_user_only() {
        let paid = vec![
            Candidate {
                relation: relation(1, RequestKind::PaidRequest, 42, "USD"),
                request: plain_request(1, RequestKind::PaidRequest, 9),
            },
            Candidate {
                relation: relation(2, RequestKind::PaidRequest, 42, "USD"),
                request: plain_request(2, RequestKind::PaidRequest, 10),
            },
        ];

        let mut committed = BTreeMap::new();
        committed.insert(9, vec![42]);

        let batches = select_uncommitted(&paid, &[], &committed, Utc::now());
        assert!(batches.paid.get(&9).is_none());
        assert_eq!(batches.paid.get(&10).and_then(|m| m.get("USD")).map(Vec::len), Some(1));
    }

    #[test]
    fn expired_unaccepted_promotion_is_skipped() {
        let mut request = plain_request(2, RequestKind::UserRequest, 9);
        request.promotion = true;
        request.expiration_date = Some(Utc::now() - Duration::days(1));

        let user = vec![Candidate {
            relation: relation(2, RequestKind::UserRequest, 7, "EUR"),
            request,
        }];

        let batches = select_uncommitted(&[], &user, &BTreeMap::new(), Utc::now());
        assert!(batches.user.is_empty());
    }

    #[test]
    fn missing_sub_id_or_currency_drops_the_candidate() {
        let mut r = relation(1, RequestKind::PaidRequest, 1, "USD");
        r.product.sub_id = None;
        r.product.store_sub_id = None;
        let paid = vec![Candidate {
            relation: r,
            request: plain_request(1, RequestKind::PaidRequest, 9),
        }];

        let batches = select_uncommitted(&paid, &[], &BTreeMap::new(), Utc::now());
        assert!(batches.paid.is_empty());
    }
}
