use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::domain::{
    committed_sub_ids_by_user, select_uncommitted, BotStatus, BotType, Candidate, CartItem,
    CommitmentLevel, RequestKind,
};
use crate::error::Result;
use crate::orchestrator::health::HealthCache;
use crate::orchestrator::OrchestratorContext;

/// `push_relations(anticheat_policy)` — for every `(user_id, currency)` pair
/// sitting at `WaitingForInvite`, confirms the bot bound during the invite
/// step is still usable and the customer's invite landed, claims the bot
/// exclusively, and posts the batch to `cart/push/`.
///
/// Mirrors the edge fleet's own skip-and-continue error handling: any
/// selection anomaly (no bot, bot not `STANDING_BY`, friend invite not yet
/// accepted, unhealthy server) is logged at info and that currency group is
/// skipped rather than aborting the whole pass.
pub async fn push_relations(ctx: &OrchestratorContext, anticheat_policy: bool) -> Result<usize> {
    let owner_id = ctx.owner_id();

    let paid_candidates = ctx
        .store
        .get_relations_at_level(
            RequestKind::PaidRequest,
            owner_id,
            CommitmentLevel::WaitingForInvite,
            false,
            Some(anticheat_policy),
        )
        .await?;
    let user_candidates = ctx
        .store
        .get_relations_at_level(
            RequestKind::UserRequest,
            owner_id,
            CommitmentLevel::WaitingForInvite,
            ctx.config.use_informed,
            Some(anticheat_policy),
        )
        .await?;

    let committed_on_bot_by_relation = committed_on_bot_index(&paid_candidates, &user_candidates);

    let added_paid = ctx
        .store
        .get_relations_at_level(RequestKind::PaidRequest, owner_id, CommitmentLevel::AddedToCart, false, None)
        .await?;
    let added_user = ctx
        .store
        .get_relations_at_level(
            RequestKind::UserRequest,
            owner_id,
            CommitmentLevel::AddedToCart,
            ctx.config.use_informed,
            None,
        )
        .await?;
    let mut already_added = added_paid;
    already_added.extend(added_user);
    let committed_sub_ids = committed_sub_ids_by_user(&already_added);

    let batches = select_uncommitted(&paid_candidates, &user_candidates, &committed_sub_ids, chrono::Utc::now());
    let groups = merge_by_user_and_currency(batches.paid, batches.user);
    info!(candidates = crate::adapters::postgres::total_item_count(&groups), "selected relations for push");

    let mut health = HealthCache::new();
    let mut pushed = 0usize;

    for (user_id, by_currency) in groups {
        for (currency_code, items) in by_currency {
            let Some(&network_id) = items
                .first()
                .and_then(|item| committed_on_bot_by_relation.get(&(item.relation_type, item.relation_id)))
            else {
                info!(user_id, currency = %currency_code, "relation has no committed bot; skipping");
                continue;
            };

            let Some(bot) = ctx.store.get_edge_bot_by_network_id(network_id).await? else {
                info!(network_id, "committed bot no longer exists; skipping");
                continue;
            };
            if !bot.status.is_available() {
                info!(network_id, status = %bot.status, "committed bot is not standing by; skipping");
                continue;
            }

            let Some(server) = ctx.store.get_edge_server_for_currency(&currency_code).await? else {
                info!(currency = %currency_code, "no available edge server");
                continue;
            };
            if !health.is_healthy(ctx, &server).await {
                continue;
            }

            let Some(external_account_id) = ctx.store.get_user_external_account_id(user_id).await? else {
                warn!(user_id, "no external account id on file; skipping");
                continue;
            };
            let Ok(target_account_id) = external_account_id.parse::<i64>() else {
                warn!(user_id, external_account_id, "external account id is not numeric");
                continue;
            };

            let friends = match ctx.edge.get_friends_list(&server.ip_address, bot.network_id).await {
                Ok(list) => list,
                Err(err) => {
                    warn!(network_id, error = %err, "failed to fetch bot friend list");
                    continue;
                }
            };
            if !friends.contains(&target_account_id) {
                info!(user_id, network_id, "friend invite not yet accepted; skipping");
                continue;
            }

            // Pre-claim the bot before the HTTP call returns, so a crash
            // between dispatch and response leaves it unselectable until a
            // task poll reconciles it (§5 ordering requirement).
            ctx.store
                .set_edge_bot_status(bot.network_id, BotStatus::PushingItemsToCart)
                .await?;

            let response = match ctx.edge.push_cart(&server.ip_address, bot.network_id, &items).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(network_id, error = %err, "cart push request failed");
                    ctx.store
                        .set_edge_bot_status(bot.network_id, BotStatus::BlockedForUnknownReason)
                        .await?;
                    continue;
                }
            };

            if !response.success {
                info!(network_id, result = ?response.result, "edge bot rejected cart push");
                ctx.store
                    .set_edge_bot_status(bot.network_id, BotStatus::BlockedForUnknownReason)
                    .await?;
                continue;
            }

            let Some(task_id) = response.task_id else {
                warn!(network_id, "edge bot reported success with no task id");
                ctx.store
                    .set_edge_bot_status(bot.network_id, BotStatus::BlockedForUnknownReason)
                    .await?;
                continue;
            };

            ctx.store
                .create_edge_task(bot.id, server.id, task_id, "add_subids_to_cart", None)
                .await?;

            for item in &items {
                let kind = RequestKind::from_letter(item.relation_type)?;
                ctx.store
                    .set_relation_commitment(
                        kind,
                        item.relation_id,
                        CommitmentLevel::PushedToCart,
                        Some(task_id),
                        Some(bot.network_id),
                        None,
                    )
                    .await?;
                ctx.store.assign_request_for_item(kind, item.relation_id, owner_id).await?;
            }

            pushed += items.len();
        }
    }

    Ok(pushed)
}

fn committed_on_bot_index(
    paid_candidates: &[Candidate],
    user_candidates: &[Candidate],
) -> BTreeMap<(char, i64), i64> {
    let mut index = BTreeMap::new();
    for candidate in paid_candidates.iter().chain(user_candidates.iter()) {
        if let Some(network_id) = candidate.relation.committed_on_bot {
            index.insert((candidate.relation.kind.letter(), candidate.relation.id), network_id);
        }
    }
    index
}

/// Merges the selector's kind-separated batches into one `user -> currency
/// -> items` view; push doesn't distinguish relation kind once the
/// selection filters have already applied.
fn merge_by_user_and_currency(
    paid: BTreeMap<i64, BTreeMap<String, Vec<CartItem>>>,
    user: BTreeMap<i64, BTreeMap<String, Vec<CartItem>>>,
) -> BTreeMap<i64, BTreeMap<String, Vec<CartItem>>> {
    let mut combined = paid;
    for (user_id, by_currency) in user {
        let entry = combined.entry(user_id).or_default();
        for (currency, items) in by_currency {
            entry.entry(currency).or_default().extend(items);
        }
    }
    combined
}
