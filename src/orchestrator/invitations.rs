use std::collections::{BTreeMap, HashMap};

use tracing::{info, warn};

use crate::adapters::edge_client::{friend_list_is_full, FriendRequest};
use crate::domain::{select_uncommitted, BotType, Candidate, CartItem, CommitmentLevel, RequestKind};
use crate::error::Result;
use crate::orchestrator::health::HealthCache;
use crate::orchestrator::OrchestratorContext;

/// `send_invitations(anticheat_policy)` — for every `(user_id, currency)`
/// pair with relations sitting at `Uncommitted`, binds a `STANDING_BY` bot
/// of the requested polarity, makes sure the customer is on that bot's
/// friend list, and advances the whole group to `WaitingForInvite`.
///
/// Both relation kinds go through the same invite gate: the unified
/// commitment-level state machine makes no kind distinction here, only the
/// `informed`/promotion-expiry skip (applied inside the selector) is
/// user-request specific.
pub async fn send_invitations(ctx: &OrchestratorContext, anticheat_policy: bool) -> Result<usize> {
    let owner_id = ctx.owner_id();
    let bot_type = if anticheat_policy {
        BotType::AntiCheatPurchases
    } else {
        BotType::Purchases
    };

    let paid_candidates = ctx
        .store
        .get_relations_at_level(
            RequestKind::PaidRequest,
            owner_id,
            CommitmentLevel::Uncommitted,
            false,
            Some(anticheat_policy),
        )
        .await?;
    let user_candidates = ctx
        .store
        .get_relations_at_level(
            RequestKind::UserRequest,
            owner_id,
            CommitmentLevel::Uncommitted,
            ctx.config.use_informed,
            Some(anticheat_policy),
        )
        .await?;

    let external_account_ids = external_account_ids_by_user(&paid_candidates, &user_candidates);

    let batches = select_uncommitted(&paid_candidates, &user_candidates, &BTreeMap::new(), chrono::Utc::now());
    let groups = merge_by_user_and_currency(batches.paid, batches.user);

    let mut health = HealthCache::new();
    let mut friend_lists: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut invited = 0usize;

    for (user_id, by_currency) in groups {
        let Some(external_account_id) = external_account_ids.get(&user_id) else {
            warn!(user_id, "no external account id on file; skipping invitation");
            continue;
        };
        let Ok(target_account_id) = external_account_id.parse::<i64>() else {
            warn!(user_id, external_account_id, "external account id is not numeric");
            continue;
        };

        for (currency_code, items) in by_currency {
            let Some(bot) = ctx.store.get_edge_bot_for_currency(&currency_code, bot_type).await? else {
                info!(currency = %currency_code, "no standing-by bot for invitations");
                continue;
            };
            let Some(server) = ctx.store.get_edge_server_for_currency(&currency_code).await? else {
                info!(currency = %currency_code, "no available edge server for invitations");
                continue;
            };
            if !health.is_healthy(ctx, &server).await {
                continue;
            }

            let friends = match friend_lists.get(&bot.network_id) {
                Some(list) => list.clone(),
                None => match ctx.edge.get_friends_list(&server.ip_address, bot.network_id).await {
                    Ok(list) => {
                        friend_lists.insert(bot.network_id, list.clone());
                        list
                    }
                    Err(err) => {
                        warn!(network_id = bot.network_id, error = %err, "failed to fetch bot friend list");
                        continue;
                    }
                },
            };

            if !friends.contains(&target_account_id) {
                let request = FriendRequest {
                    network_id: bot.network_id,
                    target_account_id,
                };
                match ctx.edge.add_friend(&server.ip_address, &request).await {
                    Ok(response) if friend_list_is_full(&response) => {
                        info!(network_id = bot.network_id, "bot friend list full; skipping currency this pass");
                        continue;
                    }
                    Ok(_) => {
                        friend_lists.entry(bot.network_id).or_default().push(target_account_id);
                    }
                    Err(err) => {
                        warn!(network_id = bot.network_id, user_id, error = %err, "add friend request failed");
                        continue;
                    }
                }
            }

            for item in &items {
                let kind = RequestKind::from_letter(item.relation_type)?;
                ctx.store
                    .set_relation_commitment(
                        kind,
                        item.relation_id,
                        CommitmentLevel::WaitingForInvite,
                        None,
                        Some(bot.network_id),
                        None,
                    )
                    .await?;
                invited += 1;
            }
        }
    }

    Ok(invited)
}

fn external_account_ids_by_user(
    paid_candidates: &[Candidate],
    user_candidates: &[Candidate],
) -> BTreeMap<i64, String> {
    let mut out = BTreeMap::new();
    for candidate in paid_candidates.iter().chain(user_candidates.iter()) {
        out.entry(candidate.request.user_id)
            .or_insert_with(|| candidate.request.user_external_account_id.clone());
    }
    out
}

/// Merges the selector's kind-separated batches into one `user -> currency
/// -> items` view, since invitations don't distinguish relation kind once
/// the selection filters have already applied.
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
