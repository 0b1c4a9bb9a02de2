use regex::Regex;
use tracing::{info, warn};

use crate::adapters::crash_sink::report_error;
use crate::adapters::edge_client::{decode_task_result, TaskResult};
use crate::adapters::store::PendingTaskContext;
use crate::domain::{
    effect_target_level, process_cart_result, BotStatus, PaymentIdempotencyKey, TaskKind, TaskStatus, TransactionResult,
};
use crate::error::{DispatchError, Result};
use crate::orchestrator::OrchestratorContext;

const INVOICE_ID_PATTERN: &str = r"/i/([a-zA-Z0-9]+)";

/// `process_pending_tasks()` — polls every task still `PENDING` locally,
/// dispatches terminal `SUCCESS` results to their kind's handler, and
/// persists the new status. One task's failure never aborts the pass over
/// the rest: each is processed independently and reported to the crash
/// sink rather than propagated.
pub async fn process_pending_tasks(ctx: &OrchestratorContext) -> Result<usize> {
    let pending = ctx.store.get_pending_tasks().await?;
    let mut handled = 0usize;

    for task in pending {
        match process_one(ctx, &task).await {
            Ok(()) => handled += 1,
            Err(err) => {
                warn!(task_id = task.task_id, error = %err, "failed to process pending task");
                report_error(ctx.crash_sink.as_ref(), &err).await;
            }
        }
    }

    Ok(handled)
}

async fn process_one(ctx: &OrchestratorContext, task: &PendingTaskContext) -> Result<()> {
    let response = match ctx.edge.task_state(&task.server.ip_address, &task.task_name, task.task_id).await {
        Ok(response) => response,
        Err(err) => {
            warn!(task_id = task.task_id, error = %err, "task state poll failed; marking failed locally");
            ctx.store.update_edge_task_status(task.task_id, TaskStatus::Failure).await?;
            return Ok(());
        }
    };

    let status = TaskStatus::try_from(response.task_status.as_str())?;
    if status.is_in_flight() {
        return Ok(());
    }
    if status == TaskStatus::Failure {
        ctx.store.update_edge_task_status(task.task_id, TaskStatus::Failure).await?;
        return Ok(());
    }

    let Some(result_value) = response.task_result else {
        warn!(task_id = task.task_id, "task reported success with no task_result");
        ctx.store.update_edge_task_status(task.task_id, TaskStatus::Failure).await?;
        return Ok(());
    };

    let kind = TaskKind::try_from(task.task_name.as_str())?;
    let decoded = decode_task_result(kind, result_value)?;

    match kind {
        TaskKind::AddSubidsToCart => handle_add_subids_to_cart(ctx, task, decoded).await?,
        TaskKind::CheckoutCart => handle_checkout_cart(ctx, task, decoded).await?,
        TaskKind::GetExternalLinkFromTransId => handle_external_link(ctx, task, decoded).await?,
        TaskKind::CartReset => info!(task_id = task.task_id, "cart reset acknowledged"),
    }

    ctx.store.update_edge_task_status(task.task_id, TaskStatus::Success).await
}

/// Applies the cart-result ordering from `domain::reconciler`, then either
/// dispatches checkout for the user the first successful item belongs to,
/// or drops the bot back to `StandingBy` if nothing made it into the cart.
async fn handle_add_subids_to_cart(
    ctx: &OrchestratorContext,
    task: &PendingTaskContext,
    result: TaskResult,
) -> Result<()> {
    let TaskResult::Cart(cart) = result else {
        return Err(DispatchError::Internal(
            "add_subids_to_cart task result was not a cart result".to_string(),
        ));
    };

    for effect in process_cart_result(task.task_id, task.bot.network_id, &cart) {
        info!(task_id = task.task_id, target = %effect_target_level(&effect), "applying cart-result effect");
        ctx.store.apply_relation_effect(&effect).await?;
    }

    let Some(first) = cart.successful_items.first() else {
        ctx.store.set_edge_bot_status(task.bot.network_id, BotStatus::StandingBy).await?;
        return Ok(());
    };

    let Some(giftee_account_id) = resolve_giftee_account_id(ctx, first.user_id).await? else {
        warn!(user_id = first.user_id, "no giftee account id available; blocking bot");
        ctx.store.set_edge_bot_status(task.bot.network_id, BotStatus::BlockedForUnknownReason).await?;
        return Ok(());
    };

    // Pre-claim the bot before the checkout call returns, mirroring the
    // push-cart ordering requirement for outbound dispatches.
    ctx.store.set_edge_bot_status(task.bot.network_id, BotStatus::PurchasingCart).await?;

    match ctx
        .edge
        .checkout_cart(&task.server.ip_address, task.bot.network_id, giftee_account_id, &ctx.config.payment_method)
        .await
    {
        Ok(created) => {
            let correlation = cart.shopping_cart_gid.as_deref();
            ctx.store
                .create_edge_task(task.bot.id, task.server.id, created.task_id, &created.task_name, correlation)
                .await?;
        }
        Err(err) => {
            warn!(network_id = task.bot.network_id, error = %err, "checkout dispatch failed");
            ctx.store.set_edge_bot_status(task.bot.network_id, BotStatus::BlockedForUnknownReason).await?;
        }
    }

    Ok(())
}

/// Prefers the customer's own external account id; falls back to the
/// legacy global `giftee_account_id` only when that lookup comes up empty
/// or unparsable.
async fn resolve_giftee_account_id(ctx: &OrchestratorContext, user_id: i64) -> Result<Option<i64>> {
    let per_user = match ctx.store.get_user_external_account_id(user_id).await? {
        Some(raw) => match raw.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(user_id, external_account_id = %raw, "external account id is not numeric");
                None
            }
        },
        None => None,
    };
    Ok(per_user.or(ctx.config.giftee_account_id))
}

/// Interprets either shape of a `checkout_cart` result: a bare
/// `ETransactionResult` code only ever drives the bot status table, since a
/// real purchase is only committed from the structured `result == "OK"`
/// form; a bitcoin outcome hands off to `transaction/link/` rather than
/// committing immediately.
async fn handle_checkout_cart(ctx: &OrchestratorContext, task: &PendingTaskContext, result: TaskResult) -> Result<()> {
    match result {
        TaskResult::Code(code) => {
            let outcome = TransactionResult::from_code(code)?;
            let status = match outcome {
                TransactionResult::Success => BotStatus::StandingBy,
                TransactionResult::InsufficientFunds => BotStatus::WaitingForSufficientFunds,
                TransactionResult::TooManyPurchases => BotStatus::BlockedForTooManyPurchases,
                TransactionResult::Fail
                | TransactionResult::ShoppingCartGidNotFound
                | TransactionResult::TransIdNotFound => BotStatus::BlockedForUnknownReason,
            };
            ctx.store.set_edge_bot_status(task.bot.network_id, status).await
        }
        TaskResult::Checkout(outcome) => {
            if outcome.result != "OK" {
                info!(network_id = task.bot.network_id, result = %outcome.result, "checkout reported a non-OK result");
                return ctx.store.set_edge_bot_status(task.bot.network_id, BotStatus::BlockedForUnknownReason).await;
            }

            let Some(shopping_cart_gid) = task.correlation.as_deref() else {
                warn!(task_id = task.task_id, "checkout task missing its shopping_cart_gid correlation");
                return ctx.store.set_edge_bot_status(task.bot.network_id, BotStatus::BlockedForUnknownReason).await;
            };

            if outcome.payment_method.as_deref() == Some("bitcoin") {
                dispatch_transaction_link(ctx, task, shopping_cart_gid, &outcome).await
            } else {
                ctx.store.commit_purchased_relations(shopping_cart_gid, ctx.owner_id()).await?;
                ctx.store.set_edge_bot_status(task.bot.network_id, BotStatus::StandingBy).await
            }
        }
        other => Err(DispatchError::Internal(format!(
            "unexpected checkout_cart task result shape: {other:?}"
        ))),
    }
}

async fn dispatch_transaction_link(
    ctx: &OrchestratorContext,
    task: &PendingTaskContext,
    shopping_cart_gid: &str,
    outcome: &crate::adapters::edge_client::CheckoutOutcome,
) -> Result<()> {
    let Some(trans_id) = outcome.trans_id.as_deref() else {
        warn!(task_id = task.task_id, "bitcoin checkout result missing trans_id");
        return ctx.store.set_edge_bot_status(task.bot.network_id, BotStatus::BlockedForUnknownReason).await;
    };

    match ctx.edge.get_transaction_link(&task.server.ip_address, trans_id, task.bot.network_id).await {
        Ok(created) => {
            ctx.store
                .create_edge_task(task.bot.id, task.server.id, created.task_id, &created.task_name, Some(shopping_cart_gid))
                .await
        }
        Err(err) => {
            warn!(network_id = task.bot.network_id, error = %err, "transaction link dispatch failed");
            ctx.store.set_edge_bot_status(task.bot.network_id, BotStatus::BlockedForUnknownReason).await
        }
    }
}

/// Resolves a completed bitcoin transaction's external payment link down to
/// a settled invoice. Every failure leaves the shopping cart uncommitted and
/// unreset for manual recovery; an insufficient wallet balance waits for
/// funds rather than blocking the bot outright, everything else blocks it.
async fn handle_external_link(ctx: &OrchestratorContext, task: &PendingTaskContext, result: TaskResult) -> Result<()> {
    let TaskResult::ExternalLink(link) = result else {
        return Err(DispatchError::Internal(
            "get_external_link_from_transid task result was not a link result".to_string(),
        ));
    };

    let Some(shopping_cart_gid) = task.correlation.clone() else {
        warn!(task_id = task.task_id, "external link task missing its shopping_cart_gid correlation");
        return ctx.store.set_edge_bot_status(task.bot.network_id, BotStatus::BlockedForUnknownReason).await;
    };

    if let Err(err) = settle_bitcoin_invoice(ctx, task, &link.url, &shopping_cart_gid).await {
        let status = match err {
            DispatchError::InsufficientFunds(_) => BotStatus::WaitingForSufficientFunds,
            _ => BotStatus::BlockedForUnknownReason,
        };
        warn!(
            network_id = task.bot.network_id,
            error = %err,
            status = %status,
            "bitcoin settlement failed; cart left uncommitted"
        );
        return ctx.store.set_edge_bot_status(task.bot.network_id, status).await;
    }

    Ok(())
}

async fn settle_bitcoin_invoice(
    ctx: &OrchestratorContext,
    task: &PendingTaskContext,
    invoice_url: &str,
    shopping_cart_gid: &str,
) -> Result<()> {
    let pattern = Regex::new(INVOICE_ID_PATTERN)
        .map_err(|err| DispatchError::Internal(format!("invalid invoice id pattern: {err}")))?;
    let invoice_id = pattern
        .captures(invoice_url)
        .and_then(|captures| captures.get(1))
        .ok_or_else(|| DispatchError::Protocol {
            endpoint: invoice_url.to_string(),
            reason: "no invoice id found in transaction link".to_string(),
        })?
        .as_str()
        .to_string();

    let invoice = ctx.wallet.fetch_invoice(&invoice_id).await?;
    if invoice.status != "new" {
        return Err(DispatchError::Wallet(format!(
            "invoice {invoice_id} is not new (status={})",
            invoice.status
        )));
    }

    let balance = ctx.wallet.balance().await?;
    if balance < invoice.btc_due {
        return Err(DispatchError::InsufficientFunds(format!(
            "wallet balance {balance} is below invoice due amount {}",
            invoice.btc_due
        )));
    }

    let idempotency = PaymentIdempotencyKey::from_shopping_cart_gid(shopping_cart_gid);
    ctx.wallet
        .send_to_invoice(&invoice.bitcoin_address, invoice.btc_due, &idempotency)
        .await?;

    ctx.store.commit_purchased_relations(shopping_cart_gid, ctx.owner_id()).await?;

    match ctx.edge.reset_cart(&task.server.ip_address, task.bot.network_id).await {
        Ok(created) => {
            ctx.store
                .create_edge_task(task.bot.id, task.server.id, created.task_id, &created.task_name, None)
                .await?;
        }
        Err(err) => {
            warn!(network_id = task.bot.network_id, error = %err, "cart reset dispatch failed after bitcoin settlement");
        }
    }

    ctx.store.set_edge_bot_status(task.bot.network_id, BotStatus::StandingBy).await
}
