//! Round-trip scenario tests (S1-S6), exercising the orchestrator entry
//! points against `FakeStore` and a local mock edge server rather than a
//! live Postgres instance or edge fleet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use edge_dispatch::adapters::postgres::test_support::FakeStore;
use edge_dispatch::adapters::wallet_client::{Invoice, SendResult};
use edge_dispatch::adapters::{CrashSink, EdgeClient, LoggingCrashSink, Store, UnconfiguredWallet, WalletClient};
use edge_dispatch::config::{CoinbaseConfig, DatabaseConfig, EdgeClientConfig, LoggingConfig, RollbarConfig};
use edge_dispatch::domain::{
    BotStatus, BotType, CommitmentLevel, EdgeBot, EdgeServer, EdgeServerStatus, PaymentIdempotencyKey,
    Product, Relation, Request, RequestKind,
};
use edge_dispatch::orchestrator::{invitations, push, tasks, OrchestratorContext};
use edge_dispatch::{AppConfig, Result};

const OWNER_ID: i64 = 42;

fn base_config() -> AppConfig {
    AppConfig {
        owner_id: OWNER_ID,
        giftee_account_id: None,
        payment_method: "steamaccount".to_string(),
        coinbase: CoinbaseConfig::default(),
        rollbar: RollbarConfig::default(),
        use_informed: false,
        database: DatabaseConfig {
            url: "postgres://localhost/test".to_string(),
            max_connections: 5,
        },
        edge: EdgeClientConfig::default(),
        logging: LoggingConfig::default(),
    }
}

fn context(store: Arc<FakeStore>, wallet: Arc<dyn WalletClient>) -> OrchestratorContext {
    OrchestratorContext {
        store,
        edge: EdgeClient::new().expect("edge client"),
        wallet,
        crash_sink: Arc::new(LoggingCrashSink) as Arc<dyn CrashSink>,
        config: base_config(),
    }
}

fn server(id: i64, ip_address: String) -> EdgeServer {
    EdgeServer {
        id,
        ip_address,
        currency_code: "USD".to_string(),
        status: EdgeServerStatus::Enabled,
        last_health_check: None,
    }
}

fn bot(id: i64, network_id: i64, status: BotStatus) -> EdgeBot {
    EdgeBot {
        id,
        network_id,
        currency_code: "USD".to_string(),
        bot_type: BotType::Purchases,
        status,
    }
}

fn user_request(id: i64, user_id: i64, external_account_id: &str) -> Request {
    Request {
        id,
        kind: RequestKind::UserRequest,
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
        user_external_account_id: external_account_id.to_string(),
    }
}

fn relation(id: i64, kind: RequestKind, request_id: i64, sub_id: i64) -> Relation {
    Relation {
        id,
        kind,
        request_id,
        product: Product {
            id,
            sub_id: Some(sub_id),
            store_sub_id: None,
            price_currency: Some("USD".to_string()),
            has_anticheat: false,
        },
        commitment_level: CommitmentLevel::Uncommitted,
        task_id: None,
        committed_on_bot: None,
        shopping_cart_gid: None,
        sent: false,
    }
}

/// S1: happy path, account payment. Drives the full
/// invite -> push -> poll(x2) pipeline against a mock edge server and
/// asserts the literal end state from the spec's round-trip scenario.
#[tokio::test]
async fn s1_happy_path_account_payment() {
    let mock_server = MockServer::start().await;
    let ip = mock_server.address().to_string();

    let store = Arc::new(FakeStore::new());
    store.seed_user(9, "900100");
    store.seed_bot(bot(1, 100, BotStatus::StandingBy));
    store.seed_server(server(1, ip.clone()));
    let request = user_request(1, 9, "900100");
    let rel = relation(1, RequestKind::UserRequest, 1, 200);
    store.seed_user_request(request, rel);

    let ctx = context(store.clone(), Arc::new(UnconfiguredWallet));

    Mock::given(method("GET"))
        .and(path("/edge/healthcheck"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ISteamUser/GetFriendsList/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ISteamUser/AddFriend/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"900100": "added"})))
        .mount(&mock_server)
        .await;

    let invited = invitations::send_invitations(&ctx, false).await.unwrap();
    assert_eq!(invited, 1);
    let after_invite = store.relation(RequestKind::UserRequest, 1);
    assert_eq!(after_invite.commitment_level, CommitmentLevel::WaitingForInvite);
    assert_eq!(after_invite.committed_on_bot, Some(100));

    mock_server.reset().await;
    Mock::given(method("GET"))
        .and(path("/edge/healthcheck"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ISteamUser/GetFriendsList/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([900100])))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/edge/cart/push/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "result": null,
            "task_id": 555,
            "task_name": "add_subids_to_cart",
        })))
        .mount(&mock_server)
        .await;

    let pushed = push::push_relations(&ctx, false).await.unwrap();
    assert_eq!(pushed, 1);
    let after_push = store.relation(RequestKind::UserRequest, 1);
    assert_eq!(after_push.commitment_level, CommitmentLevel::PushedToCart);
    assert_eq!(after_push.task_id, Some(555));

    mock_server.reset().await;
    Mock::given(method("POST"))
        .and(path("/edge/task/state/"))
        .and(body_string_contains("task_id=555"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "task_status": "SUCCESS",
            "task_result": {
                "successful_items": [{"sub_id": 200, "user_id": 9, "relation_type": "A", "relation_id": 1}],
                "failed_items": [],
                "failed_shopping_cart_gids": [],
                "shoppingCartGID": "G",
            },
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/edge/cart/checkout/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "task_id": 777,
            "task_name": "checkout_cart",
        })))
        .mount(&mock_server)
        .await;

    let handled = tasks::process_pending_tasks(&ctx).await.unwrap();
    assert_eq!(handled, 1);
    let after_cart = store.relation(RequestKind::UserRequest, 1);
    assert_eq!(after_cart.commitment_level, CommitmentLevel::AddedToCart);
    assert_eq!(after_cart.shopping_cart_gid.as_deref(), Some("G"));
    assert_eq!(store.bot(100).status, BotStatus::PurchasingCart);

    mock_server.reset().await;
    Mock::given(method("POST"))
        .and(path("/edge/task/state/"))
        .and(body_string_contains("task_id=777"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "task_status": "SUCCESS",
            "task_result": {"result": "OK", "payment_method": "steamaccount"},
        })))
        .mount(&mock_server)
        .await;

    let handled = tasks::process_pending_tasks(&ctx).await.unwrap();
    assert_eq!(handled, 1);

    let final_relation = store.relation(RequestKind::UserRequest, 1);
    let final_request = store.request(RequestKind::UserRequest, 1);
    let final_bot = store.bot(100);
    assert_eq!(final_relation.commitment_level, CommitmentLevel::Purchased);
    assert!(final_relation.sent);
    assert_eq!(final_request.assigned, Some(OWNER_ID));
    assert!(final_request.accepted);
    assert_eq!(final_bot.status, BotStatus::StandingBy);
}

/// S2: add-to-cart partial failure. R1 fails, R2 succeeds and is carried
/// into a dispatched checkout, R3 is rolled back by the blanket rollback.
#[tokio::test]
async fn s2_add_to_cart_partial_failure() {
    let mock_server = MockServer::start().await;
    let ip = mock_server.address().to_string();

    let store = Arc::new(FakeStore::new());
    store.seed_user(9, "900200");
    store.seed_bot(bot(1, 200, BotStatus::StandingBy));
    store.seed_server(server(1, ip));

    for (relation_id, sub_id) in [(1, 201), (2, 202), (3, 203)] {
        let request = user_request(relation_id, 9, "900200");
        let mut r = relation(relation_id, RequestKind::UserRequest, relation_id, sub_id);
        r.commitment_level = CommitmentLevel::PushedToCart;
        r.task_id = Some(600);
        r.committed_on_bot = Some(200);
        store.seed_user_request(request, r);
    }

    store
        .create_edge_task(1, 1, 600, "add_subids_to_cart", None)
        .await
        .unwrap();

    let ctx = context(store.clone(), Arc::new(UnconfiguredWallet));

    Mock::given(method("POST"))
        .and(path("/edge/task/state/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "task_status": "SUCCESS",
            "task_result": {
                "successful_items": [{"sub_id": 202, "user_id": 9, "relation_type": "A", "relation_id": 2}],
                "failed_items": [{"sub_id": 201, "user_id": 9, "relation_type": "A", "relation_id": 1}],
                "failed_shopping_cart_gids": [],
                "shoppingCartGID": "G2",
            },
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/edge/cart/checkout/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "task_id": 650,
            "task_name": "checkout_cart",
        })))
        .mount(&mock_server)
        .await;

    tasks::process_pending_tasks(&ctx).await.unwrap();

    assert_eq!(
        store.relation(RequestKind::UserRequest, 1).commitment_level,
        CommitmentLevel::FailedToAddCart
    );
    let r2 = store.relation(RequestKind::UserRequest, 2);
    assert_eq!(r2.commitment_level, CommitmentLevel::AddedToCart);
    assert_eq!(r2.shopping_cart_gid.as_deref(), Some("G2"));
    assert_eq!(
        store.relation(RequestKind::UserRequest, 3).commitment_level,
        CommitmentLevel::Uncommitted
    );

    let pending = store.get_pending_tasks().await.unwrap();
    assert!(pending.iter().any(|t| t.task_name == "checkout_cart"));
}

/// S3: insufficient funds on checkout leaves the relation untouched and
/// blocks the bot on the matching status.
#[tokio::test]
async fn s3_insufficient_funds_on_checkout() {
    let mock_server = MockServer::start().await;
    let ip = mock_server.address().to_string();

    let store = Arc::new(FakeStore::new());
    store.seed_bot(bot(1, 300, BotStatus::PurchasingCart));
    store.seed_server(server(1, ip));
    let request = user_request(1, 9, "900300");
    let mut r = relation(1, RequestKind::UserRequest, 1, 300);
    r.commitment_level = CommitmentLevel::AddedToCart;
    store.seed_user_request(request, r);

    store
        .create_edge_task(1, 1, 900, "checkout_cart", None)
        .await
        .unwrap();

    let ctx = context(store.clone(), Arc::new(UnconfiguredWallet));

    Mock::given(method("POST"))
        .and(path("/edge/task/state/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "task_status": "SUCCESS",
            "task_result": 5,
        })))
        .mount(&mock_server)
        .await;

    tasks::process_pending_tasks(&ctx).await.unwrap();

    assert_eq!(store.bot(300).status, BotStatus::WaitingForSufficientFunds);
    assert_eq!(
        store.relation(RequestKind::UserRequest, 1).commitment_level,
        CommitmentLevel::AddedToCart
    );
}

struct FakeWallet {
    invoice: Invoice,
    send_called: AtomicBool,
}

#[async_trait]
impl WalletClient for FakeWallet {
    async fn balance(&self) -> Result<rust_decimal::Decimal> {
        Ok("10".parse().unwrap())
    }

    async fn send_to_invoice(
        &self,
        _invoice_id: &str,
        _amount: rust_decimal::Decimal,
        idempotency: &PaymentIdempotencyKey,
    ) -> Result<SendResult> {
        self.send_called.store(true, Ordering::SeqCst);
        Ok(SendResult {
            idempotency_key: idempotency.0,
            already_existed: false,
            transaction_id: "tx".to_string(),
        })
    }

    async fn fetch_invoice(&self, _invoice_id: &str) -> Result<Invoice> {
        Ok(self.invoice.clone())
    }
}

/// S4: bitcoin path, invoice not new. Settlement must bail before ever
/// calling the wallet's send path, leaving the cart uncommitted and the
/// bot blocked.
#[tokio::test]
async fn s4_bitcoin_invoice_not_new() {
    let mock_server = MockServer::start().await;
    let ip = mock_server.address().to_string();

    let store = Arc::new(FakeStore::new());
    store.seed_bot(bot(1, 400, BotStatus::PurchasingCart));
    store.seed_server(server(1, ip));
    let request = user_request(1, 9, "900400");
    let mut r = relation(1, RequestKind::UserRequest, 1, 400);
    r.commitment_level = CommitmentLevel::AddedToCart;
    r.shopping_cart_gid = Some("GID4".to_string());
    store.seed_user_request(request, r);

    store
        .create_edge_task(1, 1, 950, "get_external_link_from_transid", Some("GID4"))
        .await
        .unwrap();

    let wallet = Arc::new(FakeWallet {
        invoice: Invoice {
            status: "paid".to_string(),
            btc_due: "0.01".parse().unwrap(),
            bitcoin_address: "addr".to_string(),
        },
        send_called: AtomicBool::new(false),
    });
    let ctx = context(store.clone(), wallet.clone());

    Mock::given(method("POST"))
        .and(path("/edge/task/state/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "task_status": "SUCCESS",
            "task_result": {"url": "https://pay.example.com/i/ABCDE"},
        })))
        .mount(&mock_server)
        .await;

    tasks::process_pending_tasks(&ctx).await.unwrap();

    assert_eq!(store.bot(400).status, BotStatus::BlockedForUnknownReason);
    let rel = store.relation(RequestKind::UserRequest, 1);
    assert_eq!(rel.commitment_level, CommitmentLevel::AddedToCart);
    assert!(!wallet.send_called.load(Ordering::SeqCst));
}

/// S5: edge server unhealthy -- no dispatch, no state change, command
/// returns normally rather than erroring out.
#[tokio::test]
async fn s5_edge_server_unhealthy() {
    let mock_server = MockServer::start().await;
    let ip = mock_server.address().to_string();

    let store = Arc::new(FakeStore::new());
    store.seed_bot(bot(1, 500, BotStatus::StandingBy));
    store.seed_server(server(1, ip));
    let request = user_request(1, 9, "900500");
    let r = relation(1, RequestKind::UserRequest, 1, 500);
    store.seed_user_request(request, r);

    let ctx = context(store.clone(), Arc::new(UnconfiguredWallet));

    Mock::given(method("GET"))
        .and(path("/edge/healthcheck"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let invited = invitations::send_invitations(&ctx, false).await.unwrap();
    assert_eq!(invited, 0);
    assert_eq!(
        store.relation(RequestKind::UserRequest, 1).commitment_level,
        CommitmentLevel::Uncommitted
    );
}

/// S6: duplicate sub-id across kinds -- the paid-request relation wins
/// since paid candidates are folded into the selector before user ones.
#[tokio::test]
async fn s6_duplicate_sub_id_across_kinds_prefers_paid_request() {
    let store = Arc::new(FakeStore::new());
    store.seed_user(9, "900600");

    let paid_request = Request {
        authed: true,
        ..user_request(10, 9, "900600")
    };
    let paid_request = Request {
        kind: RequestKind::PaidRequest,
        ..paid_request
    };
    let paid_relation = relation(10, RequestKind::PaidRequest, 10, 200);
    store.seed_paid_request(paid_request, paid_relation);

    let user_req = user_request(20, 9, "900600");
    let user_relation = relation(20, RequestKind::UserRequest, 20, 200);
    store.seed_user_request(user_req, user_relation);

    let paid_candidates = store
        .get_relations_at_level(RequestKind::PaidRequest, OWNER_ID, CommitmentLevel::Uncommitted, false, None)
        .await
        .unwrap();
    let user_candidates = store
        .get_relations_at_level(RequestKind::UserRequest, OWNER_ID, CommitmentLevel::Uncommitted, false, None)
        .await
        .unwrap();

    let batches = edge_dispatch::domain::select_uncommitted(
        &paid_candidates,
        &user_candidates,
        &std::collections::BTreeMap::new(),
        chrono::Utc::now(),
    );

    let paid_items = batches.paid.get(&9).and_then(|m| m.get("USD")).cloned().unwrap_or_default();
    assert_eq!(paid_items.len(), 1);
    assert_eq!(paid_items[0].relation_type, 'C');
    assert!(batches.user.get(&9).and_then(|m| m.get("USD")).is_none());
}
