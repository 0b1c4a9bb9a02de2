use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::domain::{CartItem, CartResult, TaskKind};
use crate::error::{DispatchError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Thin HTTP client for the edge bot fleet's wire contract: form-encoded
/// POSTs and the occasional GET, classified into transport failure,
/// non-200 / malformed-body protocol failure, or a decoded payload.
#[derive(Clone)]
pub struct EdgeClient {
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
pub struct PushCartResponse {
    pub success: bool,
    pub result: Option<i32>,
    pub task_id: Option<i64>,
    pub task_name: Option<String>,
}

/// Shared response shape for the three dispatch endpoints that only ever
/// hand back a correlation id: `cart/checkout/`, `cart/reset/`, and
/// `transaction/link/`.
#[derive(Debug, Deserialize)]
pub struct TaskCreated {
    pub task_id: i64,
    pub task_name: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskStateResponse {
    pub success: bool,
    pub task_status: String,
    pub task_result: Option<serde_json::Value>,
}

/// Decoded `checkout_cart` task result when the edge reports a structured
/// outcome rather than a bare `ETransactionResult` code.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutOutcome {
    pub result: String,
    pub payment_method: Option<String>,
    /// Present when `payment_method == "bitcoin"`: the edge's own
    /// transaction id, passed straight through to `transaction/link/`.
    #[serde(rename = "transid", default)]
    pub trans_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalLinkResult {
    pub url: String,
}

/// The task-result sum type the original controller type-switched on at
/// runtime (integer vs map), modeled per Design Note "runtime
/// type-switching on task_result" as an exhaustive decode keyed by
/// `TaskKind` instead.
#[derive(Debug, Clone)]
pub enum TaskResult {
    Code(i64),
    Cart(CartResult),
    Checkout(CheckoutOutcome),
    ExternalLink(ExternalLinkResult),
    Ignored,
}

/// Decodes a task's `task_result` payload according to which kind of task
/// it was. `CartReset` carries no structured payload worth decoding — its
/// handler only logs and drops (see `orchestrator::tasks`).
pub fn decode_task_result(kind: TaskKind, value: serde_json::Value) -> Result<TaskResult> {
    match kind {
        TaskKind::CartReset => Ok(TaskResult::Ignored),
        TaskKind::AddSubidsToCart => {
            let cart: CartResult = serde_json::from_value(value).map_err(|err| DispatchError::Protocol {
                endpoint: "task/state/ (add_subids_to_cart)".to_string(),
                reason: format!("malformed cart result: {err}"),
            })?;
            Ok(TaskResult::Cart(cart))
        }
        TaskKind::CheckoutCart => {
            if let Some(code) = value.as_i64() {
                return Ok(TaskResult::Code(code));
            }
            let outcome: CheckoutOutcome =
                serde_json::from_value(value).map_err(|err| DispatchError::Protocol {
                    endpoint: "task/state/ (checkout_cart)".to_string(),
                    reason: format!("malformed checkout result: {err}"),
                })?;
            Ok(TaskResult::Checkout(outcome))
        }
        TaskKind::GetExternalLinkFromTransId => {
            let link: ExternalLinkResult =
                serde_json::from_value(value).map_err(|err| DispatchError::Protocol {
                    endpoint: "task/state/ (get_external_link_from_transid)".to_string(),
                    reason: format!("malformed external link result: {err}"),
                })?;
            Ok(TaskResult::ExternalLink(link))
        }
    }
}

impl EdgeClient {
    /// Builds a client with the spec's fixed (10s connect, 20s read) deadline.
    pub fn new() -> Result<Self> {
        Self::with_timeouts(CONNECT_TIMEOUT, READ_TIMEOUT)
    }

    /// Builds a client honoring the configured connect/read deadlines,
    /// falling back to the spec's defaults when unset.
    pub fn from_config(config: &crate::config::EdgeClientConfig) -> Result<Self> {
        Self::with_timeouts(
            Duration::from_millis(config.connect_timeout_ms),
            Duration::from_millis(config.read_timeout_ms),
        )
    }

    fn with_timeouts(connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .user_agent("edge-dispatch/0.1")
            .build()
            .map_err(DispatchError::Http)?;
        Ok(Self { http })
    }

    fn edge_url(ip_address: &str, endpoint: &str) -> String {
        format!("http://{ip_address}/edge/{endpoint}")
    }

    fn steam_url(ip_address: &str, method: &str) -> String {
        format!("http://{ip_address}/ISteamUser/{method}/")
    }

    /// `GET /edge/healthcheck` with an `X-Requested-At` header carrying the
    /// Unix timestamp of the request. Any non-200 or transport error is a
    /// simple "unhealthy", never an `Err` — health checks are advisory.
    pub async fn healthcheck(&self, ip_address: &str) -> bool {
        let url = Self::edge_url(ip_address, "healthcheck");
        let requested_at = chrono::Utc::now().timestamp().to_string();

        let response = self
            .http
            .get(&url)
            .header("X-Requested-At", requested_at)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(%url, status = %resp.status(), "edge server healthcheck returned non-200");
                false
            }
            Err(err) => {
                error!(%url, error = %err, "edge server healthcheck failed");
                false
            }
        }
    }

    /// `POST /edge/cart/push/` — pushes a batch of items for one currency to
    /// a specific bot's shopping cart.
    pub async fn push_cart(
        &self,
        ip_address: &str,
        network_id: i64,
        items: &[CartItem],
    ) -> Result<PushCartResponse> {
        let url = Self::edge_url(ip_address, "cart/push/");
        let items_json = serde_json::to_string(items)?;

        let mut form = BTreeMap::new();
        form.insert("network_id", network_id.to_string());
        form.insert("items", items_json);

        self.post_form(&url, &form).await
    }

    /// `POST /edge/cart/checkout/` — instructs a bot to check out its
    /// currently pushed cart against `giftee_account_id` using the given
    /// payment method (`"steamaccount"` or `"bitcoin"`).
    pub async fn checkout_cart(
        &self,
        ip_address: &str,
        network_id: i64,
        giftee_account_id: i64,
        payment_method: &str,
    ) -> Result<TaskCreated> {
        let url = Self::edge_url(ip_address, "cart/checkout/");
        let mut form = BTreeMap::new();
        form.insert("network_id", network_id.to_string());
        form.insert("giftee_account_id", giftee_account_id.to_string());
        form.insert("payment_method", payment_method.to_string());
        self.post_form(&url, &form).await
    }

    /// `POST /edge/cart/reset/` — clears a bot's cart without purchasing.
    pub async fn reset_cart(&self, ip_address: &str, network_id: i64) -> Result<TaskCreated> {
        let url = Self::edge_url(ip_address, "cart/reset/");
        let mut form = BTreeMap::new();
        form.insert("network_id", network_id.to_string());
        self.post_form(&url, &form).await
    }

    /// `POST /edge/transaction/link/` — requests the external payment link
    /// for a completed-but-unpaid transaction.
    pub async fn get_transaction_link(
        &self,
        ip_address: &str,
        trans_id: &str,
        network_id: i64,
    ) -> Result<TaskCreated> {
        let url = Self::edge_url(ip_address, "transaction/link/");
        let mut form = BTreeMap::new();
        form.insert("transid", trans_id.to_string());
        form.insert("network_id", network_id.to_string());
        self.post_form(&url, &form).await
    }

    /// `POST /edge/task/state/` — polls the status of a previously created task.
    pub async fn task_state(&self, ip_address: &str, task_name: &str, task_id: i64) -> Result<TaskStateResponse> {
        let url = Self::edge_url(ip_address, "task/state/");
        let mut form = BTreeMap::new();
        form.insert("task_name", task_name.to_string());
        form.insert("task_id", task_id.to_string());
        self.post_form(&url, &form).await
    }

    /// `GET /ISteamUser/GetFriendsList/?network_id&ids=1` — the bot's current
    /// friend list, as numeric external account ids.
    pub async fn get_friends_list(&self, ip_address: &str, network_id: i64) -> Result<Vec<i64>> {
        let url = Self::steam_url(ip_address, "GetFriendsList");
        let network_id = network_id.to_string();
        self.get_json(&url, &[("network_id", network_id.as_str()), ("ids", "1")])
            .await
    }

    /// `GET /ISteamUser/AddFriend/?network_id&steam_id` — sends a friend
    /// invite from the bot to `request.target_account_id`. The caller checks
    /// for a `"0"` key in the response to detect a full friend list.
    pub async fn add_friend(&self, ip_address: &str, request: &FriendRequest) -> Result<HashMap<String, serde_json::Value>> {
        let url = Self::steam_url(ip_address, "AddFriend");
        let network_id = request.network_id.to_string();
        let target_account_id = request.target_account_id.to_string();
        self.get_json(
            &url,
            &[("network_id", network_id.as_str()), ("steam_id", target_account_id.as_str())],
        )
        .await
    }

    async fn post_form<T: for<'de> Deserialize<'de>>(&self, url: &str, form: &BTreeMap<&str, String>) -> Result<T> {
        let response = self.http.post(url).form(form).send().await.map_err(|err| {
            DispatchError::Transport {
                endpoint: url.to_string(),
                reason: err.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Protocol {
                endpoint: url.to_string(),
                reason: format!("unexpected status {status}"),
            });
        }

        let body = response.text().await.map_err(|err| DispatchError::Transport {
            endpoint: url.to_string(),
            reason: err.to_string(),
        })?;

        serde_json::from_str(&body).map_err(|err| DispatchError::Protocol {
            endpoint: url.to_string(),
            reason: format!("malformed response body: {err}"),
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|err| DispatchError::Transport {
                endpoint: url.to_string(),
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Protocol {
                endpoint: url.to_string(),
                reason: format!("unexpected status {status}"),
            });
        }

        response.json().await.map_err(|err| DispatchError::Protocol {
            endpoint: url.to_string(),
            reason: format!("malformed response body: {err}"),
        })
    }
}

/// Request payload for `GetFriendsList`/`AddFriend`, kept here as a named
/// type so callers don't build ad hoc tuples at every call site.
#[derive(Debug, Clone, Serialize)]
pub struct FriendRequest {
    pub network_id: i64,
    pub target_account_id: i64,
}

/// `true` when an `AddFriend` response reports the bot's friend list is
/// full (presence of the `"0"` key per §4.3's contract).
pub fn friend_list_is_full(response: &HashMap<String, serde_json::Value>) -> bool {
    response.contains_key("0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_url_matches_the_expected_shape() {
        assert_eq!(
            EdgeClient::edge_url("10.0.0.1:8080", "cart/push/"),
            "http://10.0.0.1:8080/edge/cart/push/"
        );
    }

    #[test]
    fn steam_url_matches_the_expected_shape() {
        assert_eq!(
            EdgeClient::steam_url("10.0.0.1:8080", "GetFriendsList"),
            "http://10.0.0.1:8080/ISteamUser/GetFriendsList/"
        );
    }

    #[test]
    fn friend_list_full_is_detected_by_the_zero_key() {
        let mut full = HashMap::new();
        full.insert("0".to_string(), serde_json::json!("friends list full"));
        assert!(friend_list_is_full(&full));

        let mut ok = HashMap::new();
        ok.insert("76561198000000001".to_string(), serde_json::json!("added"));
        assert!(!friend_list_is_full(&ok));
    }

    #[test]
    fn decodes_checkout_task_result_as_code_when_numeric() {
        let decoded = decode_task_result(TaskKind::CheckoutCart, serde_json::json!(5)).unwrap();
        assert!(matches!(decoded, TaskResult::Code(5)));
    }

    #[test]
    fn decodes_checkout_task_result_as_struct_when_object() {
        let decoded = decode_task_result(
            TaskKind::CheckoutCart,
            serde_json::json!({"result": "OK", "payment_method": "steamaccount"}),
        )
        .unwrap();
        match decoded {
            TaskResult::Checkout(outcome) => {
                assert_eq!(outcome.result, "OK");
                assert_eq!(outcome.payment_method.as_deref(), Some("steamaccount"));
            }
            other => panic!("expected Checkout, got {other:?}"),
        }
    }

    #[test]
    fn decodes_cart_result_payload() {
        let decoded = decode_task_result(
            TaskKind::AddSubidsToCart,
            serde_json::json!({
                "successful_items": [{"sub_id": 1, "user_id": 9, "relation_type": "A", "relation_id": 10}],
                "failed_items": [],
                "failed_shopping_cart_gids": [],
                "shopping_cart_gid": "gid-1",
            }),
        )
        .unwrap();
        match decoded {
            TaskResult::Cart(cart) => {
                assert_eq!(cart.successful_items.len(), 1);
                assert_eq!(cart.shopping_cart_gid.as_deref(), Some("gid-1"));
            }
            other => panic!("expected Cart, got {other:?}"),
        }
    }
}
