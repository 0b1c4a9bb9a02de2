use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::domain::PaymentIdempotencyKey;
use crate::error::{DispatchError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Which payment rail an order should settle through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    SteamAccount,
    Bitcoin,
}

impl PaymentMethod {
    pub fn from_env_value(value: &str) -> Result<Self> {
        match value {
            "steamaccount" => Ok(PaymentMethod::SteamAccount),
            "bitcoin" => Ok(PaymentMethod::Bitcoin),
            other => Err(DispatchError::Validation(format!(
                "unknown PAYMENT_METHOD: {other}"
            ))),
        }
    }
}

/// Outcome of a wallet send, keyed by the idempotency key used to request it.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub idempotency_key: uuid::Uuid,
    pub already_existed: bool,
    pub transaction_id: String,
}

/// A payment-provider invoice, as looked up from the URL a `checkout_cart`
/// bitcoin dispatch resolves to.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Invoice {
    pub status: String,
    #[serde(rename = "btcDue")]
    pub btc_due: rust_decimal::Decimal,
    #[serde(rename = "bitcoinAddress")]
    pub bitcoin_address: String,
}

/// Abstraction over the Bitcoin payment rail so the orchestrator doesn't
/// depend on a concrete wallet SDK. A send keyed by an already-used
/// idempotency key must return the original result rather than sending
/// twice.
#[async_trait]
pub trait WalletClient: Send + Sync {
    async fn balance(&self) -> Result<rust_decimal::Decimal>;

    async fn send_to_invoice(
        &self,
        invoice_id: &str,
        amount: rust_decimal::Decimal,
        idempotency: &PaymentIdempotencyKey,
    ) -> Result<SendResult>;

    async fn fetch_invoice(&self, invoice_id: &str) -> Result<Invoice>;
}

/// Coinbase-style HMAC-authenticated wallet client. Request signing follows
/// the `timestamp + method + path + body` convention common to exchange
/// REST APIs.
pub struct CoinbaseWallet {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl CoinbaseWallet {
    pub fn new(base_url: String, api_key: String, api_secret: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            api_secret,
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("COINBASE_API_KEY")
            .map_err(|_| DispatchError::Wallet("COINBASE_API_KEY not set".to_string()))?;
        let api_secret = std::env::var("COINBASE_API_SECRET")
            .map_err(|_| DispatchError::Wallet("COINBASE_API_SECRET not set".to_string()))?;
        let base_url = std::env::var("COINBASE_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.coinbase.com".to_string());

        Ok(Self::new(base_url, api_key, api_secret))
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        let message = format!("{timestamp}{method}{path}{body}");
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|err| DispatchError::Wallet(format!("invalid api secret: {err}")))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> Result<reqwest::header::HeaderMap> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = self.sign(&timestamp, method, path, body)?;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("CB-ACCESS-KEY", self.api_key.parse().unwrap());
        headers.insert("CB-ACCESS-SIGN", signature.parse().unwrap());
        headers.insert("CB-ACCESS-TIMESTAMP", timestamp.parse().unwrap());
        Ok(headers)
    }
}

impl std::fmt::Debug for CoinbaseWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinbaseWallet")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl WalletClient for CoinbaseWallet {
    async fn balance(&self) -> Result<rust_decimal::Decimal> {
        let path = "/v2/accounts";
        let headers = self.auth_headers("GET", path, "")?;
        let url = format!("{}{}", self.base_url, path);

        let response = self.http.get(&url).headers(headers).send().await?;
        let payload: serde_json::Value = response.json().await?;

        let balance = payload["data"]
            .as_array()
            .and_then(|accounts| accounts.first())
            .and_then(|account| account["balance"]["amount"].as_str())
            .ok_or_else(|| DispatchError::Wallet("malformed balance response".to_string()))?;

        balance
            .parse()
            .map_err(|err| DispatchError::Wallet(format!("unparsable balance: {err}")))
    }

    async fn send_to_invoice(
        &self,
        invoice_id: &str,
        amount: rust_decimal::Decimal,
        idempotency: &PaymentIdempotencyKey,
    ) -> Result<SendResult> {
        let path = "/v2/accounts/primary/transactions";
        let body = serde_json::json!({
            "type": "send",
            "to": invoice_id,
            "amount": amount.to_string(),
            "currency": "BTC",
            "idem": idempotency.0.to_string(),
        })
        .to_string();

        let mut headers = self.auth_headers("POST", path, &body)?;
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            "application/json".parse().unwrap(),
        );

        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).headers(headers).body(body).send().await?;
        let status = response.status();
        let payload: serde_json::Value = response.json().await?;

        if !status.is_success() {
            return Err(DispatchError::Wallet(format!(
                "send failed: {status} {payload}"
            )));
        }

        let transaction_id = payload["data"]["id"]
            .as_str()
            .ok_or_else(|| DispatchError::Wallet("malformed send response".to_string()))?
            .to_string();

        Ok(SendResult {
            idempotency_key: idempotency.0,
            already_existed: payload["data"]["idem_duplicate"].as_bool().unwrap_or(false),
            transaction_id,
        })
    }

    async fn fetch_invoice(&self, invoice_id: &str) -> Result<Invoice> {
        let path = format!("/v2/invoices/{invoice_id}");
        let headers = self.auth_headers("GET", &path, "")?;
        let url = format!("{}{}", self.base_url, path);

        let response = self.http.get(&url).headers(headers).send().await?;
        let status = response.status();
        let payload: serde_json::Value = response.json().await?;

        if !status.is_success() {
            return Err(DispatchError::Wallet(format!(
                "invoice lookup failed: {status} {payload}"
            )));
        }

        let invoice: Invoice = serde_json::from_value(payload["data"].clone())
            .map_err(|err| DispatchError::Wallet(format!("malformed invoice payload: {err}")))?;
        Ok(invoice)
    }
}

/// Stand-in wallet for `steamaccount`-only deployments, which never reach
/// the bitcoin settlement path. Any call is a configuration bug.
pub struct UnconfiguredWallet;

#[async_trait]
impl WalletClient for UnconfiguredWallet {
    async fn balance(&self) -> Result<rust_decimal::Decimal> {
        Err(DispatchError::Wallet(
            "no wallet configured; PAYMENT_METHOD is not bitcoin".to_string(),
        ))
    }

    async fn send_to_invoice(
        &self,
        _invoice_id: &str,
        _amount: rust_decimal::Decimal,
        _idempotency: &PaymentIdempotencyKey,
    ) -> Result<SendResult> {
        Err(DispatchError::Wallet(
            "no wallet configured; PAYMENT_METHOD is not bitcoin".to_string(),
        ))
    }

    async fn fetch_invoice(&self, _invoice_id: &str) -> Result<Invoice> {
        Err(DispatchError::Wallet(
            "no wallet configured; PAYMENT_METHOD is not bitcoin".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_method_parses_known_values() {
        assert_eq!(PaymentMethod::from_env_value("bitcoin").unwrap(), PaymentMethod::Bitcoin);
        assert_eq!(
            PaymentMethod::from_env_value("steamaccount").unwrap(),
            PaymentMethod::SteamAccount
        );
        assert!(PaymentMethod::from_env_value("dogecoin").is_err());
    }

    #[test]
    fn debug_output_never_leaks_credentials() {
        let wallet = CoinbaseWallet::new(
            "https://api.coinbase.com".to_string(),
            "super-secret-key".to_string(),
            "super-secret-secret".to_string(),
        );
        let debug = format!("{wallet:?}");
        assert!(!debug.contains("super-secret-key"));
        assert!(!debug.contains("super-secret-secret"));
    }
}
