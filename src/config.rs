use std::path::Path;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;

fn default_database_max_connections() -> u32 {
    5
}

fn default_edge_connect_timeout_ms() -> u64 {
    10_000
}

fn default_edge_read_timeout_ms() -> u64 {
    20_000
}

fn default_use_informed() -> bool {
    false
}

fn default_payment_method() -> String {
    "steamaccount".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_database_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CoinbaseConfig {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RollbarConfig {
    pub token: Option<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdgeClientConfig {
    #[serde(default = "default_edge_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_edge_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for EdgeClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_edge_connect_timeout_ms(),
            read_timeout_ms: default_edge_read_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_logging_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// The account that items get assigned to once purchased.
    pub owner_id: i64,
    /// Legacy global fallback for per-user giftee derivation; see
    /// `orchestrator::invitations` for the derivation rule itself.
    pub giftee_account_id: Option<i64>,
    #[serde(default = "default_payment_method")]
    pub payment_method: String,
    #[serde(default)]
    pub coinbase: CoinbaseConfig,
    #[serde(default)]
    pub rollbar: RollbarConfig,
    #[serde(default = "default_use_informed")]
    pub use_informed: bool,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub edge: EdgeClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let env_name = std::env::var("EDGE_ENV").unwrap_or_else(|_| "development".to_string());

        let mut builder = Config::builder()
            .set_default("payment_method", "steamaccount")?
            .set_default("use_informed", false)?
            .set_default("database.max_connections", 5i64)?
            .set_default("edge.connect_timeout_ms", 10_000i64)?
            .set_default("edge.read_timeout_ms", 20_000i64)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?;

        if path.is_dir() {
            builder = builder
                .add_source(File::from(path.join("default")).required(false))
                .add_source(File::from(path.join(&env_name)).required(false));
        } else {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("EDGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut app_config: AppConfig = builder.build()?.try_deserialize()?;
        apply_env_overrides(&mut app_config);
        Ok(app_config)
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.owner_id <= 0 {
            errors.push("owner_id must be a positive account id".to_string());
        }

        if self.payment_method == "bitcoin"
            && (self.coinbase.api_key.is_none() || self.coinbase.api_secret.is_none())
        {
            errors.push(
                "PAYMENT_METHOD=bitcoin requires COINBASE_API_KEY and COINBASE_API_SECRET"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Re-reads a handful of legacy bare environment variable names that predate
/// the `EDGE_` prefix convention, so operators migrating existing
/// deployments don't need to rename anything on day one.
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(owner_id) = std::env::var("OWNER_ID") {
        if let Ok(parsed) = owner_id.parse() {
            config.owner_id = parsed;
        }
    }
    if let Ok(giftee) = std::env::var("GIFTEE_ACCOUNT_ID") {
        if let Ok(parsed) = giftee.parse() {
            config.giftee_account_id = Some(parsed);
        }
    }
    if let Ok(method) = std::env::var("PAYMENT_METHOD") {
        config.payment_method = method;
    }
    if let Ok(key) = std::env::var("COINBASE_API_KEY") {
        config.coinbase.api_key = Some(key);
    }
    if let Ok(secret) = std::env::var("COINBASE_API_SECRET") {
        config.coinbase.api_secret = Some(secret);
    }
    if let Ok(token) = std::env::var("ROLLBAR_TOKEN") {
        config.rollbar.token = Some(token);
    }
    if let Ok(env) = std::env::var("ROLLBAR_ENV") {
        config.rollbar.environment = Some(env);
    }
    if let Ok(informed) = std::env::var("USE_INFORMED") {
        config.use_informed = parse_bool_like(&informed);
    }
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.database.url = url;
    }
}

fn parse_bool_like(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_like_accepts_common_truthy_spellings() {
        assert!(parse_bool_like("1"));
        assert!(parse_bool_like("true"));
        assert!(parse_bool_like("YES"));
        assert!(!parse_bool_like("0"));
        assert!(!parse_bool_like("false"));
    }

    #[test]
    fn validate_requires_coinbase_credentials_for_bitcoin() {
        let config = AppConfig {
            owner_id: 1,
            giftee_account_id: None,
            payment_method: "bitcoin".to_string(),
            coinbase: CoinbaseConfig::default(),
            rollbar: RollbarConfig::default(),
            use_informed: false,
            database: DatabaseConfig {
                url: "postgres://localhost/edge".to_string(),
                max_connections: 5,
            },
            edge: EdgeClientConfig::default(),
            logging: LoggingConfig::default(),
        };

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("COINBASE")));
    }
}
