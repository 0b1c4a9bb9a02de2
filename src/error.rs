use thiserror::Error;

/// Main error type for the dispatch orchestrator.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The edge server could not be reached at all (connect/read timeout, DNS, refused).
    #[error("Edge transport failure talking to {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    /// The edge server answered but not with HTTP 200, or the payload didn't
    /// deserialize into the shape the caller expected.
    #[error("Edge protocol violation from {endpoint}: {reason}")]
    Protocol { endpoint: String, reason: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    /// Distinct from `Wallet`: the wallet is reachable and the invoice is
    /// valid, but the balance on hand doesn't cover `btcDue`. Maps to
    /// `WaitingForSufficientFunds` rather than `BlockedForUnknownReason`.
    #[error("Insufficient wallet balance: {0}")]
    InsufficientFunds(String),

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Unknown commitment level code: {0}")]
    UnknownCommitmentLevel(i32),

    #[error("Unknown bot status code: {0}")]
    UnknownBotStatus(i32),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
