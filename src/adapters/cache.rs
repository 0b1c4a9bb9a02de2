use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;

/// Invalidates cached relation reads after a write. The cache backend
/// itself lives outside this crate; this trait is the full extent of our
/// integration with it.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn purge(&self, keys: &[String]) -> Result<()>;
}

/// Default invalidator for environments with no cache layer wired up:
/// logs the keys that would have been purged and does nothing else.
pub struct NullCacheInvalidator;

#[async_trait]
impl CacheInvalidator for NullCacheInvalidator {
    async fn purge(&self, keys: &[String]) -> Result<()> {
        debug!(?keys, "cache purge requested with no invalidator configured");
        Ok(())
    }
}

/// Posts the key list to a remote purge endpoint. Failures are logged and
/// swallowed — a missed cache purge is a staleness bug, not a reason to
/// fail the relation write that triggered it.
pub struct HttpCacheInvalidator {
    client: reqwest::Client,
    purge_url: String,
}

impl HttpCacheInvalidator {
    pub fn new(purge_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            purge_url,
        }
    }
}

#[async_trait]
impl CacheInvalidator for HttpCacheInvalidator {
    async fn purge(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        if let Err(err) = self
            .client
            .post(&self.purge_url)
            .json(&serde_json::json!({ "keys": keys }))
            .send()
            .await
        {
            warn!(?keys, error = %err, "cache purge request failed");
        }
        Ok(())
    }
}

/// Cache keys for a single relation, per `RequestKind`.
pub fn relation_key(kind: crate::domain::RequestKind, relation_id: i64) -> String {
    match kind {
        crate::domain::RequestKind::UserRequest => format!("userrequest/relation/{relation_id}"),
        crate::domain::RequestKind::PaidRequest => format!("paidrequest/relation/{relation_id}"),
    }
}

/// Wildcard keys used when a bulk rollback touches an unknown number of rows.
pub fn wildcard_relation_keys() -> Vec<String> {
    vec![
        "paidrequest/relation/*".to_string(),
        "userrequest/relation/*".to_string(),
    ]
}
