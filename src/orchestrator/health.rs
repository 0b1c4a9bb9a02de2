use std::collections::HashMap;

use tracing::{info, warn};

use crate::domain::EdgeServer;
use crate::orchestrator::OrchestratorContext;

/// Caches healthcheck results for the lifetime of one orchestrator pass so
/// a server backing multiple currencies is only probed once per run.
#[derive(Default)]
pub struct HealthCache {
    results: HashMap<i64, bool>,
}

impl HealthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes `server` at most once per cache lifetime; a successful probe
    /// stamps `last_health_check` through the persistence gateway.
    pub async fn is_healthy(&mut self, ctx: &OrchestratorContext, server: &EdgeServer) -> bool {
        if let Some(&healthy) = self.results.get(&server.id) {
            return healthy;
        }

        let healthy = ctx.edge.healthcheck(&server.ip_address).await;
        if healthy {
            if let Err(err) = ctx.store.update_edge_server_health_check(server.id).await {
                warn!(server_id = server.id, error = %err, "failed to stamp edge server health check");
            }
        } else {
            info!(server_id = server.id, ip = %server.ip_address, "edge server is not healthy");
        }
        self.results.insert(server.id, healthy);
        healthy
    }
}
