//! Decides where a target's pool should connect.
//!
//! Targets with a bastion go through an SSH tunnel. If establishing that
//! tunnel ever fails, the target is marked for fallback and every later
//! resolution connects directly to its host and port. The mark is never
//! cleared. A tunnel that dies after becoming active does not mark fallback,
//! and neither does an attempt aborted by shutdown.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::QuarryResult;
use crate::models::{DatabaseTarget, ResolvedEndpoint};
use crate::services::tunnel::TunnelManager;

/// Resolves targets to endpoints, tracking fallback marks.
pub struct ConnectionResolver {
    tunnels: Arc<TunnelManager>,
    fallback: RwLock<HashSet<String>>,
}

impl ConnectionResolver {
    /// Create a resolver over a tunnel manager.
    pub fn new(tunnels: Arc<TunnelManager>) -> Self {
        Self { tunnels, fallback: RwLock::new(HashSet::new()) }
    }

    /// Resolve the endpoint for `target`.
    ///
    /// Tunnel errors degrade to a direct endpoint. The only error returned
    /// is [`QuarryError::Shutdown`](crate::QuarryError::Shutdown), when the
    /// tunnel attempt was aborted by closing all tunnels.
    pub async fn resolve(&self, target: &DatabaseTarget) -> QuarryResult<ResolvedEndpoint> {
        if self.is_fallback(&target.name) {
            tracing::debug!(target_name = %target.name, "Using direct connection (fallback)");
            return Ok(ResolvedEndpoint::direct(target));
        }

        if !target.uses_ssh() {
            return Ok(ResolvedEndpoint::direct(target));
        }

        match self.tunnels.establish_tunnel(target).await {
            Ok(tunnel) => Ok(ResolvedEndpoint::tunneled(tunnel)),
            Err(e) if e.is_shutdown() => Err(e),
            Err(e) => {
                tracing::warn!(
                    target_name = %target.name,
                    error = %e,
                    "SSH tunnel unavailable, falling back to direct connection"
                );
                self.fallback.write().insert(target.name.clone());
                Ok(ResolvedEndpoint::direct(target))
            }
        }
    }

    /// Whether `target_name` has been marked for direct connections.
    pub fn is_fallback(&self, target_name: &str) -> bool {
        self.fallback.read().contains(target_name)
    }

    /// The tunnel manager this resolver establishes through.
    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }
}
