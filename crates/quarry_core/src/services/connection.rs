//! Per-target connection pools.
//!
//! Provides lazy pool management with:
//! - One pool per (target, driver), created on first use
//! - Serialized creation so concurrent first queries share a pool
//! - Discarding pools whose tunnel is no longer live
//! - Never registering a pool whose creation straddled `close_all`

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{DatabaseTarget, DriverKind, PoolStatus, ResolvedEndpoint};
use crate::services::driver::{Backend, BackendFactory};
use crate::services::resolver::ConnectionResolver;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    target: String,
    driver: DriverKind,
}

impl PoolKey {
    fn of(target: &DatabaseTarget) -> Self {
        Self { target: target.name.clone(), driver: target.driver }
    }
}

/// A pool and the endpoint it was built against.
struct PoolEntry {
    backend: Arc<dyn Backend>,
    endpoint: ResolvedEndpoint,
    created_at: DateTime<Utc>,
}

/// Registry of live pools, keyed by target and driver.
pub struct ConnectionPoolRegistry {
    resolver: Arc<ConnectionResolver>,
    factory: Arc<dyn BackendFactory>,
    max_size: usize,
    pools: Mutex<HashMap<PoolKey, PoolEntry>>,
    gates: Mutex<HashMap<PoolKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Bumped by `close_all` under the pool-map lock.
    epoch: AtomicU64,
}

impl ConnectionPoolRegistry {
    /// Create an empty registry.
    pub fn new(
        resolver: Arc<ConnectionResolver>,
        factory: Arc<dyn BackendFactory>,
        max_size: usize,
    ) -> Self {
        Self {
            resolver,
            factory,
            max_size,
            pools: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Get the pool for `target`, creating it if needed.
    ///
    /// The endpoint is resolved once per pool; a pool built over a tunnel
    /// that has since gone away is closed and replaced. Fails with
    /// [`QuarryError::Shutdown`] if `close_all` runs while the pool is being
    /// created.
    pub async fn get_pool(&self, target: &DatabaseTarget) -> QuarryResult<Arc<dyn Backend>> {
        let key = PoolKey::of(target);
        if let Some(backend) = self.lookup(&key) {
            return Ok(backend);
        }

        let gate = self.gates.lock().entry(key.clone()).or_default().clone();
        let _creating = gate.lock().await;

        if let Some(backend) = self.lookup(&key) {
            return Ok(backend);
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let endpoint = self.resolver.resolve(target).await?;
        let backend = self.factory.create(target, &endpoint, self.max_size)?;

        let registered = {
            let mut pools = self.pools.lock();
            let current = self.epoch.load(Ordering::SeqCst) == epoch;
            if current {
                tracing::debug!(
                    target_name = %target.name,
                    driver = %target.driver,
                    host = %endpoint.host,
                    port = endpoint.port,
                    "Registered connection pool"
                );
                pools.insert(
                    key,
                    PoolEntry { backend: backend.clone(), endpoint, created_at: Utc::now() },
                );
            }
            current
        };

        if !registered {
            backend.close().await;
            return Err(QuarryError::shutdown(format!(
                "Pools were closed while connecting to '{}'",
                target.name
            )));
        }
        Ok(backend)
    }

    /// Return a usable pool, evicting it if its tunnel is gone.
    fn lookup(&self, key: &PoolKey) -> Option<Arc<dyn Backend>> {
        let mut pools = self.pools.lock();
        let entry = pools.get(key)?;

        let live = match entry.endpoint.tunnel {
            Some(tunnel) => self.resolver.tunnels().is_live(&key.target, tunnel.generation),
            None => true,
        };
        if live {
            return Some(entry.backend.clone());
        }

        if let Some(stale) = pools.remove(key) {
            tracing::info!(
                target_name = %key.target,
                age_secs = (Utc::now() - stale.created_at).num_seconds(),
                "Discarding pool built over a closed tunnel"
            );
            close_in_background(stale.backend);
        }
        None
    }

    /// Discard every pool belonging to `target_name`.
    ///
    /// Pools are closed in the background; callers need not be async.
    pub fn invalidate(&self, target_name: &str) {
        let removed: Vec<PoolEntry> = {
            let mut pools = self.pools.lock();
            let keys: Vec<PoolKey> =
                pools.keys().filter(|k| k.target == target_name).cloned().collect();
            keys.iter().filter_map(|k| pools.remove(k)).collect()
        };

        for entry in removed {
            tracing::info!(target_name, "Invalidated connection pool");
            close_in_background(entry.backend);
        }
    }

    /// Close and remove every pool.
    pub async fn close_all(&self) {
        let drained: Vec<(PoolKey, PoolEntry)> = {
            let mut pools = self.pools.lock();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            pools.drain().collect()
        };

        for (key, entry) in drained {
            entry.backend.close().await;
            tracing::debug!(target_name = %key.target, "Closed connection pool");
        }
    }

    /// Number of registered pools.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Status of every pool, ordered by target name.
    pub fn statuses(&self) -> Vec<(String, PoolStatus)> {
        let mut statuses: Vec<(String, PoolStatus)> = self
            .pools
            .lock()
            .iter()
            .map(|(key, entry)| (key.target.clone(), entry.backend.status()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }
}

fn close_in_background(backend: Arc<dyn Backend>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { backend.close().await });
        }
        Err(_) => tracing::warn!("No runtime to close pool; dropping it"),
    }
}
