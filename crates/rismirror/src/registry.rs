//! Process-wide registry of mirrored routers.

use crate::config::FeedConfig;
use crate::error::{MirrorError, Result};
use crate::feed::FeedSource;
use crate::metrics::MetricsCollector;
use crate::router::Router;
use parking_lot::RwLock;
use ris_types::{IpAddress, RouteDistinguisher};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Owns every [`Router`] and, through them, every feed connection.
///
/// Lookups take a shared lock; only router creation and removal write.
/// Constructed once by the daemon and passed by reference; dropping it
/// without [`shutdown`](Self::shutdown) leaves feed tasks running until the
/// runtime stops.
pub struct RouterRegistry {
    routers: RwLock<HashMap<String, Arc<Router>>>,
    config: FeedConfig,
    metrics: Option<MetricsCollector>,
    cancel: CancellationToken,
}

impl RouterRegistry {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            routers: RwLock::new(HashMap::new()),
            config,
            metrics: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the router called `name`, creating it if needed.
    ///
    /// Fails if `name` is already registered with another address.
    pub fn get_or_create_router(&self, name: &str, address: IpAddress) -> Result<Arc<Router>> {
        if let Some(router) = self.routers.read().get(name) {
            return Self::check_address(router, address);
        }

        let mut routers = self.routers.write();
        if self.cancel.is_cancelled() {
            return Err(MirrorError::ShutDown("router registry".to_string()));
        }
        if let Some(router) = routers.get(name) {
            return Self::check_address(router, address);
        }

        info!(router = name, %address, "Registering router");
        let router = Arc::new(Router::new(
            name,
            address,
            self.config.clone(),
            self.metrics.clone(),
            self.cancel.child_token(),
        ));
        routers.insert(name.to_string(), Arc::clone(&router));
        Ok(router)
    }

    fn check_address(router: &Arc<Router>, address: IpAddress) -> Result<Arc<Router>> {
        if router.address() != address {
            return Err(MirrorError::ConflictingRouter {
                name: router.name().to_string(),
                existing: router.address(),
                requested: address,
            });
        }
        Ok(Arc::clone(router))
    }

    pub fn get_router(&self, name: &str) -> Option<Arc<Router>> {
        self.routers.read().get(name).cloned()
    }

    /// Snapshot of all routers, ordered by name.
    pub fn routers(&self) -> Vec<Arc<Router>> {
        let mut routers: Vec<_> = self.routers.read().values().cloned().collect();
        routers.sort_by(|a, b| a.name().cmp(b.name()));
        routers
    }

    /// Registers a router and mirrors each of `vrfs` from every one of
    /// `sources`.
    #[instrument(skip(self, sources, vrfs), fields(sources = sources.len(), vrfs = vrfs.len()))]
    pub fn add_target(
        &self,
        name: &str,
        address: IpAddress,
        sources: &[FeedSource],
        vrfs: &[RouteDistinguisher],
    ) -> Result<Arc<Router>> {
        let router = self.get_or_create_router(name, address)?;
        for rd in vrfs {
            router.get_or_create_vrf(*rd, sources)?;
        }
        Ok(router)
    }

    /// True when every table of every VRF is authoritative.
    pub fn is_ready(&self) -> bool {
        self.routers().iter().all(|router| {
            router
                .vrfs()
                .iter()
                .all(|vrf| vrf.tables().iter().all(|table| table.is_ready()))
        })
    }

    /// Removes a router and stops all of its feeds.
    pub async fn remove_router(&self, name: &str) -> bool {
        let removed = self.routers.write().remove(name);
        match removed {
            Some(router) => {
                router.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Stops every feed and refuses further registrations.
    pub async fn shutdown(&self) {
        let routers: Vec<_> = {
            let mut routers = self.routers.write();
            self.cancel.cancel();
            routers.drain().map(|(_, router)| router).collect()
        };

        info!(routers = routers.len(), "Shutting down router registry");
        for router in routers {
            router.shutdown().await;
        }
    }
}

impl std::fmt::Debug for RouterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterRegistry")
            .field("routers", &self.routers.read().len())
            .finish()
    }
}
