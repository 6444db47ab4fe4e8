//! A mirrored router and its VRFs.

use crate::config::FeedConfig;
use crate::error::{MirrorError, Result};
use crate::feed::FeedSource;
use crate::instance::RoutingInstance;
use crate::metrics::MetricsCollector;
use parking_lot::RwLock;
use ris_types::{AddressFamily, IpAddress, RouteDistinguisher};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// One router whose RIBs are mirrored. Name and address never change after
/// creation; VRFs are created on first reference.
pub struct Router {
    name: Arc<str>,
    address: IpAddress,
    vrfs: RwLock<HashMap<RouteDistinguisher, Arc<RoutingInstance>>>,
    config: FeedConfig,
    metrics: Option<MetricsCollector>,
    cancel: CancellationToken,
}

impl Router {
    pub(crate) fn new(
        name: &str,
        address: IpAddress,
        config: FeedConfig,
        metrics: Option<MetricsCollector>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: Arc::from(name),
            address,
            vrfs: RwLock::new(HashMap::new()),
            config,
            metrics,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> IpAddress {
        self.address
    }

    pub fn get_vrf(&self, rd: RouteDistinguisher) -> Option<Arc<RoutingInstance>> {
        self.vrfs.read().get(&rd).cloned()
    }

    /// Snapshot of every VRF, ordered by route distinguisher.
    pub fn vrfs(&self) -> Vec<Arc<RoutingInstance>> {
        let mut vrfs: Vec<_> = self.vrfs.read().values().cloned().collect();
        vrfs.sort_by_key(|vrf| vrf.route_distinguisher());
        vrfs
    }

    /// Returns the VRF for `rd`, creating it on first reference, and
    /// attaches `sources` to it. Sources already feeding the VRF are kept
    /// as they are.
    #[instrument(skip(self, sources), fields(router = %self.name, sources = sources.len()))]
    pub fn get_or_create_vrf(
        &self,
        rd: RouteDistinguisher,
        sources: &[FeedSource],
    ) -> Result<Arc<RoutingInstance>> {
        let vrf = match self.get_vrf(rd) {
            Some(vrf) => vrf,
            None => {
                let mut vrfs = self.vrfs.write();
                if self.cancel.is_cancelled() {
                    return Err(MirrorError::ShutDown(format!("router {}", self.name)));
                }
                let vrf = vrfs.entry(rd).or_insert_with(|| {
                    info!(vrf = %rd, "Creating VRF");
                    Arc::new(RoutingInstance::new(
                        Arc::clone(&self.name),
                        self.address,
                        rd,
                        self.config.clone(),
                        self.metrics.clone(),
                        self.cancel.child_token(),
                    ))
                });
                Arc::clone(vrf)
            }
        };

        vrf.attach_sources(sources)?;
        Ok(vrf)
    }

    /// Whether the `afi` table of VRF `rd` is authoritative.
    pub fn ready(&self, rd: RouteDistinguisher, afi: u16) -> Result<bool> {
        let family = AddressFamily::from_afi(afi)?;
        let vrf = self.get_vrf(rd).ok_or(MirrorError::UnknownVrf(rd))?;
        Ok(vrf.is_ready(family))
    }

    /// Removes a VRF and stops its feeds. Returns false if it did not exist.
    pub async fn remove_vrf(&self, rd: RouteDistinguisher) -> bool {
        let removed = self.vrfs.write().remove(&rd);
        match removed {
            Some(vrf) => {
                vrf.shutdown().await;
                info!(router = %self.name, vrf = %rd, "Removed VRF");
                true
            }
            None => false,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops every feed of every VRF.
    pub async fn shutdown(&self) {
        let vrfs: Vec<_> = {
            let mut vrfs = self.vrfs.write();
            self.cancel.cancel();
            vrfs.drain().map(|(_, vrf)| vrf).collect()
        };

        for vrf in vrfs {
            vrf.shutdown().await;
        }
        info!(router = %self.name, "Router shut down");
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("vrfs", &self.vrfs.read().len())
            .finish()
    }
}
