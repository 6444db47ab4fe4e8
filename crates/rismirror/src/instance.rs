//! Routing-instance records: the merged tables of one VRF and the feeds
//! writing into them.

use crate::config::FeedConfig;
use crate::error::{MirrorError, Result};
use crate::feed::{FeedConnection, FeedHandle, FeedSource, FeedState, ObserveRequest};
use crate::merged_table::MergedTable;
use crate::metrics::MetricsCollector;
use parking_lot::Mutex;
use ris_types::{AddressFamily, IpAddress, RouteDistinguisher};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

type FeedKey = (AddressFamily, Arc<str>);

/// One VRF of a mirrored router.
///
/// Holds one [`MergedTable`] per supported address family and one feed
/// connection per (family, source) pair. Sources may be attached at any
/// time; attaching one that is already present is a no-op.
pub struct RoutingInstance {
    router: Arc<str>,
    address: IpAddress,
    rd: RouteDistinguisher,
    ipv4: Arc<MergedTable>,
    ipv6: Arc<MergedTable>,
    feeds: Mutex<HashMap<FeedKey, FeedHandle>>,
    config: FeedConfig,
    metrics: Option<MetricsCollector>,
    cancel: CancellationToken,
}

impl RoutingInstance {
    pub(crate) fn new(
        router: Arc<str>,
        address: IpAddress,
        rd: RouteDistinguisher,
        config: FeedConfig,
        metrics: Option<MetricsCollector>,
        cancel: CancellationToken,
    ) -> Self {
        let table = |family| {
            let table = MergedTable::with_capacity(family, config.change_channel_capacity);
            let table = match &metrics {
                Some(m) => table.with_metrics(m.table_metrics(&router, rd, family)),
                None => table,
            };
            Arc::new(table)
        };

        Self {
            ipv4: table(AddressFamily::Ipv4Unicast),
            ipv6: table(AddressFamily::Ipv6Unicast),
            router,
            address,
            rd,
            feeds: Mutex::new(HashMap::new()),
            config,
            metrics,
            cancel,
        }
    }

    pub fn route_distinguisher(&self) -> RouteDistinguisher {
        self.rd
    }

    /// Human-readable VRF name used in logs and metrics.
    pub fn label(&self) -> String {
        self.rd.label()
    }

    pub fn table(&self, family: AddressFamily) -> &Arc<MergedTable> {
        match family {
            AddressFamily::Ipv4Unicast => &self.ipv4,
            AddressFamily::Ipv6Unicast => &self.ipv6,
        }
    }

    /// Looks a table up by IANA AFI number. `None` for unsupported families.
    pub fn table_by_afi(&self, afi: u16) -> Option<&Arc<MergedTable>> {
        AddressFamily::from_afi(afi).ok().map(|family| self.table(family))
    }

    pub fn tables(&self) -> [&Arc<MergedTable>; 2] {
        [&self.ipv4, &self.ipv6]
    }

    pub fn is_ready(&self, family: AddressFamily) -> bool {
        self.table(family).is_ready()
    }

    /// Spawns a feed connection for every (family, source) pair not yet
    /// present. Returns how many were spawned.
    #[instrument(skip(self, sources), fields(router = %self.router, vrf = %self.rd))]
    pub fn attach_sources(&self, sources: &[FeedSource]) -> Result<usize> {
        let mut feeds = self.feeds.lock();
        if self.cancel.is_cancelled() {
            return Err(MirrorError::ShutDown(format!("VRF {}", self.rd)));
        }

        let mut spawned = 0;
        for source in sources {
            for family in AddressFamily::ALL {
                let key = (family, Arc::clone(&source.name));
                if feeds.contains_key(&key) {
                    continue;
                }

                let handle = self.spawn_feed(family, source);
                feeds.insert(key, handle);
                spawned += 1;
            }
        }

        if spawned > 0 {
            info!(spawned, total = feeds.len(), "Attached feeds");
        }
        Ok(spawned)
    }

    fn spawn_feed(&self, family: AddressFamily, source: &FeedSource) -> FeedHandle {
        let request = ObserveRequest {
            router: self.router.to_string(),
            address: self.address,
            vrf_id: self.rd.as_u64(),
            afi: family,
            allow_unready_rib: self.config.allow_unready_rib,
        };

        let connection = FeedConnection::new(
            source.clone(),
            request,
            Arc::clone(self.table(family)),
            &self.config,
            self.cancel.child_token(),
        );
        let connection = match &self.metrics {
            Some(m) => {
                connection.with_metrics(m.feed_metrics(&self.router, self.rd, family, &source.name))
            }
            None => connection,
        };

        debug!(afi = %family, source = %source.name, "Spawning feed connection");
        connection.spawn()
    }

    /// Number of feed connections, across both families.
    pub fn feed_count(&self) -> usize {
        self.feeds.lock().len()
    }

    /// Current state of every feed, ordered by family then source.
    pub fn feed_states(&self) -> Vec<(AddressFamily, String, FeedState)> {
        let mut states: Vec<_> = self
            .feeds
            .lock()
            .iter()
            .map(|((family, source), handle)| (*family, source.to_string(), handle.state()))
            .collect();
        states.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        states
    }

    /// State of the feed for one (family, source) pair.
    pub fn feed_state(&self, family: AddressFamily, source: &str) -> Option<FeedState> {
        self.feeds
            .lock()
            .get(&(family, Arc::from(source)))
            .map(FeedHandle::state)
    }

    /// Stops every feed, waits for them to exit, then closes both tables.
    pub async fn shutdown(&self) {
        let feeds: Vec<(FeedKey, FeedHandle)> = {
            let mut feeds = self.feeds.lock();
            self.cancel.cancel();
            feeds.drain().collect()
        };

        let mut stopped = Vec::with_capacity(feeds.len());
        for (key, handle) in feeds {
            handle.shutdown().await;
            stopped.push(key);
        }
        for table in self.tables() {
            table.close();
        }

        if let Some(metrics) = &self.metrics {
            for (family, source) in &stopped {
                metrics.remove_feed_metrics(&self.router, self.rd, *family, source);
            }
            for family in AddressFamily::ALL {
                metrics.remove_table_metrics(&self.router, self.rd, family);
            }
        }

        debug!(router = %self.router, vrf = %self.rd, "VRF shut down");
    }
}

impl std::fmt::Debug for RoutingInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingInstance")
            .field("router", &self.router)
            .field("rd", &self.rd)
            .field("feeds", &self.feed_count())
            .finish()
    }
}
