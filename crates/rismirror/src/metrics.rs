//! Prometheus metrics collection for ris-mirror

use crate::feed::FeedState;
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use ris_types::{AddressFamily, RouteDistinguisher};
use std::sync::Arc;

/// Metrics collector shared by every router, table and feed
#[derive(Clone)]
pub struct MetricsCollector {
    pub routes: IntGaugeVec,
    pub ready: IntGaugeVec,
    pub feed_state: IntGaugeVec,
    pub route_events_total: IntCounterVec,
    pub feed_reconnects_total: IntCounterVec,
    pub feed_protocol_errors_total: IntCounterVec,
    pub stale_routes_purged_total: IntCounterVec,

    // Registry for export
    pub registry: Arc<Registry>,
}

/// Handles for one merged table, resolved once at table creation
#[derive(Clone, Debug)]
pub struct TableMetrics {
    pub routes: IntGauge,
    pub ready: IntGauge,
    pub added: IntCounter,
    pub changed: IntCounter,
    pub removed: IntCounter,
    pub purged: IntCounter,
}

/// Handles for one feed connection
#[derive(Clone, Debug)]
pub struct FeedMetrics {
    pub state: IntGauge,
    pub reconnects: IntCounter,
    pub protocol_errors: IntCounter,
}

const TABLE_LABELS: &[&str] = &["router", "vrf", "afi"];
const FEED_LABELS: &[&str] = &["router", "vrf", "afi", "source"];

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let routes = IntGaugeVec::new(
            Opts::new("rismirror_routes", "Routes currently visible in a merged table"),
            TABLE_LABELS,
        )?;
        registry.register(Box::new(routes.clone()))?;

        let ready = IntGaugeVec::new(
            Opts::new(
                "rismirror_ready",
                "Merged table readiness (1=authoritative, 0=not ready)",
            ),
            TABLE_LABELS,
        )?;
        registry.register(Box::new(ready.clone()))?;

        let feed_state = IntGaugeVec::new(
            Opts::new(
                "rismirror_feed_state",
                "Feed state (0=connecting, 1=synchronizing, 2=synchronized, 3=disconnected)",
            ),
            FEED_LABELS,
        )?;
        registry.register(Box::new(feed_state.clone()))?;

        let mut event_labels = TABLE_LABELS.to_vec();
        event_labels.push("kind");
        let route_events_total = IntCounterVec::new(
            Opts::new(
                "rismirror_route_events_total",
                "Changes applied to merged tables by kind",
            ),
            &event_labels,
        )?;
        registry.register(Box::new(route_events_total.clone()))?;

        let feed_reconnects_total = IntCounterVec::new(
            Opts::new(
                "rismirror_feed_reconnects_total",
                "Reconnect attempts after a feed session ended or failed to start",
            ),
            FEED_LABELS,
        )?;
        registry.register(Box::new(feed_reconnects_total.clone()))?;

        let feed_protocol_errors_total = IntCounterVec::new(
            Opts::new(
                "rismirror_feed_protocol_errors_total",
                "Feed sessions torn down because of protocol errors",
            ),
            FEED_LABELS,
        )?;
        registry.register(Box::new(feed_protocol_errors_total.clone()))?;

        let stale_routes_purged_total = IntCounterVec::new(
            Opts::new(
                "rismirror_stale_routes_purged_total",
                "Feed presences purged by end-of-sync reconciliation or staleness timeout",
            ),
            TABLE_LABELS,
        )?;
        registry.register(Box::new(stale_routes_purged_total.clone()))?;

        Ok(Self {
            routes,
            ready,
            feed_state,
            route_events_total,
            feed_reconnects_total,
            feed_protocol_errors_total,
            stale_routes_purged_total,
            registry: Arc::new(registry),
        })
    }

    pub fn table_metrics(
        &self,
        router: &str,
        vrf: RouteDistinguisher,
        family: AddressFamily,
    ) -> TableMetrics {
        let vrf = vrf.label();
        let labels = [router, vrf.as_str(), family.as_str()];
        let event = |kind: &str| {
            self.route_events_total
                .with_label_values(&[router, vrf.as_str(), family.as_str(), kind])
        };

        TableMetrics {
            routes: self.routes.with_label_values(&labels),
            ready: self.ready.with_label_values(&labels),
            added: event("added"),
            changed: event("changed"),
            removed: event("removed"),
            purged: self.stale_routes_purged_total.with_label_values(&labels),
        }
    }

    pub fn feed_metrics(
        &self,
        router: &str,
        vrf: RouteDistinguisher,
        family: AddressFamily,
        source: &str,
    ) -> FeedMetrics {
        let vrf = vrf.label();
        let labels = [router, vrf.as_str(), family.as_str(), source];

        FeedMetrics {
            state: self.feed_state.with_label_values(&labels),
            reconnects: self.feed_reconnects_total.with_label_values(&labels),
            protocol_errors: self.feed_protocol_errors_total.with_label_values(&labels),
        }
    }

    /// Drops every series of one table. Called when its routing instance is
    /// torn down.
    pub fn remove_table_metrics(&self, router: &str, vrf: RouteDistinguisher, family: AddressFamily) {
        let vrf = vrf.label();
        let labels = [router, vrf.as_str(), family.as_str()];

        // Not-found only means the series was never touched.
        let _ = self.routes.remove_label_values(&labels);
        let _ = self.ready.remove_label_values(&labels);
        let _ = self.stale_routes_purged_total.remove_label_values(&labels);
        for kind in ["added", "changed", "removed"] {
            let _ = self
                .route_events_total
                .remove_label_values(&[router, vrf.as_str(), family.as_str(), kind]);
        }
    }

    /// Drops every series of one feed connection.
    pub fn remove_feed_metrics(
        &self,
        router: &str,
        vrf: RouteDistinguisher,
        family: AddressFamily,
        source: &str,
    ) {
        let vrf = vrf.label();
        let labels = [router, vrf.as_str(), family.as_str(), source];

        let _ = self.feed_state.remove_label_values(&labels);
        let _ = self.feed_reconnects_total.remove_label_values(&labels);
        let _ = self.feed_protocol_errors_total.remove_label_values(&labels);
    }
}

impl FeedMetrics {
    pub fn set_state(&self, state: FeedState) {
        self.state.set(state.as_i64());
    }
}
