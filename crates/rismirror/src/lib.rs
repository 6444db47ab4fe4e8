//! RIS mirror: a merged, redundant view of remote routers' RIBs
//!
//! Each mirrored router is observed through several independent upstream
//! feeds. Every feed streams the same routing instance, so losing one of
//! them must not make any route disappear. The crate keeps one
//! [`MergedTable`] per (router, VRF, address family) and merges all feeds
//! into it by presence counting: a route is visible while at least one feed
//! reports it.
//!
//! # Architecture
//!
//! ```text
//!  RouterRegistry
//!    └── Router (name, address)
//!          └── RoutingInstance (route distinguisher)
//!                ├── MergedTable ipv4 ◀── FeedConnection × sources
//!                └── MergedTable ipv6 ◀── FeedConnection × sources
//! ```
//!
//! Feed connections reconnect with capped exponential backoff and
//! resynchronize from scratch on every session. Each session bumps the
//! feed's generation; the session's end-of-sync marker sweeps whatever the
//! previous generation reported and the new one did not.

pub mod backoff;
pub mod config;
pub mod error;
pub mod feed;
pub mod instance;
pub mod merged_table;
pub mod metrics;
pub mod metrics_server;
pub mod registry;
pub mod router;
pub mod transport;

pub use config::{FeedConfig, MetricsConfig, MirrorConfig, RouterConfig};
pub use error::{FeedError, MergeError, MirrorError, Result};
pub use feed::{
    FeedConnection, FeedEvent, FeedHandle, FeedSource, FeedState, FeedStream, ObserveRequest,
    RibSubscriber,
};
pub use instance::RoutingInstance;
pub use merged_table::{Generation, MergedTable, RouteChange, SourceId};
pub use metrics::MetricsCollector;
pub use registry::RouterRegistry;
pub use router::Router;
pub use transport::JsonLinesSubscriber;
