//! Error types for ris-mirror
//!
//! Three layers, matching where each error is handled:
//! - [`MirrorError`]: returned synchronously to callers of the registry
//! - [`FeedError`]: ends one feed session; the connection reconnects
//! - [`MergeError`]: a merged table refused an operation

use crate::merged_table::Generation;
use ris_types::{AddressFamily, IpAddress, ParseError, RouteDistinguisher};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the router registry, configuration and daemon setup.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A router name was registered again with a different address
    #[error("Router {name} already registered with address {existing}, refusing {requested}")]
    ConflictingRouter {
        name: String,
        existing: IpAddress,
        requested: IpAddress,
    },

    #[error("Unknown VRF: {0}")]
    UnknownVrf(RouteDistinguisher),

    /// The router or registry has been shut down
    #[error("{0} is shut down")]
    ShutDown(String),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for registry operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// A merged table refused an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// Event tagged with a generation that is not the feed's current session
    #[error("stale generation {got} from feed {feed}, current is {current}")]
    StaleGeneration {
        feed: String,
        got: Generation,
        current: Generation,
    },

    /// Event from a feed that never began a session on this table
    #[error("feed {0} has no session on this table")]
    UnknownFeed(String),

    /// EndOfSync for a session that is not synchronizing
    #[error("feed {0} is not synchronizing")]
    NotSynchronizing(String),

    #[error("route {route} does not belong to the {table} table")]
    FamilyMismatch {
        route: String,
        table: AddressFamily,
    },

    #[error("table is closed")]
    Closed,
}

/// Errors that end a feed session.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("stream closed by peer")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed feed message: {0}")]
    Malformed(String),

    #[error("end-of-sync received outside of a synchronizing session")]
    UnexpectedEndOfSync,

    #[error("merge rejected: {0}")]
    Merge(#[from] MergeError),
}

impl FeedError {
    /// Protocol errors come from the feed misbehaving; everything else is a
    /// connection problem.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            FeedError::Malformed(_) | FeedError::UnexpectedEndOfSync | FeedError::Merge(_)
        )
    }
}
