//! Route keys and the attributes feeds report for them.

use crate::{AddressFamily, IpAddress, IpPrefix};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one route in a merged table.
///
/// `path_id` is the BGP add-path identifier; feeds that do not use add-path
/// report 0, so the prefix alone identifies the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey {
    pub prefix: IpPrefix,
    #[serde(default)]
    pub path_id: u32,
}

impl RouteKey {
    pub const fn new(prefix: IpPrefix) -> Self {
        Self { prefix, path_id: 0 }
    }

    pub const fn with_path_id(prefix: IpPrefix, path_id: u32) -> Self {
        Self { prefix, path_id }
    }

    pub const fn family(&self) -> AddressFamily {
        self.prefix.family()
    }
}

impl From<IpPrefix> for RouteKey {
    fn from(prefix: IpPrefix) -> Self {
        Self::new(prefix)
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path_id == 0 {
            self.prefix.fmt(f)
        } else {
            write!(f, "{} path-id {}", self.prefix, self.path_id)
        }
    }
}

/// BGP ORIGIN attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    Igp,
    Egp,
    Incomplete,
}

/// Forwarding attributes of a route as reported by a feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteAttributes {
    pub next_hop: IpAddress,
    #[serde(default)]
    pub as_path: Vec<u32>,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_pref: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub med: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub communities: Vec<u32>,
}

impl RouteAttributes {
    /// Attributes carrying only a next hop.
    pub fn with_next_hop(next_hop: IpAddress) -> Self {
        Self {
            next_hop,
            as_path: Vec::new(),
            origin: Origin::default(),
            local_pref: None,
            med: None,
            communities: Vec::new(),
        }
    }
}
