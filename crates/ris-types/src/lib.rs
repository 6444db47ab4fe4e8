//! Common route-collection types for the RIS mirror.
//!
//! This crate provides type-safe representations of the primitives that
//! flow between upstream RIB feeds and the merge engine:
//!
//! - [`IpAddress`]: IPv4 and IPv6 addresses
//! - [`IpPrefix`]: IP network prefixes (CIDR notation)
//! - [`AddressFamily`]: the address families a routing instance carries
//! - [`RouteDistinguisher`]: numeric VRF identifiers and their labels
//! - [`RouteKey`] / [`RouteAttributes`]: one route and what the router says about it

mod afi;
mod ip;
mod rd;
mod route;

pub use afi::AddressFamily;
pub use ip::{IpAddress, IpPrefix};
pub use rd::RouteDistinguisher;
pub use route::{Origin, RouteAttributes, RouteKey};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid route distinguisher: {0}")]
    InvalidRouteDistinguisher(String),

    #[error("unsupported address family: {0}")]
    UnsupportedAddressFamily(String),
}
