//! Route distinguishers identifying routing instances (VRFs).

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A numeric route distinguisher.
///
/// Displayed in its human-readable `<high 32 bits>:<low 32 bits>` form, which
/// is also the label used for the VRF in logs and metrics. Parses from either
/// that form or a plain integer. The global table is `0:0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RouteDistinguisher(u64);

impl RouteDistinguisher {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn from_parts(asn: u32, id: u32) -> Self {
        Self(((asn as u64) << 32) | id as u64)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn asn(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn id(&self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// Human-readable label, e.g. `65000:100`.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.asn(), self.id())
    }
}

impl FromStr for RouteDistinguisher {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidRouteDistinguisher(s.to_string());

        match s.split_once(':') {
            Some((asn, id)) => {
                let asn: u32 = asn.trim().parse().map_err(|_| invalid())?;
                let id: u32 = id.trim().parse().map_err(|_| invalid())?;
                Ok(Self::from_parts(asn, id))
            }
            None => s.trim().parse::<u64>().map(Self).map_err(|_| invalid()),
        }
    }
}

impl TryFrom<String> for RouteDistinguisher {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RouteDistinguisher> for String {
    fn from(rd: RouteDistinguisher) -> Self {
        rd.to_string()
    }
}

impl From<u64> for RouteDistinguisher {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
