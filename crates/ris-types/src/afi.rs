//! Address families carried by a routing instance.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// IANA AFI number for IPv4.
pub const AFI_IPV4: u16 = 1;
/// IANA AFI number for IPv6.
pub const AFI_IPV6: u16 = 2;

/// The address families mirrored for every routing instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFamily {
    Ipv4Unicast,
    Ipv6Unicast,
}

impl AddressFamily {
    /// Every supported family, in table order.
    pub const ALL: [AddressFamily; 2] = [AddressFamily::Ipv4Unicast, AddressFamily::Ipv6Unicast];

    /// Maps an IANA AFI number to a supported family.
    pub fn from_afi(afi: u16) -> Result<Self, ParseError> {
        match afi {
            AFI_IPV4 => Ok(AddressFamily::Ipv4Unicast),
            AFI_IPV6 => Ok(AddressFamily::Ipv6Unicast),
            other => Err(ParseError::UnsupportedAddressFamily(other.to_string())),
        }
    }

    pub const fn afi(&self) -> u16 {
        match self {
            AddressFamily::Ipv4Unicast => AFI_IPV4,
            AddressFamily::Ipv6Unicast => AFI_IPV6,
        }
    }

    /// Short label used in logs and metric labels.
    pub const fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::Ipv4Unicast => "ipv4",
            AddressFamily::Ipv6Unicast => "ipv6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressFamily {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" | "ipv4_unicast" | "4" => Ok(AddressFamily::Ipv4Unicast),
            "ipv6" | "ipv6_unicast" | "6" => Ok(AddressFamily::Ipv6Unicast),
            _ => Err(ParseError::UnsupportedAddressFamily(s.to_string())),
        }
    }
}
