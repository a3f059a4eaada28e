//! CIDR denylist backed by binary radix tries.
//!
//! One trie per address family, keyed on network bits. Lookup walks
//! the address most-significant-bit first and reports whether any
//! covering prefix was inserted, so a miss means "allowed".

use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

/// Networks rejected by default. The list is wire-compatible with
/// existing signed-URL deployments and must be preserved exactly.
pub const FILTERED_NETWORKS: [&str; 11] = [
    // ipv4 loopback
    "127.0.0.0/8",
    // ipv4 link local
    "169.254.0.0/16",
    // mboned
    "224.0.0.0/24",
    // ipv4 rfc1918
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    // ipv6 loopback
    "::1/128",
    // ipv6 link local
    "fe80::/10",
    // old ipv6 site local
    "fec0::/10",
    // ipv6 ULA
    "fc00::/7",
    // ipv4 mapped onto ipv6
    "::ffff:0:0/96",
];

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid CIDR in filter list: {0:?}")]
    BadCidr(String),
}

#[derive(Debug, Default)]
struct Node {
    children: [Option<Box<Node>>; 2],
    denied: bool,
}

impl Node {
    fn insert(&mut self, bits: &[u8], prefix_len: u8) {
        let mut node = self;
        for i in 0..usize::from(prefix_len) {
            let bit = usize::from((bits[i / 8] >> (7 - i % 8)) & 1);
            node = node.children[bit].get_or_insert_with(Box::default);
        }
        node.denied = true;
    }

    /// Longest-prefix walk: true iff any node on the path to `bits`
    /// marks the end of an inserted prefix.
    fn covered(&self, bits: &[u8]) -> bool {
        let mut node = self;
        if node.denied {
            return true;
        }
        for i in 0..bits.len() * 8 {
            let bit = usize::from((bits[i / 8] >> (7 - i % 8)) & 1);
            match &node.children[bit] {
                Some(child) => {
                    if child.denied {
                        return true;
                    }
                    node = child;
                }
                None => return false,
            }
        }
        false
    }
}

/// Immutable denylist built once at startup and read-shared by every
/// request.
#[derive(Debug, Default)]
pub struct CidrFilter {
    v4: Node,
    v6: Node,
}

impl CidrFilter {
    /// Builds the filter from CIDR literals. Any malformed literal is
    /// a startup error.
    pub fn new<S: AsRef<str>>(networks: &[S]) -> Result<Self, FilterError> {
        let mut filter = Self::default();
        for entry in networks {
            let net: IpNet = entry
                .as_ref()
                .parse()
                .map_err(|_| FilterError::BadCidr(entry.as_ref().to_string()))?;
            match net {
                IpNet::V4(v4) => filter.v4.insert(&v4.network().octets(), v4.prefix_len()),
                IpNet::V6(v6) => filter.v6.insert(&v6.network().octets(), v6.prefix_len()),
            }
        }
        Ok(filter)
    }

    /// True iff no configured prefix covers `ip`.
    pub fn allowed(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => !self.v4.covered(&v4.octets()),
            IpAddr::V6(v6) => !self.v6.covered(&v6.octets()),
        }
    }
}
