//! Coalescing of inactive addresses into the fewest covering prefixes.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// Merge `prefixes` into the minimal, address-ordered set of CIDR blocks that
/// covers exactly the same addresses. Duplicates and nested inputs collapse.
pub fn aggregate<I>(prefixes: I) -> Vec<Ipv4Net>
where
    I: IntoIterator<Item = Ipv4Net>,
{
    let networks: Vec<Ipv4Net> = prefixes.into_iter().map(|p| p.trunc()).collect();
    if networks.is_empty() {
        return Vec::new();
    }
    let mut merged = Ipv4Net::aggregate(&networks);
    merged.sort_unstable();
    merged
}

pub fn aggregate_addresses<I>(addresses: I) -> Vec<Ipv4Net>
where
    I: IntoIterator<Item = Ipv4Addr>,
{
    aggregate(addresses.into_iter().map(Ipv4Net::from))
}
