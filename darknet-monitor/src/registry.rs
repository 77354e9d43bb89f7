//! Mapping between monitored /32 addresses and dense table indices.
//!
//! Monitored prefixes are laid out back to back in declaration order: the
//! first prefix owns indices `0..len`, the next starts where it stopped, and
//! so on. The packet program uses the same layout (`base_idx + host bits`).

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use prefix_trie::PrefixMap;

use crate::error::ConfigError;

/// A monitored prefix together with the index range it was assigned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PrefixBlock {
    pub prefix: Ipv4Net,
    pub base_index: u32,
    pub len: u32,
}

impl PrefixBlock {
    /// Host mask the packet program applies before adding `base_index`.
    pub fn mask(&self) -> u32 {
        u32::from(self.prefix.hostmask())
    }
}

#[derive(Debug)]
pub struct PrefixRegistry {
    blocks: Vec<PrefixBlock>,
    index_by_addr: PrefixMap<Ipv4Net, u32>,
    addresses: Vec<Ipv4Addr>,
}

impl PrefixRegistry {
    pub fn build(prefixes: &[Ipv4Net], capacity: u32) -> Result<Self, ConfigError> {
        let needed: u64 = prefixes.iter().map(address_count).sum();
        if needed > u64::from(capacity) {
            return Err(ConfigError::CapacityExceeded { needed, capacity });
        }
        check_disjoint(prefixes)?;

        let mut index_by_addr = PrefixMap::new();
        let mut addresses = Vec::with_capacity(needed as usize);
        let mut blocks = Vec::with_capacity(prefixes.len());
        let mut base_idx: u32 = 0;

        for prefix in prefixes {
            let prefix = prefix.trunc();
            // Fits: the sum of all counts was checked against a u32 capacity.
            let len = address_count(&prefix) as u32;
            let network = u32::from(prefix.network());
            for offset in 0..len {
                let addr = Ipv4Addr::from(network + offset);
                index_by_addr.insert(Ipv4Net::from(addr), base_idx + offset);
                addresses.push(addr);
            }
            blocks.push(PrefixBlock {
                prefix,
                base_index: base_idx,
                len,
            });
            base_idx += len;
        }

        Ok(Self {
            blocks,
            index_by_addr,
            addresses,
        })
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn blocks(&self) -> &[PrefixBlock] {
        &self.blocks
    }

    /// Index -> address table, ordered by index.
    pub fn addresses(&self) -> &[Ipv4Addr] {
        &self.addresses
    }

    pub fn address(&self, index: u32) -> Option<Ipv4Addr> {
        self.addresses.get(index as usize).copied()
    }

    pub fn index_of(&self, addr: Ipv4Addr) -> Option<u32> {
        self.index_by_addr.get(&Ipv4Net::from(addr)).copied()
    }

    /// Every monitored /32 contained in `query`, narrower or wider than the
    /// monitored prefixes alike. Unmonitored space yields nothing.
    pub fn lookup_covered(&self, query: &Ipv4Net) -> Vec<(Ipv4Addr, u32)> {
        self.index_by_addr
            .children(&query.trunc())
            .map(|(net, index)| (net.addr(), *index))
            .collect()
    }
}

fn address_count(prefix: &Ipv4Net) -> u64 {
    1u64 << (32 - u32::from(prefix.prefix_len()))
}

// Two CIDR blocks overlap only if one contains the other, so after sorting by
// network address it is enough to compare against the widest block seen so far.
fn check_disjoint(prefixes: &[Ipv4Net]) -> Result<(), ConfigError> {
    let mut sorted: Vec<Ipv4Net> = prefixes.iter().map(Ipv4Net::trunc).collect();
    sorted.sort_by_key(|p| (p.network(), p.prefix_len()));

    let mut widest: Option<Ipv4Net> = None;
    for prefix in sorted {
        if let Some(existing) = widest {
            if prefix.network() <= existing.broadcast() {
                return Err(ConfigError::Overlap { prefix, existing });
            }
        }
        if widest.is_none_or(|w| prefix.broadcast() > w.broadcast()) {
            widest = Some(prefix);
        }
    }
    Ok(())
}
