#![no_std]

// Map layout shared between the controller and the packet program.
// Keep this crate `no_std` friendly so the data-plane side can use it too.

/// Per-index "activity seen since last poll" flags (array of u32).
pub const MAP_FLAG_TABLE: &str = "flag_table";
/// Per-index active marker mirrored from the controller (array of u32).
pub const MAP_ACTIVE_TABLE: &str = "global_table";
/// Packet counts for dark traffic, hashed into slots (array of u64).
pub const MAP_DARK_TABLE: &str = "dark_table";
/// Monitored prefixes (LPM trie keyed by IPv4 prefix, value `MonitoredEntry`).
pub const MAP_MONITORED: &str = "monitored";
/// Ingress port roles (hash of u32 port -> u8 role).
pub const MAP_PORTS: &str = "ports";

pub const PORT_ROLE_INCOMING: u8 = 1;
pub const PORT_ROLE_OUTGOING: u8 = 2;

/// Value stored for each monitored prefix. The packet program computes the
/// dense index of a destination as `base_idx + (addr & mask)`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct MonitoredEntry {
    pub base_idx: u32,
    pub mask: u32,
}

impl MonitoredEntry {
    pub const fn index_of(&self, addr: u32) -> u32 {
        self.base_idx + (addr & self.mask)
    }
}

// The `user` feature exposes `aya::Pod` so the controller can use these types
// with aya's typed map APIs. The packet program never enables it.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::MonitoredEntry;
    use aya::Pod;

    unsafe impl Pod for MonitoredEntry {}
}
