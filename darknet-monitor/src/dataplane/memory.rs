use std::{
    collections::{BTreeMap, HashSet},
    net::Ipv4Addr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use ipnet::Ipv4Net;

use darknet_monitor_common::{
    MAP_ACTIVE_TABLE, MAP_DARK_TABLE, MAP_FLAG_TABLE, MAP_MONITORED, MAP_PORTS, MonitoredEntry,
};

use super::DataPlane;
use crate::{
    error::DataPlaneError,
    model::{PortRole, TableInfo},
};

/// Data plane held entirely in process memory.
///
/// Besides the [`DataPlane`] operations it exposes the packet-side hooks
/// (`observe`, `raise_activity`, `add_dark_packets`) and fault injection,
/// so sweeps can be driven without a switch or a kernel. The binary never
/// calls these hooks: with `data_plane = "memory"` no flag is ever raised and
/// every index expires after `alpha` sweeps. They are for tests and for
/// embedders that feed traffic in themselves.
pub struct MemoryDataPlane {
    tables: Mutex<Tables>,
}

struct Tables {
    flags: Vec<bool>,
    active: Vec<bool>,
    dark: Vec<u64>,
    monitored: BTreeMap<Ipv4Net, MonitoredEntry>,
    ports: BTreeMap<u32, PortRole>,
    failing: HashSet<u32>,
    stalled: HashSet<u32>,
}

impl MemoryDataPlane {
    pub fn new(global_table_size: u32, dark_table_size: u32) -> Self {
        Self {
            tables: Mutex::new(Tables {
                flags: vec![false; global_table_size as usize],
                active: vec![false; global_table_size as usize],
                dark: vec![0; dark_table_size as usize],
                monitored: BTreeMap::new(),
                ports: BTreeMap::new(),
                failing: HashSet::new(),
                stalled: HashSet::new(),
            }),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emulate the packet program seeing traffic for `addr`: the longest
    /// monitored match gets its activity flag raised, and traffic towards an
    /// address currently marked inactive is also counted as dark.
    pub fn observe(&self, addr: Ipv4Addr) {
        let mut tables = self.tables();
        let raw = u32::from(addr);
        let Some(entry) = tables
            .monitored
            .iter()
            .filter(|(net, _)| net.contains(&addr))
            .max_by_key(|(net, _)| net.prefix_len())
            .map(|(_, entry)| *entry)
        else {
            return;
        };
        let index = entry.index_of(raw) as usize;
        if index >= tables.flags.len() {
            return;
        }
        tables.flags[index] = true;
        if !tables.active[index] && !tables.dark.is_empty() {
            let slot = index % tables.dark.len();
            tables.dark[slot] = tables.dark[slot].saturating_add(1);
        }
    }

    pub fn raise_activity(&self, index: u32) {
        if let Some(flag) = self.tables().flags.get_mut(index as usize) {
            *flag = true;
        }
    }

    pub fn add_dark_packets(&self, slot: u32, packets: u64) {
        if let Some(count) = self.tables().dark.get_mut(slot as usize) {
            *count = count.saturating_add(packets);
        }
    }

    pub fn active_marker(&self, index: u32) -> Option<bool> {
        self.tables().active.get(index as usize).copied()
    }

    pub fn activity_flag(&self, index: u32) -> Option<bool> {
        self.tables().flags.get(index as usize).copied()
    }

    pub fn dark_count(&self, slot: u32) -> Option<u64> {
        self.tables().dark.get(slot as usize).copied()
    }

    pub fn prefix_entries(&self) -> Vec<(Ipv4Net, MonitoredEntry)> {
        self.tables()
            .monitored
            .iter()
            .map(|(net, entry)| (*net, *entry))
            .collect()
    }

    pub fn port_roles(&self) -> Vec<(u32, PortRole)> {
        self.tables()
            .ports
            .iter()
            .map(|(port, role)| (*port, *role))
            .collect()
    }

    /// Make every signal read for `index` fail until cleared.
    pub fn fail_index(&self, index: u32) {
        self.tables().failing.insert(index);
    }

    /// Make every signal read for `index` hang forever.
    pub fn stall_index(&self, index: u32) {
        self.tables().stalled.insert(index);
    }

    pub fn clear_faults(&self) {
        let mut tables = self.tables();
        tables.failing.clear();
        tables.stalled.clear();
    }
}

fn out_of_range(table: &'static str, index: u32, capacity: usize) -> DataPlaneError {
    DataPlaneError::OutOfRange {
        table,
        index,
        capacity: capacity as u32,
    }
}

#[async_trait]
impl DataPlane for MemoryDataPlane {
    async fn read_activity_signal(&self, index: u32) -> Result<bool, DataPlaneError> {
        let stalled = {
            let mut tables = self.tables();
            if tables.failing.contains(&index) {
                return Err(DataPlaneError::Unavailable(format!(
                    "injected failure reading flag {index}"
                )));
            }
            if tables.stalled.contains(&index) {
                true
            } else {
                let capacity = tables.flags.len();
                let flag = tables
                    .flags
                    .get_mut(index as usize)
                    .ok_or_else(|| out_of_range(MAP_FLAG_TABLE, index, capacity))?;
                return Ok(std::mem::take(flag));
            }
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(false)
    }

    async fn write_active_marker(&self, index: u32, active: bool) -> Result<(), DataPlaneError> {
        let mut tables = self.tables();
        let capacity = tables.active.len();
        let marker = tables
            .active
            .get_mut(index as usize)
            .ok_or_else(|| out_of_range(MAP_ACTIVE_TABLE, index, capacity))?;
        *marker = active;
        Ok(())
    }

    async fn read_dark_count(&self, slot: u32) -> Result<u64, DataPlaneError> {
        let tables = self.tables();
        tables
            .dark
            .get(slot as usize)
            .copied()
            .ok_or_else(|| out_of_range(MAP_DARK_TABLE, slot, tables.dark.len()))
    }

    async fn reset_dark_count(&self, slot: u32) -> Result<(), DataPlaneError> {
        let mut tables = self.tables();
        let capacity = tables.dark.len();
        let count = tables
            .dark
            .get_mut(slot as usize)
            .ok_or_else(|| out_of_range(MAP_DARK_TABLE, slot, capacity))?;
        *count = 0;
        Ok(())
    }

    async fn program_prefix_entry(
        &self,
        prefix: Ipv4Net,
        base_index: u32,
        mask: u32,
    ) -> Result<(), DataPlaneError> {
        let mut tables = self.tables();
        if tables.monitored.contains_key(&prefix) {
            return Err(DataPlaneError::AlreadyExists);
        }
        tables.monitored.insert(
            prefix,
            MonitoredEntry {
                base_idx: base_index,
                mask,
            },
        );
        Ok(())
    }

    async fn program_port_role(&self, port: u32, role: PortRole) -> Result<(), DataPlaneError> {
        let mut tables = self.tables();
        if tables.ports.contains_key(&port) {
            return Err(DataPlaneError::AlreadyExists);
        }
        tables.ports.insert(port, role);
        Ok(())
    }

    async fn reset_registers(&self, active_slots: u32) -> Result<(), DataPlaneError> {
        let mut tables = self.tables();
        let active_slots = (active_slots as usize).min(tables.active.len());
        tables.flags.fill(false);
        tables.active.fill(false);
        tables.active[..active_slots].fill(true);
        tables.dark.fill(0);
        Ok(())
    }

    async fn table_metadata(&self) -> Result<Vec<TableInfo>, DataPlaneError> {
        let tables = self.tables();
        let set_count = |values: &[bool]| values.iter().filter(|v| **v).count() as u64;
        Ok(vec![
            TableInfo {
                name: MAP_MONITORED.to_string(),
                kind: "LPM_TRIE".to_string(),
                usage: Some(tables.monitored.len() as u64),
                capacity: None,
            },
            TableInfo {
                name: MAP_PORTS.to_string(),
                kind: "HASH".to_string(),
                usage: Some(tables.ports.len() as u64),
                capacity: None,
            },
            TableInfo {
                name: MAP_FLAG_TABLE.to_string(),
                kind: "ARRAY".to_string(),
                usage: Some(set_count(&tables.flags)),
                capacity: Some(tables.flags.len() as u64),
            },
            TableInfo {
                name: MAP_ACTIVE_TABLE.to_string(),
                kind: "ARRAY".to_string(),
                usage: Some(set_count(&tables.active)),
                capacity: Some(tables.active.len() as u64),
            },
            TableInfo {
                name: MAP_DARK_TABLE.to_string(),
                kind: "ARRAY".to_string(),
                usage: Some(tables.dark.iter().filter(|c| **c > 0).count() as u64),
                capacity: Some(tables.dark.len() as u64),
            },
        ])
    }
}
