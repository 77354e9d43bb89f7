use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    decay::{CreditTable, Signal, Transition},
    registry::PrefixRegistry,
};

/// Everything the sweep writes and queries read, guarded as one unit.
#[derive(Debug)]
pub struct MonitorState {
    registry: PrefixRegistry,
    credits: CreditTable,
    completed_sweeps: u64,
}

impl MonitorState {
    pub fn registry(&self) -> &PrefixRegistry {
        &self.registry
    }

    pub fn credits(&self) -> &CreditTable {
        &self.credits
    }

    pub fn completed_sweeps(&self) -> u64 {
        self.completed_sweeps
    }

    pub fn apply(&mut self, index: u32, signal: Signal) -> Transition {
        self.credits.apply(index as usize, signal)
    }

    pub fn finish_sweep(&mut self) -> u64 {
        self.completed_sweeps += 1;
        self.completed_sweeps
    }

    /// Inactive /32 addresses, optionally restricted to those inside `covering`.
    pub fn inactive_addresses(&self, covering: Option<&Ipv4Net>) -> Vec<Ipv4Addr> {
        match covering {
            None => self
                .registry
                .addresses()
                .iter()
                .enumerate()
                .filter(|(index, _)| self.credits.is_inactive(*index))
                .map(|(_, addr)| *addr)
                .collect(),
            Some(prefix) => self
                .registry
                .lookup_covered(prefix)
                .into_iter()
                .filter(|(_, index)| self.credits.is_inactive(*index as usize))
                .map(|(addr, _)| addr)
                .collect(),
        }
    }
}

/// Shared handle to the monitor state. A single coarse lock serialises the
/// sweep and every query; contention is resolved by waiting.
#[derive(Debug)]
pub struct StateStore {
    index_count: usize,
    state: Mutex<MonitorState>,
}

impl StateStore {
    pub fn new(registry: PrefixRegistry, alpha: u32) -> Self {
        let index_count = registry.len();
        Self {
            index_count,
            state: Mutex::new(MonitorState {
                credits: CreditTable::new(index_count, alpha),
                registry,
                completed_sweeps: 0,
            }),
        }
    }

    /// Number of monitored indices. Fixed for the store's lifetime.
    pub fn index_count(&self) -> usize {
        self.index_count
    }

    pub async fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(prefixes: &[&str], alpha: u32) -> StateStore {
        let prefixes: Vec<Ipv4Net> = prefixes.iter().map(|p| p.parse().unwrap()).collect();
        StateStore::new(PrefixRegistry::build(&prefixes, 1024).unwrap(), alpha)
    }

    #[tokio::test]
    async fn starts_with_nothing_inactive() {
        let store = store(&["10.0.0.0/28"], 2);
        assert_eq!(store.index_count(), 16);
        let state = store.lock().await;
        assert!(state.inactive_addresses(None).is_empty());
        assert_eq!(state.completed_sweeps(), 0);
    }

    #[tokio::test]
    async fn inactive_addresses_respect_covering_prefix() {
        let store = store(&["10.0.0.0/30", "192.0.2.0/30"], 0);
        let mut state = store.lock().await;
        for index in [1, 2, 5] {
            assert_eq!(state.apply(index, Signal::Silent), Transition::BecameInactive);
        }

        assert_eq!(
            state.inactive_addresses(None),
            vec![
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(192, 0, 2, 1),
            ]
        );
        let covering: Ipv4Net = "192.0.2.0/24".parse().unwrap();
        assert_eq!(
            state.inactive_addresses(Some(&covering)),
            vec![Ipv4Addr::new(192, 0, 2, 1)]
        );
        let unmonitored: Ipv4Net = "198.51.100.0/24".parse().unwrap();
        assert!(state.inactive_addresses(Some(&unmonitored)).is_empty());
    }
}
