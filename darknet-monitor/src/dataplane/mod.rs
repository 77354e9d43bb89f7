//! Interface to the data plane that classifies packets and keeps the
//! per-index registers the controller polls.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::{
    error::DataPlaneError,
    model::{PortRole, TableInfo},
};

mod memory;
mod pinned;

pub use memory::MemoryDataPlane;
pub use pinned::{DEFAULT_PIN_DIR, PinnedDataPlane};

#[async_trait]
pub trait DataPlane: Send + Sync {
    /// Read whether `index` saw activity since the previous read, clearing
    /// the flag in the same operation.
    async fn read_activity_signal(&self, index: u32) -> Result<bool, DataPlaneError>;

    /// Mirror the controller's classification of `index` into the data plane.
    async fn write_active_marker(&self, index: u32, active: bool) -> Result<(), DataPlaneError>;

    async fn read_dark_count(&self, slot: u32) -> Result<u64, DataPlaneError>;

    async fn reset_dark_count(&self, slot: u32) -> Result<(), DataPlaneError>;

    /// Install the match entry for one monitored prefix. Reports
    /// `AlreadyExists` when an identical entry is present.
    async fn program_prefix_entry(
        &self,
        prefix: Ipv4Net,
        base_index: u32,
        mask: u32,
    ) -> Result<(), DataPlaneError>;

    /// Reports `AlreadyExists` when the port is already assigned.
    async fn program_port_role(&self, port: u32, role: PortRole) -> Result<(), DataPlaneError>;

    /// Mark indices `0..active_slots` active and zero the activity flags and
    /// dark counters.
    async fn reset_registers(&self, active_slots: u32) -> Result<(), DataPlaneError>;

    async fn table_metadata(&self) -> Result<Vec<TableInfo>, DataPlaneError>;
}

/// Result of an idempotent programming call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Programmed {
    Added,
    AlreadyPresent,
}

/// Fold `AlreadyExists` into success; every other failure stays an error.
pub fn tolerate_existing(result: Result<(), DataPlaneError>) -> Result<Programmed, DataPlaneError> {
    match result {
        Ok(()) => Ok(Programmed::Added),
        Err(DataPlaneError::AlreadyExists) => Ok(Programmed::AlreadyPresent),
        Err(err) => Err(err),
    }
}

/// Run one data-plane call, giving up after `limit`.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, DataPlaneError>
where
    F: Future<Output = Result<T, DataPlaneError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(DataPlaneError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerate_existing_distinguishes_duplicates() {
        assert_eq!(tolerate_existing(Ok(())).unwrap(), Programmed::Added);
        assert_eq!(
            tolerate_existing(Err(DataPlaneError::AlreadyExists)).unwrap(),
            Programmed::AlreadyPresent
        );
        assert!(matches!(
            tolerate_existing(Err(DataPlaneError::Unavailable("gone".into()))),
            Err(DataPlaneError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out_stalled_calls() {
        let limit = Duration::from_millis(250);
        let result: Result<(), _> = bounded(limit, std::future::pending()).await;
        assert!(matches!(result, Err(DataPlaneError::Timeout(d)) if d == limit));

        let result = bounded(limit, async { Ok::<_, DataPlaneError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
