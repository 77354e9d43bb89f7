use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use aya::maps::{
    Array, HashMap as BpfHashMap, Map, MapData, MapError, MapType,
    lpm_trie::{Key, LpmTrie},
};
use ipnet::Ipv4Net;
use tokio::task;
use tracing::debug;

use darknet_monitor_common::{
    MAP_ACTIVE_TABLE, MAP_DARK_TABLE, MAP_FLAG_TABLE, MAP_MONITORED, MAP_PORTS, MonitoredEntry,
};

use super::DataPlane;
use crate::{
    error::DataPlaneError,
    model::{PortRole, TableInfo},
};

pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/darknet_monitor";

// Fail instead of overwriting when the key is present.
const BPF_NOEXIST: u64 = 1;

/// Data plane backed by BPF maps pinned by the packet program's loader.
///
/// Map syscalls run on tokio's blocking pool. A call abandoned by a timeout
/// keeps its blocking thread until the syscall returns.
pub struct PinnedDataPlane {
    pin_dir: PathBuf,
    maps: Arc<PinnedMaps>,
}

struct PinnedMaps {
    flags: Mutex<Array<MapData, u32>>,
    active: Mutex<Array<MapData, u32>>,
    dark: Mutex<Array<MapData, u64>>,
    monitored: Mutex<LpmTrie<MapData, u32, MonitoredEntry>>,
    ports: Mutex<BpfHashMap<MapData, u32, u8>>,
}

impl PinnedDataPlane {
    pub fn open(pin_dir: &Path) -> Result<Self> {
        let flags = Array::<MapData, u32>::try_from(open_pinned(pin_dir, MAP_FLAG_TABLE)?)
            .with_context(|| format!("{MAP_FLAG_TABLE} has unexpected type"))?;
        let active = Array::<MapData, u32>::try_from(open_pinned(pin_dir, MAP_ACTIVE_TABLE)?)
            .with_context(|| format!("{MAP_ACTIVE_TABLE} has unexpected type"))?;
        let dark = Array::<MapData, u64>::try_from(open_pinned(pin_dir, MAP_DARK_TABLE)?)
            .with_context(|| format!("{MAP_DARK_TABLE} has unexpected type"))?;
        let monitored = LpmTrie::<MapData, u32, MonitoredEntry>::try_from(open_pinned(
            pin_dir,
            MAP_MONITORED,
        )?)
        .with_context(|| format!("{MAP_MONITORED} has unexpected type"))?;
        let ports = BpfHashMap::<MapData, u32, u8>::try_from(open_pinned(pin_dir, MAP_PORTS)?)
            .with_context(|| format!("{MAP_PORTS} has unexpected type"))?;

        debug!(pin_dir = %pin_dir.display(), "opened pinned data-plane maps");
        Ok(Self {
            pin_dir: pin_dir.to_path_buf(),
            maps: Arc::new(PinnedMaps {
                flags: Mutex::new(flags),
                active: Mutex::new(active),
                dark: Mutex::new(dark),
                monitored: Mutex::new(monitored),
                ports: Mutex::new(ports),
            }),
        })
    }

    pub fn pin_dir(&self) -> &Path {
        &self.pin_dir
    }

    async fn with_maps<T, F>(&self, op: F) -> Result<T, DataPlaneError>
    where
        T: Send + 'static,
        F: FnOnce(&PinnedMaps) -> Result<T, DataPlaneError> + Send + 'static,
    {
        let maps = self.maps.clone();
        run_blocking(move || op(&maps)).await
    }
}

async fn run_blocking<T, F>(op: F) -> Result<T, DataPlaneError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DataPlaneError> + Send + 'static,
{
    task::spawn_blocking(op)
        .await
        .map_err(|err| DataPlaneError::Unavailable(format!("map operation aborted: {err}")))?
}

fn open_pinned(dir: &Path, name: &str) -> Result<Map> {
    let path = dir.join(name);
    let map_data = MapData::from_pin(&path)
        .map_err(|e| anyhow!("failed to open pinned map {}: {}", path.display(), e))?;
    map_from_map_data(map_data).map_err(|e| anyhow!("invalid map type for {name}: {e}"))
}

// aya 0.13.1 lacks `Map::from_map_data`; dispatch on the kernel map type for
// the map kinds this crate opens.
fn map_from_map_data(map_data: MapData) -> Result<Map, MapError> {
    let map_type = map_data.info()?.map_type()?;
    Ok(match map_type {
        MapType::Array => Map::Array(map_data),
        MapType::Hash => Map::HashMap(map_data),
        MapType::LpmTrie => Map::LpmTrie(map_data),
        _ => Map::Unsupported(map_data),
    })
}

fn guard<T>(map: &Mutex<T>) -> MutexGuard<'_, T> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

fn map_error(err: MapError) -> DataPlaneError {
    match err {
        MapError::SyscallError(err) if err.io_error.kind() == io::ErrorKind::AlreadyExists => {
            DataPlaneError::AlreadyExists
        }
        err => DataPlaneError::Unavailable(err.to_string()),
    }
}

fn check_index(table: &'static str, index: u32, capacity: u32) -> Result<(), DataPlaneError> {
    if index < capacity {
        Ok(())
    } else {
        Err(DataPlaneError::OutOfRange {
            table,
            index,
            capacity,
        })
    }
}

#[async_trait]
impl DataPlane for PinnedDataPlane {
    // Get-then-clear: a packet landing between the two syscalls is folded
    // into this read and re-raised by the next packet to that address.
    async fn read_activity_signal(&self, index: u32) -> Result<bool, DataPlaneError> {
        self.with_maps(move |maps| {
            let mut flags = guard(&maps.flags);
            check_index(MAP_FLAG_TABLE, index, flags.len())?;
            let seen = flags.get(&index, 0).map_err(map_error)? != 0;
            if seen {
                flags.set(index, 0u32, 0).map_err(map_error)?;
            }
            Ok(seen)
        })
        .await
    }

    async fn write_active_marker(&self, index: u32, active: bool) -> Result<(), DataPlaneError> {
        self.with_maps(move |maps| {
            let mut markers = guard(&maps.active);
            check_index(MAP_ACTIVE_TABLE, index, markers.len())?;
            markers.set(index, u32::from(active), 0).map_err(map_error)
        })
        .await
    }

    async fn read_dark_count(&self, slot: u32) -> Result<u64, DataPlaneError> {
        self.with_maps(move |maps| {
            let dark = guard(&maps.dark);
            check_index(MAP_DARK_TABLE, slot, dark.len())?;
            dark.get(&slot, 0).map_err(map_error)
        })
        .await
    }

    async fn reset_dark_count(&self, slot: u32) -> Result<(), DataPlaneError> {
        self.with_maps(move |maps| {
            let mut dark = guard(&maps.dark);
            check_index(MAP_DARK_TABLE, slot, dark.len())?;
            dark.set(slot, 0u64, 0).map_err(map_error)
        })
        .await
    }

    async fn program_prefix_entry(
        &self,
        prefix: Ipv4Net,
        base_index: u32,
        mask: u32,
    ) -> Result<(), DataPlaneError> {
        let key = Key::new(
            u32::from(prefix.prefix_len()),
            u32::from(prefix.network()).to_be(),
        );
        let entry = MonitoredEntry {
            base_idx: base_index,
            mask,
        };
        self.with_maps(move |maps| {
            guard(&maps.monitored)
                .insert(&key, entry, BPF_NOEXIST)
                .map_err(map_error)
        })
        .await
    }

    async fn program_port_role(&self, port: u32, role: PortRole) -> Result<(), DataPlaneError> {
        let code = role.code();
        self.with_maps(move |maps| {
            guard(&maps.ports)
                .insert(port, code, BPF_NOEXIST)
                .map_err(map_error)
        })
        .await
    }

    async fn reset_registers(&self, active_slots: u32) -> Result<(), DataPlaneError> {
        self.with_maps(move |maps| {
            {
                let mut flags = guard(&maps.flags);
                for index in 0..flags.len() {
                    flags.set(index, 0u32, 0).map_err(map_error)?;
                }
            }
            {
                let mut markers = guard(&maps.active);
                for index in 0..markers.len() {
                    let value = u32::from(index < active_slots);
                    markers.set(index, value, 0).map_err(map_error)?;
                }
            }
            let mut dark = guard(&maps.dark);
            for slot in 0..dark.len() {
                dark.set(slot, 0u64, 0).map_err(map_error)?;
            }
            Ok(())
        })
        .await
    }

    async fn table_metadata(&self) -> Result<Vec<TableInfo>, DataPlaneError> {
        self.with_maps(|maps| {
            let monitored_usage = guard(&maps.monitored)
                .keys()
                .filter_map(|key| key.ok())
                .count() as u64;
            let ports_usage = guard(&maps.ports)
                .keys()
                .filter_map(|key| key.ok())
                .count() as u64;

            Ok(vec![
                TableInfo {
                    name: MAP_MONITORED.to_string(),
                    kind: "LPM_TRIE".to_string(),
                    usage: Some(monitored_usage),
                    capacity: None,
                },
                TableInfo {
                    name: MAP_PORTS.to_string(),
                    kind: "HASH".to_string(),
                    usage: Some(ports_usage),
                    capacity: None,
                },
                TableInfo {
                    name: MAP_FLAG_TABLE.to_string(),
                    kind: "ARRAY".to_string(),
                    usage: None,
                    capacity: Some(u64::from(guard(&maps.flags).len())),
                },
                TableInfo {
                    name: MAP_ACTIVE_TABLE.to_string(),
                    kind: "ARRAY".to_string(),
                    usage: None,
                    capacity: Some(u64::from(guard(&maps.active).len())),
                },
                TableInfo {
                    name: MAP_DARK_TABLE.to_string(),
                    kind: "ARRAY".to_string(),
                    usage: None,
                    capacity: Some(u64::from(guard(&maps.dark).len())),
                },
            ])
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_missing_pins_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = PinnedDataPlane::open(dir.path()).err().unwrap();
        assert!(err.to_string().contains(MAP_FLAG_TABLE));
    }

    #[test]
    fn index_bounds_are_checked_before_syscalls() {
        assert!(check_index(MAP_FLAG_TABLE, 3, 4).is_ok());
        assert!(matches!(
            check_index(MAP_DARK_TABLE, 4, 4),
            Err(DataPlaneError::OutOfRange {
                table: MAP_DARK_TABLE,
                index: 4,
                capacity: 4
            })
        ));
    }

    #[tokio::test]
    async fn blocking_calls_report_their_result() {
        assert_eq!(run_blocking(|| Ok(42u64)).await.unwrap(), 42);
        assert!(matches!(
            run_blocking(|| Err::<(), _>(DataPlaneError::AlreadyExists)).await,
            Err(DataPlaneError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn panicking_map_call_is_unavailable() {
        let result: Result<(), _> = run_blocking(|| panic!("map fd closed")).await;
        assert!(matches!(result, Err(DataPlaneError::Unavailable(_))));
    }
}
