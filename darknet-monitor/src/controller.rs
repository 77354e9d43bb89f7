use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{DataPlaneBackend, MonitorConfig},
    dataplane::{DataPlane, MemoryDataPlane, PinnedDataPlane, Programmed, tolerate_existing},
    engine::{DecayEngine, DecaySettings},
    http,
    model::{MonitoredList, PortRole},
    query::QueryService,
    registry::PrefixRegistry,
    store::StateStore,
};

/// Read the monitored list named by `config` and lay out its index space.
pub fn build_registry(config: &MonitorConfig) -> Result<PrefixRegistry> {
    let list = MonitoredList::from_path(&config.monitored)?;
    if list.is_empty() {
        warn!(path = %config.monitored.display(), "monitored list is empty");
    }
    let registry = PrefixRegistry::build(list.entries(), config.global_table_size)
        .with_context(|| format!("invalid monitored list {}", config.monitored.display()))?;
    info!(
        prefixes = registry.blocks().len(),
        indices = registry.len(),
        capacity = config.global_table_size,
        "built prefix registry"
    );
    Ok(registry)
}

/// Build the registry, reset the data-plane registers and program every
/// monitored prefix and port role. Entries that are already present are
/// accepted, so a restart against a live data plane succeeds.
pub async fn bootstrap(config: &MonitorConfig, data_plane: &dyn DataPlane) -> Result<Arc<StateStore>> {
    let registry = build_registry(config)?;

    data_plane
        .reset_registers(registry.len() as u32)
        .await
        .context("failed to reset data-plane registers")?;

    for block in registry.blocks() {
        let outcome = tolerate_existing(
            data_plane
                .program_prefix_entry(block.prefix, block.base_index, block.mask())
                .await,
        )
        .with_context(|| format!("failed to program monitored prefix {}", block.prefix))?;
        if outcome == Programmed::AlreadyPresent {
            debug!(prefix = %block.prefix, "monitored prefix already programmed");
        }
    }

    let roles = config
        .incoming_ports
        .iter()
        .map(|port| (*port, PortRole::Incoming))
        .chain(config.outgoing_ports.iter().map(|port| (*port, PortRole::Outgoing)));
    for (port, role) in roles {
        let outcome = tolerate_existing(data_plane.program_port_role(port, role).await)
            .with_context(|| format!("failed to program {role} port {port}"))?;
        if outcome == Programmed::AlreadyPresent {
            debug!(port, %role, "port role already programmed");
        }
    }

    Ok(Arc::new(StateStore::new(registry, config.alpha)))
}

fn open_data_plane(config: &MonitorConfig) -> Result<Arc<dyn DataPlane>> {
    match config.data_plane {
        DataPlaneBackend::Memory => {
            info!("using in-memory data plane");
            Ok(Arc::new(MemoryDataPlane::new(
                config.global_table_size,
                config.dark_table_size,
            )))
        }
        DataPlaneBackend::Pinned => {
            let plane = PinnedDataPlane::open(&config.pin_dir)?;
            info!(pin_dir = %plane.pin_dir().display(), "using pinned data-plane maps");
            Ok(Arc::new(plane))
        }
    }
}

/// Run until Ctrl-C.
pub async fn run_controller(config: MonitorConfig) -> Result<()> {
    config.validate()?;
    let data_plane = open_data_plane(&config)?;
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("received shutdown signal, draining"),
            Err(err) => error!(error = %err, "failed to wait for ctrl-c"),
        }
        on_signal.cancel();
    });

    serve(&config, data_plane, listener, shutdown).await
}

/// Bootstrap, start the sweep loop and serve queries on `listener` until
/// `shutdown` is cancelled.
pub async fn serve(
    config: &MonitorConfig,
    data_plane: Arc<dyn DataPlane>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let store = bootstrap(config, data_plane.as_ref()).await?;

    let engine = DecayEngine::new(
        store.clone(),
        data_plane.clone(),
        DecaySettings {
            interval: config.interval(),
            dark_table_size: config.dark_table_size,
            dark_count_threshold: config.dark_count_threshold,
            call_timeout: config.call_timeout(),
        },
    );
    let sweeper = tokio::spawn(engine.run(shutdown.clone()));

    let app = http::router(QueryService::new(store, data_plane, config.call_timeout()));
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "serving query api");
    }
    let stop = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .context("query api server failed");

    shutdown.cancel();
    sweeper
        .await
        .map_err(|err| anyhow!("sweep loop panicked: {err}"))?;
    served
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use ipnet::Ipv4Net;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::error::ConfigError;

    fn monitored(lines: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(lines.as_bytes()).unwrap();
        file
    }

    fn config(file: &tempfile::NamedTempFile) -> MonitorConfig {
        MonitorConfig {
            monitored: file.path().to_path_buf(),
            global_table_size: 1024,
            dark_table_size: 8,
            data_plane: DataPlaneBackend::Memory,
            ..MonitorConfig::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_programs_prefixes_and_ports() {
        let file = monitored("10.0.0.0/30\n# spare\n192.0.2.0/31 # lab\n");
        let config = config(&file);
        let plane = MemoryDataPlane::new(1024, 8);

        let store = bootstrap(&config, &plane).await.unwrap();
        assert_eq!(store.index_count(), 6);

        let entries = plane.prefix_entries();
        assert_eq!(entries.len(), 2);
        let (prefix, entry) = entries[1];
        assert_eq!(prefix, "192.0.2.0/31".parse::<Ipv4Net>().unwrap());
        assert_eq!((entry.base_idx, entry.mask), (4, 1));

        assert_eq!(
            plane.port_roles(),
            vec![(1, PortRole::Outgoing), (2, PortRole::Incoming)]
        );
        assert_eq!(plane.active_marker(5), Some(true));
        assert_eq!(plane.active_marker(6), Some(false));
    }

    #[tokio::test]
    async fn bootstrap_tolerates_existing_entries() {
        let file = monitored("10.0.0.0/30\n");
        let config = config(&file);
        let plane = MemoryDataPlane::new(1024, 8);

        bootstrap(&config, &plane).await.unwrap();
        let store = bootstrap(&config, &plane).await.unwrap();
        assert_eq!(store.index_count(), 4);
        assert_eq!(plane.prefix_entries().len(), 1);
    }

    #[tokio::test]
    async fn bootstrap_rejects_oversized_lists() {
        let file = monitored("10.0.0.0/16\n");
        let config = config(&file);
        let plane = MemoryDataPlane::new(1024, 8);

        let err = bootstrap(&config, &plane).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::CapacityExceeded { needed: 65536, capacity: 1024 })
        ));
        assert!(plane.prefix_entries().is_empty());
    }

    #[test]
    fn build_registry_reports_bad_lines() {
        let file = monitored("10.0.0.0/30\n2001:db8::/64\n");
        let err = build_registry(&config(&file)).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    async fn http_get(addr: std::net::SocketAddr, path: &str) -> (String, String) {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        (head.to_string(), body.to_string())
    }

    #[tokio::test]
    async fn serve_answers_and_stops_on_cancel() {
        let file = monitored("10.0.0.0/30\n");
        let config = config(&file);
        let plane: Arc<dyn DataPlane> = Arc::new(MemoryDataPlane::new(1024, 8));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { serve(&config, plane, listener, shutdown).await }
        });

        let (head, body) = http_get(addr, "/").await;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert_eq!(body, http::ALIVE_MESSAGE);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn silent_prefixes_show_up_as_inactive() {
        let file = monitored("10.0.0.0/30\n192.0.2.0/31\n");
        // alpha = 1: the first silent sweep expires every index.
        let config = MonitorConfig {
            alpha: 1,
            ..config(&file)
        };
        let plane = Arc::new(MemoryDataPlane::new(1024, 8));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn({
            let shutdown = shutdown.clone();
            let plane: Arc<dyn DataPlane> = plane.clone();
            async move { serve(&config, plane, listener, shutdown).await }
        });

        let expected = serde_json::json!({ "inactive_prefixes": ["10.0.0.0/30", "192.0.2.0/31"] });
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (head, body) = http_get(addr, "/inactive").await;
                assert!(head.starts_with("HTTP/1.1 200"));
                let body: serde_json::Value = serde_json::from_str(&body).unwrap();
                if body == expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let (_, body) = http_get(addr, "/inactive?prefix=192.0.2.0/24").await;
        assert_eq!(body, r#"{"inactive_prefixes":["192.0.2.0/31"]}"#);
        assert_eq!(plane.active_marker(0), Some(false));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
