use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Deserialize;

use crate::{dataplane, decay::MAX_ALPHA, error::ConfigError};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DataPlaneBackend {
    /// BPF maps pinned by the packet program's loader.
    #[default]
    Pinned,
    /// Process-local tables; nothing reaches a real data plane.
    Memory,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub interval_mins: u64,
    pub global_table_size: u32,
    pub dark_table_size: u32,
    pub alpha: u32,
    pub dark_count_threshold: u64,
    pub monitored: PathBuf,
    pub incoming_ports: Vec<u32>,
    pub outgoing_ports: Vec<u32>,
    pub listen: SocketAddr,
    pub call_timeout_ms: u64,
    pub data_plane: DataPlaneBackend,
    pub pin_dir: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_mins: 3,
            global_table_size: 4_194_304,
            dark_table_size: 1024,
            alpha: 1,
            dark_count_threshold: 1024,
            monitored: PathBuf::from("../input_files/monitored.txt"),
            incoming_ports: vec![2],
            outgoing_ports: vec![1],
            listen: SocketAddr::from(([0, 0, 0, 0], 2002)),
            call_timeout_ms: 2000,
            data_plane: DataPlaneBackend::default(),
            pin_dir: PathBuf::from(dataplane::DEFAULT_PIN_DIR),
        }
    }
}

impl MonitorConfig {
    /// Read a TOML file, or start from defaults when `path` is `None`.
    /// Missing keys keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_mins == 0 {
            return Err(ConfigError::Invalid("interval_mins must be greater than zero".into()));
        }
        if self.alpha > MAX_ALPHA {
            return Err(ConfigError::Invalid(format!("alpha must be at most {MAX_ALPHA}")));
        }
        if self.global_table_size == 0 {
            return Err(ConfigError::Invalid(
                "global_table_size must be greater than zero".into(),
            ));
        }
        if self.dark_table_size == 0 {
            return Err(ConfigError::Invalid(
                "dark_table_size must be greater than zero".into(),
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "call_timeout_ms must be greater than zero".into(),
            ));
        }
        if let Some(port) = self
            .incoming_ports
            .iter()
            .find(|port| self.outgoing_ports.contains(port))
        {
            return Err(ConfigError::Invalid(format!(
                "port {port} is listed as both incoming and outgoing"
            )));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_mins.saturating_mul(60))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
