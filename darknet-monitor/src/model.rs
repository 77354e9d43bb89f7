use std::{
    fmt,
    fs::File,
    io::{BufRead, BufReader},
    net::IpAddr,
    path::Path,
};

use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4Net};
use serde_json::{Number as JsonNumber, Value};

use darknet_monitor_common::{PORT_ROLE_INCOMING, PORT_ROLE_OUTGOING};

use crate::error::ConfigError;

pub const TABLE_INFO_HEADERS: [&str; 4] = ["Full Table Name", "Type", "Usage", "Capacity"];

/// Ordered list of monitored prefixes as read from the monitored-prefix file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MonitoredList {
    entries: Vec<Ipv4Net>,
}

impl MonitoredList {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open monitored list at {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid monitored list {}", path.display()))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut entries = Vec::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("failed to read line {}", line_no + 1))?;
            let trimmed = line.split('#').next().unwrap_or("").trim();
            if trimmed.is_empty() {
                continue;
            }
            entries.push(parse_entry(trimmed, line_no + 1)?);
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[Ipv4Net] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_entry(entry: &str, line: usize) -> Result<Ipv4Net, ConfigError> {
    match entry.parse::<IpNet>() {
        Ok(IpNet::V4(net)) => Ok(net.trunc()),
        Ok(IpNet::V6(_)) => Err(ConfigError::Ipv6Entry {
            line,
            entry: entry.to_string(),
        }),
        Err(_) => match entry.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => Err(ConfigError::Ipv6Entry {
                line,
                entry: entry.to_string(),
            }),
            _ => Err(ConfigError::MalformedEntry {
                line,
                entry: entry.to_string(),
            }),
        },
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PortRole {
    Incoming,
    Outgoing,
}

impl PortRole {
    pub fn code(self) -> u8 {
        match self {
            PortRole::Incoming => PORT_ROLE_INCOMING,
            PortRole::Outgoing => PORT_ROLE_OUTGOING,
        }
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRole::Incoming => f.write_str("incoming"),
            PortRole::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// One row of data-plane table metadata.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableInfo {
    pub name: String,
    pub kind: String,
    pub usage: Option<u64>,
    pub capacity: Option<u64>,
}

impl TableInfo {
    /// `[name, type, usage, capacity]`, with unknown figures rendered as `"n/a"`.
    pub fn to_row(&self) -> Value {
        Value::Array(vec![
            Value::String(self.name.clone()),
            Value::String(self.kind.clone()),
            metric_value(self.usage),
            metric_value(self.capacity),
        ])
    }
}

fn metric_value(n: Option<u64>) -> Value {
    match n {
        Some(n) => Value::Number(JsonNumber::from(n)),
        None => Value::String("n/a".to_string()),
    }
}
