//! Error types for the darknet monitor.

use std::time::Duration;

use ipnet::Ipv4Net;
use thiserror::Error;

/// Startup configuration problems. Fatal: the controller never starts serving.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("line {line}: '{entry}' is not an IPv4 CIDR prefix")]
    MalformedEntry { line: usize, entry: String },

    #[error("line {line}: IPv6 prefix '{entry}' cannot be monitored")]
    Ipv6Entry { line: usize, entry: String },

    #[error("monitored prefix {prefix} overlaps {existing}")]
    Overlap { prefix: Ipv4Net, existing: Ipv4Net },

    #[error("monitored prefixes need {needed} indices but the table holds {capacity}")]
    CapacityExceeded { needed: u64, capacity: u32 },

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Failures reported by the data-plane collaborator.
#[derive(Debug, Error)]
pub enum DataPlaneError {
    #[error("entry already exists")]
    AlreadyExists,

    #[error("index {index} is outside {table} (capacity {capacity})")]
    OutOfRange {
        table: &'static str,
        index: u32,
        capacity: u32,
    },

    #[error("data plane unavailable: {0}")]
    Unavailable(String),

    #[error("data plane call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors surfaced to query callers.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("'{0}' is not a valid IPv4 prefix")]
    InvalidPrefix(String),

    #[error("'{0}' is an IPv6 prefix; only IPv4 is monitored")]
    UnsupportedFamily(String),

    #[error(transparent)]
    DataPlane(#[from] DataPlaneError),
}
