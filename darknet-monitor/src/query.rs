//! Read-only operations behind the HTTP surface.

use std::{net::IpAddr, sync::Arc, time::Duration};

use ipnet::{IpNet, Ipv4Net};

use crate::{
    aggregate::aggregate_addresses,
    dataplane::{DataPlane, bounded},
    error::QueryError,
    model::{TABLE_INFO_HEADERS, TableInfo},
    store::StateStore,
};

/// Table metadata snapshot plus its column headers.
#[derive(Clone, Debug)]
pub struct GeneralInfo {
    pub headers: [&'static str; 4],
    pub rows: Vec<TableInfo>,
}

#[derive(Clone)]
pub struct QueryService {
    store: Arc<StateStore>,
    data_plane: Arc<dyn DataPlane>,
    call_timeout: Duration,
}

impl QueryService {
    pub fn new(
        store: Arc<StateStore>,
        data_plane: Arc<dyn DataPlane>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            data_plane,
            call_timeout,
        }
    }

    /// Inactive addresses, optionally restricted to `covering`, coalesced into
    /// the fewest CIDR blocks. Unmonitored or fully active ranges give an
    /// empty list.
    pub async fn inactive_prefixes(&self, covering: Option<Ipv4Net>) -> Vec<Ipv4Net> {
        let addresses = {
            let state = self.store.lock().await;
            state.inactive_addresses(covering.as_ref())
        };
        aggregate_addresses(addresses)
    }

    pub async fn general_info(&self) -> Result<GeneralInfo, QueryError> {
        let rows = bounded(self.call_timeout, self.data_plane.table_metadata()).await?;
        Ok(GeneralInfo {
            headers: TABLE_INFO_HEADERS,
            rows,
        })
    }
}

/// Parse a covering prefix from a query string. Whitespace is trimmed, the
/// length is required and host bits are dropped.
pub fn parse_covering_prefix(raw: &str) -> Result<Ipv4Net, QueryError> {
    let raw = raw.trim();
    if !raw.contains('/') {
        return match raw.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => Err(QueryError::UnsupportedFamily(raw.to_string())),
            _ => Err(QueryError::InvalidPrefix(raw.to_string())),
        };
    }
    match raw.parse::<IpNet>() {
        Ok(IpNet::V4(net)) => Ok(net.trunc()),
        Ok(IpNet::V6(_)) => Err(QueryError::UnsupportedFamily(raw.to_string())),
        Err(_) => {
            // "2001:db8::/200" should still read as an IPv6 complaint.
            let addr = raw.split('/').next().unwrap_or_default();
            if addr.parse::<std::net::Ipv6Addr>().is_ok() {
                Err(QueryError::UnsupportedFamily(raw.to_string()))
            } else {
                Err(QueryError::InvalidPrefix(raw.to_string()))
            }
        }
    }
}
