use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::lookup_host;
use tokio::time::timeout;

use crate::error::{DialError, Result};

/// Address family tried first when a host name resolves to both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpPreference {
    Ipv4,
    #[default]
    Ipv6,
}

impl IpPreference {
    fn accepts(self, ip: &IpAddr) -> bool {
        match self {
            IpPreference::Ipv4 => ip.is_ipv4(),
            IpPreference::Ipv6 => ip.is_ipv6(),
        }
    }
}

/// Resolve `target` to one address, preferring `preference` and falling back
/// to the other family. IP literals are returned as is.
pub async fn resolve_target(target: &str, preference: IpPreference, limit: Duration) -> Result<IpAddr> {
    let host = target.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let failure = |reason: String| DialError::Resolution { target: target.to_string(), reason };
    let addrs = timeout(limit, lookup_host((host, 0)))
        .await
        .map_err(|_| failure(format!("lookup timed out after {limit:?}")))?
        .map_err(|err| failure(err.to_string()))?;

    choose_address(addrs.map(|addr| addr.ip()), preference)
        .ok_or_else(|| failure("no address records".to_string()))
}

pub fn choose_address(addrs: impl IntoIterator<Item = IpAddr>, preference: IpPreference) -> Option<IpAddr> {
    let mut fallback = None;
    for ip in addrs {
        if preference.accepts(&ip) {
            return Some(ip);
        }
        fallback.get_or_insert(ip);
    }
    fallback
}
