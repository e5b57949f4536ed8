use std::net::IpAddr;

use crate::config::IpVersion;
use crate::error::{Error, Result};

fn matches_version(ip: &IpAddr, version: IpVersion) -> bool {
    ip.is_ipv6() == version.is_ipv6()
}

/// Resolve a literal address or host name to one address of `version`
pub async fn resolve_host(host: &str, version: IpVersion) -> Result<IpAddr> {
    let resolve_error = |reason: String| Error::Resolve {
        host: host.to_string(),
        reason,
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return if matches_version(&ip, version) {
            Ok(ip)
        } else {
            Err(resolve_error(format!("address is not {version:?}")))
        };
    }

    let addrs = tokio::net::lookup_host(format!("{host}:0"))
        .await
        .map_err(|e| resolve_error(e.to_string()))?;

    addrs
        .map(|addr| addr.ip())
        .find(|ip| matches_version(ip, version))
        .ok_or_else(|| resolve_error(format!("no {version:?} address found")))
}
