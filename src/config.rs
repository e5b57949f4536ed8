use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Shortest accepted probe interval
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);
/// Longest accepted probe interval (one hour)
pub const MAX_INTERVAL: Duration = Duration::from_secs(3600);
/// Shortest accepted reply timeout
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1);
/// Longest accepted reply timeout
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60);
/// Largest payload that fits an unfragmented IPv4 ICMP echo on a 1500 byte link
pub const MAX_PAYLOAD_SIZE: usize = 1472;
/// Upper bound on probes sent for a single hop
pub const MAX_PROBES_PER_HOP: u8 = 10;
/// Default cap on consecutive silent hops before a route discovery gives up
pub const DEFAULT_MAX_UNRESPONSIVE_HOPS: u8 = 8;

/// IP version used for targets and sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

impl IpVersion {
    pub fn is_ipv6(self) -> bool {
        matches!(self, Self::V6)
    }
}

/// Probe backend variant, chosen once when the engine is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// ICMP sockets owned by this process
    #[default]
    Raw,
    /// One external `ping` invocation per probe
    Process,
}

/// Engine configuration.
///
/// This is the record an outer settings layer persists; the core only
/// validates and applies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Time between scheduler ticks
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Reply timeout for scheduled pings
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub ip_version: IpVersion,
    pub backend: BackendKind,
    /// Per-hop wait window during route discovery
    #[serde(with = "duration_ms")]
    pub hop_timeout: Duration,
    /// Maximum TTL probed during route discovery
    pub max_hops: u8,
    /// Probes sent for each hop during route discovery
    pub probes_per_hop: u8,
    /// Consecutive unresponsive hops tolerated before a discovery fails
    pub max_unresponsive_hops: u8,
    /// ICMP echo payload size in bytes
    pub payload_size: usize,
    /// Program run by the external-process backend
    pub ping_command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(3),
            ip_version: IpVersion::V4,
            backend: BackendKind::Raw,
            hop_timeout: Duration::from_secs(1),
            max_hops: 30,
            probes_per_hop: 1,
            max_unresponsive_hops: DEFAULT_MAX_UNRESPONSIVE_HOPS,
            payload_size: 56,
            ping_command: "ping".to_string(),
        }
    }
}

impl Config {
    /// Check every field against its accepted range
    pub fn validate(&self) -> Result<()> {
        check_interval(self.interval)?;
        check_timeout("timeout", self.timeout)?;
        check_timeout("hop_timeout", self.hop_timeout)?;
        if self.max_hops == 0 {
            return Err(Error::ConfigInvalid("max_hops must be at least 1".into()));
        }
        if self.probes_per_hop == 0 || self.probes_per_hop > MAX_PROBES_PER_HOP {
            return Err(Error::ConfigInvalid(format!(
                "probes_per_hop must be between 1 and {MAX_PROBES_PER_HOP}"
            )));
        }
        if self.max_unresponsive_hops == 0 {
            return Err(Error::ConfigInvalid(
                "max_unresponsive_hops must be at least 1".into(),
            ));
        }
        if !(crate::probe::MIN_PAYLOAD_SIZE..=MAX_PAYLOAD_SIZE).contains(&self.payload_size) {
            return Err(Error::ConfigInvalid(format!(
                "payload_size must be between {} and {MAX_PAYLOAD_SIZE}",
                crate::probe::MIN_PAYLOAD_SIZE
            )));
        }
        if self.ping_command.trim().is_empty() {
            return Err(Error::ConfigInvalid("ping_command is empty".into()));
        }
        Ok(())
    }

    /// Serialize to the JSON settings record
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a JSON settings record. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

pub(crate) fn check_interval(interval: Duration) -> Result<()> {
    if interval < MIN_INTERVAL || interval > MAX_INTERVAL {
        return Err(Error::ConfigInvalid(format!(
            "interval {}ms outside {}..={}ms",
            interval.as_millis(),
            MIN_INTERVAL.as_millis(),
            MAX_INTERVAL.as_millis()
        )));
    }
    Ok(())
}

pub(crate) fn check_timeout(name: &str, timeout: Duration) -> Result<()> {
    if timeout < MIN_TIMEOUT || timeout > MAX_TIMEOUT {
        return Err(Error::ConfigInvalid(format!(
            "{name} {}ms outside {}..={}ms",
            timeout.as_millis(),
            MIN_TIMEOUT.as_millis(),
            MAX_TIMEOUT.as_millis()
        )));
    }
    Ok(())
}

/// Serde helper for Duration as whole milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
