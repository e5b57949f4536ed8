use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;

use hopwatch::{BackendKind, Config, IpVersion};

/// ICMP latency probing and hop-by-hop route discovery
#[derive(Parser, Debug, Clone)]
#[command(name = "hopwatch")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target hosts (IP address or hostname)
    #[arg(required = true)]
    pub targets: Vec<String>,

    /// Discover the route to each target instead of pinging it
    #[arg(long = "route")]
    pub route: bool,

    /// Replies to wait for per target before exiting (0 = until Ctrl+C)
    #[arg(short = 'c', long = "count", default_value = "0")]
    pub count: u64,

    /// Probe interval in milliseconds
    #[arg(short = 'i', long = "interval")]
    pub interval: Option<u64>,

    /// Reply timeout in milliseconds
    #[arg(short = 'w', long = "timeout")]
    pub timeout: Option<u64>,

    /// Per-hop timeout in milliseconds (route mode)
    #[arg(long = "hop-timeout")]
    pub hop_timeout: Option<u64>,

    /// Maximum hops (route mode)
    #[arg(short = 'm', long = "max-hops")]
    pub max_hops: Option<u8>,

    /// Probes per hop (route mode)
    #[arg(short = 'q', long = "probes")]
    pub probes: Option<u8>,

    /// Probe backend (raw, process)
    #[arg(long = "backend")]
    pub backend: Option<String>,

    /// Ping utility used by the process backend
    #[arg(long = "ping-command")]
    pub ping_command: Option<String>,

    /// Use IPv6
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,

    /// JSON settings record to start from (flags override it)
    #[arg(long = "config")]
    pub config: Option<String>,
}

impl Args {
    /// Validate arguments that clap cannot check on its own
    pub fn validate(&self) -> Result<(), String> {
        if let Some(ref backend) = self.backend {
            parse_backend(backend)?;
        }
        if self.route && self.count > 0 {
            return Err("-c only applies to ping mode".into());
        }
        if let Some(ref command) = self.ping_command
            && command.trim().is_empty()
        {
            return Err("Ping command cannot be empty".into());
        }
        Ok(())
    }

    /// Settings record from the optional file with flags applied on top
    pub fn config(&self) -> Result<Config> {
        let mut config = match self.config {
            Some(ref path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings file: {path}"))?;
                Config::from_json(&json)
                    .with_context(|| format!("Failed to parse settings file: {path}"))?
            }
            None => Config::default(),
        };

        if let Some(ms) = self.interval {
            config.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.timeout {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.hop_timeout {
            config.hop_timeout = Duration::from_millis(ms);
        }
        if let Some(max_hops) = self.max_hops {
            config.max_hops = max_hops;
        }
        if let Some(probes) = self.probes {
            config.probes_per_hop = probes;
        }
        if let Some(ref backend) = self.backend {
            config.backend = parse_backend(backend).map_err(anyhow::Error::msg)?;
        }
        if let Some(ref command) = self.ping_command {
            config.ping_command = command.clone();
        }
        if self.ipv6 {
            config.ip_version = IpVersion::V6;
        }

        config.validate().context("Invalid settings")?;
        Ok(config)
    }
}

fn parse_backend(name: &str) -> Result<BackendKind, String> {
    match name.to_lowercase().as_str() {
        "raw" => Ok(BackendKind::Raw),
        "process" => Ok(BackendKind::Process),
        _ => Err(format!("Unknown backend: {name}. Use raw or process")),
    }
}
