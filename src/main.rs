use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use cli::Args;
use hopwatch::{
    Config, PingEngine, PingResult, PingStatus, RouteEngine, RouteUpdate, TargetId, resolve_host,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hopwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    let config = args.config()?;

    let mut targets: Vec<(String, IpAddr)> = Vec::new();
    for host in &args.targets {
        let ip = resolve_host(host, config.ip_version)
            .await
            .with_context(|| format!("Failed to resolve target: {}", host))?;
        if targets.iter().any(|(_, existing)| *existing == ip) {
            eprintln!("Warning: Duplicate target {} ({}), skipping", host, ip);
            continue;
        }
        targets.push((host.clone(), ip));
    }
    if targets.is_empty() {
        anyhow::bail!("No valid targets specified");
    }

    // Ctrl+C stops either mode
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    if args.route {
        run_route_mode(&config, targets, cancel).await
    } else {
        run_ping_mode(&config, targets, args.count, cancel).await
    }
}

/// Per-target counters for the closing summary
#[derive(Default)]
struct Tally {
    sent: u64,
    received: u64,
    rtt_total: Duration,
}

impl Tally {
    fn record(&mut self, result: &PingResult) {
        self.sent += 1;
        if let (PingStatus::EchoReply, Some(rtt)) = (result.status, result.rtt) {
            self.received += 1;
            self.rtt_total += rtt;
        }
    }

    fn loss_pct(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        (self.sent - self.received) as f64 * 100.0 / self.sent as f64
    }

    fn avg_ms(&self) -> Option<f64> {
        if self.received == 0 {
            return None;
        }
        Some(self.rtt_total.as_secs_f64() * 1000.0 / self.received as f64)
    }
}

async fn run_ping_mode(
    config: &Config,
    targets: Vec<(String, IpAddr)>,
    count: u64,
    cancel: CancellationToken,
) -> Result<()> {
    let (engine, mut results) = PingEngine::from_config(config)?;

    let mut names: HashMap<TargetId, String> = HashMap::new();
    let mut tallies: HashMap<TargetId, Tally> = HashMap::new();
    for (host, ip) in &targets {
        let id = engine.add_target(*ip, None);
        names.insert(id, format!("{} ({})", host, ip));
        tallies.insert(id, Tally::default());
    }

    engine.start().await.context("Failed to start probing")?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = results.recv() => {
                let Some(result) = result else { break };
                let name = names.get(&result.target).map(String::as_str).unwrap_or("?");
                println!("{}", format_result(name, &result));

                if let Some(tally) = tallies.get_mut(&result.target) {
                    tally.record(&result);
                }
                if count > 0 && tallies.values().all(|t| t.sent >= count) {
                    break;
                }
            }
        }
    }

    engine.stop().await;

    println!("---");
    for (id, tally) in &tallies {
        let name = names.get(id).map(String::as_str).unwrap_or("?");
        match tally.avg_ms() {
            Some(avg) => println!(
                "{}: {} sent, {} received, {:.1}% loss, avg {:.2}ms",
                name,
                tally.sent,
                tally.received,
                tally.loss_pct(),
                avg
            ),
            None => println!(
                "{}: {} sent, {} received, {:.1}% loss",
                name,
                tally.sent,
                tally.received,
                tally.loss_pct()
            ),
        }
    }
    Ok(())
}

fn format_result(name: &str, result: &PingResult) -> String {
    let rtt = result
        .rtt
        .map(|rtt| format!("{:.2}ms", rtt.as_secs_f64() * 1000.0))
        .unwrap_or_default();
    let responder = result
        .responder
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "*".to_string());
    match result.status {
        PingStatus::EchoReply => format!(
            "{}  seq={}  ttl={}  {}",
            name, result.sequence, result.ttl, rtt
        ),
        PingStatus::TtlExceeded => format!(
            "{}  seq={}  ttl exceeded from {}  {}",
            name, result.sequence, responder, rtt
        ),
        PingStatus::Unreachable(code) => format!(
            "{}  seq={}  unreachable (code {}) from {}",
            name, result.sequence, code, responder
        ),
        PingStatus::Timeout => format!("{}  seq={}  timeout", name, result.sequence),
    }
}

async fn run_route_mode(
    config: &Config,
    targets: Vec<(String, IpAddr)>,
    cancel: CancellationToken,
) -> Result<()> {
    let (routes, mut updates) = RouteEngine::<PingEngine>::from_config(config)?;
    routes.start().await.context("Failed to start probing")?;

    let mut names = HashMap::new();
    for (host, ip) in &targets {
        let id = routes.start_discovery(*ip);
        names.insert(id, format!("{} ({})", host, ip));
    }

    let mut remaining = names.len();
    while remaining > 0 {
        tokio::select! {
            _ = cancel.cancelled() => break,
            update = updates.recv() => {
                let Some(update) = update else { break };
                let name = names.get(&update.request).map(String::as_str).unwrap_or("?");
                print_route_update(name, &update, names.len() > 1);
                if update.is_final() {
                    remaining -= 1;
                }
            }
        }
    }

    routes.close().await;
    Ok(())
}

fn print_route_update(name: &str, update: &RouteUpdate, tagged: bool) {
    let prefix = if tagged { format!("[{}] ", name) } else { String::new() };
    if let Some(hop) = update.hops.last() {
        let responder = hop
            .responder
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "*".to_string());
        match hop.avg_rtt() {
            Some(avg) => println!(
                "{}TTL {:2}  {:39}  {:>8.2}ms",
                prefix,
                hop.ttl,
                responder,
                avg.as_secs_f64() * 1000.0
            ),
            None => println!("{}TTL {:2}  {}", prefix, hop.ttl, responder),
        }
    }
    if update.is_final() {
        match update.total_hops {
            Some(total) => println!("{}{}: reached in {} hops", prefix, name, total),
            None => println!(
                "{}{}: {:?} after {} hops",
                prefix,
                name,
                update.state,
                update.hops.len()
            ),
        }
    }
}
