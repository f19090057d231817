//! VRRP daemon binary.
//!
//! Runs a single virtual router instance on an interface and keeps it
//! alive until SIGINT/SIGTERM. Requires CAP_NET_RAW and CAP_NET_ADMIN
//! (or root) for the raw socket and interface address changes.

use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use vrrp::{VRRPConfig, VirtualRouter};

/// How often the current state is sampled and printed
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "vrrpd", about = "VRRP v2 failover daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a VRRP instance
    Run {
        /// Network interface to use
        #[arg(short, long)]
        interface: String,

        /// Virtual Router ID (1-255)
        #[arg(short = 'r', long)]
        vrid: u8,

        /// Virtual IP addresses (comma-separated)
        #[arg(short, long)]
        vips: String,

        /// Router priority (255 = address owner)
        #[arg(short, long, default_value_t = 100)]
        priority: u8,

        /// Advertisement interval in seconds
        #[arg(long = "advert-int", default_value_t = 1)]
        advert_int: u8,

        /// Enable preemption
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        preempt: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    common::logging::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            interface,
            vrid,
            vips,
            priority,
            advert_int,
            preempt,
        } => run(interface, vrid, &vips, priority, advert_int, preempt).await,
        Commands::Version => {
            println!("vrrpd version {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}

async fn run(
    interface: String,
    vrid: u8,
    vips: &str,
    priority: u8,
    advert_int: u8,
    preempt: bool,
) -> ExitCode {
    let virtual_ips = match parse_vips(vips) {
        Ok(ips) => ips,
        Err(bad) => {
            error!("invalid virtual IP address: {}", bad);
            return ExitCode::FAILURE;
        }
    };

    let config = VRRPConfig {
        vrid,
        priority,
        advert_interval: advert_int,
        interface,
        virtual_ips,
        preempt,
        ..Default::default()
    };

    let mut router = match VirtualRouter::new(config) {
        Ok(router) => router,
        Err(e) => {
            error!("failed to create virtual router: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = router.start().await {
        error!("failed to start virtual router: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        vrid = router.vrid(),
        priority = router.priority(),
        "vrrpd running, press Ctrl+C to stop"
    );

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await; // skip the immediate first tick

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = status.tick() => {
                println!("VRID {}: Current state: {}", router.vrid(), router.state());
            }
            signal = &mut shutdown => {
                info!(signal, "shutting down");
                break;
            }
        }
    }

    if let Err(e) = router.stop().await {
        error!("error stopping virtual router: {}", e);
        return ExitCode::FAILURE;
    }

    info!("vrrpd stopped");
    ExitCode::SUCCESS
}

/// Parse a comma-separated IPv4 list, returning the offending entry on
/// failure.
fn parse_vips(vips: &str) -> Result<Vec<Ipv4Addr>, String> {
    vips.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Ipv4Addr>().map_err(|_| s.to_string()))
        .collect()
}

/// Wait for SIGINT or SIGTERM, returning which one arrived.
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            // Fall back to Ctrl+C alone.
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vips() {
        assert_eq!(
            parse_vips("10.0.0.100").unwrap(),
            vec!["10.0.0.100".parse::<Ipv4Addr>().unwrap()]
        );

        assert_eq!(
            parse_vips("10.0.0.100, 10.0.0.101").unwrap(),
            vec![
                "10.0.0.100".parse::<Ipv4Addr>().unwrap(),
                "10.0.0.101".parse::<Ipv4Addr>().unwrap(),
            ]
        );

        // IPv6 and garbage both name the offending entry.
        assert_eq!(parse_vips("10.0.0.1,::1"), Err("::1".to_string()));
        assert_eq!(parse_vips("not-an-ip"), Err("not-an-ip".to_string()));
    }
}
