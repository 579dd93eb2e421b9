//! Heartbeat Example - one side of a beacon/monitor pair over TCP.
//!
//! # Usage
//!
//! Monitor (terminal 1):
//! ```bash
//! cargo run --example heartbeat -- monitor --addr 127.0.0.1:4500 --timeout-ms 300 --threshold 2
//! ```
//!
//! Beacon (terminal 2):
//! ```bash
//! cargo run --example heartbeat -- beacon --addr 127.0.0.1:4500 --interval-ms 100
//! ```
//!
//! # What You'll See
//!
//! - The monitor resetting its miss counter on every marker
//! - Stopping the beacon (Ctrl-C) makes the monitor count misses and close
//! - `--lifetime-ms` makes the beacon stop on its own
//!
//! Set `RUST_LOG=moonpool_heartbeat=debug` to follow every beat.

use clap::{Parser, Subcommand};
use moonpool_heartbeat::{
    Beacon, BeaconConfig, CloseReason, HeartbeatError, Monitor, MonitorConfig, NetworkProvider,
    TokioNetworkProvider,
};
use std::process;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "heartbeat")]
#[command(about = "Heartbeat beacon and liveness monitor over TCP", long_about = None)]
struct Args {
    #[command(subcommand)]
    side: Side,
}

#[derive(Subcommand, Debug)]
enum Side {
    /// Dial ADDR and send a marker every interval
    Beacon {
        /// Address of the monitor
        #[arg(long)]
        addr: String,

        /// Instance name used in logs
        #[arg(long, default_value = "beacon")]
        name: String,

        /// Milliseconds between markers
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Stop after this many milliseconds
        #[arg(long)]
        lifetime_ms: Option<u64>,
    },
    /// Listen on ADDR, accept one beacon and watch it
    Monitor {
        /// Address to listen on
        #[arg(long)]
        addr: String,

        /// Instance name used in logs
        #[arg(long, default_value = "monitor")]
        name: String,

        /// Milliseconds to wait for a marker before counting a miss
        #[arg(long, default_value = "3000")]
        timeout_ms: u64,

        /// Consecutive misses tolerated
        #[arg(long, default_value = "3")]
        threshold: u32,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,moonpool_heartbeat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(args.side).await {
        Ok(reason) => {
            println!("closed: {}", reason);
            if reason.is_failure() {
                process::exit(2);
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "heartbeat setup failed");
            process::exit(1);
        }
    }
}

async fn run(side: Side) -> Result<CloseReason, HeartbeatError> {
    let network = TokioNetworkProvider::new();

    match side {
        Side::Beacon {
            addr,
            name,
            interval_ms,
            lifetime_ms,
        } => {
            let config = BeaconConfig::new(
                Duration::from_millis(interval_ms),
                lifetime_ms.map(Duration::from_millis),
            );
            let beacon = Beacon::connect(&network, name, &addr, config).await?;
            beacon.run()?;

            tokio::select! {
                reason = beacon.closed() => Ok(reason),
                _ = tokio::signal::ctrl_c() => {
                    beacon.close();
                    Ok(beacon.closed().await)
                }
            }
        }
        Side::Monitor {
            addr,
            name,
            timeout_ms,
            threshold,
        } => {
            let listener = network
                .bind(&addr)
                .await
                .map_err(|e| HeartbeatError::connection(&name, e))?;
            tracing::info!(addr = %addr, "waiting for a beacon");

            let config = MonitorConfig::new(Duration::from_millis(timeout_ms), threshold);
            let monitor = Monitor::accept(&listener, name, config).await?;
            monitor.run()?;

            tokio::select! {
                reason = monitor.closed() => Ok(reason),
                _ = tokio::signal::ctrl_c() => {
                    monitor.close();
                    Ok(monitor.closed().await)
                }
            }
        }
    }
}
