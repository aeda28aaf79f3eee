//! settled - TipMarket settlement daemon
//! Mission: settle every finished ticket, pay every winner, refund every loser

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use tipmarket_engine::{EngineConfig, SettlementEngine};

#[derive(Parser, Debug)]
#[command(name = "settled")]
#[command(about = "TipMarket settlement daemon - resolve legs, settle tickets, move escrow")]
struct Args {
    /// Path to the SQLite database
    #[arg(long, env = "DATABASE_PATH", default_value = "./tipmarket.db")]
    db: String,

    /// Seconds between settlement passes
    #[arg(long, env = "SETTLE_INTERVAL_SECS", default_value = "300")]
    interval_secs: u64,

    /// Run a single settlement pass and exit
    #[arg(long)]
    once: bool,

    /// Platform commission on winning payouts, percent (0-50)
    #[arg(long, env = "COMMISSION_RATE_PCT", default_value = "10")]
    commission_rate: f64,

    /// Hours after kickoff before a scored match with a stale status counts as finished
    #[arg(long, env = "GRACE_WINDOW_HOURS", default_value = "2")]
    grace_window_hours: i64,

    /// Prometheus exporter listen address (optional)
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("settled=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!("Starting settlement daemon");
    info!("  Database: {}", args.db);
    info!("  Interval: {}s", args.interval_secs);
    info!("  Commission: {}%", args.commission_rate);
    info!("  Grace window: {}h", args.grace_window_hours);

    if let Some(addr) = &args.metrics_addr {
        let addr: SocketAddr = addr.parse()?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!("  Metrics: http://{}/metrics", addr);
    }

    let config = EngineConfig {
        commission_rate_pct: args.commission_rate,
        grace_window_hours: args.grace_window_hours,
    };
    let engine = SettlementEngine::new(&args.db, config)?;

    if args.once {
        let report = engine.run_settlement()?;
        info!(
            legs_updated = report.legs_updated,
            tickets_settled = report.tickets_settled,
            "Single pass done"
        );
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    loop {
        ticker.tick().await;
        match engine.run_settlement() {
            Ok(report) => {
                if report.legs_updated > 0 || report.tickets_settled > 0 {
                    info!(
                        legs_updated = report.legs_updated,
                        tickets_settled = report.tickets_settled,
                        "Settlement pass"
                    );
                }
            }
            Err(e) => error!(error = %e, "Settlement pass failed"),
        }
    }
}
