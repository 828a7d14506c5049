//! Rebalancer Simulator
//!
//! Runs a group of rebalancing clients over an in-memory store, drives
//! membership, fault and resource changes, and checks ownership after every
//! step.

use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod member;
mod scenario;
mod controller;
mod metrics;

use controller::SimulationController;
use rebalancer_client::ClientConfig;
use scenario::Scenario;

/// Rebalancer Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Rebalancer simulation environment")]
struct Args {
    /// Number of members to start
    #[arg(short, long, default_value = "3")]
    clients: usize,

    /// Number of resources in the group
    #[arg(short, long, default_value = "6")]
    resources: usize,

    /// Scenario to run (join-leave, leader-failover, session-expiry, resource-churn)
    #[arg(short, long)]
    scenario: Option<String>,

    /// Minimum interval between rebalancing rounds in milliseconds
    #[arg(long, default_value = "500")]
    interval_ms: u64,

    /// Session timeout in milliseconds
    #[arg(long, default_value = "2000")]
    session_timeout_ms: u64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Run duration in seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    if args.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Rebalancer Simulator");
    info!("Clients: {}, resources: {}", args.clients, args.resources);

    let config = ClientConfig {
        min_rebalance_interval: Duration::from_millis(args.interval_ms),
        session_timeout: Duration::from_millis(args.session_timeout_ms),
        ..ClientConfig::from_env()
    };
    config.validate().map_err(anyhow::Error::msg)?;

    let controller = SimulationController::new(args.clients, args.resources, config, args.seed);
    controller.initialize().await?;

    let outcome = if let Some(scenario_name) = &args.scenario {
        let scenario = Scenario::load(scenario_name)?;
        controller.run_scenario(scenario).await
    } else {
        let duration = if args.duration > 0 {
            Some(Duration::from_secs(args.duration))
        } else {
            None
        };
        controller.run(duration).await
    };

    controller.shutdown().await?;

    // Print metrics
    let metrics = controller.get_metrics().await;
    info!("Simulation complete");
    info!("Steps: {}", metrics.steps);
    info!("Ownership checks: {}", metrics.checks);
    info!("Exclusivity violations: {}", metrics.exclusivity_violations);
    info!("Coverage rate: {:.2}", metrics.coverage_rate());
    info!(
        "Callbacks: {} assigned, {} unassigned, {} aborted",
        metrics.events.assignments, metrics.events.unassignments, metrics.events.aborts
    );
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    outcome
}
