//! Honeypot agent binary

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use honeypot_agent::client::ServerClient;
use honeypot_agent::config::Config;
use honeypot_agent::control::ControlLoop;
use honeypot_agent::handlers::{HandlerContext, ServiceRegistry};
use honeypot_agent::identity::AgentIdentity;
use honeypot_agent::monitor::FileMonitor;
use honeypot_agent::report::Reporter;
use honeypot_agent::tasks::TaskExecutor;

#[derive(Parser)]
#[command(
    name = "honeypot-agent",
    about = "Multi-protocol honeypot agent",
    disable_help_flag = true,
    disable_help_subcommand = true,
    disable_version_flag = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the decoys and the control loop
    Run,
    /// Remove files the agent leaves behind
    Uninstall,
    /// Print the version
    Version,
    /// Print this help
    Help,
}

/// `--run` and `run` mean the same thing
fn normalized_args() -> Vec<String> {
    std::env::args()
        .enumerate()
        .map(|(i, arg)| match arg.strip_prefix("--") {
            Some(rest) if i == 1 => rest.to_string(),
            _ => arg,
        })
        .collect()
}

fn print_help() {
    let _ = Cli::command().print_help();
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let command = Cli::try_parse_from(normalized_args())
        .ok()
        .and_then(|cli| cli.command);

    match command {
        Some(Command::Run) => run().await,
        Some(Command::Uninstall) => uninstall(),
        Some(Command::Version) => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Command::Help) | None => {
            print_help();
            Ok(())
        }
    }
}

fn init_logging(level: &str) {
    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn run() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt().with_max_level(LevelFilter::ERROR).init();
            return Err(e);
        }
    };
    init_logging(&config.logging.level);
    info!("Starting honeypot agent {}...", config.server.agent_name);

    let identity = AgentIdentity::detect(&config.server.agent_name);
    if identity.agent_ip.is_empty() {
        warn!("No primary IPv4 address found for 127.0.0.1, reporting without one");
    }
    info!(
        "Agent {} on {} ({}, {})",
        identity.agent_name, identity.agent_ip, identity.hostname, identity.node_type
    );

    let client = ServerClient::new(
        config.server_url(),
        Duration::from_secs(config.server.report_timeout_secs),
    )?;
    info!("Reporting to {}", client.base_url());
    let reporter = Reporter::new(client, identity);

    let ctx = Arc::new(HandlerContext::from_config(&config, reporter.clone()));
    let registry = Arc::new(ServiceRegistry::from_config(&config, ctx));
    let started = registry.start_enabled().await;
    info!("{} decoy services started", started);

    let monitor = Arc::new(FileMonitor::new(reporter.clone()));
    if let Err(e) = monitor.start().await {
        warn!("File monitor not started on 127.0.0.1, retrying each control tick: {}", e);
    }

    let tasks = TaskExecutor::new(&config.server.agent_name, registry.clone()).with_monitor(monitor.clone());
    let control = ControlLoop::new(
        &config.server.agent_name,
        Arc::new(reporter),
        registry.clone(),
        tasks,
        Duration::from_secs(config.control.interval_secs),
    )
    .with_monitor(monitor.clone());
    let control_task = tokio::spawn(async move { control.run().await });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    control_task.abort();
    monitor.stop().await;
    registry.stop_all().await;
    info!("All decoys stopped");
    Ok(())
}

fn uninstall() -> Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::load().unwrap_or_default();
    let socket = config
        .services
        .get("bash")
        .map(|s| s.addr)
        .unwrap_or_default();

    if !socket.is_empty() && Path::new(&socket).exists() {
        std::fs::remove_file(&socket)?;
        println!("Removed {}", socket);
    }
    println!("Uninstall complete");
    Ok(())
}
