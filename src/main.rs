//! WolfHA - Clustered Route Leadership Coordinator
//!
//! Command line front-end: simulate a cluster, generate or validate a
//! node configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfha::config::WolfHaConfig;
use wolfha::consensus::MemoryConsensusConfig;
use wolfha::harness::{ClusterHarness, HarnessConfig};

/// WolfHA - Clustered Route Leadership Coordinator
#[derive(Parser)]
#[command(name = "wolfha")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfha.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the
    /// configuration file's `[logging] level`
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated cluster contending for one route
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// Namespace the nodes join
        #[arg(long, default_value = "ns")]
        namespace: String,

        /// Route the nodes contend for
        #[arg(long, default_value = "r")]
        route: String,

        /// Maximum random start delay per node in milliseconds
        #[arg(long, default_value_t = 500)]
        start_jitter_ms: u64,

        /// Maximum random time a leader keeps the route after its task ran
        #[arg(long, default_value_t = 1000)]
        linger_ms: u64,

        /// Session timeout in milliseconds
        #[arg(long, default_value_t = 3000)]
        session_timeout_ms: u64,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfha.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&resolve_log_level(cli.log_level.as_deref(), &cli.config));

    match cli.command {
        Commands::Simulate {
            nodes,
            namespace,
            route,
            start_jitter_ms,
            linger_ms,
            session_timeout_ms,
            timeout_secs,
            json,
        } => {
            let config = HarnessConfig {
                nodes,
                namespace,
                route,
                start_jitter: Duration::from_millis(start_jitter_ms),
                linger: Duration::from_millis(linger_ms),
                run_timeout: Duration::from_secs(timeout_secs),
                consensus: MemoryConsensusConfig {
                    session_timeout: Duration::from_millis(session_timeout_ms),
                    ..Default::default()
                },
                ..Default::default()
            };
            run_simulate(config, json).await
        }
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Pick the log level: command line first, then the configuration file
fn resolve_log_level(cli_level: Option<&str>, config_path: &Path) -> String {
    if let Some(level) = cli_level {
        return level.to_string();
    }
    WolfHaConfig::from_file(config_path)
        .map(|config| config.logging.level)
        .unwrap_or_else(|_| "info".to_string())
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run the cluster harness and print its report
async fn run_simulate(config: HarnessConfig, json: bool) -> anyhow::Result<()> {
    let report = ClusterHarness::new(config)
        .run()
        .await
        .context("simulation failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("WolfHA Simulation");
        println!("=================");
        println!();
        println!("Namespace:        {}", report.namespace);
        println!("Route:            {}", report.route);
        println!("Nodes:            {}", report.nodes.join(", "));
        println!("Max Concurrent:   {}", report.max_concurrent);
        println!("Commit Index:     {}", report.commit_index);
        println!("Elapsed:          {} ms", report.elapsed_ms);
        println!();
        println!("Completed:");
        for record in &report.completed {
            println!("  {}  {}", record.completed_at.format("%H:%M:%S%.3f"), record.node_id);
        }
    }

    let missing = report.missing();
    if !missing.is_empty() {
        anyhow::bail!("nodes did not complete: {}", missing.join(", "));
    }
    Ok(())
}

/// Write a sample configuration file
fn run_init(output: PathBuf, node_id: String) -> anyhow::Result<()> {
    let config_content = format!(r#"# WolfHA Configuration
# Generated configuration file

[node]
id = "{node_id}"
namespace = "default"
routes = ["timer"]

[cluster]
peers = []
# peers = ["node-2.example.com:5679", "node-3.example.com:5679"]
session_timeout_ms = 3000
lock_timeout_ms = 1000
join_timeout_ms = 2000
connect_attempts = 5
backoff_base_ms = 100
backoff_max_ms = 2000

[election]
contention_jitter_ms = 50
step_down_holdoff_ms = 200
event_buffer = 16

[lifecycle]
drain_grace_ms = 5000

[logging]
level = "info"
"#);

    std::fs::write(&output, config_content)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set the namespace, routes and cluster peers.");
    println!("Then check it with: wolfha --config {} validate", output.display());

    Ok(())
}

/// Validate a configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfHaConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID:          {}", config.node.id);
            println!("  Namespace:        {}", config.node.namespace);
            println!("  Routes:           {}", config.node.routes.join(", "));
            println!("  Peers:            {}", config.cluster.peers.len());
            println!("  Session Timeout:  {:?}", config.session_timeout());
            println!("  Lock Timeout:     {:?}", config.lock_timeout());
            println!("  Drain Grace:      {:?}", config.drain_grace());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
