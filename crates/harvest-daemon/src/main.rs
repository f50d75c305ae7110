//! harvest-daemon: Headless harvester for a federated repository node.
//!
//! Keeps a set of peer repositories, discovers new ones from their friends
//! lists and replicates their metadata into a local content store.

use anyhow::Result;
use clap::{Parser, Subcommand};
use harvest_core::{NodeOutcome, RunSummary};
use std::path::PathBuf;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use harvest_daemon::Daemon;

#[derive(Parser, Debug)]
#[command(name = "harvest-daemon")]
#[command(about = "Federated metadata harvesting daemon")]
struct Args {
    /// Directory holding config.json, nodes.json and harvested content
    #[arg(short, long, env = "HARVEST_DATA_DIR", default_value = "./harvest-data")]
    data_dir: PathBuf,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover and harvest on a fixed interval until Ctrl+C
    Run,
    /// Harvest every active node once
    Harvest,
    /// Probe known nodes and add the peers they advertise
    Discover,
    /// Register a node by its base URL
    Add {
        url: String,
        /// Harvest this node
        #[arg(long)]
        active: bool,
        /// List this node in our friends description
        #[arg(long)]
        public: bool,
    },
    /// Enable harvesting of a known node
    Activate { url: String },
    /// Disable harvesting of a known node
    Deactivate { url: String },
    /// Show known nodes
    List,
    /// Print our friends description block
    Friends,
}

fn log_summary(result: Result<RunSummary, JoinError>) {
    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            error!("Harvest task failed: {}", e);
            return;
        }
    };

    for (endpoint, outcome) in &summary.outcomes {
        match outcome {
            NodeOutcome::Completed { report } => info!(
                "{}: {} imported, {} still failing",
                endpoint,
                report.imported,
                report.remaining_failures.len()
            ),
            NodeOutcome::Failed { reason } => warn!("{}: {}", endpoint, reason),
        }
    }
    if summary.cancelled {
        info!("Harvest cancelled, {} node(s) skipped", summary.skipped.len());
    }
    info!(
        "Harvest finished: {} node(s), {} failed",
        summary.outcomes.len(),
        summary.failures()
    );
}

async fn run(daemon: Daemon) -> Result<()> {
    let mut ticker = tokio::time::interval(daemon.config().interval());
    info!("Daemon running every {:?}. Press Ctrl+C to stop.", daemon.config().interval());

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }

        if let Err(e) = daemon.discover().await {
            error!("Discovery failed: {:#}", e);
        }

        let handle = daemon.start_harvest().await?;
        let cancel = handle.cancellation_token();
        let join = handle.join();
        tokio::pin!(join);

        tokio::select! {
            result = &mut join => log_summary(result),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, finishing the current node");
                cancel.cancel();
                log_summary(join.await);
                break;
            }
        }
    }

    info!("Shutting down");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,harvest_core=debug,harvest_daemon=debug"
    } else {
        "info,harvest_core=info,harvest_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!("Data directory: {:?}", args.data_dir);
    let daemon = Daemon::open(&args.data_dir).await?;
    let _events = daemon.events().subscribe(|event| match serde_json::to_string(&event) {
        Ok(json) => debug!("event {}", json),
        Err(e) => debug!("event {:?} ({})", event, e),
    });

    match args.command {
        Command::Run => run(daemon).await?,
        Command::Harvest => {
            let handle = daemon.start_harvest().await?;
            log_summary(handle.join().await);
        }
        Command::Discover => {
            let report = daemon.discover().await?;
            for endpoint in &report.added {
                println!("added {}", endpoint);
            }
            for endpoint in &report.unreachable {
                println!("unreachable {}", endpoint);
            }
            if report.truncated {
                println!("stopped after {} rounds", report.rounds);
            }
        }
        Command::Add { url, active, public } => {
            if daemon.add_node(&url, active, public).await? {
                println!("added {}", url);
            } else {
                println!("{} is already known", url);
            }
        }
        Command::Activate { url } => {
            let node = daemon.set_active(&url, true).await?;
            println!("activated {}", node.endpoint);
        }
        Command::Deactivate { url } => {
            let node = daemon.set_active(&url, false).await?;
            println!("deactivated {}", node.endpoint);
        }
        Command::List => {
            for node in daemon.nodes().await? {
                println!(
                    "{:<50} d={} {}{}{} last={} failed={}  {}",
                    node.endpoint.as_str(),
                    node.distance,
                    if node.active { "A" } else { "-" },
                    if node.alive { "L" } else { "-" },
                    if node.public { "P" } else { "-" },
                    node.last_harvested
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                    node.failed_imports.len(),
                    node.name.as_deref().unwrap_or(""),
                );
            }
        }
        Command::Friends => println!("{}", daemon.friends().await?),
    }

    Ok(())
}
