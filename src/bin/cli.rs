//! CLI for cluster operations

use clap::{Parser, Subcommand};
use minizero::common::retry_with_backoff;
use minizero::coordinator::state::{Member, Tablet};
use minizero::ops::{ClusterReport, CoordinatorClient};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "minizero")]
#[command(about = "minizero cluster membership CLI")]
#[command(version)]
struct Cli {
    /// Coordinator URL
    #[arg(long, default_value = "http://localhost:5080")]
    coordinator: String,

    /// Attempts for retryable failures (not leader, timeouts)
    #[arg(long, default_value = "3")]
    retries: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize groups, tablets and the next rebalancing move
    Status,

    /// Print the membership state as JSON
    State,

    /// List known group ids
    Groups,

    /// Register a node
    Connect {
        /// Node address
        addr: String,

        /// Raft id (0 = assign one)
        #[arg(long, default_value = "0")]
        id: u64,

        /// Preferred group (0 = any)
        #[arg(long, default_value = "0")]
        group: u32,
    },

    /// Ask who serves a predicate, claiming it for `group` if unowned
    ShouldServe {
        predicate: String,

        #[arg(long)]
        group: u32,
    },

    /// Remove a node permanently
    Remove {
        node_id: u64,

        /// Group of the node (0 = coordinators)
        #[arg(long)]
        group: u32,
    },

    /// Follow the membership stream
    Stream {
        /// Stop after this many snapshots
        #[arg(long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = CoordinatorClient::new(&cli.coordinator)?;
    let retries = cli.retries.max(1);
    let delay = Duration::from_millis(200);

    match cli.command {
        Commands::Status => {
            let state = retry_with_backoff(|| client.state(), retries, delay).await?;
            print!("{}", ClusterReport::from_state(&state));
        }

        Commands::State => {
            let state = retry_with_backoff(|| client.state(), retries, delay).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }

        Commands::Groups => {
            let groups = retry_with_backoff(|| client.groups(), retries, delay).await?;
            for gid in groups {
                println!("{}", gid);
            }
        }

        Commands::Connect { addr, id, group } => {
            let member = Member::new(id, group, addr);
            let conn = retry_with_backoff(|| client.connect(&member), retries, delay).await?;
            match conn.member {
                Some(m) => println!("Connected: id {} group {} addr {}", m.id, m.group_id, m.addr),
                None => println!("Connected (cluster info only)"),
            }
        }

        Commands::ShouldServe { predicate, group } => {
            let tablet = Tablet::new(predicate, group);
            let owner =
                retry_with_backoff(|| client.should_serve(&tablet), retries, delay).await?;
            println!(
                "{} is served by group {}{}",
                owner.predicate,
                owner.group_id,
                if owner.group_id == group { " (this group)" } else { "" }
            );
        }

        Commands::Remove { node_id, group } => {
            retry_with_backoff(|| client.remove_node(node_id, group), retries, delay).await?;
            println!("Removed node {} from group {}", node_id, group);
        }

        Commands::Stream { count } => {
            let mut seen = 0usize;
            let res = client
                .stream(|state| {
                    seen += 1;
                    println!(
                        "#{} counter {} groups {:?}",
                        seen,
                        state.counter,
                        state.groups.keys().collect::<Vec<_>>()
                    );
                    count.map_or(true, |n| seen < n)
                })
                .await;
            if let Err(e) = res {
                anyhow::bail!("membership stream ended: {}", e);
            }
        }
    }

    Ok(())
}
