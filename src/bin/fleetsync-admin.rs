use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use url::Url;

use fleetsync::api::{paths, DeviceRequest, DeviceResponse, ResyncResponse, RetireResponse};
use fleetsync::engine::NodeStatus;
use fleetsync::events::Event;
use fleetsync::model::UsageTotal;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "fleetsync-admin")]
#[command(about = "fleetsync fleet administration tool")]
struct Cli {
    /// Base URL of the fleetsync API
    #[arg(long, env("FLEETSYNC_ADMIN_URL"), default_value = "http://127.0.0.1:8420")]
    server: Url,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show health and sync status of every node
    Status,
    /// Push the full configuration to a node now
    Resync {
        #[arg(long)]
        node: u32,
    },
    /// Retire a node; its subscribers are released for reassignment
    Retire {
        #[arg(long)]
        node: u32,
    },
    /// Show the most recent events
    Events {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show a subscriber's accumulated usage
    Usage {
        #[arg(long)]
        subscriber: String,
    },
    /// Start a new quota period for a subscriber
    ResetUsage {
        #[arg(long)]
        subscriber: String,
    },
    /// Record a device seen for a subscriber
    RegisterDevice {
        #[arg(long)]
        subscriber: String,
        #[arg(long)]
        device: String,
    },
    /// Forget a device of a subscriber
    UnregisterDevice {
        #[arg(long)]
        subscriber: String,
        #[arg(long)]
        device: String,
    },
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let server = cli.server;

    match cli.command {
        Commands::Status => show_status(&client, &server).await?,
        Commands::Resync { node } => {
            let url = join(&server, &paths::resync_path(node))?;
            let response: ResyncResponse = expect_json(client.post(url).send().await?).await?;
            println!("Full resync of node {} queued", response.node_id);
        }
        Commands::Retire { node } => {
            let url = join(&server, &paths::retire_path(node))?;
            let response: RetireResponse = expect_json(client.post(url).send().await?).await?;
            match response.previous_state {
                Some(state) => println!("Node {} retired (was {})", response.node_id, state),
                None => println!("Node {} was already retired", response.node_id),
            }
        }
        Commands::Events { limit } => {
            let mut url = join(&server, paths::fleet::EVENTS)?;
            url.query_pairs_mut().append_pair("limit", &limit.to_string());
            let events: Vec<Event> = expect_json(client.get(url).send().await?).await?;
            for event in events.iter().rev() {
                println!(
                    "{} {:<26} {:<16} {:?} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.category,
                    event.subject,
                    event.outcome,
                    event.detail
                );
            }
        }
        Commands::Usage { subscriber } => {
            let url = join(&server, &paths::usage_path(&subscriber))?;
            let usage: UsageTotal = expect_json(client.get(url).send().await?).await?;
            print_usage(&usage);
        }
        Commands::ResetUsage { subscriber } => {
            let url = join(&server, &paths::usage_reset_path(&subscriber))?;
            let usage: UsageTotal = expect_json(client.post(url).send().await?).await?;
            println!("Usage of {} reset", usage.subscriber);
            print_usage(&usage);
        }
        Commands::RegisterDevice { subscriber, device } => {
            let url = join(&server, &paths::devices_path(&subscriber))?;
            let body = DeviceRequest { device_id: device };
            let response: DeviceResponse =
                expect_json(client.post(url).json(&body).send().await?).await?;
            print_usage(&response.usage);
            if let Some(limit) = response.enforced {
                println!("Subscriber disabled: {} limit reached", limit);
            }
        }
        Commands::UnregisterDevice { subscriber, device } => {
            let url = join(&server, &paths::device_path(&subscriber, &device))?;
            let usage: UsageTotal = expect_json(client.delete(url).send().await?).await?;
            print_usage(&usage);
        }
    }

    Ok(())
}

async fn show_status(client: &Client, server: &Url) -> CliResult<()> {
    let url = join(server, paths::fleet::NODES)?;
    let nodes: Vec<NodeStatus> = expect_json(client.get(url).send().await?).await?;
    println!(
        "{:>6}  {:<20} {:<12} {:>8} {:>9} {:>9}  LAST SYNC",
        "ID", "NAME", "STATE", "FAILURES", "REVISION", "INBOUNDS"
    );
    for node in nodes {
        let revision = node
            .observed_revision
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        let last_sync = node
            .last_sync_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:>6}  {:<20} {:<12} {:>8} {:>9} {:>5}/{:<3}  {}",
            node.id,
            node.name,
            node.state,
            node.consecutive_failures,
            revision,
            node.inbounds,
            node.capacity,
            last_sync
        );
    }
    Ok(())
}

fn print_usage(usage: &UsageTotal) {
    println!(
        "{}: {} bytes, {} devices{}",
        usage.subscriber,
        usage.bytes,
        usage.device_count(),
        usage
            .enforced
            .map(|limit| format!(", enforced ({})", limit))
            .unwrap_or_default()
    );
}

fn join(server: &Url, path: &str) -> CliResult<Url> {
    Ok(server.join(paths::drop_leading_slash(path))?)
}

async fn expect_json<T: DeserializeOwned>(response: Response) -> CliResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("HTTP {}: {}", status, body).into());
    }
    Ok(response.json::<T>().await?)
}
