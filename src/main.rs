use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use durable_entities::chirper::{self, ChirperClient};
use durable_entities::{Runtime, RuntimeOperationalPolicy};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chirper")]
#[command(about = "Chirper timelines on the durable entities runtime")]
struct Cli {
    /// Directory holding the journal and snapshot.
    #[arg(long, default_value = "./chirper-data")]
    data_dir: PathBuf,
    /// JSON file with a runtime operational policy.
    #[arg(long)]
    policy: Option<PathBuf>,
    /// How long to wait for queued work before exiting.
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Post a chirp.
    Post {
        #[arg(long)]
        user: String,
        #[arg(long)]
        content: String,
        /// RFC 3339 timestamp; defaults to now.
        #[arg(long)]
        at: Option<String>,
    },
    /// Delete every chirp of a user posted at a timestamp.
    Delete {
        #[arg(long)]
        user: String,
        #[arg(long)]
        at: String,
    },
    Follow {
        #[arg(long)]
        user: String,
        #[arg(long)]
        target: String,
    },
    Unfollow {
        #[arg(long)]
        user: String,
        #[arg(long)]
        target: String,
    },
    Chirps {
        #[arg(long)]
        user: String,
    },
    Follows {
        #[arg(long)]
        user: String,
    },
    /// Build a user's timeline and print it.
    Timeline {
        #[arg(long)]
        user: String,
    },
    Status {
        #[arg(long)]
        instance: String,
    },
    Stats,
    /// Write a snapshot and compact the journal.
    Snapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let timeout = Duration::from_millis(cli.timeout_ms);

    let policy = match &cli.policy {
        Some(path) => RuntimeOperationalPolicy::from_json_file(path)
            .await
            .with_context(|| format!("load policy {}", path.display()))?,
        None => RuntimeOperationalPolicy::default(),
    };
    let runtime = chirper::register(Runtime::builder().policy(policy))
        .open(cli.data_dir.clone())
        .await
        .with_context(|| format!("open runtime in {}", cli.data_dir.display()))?;
    let client = ChirperClient::new(runtime.clone());

    let outcome = run(&client, cli.command, timeout).await;
    runtime
        .wait_idle(timeout)
        .await
        .context("wait for queued work")?;
    runtime.shutdown(timeout).await.context("shutdown")?;
    outcome
}

async fn run(client: &ChirperClient, command: Command, timeout: Duration) -> Result<()> {
    let runtime = client.runtime();
    match command {
        Command::Post { user, content, at } => {
            let chirp = match at {
                Some(at) => client.post_chirp_at(&user, content, parse_timestamp(&at)?).await?,
                None => client.post_chirp(&user, content).await?,
            };
            print_json(&chirp)
        }
        Command::Delete { user, at } => {
            let message_id = client.delete_chirp(&user, parse_timestamp(&at)?).await?;
            println!("accepted {}", message_id);
            Ok(())
        }
        Command::Follow { user, target } => {
            let message_id = client.follow(&user, &target).await?;
            println!("accepted {}", message_id);
            Ok(())
        }
        Command::Unfollow { user, target } => {
            let message_id = client.unfollow(&user, &target).await?;
            println!("accepted {}", message_id);
            Ok(())
        }
        Command::Chirps { user } => {
            runtime.wait_idle(timeout).await?;
            let chirps = client
                .chirps(&user)
                .await?
                .ok_or_else(|| anyhow!("no chirps for user '{}'", user))?;
            print_json(&chirps)
        }
        Command::Follows { user } => {
            runtime.wait_idle(timeout).await?;
            let follows = client
                .follows(&user)
                .await?
                .ok_or_else(|| anyhow!("user '{}' follows nobody", user))?;
            print_json(&follows)
        }
        Command::Timeline { user } => {
            runtime.wait_idle(timeout).await?;
            let timeline = client.timeline(&user, timeout).await?;
            print_json(&timeline)
        }
        Command::Status { instance } => {
            let report = runtime
                .get_orchestration_status(&instance)
                .await?
                .ok_or_else(|| anyhow!("orchestration '{}' not found", instance))?;
            print_json(&report)
        }
        Command::Stats => {
            let stats = runtime.stats().await;
            println!("entities:                 {}", stats.entities);
            println!("pending messages:         {}", stats.pending_messages);
            println!("busy mailboxes:           {}", stats.busy_mailboxes);
            println!("running orchestrations:   {}", stats.running_orchestrations);
            println!("completed orchestrations: {}", stats.completed_orchestrations);
            println!("failed orchestrations:    {}", stats.failed_orchestrations);
            println!("tracked message ids:      {}", stats.delivered_message_ids);
            println!("last journal seq:         {}", stats.last_seq);
            println!("entity kinds:             {}", stats.registered_entity_kinds.join(", "));
            Ok(())
        }
        Command::Snapshot => {
            runtime.force_snapshot().await?;
            println!("snapshot written");
            Ok(())
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid RFC 3339 timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("durable_entities=info,chirper=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
