// parley — relay server and chat client
//
// `parley relay` runs the rendezvous relay. `parley chat` joins it under an
// address and negotiates direct channels with other parties. The remaining
// subcommands work offline against the local commitment ledger.

mod chat;
mod config;
mod ledger;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use parley_core::{anchor, MessageFields, Verification};
use std::net::SocketAddr;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley — relay-negotiated direct messaging", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Relay {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Join a relay and chat
    Chat {
        #[arg(short, long)]
        address: String,
        /// Relay URL, overrides the configured one
        #[arg(short, long)]
        relay: Option<String>,
    },
    /// Compute a message fingerprint
    Fingerprint {
        #[command(flatten)]
        fields: FieldArgs,
    },
    /// Check a message against its hash and the local ledger
    Verify {
        #[command(flatten)]
        fields: FieldArgs,
        #[arg(long)]
        hash: String,
    },
    /// List ledger commitments involving an address
    Ledger { address: String },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct FieldArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
    #[arg(long)]
    content: String,
    /// Unix timestamp in milliseconds
    #[arg(long)]
    timestamp: u64,
}

impl From<FieldArgs> for MessageFields {
    fn from(args: FieldArgs) -> Self {
        MessageFields {
            id: args.id,
            from: args.from,
            to: args.to,
            content: args.content,
            timestamp: args.timestamp,
        }
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The relay logs its traffic; the chat prompt stays quiet unless asked.
    let default_filter = match cli.command {
        Commands::Relay { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Relay { port } => cmd_relay(port).await,
        Commands::Chat { address, relay } => cmd_chat(address, relay).await,
        Commands::Fingerprint { fields } => cmd_fingerprint(fields.into()),
        Commands::Verify { fields, hash } => cmd_verify(fields.into(), hash).await,
        Commands::Ledger { address } => cmd_ledger(address),
        Commands::Config { action } => cmd_config(action),
    }
}

async fn cmd_relay(port: Option<u16>) -> Result<()> {
    let config = config::Config::load()?;
    let port = port.unwrap_or(config.relay.port);

    let addr: SocketAddr = format!("{}:{}", config.relay.bind, port)
        .parse()
        .with_context(|| format!("Invalid relay bind address {}", config.relay.bind))?;

    println!("{}", "Parley Relay".bold());
    println!("  {} ws://{}", "WebSocket:".bright_cyan(), addr);
    println!("  {} http://{}/api/online", "Online:   ".bright_cyan(), addr);
    println!();

    server::run(server::RelayServerConfig {
        addr,
        outbound_buffer: config.relay.outbound_buffer,
    })
    .await;
    Ok(())
}

async fn cmd_chat(address: String, relay: Option<String>) -> Result<()> {
    let address = address.trim().to_string();
    if address.is_empty() {
        anyhow::bail!("Address must not be empty");
    }

    let config = config::Config::load()?;
    chat::run(&config, address, relay).await
}

fn cmd_fingerprint(fields: MessageFields) -> Result<()> {
    println!("{}", fields.fingerprint());
    Ok(())
}

async fn cmd_verify(fields: MessageFields, hash: String) -> Result<()> {
    let config = config::Config::load()?;
    let ledger = ledger::LedgerAnchor::open(&config.ledger_file()?)?;

    let outcome = anchor::verify(&ledger, &hash, &fields)
        .await
        .context("Ledger lookup failed")?;

    let mark = match outcome {
        Verification::Anchored => "✓".green(),
        Verification::Unanchored => "•".yellow(),
        Verification::Mismatch => "✗".red(),
    };
    println!("{} Message {}: {}", mark, fields.id.bright_cyan(), outcome);

    if !outcome.is_verified() {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_ledger(address: String) -> Result<()> {
    let config = config::Config::load()?;
    let path = config.ledger_file()?;
    let ledger = ledger::CommitmentLedger::load(&path)?;
    let records = ledger.for_address(&address);

    if records.is_empty() {
        println!("{}", "No commitments found.".dimmed());
        return Ok(());
    }

    println!("{} ({} commitments)", "Ledger".bold(), records.len());
    println!();
    for record in records {
        let direction = if record.from == address {
            format!("→ {}", record.to).bright_green()
        } else {
            format!("← {}", record.from).bright_blue()
        };
        println!("{} [{}]", direction, format_timestamp(record.timestamp).dimmed());
        println!("   {} {}", record.message_id, record.hash.dimmed());
    }
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<28} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn format_timestamp(millis: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp_millis(millis as i64).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}
