//! rippledb-cli - Command-line interface for rippledb
//!
//! One-shot commands; results are printed as JSON.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use rippledb_client::{Client, ConnectionConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rippledb-cli")]
#[command(about = "Command-line interface for the rippledb tuple database")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:3301", env = "RIPPLEDB_SERVER")]
    server: String,

    /// User to authenticate as
    #[arg(short, long, env = "RIPPLEDB_USER")]
    user: Option<String>,

    /// Authentication token
    #[arg(short = 't', long, env = "RIPPLEDB_TOKEN")]
    token: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ping the server
    Ping,

    /// Show instance status (vclock, spaces, replication sessions)
    Status,

    /// Select tuples by primary key
    Select {
        /// Space id
        space: u32,

        /// Key as a JSON array; omit to list the whole space
        key: Option<String>,

        /// Maximum tuples to return
        #[arg(short, long)]
        limit: Option<u32>,

        /// Tuples to skip
        #[arg(short, long, default_value = "0")]
        offset: u32,
    },

    /// Insert a tuple (JSON array, or @file.json)
    Insert { space: u32, tuple: String },

    /// Insert or replace a tuple
    Replace { space: u32, tuple: String },

    /// Insert a tuple or update the existing one
    Upsert {
        space: u32,
        tuple: String,

        /// Operations as a JSON array of [op, field, arg], e.g. [["+", 1, 5]]
        ops: String,
    },

    /// Delete a tuple by primary key
    Delete { space: u32, key: String },

    /// Wait until the server's vclock reaches an LSN for a replica id
    WaitLsn {
        replica_id: u32,
        lsn: u64,

        /// Seconds to wait
        #[arg(long, default_value = "10")]
        wait: u64,
    },

    /// Generate SHA-256 hash of a token for config files
    HashToken {
        /// The token to hash
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Handled locally, no server connection needed
    if let Commands::HashToken { token } = &cli.command {
        println!("{}", commands::hash_token(token));
        return Ok(());
    }

    let mut config = ConnectionConfig::new(cli.server.clone())
        .with_request_timeout(Duration::from_secs(cli.timeout));
    match (&cli.user, &cli.token) {
        (Some(user), Some(token)) => config = config.with_credentials(user, token),
        (Some(_), None) | (None, Some(_)) => {
            eprintln!("{}: --user and --token must be used together", "Error".red());
            std::process::exit(1);
        }
        (None, None) => {}
    }

    let client = Client::new(config);
    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    match commands::execute(&client, cli.command).await {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    client.close().await?;
    Ok(())
}
