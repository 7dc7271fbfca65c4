//! lpfeed - liquidity position feed CLI
//!
//! Runs webhook payloads through the ingestion pipeline and inspects the
//! local stores.
//!
//! ```bash
//! # Ingest JSON lines from a file (or stdin when --input is omitted)
//! lpfeed --data-dir ./data ingest --input deliveries.jsonl
//!
//! # Register a wallet so its position events are tracked
//! lpfeed wallet add 42 9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin
//!
//! # Record counts per store
//! lpfeed status
//! ```

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use lpfeed_core::config::{Config, LogFormat};
use lpfeed_core::events::PositionEventHandler;
use lpfeed_core::logging::init_logging;
use lpfeed_core::pipeline::Pipeline;
use lpfeed_core::stores::{StoreSet, WalletKey};

const DEFAULT_CONFIG: &str = "lpfeed.toml";

#[derive(Parser, Debug)]
#[command(name = "lpfeed")]
#[command(about = "Ingest liquidity position webhooks into crash-safe local stores")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./lpfeed.toml when present)
    #[arg(long, global = true, env = "LPFEED_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the store files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level filter (RUST_LOG wins when set)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format: pretty or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run JSON-lines webhook payloads through the pipeline
    Ingest {
        /// Input file; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Manage registered wallets
    Wallet {
        #[command(subcommand)]
        action: WalletCommand,
    },

    /// Query tracked positions
    Positions {
        #[command(subcommand)]
        query: PositionsCommand,
    },

    /// Print record counts per store as JSON
    Status,
}

#[derive(Subcommand, Debug)]
enum WalletCommand {
    Add {
        user: String,
        wallet: String,
        #[arg(long)]
        anonymous: bool,
    },
    Remove {
        user: String,
        wallet: String,
    },
    List {
        user: String,
    },
}

#[derive(Subcommand, Debug)]
enum PositionsCommand {
    /// Pools with open positions in a token
    Pools { token: String },
    /// Owners and counts in one pool of a token
    Users { token: String, pool: String },
}

fn load_config(cli: &Cli) -> lpfeed_core::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => Config::load_from(Path::new(DEFAULT_CONFIG))?,
        None => Config::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir.clone_from(dir);
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).map_err(|err| {
        if let Some(remediation) = err.remediation() {
            eprint!("{}", remediation.render_plain());
        }
        anyhow::Error::new(err)
    })?;
    init_logging(&config.logging).context("failed to initialize logging")?;

    let stores = StoreSet::open(&config.storage)?;
    stores
        .initialize()
        .await
        .with_context(|| format!("failed to load stores from {}", config.storage.data_dir.display()))?;

    let outcome = run(cli.command, &config, &stores).await;
    let closed = stores.close().await.context("failed to save stores");
    let output = outcome?;
    closed?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(command: Command, config: &Config, stores: &StoreSet) -> Result<Value> {
    match command {
        Command::Ingest { input } => {
            let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &input {
                Some(path) => Box::new(BufReader::new(
                    tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("failed to open {}", path.display()))?,
                )),
                None => Box::new(BufReader::new(tokio::io::stdin())),
            };
            ingest(reader, config, stores).await
        }
        Command::Wallet { action } => wallet(action, stores).await,
        Command::Positions { query } => Ok(match query {
            PositionsCommand::Pools { token } => json!({
                "token": token,
                "unique_owners": stores.positions.unique_owners(&token).await,
                "pools": stores.positions.token_pools(&token).await,
            }),
            PositionsCommand::Users { token, pool } => {
                let users: Vec<Value> = stores
                    .positions
                    .pool_users(&token, &pool)
                    .await
                    .into_iter()
                    .map(|(owner, count)| json!({"owner": owner, "positions": count}))
                    .collect();
                json!({"token": token, "pool": pool, "users": users})
            }
        }),
        Command::Status => Ok(serde_json::to_value(stores.counts().await)?),
    }
}

async fn ingest(
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    config: &Config,
    stores: &StoreSet,
) -> Result<Value> {
    let handler = PositionEventHandler::new(
        stores.positions.clone(),
        stores.wallets.clone(),
        stores.token_pairs.clone(),
    );
    let pipeline = Pipeline::new(config.pipeline_config(), handler);
    pipeline.start();

    let mut lines = reader.lines();
    let mut invalid = 0u64;
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(payload) => {
                if !pipeline.submit(payload).await.is_accepted() {
                    tracing::warn!(line = line_no, "payload rejected");
                }
            }
            Err(err) => {
                invalid += 1;
                tracing::warn!(line = line_no, error = %err, "skipping invalid JSON line");
            }
        }
    }

    pipeline.stop().await;
    Ok(json!({
        "pipeline": pipeline.status(),
        "invalid_lines": invalid,
        "stores": stores.counts().await,
    }))
}

async fn wallet(action: WalletCommand, stores: &StoreSet) -> Result<Value> {
    Ok(match action {
        WalletCommand::Add {
            user,
            wallet,
            anonymous,
        } => {
            let added = stores
                .wallets
                .add(&WalletKey::new(&user, &wallet)?, anonymous)
                .await?;
            json!({"user": user, "wallet": wallet, "added": added})
        }
        WalletCommand::Remove { user, wallet } => {
            let removed = stores.wallets.remove(&WalletKey::new(&user, &wallet)?).await?;
            json!({"user": user, "wallet": wallet, "removed": removed})
        }
        WalletCommand::List { user } => json!({
            "user": user,
            "wallets": stores.wallets.user_wallets(&user).await,
        }),
    })
}
