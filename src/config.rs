use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::services::transfer_service::{
    DEFAULT_STATUS_INTERVAL, OffsetPolicy, TransferSettings,
};

pub const DEFAULT_MASTER_PORT: u16 = 50051;
pub const DEFAULT_STORAGE_PORT: u16 = 50052;
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Centralized application configuration, one variant per role.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub enum AppConfig {
    Master(MasterConfig),
    Storage(StorageConfig),
    Standalone(StandaloneConfig),
    Upload(UploadConfig),
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    /// Storage node address handed out with every registration.
    pub storage_node_address: String,
    pub shared_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    /// Where progress reports go. Reports are off when unset.
    pub master_url: Option<String>,
    pub shared_secret: Option<String>,
    pub status_interval_bytes: u64,
    pub strict_offsets: bool,
    pub sync_each_chunk: bool,
    pub max_chunk_bytes: usize,
}

/// Master and storage node in one process, sharing the record store.
#[derive(Debug, Clone)]
pub struct StandaloneConfig {
    pub master: MasterConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub file: PathBuf,
    pub master_url: String,
    pub chunk_size: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable upload master and storage node")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the metadata master
    Master(MasterArgs),
    /// Run a storage node
    Storage(StorageArgs),
    /// Run master and storage node in one process
    Standalone(StandaloneArgs),
    /// Upload a file through a running master
    Upload(UploadArgs),
}

#[derive(Args, Debug, Default)]
pub struct MasterArgs {
    /// Host to bind to (overrides STOWAGE_MASTER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides STOWAGE_MASTER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage node address given to clients (overrides STOWAGE_STORAGE_NODE_ADDRESS)
    #[arg(long)]
    pub storage_node_address: Option<String>,

    /// Secret for signing upload tokens (overrides STOWAGE_SHARED_SECRET)
    #[arg(long)]
    pub shared_secret: Option<String>,
}

/// Settings of the transfer path, shared by `storage` and `standalone`.
#[derive(Args, Debug, Default)]
pub struct TransferArgs {
    /// Directory where uploads are stored (overrides STOWAGE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Secret for verifying upload tokens (overrides STOWAGE_SHARED_SECRET)
    #[arg(long)]
    pub shared_secret: Option<String>,

    /// Bytes between progress messages, 0 to disable (overrides STOWAGE_STATUS_INTERVAL_BYTES)
    #[arg(long)]
    pub status_interval_bytes: Option<u64>,

    /// Reject chunks whose offset leaves a gap (or STOWAGE_STRICT_OFFSETS=true)
    #[arg(long)]
    pub strict_offsets: bool,

    /// fsync after every chunk (or STOWAGE_SYNC_EACH_CHUNK=true)
    #[arg(long)]
    pub sync_each_chunk: bool,

    /// Largest accepted chunk payload (overrides STOWAGE_MAX_CHUNK_BYTES)
    #[arg(long)]
    pub max_chunk_bytes: Option<usize>,
}

#[derive(Args, Debug, Default)]
pub struct StorageArgs {
    /// Host to bind to (overrides STOWAGE_STORAGE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides STOWAGE_STORAGE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Master to report progress to (overrides STOWAGE_MASTER_URL)
    #[arg(long)]
    pub master_url: Option<String>,

    #[command(flatten)]
    pub transfer: TransferArgs,
}

#[derive(Args, Debug, Default)]
pub struct StandaloneArgs {
    /// Host both services bind to (overrides STOWAGE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Master port (overrides STOWAGE_MASTER_PORT)
    #[arg(long)]
    pub master_port: Option<u16>,

    /// Storage node port (overrides STOWAGE_STORAGE_PORT)
    #[arg(long)]
    pub storage_port: Option<u16>,

    /// Storage node address given to clients (overrides STOWAGE_STORAGE_NODE_ADDRESS)
    #[arg(long)]
    pub storage_node_address: Option<String>,

    #[command(flatten)]
    pub transfer: TransferArgs,
}

#[derive(Args, Debug, Default)]
pub struct UploadArgs {
    /// File to upload
    pub file: PathBuf,

    /// Master base URL (overrides STOWAGE_MASTER_URL)
    #[arg(long)]
    pub master_url: Option<String>,

    /// Bytes per chunk (overrides STOWAGE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Consecutive failed attempts before giving up (overrides STOWAGE_MAX_ATTEMPTS)
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Pause between attempts (overrides STOWAGE_RETRY_DELAY_MS)
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,
}

/// Environment lookup, swapped out in tests.
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

impl AppConfig {
    /// Parse CLI args once and fill the gaps from the process environment.
    pub fn from_env_and_args() -> Result<Self> {
        let cli = Cli::parse();
        Self::resolve(cli.command, &|name| env::var(name).ok())
    }

    /// Merge parsed arguments with `lookup`: flag, then env, then default.
    pub fn resolve(command: Command, lookup: Lookup<'_>) -> Result<Self> {
        let cfg = match command {
            Command::Master(args) => AppConfig::Master(MasterConfig {
                host: args
                    .host
                    .unwrap_or_else(|| env_or_str(lookup, "STOWAGE_MASTER_HOST", "0.0.0.0")),
                port: pick(args.port, lookup, "STOWAGE_MASTER_PORT", DEFAULT_MASTER_PORT)?,
                storage_node_address: args.storage_node_address.unwrap_or_else(|| {
                    env_or_str(
                        lookup,
                        "STOWAGE_STORAGE_NODE_ADDRESS",
                        &format!("localhost:{}", DEFAULT_STORAGE_PORT),
                    )
                }),
                shared_secret: args
                    .shared_secret
                    .or_else(|| non_empty(lookup, "STOWAGE_SHARED_SECRET")),
            }),
            Command::Storage(args) => AppConfig::Storage(StorageConfig::build(
                args.host
                    .unwrap_or_else(|| env_or_str(lookup, "STOWAGE_STORAGE_HOST", "0.0.0.0")),
                pick(args.port, lookup, "STOWAGE_STORAGE_PORT", DEFAULT_STORAGE_PORT)?,
                args.master_url
                    .or_else(|| non_empty(lookup, "STOWAGE_MASTER_URL")),
                args.transfer,
                lookup,
            )?),
            Command::Standalone(args) => {
                let host = args
                    .host
                    .unwrap_or_else(|| env_or_str(lookup, "STOWAGE_HOST", "0.0.0.0"));
                let master_port = pick(
                    args.master_port,
                    lookup,
                    "STOWAGE_MASTER_PORT",
                    DEFAULT_MASTER_PORT,
                )?;
                let storage_port = pick(
                    args.storage_port,
                    lookup,
                    "STOWAGE_STORAGE_PORT",
                    DEFAULT_STORAGE_PORT,
                )?;
                let storage =
                    StorageConfig::build(host.clone(), storage_port, None, args.transfer, lookup)?;
                let master = MasterConfig {
                    host,
                    port: master_port,
                    storage_node_address: args.storage_node_address.unwrap_or_else(|| {
                        env_or_str(
                            lookup,
                            "STOWAGE_STORAGE_NODE_ADDRESS",
                            &format!("localhost:{}", storage_port),
                        )
                    }),
                    shared_secret: storage.shared_secret.clone(),
                };
                if master_port == storage_port {
                    bail!("master and storage node cannot share port {}", master_port);
                }
                AppConfig::Standalone(StandaloneConfig { master, storage })
            }
            Command::Upload(args) => {
                let chunk_size = pick(args.chunk_size, lookup, "STOWAGE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
                if chunk_size == 0 {
                    bail!("chunk size must be positive");
                }
                let max_attempts = pick(args.max_attempts, lookup, "STOWAGE_MAX_ATTEMPTS", 5)?;
                if max_attempts == 0 {
                    bail!("max attempts must be positive");
                }
                AppConfig::Upload(UploadConfig {
                    file: args.file,
                    master_url: args.master_url.unwrap_or_else(|| {
                        env_or_str(lookup, "STOWAGE_MASTER_URL", "http://localhost:50051")
                    }),
                    chunk_size,
                    max_attempts,
                    retry_delay: Duration::from_millis(pick(
                        args.retry_delay_ms,
                        lookup,
                        "STOWAGE_RETRY_DELAY_MS",
                        2000,
                    )?),
                })
            }
        };
        Ok(cfg)
    }
}

impl StorageConfig {
    fn build(
        host: String,
        port: u16,
        master_url: Option<String>,
        args: TransferArgs,
        lookup: Lookup<'_>,
    ) -> Result<Self> {
        let max_chunk_bytes = pick(
            args.max_chunk_bytes,
            lookup,
            "STOWAGE_MAX_CHUNK_BYTES",
            DEFAULT_MAX_CHUNK_BYTES,
        )?;
        if max_chunk_bytes == 0 {
            bail!("max chunk bytes must be positive");
        }
        Ok(Self {
            host,
            port,
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_or_str(lookup, "STOWAGE_STORAGE_DIR", "./storage_data")),
            master_url,
            shared_secret: args
                .shared_secret
                .or_else(|| non_empty(lookup, "STOWAGE_SHARED_SECRET")),
            status_interval_bytes: pick(
                args.status_interval_bytes,
                lookup,
                "STOWAGE_STATUS_INTERVAL_BYTES",
                DEFAULT_STATUS_INTERVAL,
            )?,
            strict_offsets: args.strict_offsets || flag(lookup, "STOWAGE_STRICT_OFFSETS")?,
            sync_each_chunk: args.sync_each_chunk || flag(lookup, "STOWAGE_SYNC_EACH_CHUNK")?,
            max_chunk_bytes,
        })
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            status_interval: self.status_interval_bytes,
            offset_policy: if self.strict_offsets {
                OffsetPolicy::Strict
            } else {
                OffsetPolicy::Trust
            },
            sync_each_chunk: self.sync_each_chunk,
        }
    }

    /// WebSocket message limit: a base64 chunk payload plus its JSON envelope.
    pub fn max_message_bytes(&self) -> usize {
        self.max_chunk_bytes
            .saturating_add(2)
            .saturating_div(3)
            .saturating_mul(4)
            .saturating_add(1024)
    }
}

fn env_or_str(lookup: Lookup<'_>, name: &str, default: &str) -> String {
    lookup(name).unwrap_or_else(|| default.into())
}

fn non_empty(lookup: Lookup<'_>, name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.trim().is_empty())
}

fn pick<T>(arg: Option<T>, lookup: Lookup<'_>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = arg {
        return Ok(value);
    }
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}

fn flag(lookup: Lookup<'_>, name: &str) -> Result<bool> {
    match lookup(name).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => bail!("parsing {} value `{}`: expected true or false", name, other),
    }
}
