//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use shardline_reader::{OrchestratorConfig, ReaderConfig};

#[derive(Parser)]
#[command(name = "shardline", about = "Partitioned log consumption engine")]
pub struct Cli {
    /// Root directory of the file-backed log
    #[arg(long, short = 'd', global = true, env = "SHARDLINE_DATA_DIR", default_value = "shardline-data")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a stream with a number of empty partitions
    Create(CreateOpts),
    /// Append one message to a stream
    Publish(PublishOpts),
    /// Close a partition: no more appends, readers stop at its end
    Close(CloseOpts),
    /// Replay the latest snapshot, then print live messages as JSON lines
    Consume(ConsumeOpts),
    /// Write a compacted snapshot of a stream
    Compact(CompactOpts),
}

#[derive(clap::Args)]
pub struct CreateOpts {
    #[arg(long)]
    pub stream: String,

    #[arg(long, default_value = "4")]
    pub partitions: usize,
}

#[derive(clap::Args)]
pub struct PublishOpts {
    #[arg(long)]
    pub stream: String,

    /// Message key; also the compaction key
    #[arg(long)]
    pub key: String,

    /// Route by this key instead of `--key`
    #[arg(long)]
    pub partition_key: Option<String>,

    /// Header attribute as NAME=VALUE (repeatable)
    #[arg(long = "attr", value_parser = parse_attribute)]
    pub attributes: Vec<(String, String)>,

    /// Payload text; omitted means a tombstone
    pub payload: Option<String>,
}

#[derive(clap::Args)]
pub struct CloseOpts {
    #[arg(long)]
    pub stream: String,

    #[arg(long)]
    pub partition: String,
}

#[derive(clap::Args)]
pub struct ConsumeOpts {
    #[arg(long)]
    pub stream: String,

    /// Keep tailing until interrupted instead of stopping at the end of
    /// every partition
    #[arg(long)]
    pub follow: bool,

    /// Snapshot directory replayed before the live log
    #[arg(long, env = "SHARDLINE_SNAPSHOT_DIR")]
    pub snapshot_dir: Option<PathBuf>,

    /// Read the start position from this file and write the final one back
    #[arg(long)]
    pub position_file: Option<PathBuf>,

    #[command(flatten)]
    pub reader: ReaderOpts,
}

#[derive(clap::Args)]
pub struct CompactOpts {
    #[arg(long)]
    pub stream: String,

    #[arg(long, env = "SHARDLINE_SNAPSHOT_DIR")]
    pub snapshot_dir: PathBuf,

    /// Keep deleted keys as tombstones in the snapshot
    #[arg(long)]
    pub keep_tombstones: bool,

    #[command(flatten)]
    pub reader: ReaderOpts,
}

#[derive(clap::Args)]
pub struct ReaderOpts {
    /// Maximum records per fetch
    #[arg(long, env = "SHARDLINE_BATCH_LIMIT", default_value = "1000")]
    pub batch_limit: usize,

    /// Pause after an empty batch in milliseconds
    #[arg(long, env = "SHARDLINE_EMPTY_BATCH_BACKOFF_MS", default_value = "500")]
    pub empty_batch_backoff_ms: u64,

    /// Grace period for readers after a partition failure in milliseconds
    #[arg(long, env = "SHARDLINE_SHUTDOWN_GRACE_MS", default_value = "30000")]
    pub shutdown_grace_ms: u64,
}

impl ReaderOpts {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            reader: ReaderConfig {
                batch_limit: self.batch_limit,
                empty_batch_backoff_ms: self.empty_batch_backoff_ms,
            },
            shutdown_grace_ms: self.shutdown_grace_ms,
        }
    }
}

fn parse_attribute(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {s:?}"))?;
    if name.is_empty() {
        return Err(format!("empty attribute name in {s:?}"));
    }
    Ok((name.to_owned(), value.to_owned()))
}
