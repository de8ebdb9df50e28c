//! `shardline compact`: write a compacted snapshot of a stream.

use std::path::Path;
use std::sync::Arc;

use shardline_eventsource::CompactionService;
use shardline_reader::{FileChannel, PartitionSource, WorkerPool};

use crate::cli::CompactOpts;

pub async fn cmd_compact(data_dir: &Path, opts: CompactOpts) -> anyhow::Result<()> {
    let mut service = CompactionService::new(
        Arc::new(FileChannel::new(data_dir)) as Arc<dyn PartitionSource>,
        WorkerPool::current("compact")?,
        opts.reader.orchestrator_config(),
        opts.snapshot_dir,
    );
    if opts.keep_tombstones {
        service = service.keep_tombstones();
    }
    let report = service.compact(&opts.stream).await?;
    println!(
        "{} ({} messages, {} old snapshots removed)",
        report.path.display(),
        report.messages,
        report.pruned
    );
    Ok(())
}
