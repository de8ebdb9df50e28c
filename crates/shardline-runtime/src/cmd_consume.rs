//! `shardline consume`: replay the latest snapshot, then tail the live log.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use shardline_core::{StopCondition, StreamPosition, TextMessage};
use shardline_eventsource::{EventSource, EventSourceBuilder, MessageConsumer};
use shardline_reader::{FileChannel, PartitionSource, WorkerPool};
use shardline_store::{CompactingMessageStore, MessageStore, SnapshotMessageStore};

use crate::cli::ConsumeOpts;

pub async fn cmd_consume(data_dir: &Path, opts: ConsumeOpts) -> anyhow::Result<()> {
    let source = Arc::new(build_event_source(data_dir, &opts).await?);

    let stop_condition = if opts.follow {
        let stopper = Arc::clone(&source);
        tokio::spawn(async move {
            shutdown_signal().await;
            stopper.stop();
        });
        StopCondition::shutdown()
    } else {
        StopCondition::end_of_partition()
    };

    let position = source.consume_until(stop_condition).await?;
    tracing::info!(
        stream = %opts.stream,
        partitions = position.len(),
        "consume finished"
    );
    if let Some(path) = &opts.position_file {
        write_position(path, &position)?;
    }
    Ok(())
}

async fn build_event_source(data_dir: &Path, opts: &ConsumeOpts) -> anyhow::Result<EventSource> {
    let channel = FileChannel::new(data_dir);
    let pool = WorkerPool::current("consume")?;
    let mut builder = EventSourceBuilder::new(
        format!("{}-consumer", opts.stream),
        opts.stream.as_str(),
        Arc::new(channel) as Arc<dyn PartitionSource>,
        pool.clone(),
    )
    .config(opts.reader.orchestrator_config())
    .consumer(Arc::new(JsonLinePrinter));

    if let Some(path) = &opts.position_file {
        if path.exists() {
            builder = builder.resume_from(read_position(path)?);
        }
    }
    if let Some(dir) = opts.snapshot_dir.clone() {
        let stream = opts.stream.clone();
        let store = pool
            .spawn_blocking(move || {
                SnapshotMessageStore::load_latest(&dir, &stream, CompactingMessageStore::default())
            })
            .await??;
        builder = builder.store(Arc::new(store) as Arc<dyn MessageStore>);
    }
    Ok(builder.build())
}

/// Writes every message to stdout as one JSON line.
struct JsonLinePrinter;

impl MessageConsumer for JsonLinePrinter {
    fn accept(&self, message: &TextMessage) {
        let line = match serde_json::to_string(message) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(key = %message.key, error = %e, "failed to encode message");
                return;
            }
        };
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{line}") {
            tracing::warn!(error = %e, "failed to write message to stdout");
        }
    }
}

fn read_position(path: &Path) -> anyhow::Result<StreamPosition> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read position file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid position file {}", path.display()))
}

fn write_position(path: &Path, position: &StreamPosition) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(position)?;
    fs::write(path, content)
        .with_context(|| format!("failed to write position file {}", path.display()))?;
    tracing::info!(path = %path.display(), "position saved");
    Ok(())
}

/// Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received ctrl-c, stopping"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, stopping"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
                tracing::info!("received ctrl-c, stopping");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received ctrl-c, stopping");
    }
}
