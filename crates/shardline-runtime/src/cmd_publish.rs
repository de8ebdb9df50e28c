//! `shardline create|publish|close`: write side of a file-backed log.

use std::path::Path;

use shardline_core::{Header, InterceptorChain, Key, Message, TextMessage};
use shardline_eventsource::{FileMessageSender, MessageSender};
use shardline_reader::FileChannel;

use crate::cli::{CloseOpts, CreateOpts, PublishOpts};

pub async fn cmd_create(data_dir: &Path, opts: &CreateOpts) -> anyhow::Result<()> {
    FileChannel::new(data_dir)
        .create_stream(&opts.stream, opts.partitions)
        .await?;
    println!("stream {} ready with {} partitions", opts.stream, opts.partitions.max(1));
    Ok(())
}

pub async fn cmd_publish(data_dir: &Path, opts: PublishOpts) -> anyhow::Result<()> {
    let sender = FileMessageSender::new(
        FileChannel::new(data_dir),
        opts.stream.as_str(),
        InterceptorChain::new(),
    );
    match sender.send(build_message(opts)).await? {
        Some(position) => println!("{position}"),
        None => println!("dropped"),
    }
    Ok(())
}

pub async fn cmd_close(data_dir: &Path, opts: &CloseOpts) -> anyhow::Result<()> {
    FileChannel::new(data_dir)
        .close_partition(&opts.stream, &opts.partition)
        .await?;
    tracing::info!(stream = %opts.stream, partition = %opts.partition, "partition closed");
    Ok(())
}

fn build_message(opts: PublishOpts) -> TextMessage {
    let key = match opts.partition_key {
        Some(partition_key) => Key::compound(partition_key, opts.key),
        None => Key::of(opts.key),
    };
    let header = opts
        .attributes
        .into_iter()
        .fold(Header::default(), |header, (name, value)| {
            header.with_attribute(name, value)
        });
    Message::new(key, header, opts.payload)
}
